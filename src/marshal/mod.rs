//! Deployment-aware marshalling of user code.
//!
//! Queries carry executable user logic (filters, callbacks, reducers, transformers) and
//! argument values. None of it can be written with the primitive field codec: each object is
//! turned into an opaque payload by the [`Marshaller`] right before a message is sent, and
//! turned back into a handle on the receiving node the first time it is needed.
//!
//! # Payload Format
//!
//! A user object travels as a bincode-encoded [`CodePayload`]: the name of its class plus the
//! class-specific body produced by [`UserCode::encode`]. Arguments travel as one combined
//! bincode-encoded array of [`QueryArg`] values.
//!
//! # Deployment Modes
//!
//! - [`DeploymentMode::Local`]: the payload alone is sent. The receiver must already know
//!   every class it is asked to rebuild.
//! - [`DeploymentMode::Enabled`]: a [`DeploymentInfo`] naming the sending node, its loader
//!   version and every class marshalled into the message is attached to the envelope. A
//!   receiver missing one of those classes may fetch it from the sender through a
//!   [`ClassSource`] before decoding the payload.
//!
//! Marshalling failures are reported as [`MarshalError`]. They fail the affected query but,
//! unlike codec errors, leave the connection usable.
mod resolver;
mod slot;

use std::{any::Any, fmt, sync::Arc};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
};
use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::message::Envelope;

pub use resolver::{BincodeClass, ClassDef, ClassRegistry, ClassResolver, ClassSource, PeerClassResolver};
pub use slot::{Deferred, SameHandle};

/// Identity of a grid node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Encode, Decode, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{:016x}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("failed to encode object: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode object: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("class '{class}' not found (origin: {origin:?})")]
    ClassNotFound {
        class: String,
        origin: Option<NodeId>,
    },

    #[error("class '{class}' provides {actual:?}, expected {expected:?}")]
    KindMismatch {
        class: String,
        expected: CodeKind,
        actual: CodeKind,
    },

    #[error("failed to fetch class '{class}' from {origin}: {reason}")]
    Fetch {
        class: String,
        origin: NodeId,
        reason: String,
    },

    #[error("message was marshalled for sending and cannot be unmarshalled")]
    Outbound,
}

/// Role a piece of user code plays in a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeKind {
    Predicate,
    Callback,
    Reducer,
    FieldsReducer,
    Transformer,
}

/// User-supplied logic that can cross the wire.
pub trait UserCode: Any + Send + Sync + fmt::Debug {
    /// Name under which receiving nodes resolve the class.
    fn class_name(&self) -> &str;

    /// Class-specific body; [`encode`] suits any bincode type.
    fn encode(&self) -> Result<Vec<u8>, MarshalError>;

    fn as_any(&self) -> &dyn Any;
}

impl dyn UserCode {
    pub fn downcast_ref<T: UserCode>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

/// Opaque query argument.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum QueryArg {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Wire form of a single user object.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CodePayload {
    pub class_name: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    #[default]
    Local,
    Enabled,
}

/// Class metadata attached to a message in deployment-enabled mode.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DeploymentInfo {
    pub origin: NodeId,
    pub loader_version: u64,
    pub classes: Vec<String>,
}

impl DeploymentInfo {
    pub fn new(origin: NodeId, loader_version: u64) -> Self {
        Self {
            origin,
            loader_version,
            classes: Vec::new(),
        }
    }

    pub fn record(&mut self, class: &str) {
        if !self.provides(class) {
            self.classes.push(class.to_owned());
        }
    }

    pub fn provides(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    /// Decodes the deployment metadata attached to `envelope`, if any.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, MarshalError> {
        envelope.deployment().map(decode).transpose()
    }
}

fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Encodes a value with the cluster-wide bincode configuration.
pub fn encode<T: Encode + ?Sized>(value: &T) -> Result<Vec<u8>, MarshalError> {
    Ok(bincode::encode_to_vec(value, wire_config())?)
}

/// Decodes a value written by [`encode`].
pub fn decode<T: Decode<()>>(bytes: &[u8]) -> Result<T, MarshalError> {
    let (value, _) = bincode::decode_from_slice(bytes, wire_config())?;
    Ok(value)
}

/// Converts user objects to payloads and back for one node.
#[derive(Debug, Clone)]
pub struct Marshaller {
    mode: DeploymentMode,
    node: NodeId,
    loader_version: u64,
}

impl Marshaller {
    pub fn new(mode: DeploymentMode, node: NodeId, loader_version: u64) -> Self {
        Self {
            mode,
            node,
            loader_version,
        }
    }

    pub fn local(node: NodeId) -> Self {
        Self::new(DeploymentMode::Local, node, 0)
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Marshals `code`, recording its class in `deployment` when deployment is enabled.
    ///
    /// Nothing is recorded when encoding fails.
    pub fn marshal_code(
        &self,
        code: &dyn UserCode,
        deployment: &mut Option<DeploymentInfo>,
    ) -> Result<Vec<u8>, MarshalError> {
        let payload = encode(&CodePayload {
            class_name: code.class_name().to_owned(),
            body: code.encode()?,
        })?;

        if self.mode == DeploymentMode::Enabled {
            deployment
                .get_or_insert_with(|| DeploymentInfo::new(self.node, self.loader_version))
                .record(code.class_name());
        }
        Ok(payload)
    }

    pub fn unmarshal_code(
        &self,
        payload: &[u8],
        expected: CodeKind,
        resolver: &dyn ClassResolver,
        deployment: Option<&DeploymentInfo>,
    ) -> Result<Arc<dyn UserCode>, MarshalError> {
        let CodePayload { class_name, body } = decode(payload)?;
        let class = resolver.resolve(&class_name, deployment)?;

        if class.kind() != expected {
            return Err(MarshalError::KindMismatch {
                class: class_name,
                expected,
                actual: class.kind(),
            });
        }

        debug!("rebuilding {class_name} ({} bytes)", body.len());
        class.instantiate(&body)
    }

    pub fn marshal_args(&self, args: &[QueryArg]) -> Result<Vec<u8>, MarshalError> {
        encode(args)
    }

    pub fn unmarshal_args(&self, payload: &[u8]) -> Result<Vec<QueryArg>, MarshalError> {
        decode(payload)
    }
}

/// Everything needed to rebuild the deferred parts of one received message.
pub struct UnmarshalContext<'a> {
    marshaller: &'a Marshaller,
    resolver: &'a dyn ClassResolver,
    deployment: Option<DeploymentInfo>,
}

impl<'a> UnmarshalContext<'a> {
    pub fn new(
        marshaller: &'a Marshaller,
        resolver: &'a dyn ClassResolver,
        envelope: &Envelope,
    ) -> Result<Self, MarshalError> {
        Ok(Self {
            marshaller,
            resolver,
            deployment: DeploymentInfo::from_envelope(envelope)?,
        })
    }

    pub fn deployment(&self) -> Option<&DeploymentInfo> {
        self.deployment.as_ref()
    }

    pub fn unmarshal_code(
        &self,
        payload: &[u8],
        expected: CodeKind,
    ) -> Result<Arc<dyn UserCode>, MarshalError> {
        self.marshaller
            .unmarshal_code(payload, expected, self.resolver, self.deployment.as_ref())
    }

    pub fn unmarshal_args(&self, payload: &[u8]) -> Result<Vec<QueryArg>, MarshalError> {
        self.marshaller.unmarshal_args(payload)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! User code fixtures shared by tests across the crate.
    use std::any::Any;

    use bincode::{Decode, Encode};

    use super::{MarshalError, UserCode, encode};

    pub const MIN_AGE_CLASS: &str = "people.MinAge";
    pub const SUM_CLASS: &str = "people.SumAges";

    #[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
    pub struct MinAge(pub u32);

    impl UserCode for MinAge {
        fn class_name(&self) -> &str {
            MIN_AGE_CLASS
        }

        fn encode(&self) -> Result<Vec<u8>, MarshalError> {
            encode(self)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
    pub struct SumAges;

    impl UserCode for SumAges {
        fn class_name(&self) -> &str {
            SUM_CLASS
        }

        fn encode(&self) -> Result<Vec<u8>, MarshalError> {
            encode(self)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::*, *};

    fn registry() -> ClassRegistry {
        let registry = ClassRegistry::new();
        registry.register(BincodeClass::<MinAge>::new(MIN_AGE_CLASS, CodeKind::Predicate));
        registry.register(BincodeClass::<SumAges>::new(SUM_CLASS, CodeKind::Reducer));
        registry
    }

    #[test]
    fn local_mode_attaches_no_deployment() {
        let marshaller = Marshaller::local(NodeId(1));
        let mut deployment = None;

        let payload = marshaller.marshal_code(&MinAge(30), &mut deployment).unwrap();
        assert!(deployment.is_none());

        let code = marshaller
            .unmarshal_code(&payload, CodeKind::Predicate, &registry(), None)
            .unwrap();
        assert_eq!(code.downcast_ref::<MinAge>(), Some(&MinAge(30)));
    }

    #[test]
    fn enabled_mode_records_each_class_once() {
        let marshaller = Marshaller::new(DeploymentMode::Enabled, NodeId(7), 3);
        let mut deployment = None;

        marshaller.marshal_code(&MinAge(1), &mut deployment).unwrap();
        marshaller.marshal_code(&MinAge(2), &mut deployment).unwrap();
        marshaller.marshal_code(&SumAges, &mut deployment).unwrap();

        let info = deployment.unwrap();
        assert_eq!(info.origin, NodeId(7));
        assert_eq!(info.loader_version, 3);
        assert_eq!(info.classes, vec![MIN_AGE_CLASS, SUM_CLASS]);
    }

    #[test]
    fn kind_mismatch_is_a_marshal_error() {
        let marshaller = Marshaller::local(NodeId(1));
        let payload = marshaller.marshal_code(&SumAges, &mut None).unwrap();

        let err = marshaller
            .unmarshal_code(&payload, CodeKind::Predicate, &registry(), None)
            .unwrap_err();
        assert!(matches!(err, MarshalError::KindMismatch { .. }));
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let marshaller = Marshaller::local(NodeId(1));

        let err = marshaller
            .unmarshal_code(&[0xFF, 0xFF], CodeKind::Predicate, &registry(), None)
            .unwrap_err();
        assert!(matches!(err, MarshalError::Decode(_)));
    }

    #[test]
    fn args_round_trip() {
        let marshaller = Marshaller::local(NodeId(1));
        let args = vec![
            QueryArg::Int(30),
            QueryArg::Text("Person".into()),
            QueryArg::Null,
        ];

        let payload = marshaller.marshal_args(&args).unwrap();
        assert_eq!(marshaller.unmarshal_args(&payload).unwrap(), args);
    }

    #[test]
    fn envelope_deployment_decodes() {
        let mut info = DeploymentInfo::new(NodeId(9), 1);
        info.record(MIN_AGE_CLASS);
        let mut envelope = Envelope::default();
        envelope.set_deployment(Some(encode(&info).unwrap()));

        assert_eq!(DeploymentInfo::from_envelope(&envelope).unwrap(), Some(info));
        assert_eq!(
            DeploymentInfo::from_envelope(&Envelope::default()).unwrap(),
            None
        );
    }
}
