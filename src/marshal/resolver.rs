use std::{collections::HashMap, marker::PhantomData, sync::Arc};

use bincode::Decode;
use log::{debug, info};
use parking_lot::RwLock;

use super::{CodeKind, DeploymentInfo, MarshalError, NodeId, UserCode, decode};

/// A loadable user-code class.
pub trait ClassDef: Send + Sync {
    fn class_name(&self) -> &str;

    /// Slot role instances of this class may fill.
    fn kind(&self) -> CodeKind;

    fn instantiate(&self, body: &[u8]) -> Result<Arc<dyn UserCode>, MarshalError>;
}

/// Finds the class named by a payload.
pub trait ClassResolver: Send + Sync {
    fn resolve(
        &self,
        class: &str,
        deployment: Option<&DeploymentInfo>,
    ) -> Result<Arc<dyn ClassDef>, MarshalError>;
}

/// Remote supplier of classes a node does not have yet.
pub trait ClassSource: Send + Sync {
    fn fetch(
        &self,
        class: &str,
        origin: NodeId,
        loader_version: u64,
    ) -> Result<Arc<dyn ClassDef>, MarshalError>;
}

/// Class whose instances decode from a bincode body.
pub struct BincodeClass<T> {
    name: String,
    kind: CodeKind,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeClass<T> {
    pub fn new(name: impl Into<String>, kind: CodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            _marker: PhantomData,
        }
    }
}

impl<T> ClassDef for BincodeClass<T>
where
    T: UserCode + Decode<()>,
{
    fn class_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CodeKind {
        self.kind
    }

    fn instantiate(&self, body: &[u8]) -> Result<Arc<dyn UserCode>, MarshalError> {
        let code: T = decode(body)?;
        Ok(Arc::new(code))
    }
}

/// Classes known to the local node.
#[derive(Default)]
pub struct ClassRegistry {
    classes: RwLock<HashMap<String, Arc<dyn ClassDef>>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, class: impl ClassDef + 'static) {
        self.insert(Arc::new(class));
    }

    pub fn insert(&self, class: Arc<dyn ClassDef>) {
        debug!("registering class {}", class.class_name());
        self.classes
            .write()
            .insert(class.class_name().to_owned(), class);
    }

    pub fn get(&self, class: &str) -> Option<Arc<dyn ClassDef>> {
        self.classes.read().get(class).cloned()
    }

    pub fn contains(&self, class: &str) -> bool {
        self.classes.read().contains_key(class)
    }
}

impl ClassResolver for ClassRegistry {
    fn resolve(
        &self,
        class: &str,
        deployment: Option<&DeploymentInfo>,
    ) -> Result<Arc<dyn ClassDef>, MarshalError> {
        self.get(class).ok_or_else(|| MarshalError::ClassNotFound {
            class: class.to_owned(),
            origin: deployment.map(|d| d.origin),
        })
    }
}

/// Origin and loader generation a fetched class belongs to.
type FetchKey = (String, NodeId, u64);

/// Resolves locally first, then loads missing classes from the node that sent them.
///
/// Fetched classes are cached per origin and loader version, apart from the local registry,
/// so they only ever serve payloads that announce the same deployment.
pub struct PeerClassResolver {
    local: Arc<ClassRegistry>,
    source: Arc<dyn ClassSource>,
    fetched: RwLock<HashMap<FetchKey, Arc<dyn ClassDef>>>,
}

impl PeerClassResolver {
    pub fn new(local: Arc<ClassRegistry>, source: Arc<dyn ClassSource>) -> Self {
        Self {
            local,
            source,
            fetched: RwLock::new(HashMap::new()),
        }
    }
}

impl ClassResolver for PeerClassResolver {
    fn resolve(
        &self,
        class: &str,
        deployment: Option<&DeploymentInfo>,
    ) -> Result<Arc<dyn ClassDef>, MarshalError> {
        if let Some(def) = self.local.get(class) {
            return Ok(def);
        }

        let Some(info) = deployment.filter(|d| d.provides(class)) else {
            return Err(MarshalError::ClassNotFound {
                class: class.to_owned(),
                origin: deployment.map(|d| d.origin),
            });
        };

        let key = (class.to_owned(), info.origin, info.loader_version);
        if let Some(def) = self.fetched.read().get(&key) {
            return Ok(Arc::clone(def));
        }

        info!(
            "loading class {class} from {} (loader {})",
            info.origin, info.loader_version
        );
        let def = self.source.fetch(class, info.origin, info.loader_version)?;
        Ok(Arc::clone(self.fetched.write().entry(key).or_insert(def)))
    }
}
