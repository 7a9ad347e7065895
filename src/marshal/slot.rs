use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use super::{MarshalError, QueryArg, UserCode};
use crate::codec::{CodecError, Writer};

#[derive(Debug, Clone)]
enum SlotState<T> {
    /// Payload as marshalled locally or as received; `None` when the slot is empty.
    Unresolved(Option<Vec<u8>>),
    Resolved(T),
}

/// Identity comparison for slot handles.
pub trait SameHandle {
    fn same(&self, other: &Self) -> bool;
}

impl SameHandle for Arc<dyn UserCode> {
    fn same(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(self), Arc::as_ptr(other))
    }
}

impl SameHandle for Vec<QueryArg> {
    fn same(&self, other: &Self) -> bool {
        self == other
    }
}

/// A value that is either a live handle or its marshalled payload, never both.
///
/// Transitions only go handle → payload (a [`marshal_with`](Self::marshal_with) result stored
/// back into the slot) or payload → handle ([`resolve_with`](Self::resolve_with)). The state
/// sits behind a lock so resolution may run on any thread.
pub struct Deferred<T> {
    state: Mutex<SlotState<T>>,
}

impl<T: Clone> Deferred<T> {
    pub fn empty() -> Self {
        Self::from_payload(None)
    }

    pub fn resolved(handle: T) -> Self {
        Self {
            state: Mutex::new(SlotState::Resolved(handle)),
        }
    }

    pub fn from_payload(payload: Option<Vec<u8>>) -> Self {
        Self {
            state: Mutex::new(SlotState::Unresolved(payload)),
        }
    }

    pub fn is_present(&self) -> bool {
        !matches!(*self.state.lock(), SlotState::Unresolved(None))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Resolved(_))
    }

    /// The live handle, if the slot has been resolved or was built from one.
    pub fn handle(&self) -> Option<T> {
        match &*self.state.lock() {
            SlotState::Resolved(handle) => Some(handle.clone()),
            SlotState::Unresolved(_) => None,
        }
    }

    pub fn payload(&self) -> Option<Vec<u8>> {
        match &*self.state.lock() {
            SlotState::Unresolved(payload) => payload.clone(),
            SlotState::Resolved(_) => None,
        }
    }

    /// Stores a payload, replacing whatever the slot held.
    pub(crate) fn receive(&mut self, payload: Option<Vec<u8>>) {
        *self.state.get_mut() = SlotState::Unresolved(payload);
    }

    /// Writes the payload; a slot still holding a handle cannot go on the wire.
    pub(crate) fn write(
        &self,
        w: &mut Writer<'_>,
        message: &'static str,
        field: &'static str,
    ) -> Result<bool, CodecError> {
        match &*self.state.lock() {
            SlotState::Unresolved(payload) => w.put_byte_array(payload.as_deref()),
            SlotState::Resolved(_) => Err(CodecError::UnpreparedField { message, field }),
        }
    }

    /// Payload for the handle held by this slot, or `None` when it already holds a payload.
    ///
    /// The slot is left as it is; the caller stores the result with `receive` once every
    /// part of the message has marshalled.
    pub fn marshal_with<F>(&self, marshal: F) -> Result<Option<Option<Vec<u8>>>, MarshalError>
    where
        F: FnOnce(&T) -> Result<Option<Vec<u8>>, MarshalError>,
    {
        match &*self.state.lock() {
            SlotState::Resolved(handle) => marshal(handle).map(Some),
            SlotState::Unresolved(_) => Ok(None),
        }
    }

    /// Rebuilds the handle from the payload on first call; later calls return the same handle.
    ///
    /// An empty slot resolves to `None`.
    pub fn resolve_with<F>(&self, unmarshal: F) -> Result<Option<T>, MarshalError>
    where
        F: FnOnce(&[u8]) -> Result<T, MarshalError>,
    {
        let mut state = self.state.lock();
        let handle = match &*state {
            SlotState::Resolved(handle) => return Ok(Some(handle.clone())),
            SlotState::Unresolved(None) => return Ok(None),
            SlotState::Unresolved(Some(payload)) => unmarshal(payload)?,
        };

        *state = SlotState::Resolved(handle.clone());
        Ok(Some(handle))
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Clone> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            state: Mutex::new(self.state.lock().clone()),
        }
    }
}

impl<T: SameHandle + Clone> PartialEq for Deferred<T> {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }

        // Never hold both locks: `a == b` and `b == a` may run at once.
        let mine = self.state.lock().clone();
        match (&mine, &*other.state.lock()) {
            (SlotState::Unresolved(a), SlotState::Unresolved(b)) => a == b,
            (SlotState::Resolved(a), SlotState::Resolved(b)) => a.same(b),
            _ => false,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.lock() {
            SlotState::Unresolved(None) => f.write_str("Empty"),
            SlotState::Unresolved(Some(payload)) => write!(f, "Payload({} bytes)", payload.len()),
            SlotState::Resolved(handle) => f.debug_tuple("Resolved").field(handle).finish(),
        }
    }
}
