//! Persistent identity used to rejoin a room after a reload.
//!
//! The client saves the room and player it was last admitted with and, when
//! configured to, rejoins them on startup. The state machine never reads it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::HandlerError;
use crate::registry::Service;

/// The room and player the client was last admitted with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub room_id: String,
    pub player_id: String,
    pub player_name: String,
}

/// Storage for the last [`StoredIdentity`].
pub trait IdentityStore: Send + Sync + 'static {
    fn save(&self, identity: &StoredIdentity) -> Result<(), HandlerError>;

    fn load(&self) -> Result<Option<StoredIdentity>, HandlerError>;

    fn clear(&self) -> Result<(), HandlerError>;
}

/// Process-local [`IdentityStore`]; forgets everything on exit.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identity: Mutex<Option<StoredIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that starts out holding `identity`.
    pub fn with_identity(identity: StoredIdentity) -> Self {
        Self {
            identity: Mutex::new(Some(identity)),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn save(&self, identity: &StoredIdentity) -> Result<(), HandlerError> {
        *self.identity.lock() = Some(identity.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<StoredIdentity>, HandlerError> {
        Ok(self.identity.lock().clone())
    }

    fn clear(&self) -> Result<(), HandlerError> {
        *self.identity.lock() = None;
        Ok(())
    }
}

/// Registry wrapper so an identity store can be wired like any other service.
pub struct IdentityService(pub Arc<dyn IdentityStore>);

impl Service for IdentityService {}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryIdentityStore::new();
        assert_eq!(store.load().unwrap(), None);

        let identity = StoredIdentity {
            room_id: "R1".into(),
            player_id: "p9".into(),
            player_name: "Alice".into(),
        };
        store.save(&identity).unwrap();
        assert_eq!(store.load().unwrap(), Some(identity));

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
