use async_trait::async_trait;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{FIXED_KEY_ID, KeyManager};
use crate::context::RequestContext;
use crate::error::{BackupError, ResourceKind, Result};

/// Process-local key store. Keys are random 32-byte secrets; the legacy
/// fixed key is always present.
#[derive(Debug)]
pub struct InMemoryKeyManager {
    keys: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryKeyManager {
    pub fn new() -> Self {
        let mut keys = HashMap::new();
        keys.insert(FIXED_KEY_ID.to_string(), vec![0u8; 32]);
        Self {
            keys: Mutex::new(keys),
        }
    }

    /// Generate a new key and return its id.
    pub fn create_key(&self) -> String {
        let mut material = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut material);
        let id = Uuid::new_v4().to_string();
        self.lock().insert(id.clone(), material);
        id
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.lock().contains_key(key_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        // A poisoned map is still consistent: every mutation is a single insert/remove.
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InMemoryKeyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyManager for InMemoryKeyManager {
    async fn clone_key(&self, _ctx: &RequestContext, key_id: &str) -> Result<String> {
        let mut keys = self.lock();
        let material = keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| BackupError::not_found(ResourceKind::EncryptionKey, key_id))?;
        let id = Uuid::new_v4().to_string();
        keys.insert(id.clone(), material);
        debug!("Cloned key {} as {}", key_id, id);
        Ok(id)
    }

    async fn delete_key(&self, _ctx: &RequestContext, key_id: &str) -> Result<()> {
        if key_id == FIXED_KEY_ID {
            return Ok(());
        }
        self.lock()
            .remove(key_id)
            .map(|_| ())
            .ok_or_else(|| BackupError::not_found(ResourceKind::EncryptionKey, key_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clone_and_delete() {
        let keys = InMemoryKeyManager::new();
        let ctx = RequestContext::admin();
        let original = keys.create_key();

        let cloned = keys.clone_key(&ctx, &original).await.unwrap();
        assert_ne!(cloned, original);
        assert!(keys.contains(&cloned));

        keys.delete_key(&ctx, &original).await.unwrap();
        assert!(!keys.contains(&original));
        assert!(keys.delete_key(&ctx, &original).await.unwrap_err().is_not_found());

        // the legacy key can be cloned but never removed
        keys.clone_key(&ctx, FIXED_KEY_ID).await.unwrap();
        keys.delete_key(&ctx, FIXED_KEY_ID).await.unwrap();
        assert!(keys.contains(FIXED_KEY_ID));
    }
}
