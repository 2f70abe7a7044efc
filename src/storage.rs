//! Generic key-value store contract for node state.
//!
//! The network layer does not depend on a storage engine; services above it
//! receive a `dyn KvStore`. [`MemoryKv`] is the in-process implementation
//! used by tests and the memory backend.

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{NetError, Result};

#[async_trait]
pub trait KvStore: Debug + Send + Sync + 'static {
    /// Make the store usable. Idempotent.
    async fn open(&self) -> Result<()>;
    /// Idempotent. Operations after close fail with `Closed`.
    async fn close(&self) -> Result<()>;
    /// `Ok(None)` if the key is absent.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &[u8]) -> Result<()>;
}

#[derive(Debug, Default)]
struct KvState {
    open: bool,
    entries: HashMap<Vec<u8>, Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct MemoryKv {
    state: RwLock<KvState>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn open(&self) -> Result<()> {
        self.state.write().await.open = true;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.write().await.open = false;
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.state.read().await;
        if !state.open {
            return Err(NetError::Closed);
        }
        Ok(state.entries.get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.open {
            return Err(NetError::Closed);
        }
        state.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.open {
            return Err(NetError::Closed);
        }
        state.entries.remove(key);
        Ok(())
    }
}
