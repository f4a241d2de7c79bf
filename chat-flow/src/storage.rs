use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::{error::Result, session::SessionHandle};

/// Trait for storing and retrieving live sessions
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn save(&self, session: Arc<SessionHandle>) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Arc<SessionHandle>>>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list_ids(&self) -> Result<Vec<String>>;
}

/// In-memory implementation of SessionStorage
///
/// Sessions live only as long as the process; nothing is written to disk.
pub struct InMemorySessionStorage {
    sessions: Arc<DashMap<String, Arc<SessionHandle>>>,
}

impl InMemorySessionStorage {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemorySessionStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStorage for InMemorySessionStorage {
    async fn save(&self, session: Arc<SessionHandle>) -> Result<()> {
        self.sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Arc<SessionHandle>>> {
        Ok(self.sessions.get(id).map(|entry| entry.clone()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.remove(id);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.sessions.iter().map(|entry| entry.key().clone()).collect())
    }
}
