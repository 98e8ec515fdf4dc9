//! Read-only client directory.

use async_trait::async_trait;

use super::models::ClientEntry;

/// Source of brand client entries. The orchestrator never writes to it.
#[async_trait]
pub trait ClientDirectory: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<ClientEntry>>;

    async fn get(&self, client_id: &str) -> anyhow::Result<Option<ClientEntry>> {
        Ok(self.list().await?.into_iter().find(|c| c.id == client_id))
    }
}

/// Client directory backed by the `[[clients]]` entries of `studio.toml`.
#[derive(Debug, Clone, Default)]
pub struct StaticClientDirectory {
    clients: Vec<ClientEntry>,
}

impl StaticClientDirectory {
    pub fn new(clients: Vec<ClientEntry>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl ClientDirectory for StaticClientDirectory {
    async fn list(&self) -> anyhow::Result<Vec<ClientEntry>> {
        Ok(self.clients.clone())
    }

    async fn get(&self, client_id: &str) -> anyhow::Result<Option<ClientEntry>> {
        Ok(self.clients.iter().find(|c| c.id == client_id).cloned())
    }
}
