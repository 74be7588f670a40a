//! In-memory collaborators with failure injection, for tests.

use super::{EventStore, Inventory, StoreError};
use crate::model::{Server, ServerStatus, StatusEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryStore {
    servers: RwLock<Vec<Server>>,
    events: RwLock<Vec<StatusEvent>>,
    failing_queries: RwLock<HashSet<String>>,
    failing_writes: RwLock<HashSet<String>>,
    inventory_down: RwLock<bool>,
    query_delay: RwLock<Option<Duration>>,
}

impl MemoryStore {
    pub fn with_servers(servers: Vec<Server>) -> Self {
        Self {
            servers: RwLock::new(servers),
            ..Self::default()
        }
    }

    pub async fn push_event(&self, event: StatusEvent) {
        self.events.write().await.push(event);
    }

    pub async fn events(&self) -> Vec<StatusEvent> {
        self.events.read().await.clone()
    }

    pub async fn servers(&self) -> Vec<Server> {
        self.servers.read().await.clone()
    }

    pub async fn fail_queries_for(&self, server_id: &str) {
        self.failing_queries.write().await.insert(server_id.to_string());
    }

    pub async fn fail_writes_for(&self, server_id: &str) {
        self.failing_writes.write().await.insert(server_id.to_string());
    }

    pub async fn clear_write_failures(&self) {
        self.failing_writes.write().await.clear();
    }

    pub async fn set_inventory_down(&self, down: bool) {
        *self.inventory_down.write().await = down;
    }

    pub async fn delay_queries(&self, delay: Duration) {
        *self.query_delay.write().await = Some(delay);
    }

    async fn maybe_delay(&self) {
        let delay = *self.query_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Inventory for MemoryStore {
    async fn get_all(&self) -> Result<Vec<Server>, StoreError> {
        if *self.inventory_down.read().await {
            return Err(StoreError::Unavailable("inventory offline".to_string()));
        }
        Ok(self.servers.read().await.clone())
    }

    async fn update_status(&self, server_id: &str, status: ServerStatus) -> Result<(), StoreError> {
        let mut servers = self.servers.write().await;
        let server = servers
            .iter_mut()
            .find(|s| s.server_id == server_id)
            .ok_or_else(|| StoreError::NotFound(server_id.to_string()))?;
        server.status = status;
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn write(&self, event: &StatusEvent) -> Result<(), StoreError> {
        if self.failing_writes.read().await.contains(&event.server_id) {
            return Err(StoreError::Unavailable(format!(
                "write rejected for {}",
                event.server_id
            )));
        }
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn count_in_window(
        &self,
        server_id: &str,
        status: ServerStatus,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let events = self.events_in_window(server_id, start, end).await?;
        Ok(events.iter().filter(|e| e.status == status).count() as u64)
    }

    /// Returns matches in insertion order, which is not necessarily
    /// chronological.
    async fn events_in_window(
        &self,
        server_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StatusEvent>, StoreError> {
        self.maybe_delay().await;
        if self.failing_queries.read().await.contains(server_id) {
            return Err(StoreError::Unavailable(format!("query failed for {server_id}")));
        }
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.server_id == server_id && e.timestamp >= start && e.timestamp < end)
            .cloned()
            .collect())
    }
}
