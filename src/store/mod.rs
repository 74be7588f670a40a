//! Collaborator contracts consumed by the prober and the report pipeline.
//!
//! The inventory and the event log are owned elsewhere; the prober and the
//! report pipeline only see them through these traits.

#[cfg(test)]
pub mod memory;
pub mod sqlite;

use crate::model::{Server, ServerStatus, StatusEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store task failed: {0}")]
    Join(String),
    #[error("store connection lock poisoned")]
    Poisoned,
    #[error("server '{0}' not found")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Inventory: Send + Sync {
    async fn get_all(&self) -> Result<Vec<Server>, StoreError>;

    async fn update_status(&self, server_id: &str, status: ServerStatus) -> Result<(), StoreError>;
}

/// Append-only log of status transitions.
///
/// Range queries are half-open: an event at `end` is outside the window.
/// Results of `events_in_window` are ordered by the backend on a best-effort
/// basis only; callers sort before use.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn write(&self, event: &StatusEvent) -> Result<(), StoreError>;

    async fn count_in_window(
        &self,
        server_id: &str,
        status: ServerStatus,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn events_in_window(
        &self,
        server_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StatusEvent>, StoreError>;
}
