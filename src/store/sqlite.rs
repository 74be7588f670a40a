//! SQLite-backed inventory and event log.

use super::{EventStore, Inventory, StoreError};
use crate::model::{Server, ServerStatus, StatusEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Thread-safe store. Every call runs on the blocking pool and is bounded by
/// `query_timeout`; a call that overruns is reported as `StoreError::Timeout`.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    query_timeout: Duration,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, query_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(include_str!("../../migrations/0001_init.sql"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            query_timeout,
        })
    }

    /// Insert inventory rows that do not exist yet. Existing rows, including
    /// their cached status, are left untouched.
    pub fn seed_servers(&self, servers: &[Server]) -> Result<usize, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut inserted = 0;
        for server in servers {
            inserted += conn.execute(
                "INSERT OR IGNORE INTO servers (server_id, server_name, address, status) VALUES (?1, ?2, ?3, ?4)",
                params![
                    server.server_id,
                    server.server_name,
                    server.address,
                    server.status.as_str(),
                ],
            )?;
        }
        Ok(inserted)
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let task = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            op(&guard)
        });

        match tokio::time::timeout(self.query_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StoreError::Join(join_err.to_string())),
            Err(_elapsed) => Err(StoreError::Timeout(self.query_timeout)),
        }
    }
}

#[async_trait]
impl Inventory for SqliteStore {
    async fn get_all(&self) -> Result<Vec<Server>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT server_id, server_name, address, status FROM servers ORDER BY rowid ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(server_id, server_name, address, status)| -> Result<Server, StoreError> {
                    let status = status.parse().map_err(StoreError::Corrupt)?;
                    Ok(Server {
                        server_id,
                        server_name,
                        address,
                        status,
                    })
                })
                .collect()
        })
        .await
    }

    async fn update_status(&self, server_id: &str, status: ServerStatus) -> Result<(), StoreError> {
        let server_id = server_id.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE servers SET status = ?1 WHERE server_id = ?2",
                params![status.as_str(), server_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(server_id));
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn write(&self, event: &StatusEvent) -> Result<(), StoreError> {
        let event = event.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO status_events (server_id, status, ts_ms) VALUES (?1, ?2, ?3)",
                params![
                    event.server_id,
                    event.status.as_str(),
                    event.timestamp.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn count_in_window(
        &self,
        server_id: &str,
        status: ServerStatus,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let server_id = server_id.to_string();
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM status_events
                 WHERE server_id = ?1 AND status = ?2 AND ts_ms >= ?3 AND ts_ms < ?4",
                params![
                    server_id,
                    status.as_str(),
                    start.timestamp_millis(),
                    end.timestamp_millis(),
                ],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn events_in_window(
        &self,
        server_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StatusEvent>, StoreError> {
        let server_id = server_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT status, ts_ms FROM status_events
                 WHERE server_id = ?1 AND ts_ms >= ?2 AND ts_ms < ?3
                 ORDER BY ts_ms ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(
                    params![server_id, start.timestamp_millis(), end.timestamp_millis()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(status, ts_ms)| -> Result<StatusEvent, StoreError> {
                    let status = status.parse().map_err(StoreError::Corrupt)?;
                    let timestamp = DateTime::<Utc>::from_timestamp_millis(ts_ms).ok_or_else(|| {
                        StoreError::Corrupt(format!("timestamp {ts_ms} out of range"))
                    })?;
                    Ok(StatusEvent::new(server_id.clone(), status, timestamp))
                })
                .collect()
        })
        .await
    }
}
