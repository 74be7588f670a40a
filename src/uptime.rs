//! Availability reconstruction from sparse status transitions.
//!
//! Events only mark the moments a server changed state, so the status at any
//! instant is the status of the latest event at or before it. The part of the
//! window before the first event has no observation; it inherits the first
//! event's status (backward extrapolation from the earliest sample).

use crate::model::StatusEvent;
use crate::store::{EventStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UptimeError {
    #[error("validation error: {0}")]
    Validation(&'static str),
    #[error("event store query failed: {0}")]
    EventStore(#[from] StoreError),
}

#[derive(Clone)]
pub struct UptimeCalculator {
    events: Arc<dyn EventStore>,
}

impl UptimeCalculator {
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self { events }
    }

    /// Percentage of `[start, end)` during which `server_id` was ON.
    ///
    /// A server with no events in the window scores 0 without error.
    pub async fn server_uptime(
        &self,
        server_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64, UptimeError> {
        validate_window(server_id, start, end)?;
        let events = self.events.events_in_window(server_id, start, end).await?;
        Ok(uptime_from_events(events, start, end))
    }
}

pub fn validate_window(
    server_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<(), UptimeError> {
    if server_id.trim().is_empty() {
        return Err(UptimeError::Validation("serverID required"));
    }
    if start >= end {
        return Err(UptimeError::Validation("start must precede end"));
    }
    Ok(())
}

/// Pure part of the calculation. Events outside `[start, end)` are ignored and
/// the rest are sorted, so the store's ordering is never trusted.
pub fn uptime_from_events(
    mut events: Vec<StatusEvent>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> f64 {
    let window_ms = (end - start).num_milliseconds();
    if window_ms <= 0 {
        return 0.0;
    }

    events.retain(|e| e.timestamp >= start && e.timestamp < end);
    events.sort_by_key(|e| e.timestamp);

    let (first, last) = match (events.first(), events.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return 0.0,
    };

    let mut on_ms: i64 = 0;

    if first.status.is_on() {
        on_ms += (first.timestamp - start).num_milliseconds();
    }

    for pair in events.windows(2) {
        if pair[0].status.is_on() {
            on_ms += (pair[1].timestamp - pair[0].timestamp).num_milliseconds();
        }
    }

    if last.status.is_on() {
        on_ms += (end - last.timestamp).num_milliseconds();
    }

    let percent = on_ms as f64 / window_ms as f64 * 100.0;
    percent.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServerStatus, StatusEvent};
    use crate::store::memory::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, h, m, s).unwrap()
    }

    fn day() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = at(0, 0, 0);
        (start, start + Duration::hours(24))
    }

    fn ev(status: ServerStatus, ts: DateTime<Utc>) -> StatusEvent {
        StatusEvent::new("srv-1", status, ts)
    }

    fn calculator(store: Arc<MemoryStore>) -> UptimeCalculator {
        UptimeCalculator::new(store)
    }

    #[test]
    fn no_events_means_zero() {
        let (start, end) = day();
        assert_eq!(uptime_from_events(Vec::new(), start, end), 0.0);
    }

    #[test]
    fn single_on_at_window_start_is_full_uptime() {
        let (start, end) = day();
        let pct = uptime_from_events(vec![ev(ServerStatus::On, start)], start, end);
        assert_eq!(pct, 100.0);
    }

    #[test]
    fn on_then_off_at_noon_is_half() {
        let (start, end) = day();
        let pct = uptime_from_events(
            vec![ev(ServerStatus::On, start), ev(ServerStatus::Off, at(12, 0, 0))],
            start,
            end,
        );
        assert_eq!(pct, 50.0);
    }

    #[test]
    fn backfill_uses_first_event_status() {
        let start = at(0, 0, 0);
        let end = at(23, 59, 59);
        let pct = uptime_from_events(
            vec![ev(ServerStatus::Off, at(2, 0, 0)), ev(ServerStatus::On, at(10, 0, 0))],
            start,
            end,
        );
        assert!((pct - 58.33).abs() < 0.01, "got {pct}");

        // A first event of ON credits the whole lead-in as uptime.
        let (start, end) = day();
        let pct = uptime_from_events(
            vec![ev(ServerStatus::On, at(6, 0, 0)), ev(ServerStatus::Off, at(12, 0, 0))],
            start,
            end,
        );
        assert_eq!(pct, 50.0);
    }

    #[test]
    fn out_of_order_events_are_sorted() {
        let (start, end) = day();
        let pct = uptime_from_events(
            vec![
                ev(ServerStatus::On, at(18, 0, 0)),
                ev(ServerStatus::On, start),
                ev(ServerStatus::Off, at(6, 0, 0)),
            ],
            start,
            end,
        );
        // ON 00-06, OFF 06-18, ON 18-24
        assert_eq!(pct, 50.0);
    }

    #[test]
    fn repeated_same_status_events_do_not_double_count() {
        let (start, end) = day();
        let pct = uptime_from_events(
            vec![
                ev(ServerStatus::On, start),
                ev(ServerStatus::On, at(8, 0, 0)),
                ev(ServerStatus::On, at(16, 0, 0)),
            ],
            start,
            end,
        );
        assert_eq!(pct, 100.0);
    }

    #[test]
    fn events_outside_window_are_ignored() {
        let (start, end) = day();
        let pct = uptime_from_events(
            vec![
                ev(ServerStatus::On, start - Duration::hours(3)),
                ev(ServerStatus::Off, at(12, 0, 0)),
                ev(ServerStatus::On, end),
            ],
            start,
            end,
        );
        // Only OFF@12 remains; it backfills the whole window.
        assert_eq!(pct, 0.0);
    }

    #[tokio::test]
    async fn rejects_inverted_or_empty_window() {
        let calc = calculator(Arc::new(MemoryStore::default()));
        let (start, end) = day();

        let err = calc.server_uptime("srv-1", end, start).await.unwrap_err();
        assert!(matches!(err, UptimeError::Validation("start must precede end")));

        let err = calc.server_uptime("srv-1", start, start).await.unwrap_err();
        assert!(matches!(err, UptimeError::Validation(_)));

        let err = calc.server_uptime("  ", start, end).await.unwrap_err();
        assert!(matches!(err, UptimeError::Validation("serverID required")));
    }

    #[tokio::test]
    async fn quiet_server_scores_zero_without_error() {
        let calc = calculator(Arc::new(MemoryStore::default()));
        let (start, end) = day();
        let pct = calc.server_uptime("srv-1", start, end).await.unwrap();
        assert_eq!(pct, 0.0);
    }

    #[tokio::test]
    async fn store_failure_is_propagated() {
        let store = Arc::new(MemoryStore::default());
        store.fail_queries_for("srv-1").await;
        let calc = calculator(store);
        let (start, end) = day();

        let err = calc.server_uptime("srv-1", start, end).await.unwrap_err();
        assert!(matches!(err, UptimeError::EventStore(_)));
    }

    #[tokio::test]
    async fn reads_events_from_store() {
        let store = Arc::new(MemoryStore::default());
        store.push_event(ev(ServerStatus::Off, at(12, 0, 0))).await;
        store.push_event(ev(ServerStatus::On, at(0, 0, 0))).await;
        let calc = calculator(store);
        let (start, end) = day();

        let pct = calc.server_uptime("srv-1", start, end).await.unwrap();
        assert_eq!(pct, 50.0);
    }
}
