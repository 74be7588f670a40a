use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerStatus {
    On,
    Off,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::On => "ON",
            ServerStatus::Off => "OFF",
        }
    }

    pub fn is_on(self) -> bool {
        matches!(self, ServerStatus::On)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" => Ok(ServerStatus::On),
            "OFF" => Ok(ServerStatus::Off),
            other => Err(format!("unknown server status '{other}'")),
        }
    }
}

/// Inventory row as seen by the core. `status` is the cached reachability,
/// written only by the prober once the row exists.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Server {
    pub server_id: String,
    pub server_name: String,
    pub address: String,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StatusEvent {
    pub server_id: String,
    pub status: ServerStatus,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(server_id: impl Into<String>, status: ServerStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            server_id: server_id.into(),
            status,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UptimeRecord {
    pub server: Server,
    pub uptime_percent: f64,
}

/// Fleet availability over `[start, end)`. Built once by the aggregator and
/// read-only afterwards.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DailyReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_servers: usize,
    pub online_count: usize,
    pub offline_count: usize,
    pub avg_uptime_percent: f64,
    pub detail: Vec<UptimeRecord>,
}

impl DailyReport {
    pub fn from_records(start: DateTime<Utc>, end: DateTime<Utc>, detail: Vec<UptimeRecord>) -> Self {
        let total_servers = detail.len();
        let online_count = detail.iter().filter(|r| r.server.status.is_on()).count();
        let offline_count = total_servers - online_count;
        let avg_uptime_percent = if total_servers > 0 {
            detail.iter().map(|r| r.uptime_percent).sum::<f64>() / total_servers as f64
        } else {
            0.0
        };

        Self {
            start,
            end,
            total_servers,
            online_count,
            offline_count,
            avg_uptime_percent,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, status: ServerStatus, uptime: f64) -> UptimeRecord {
        UptimeRecord {
            server: Server {
                server_id: id.to_string(),
                server_name: id.to_string(),
                address: String::new(),
                status,
            },
            uptime_percent: uptime,
        }
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("on".parse::<ServerStatus>(), Ok(ServerStatus::On));
        assert_eq!(" OFF ".parse::<ServerStatus>(), Ok(ServerStatus::Off));
        assert!("MAINTENANCE".parse::<ServerStatus>().is_err());
    }

    #[test]
    fn report_totals_follow_cached_status_and_unweighted_mean() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let report = DailyReport::from_records(
            start,
            end,
            vec![
                record("a", ServerStatus::On, 100.0),
                record("b", ServerStatus::Off, 50.0),
                record("c", ServerStatus::On, 0.0),
            ],
        );

        assert_eq!(report.total_servers, 3);
        assert_eq!(report.online_count, 2);
        assert_eq!(report.offline_count, 1);
        assert_eq!(report.avg_uptime_percent, 50.0);
        assert_eq!(report.detail[1].server.server_id, "b");
    }

    #[test]
    fn empty_report_has_zero_average() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let report = DailyReport::from_records(start, end, Vec::new());
        assert_eq!(report.total_servers, 0);
        assert_eq!(report.avg_uptime_percent, 0.0);
    }
}
