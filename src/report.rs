use crate::metrics::Metrics;
use crate::model::{DailyReport, UptimeRecord};
use crate::store::{Inventory, StoreError};
use crate::uptime::UptimeCalculator;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("validation error: {0}")]
    Validation(&'static str),
    #[error("inventory fetch failed: {0}")]
    Inventory(#[source] StoreError),
    #[error("report generation exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

/// Builds fleet reports by running the uptime calculation for every
/// inventory server.
///
/// Per-server failures are logged and scored 0%; they still count toward the
/// fleet total and the average.
#[derive(Clone)]
pub struct ReportAggregator {
    inventory: Arc<dyn Inventory>,
    calculator: UptimeCalculator,
    metrics: Arc<Metrics>,
    concurrency: usize,
    deadline: Duration,
}

impl ReportAggregator {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        calculator: UptimeCalculator,
        metrics: Arc<Metrics>,
        concurrency: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            inventory,
            calculator,
            metrics,
            concurrency: concurrency.max(1),
            deadline,
        }
    }

    pub async fn generate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DailyReport, ReportError> {
        if start >= end {
            return Err(ReportError::Validation("start must precede end"));
        }

        match time::timeout(self.deadline, self.build(start, end)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                warn!(
                    start = %start,
                    end = %end,
                    deadline = %humantime::format_duration(self.deadline),
                    "report generation abandoned at deadline"
                );
                Err(ReportError::DeadlineExceeded(self.deadline))
            }
        }
    }

    async fn build(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DailyReport, ReportError> {
        let servers = self
            .inventory
            .get_all()
            .await
            .map_err(ReportError::Inventory)?;

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (idx, server) in servers.iter().enumerate() {
            let calculator = self.calculator.clone();
            let semaphore = semaphore.clone();
            let server_id = server.server_id.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = calculator.server_uptime(&server_id, start, end).await;
                (idx, server_id, result)
            });
        }

        let mut uptimes = vec![0.0_f64; servers.len()];
        let mut failures = 0_usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, _, Ok(percent))) => uptimes[idx] = percent,
                Ok((_, server_id, Err(err))) => {
                    failures += 1;
                    warn!(server_id = %server_id, error = %err, "uptime calculation failed, counting as 0%");
                }
                Err(join_err) => {
                    failures += 1;
                    warn!(error = %join_err, "uptime task failed, counting as 0%");
                }
            }
        }

        let detail = servers
            .into_iter()
            .zip(uptimes)
            .map(|(server, uptime_percent)| UptimeRecord {
                server,
                uptime_percent,
            })
            .collect();
        let report = DailyReport::from_records(start, end, detail);

        self.metrics
            .observe_report(report.avg_uptime_percent, failures);
        info!(
            start = %start,
            end = %end,
            total = report.total_servers,
            online = report.online_count,
            offline = report.offline_count,
            avg_uptime = report.avg_uptime_percent,
            failures,
            "report generated"
        );
        Ok(report)
    }
}
