use crate::export::{ExportError, ReportExporter};
use crate::metrics::Metrics;
use crate::model::DailyReport;
use crate::report::{ReportAggregator, ReportError};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    Validation(&'static str),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Export(#[from] ExportError),
}

/// Entry points used by the HTTP API, the CLI and the daily schedule.
#[derive(Clone)]
pub struct ReportService {
    aggregator: ReportAggregator,
    exporter: ReportExporter,
    metrics: Arc<Metrics>,
    admin_email: String,
}

impl ReportService {
    pub fn new(
        aggregator: ReportAggregator,
        exporter: ReportExporter,
        metrics: Arc<Metrics>,
        admin_email: impl Into<String>,
    ) -> Self {
        Self {
            aggregator,
            exporter,
            metrics,
            admin_email: admin_email.into(),
        }
    }

    pub async fn generate_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DailyReport, ServiceError> {
        Ok(self.aggregator.generate(start, end).await?)
    }

    pub async fn send_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        recipient: &str,
    ) -> Result<PathBuf, ServiceError> {
        if recipient.trim().is_empty() {
            return Err(ServiceError::Validation("recipient email required"));
        }
        let subject = format!(
            "Server Report - {} to {}",
            start.format("%Y-%m-%d %H:%M"),
            end.format("%Y-%m-%d %H:%M")
        );
        self.deliver(start, end, recipient.trim(), &subject).await
    }

    /// Reports the UTC calendar day `day` to the configured admin address.
    pub async fn send_daily_report(&self, day: NaiveDate) -> Result<PathBuf, ServiceError> {
        if self.admin_email.trim().is_empty() {
            return Err(ServiceError::Validation("admin email not configured"));
        }
        let (start, end) = day_window(day)?;
        let subject = format!("Daily Server Report - {}", day.format("%Y-%m-%d"));
        self.deliver(start, end, self.admin_email.trim(), &subject).await
    }

    async fn deliver(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        recipient: &str,
        subject: &str,
    ) -> Result<PathBuf, ServiceError> {
        let report = self.aggregator.generate(start, end).await?;
        match self.exporter.send_by_email(&report, recipient, subject).await {
            Ok(path) => Ok(path),
            Err(err) => {
                self.metrics.inc_report_stage_failure(err.stage());
                Err(err.into())
            }
        }
    }

    /// Sends the previous day's report every day at `at` (UTC) until shutdown.
    pub async fn run_daily_schedule(&self, at: NaiveTime, mut shutdown: watch::Receiver<bool>) {
        info!(at = %at.format("%H:%M"), "daily report schedule started");
        loop {
            let now = Utc::now();
            let next = next_daily_run(now, at);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("daily report schedule received shutdown signal");
                    break;
                }
                _ = time::sleep(wait) => {
                    let Some(day) = next.date_naive().checked_sub_days(Days::new(1)) else {
                        continue;
                    };
                    match self.send_daily_report(day).await {
                        Ok(path) => info!(day = %day, path = %path.display(), "daily report delivered"),
                        Err(err) => error!(day = %day, error = %err, "daily report failed"),
                    }
                }
            }
        }
    }
}

/// `[day 00:00 UTC, day+1 00:00 UTC)`.
pub fn day_window(day: NaiveDate) -> Result<(DateTime<Utc>, DateTime<Utc>), ServiceError> {
    let next = day
        .checked_add_days(Days::new(1))
        .ok_or(ServiceError::Validation("day out of range"))?;
    Ok((
        day.and_time(NaiveTime::MIN).and_utc(),
        next.and_time(NaiveTime::MIN).and_utc(),
    ))
}

/// First instant strictly after `now` whose UTC time of day is `at`.
pub fn next_daily_run(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::fake::RecordingMailer;
    use crate::model::{Server, ServerStatus, StatusEvent};
    use crate::store::memory::MemoryStore;
    use crate::uptime::UptimeCalculator;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        mailer: Arc<RecordingMailer>,
        metrics: Arc<Metrics>,
        service: ReportService,
    }

    fn fixture(admin_email: &str, mailer: RecordingMailer) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("email.html");
        std::fs::write(
            &template_path,
            "<p>{{ start }} {{ avg_uptime }}</p>{% for row in detail %}<tr>{{ row.server_id }}</tr>{% endfor %}",
        )
        .unwrap();

        let store = Arc::new(MemoryStore::with_servers(vec![Server {
            server_id: "web-1".to_string(),
            server_name: "Web".to_string(),
            address: "10.0.0.1".to_string(),
            status: ServerStatus::On,
        }]));
        let metrics = Metrics::new().unwrap();
        let mailer = Arc::new(mailer);
        let aggregator = ReportAggregator::new(
            store.clone(),
            UptimeCalculator::new(store.clone()),
            metrics.clone(),
            4,
            Duration::from_secs(5),
        );
        let exporter = ReportExporter::new(dir.path().join("exports"), template_path, mailer.clone());
        let service = ReportService::new(aggregator, exporter, metrics.clone(), admin_email);
        Fixture {
            _dir: dir,
            store,
            mailer,
            metrics,
            service,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn day_window_spans_one_utc_day() {
        let (start, end) = day_window(date(2024, 2, 28)).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 28, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
    }

    #[test]
    fn next_run_is_today_or_tomorrow() {
        let at = NaiveTime::from_hms_opt(0, 5, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2024, 5, 10, 0, 1, 0).unwrap();
        assert_eq!(
            next_daily_run(before, at),
            Utc.with_ymd_and_hms(2024, 5, 10, 0, 5, 0).unwrap()
        );

        let exactly = Utc.with_ymd_and_hms(2024, 5, 10, 0, 5, 0).unwrap();
        assert_eq!(
            next_daily_run(exactly, at),
            Utc.with_ymd_and_hms(2024, 5, 11, 0, 5, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn daily_report_goes_to_admin_with_dated_subject() {
        let f = fixture("admin@example.com", RecordingMailer::default());
        let day = date(2024, 5, 10);
        let (start, _) = day_window(day).unwrap();
        f.store
            .push_event(StatusEvent::new("web-1", ServerStatus::On, start))
            .await;

        f.service.send_daily_report(day).await.unwrap();

        let sent = f.mailer.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "admin@example.com");
        assert_eq!(sent[0].subject, "Daily Server Report - 2024-05-10");
        assert_eq!(
            sent[0].html_body,
            "<p>2024-05-10 00:00:00 UTC 100.00</p><tr>web-1</tr>"
        );
    }

    #[tokio::test]
    async fn daily_report_without_admin_is_rejected() {
        let f = fixture("", RecordingMailer::default());
        let err = f.service.send_daily_report(date(2024, 5, 10)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(f.mailer.sent().await.is_empty());
    }

    #[tokio::test]
    async fn send_report_uses_window_subject() {
        let f = fixture("admin@example.com", RecordingMailer::default());
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 5, 8, 12, 30, 0).unwrap();

        f.service.send_report(start, end, "team@example.com").await.unwrap();

        let sent = f.mailer.sent().await;
        assert_eq!(sent[0].to, "team@example.com");
        assert_eq!(
            sent[0].subject,
            "Server Report - 2024-05-01 00:00 to 2024-05-08 12:30"
        );
    }

    #[tokio::test]
    async fn delivery_failure_is_an_export_error_and_counted() {
        let f = fixture("admin@example.com", RecordingMailer::failing());
        let err = f
            .service
            .send_daily_report(date(2024, 5, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Export(ExportError::Send(_))));
        assert_eq!(
            f.metrics
                .report_stage_failures_total
                .with_label_values(&["send"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn invalid_window_surfaces_as_report_error() {
        let f = fixture("admin@example.com", RecordingMailer::default());
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let err = f.service.generate_report(t, t).await.unwrap_err();
        assert!(matches!(err, ServiceError::Report(ReportError::Validation(_))));
    }

    #[tokio::test]
    async fn schedule_stops_on_shutdown() {
        let f = fixture("admin@example.com", RecordingMailer::default());
        let (tx, rx) = watch::channel(false);
        let service = f.service.clone();
        let task = tokio::spawn(async move {
            service
                .run_daily_schedule(NaiveTime::from_hms_opt(3, 0, 0).unwrap(), rx)
                .await;
        });
        tx.send(true).unwrap();
        time::timeout(Duration::from_secs(2), task)
            .await
            .expect("schedule should stop")
            .unwrap();
    }
}
