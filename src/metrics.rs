use crate::model::ServerStatus;
use crate::prober::TickSummary;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub fleet_servers_total: Gauge,
    pub fleet_servers_online: Gauge,
    pub fleet_servers_offline: Gauge,
    pub probes_total: CounterVec,
    pub status_transitions_total: CounterVec,
    pub event_write_errors_total: Counter,
    pub inventory_errors_total: CounterVec,
    pub probe_tick_duration_seconds: Gauge,
    pub probe_ticks_timed_out_total: Counter,
    pub probe_last_tick_timestamp_seconds: Gauge,
    pub reports_generated_total: Counter,
    pub report_server_failures_total: Counter,
    pub report_stage_failures_total: CounterVec,
    pub report_last_avg_uptime_percent: Gauge,
    pub process_uptime_seconds: Gauge,
    pub scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let fleet_servers_total = Gauge::with_opts(opts!(
            "fleetwatch_servers_total",
            "Servers in the inventory at the last probe tick"
        ))?;
        let fleet_servers_online = Gauge::with_opts(opts!(
            "fleetwatch_servers_online",
            "Servers observed ON at the last probe tick"
        ))?;
        let fleet_servers_offline = Gauge::with_opts(opts!(
            "fleetwatch_servers_offline",
            "Servers observed OFF at the last probe tick"
        ))?;
        let probes_total = CounterVec::new(
            opts!("fleetwatch_probes_total", "Reachability probes by observation"),
            &["result"],
        )?;
        let status_transitions_total = CounterVec::new(
            opts!(
                "fleetwatch_status_transitions_total",
                "Status events written, by new status"
            ),
            &["to"],
        )?;
        let event_write_errors_total = Counter::with_opts(opts!(
            "fleetwatch_event_write_errors_total",
            "Status events that could not be written to the event store"
        ))?;
        let inventory_errors_total = CounterVec::new(
            opts!(
                "fleetwatch_inventory_errors_total",
                "Failed inventory calls by operation"
            ),
            &["op"],
        )?;
        let probe_tick_duration_seconds = Gauge::with_opts(opts!(
            "fleetwatch_probe_tick_duration_seconds",
            "Wall time of the last probe tick"
        ))?;
        let probe_ticks_timed_out_total = Counter::with_opts(opts!(
            "fleetwatch_probe_ticks_timed_out_total",
            "Probe ticks whose batch was cut off at the tick deadline"
        ))?;
        let probe_last_tick_timestamp_seconds = Gauge::with_opts(opts!(
            "fleetwatch_probe_last_tick_timestamp_seconds",
            "Unix time of the last completed probe tick"
        ))?;
        let reports_generated_total = Counter::with_opts(opts!(
            "fleetwatch_reports_generated_total",
            "Fleet reports generated"
        ))?;
        let report_server_failures_total = Counter::with_opts(opts!(
            "fleetwatch_report_server_failures_total",
            "Per-server uptime calculations that failed and were counted as 0%"
        ))?;
        let report_stage_failures_total = CounterVec::new(
            opts!(
                "fleetwatch_report_stage_failures_total",
                "Report delivery failures by stage"
            ),
            &["stage"],
        )?;
        let report_last_avg_uptime_percent = Gauge::with_opts(opts!(
            "fleetwatch_report_last_avg_uptime_percent",
            "Fleet average uptime of the last generated report"
        ))?;
        let process_uptime_seconds = Gauge::with_opts(opts!(
            "fleetwatch_process_uptime_seconds",
            "Seconds since the daemon started"
        ))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "fleetwatch_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &fleet_servers_total)?;
        register(&registry, &fleet_servers_online)?;
        register(&registry, &fleet_servers_offline)?;
        register(&registry, &probes_total)?;
        register(&registry, &status_transitions_total)?;
        register(&registry, &event_write_errors_total)?;
        register(&registry, &inventory_errors_total)?;
        register(&registry, &probe_tick_duration_seconds)?;
        register(&registry, &probe_ticks_timed_out_total)?;
        register(&registry, &probe_last_tick_timestamp_seconds)?;
        register(&registry, &reports_generated_total)?;
        register(&registry, &report_server_failures_total)?;
        register(&registry, &report_stage_failures_total)?;
        register(&registry, &report_last_avg_uptime_percent)?;
        register(&registry, &process_uptime_seconds)?;
        register(&registry, &scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            fleet_servers_total,
            fleet_servers_online,
            fleet_servers_offline,
            probes_total,
            status_transitions_total,
            event_write_errors_total,
            inventory_errors_total,
            probe_tick_duration_seconds,
            probe_ticks_timed_out_total,
            probe_last_tick_timestamp_seconds,
            reports_generated_total,
            report_server_failures_total,
            report_stage_failures_total,
            report_last_avg_uptime_percent,
            process_uptime_seconds,
            scrape_count_total,
        }))
    }

    pub fn observe_probe(&self, observed: ServerStatus) {
        self.probes_total
            .with_label_values(&[observed.as_str()])
            .inc();
    }

    pub fn observe_transition(&self, to: ServerStatus) {
        self.status_transitions_total
            .with_label_values(&[to.as_str()])
            .inc();
    }

    pub fn inc_inventory_error(&self, op: &str) {
        self.inventory_errors_total.with_label_values(&[op]).inc();
    }

    pub fn update_from_tick(&self, summary: &TickSummary) {
        self.fleet_servers_total.set(summary.checked as f64);
        self.fleet_servers_online.set(summary.online as f64);
        self.fleet_servers_offline.set(summary.offline as f64);
        self.probe_tick_duration_seconds
            .set(summary.elapsed.as_secs_f64());
        self.probe_last_tick_timestamp_seconds
            .set(now_unix() as f64);
        if summary.timed_out {
            self.probe_ticks_timed_out_total.inc();
        }
    }

    pub fn observe_report(&self, avg_uptime_percent: f64, server_failures: usize) {
        self.reports_generated_total.inc();
        self.report_server_failures_total
            .inc_by(server_failures as f64);
        self.report_last_avg_uptime_percent.set(avg_uptime_percent);
    }

    pub fn inc_report_stage_failure(&self, stage: &str) {
        self.report_stage_failures_total
            .with_label_values(&[stage])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        self.process_uptime_seconds
            .set(now_unix().saturating_sub(self.started_at_unix) as f64);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
