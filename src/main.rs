mod config;
mod export;
mod http;
mod mailer;
mod metrics;
mod model;
mod prober;
mod report;
mod service;
mod store;
mod template;
mod uptime;

use axum::serve;
use chrono::NaiveDate;
use clap::Parser;
use config::Config;
use export::ReportExporter;
use mailer::SmtpMailer;
use metrics::Metrics;
use model::Server;
use prober::Prober;
use report::ReportAggregator;
use service::ReportService;
use std::net::SocketAddr;
use std::sync::Arc;
use store::SqliteStore;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uptime::UptimeCalculator;

#[derive(Parser, Debug)]
#[command(name = "fleetwatch")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Run a single probe tick and exit.
    #[arg(long, conflicts_with = "send_daily_report")]
    probe_once: bool,
    /// Send the report for the given UTC day to the admin address and exit.
    #[arg(long, value_name = "YYYY-MM-DD", conflicts_with = "probe_once")]
    send_daily_report: Option<NaiveDate>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let store = match SqliteStore::open(&cfg.storage.db_path, cfg.storage.query_timeout) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, path = %cfg.storage.db_path.display(), "failed to open store");
            std::process::exit(1);
        }
    };

    if !cfg.seed_servers.is_empty() {
        let seeds: Vec<Server> = cfg.seed_servers.iter().map(|s| s.to_server()).collect();
        match store.seed_servers(&seeds) {
            Ok(inserted) => info!(inserted, configured = seeds.len(), "inventory seeded"),
            Err(err) => {
                error!(error = %err, "failed to seed inventory");
                std::process::exit(1);
            }
        }
    }

    let mailer = match SmtpMailer::new(&cfg.email) {
        Ok(mailer) => Arc::new(mailer),
        Err(err) => {
            error!(error = %err, "failed to configure smtp transport");
            std::process::exit(1);
        }
    };

    let calculator = UptimeCalculator::new(store.clone());
    let aggregator = ReportAggregator::new(
        store.clone(),
        calculator,
        metrics.clone(),
        cfg.report.concurrency,
        cfg.report.deadline,
    );
    let exporter = ReportExporter::new(
        cfg.report.export_dir.clone(),
        cfg.report.template_path.clone(),
        mailer,
    );
    let service = ReportService::new(
        aggregator,
        exporter,
        metrics.clone(),
        cfg.email.admin_email.clone(),
    );
    let prober = Prober::new(
        store.clone(),
        store.clone(),
        cfg.probe.clone(),
        metrics.clone(),
    );

    if cli.probe_once {
        match prober.run_tick().await {
            Ok(summary) => {
                metrics.update_from_tick(&summary);
                info!(
                    checked = summary.checked,
                    online = summary.online,
                    offline = summary.offline,
                    transitions = summary.transitions,
                    write_failures = summary.write_failures,
                    timed_out = summary.timed_out,
                    "probe tick finished"
                );
                return;
            }
            Err(err) => {
                error!(error = %err, "probe tick failed");
                std::process::exit(1);
            }
        }
    }

    if let Some(day) = cli.send_daily_report {
        match service.send_daily_report(day).await {
            Ok(path) => {
                info!(day = %day, path = %path.display(), "daily report sent");
                return;
            }
            Err(err) => {
                error!(day = %day, error = %err, "daily report failed");
                std::process::exit(1);
            }
        }
    }

    info!(
        listen = %cfg.listen,
        interval = %humantime::format_duration(cfg.probe.interval),
        "starting fleetwatch"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let app = http::build_router(metrics.clone(), service.clone(), store.clone());
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to bind HTTP listener");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let prober_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            prober.run_forever(shutdown).await;
        })
    };

    let schedule_task = if cfg.daily_report.enabled {
        match cfg.daily_report.at_time() {
            Ok(at) => {
                let service = service.clone();
                let shutdown = shutdown_rx.clone();
                Some(tokio::spawn(async move {
                    service.run_daily_schedule(at, shutdown).await;
                }))
            }
            Err(err) => {
                error!(error = %err, "daily report schedule disabled");
                None
            }
        }
    } else {
        None
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = prober_task.await;
    if let Some(task) = schedule_task {
        let _ = task.await;
    }
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
