use crate::config::{ProbeConfig, ProbeKind};
use crate::metrics::Metrics;
use crate::model::{Server, ServerStatus, StatusEvent};
use crate::store::{EventStore, Inventory, StoreError};
use chrono::Utc;
use reqwest::Client;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

type StatusSlot = Arc<Mutex<Option<ServerStatus>>>;

/// Outcome of one probe tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub checked: usize,
    pub online: usize,
    pub offline: usize,
    pub transitions: usize,
    pub write_failures: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ProbeOutcome {
    observed: ServerStatus,
    transitioned: bool,
    write_failed: bool,
}

/// Periodic reachability checker for every inventory server.
///
/// Each tick fetches the inventory, probes every server through a bounded
/// pool and waits for the whole batch, capped by the tick deadline. When the
/// observation differs from the last recorded status a `StatusEvent` is
/// written; the inventory's cached status is updated whenever it disagrees
/// with the observation.
#[derive(Clone)]
pub struct Prober {
    inventory: Arc<dyn Inventory>,
    events: Arc<dyn EventStore>,
    metrics: Arc<Metrics>,
    client: Client,
    cfg: ProbeConfig,
    last_known: Arc<Mutex<HashMap<String, StatusSlot>>>,
}

impl Prober {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        events: Arc<dyn EventStore>,
        cfg: ProbeConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let client = Client::builder()
            .user_agent("fleetwatch/0.1.0")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            inventory,
            events,
            metrics,
            client,
            cfg,
            last_known: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval = %humantime::format_duration(self.cfg.interval),
            max_concurrency = self.cfg.max_concurrency,
            "prober started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("prober received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        result = self.run_tick() => self.record_tick(result),
                        _ = shutdown.changed() => {
                            info!("shutdown during probe tick, abandoning batch");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Runs a single probe tick and waits for its batch.
    ///
    /// Fails only when the inventory cannot be fetched; every per-server
    /// problem is folded into the summary.
    pub async fn run_tick(&self) -> Result<TickSummary, StoreError> {
        let started = Instant::now();
        let servers = match self.inventory.get_all().await {
            Ok(servers) => servers,
            Err(err) => {
                self.metrics.inc_inventory_error("get_all");
                return Err(err);
            }
        };

        let slots = self.sync_registry(&servers).await;
        let semaphore = Arc::new(Semaphore::new(self.cfg.max_concurrency.max(1)));
        let mut batch = JoinSet::new();
        let mut summary = TickSummary {
            checked: servers.len(),
            ..TickSummary::default()
        };

        for (server, slot) in servers.into_iter().zip(slots) {
            let prober = self.clone();
            let semaphore = semaphore.clone();
            batch.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                Some(prober.check_server(server, slot).await)
            });
        }

        let deadline = time::Instant::now() + self.cfg.effective_tick_deadline();
        loop {
            match time::timeout_at(deadline, batch.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok(Some(outcome)))) => summary.absorb(outcome),
                Ok(Some(Ok(None))) => {}
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "probe task failed");
                }
                Err(_elapsed) => {
                    let pending = batch.len();
                    batch.abort_all();
                    while batch.join_next().await.is_some() {}
                    warn!(pending, "probe tick deadline reached, remaining probes aborted");
                    summary.timed_out = true;
                    break;
                }
            }
        }

        summary.elapsed = started.elapsed();
        Ok(summary)
    }

    fn record_tick(&self, result: Result<TickSummary, StoreError>) {
        match result {
            Ok(summary) => {
                self.metrics.update_from_tick(&summary);
                debug!(
                    checked = summary.checked,
                    online = summary.online,
                    offline = summary.offline,
                    transitions = summary.transitions,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "probe tick finished"
                );
            }
            Err(err) => {
                error!(error = %err, "inventory fetch failed, probe tick skipped");
            }
        }
    }

    /// Returns the status slot of each server in inventory order and drops
    /// slots of servers no longer in the inventory.
    async fn sync_registry(&self, servers: &[Server]) -> Vec<StatusSlot> {
        let mut registry = self.last_known.lock().await;
        registry.retain(|id, _| servers.iter().any(|s| &s.server_id == id));
        servers
            .iter()
            .map(|s| registry.entry(s.server_id.clone()).or_default().clone())
            .collect()
    }

    async fn check_server(&self, server: Server, slot: StatusSlot) -> ProbeOutcome {
        let observed = self.probe(&server.address).await;
        self.metrics.observe_probe(observed);
        debug!(server_id = %server.server_id, status = %observed, "probe finished");

        let mut outcome = ProbeOutcome {
            observed,
            transitioned: false,
            write_failed: false,
        };

        {
            let mut last = slot.lock().await;
            let known = last.unwrap_or(server.status);
            if observed == known {
                *last = Some(known);
            } else {
                let event = StatusEvent::new(server.server_id.clone(), observed, Utc::now());
                match self.events.write(&event).await {
                    Ok(()) => {
                        *last = Some(observed);
                        outcome.transitioned = true;
                        self.metrics.observe_transition(observed);
                        info!(
                            server_id = %server.server_id,
                            from = %known,
                            to = %observed,
                            "server status changed"
                        );
                    }
                    Err(err) => {
                        // Retried on the next tick.
                        *last = Some(known);
                        outcome.write_failed = true;
                        self.metrics.event_write_errors_total.inc();
                        warn!(server_id = %server.server_id, error = %err, "status event write failed");
                    }
                }
            }
        }

        // The inventory only follows recorded events.
        if observed != server.status && !outcome.write_failed {
            if let Err(err) = self.inventory.update_status(&server.server_id, observed).await {
                self.metrics.inc_inventory_error("update_status");
                warn!(server_id = %server.server_id, error = %err, "inventory status update failed");
            }
        }

        outcome
    }

    async fn probe(&self, address: &str) -> ServerStatus {
        let address = address.trim();
        if address.is_empty() {
            return ServerStatus::Off;
        }
        match self.cfg.kind {
            ProbeKind::Tcp => self.probe_tcp(address).await,
            ProbeKind::Http => self.probe_http(address).await,
        }
    }

    async fn probe_tcp(&self, address: &str) -> ServerStatus {
        let target = dial_target(address, self.cfg.default_port);
        match time::timeout(self.cfg.timeout, TcpStream::connect(&target)).await {
            Ok(Ok(_stream)) => ServerStatus::On,
            Ok(Err(err)) => {
                debug!(address = %target, error = %err, "tcp probe failed");
                ServerStatus::Off
            }
            Err(_elapsed) => {
                debug!(address = %target, "tcp probe timeout");
                ServerStatus::Off
            }
        }
    }

    async fn probe_http(&self, address: &str) -> ServerStatus {
        let url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };

        match self.client.get(&url).timeout(self.cfg.timeout).send().await {
            Ok(resp) if resp.status().as_u16() < 500 => ServerStatus::On,
            Ok(resp) => {
                debug!(url = %url, status = resp.status().as_u16(), "http probe got server error");
                ServerStatus::Off
            }
            Err(err) => {
                debug!(url = %url, error = %err, "http probe failed");
                ServerStatus::Off
            }
        }
    }
}

impl TickSummary {
    fn absorb(&mut self, outcome: ProbeOutcome) {
        match outcome.observed {
            ServerStatus::On => self.online += 1,
            ServerStatus::Off => self.offline += 1,
        }
        if outcome.transitioned {
            self.transitions += 1;
        }
        if outcome.write_failed {
            self.write_failures += 1;
        }
    }
}

/// `host:port` to dial, appending `default_port` when the address has none.
fn dial_target(address: &str, default_port: u16) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    if address.starts_with('[') {
        return format!("{address}:{default_port}");
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            address.to_string()
        }
        Some(_) => format!("[{address}]:{default_port}"),
        None => format!("{address}:{default_port}"),
    }
}
