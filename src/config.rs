use crate::model::{Server, ServerStatus};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub daily_report: DailyReportConfig,
    #[serde(default)]
    pub seed_servers: Vec<SeedServer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Tcp,
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Upper bound on waiting for one tick's batch. Defaults to `interval`.
    #[serde(default, with = "humantime_serde::option")]
    pub tick_deadline: Option<Duration>,
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_probe_kind")]
    pub kind: ProbeKind,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    #[serde(default = "default_template_path")]
    pub template_path: PathBuf,
    #[serde(default = "default_report_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_report_deadline", with = "humantime_serde")]
    pub deadline: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmailConfig {
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_from")]
    pub from: String,
    #[serde(default)]
    pub admin_email: String,
    #[serde(default = "default_email_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DailyReportConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Time of day (UTC, `HH:MM`) at which the previous day's report is sent.
    #[serde(default = "default_daily_at")]
    pub at: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SeedServer {
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub address: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
            tick_deadline: None,
            default_port: default_port(),
            max_concurrency: default_max_concurrency(),
            kind: default_probe_kind(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            query_timeout: default_query_timeout(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            export_dir: default_export_dir(),
            template_path: default_template_path(),
            concurrency: default_report_concurrency(),
            deadline: default_report_deadline(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password_env: default_password_env(),
            password: None,
            from: default_from(),
            admin_email: String::new(),
            timeout: default_email_timeout(),
        }
    }
}

impl Default for DailyReportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            at: default_daily_at(),
        }
    }
}

impl ProbeConfig {
    pub fn effective_tick_deadline(&self) -> Duration {
        self.tick_deadline.unwrap_or(self.interval)
    }
}

impl EmailConfig {
    /// Password from the environment variable named by `password_env`,
    /// falling back to the inline `password`.
    pub fn resolve_password(&self) -> Option<String> {
        if let Ok(v) = std::env::var(&self.password_env) {
            if !v.trim().is_empty() {
                return Some(v);
            }
        }
        self.password
            .as_ref()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

impl DailyReportConfig {
    pub fn at_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(self.at.trim(), "%H:%M").map_err(|_| {
            ConfigError::Validation(format!(
                "daily_report.at must be HH:MM, got '{}'",
                self.at
            ))
        })
    }
}

impl SeedServer {
    pub fn to_server(&self) -> Server {
        let server_name = if self.server_name.trim().is_empty() {
            self.server_id.clone()
        } else {
            self.server_name.clone()
        };
        Server {
            server_id: self.server_id.trim().to_string(),
            server_name,
            address: self.address.trim().to_string(),
            status: ServerStatus::Off,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a host:port socket address".to_string(),
            ));
        }

        validate_probe(&self.probe)?;
        validate_storage(&self.storage)?;
        validate_report(&self.report)?;
        validate_email(&self.email, &self.daily_report)?;
        validate_seed_servers(&self.seed_servers)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_probe(cfg: &ProbeConfig) -> Result<(), ConfigError> {
    if cfg.interval < Duration::from_secs(1) {
        return Err(ConfigError::Validation(
            "probe.interval must be >= 1s".to_string(),
        ));
    }
    if cfg.timeout.is_zero() {
        return Err(ConfigError::Validation(
            "probe.timeout must be > 0".to_string(),
        ));
    }
    if cfg.timeout > cfg.effective_tick_deadline() {
        return Err(ConfigError::Validation(
            "probe.timeout must not exceed the tick deadline".to_string(),
        ));
    }
    if cfg.default_port == 0 {
        return Err(ConfigError::Validation(
            "probe.default_port must be in 1..65535".to_string(),
        ));
    }
    if cfg.max_concurrency == 0 {
        return Err(ConfigError::Validation(
            "probe.max_concurrency must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_storage(cfg: &StorageConfig) -> Result<(), ConfigError> {
    if cfg.db_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "storage.db_path must not be empty".to_string(),
        ));
    }
    if cfg.query_timeout.is_zero() {
        return Err(ConfigError::Validation(
            "storage.query_timeout must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_report(cfg: &ReportConfig) -> Result<(), ConfigError> {
    if cfg.concurrency == 0 {
        return Err(ConfigError::Validation(
            "report.concurrency must be >= 1".to_string(),
        ));
    }
    if cfg.deadline.is_zero() {
        return Err(ConfigError::Validation(
            "report.deadline must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_email(cfg: &EmailConfig, daily: &DailyReportConfig) -> Result<(), ConfigError> {
    if cfg.smtp_host.trim().is_empty() {
        return Err(ConfigError::Validation(
            "email.smtp_host must not be empty".to_string(),
        ));
    }
    if cfg.smtp_port == 0 {
        return Err(ConfigError::Validation(
            "email.smtp_port must be in 1..65535".to_string(),
        ));
    }
    if !cfg.from.contains('@') {
        return Err(ConfigError::Validation(
            "email.from must be an email address".to_string(),
        ));
    }
    if cfg.timeout.is_zero() {
        return Err(ConfigError::Validation(
            "email.timeout must be > 0".to_string(),
        ));
    }
    daily.at_time()?;
    if daily.enabled && !cfg.admin_email.contains('@') {
        return Err(ConfigError::Validation(
            "email.admin_email is required when daily_report.enabled".to_string(),
        ));
    }
    Ok(())
}

fn validate_seed_servers(servers: &[SeedServer]) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    for server in servers {
        if server.server_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "seed_servers[*].server_id must not be empty".to_string(),
            ));
        }
        if !ids.insert(server.server_id.trim()) {
            return Err(ConfigError::Validation(format!(
                "seed server id '{}' must be unique",
                server.server_id
            )));
        }
    }
    Ok(())
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_port() -> u16 {
    80
}

const fn default_max_concurrency() -> usize {
    50
}

const fn default_probe_kind() -> ProbeKind {
    ProbeKind::Tcp
}

fn default_db_path() -> PathBuf {
    PathBuf::from("fleetwatch.db")
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("./exports")
}

fn default_template_path() -> PathBuf {
    PathBuf::from("./templates/email.html")
}

const fn default_report_concurrency() -> usize {
    16
}

fn default_report_deadline() -> Duration {
    Duration::from_secs(120)
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

const fn default_smtp_port() -> u16 {
    587
}

fn default_password_env() -> String {
    "FLEETWATCH_SMTP_PASSWORD".to_string()
}

fn default_from() -> String {
    "fleetwatch@localhost".to_string()
}

fn default_email_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_daily_at() -> String {
    "00:05".to_string()
}
