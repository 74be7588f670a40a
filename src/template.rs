//! Report email rendering.
//!
//! Templates are Jinja-style and loaded at runtime. The context exposes the
//! report fields (`start`, `end`, `total_servers`, `online_count`,
//! `offline_count`, `avg_uptime`, `generated_at`) and `detail`, a list of rows
//! with `server_id`, `server_name`, `address`, `status` and `uptime`. Output
//! is HTML-escaped and undefined names are errors.

use crate::model::DailyReport;
use chrono::{DateTime, Utc};
use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::Serialize;
use thiserror::Error;

const TEMPLATE_NAME: &str = "email.html";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template parse error: {0}")]
    Parse(#[source] minijinja::Error),
    #[error("template execution error: {0}")]
    Execute(#[source] minijinja::Error),
}

#[derive(Serialize)]
struct EmailContext<'a> {
    start: String,
    end: String,
    total_servers: usize,
    online_count: usize,
    offline_count: usize,
    avg_uptime: String,
    generated_at: String,
    detail: Vec<RowContext<'a>>,
}

#[derive(Serialize)]
struct RowContext<'a> {
    server_id: &'a str,
    server_name: &'a str,
    address: &'a str,
    status: &'static str,
    uptime: String,
}

pub struct Template {
    env: Environment<'static>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_template_owned(TEMPLATE_NAME, source.to_string())
            .map_err(TemplateError::Parse)?;
        Ok(Self { env })
    }

    pub fn execute(
        &self,
        report: &DailyReport,
        generated_at: DateTime<Utc>,
    ) -> Result<String, TemplateError> {
        let ctx = EmailContext {
            start: format_time(report.start),
            end: format_time(report.end),
            total_servers: report.total_servers,
            online_count: report.online_count,
            offline_count: report.offline_count,
            avg_uptime: format!("{:.2}", report.avg_uptime_percent),
            generated_at: format_time(generated_at),
            detail: report
                .detail
                .iter()
                .map(|r| RowContext {
                    server_id: &r.server.server_id,
                    server_name: &r.server.server_name,
                    address: &r.server.address,
                    status: r.server.status.as_str(),
                    uptime: format!("{:.2}", r.uptime_percent),
                })
                .collect(),
        };

        self.env
            .get_template(TEMPLATE_NAME)
            .and_then(|tpl| tpl.render(&ctx))
            .map_err(TemplateError::Execute)
    }
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
