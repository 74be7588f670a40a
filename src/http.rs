use crate::export::ExportError;
use crate::metrics::Metrics;
use crate::model::ServerStatus;
use crate::report::ReportError;
use crate::service::{ReportService, ServiceError};
use crate::store::EventStore;
use crate::uptime::validate_window;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub service: ReportService,
    pub events: Arc<dyn EventStore>,
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SendReportRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub email: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DailyReportRequest {
    /// UTC calendar day to report on. Defaults to today.
    #[serde(default)]
    pub day: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    pub status: ServerStatus,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub fn build_router(
    metrics: Arc<Metrics>,
    service: ReportService,
    events: Arc<dyn EventStore>,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/reports", get(report_handler))
        .route("/api/reports/send", post(send_report_handler))
        .route("/api/reports/daily", post(daily_report_handler))
        .route("/api/servers/:id/events/count", get(event_count_handler))
        .with_state(HttpAppState {
            metrics,
            service,
            events,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn report_handler(
    State(state): State<HttpAppState>,
    Query(window): Query<WindowQuery>,
) -> Response {
    match state.service.generate_report(window.start, window.end).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => service_error_response(err),
    }
}

async fn send_report_handler(
    State(state): State<HttpAppState>,
    Json(req): Json<SendReportRequest>,
) -> Response {
    match state.service.send_report(req.start, req.end, &req.email).await {
        Ok(path) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "sent", "attachment": path.display().to_string() })),
        )
            .into_response(),
        Err(err) => service_error_response(err),
    }
}

async fn daily_report_handler(State(state): State<HttpAppState>, body: Bytes) -> Response {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        DailyReportRequest::default()
    } else {
        match serde_json::from_slice::<DailyReportRequest>(&body) {
            Ok(req) => req,
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {err}"))
            }
        }
    };
    let day = req.day.unwrap_or_else(|| Utc::now().date_naive());

    match state.service.send_daily_report(day).await {
        Ok(path) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "sent",
                "day": day.format("%Y-%m-%d").to_string(),
                "attachment": path.display().to_string(),
            })),
        )
            .into_response(),
        Err(err) => service_error_response(err),
    }
}

async fn event_count_handler(
    State(state): State<HttpAppState>,
    Path(server_id): Path<String>,
    Query(query): Query<CountQuery>,
) -> Response {
    if let Err(err) = validate_window(&server_id, query.start, query.end) {
        return error_response(StatusCode::BAD_REQUEST, err.to_string());
    }
    match state
        .events
        .count_in_window(&server_id, query.status, query.start, query.end)
        .await
    {
        Ok(count) => Json(json!({ "count": count })).into_response(),
        Err(err) => {
            warn!(server_id = %server_id, error = %err, "event count query failed");
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
    }
}

fn service_error_response(err: ServiceError) -> Response {
    let status = match &err {
        ServiceError::Validation(_) | ServiceError::Report(ReportError::Validation(_)) => {
            StatusCode::BAD_REQUEST
        }
        ServiceError::Report(ReportError::Inventory(_)) => StatusCode::BAD_GATEWAY,
        ServiceError::Report(ReportError::DeadlineExceeded(_)) => StatusCode::GATEWAY_TIMEOUT,
        ServiceError::Export(ExportError::Send(_)) => StatusCode::BAD_GATEWAY,
        ServiceError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %err, "report request failed");
    }
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
