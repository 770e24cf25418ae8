//! HTTP entrypoint: scheduler-triggered runs, health and connection probes.
//!
//! Handlers are thin. Each run builds a fresh [`Pipeline`] (and with it a
//! fresh mailbox connection) and renders the report; a failed run is still a
//! well-formed response.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use chrono::{SecondsFormat, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::pipeline::{Pipeline, ProcessingReport};

/// Default lookback for scheduled runs.
pub const DEFAULT_LOOKBACK_MINUTES: u64 = 16;

/// Default number of candidates handled by the chunk route.
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Pacing used by the chunk route.
const CHUNK_PACING: Duration = Duration::from_millis(200);

const SERVICE_NAME: &str = "inbox-triage";

/// Builds a pipeline for one run.
pub type PipelineFactory = Arc<dyn Fn(PipelineConfig) -> Pipeline + Send + Sync>;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub factory: PipelineFactory,
    /// Budget, pacing and width for the full-run route.
    pub pipeline_config: PipelineConfig,
    /// When set, cron routes require `Authorization: Bearer <secret>`.
    pub cron_secret: Option<SecretString>,
    pub credentials: CredentialSummary,
}

/// What `/api/test-connection` reveals about the configured credentials.
#[derive(Debug, Clone)]
pub struct CredentialSummary {
    pub mailbox_user: String,
    pub has_app_password: bool,
    pub has_api_key: bool,
}

/// Build the router.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/health", get(health))
        .route("/api/test-connection", get(test_connection))
        .route("/api/cron/process-emails", get(process_emails).post(process_emails))
        .route(
            "/api/cron/process-emails-chunk",
            get(process_emails_chunk).post(process_emails_chunk),
        )
        .with_state(state)
}

/// Bind `0.0.0.0:port` and serve until the process exits.
pub async fn serve(state: AppState, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "HTTP server started");
    axum::serve(listener, routes(state)).await
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── Static ──────────────────────────────────────────────────────────

const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>Inbox Triage</title></head>
<body>
<h1>Inbox Triage</h1>
<p>Classifies recent mail with a language model and files it into
<code>Needs Reply</code> and <code>Business</code> folders.</p>
<ul>
<li><code>GET /api/health</code></li>
<li><code>GET /api/test-connection</code></li>
<li><code>GET|POST /api/cron/process-emails?minutes=16</code></li>
<li><code>GET|POST /api/cron/process-emails-chunk?minutes=16&amp;chunk=10</code></li>
</ul>
</body>
</html>
"#;

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": timestamp(),
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Connection probe ────────────────────────────────────────────────

async fn test_connection(State(state): State<AppState>) -> Response {
    let pipeline = (state.factory)(state.pipeline_config.clone());
    if pipeline.test_connection().await {
        Json(serde_json::json!({
            "success": true,
            "message": "Email connection test successful",
            "timestamp": timestamp(),
            "config": {
                "gmailUser": state.credentials.mailbox_user,
                "hasAppPassword": state.credentials.has_app_password,
                "hasApiKey": state.credentials.has_api_key,
            },
        }))
        .into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "success": false,
                "error": "Email connection test failed",
                "timestamp": timestamp(),
            })),
        )
            .into_response()
    }
}

// ── Cron runs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RunParams {
    pub minutes: Option<u64>,
    pub chunk: Option<usize>,
}

async fn process_emails(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<RunParams>,
) -> Response {
    if let Some(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    let minutes = params.minutes.unwrap_or(DEFAULT_LOOKBACK_MINUTES);
    info!(minutes, "Starting scheduled email processing");

    let pipeline = (state.factory)(state.pipeline_config.clone());
    let report = pipeline.run(Duration::from_secs(minutes.saturating_mul(60))).await;
    envelope(&report, minutes, None)
}

async fn process_emails_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<RunParams>,
) -> Response {
    if let Some(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    let minutes = params.minutes.unwrap_or(DEFAULT_LOOKBACK_MINUTES);
    let chunk = params.chunk.unwrap_or(DEFAULT_CHUNK_SIZE);
    info!(minutes, chunk, "Starting chunked email processing");

    let config = PipelineConfig {
        pacing_interval: CHUNK_PACING,
        max_messages: Some(chunk),
        ..state.pipeline_config.clone()
    };
    let report = (state.factory)(config)
        .run(Duration::from_secs(minutes.saturating_mul(60)))
        .await;
    envelope(&report, minutes, Some(chunk))
}

/// Reject the request unless it carries the configured bearer secret.
fn authorize(state: &AppState, headers: &HeaderMap) -> Option<Response> {
    let secret = state.cron_secret.as_ref()?;
    let expected = format!("Bearer {}", secret.expose_secret());
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        return None;
    }
    warn!("Unauthorized cron request");
    Some(
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Unauthorized"})),
        )
            .into_response(),
    )
}

/// Render a run report. Fatal runs get `success: false` and a 500.
fn envelope(report: &ProcessingReport, minutes: u64, chunk: Option<usize>) -> Response {
    let success = !report.is_fatal();
    let mut body = serde_json::json!({
        "success": success,
        "timestamp": timestamp(),
        "duration": format!("{:.3}s", report.duration_ms as f64 / 1000.0),
        "lookbackMinutes": minutes,
        "result": {
            "runId": report.run_id,
            "state": report.state,
            "totalEmails": report.total_emails,
            "processedEmails": report.processed_emails,
            "needsReplyCount": report.needs_reply_count,
            "businessCount": report.business_count,
            "errorCount": report.errors.len(),
            "timeoutReached": report.timeout_reached,
            "remainingEmails": report.remaining_emails,
            "durationMs": report.duration_ms,
        },
    });
    if let Some(chunk) = chunk {
        body["chunkSize"] = serde_json::json!(chunk);
    }
    if !report.errors.is_empty() {
        body["errors"] = serde_json::json!(report.errors);
    }

    let status = if success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(body)).into_response()
}
