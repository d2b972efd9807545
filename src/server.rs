use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    prober::{Prober, TcpProber},
    session::{ScanSession, SessionError},
    types::{ScanOptions, SessionState, SessionUpdate, Target},
    validate::{validate, ValidationError},
};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>, // the current (or last) session
}

struct ServerState {
    session: ScanSession,
    prober: Arc<dyn Prober>,
}

impl AppState {
    pub fn new() -> Self {
        Self::with_prober(Arc::new(TcpProber))
    }

    pub fn with_prober(prober: Arc<dyn Prober>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState {
                session: ScanSession::with_prober(ScanOptions::default(), prober.clone()),
                prober,
            })),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: SessionState,
    pub total: usize,
    pub scanned: usize,
}

/// Raw form fields. Any JSON type is accepted so that type mistakes are reported by
/// the validator with the offending field, not by the body extractor.
#[derive(Debug, Deserialize)]
pub struct TargetRequest {
    #[serde(default)]
    pub host: Value,
    #[serde(default)]
    pub start_port: Value,
    #[serde(default)]
    pub end_port: Value,
}

impl TargetRequest {
    fn validate(&self) -> Result<Target, ValidationError> {
        validate(
            &field_input(&self.host),
            &field_input(&self.start_port),
            &field_input(&self.end_port),
        )
    }
}

/// Text handed to the validator: strings as-is, numbers and everything else as JSON text.
fn field_input(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    #[serde(flatten)]
    pub target: TargetRequest,
    #[serde(flatten)]
    pub options: ScanOptions,
}

/// API routes under `/api`, plus an optional static directory as fallback.
pub fn router(state: AppState, ui_dir: Option<PathBuf>) -> Router {
    let api = Router::new()
        .route("/validate", post(post_validate))
        .route("/scan", post(post_scan))
        .route("/cancel", post(post_cancel))
        .route("/status", get(get_status))
        .route("/results", get(get_results))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state);

    let mut app = Router::new().nest("/api", api);
    if let Some(dir) = ui_dir {
        app = app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
    }
    app.layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, ui_dir: Option<PathBuf>) -> Result<()> {
    let app = router(AppState::new(), ui_dir);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(%bind, "serving scan API on http://{bind}/api");
    axum::serve(listener, app).await.context("http server failed")?;
    Ok(())
}

async fn post_validate(Json(req): Json<TargetRequest>) -> Response {
    match req.validate() {
        Ok(target) => (StatusCode::OK, Json(target)).into_response(),
        Err(e) => (StatusCode::UNPROCESSABLE_ENTITY, Json(e)).into_response(),
    }
}

/// Start a scan and stream one NDJSON line per resolved port, then the terminal report.
async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequest>) -> Response {
    let mut s = app.inner.write().await;
    if s.session.state() == SessionState::Running {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": SessionError::AlreadyRunning.to_string() })),
        )
            .into_response();
    }

    let target = match req.target.validate() {
        Ok(target) => target,
        Err(e) => return (StatusCode::UNPROCESSABLE_ENTITY, Json(e)).into_response(),
    };

    let session = ScanSession::with_prober(req.options, s.prober.clone());
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let tx = Mutex::new(Some(tx));
    session.subscribe(move |update| {
        let mut guard = tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return;
        };
        match serde_json::to_string(update) {
            Ok(mut line) => {
                line.push('\n');
                let _ = sender.send(line);
            }
            Err(e) => warn!(error = %e, "failed to encode scan update"),
        }
        if matches!(update, SessionUpdate::Finished(_)) {
            // Dropping the sender ends the response stream.
            guard.take();
        }
    });

    let started = session.start_target(target);
    s.session = session;
    drop(s);

    match started {
        Ok(_) => {}
        Err(SessionError::Validation(e)) => {
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(e)).into_response();
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    }

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|line| (Ok::<_, Infallible>(line), rx))
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn post_cancel(State(app): State<AppState>) -> impl IntoResponse {
    app.inner.read().await.session.cancel();
    StatusCode::ACCEPTED
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    let (scanned, total) = s.session.progress();
    let out = Status {
        state: s.session.state(),
        total,
        scanned,
    };
    (StatusCode::OK, Json(out))
}

async fn get_results(State(app): State<AppState>) -> Response {
    let s = app.inner.read().await;
    if let Some(report) = s.session.report() {
        (StatusCode::OK, Json(report)).into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}
