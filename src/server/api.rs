//! HTTP handlers and shared application state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use serde::Deserialize;
use serde_json::{Value, json};

use url::Url;

use crate::config::ServerConfig;
use crate::errors::FetchError;
use crate::fetch;
use crate::jobs::{JobId, JobStore, ProgressEvent};
use crate::manifest::{DerivedOptions, derive_options, fetch_manifest};
use crate::options::{BuildOptions, BuildRequest};
use crate::pipeline::{self, Toolchain};
use crate::ssrf::ensure_public_url;
use crate::token::TokenIssuer;

const NOT_READY: &str = "build not found or expired";

/// Everything the handlers share. Constructed once at startup.
pub struct AppState {
    pub store: JobStore,
    pub issuer: TokenIssuer,
    pub toolchain: Arc<dyn Toolchain>,
    pub client: reqwest::Client,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: ServerConfig, toolchain: Arc<dyn Toolchain>) -> SharedState {
        Arc::new(AppState {
            store: JobStore::new(config.job_ttl),
            issuer: TokenIssuer::new(config.token_secret.clone()),
            toolchain,
            client: fetch::client(),
            config: Arc::new(config),
            started_at: Instant::now(),
        })
    }
}

/// Uniform error envelope: every failure renders as `{"error": message}`
/// with the matching status code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(&'static str),
    Capacity(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.to_string()),
            ApiError::Capacity(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Blocked { .. } => ApiError::Forbidden(err.to_string()),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn issue_token(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "token": state.issuer.generate() }))
}

#[derive(Debug, Deserialize)]
pub struct ManifestQuery {
    pub url: String,
}

/// Resolve a PWA manifest and return form-prefill defaults.
pub async fn resolve_manifest(
    State(state): State<SharedState>,
    Json(query): Json<ManifestQuery>,
) -> Result<Json<DerivedOptions>, ApiError> {
    let (manifest, manifest_url) = fetch_manifest(
        &state.client,
        &query.url,
        state.config.fetch_timeout,
        state.config.dev_mode,
    )
    .await?;
    Ok(Json(derive_options(&manifest, &manifest_url)))
}

/// Admit a build: token, then field validation, then the concurrency cap.
/// On success the pipeline runs in a spawned task and the job id comes back
/// immediately with 202.
pub async fn create_build(
    State(state): State<SharedState>,
    Json(request): Json<BuildRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if !state.issuer.verify(&request.token) {
        return Err(ApiError::Forbidden(
            "invalid or expired build token; reload the page and retry".to_string(),
        ));
    }

    let options = request
        .validate(state.config.dev_mode)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    // Every fetch target is gated here, synchronously, so a private-host
    // request is refused before a job exists.
    ensure_public_targets(&options, state.config.dev_mode)?;

    if state.store.count_active() >= state.config.max_concurrent {
        return Err(ApiError::Capacity("server busy, retry shortly"));
    }

    let job_id = state.store.create(options.clone());
    state
        .store
        .emit(job_id, ProgressEvent::log("Build queued", Some(0)));
    eprintln!("[server] job_id={} accepted for {}", job_id, options.url);

    tokio::spawn(pipeline::launch(
        state.store.clone(),
        state.toolchain.clone(),
        state.client.clone(),
        state.config.clone(),
        job_id,
        options,
    ));

    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

fn ensure_public_targets(options: &BuildOptions, allow_private: bool) -> Result<(), ApiError> {
    let targets = [
        Some(options.url.as_str()),
        Some(options.icon_url.as_str()),
        options.maskable_icon_url.as_deref(),
    ];
    for target in targets.into_iter().flatten() {
        let url = Url::parse(target).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        ensure_public_url(&url, allow_private)?;
    }
    Ok(())
}

/// Unsubscribes when the stream is dropped, whether it ended normally or
/// the client went away.
struct Subscription {
    store: JobStore,
    job_id: JobId,
    subscriber_id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.store.unsubscribe(self.job_id, self.subscriber_id);
    }
}

/// SSE progress stream: full history replay, then live events, ending after
/// the terminal event. Heartbeat comments keep idle proxies from cutting
/// the connection.
pub async fn stream_progress(
    State(state): State<SharedState>,
    Path(job_id): Path<JobId>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let (subscriber_id, rx) = state
        .store
        .subscribe(job_id)
        .ok_or(ApiError::NotFound(NOT_READY))?;
    let subscription = Subscription {
        store: state.store.clone(),
        job_id,
        subscriber_id,
    };

    let stream = futures::stream::unfold(
        (rx, subscription, false),
        |(mut rx, subscription, done)| async move {
            if done {
                return None;
            }
            let event = rx.recv().await?;
            let terminal = event.is_terminal();
            Some((
                Event::default().json_data(&event),
                (rx, subscription, terminal),
            ))
        },
    );

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}

/// Hand the signed APK to the client, then delete the job and its working
/// directory. One download per build.
pub async fn download(
    State(state): State<SharedState>,
    Path(job_id): Path<JobId>,
) -> Result<Response, ApiError> {
    // Claiming removes the job atomically, so concurrent requests for the
    // same artifact race for exactly one winner.
    let (artifact_path, file_name, work_dir) = state
        .store
        .take_artifact(job_id)
        .ok_or(ApiError::NotFound(NOT_READY))?;

    let bytes = tokio::fs::read(&artifact_path).await;
    if let Some(dir) = work_dir {
        let _ = tokio::fs::remove_dir_all(dir).await;
    }
    let bytes = bytes.map_err(|_| ApiError::NotFound(NOT_READY))?;

    let headers = [
        (
            header::CONTENT_TYPE,
            "application/vnd.android.package-archive".to_string(),
        ),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_name),
        ),
    ];
    Ok((headers, bytes).into_response())
}
