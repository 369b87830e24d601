//! HTTP and WebSocket surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/v1/query` | Synchronous grounded answer |
//! | `GET`    | `/v1/voice` | WebSocket upgrade for a voice session |
//! | `GET`    | `/v1/voice/sessions` | The caller tenant's live voice sessions |
//! | `POST`   | `/v1/documents/{document_id}/chunks` | Index chunks, purge the tenant cache |
//! | `DELETE` | `/v1/cache` | Purge the caller tenant's cached answers |
//! | `GET`    | `/admin/status` | Breakers, cache counters, retrieval settings |
//!
//! Caller identity comes from `x-tenant-id` / `x-user-id` headers (see
//! [`crate::auth`]). `POST /v1/query` also accepts `tenant` and `user` in the
//! body, and the voice socket accepts `?tenant=&user=&sig=`, since browsers
//! cannot set headers on a WebSocket upgrade.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "service_degraded", "message": "all providers unavailable (...)" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `rate_limited` (429),
//! `service_degraded` (503), `grounding_unavailable` (503), `internal` (500).

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{AuthError, IdentityClaims, SIGNATURE_HEADER, TENANT_HEADER, USER_HEADER};
use crate::chunk::{chunk_text, DEFAULT_CHUNK_CHARS};
use crate::error::{IndexError, QueryError};
use crate::models::{Answer, ChunkInput, Identity};
use crate::retriever::IndexReport;
use crate::service::{ServiceContext, ServiceStatus};
use crate::voice::{Inbound, ServerFrame, SessionGuard, SessionSummary, VoiceSession};

type AppState = Arc<ServiceContext>;

/// Build the HTTP application.
pub fn app(ctx: Arc<ServiceContext>) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    axum::Router::new()
        .route("/health", get(handle_health))
        .route("/v1/query", post(handle_query))
        .route("/v1/voice", get(handle_voice))
        .route("/v1/voice/sessions", get(handle_list_sessions))
        .route("/v1/documents/{document_id}/chunks", post(handle_ingest))
        .route("/v1/cache", delete(handle_purge_cache))
        .route("/admin/status", get(handle_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(ctx)
}

/// Bind `[server].bind` and serve until Ctrl+C or SIGTERM.
pub async fn run_server(ctx: Arc<ServiceContext>) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    let listener = TcpListener::bind(&bind_addr).await?;
    println!("ragline listening on http://{}", listener.local_addr()?);
    serve(listener, ctx, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, ctx: Arc<ServiceContext>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app(ctx))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable; waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"service_degraded"`).
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    retry_after_secs: Option<u64>,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            retry_after_secs: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string())
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        match &err {
            QueryError::EmptyQuery => bad_request(err.to_string()),
            QueryError::RateLimited { retry_after } => AppError {
                retry_after_secs: Some(retry_after.as_secs().max(1)),
                ..AppError::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", err.to_string())
            },
            QueryError::GroundingUnavailable(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "grounding_unavailable", err.to_string())
            }
            QueryError::Degraded(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "service_degraded", err.to_string())
            }
        }
    }
}

impl From<IndexError> for AppError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::DimensionMismatch { .. } | IndexError::InvalidChunk(_) => {
                bad_request(err.to_string())
            }
            IndexError::Embedding(_) | IndexError::Store(_) => internal(err.to_string()),
        }
    }
}

// ============ Identity ============

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Identity from headers, falling back to caller-supplied values.
fn resolve_identity(
    ctx: &ServiceContext,
    headers: &HeaderMap,
    tenant: Option<&str>,
    user: Option<&str>,
    signature: Option<&str>,
) -> Result<Identity, AppError> {
    let claims = IdentityClaims {
        tenant: header_str(headers, TENANT_HEADER).or(tenant),
        user: header_str(headers, USER_HEADER).or(user),
        signature: header_str(headers, SIGNATURE_HEADER).or(signature),
    };
    Ok(ctx.verifier.verify(&claims)?)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /v1/query ============

#[derive(Deserialize)]
struct QueryRequest {
    #[serde(default)]
    tenant: Option<String>,
    #[serde(default)]
    user: Option<String>,
    query_text: String,
}

async fn handle_query(
    State(ctx): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryRequest>,
) -> Result<Json<Answer>, AppError> {
    let identity = resolve_identity(&ctx, &headers, req.tenant.as_deref(), req.user.as_deref(), None)?;
    let answer = ctx.orchestrator.answer(&identity, &req.query_text).await?;
    Ok(Json(answer))
}

// ============ POST /v1/documents/{document_id}/chunks ============

/// Either explicit chunks or raw text to be chunked server-side.
#[derive(Deserialize)]
struct IngestRequest {
    #[serde(default)]
    chunks: Vec<ChunkBody>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    max_chars: Option<usize>,
}

#[derive(Deserialize)]
struct ChunkBody {
    chunk_id: String,
    text: String,
}

#[derive(Serialize)]
struct IngestResponse {
    document_id: String,
    #[serde(flatten)]
    report: IndexReport,
}

async fn handle_ingest(
    State(ctx): State<AppState>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    let identity = resolve_identity(&ctx, &headers, None, None, None)?;
    if document_id.trim().is_empty() {
        return Err(bad_request("document_id must not be empty"));
    }

    let chunks: Vec<ChunkInput> = match (req.text, req.chunks.is_empty()) {
        (Some(text), true) => chunk_text(
            &document_id,
            &text,
            req.max_chars.unwrap_or(DEFAULT_CHUNK_CHARS),
        ),
        (None, false) => req
            .chunks
            .into_iter()
            .map(|c| ChunkInput {
                document_id: document_id.clone(),
                chunk_id: c.chunk_id,
                text: c.text,
            })
            .collect(),
        _ => return Err(bad_request("provide exactly one of `chunks` or `text`")),
    };
    if chunks.is_empty() {
        return Err(bad_request("document contains no text"));
    }

    let report = ctx.orchestrator.ingest(&identity.tenant_id, chunks).await?;
    info!(
        tenant = %identity.tenant_id,
        document = %document_id,
        inserted = report.inserted,
        superseded = report.superseded,
        unchanged = report.unchanged,
        "document indexed"
    );
    Ok(Json(IngestResponse {
        document_id,
        report,
    }))
}

// ============ DELETE /v1/cache ============

#[derive(Serialize)]
struct PurgeResponse {
    removed: usize,
}

async fn handle_purge_cache(
    State(ctx): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<PurgeResponse>, AppError> {
    let identity = resolve_identity(&ctx, &headers, None, None, None)?;
    let removed = ctx.orchestrator.purge_cache(&identity.tenant_id).await;
    Ok(Json(PurgeResponse { removed }))
}

// ============ GET /admin/status ============

async fn handle_status(State(ctx): State<AppState>) -> Json<ServiceStatus> {
    Json(ctx.status().await)
}

// ============ GET /v1/voice/sessions ============

#[derive(Serialize)]
struct SessionListResponse {
    sessions: Vec<SessionSummary>,
}

async fn handle_list_sessions(
    State(ctx): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionListResponse>, AppError> {
    let identity = resolve_identity(&ctx, &headers, None, None, None)?;
    Ok(Json(SessionListResponse {
        sessions: ctx.sessions.list(&identity.tenant_id),
    }))
}

// ============ GET /v1/voice (WebSocket) ============

#[derive(Deserialize, Default)]
struct VoiceParams {
    tenant: Option<String>,
    user: Option<String>,
    sig: Option<String>,
}

/// Authenticates before upgrading; a rejected caller never gets a socket.
async fn handle_voice(
    State(ctx): State<AppState>,
    Query(params): Query<VoiceParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let identity = resolve_identity(
        &ctx,
        &headers,
        params.tenant.as_deref(),
        params.user.as_deref(),
        params.sig.as_deref(),
    )?;
    let guard = ctx.sessions.register(identity);
    // base64 inflates audio by a third; leave room for the JSON envelope.
    let max_message = ctx.voice.max_utterance_bytes / 3 * 4 + 4096;

    Ok(ws
        .max_message_size(max_message)
        .on_upgrade(move |socket| run_voice_socket(ctx, guard, socket)))
}

async fn run_voice_socket(ctx: AppState, guard: SessionGuard, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (in_tx, in_rx) = mpsc::channel::<Inbound>(32);
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(32);

    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let event = match message {
                Ok(Message::Text(text)) => Inbound::parse(text.as_str()),
                Ok(Message::Binary(_)) => {
                    Inbound::Malformed("binary messages are not supported; send JSON text frames".into())
                }
                Ok(Message::Close(_)) | Err(_) => Inbound::Disconnected,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            };
            let disconnected = matches!(event, Inbound::Disconnected);
            if in_tx.send(event).await.is_err() || disconnected {
                break;
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode voice frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let mut session = VoiceSession::new(
        guard,
        Arc::clone(&ctx.orchestrator),
        Arc::clone(&ctx.stt),
        ctx.voice.clone(),
    );
    session.serve(in_rx, out_tx).await;

    // Outbound senders are gone; let the writer drain what is queued.
    let _ = writer.await;
    reader.abort();
    session.finish();
}
