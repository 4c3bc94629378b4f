//! Host process: an HTTP proxy in front of the origin.
//!
//! Every request outside `/__sw/` is turned into a worker fetch event, so
//! pages loaded through the proxy get the worker's caching and offline
//! behaviour. Routes under `/__sw/` let pages talk to the worker: messages,
//! background sync, push, notification clicks and a server-sent event
//! stream of worker signals.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use bytes::Bytes;
use futures::StreamExt;
use futures::future::ready;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::connectivity;
use crate::error::{Error, Result};
use crate::http::{Method, Request, RequestMode, Response, Url};
use crate::lifecycle::{ClientId, InstallOutcome, WorkerScript};
use crate::network::Network;
use crate::queue::{FlushResult, QueuedMutation};
use crate::store::QueueStore;
use crate::worker::{ClientMessage, ServiceWorker, WorkerStatus};

const UNFORWARDED_HEADERS: [&str; 9] = [
    "connection",
    "content-length",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

struct AppState<N: Network, S: QueueStore> {
    worker: Arc<ServiceWorker<N, S>>,
    origin: Url,
    max_body: usize,
}

impl<N: Network, S: QueueStore> Clone for AppState<N, S> {
    fn clone(&self) -> Self {
        Self {
            worker: Arc::clone(&self.worker),
            origin: self.origin.clone(),
            max_body: self.max_body,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    worker: WorkerStatus,
}

#[derive(Serialize)]
struct RegisterResponse {
    version: String,
    outcome: &'static str,
}

#[derive(Deserialize)]
struct EnqueueRequest {
    id: Option<String>,
    endpoint: Option<String>,
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct EnqueueResponse {
    id: String,
    queued: bool,
}

#[derive(Serialize)]
struct PendingMutation {
    id: String,
    endpoint: String,
    enqueued_at: chrono::DateTime<chrono::Utc>,
    attempts: u32,
    last_error: Option<String>,
    bytes: usize,
}

#[derive(Deserialize)]
struct SyncRequest {
    tag: String,
}

#[derive(Serialize)]
struct SyncResponse {
    tag: String,
    fired: bool,
    results: Vec<FlushResult>,
}

#[derive(Deserialize, Default)]
struct ClickRequest {
    action: Option<String>,
}

fn error_response(status: StatusCode, error: &Error) -> HttpResponse {
    (status, axum::Json(serde_json::json!({ "error": error.to_string() }))).into_response()
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::InvalidState(_) => StatusCode::CONFLICT,
        Error::Config(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
        Error::Http(_) | Error::Io(_) | Error::CacheWrite { .. } | Error::Delivery { .. } => {
            StatusCode::BAD_GATEWAY
        }
        Error::TomlDe(_) | Error::TomlSer(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Runs `handler` inside the worker's keep-alive scope, so it completes even
/// if the HTTP client disconnects.
async fn keep_alive<N, S, T, F, Fut>(
    worker: &Arc<ServiceWorker<N, S>>,
    handler: F,
) -> std::result::Result<T, HttpResponse>
where
    N: Network + 'static,
    S: QueueStore + 'static,
    F: FnOnce(Arc<ServiceWorker<N, S>>) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    worker
        .tracker()
        .spawn(handler(Arc::clone(worker)))
        .await
        .map_err(|e| {
            log::error!("Worker handler failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

async fn health<N: Network + 'static, S: QueueStore + 'static>(
    State(state): State<AppState<N, S>>,
) -> impl IntoResponse {
    axum::Json(HealthResponse {
        status: "ok",
        worker: state.worker.status().await,
    })
}

async fn message<N: Network + 'static, S: QueueStore + 'static>(
    State(state): State<AppState<N, S>>,
    axum::Json(message): axum::Json<ClientMessage>,
) -> HttpResponse {
    let result = keep_alive(&state.worker, |w| async move { w.message(message).await }).await;
    match result {
        Ok(Ok(Some(reply))) => axum::Json(reply).into_response(),
        Ok(Ok(None)) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => error_response(status_for(&e), &e),
        Err(response) => response,
    }
}

async fn register<N: Network + 'static, S: QueueStore + 'static>(
    State(state): State<AppState<N, S>>,
    axum::Json(script): axum::Json<WorkerScript>,
) -> HttpResponse {
    let version = script.version.clone();
    let result = keep_alive(&state.worker, |w| async move { w.register(script).await }).await;
    match result {
        Ok(Ok(outcome)) => axum::Json(RegisterResponse {
            version,
            outcome: match outcome {
                InstallOutcome::Waiting => "waiting",
                InstallOutcome::ReadyToActivate => "activated",
            },
        })
        .into_response(),
        Ok(Err(e)) => error_response(status_for(&e), &e),
        Err(response) => response,
    }
}

async fn enqueue<N: Network + 'static, S: QueueStore + 'static>(
    State(state): State<AppState<N, S>>,
    axum::Json(request): axum::Json<EnqueueRequest>,
) -> HttpResponse {
    let body = match serde_json::to_vec(&request.payload) {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.into()),
    };
    let endpoint = request
        .endpoint
        .unwrap_or_else(|| state.worker.config().sync.endpoint.clone());
    let mutation = match request.id {
        Some(id) => QueuedMutation::with_id(id, endpoint, body),
        None => QueuedMutation::new(endpoint, body),
    };
    let id = mutation.id.clone();

    let result = keep_alive(&state.worker, |w| async move { w.enqueue(mutation).await }).await;
    match result {
        Ok(Ok(queued)) => {
            (StatusCode::ACCEPTED, axum::Json(EnqueueResponse { id, queued })).into_response()
        }
        Ok(Err(e @ Error::Config(_))) => error_response(StatusCode::BAD_REQUEST, &e),
        Ok(Err(e)) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e),
        Err(response) => response,
    }
}

async fn pending<N: Network + 'static, S: QueueStore + 'static>(
    State(state): State<AppState<N, S>>,
) -> impl IntoResponse {
    let pending: Vec<PendingMutation> = state
        .worker
        .queue()
        .pending()
        .await
        .into_iter()
        .map(|m| PendingMutation {
            bytes: m.body.len(),
            id: m.id,
            endpoint: m.endpoint,
            enqueued_at: m.enqueued_at,
            attempts: m.attempts,
            last_error: m.last_error,
        })
        .collect();
    axum::Json(pending)
}

async fn sync<N: Network + 'static, S: QueueStore + 'static>(
    State(state): State<AppState<N, S>>,
    axum::Json(request): axum::Json<SyncRequest>,
) -> HttpResponse {
    let tag = request.tag;
    let fired_tag = tag.clone();
    let result =
        keep_alive(&state.worker, |w| async move { w.register_sync(&fired_tag).await }).await;
    match result {
        Ok(results) => axum::Json(SyncResponse {
            tag,
            fired: results.is_some(),
            results: results.unwrap_or_default(),
        })
        .into_response(),
        Err(response) => response,
    }
}

async fn push<N: Network + 'static, S: QueueStore + 'static>(
    State(state): State<AppState<N, S>>,
    body: String,
) -> HttpResponse {
    let result = keep_alive(&state.worker, |w| async move {
        let payload = Some(body.as_str()).filter(|text| !text.trim().is_empty());
        w.push(payload).await
    })
    .await;
    match result {
        Ok(notification) => (StatusCode::CREATED, axum::Json(notification)).into_response(),
        Err(response) => response,
    }
}

async fn notification_click<N: Network + 'static, S: QueueStore + 'static>(
    State(state): State<AppState<N, S>>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> HttpResponse {
    let request = if body.is_empty() {
        ClickRequest::default()
    } else {
        match serde_json::from_slice::<ClickRequest>(&body) {
            Ok(request) => request,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.into()),
        }
    };
    let action = request.action;
    let result = keep_alive(&state.worker, |w| async move {
        w.notification_click(id, action.as_deref()).await
    })
    .await;
    match result {
        Ok(Ok(outcome)) => axum::Json(outcome).into_response(),
        Ok(Err(e)) => error_response(StatusCode::NOT_FOUND, &e),
        Err(response) => response,
    }
}

/// Disconnects its client when the event stream is dropped.
struct ClientGuard<N: Network + 'static, S: QueueStore + 'static> {
    worker: Arc<ServiceWorker<N, S>>,
    id: ClientId,
}

impl<N: Network + 'static, S: QueueStore + 'static> Drop for ClientGuard<N, S> {
    fn drop(&mut self) {
        let worker = Arc::clone(&self.worker);
        let id = self.id;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let task = async move {
            if let Err(e) = worker.disconnect_client(id).await {
                log::error!("Activation after client {id} left failed: {e}");
            }
        };
        self.worker.tracker().spawn_on(task, &runtime);
    }
}

async fn events<N: Network + 'static, S: QueueStore + 'static>(
    State(state): State<AppState<N, S>>,
) -> impl IntoResponse {
    let worker = Arc::clone(&state.worker);
    let signals = worker.subscribe();
    let id = worker.connect_client().await;
    let guard = ClientGuard { worker, id };

    let hello = Event::default().event("connected").data(id.to_string());
    let stream = futures::stream::once(ready(Ok::<_, Infallible>(hello))).chain(
        BroadcastStream::new(signals).filter_map(move |signal| {
            let _client = &guard;
            let event = match signal {
                Ok(signal) => Event::default().event(signal.kind()).json_data(&signal).ok(),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    log::warn!("Event stream for {id} lagged, {n} signal(s) dropped");
                    None
                }
            };
            ready(event.map(Ok::<_, Infallible>))
        }),
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Returns true if `origin` is the proxy itself, as addressed by `host`.
fn is_own_origin(origin: &HeaderValue, host: Option<&str>) -> bool {
    let (Ok(origin), Some(host)) = (origin.to_str(), host) else {
        return false;
    };
    origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
        .is_some_and(|authority| authority.eq_ignore_ascii_case(host))
}

fn request_host<'a>(headers: &'a HeaderMap, uri: &'a axum::http::Uri) -> Option<&'a str> {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| uri.authority().map(axum::http::uri::Authority::as_str))
}

/// Refuses control requests sent by pages of another origin. Requests
/// without an `Origin` header (non-browser clients) pass.
async fn own_origin_only(request: axum::extract::Request, next: Next) -> HttpResponse {
    if let Some(origin) = request.headers().get(header::ORIGIN)
        && !is_own_origin(origin, request_host(request.headers(), request.uri()))
    {
        log::warn!("Refused {} {} from {origin:?}", request.method(), request.uri().path());
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(request).await
}

fn is_forwarded(name: &HeaderName) -> bool {
    !UNFORWARDED_HEADERS.contains(&name.as_str())
}

fn is_navigation(method: &Method, headers: &HeaderMap) -> bool {
    let value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    value("sec-fetch-mode") == Some("navigate")
        || (*method == Method::GET
            && value(header::ACCEPT.as_str()).is_some_and(|a| a.contains("text/html")))
}

/// Converts an incoming proxy request into a worker request for `origin`.
fn to_worker_request(origin: &Url, parts: &axum::http::request::Parts, body: Bytes) -> Request {
    let mut url = origin.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let headers: HeaderMap = parts
        .headers
        .iter()
        .filter(|(name, _)| is_forwarded(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let mode = if is_navigation(&parts.method, &parts.headers) {
        RequestMode::Navigate
    } else {
        RequestMode::SameOrigin
    };

    Request {
        url,
        method: parts.method.clone(),
        mode,
        headers,
        body: (!body.is_empty()).then_some(body),
    }
}

fn to_http_response(response: Response) -> HttpResponse {
    let mut out = HttpResponse::new(Body::from(response.body));
    *out.status_mut() = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    for (name, value) in &response.headers {
        if is_forwarded(name) {
            out.headers_mut().append(name.clone(), value.clone());
        }
    }
    out
}

async fn proxy<N: Network + 'static, S: QueueStore + 'static>(
    State(state): State<AppState<N, S>>,
    request: axum::extract::Request,
) -> HttpResponse {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.max_body).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
    };
    let request = to_worker_request(&state.origin, &parts, body);

    let result = keep_alive(&state.worker, |w| async move {
        match w.fetch(&request).await? {
            crate::fetch::FetchDecision::Respond(response) => Ok::<_, Error>(response),
            crate::fetch::FetchDecision::Ignored => w.network().fetch(&request).await,
        }
    })
    .await;

    match result {
        Ok(Ok(response)) => to_http_response(response),
        Ok(Err(e)) => {
            log::warn!("{} {}: {e}", parts.method, parts.uri);
            error_response(StatusCode::BAD_GATEWAY, &e)
        }
        Err(response) => response,
    }
}

/// Builds the proxy router for `worker`.
///
/// # Errors
///
/// Returns [`Error::Config`] if the worker's origin is not a valid URL.
pub fn router<N, S>(worker: Arc<ServiceWorker<N, S>>) -> Result<Router>
where
    N: Network + 'static,
    S: QueueStore + 'static,
{
    let state = AppState {
        origin: worker.config().worker.origin_url()?,
        max_body: worker.config().server.max_body_bytes,
        worker,
    };

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin, parts| {
            is_own_origin(origin, request_host(&parts.headers, &parts.uri))
        }))
        .allow_methods(Any)
        .allow_headers(Any);

    Ok(Router::new()
        .route("/__sw/health", get(health::<N, S>))
        .route("/__sw/message", post(message::<N, S>))
        .route("/__sw/register", post(register::<N, S>))
        .route("/__sw/queue", get(pending::<N, S>).post(enqueue::<N, S>))
        .route("/__sw/sync", post(sync::<N, S>))
        .route("/__sw/push", post(push::<N, S>))
        .route("/__sw/notifications/{id}/click", post(notification_click::<N, S>))
        .route("/__sw/events", get(events::<N, S>))
        .route_layer(middleware::from_fn(own_origin_only))
        .fallback(proxy::<N, S>)
        .layer(cors)
        .with_state(state))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
                    _ = sigterm.recv() => log::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
                log::info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Received SIGINT");
    }
}

/// Installs the configured worker until it succeeds or `cancel` fires.
async fn install_until_active<N, S>(
    worker: Arc<ServiceWorker<N, S>>,
    script: WorkerScript,
    cancel: CancellationToken,
) where
    N: Network + 'static,
    S: QueueStore + 'static,
{
    let retry = worker.config().sync.check_interval();
    loop {
        match worker.register(script.clone()).await {
            Ok(_) => return,
            Err(e) => log::warn!("Install of {} failed, retrying in {retry:?}: {e}", script.version),
        }
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(retry) => {}
        }
    }
}

/// Runs the proxy until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if the worker cannot be created or the listener cannot
/// bind.
pub async fn run(config: AppConfig) -> Result<()> {
    let script = config.worker.script()?;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address: {e}")))?;

    let worker = Arc::new(ServiceWorker::from_config(config.clone()).await?);
    let cancel = CancellationToken::new();

    let installer = tokio::spawn(install_until_active(Arc::clone(&worker), script, cancel.clone()));
    let monitor = tokio::spawn(connectivity::run(
        Arc::clone(&worker),
        config.sync.check_interval(),
        cancel.clone(),
    ));

    let app = router(Arc::clone(&worker))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Proxying {} on http://{addr}", config.worker.origin);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    for task in [installer, monitor] {
        if let Err(e) = task.await {
            log::error!("Background task failed: {e}");
        }
    }
    worker.tracker().close();
    worker.tracker().wait().await;
    log::info!("Shut down");
    Ok(())
}
