//! Local stand-in for the control plane.
//!
//! Serves the Runtime API routes the poll client uses, plus an invocation endpoint that queues a
//! payload and answers with whatever the runtime posts back for it. Invocations go through a FIFO
//! pool; responses through a pool keyed by request id, so concurrent callers each get their own.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::LocalServerConfig;
use crate::error::{ErrorDescriptor, RuntimeError};
use crate::metadata::{generate_trace_id, headers as runtime_headers};
use crate::pool::{InvocationPool, PoolError};
use crate::runtime_api::API_VERSION;
use crate::writer::{StatusAndHeaders, HTTP_INTEGRATION_CONTENT_TYPE, PRELUDE_DELIMITER};

const MAX_PAYLOAD_BYTES: usize = 20 * 1024 * 1024;
const INVOCATION_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const LOCAL_FUNCTION_ARN: &str = "arn:aws:lambda:us-east-1:012345678912:function:local";
/// Answered request ids remembered to tell a duplicate post from an unknown id.
const ANSWERED_HISTORY: usize = 1024;

#[derive(Debug, Clone)]
pub struct QueuedInvocation {
    pub request_id: String,
    pub event: Bytes,
    pub deadline_epoch_millis: i64,
    pub trace_id: String,
}

impl QueuedInvocation {
    fn new(request_id: String, event: Bytes) -> Self {
        let deadline = SystemTime::now() + INVOCATION_TIMEOUT;
        let deadline_epoch_millis = deadline
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self {
            request_id,
            event,
            deadline_epoch_millis,
            trace_id: format!("{};Sampled=0", generate_trace_id()),
        }
    }
}

/// What the runtime posted back for one invocation.
#[derive(Debug, Clone)]
pub struct LocalResponse {
    pub request_id: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Set for `/error` posts.
    pub error_type: Option<String>,
}

impl IntoResponse for LocalResponse {
    fn into_response(self) -> axum::response::Response {
        let mut headers = self.headers;
        if let Some(value) = self
            .error_type
            .as_deref()
            .and_then(|t| HeaderValue::from_str(t).ok())
        {
            headers.insert(runtime_headers::FUNCTION_ERROR_TYPE, value);
        }
        response_from_bytes(self.status, headers, self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    HandedOut,
    /// The caller stopped waiting; the runtime's answer is accepted and dropped.
    Abandoned,
}

/// Whether a `/response` or `/error` post for a request id is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acceptance {
    Deliver,
    Discard,
    NotHandedOut,
    AlreadyAnswered,
    Unknown,
}

#[derive(Debug, Default)]
struct RequestLedger {
    outstanding: HashMap<String, Phase>,
    answered: VecDeque<String>,
}

impl RequestLedger {
    fn handed_out(&mut self, request_id: &str) {
        if let Some(phase) = self.outstanding.get_mut(request_id) {
            if *phase == Phase::Queued {
                *phase = Phase::HandedOut;
            }
        }
    }

    fn answer(&mut self, request_id: &str) -> Acceptance {
        match self.outstanding.get(request_id) {
            Some(Phase::Queued) => return Acceptance::NotHandedOut,
            None if self.answered.iter().any(|id| id == request_id) => {
                return Acceptance::AlreadyAnswered
            }
            None => return Acceptance::Unknown,
            Some(_) => {}
        }
        let phase = self.outstanding.remove(request_id);
        if self.answered.len() == ANSWERED_HISTORY {
            self.answered.pop_front();
        }
        self.answered.push_back(request_id.to_string());
        match phase {
            Some(Phase::Abandoned) => Acceptance::Discard,
            _ => Acceptance::Deliver,
        }
    }

    fn abandon(&mut self, request_id: &str) {
        if let Some(phase) = self.outstanding.get_mut(request_id) {
            *phase = Phase::Abandoned;
        }
    }
}

#[derive(Clone)]
struct AppState {
    invocations: Arc<InvocationPool<QueuedInvocation>>,
    responses: Arc<InvocationPool<LocalResponse>>,
    requests: Arc<Mutex<RequestLedger>>,
    init_errors: Arc<Mutex<Vec<ErrorDescriptor>>>,
}

impl AppState {
    fn new() -> Self {
        Self {
            invocations: Arc::new(InvocationPool::new("local-invocations")),
            responses: Arc::new(InvocationPool::new("local-responses")),
            requests: Arc::new(Mutex::new(RequestLedger::default())),
            init_errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn enqueue(&self, event: Bytes) -> String {
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(request_id = %request_id, body_len = event.len(), "queued local invocation");
        self.requests
            .lock()
            .outstanding
            .insert(request_id.clone(), Phase::Queued);
        self.invocations
            .push(QueuedInvocation::new(request_id.clone(), event));
        request_id
    }

    /// Stores the runtime's answer for a handed-out request id, at most once.
    fn accept_response(&self, response: LocalResponse) -> StatusCode {
        let request_id = response.request_id.clone();
        let acceptance = self.requests.lock().answer(&request_id);
        match acceptance {
            Acceptance::Deliver => {
                self.responses.push_keyed(request_id, response);
                StatusCode::ACCEPTED
            }
            Acceptance::Discard => {
                tracing::debug!(request_id = %request_id, "caller went away, dropping response");
                StatusCode::ACCEPTED
            }
            Acceptance::AlreadyAnswered => {
                tracing::warn!(request_id = %request_id, "duplicate response for invocation");
                StatusCode::CONFLICT
            }
            Acceptance::NotHandedOut | Acceptance::Unknown => {
                tracing::warn!(
                    request_id = %request_id,
                    reason = ?acceptance,
                    "response for an invocation that is not in flight"
                );
                StatusCode::BAD_REQUEST
            }
        }
    }

    fn close(&self) {
        self.invocations.close();
        self.responses.close();
    }
}

/// Handle to a running local server. Dropping it closes the pools and stops the server.
pub struct LocalServer {
    local_addr: SocketAddr,
    invocation_endpoint: String,
    state: AppState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<std::io::Result<()>>>,
}

impl std::fmt::Debug for LocalServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalServer")
            .field("local_addr", &self.local_addr)
            .field("invocation_endpoint", &self.invocation_endpoint)
            .finish()
    }
}

impl LocalServer {
    pub async fn start(config: LocalServerConfig) -> Result<Self, RuntimeError> {
        let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
        Self::from_listener(listener, config.invocation_endpoint)
    }

    pub fn from_listener(
        listener: tokio::net::TcpListener,
        invocation_endpoint: impl Into<String>,
    ) -> Result<Self, RuntimeError> {
        let local_addr = listener.local_addr()?;
        let invocation_endpoint = invocation_endpoint.into();
        let state = AppState::new();
        let app = router(state.clone(), &invocation_endpoint);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        tracing::info!(
            addr = %local_addr,
            invocation_endpoint = %invocation_endpoint,
            "local control plane listening"
        );

        Ok(Self {
            local_addr,
            invocation_endpoint,
            state,
            shutdown_tx: Some(shutdown_tx),
            join: Some(join),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL for a [`RuntimeApiClient`](crate::runtime_api::RuntimeApiClient).
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn invoke_url(&self) -> String {
        format!("http://{}{}", self.local_addr, self.invocation_endpoint)
    }

    /// Queues an invocation and returns its request id.
    pub fn enqueue(&self, event: impl Into<Bytes>) -> String {
        self.state.enqueue(event.into())
    }

    /// Waits for the runtime's answer to `request_id`. `Ok(None)` once the server shuts down.
    pub async fn wait_for_response(
        &self,
        request_id: &str,
    ) -> Result<Option<LocalResponse>, PoolError> {
        self.state.responses.pop_next_for(request_id).await
    }

    pub async fn invoke(
        &self,
        event: impl Into<Bytes>,
    ) -> Result<Option<LocalResponse>, PoolError> {
        let request_id = self.enqueue(event);
        self.wait_for_response(&request_id).await
    }

    /// `/next` requests currently waiting for an invocation.
    pub fn waiting_pollers(&self) -> usize {
        self.state.invocations.waiter_count()
    }

    /// Errors posted to `/runtime/init/error`, oldest first.
    pub fn init_errors(&self) -> Vec<ErrorDescriptor> {
        self.state.init_errors.lock().clone()
    }

    /// Closes both pools, which unblocks pending `/next` and invoke calls, then stops serving.
    pub async fn shutdown(mut self) -> Result<(), RuntimeError> {
        self.state.close();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            join.await.map_err(std::io::Error::other)??;
        }
        tracing::debug!(addr = %self.local_addr, "local control plane stopped");
        Ok(())
    }
}

impl Drop for LocalServer {
    fn drop(&mut self) {
        self.state.close();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn router(state: AppState, invocation_endpoint: &str) -> Router {
    Router::new()
        .route(
            &format!("/{API_VERSION}/runtime/invocation/next"),
            get(handle_next),
        )
        .route(
            &format!("/{API_VERSION}/runtime/invocation/{{id}}/response"),
            post(handle_response),
        )
        .route(
            &format!("/{API_VERSION}/runtime/invocation/{{id}}/error"),
            post(handle_error),
        )
        .route(
            &format!("/{API_VERSION}/runtime/init/error"),
            post(handle_init_error),
        )
        .route(invocation_endpoint, post(handle_invoke))
        .layer(DefaultBodyLimit::max(MAX_PAYLOAD_BYTES))
        .with_state(state)
}

async fn handle_next(State(state): State<AppState>) -> Result<Response<Body>, StatusCode> {
    let Some(invocation) = state.invocations.pop_next().await else {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        return Ok(response_from_bytes(StatusCode::GONE, headers, Bytes::new()));
    };

    let mut headers = HeaderMap::new();
    let header_value = |v: &str| {
        HeaderValue::from_str(v).map_err(|err| {
            tracing::error!(error = %err, "invalid invocation header value");
            StatusCode::INTERNAL_SERVER_ERROR
        })
    };
    headers.insert(runtime_headers::REQUEST_ID, header_value(&invocation.request_id)?);
    headers.insert(
        runtime_headers::DEADLINE_MS,
        header_value(&invocation.deadline_epoch_millis.to_string())?,
    );
    headers.insert(
        runtime_headers::INVOKED_FUNCTION_ARN,
        HeaderValue::from_static(LOCAL_FUNCTION_ARN),
    );
    headers.insert(runtime_headers::TRACE_ID, header_value(&invocation.trace_id)?);

    state.requests.lock().handed_out(&invocation.request_id);
    tracing::debug!(request_id = %invocation.request_id, "handing out local invocation");
    Ok(response_from_bytes(StatusCode::OK, headers, invocation.event))
}

async fn handle_response(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let response = if content_type.eq_ignore_ascii_case(HTTP_INTEGRATION_CONTENT_TYPE) {
        split_prelude(&id, body)
    } else {
        let mut out = HeaderMap::new();
        if let Some(ct) = headers.get(header::CONTENT_TYPE) {
            out.insert(header::CONTENT_TYPE, ct.clone());
        }
        LocalResponse {
            request_id: id.clone(),
            status: StatusCode::OK,
            headers: out,
            body,
            error_type: None,
        }
    };

    tracing::debug!(request_id = %id, status = %response.status, "local invocation response");
    state.accept_response(response)
}

async fn handle_error(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let error_type = headers
        .get(runtime_headers::FUNCTION_ERROR_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    tracing::debug!(request_id = %id, error_type = ?error_type, "local invocation error");

    let mut out = HeaderMap::new();
    out.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    state.accept_response(LocalResponse {
        request_id: id,
        status: StatusCode::INTERNAL_SERVER_ERROR,
        headers: out,
        body,
        error_type,
    })
}

async fn handle_init_error(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let descriptor = serde_json::from_slice::<ErrorDescriptor>(&body).unwrap_or_else(|_| {
        let error_type = headers
            .get(runtime_headers::FUNCTION_ERROR_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(ErrorDescriptor::INITIALIZATION_ERROR);
        ErrorDescriptor::new(error_type, String::from_utf8_lossy(&body))
    });
    tracing::error!(
        error_type = %descriptor.error_type,
        error = %descriptor.error_message,
        "runtime reported an initialization error"
    );
    state.init_errors.lock().push(descriptor);
    StatusCode::ACCEPTED
}

async fn handle_invoke(State(state): State<AppState>, body: Bytes) -> axum::response::Response {
    let request_id = state.enqueue(body);
    let _caller = CallerGuard {
        state: &state,
        request_id: &request_id,
    };
    match state.responses.pop_next_for(&request_id).await {
        Ok(Some(response)) => response.into_response(),
        Ok(None) => (StatusCode::SERVICE_UNAVAILABLE, "local server is shutting down").into_response(),
        Err(err @ PoolError::DuplicateWaiter(_)) => {
            tracing::error!(request_id = %request_id, error = %err, "duplicate response waiter");
            (StatusCode::CONFLICT, err.to_string()).into_response()
        }
    }
}

/// Marks the invocation abandoned when the `/invoke` caller goes away before its answer arrives.
struct CallerGuard<'a> {
    state: &'a AppState,
    request_id: &'a str,
}

impl Drop for CallerGuard<'_> {
    fn drop(&mut self) {
        self.state.requests.lock().abandon(self.request_id);
        // An answer resolved into the dropped waiter is put back on the queue; nobody takes it.
        self.state.responses.discard_keyed(self.request_id);
    }
}

/// Splits a streamed HTTP-integration body into its prelude (status, headers, cookies) and body.
fn split_prelude(request_id: &str, body: Bytes) -> LocalResponse {
    let parsed = memchr::memmem::find(&body, &PRELUDE_DELIMITER).and_then(|at| {
        let head: StatusAndHeaders = serde_json::from_slice(&body[..at]).ok()?;
        let status = StatusCode::from_u16(head.status_code).ok()?;
        Some((head, status, body.slice(at + PRELUDE_DELIMITER.len()..)))
    });

    let Some((head, status, rest)) = parsed else {
        tracing::warn!(request_id = %request_id, "streamed response has no valid prelude");
        return LocalResponse {
            request_id: request_id.to_string(),
            status: StatusCode::BAD_GATEWAY,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"invalid streaming response prelude"),
            error_type: None,
        };
    };

    let mut headers = HeaderMap::new();
    for (name, value) in &head.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "dropping invalid prelude header"),
        }
    }
    for cookie in &head.cookies {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            headers.append(header::SET_COOKIE, value);
        }
    }

    LocalResponse {
        request_id: request_id.to_string(),
        status,
        headers,
        body: rest,
        error_type: None,
    }
}

fn response_from_bytes(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Body> {
    let mut res = Response::new(Body::from(body));
    *res.status_mut() = status;
    *res.headers_mut() = headers;
    res
}
