//! Runtime API client: polls `/next`, hands invocations to the pool and posts their outcome back.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_TYPE, TRANSFER_ENCODING};
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorDescriptor, RuntimeError};
use crate::metadata::{headers, InvocationMetadata};
use crate::pool::InvocationPool;
use crate::writer::{
    truncation_marker, ResponseChannel, ResponseFrame, DEFAULT_STREAM_CONTENT_TYPE,
    HTTP_INTEGRATION_CONTENT_TYPE,
};

pub const API_VERSION: &str = "2018-06-01";

const USER_AGENT: &str = concat!("lambda-runtime-client/", env!("CARGO_PKG_VERSION"));

/// One unit of work handed from the poll client to the dispatch loop.
#[derive(Debug)]
pub struct Invocation {
    pub metadata: InvocationMetadata,
    pub event: Bytes,
    /// Resolution channel back to the poll client waiting on this invocation.
    pub responder: ResponseChannel,
}

#[derive(Debug)]
pub struct NextInvocation {
    pub metadata: InvocationMetadata,
    pub body: Bytes,
    /// The control plane announced it will close the connection after this invocation.
    pub going_away: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Draining,
}

/// Flag allowing a single active `run()`; released by [`RunGuard`] on every exit path.
#[derive(Debug, Clone, Default)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn acquire(&self) -> Result<RunGuard, RuntimeError> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RuntimeError::AlreadyRunning)?;
        Ok(RunGuard(self.0.clone()))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct RuntimeApiClient {
    base_url: String,
    http: reqwest::Client,
    state: Arc<Mutex<ConnectionState>>,
    running: RunFlag,
}

impl std::fmt::Debug for RuntimeApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeApiClient")
            .field("base_url", &self.base_url)
            .field("state", &self.state())
            .finish()
    }
}

impl RuntimeApiClient {
    /// `base_url` is e.g. `http://127.0.0.1:9001`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, RuntimeError> {
        let http = reqwest::Client::builder()
            .http1_only()
            .pool_max_idle_per_host(1)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            running: RunFlag::default(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut cur = self.state.lock();
        if *cur != state {
            tracing::trace!(from = ?*cur, to = ?state, "runtime api connection state");
            *cur = state;
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{API_VERSION}{path}", self.base_url)
    }

    /// Long-polls `/runtime/invocation/next` and parses the invocation metadata.
    pub async fn next_invocation(&self) -> Result<NextInvocation, RuntimeError> {
        let path = "/runtime/invocation/next";
        let resp = self.http.get(self.url(path)).send().await?;
        let status = resp.status();

        if status == StatusCode::GONE {
            self.set_state(ConnectionState::Draining);
            return Err(RuntimeError::ConnectionToControlPlaneGoingAway);
        }
        if !status.is_success() {
            return Err(RuntimeError::UnexpectedStatusCode {
                path: path.to_string(),
                status,
            });
        }

        let going_away = resp
            .headers()
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("close"));
        let metadata = InvocationMetadata::from_headers(resp.headers())?;
        let body = resp.bytes().await?;

        self.set_state(if going_away {
            ConnectionState::Draining
        } else {
            ConnectionState::Connected
        });

        Ok(NextInvocation {
            metadata,
            body,
            going_away,
        })
    }

    /// Buffered `/response` post.
    pub async fn post_response(&self, request_id: &str, body: Bytes) -> Result<(), RuntimeError> {
        let path = format!("/runtime/invocation/{request_id}/response");
        let resp = self.http.post(self.url(&path)).body(body).send().await?;
        log_rejected(&path, resp.status());
        Ok(())
    }

    /// Streaming `/response` post. The chunked body is fed from `frames` until `Finish`; an
    /// `Error` frame (or the sender going away) appends a truncation marker and ends the body.
    pub async fn post_streaming_response(
        &self,
        request_id: &str,
        prelude: Option<Bytes>,
        frames: mpsc::UnboundedReceiver<ResponseFrame>,
    ) -> Result<(), RuntimeError> {
        let path = format!("/runtime/invocation/{request_id}/response");
        let content_type = if prelude.is_some() {
            HTTP_INTEGRATION_CONTENT_TYPE
        } else {
            DEFAULT_STREAM_CONTENT_TYPE
        };

        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        tokio::spawn(forward_stream_frames(prelude, frames, tx));
        let body = UnboundedReceiverStream::new(rx).map(Ok::<Bytes, Infallible>);

        let resp = self
            .http
            .post(self.url(&path))
            .header(headers::FUNCTION_RESPONSE_MODE, "streaming")
            .header(TRANSFER_ENCODING, "chunked")
            .header(CONTENT_TYPE, content_type)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        log_rejected(&path, resp.status());
        Ok(())
    }

    /// `/error` post with the error type marker header.
    pub async fn post_error(
        &self,
        request_id: &str,
        err: &ErrorDescriptor,
    ) -> Result<(), RuntimeError> {
        let path = format!("/runtime/invocation/{request_id}/error");
        self.post_error_to(&path, err).await
    }

    /// Reports a failure that happened before any invocation was served.
    pub async fn report_init_error(&self, err: &ErrorDescriptor) -> Result<(), RuntimeError> {
        self.post_error_to("/runtime/init/error", err).await
    }

    async fn post_error_to(&self, path: &str, err: &ErrorDescriptor) -> Result<(), RuntimeError> {
        let resp = self
            .http
            .post(self.url(path))
            .header(headers::FUNCTION_ERROR_TYPE, err.error_type.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(err.to_json_bytes())
            .send()
            .await?;
        log_rejected(path, resp.status());
        Ok(())
    }

    /// Waits for the outcome of one invocation and posts it.
    async fn respond(
        &self,
        request_id: &str,
        mut frames: mpsc::UnboundedReceiver<ResponseFrame>,
    ) -> Result<(), RuntimeError> {
        match frames.recv().await {
            Some(ResponseFrame::Buffered(body)) => self.post_response(request_id, body).await,
            Some(ResponseFrame::Error(err)) => self.post_error(request_id, &err).await,
            Some(ResponseFrame::StreamStart { prelude }) => {
                self.post_streaming_response(request_id, prelude, frames)
                    .await
            }
            Some(frame @ (ResponseFrame::Chunk(_) | ResponseFrame::Finish)) => {
                tracing::warn!(request_id = %request_id, frame = ?frame, "stream frame before stream start");
                let err = ErrorDescriptor::new(
                    ErrorDescriptor::NO_RESPONSE,
                    "response stream was not started",
                );
                self.post_error(request_id, &err).await
            }
            None => {
                let err = ErrorDescriptor::new(
                    ErrorDescriptor::NO_RESPONSE,
                    "invocation completed without a response",
                );
                self.post_error(request_id, &err).await
            }
        }
    }

    /// Polls for invocations and pushes them into `pool` until `shutdown` fires, the control
    /// plane goes away, or an unrecoverable error occurs.
    ///
    /// Shutdown is only observed between invocations: an invocation already handed to the pool
    /// is always answered. A lost or closing connection ends the loop with `Ok(())`.
    pub async fn run(
        &self,
        pool: &InvocationPool<Invocation>,
        shutdown: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let _guard = self.running.acquire()?;
        let _state = StateReset(self);
        tracing::debug!(base_url = %self.base_url, "runtime api poll loop starting");

        match self.poll_loop(pool, shutdown).await {
            Err(err) if err.is_connection_closed() => {
                tracing::debug!(reason = %err, "runtime api poll loop stopped");
                Ok(())
            }
            other => other,
        }
    }

    async fn poll_loop(
        &self,
        pool: &InvocationPool<Invocation>,
        shutdown: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::debug!("shutdown requested, no further polls");
                    return Ok(());
                }
                next = self.next_invocation() => next?,
            };

            let NextInvocation {
                metadata,
                body,
                going_away,
            } = next;
            let request_id = metadata.request_id.clone();
            tracing::debug!(request_id = %request_id, body_len = body.len(), "received invocation");

            let (responder, frames) = ResponseChannel::new();
            pool.push(Invocation {
                metadata,
                event: body,
                responder,
            });
            self.respond(&request_id, frames).await?;

            if going_away {
                return Err(RuntimeError::ConnectionToControlPlaneGoingAway);
            }
        }
    }
}

/// Puts the connection state back to `Disconnected` when `run()` exits, cancellation included.
struct StateReset<'a>(&'a RuntimeApiClient);

impl Drop for StateReset<'_> {
    fn drop(&mut self) {
        self.0.set_state(ConnectionState::Disconnected);
    }
}

fn log_rejected(path: &str, status: StatusCode) {
    if !status.is_success() {
        tracing::error!(path = %path, status = %status, "runtime api rejected the request");
    }
}

/// Copies an open stream's frames into body chunks. Dropping `tx` ends the chunked body.
async fn forward_stream_frames(
    prelude: Option<Bytes>,
    mut frames: mpsc::UnboundedReceiver<ResponseFrame>,
    tx: mpsc::UnboundedSender<Bytes>,
) {
    if let Some(prelude) = prelude {
        let _ = tx.send(prelude);
    }

    loop {
        match frames.recv().await {
            Some(ResponseFrame::Chunk(chunk)) => {
                if !chunk.is_empty() {
                    let _ = tx.send(chunk);
                }
            }
            Some(ResponseFrame::Finish) => return,
            Some(ResponseFrame::Error(err)) => {
                let _ = tx.send(truncation_marker(&err));
                return;
            }
            Some(frame) => {
                tracing::warn!(frame = ?frame, "ignoring unexpected frame on an open stream");
            }
            None => {
                let err = ErrorDescriptor::new(
                    ErrorDescriptor::NO_RESPONSE,
                    "response stream dropped before finish",
                );
                let _ = tx.send(truncation_marker(&err));
                return;
            }
        }
    }
}
