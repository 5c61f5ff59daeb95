//! Error taxonomy for the runtime client.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::PoolError;

/// Required `/next` headers. Each one missing maps to a distinct error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    RequestId,
    Deadline,
    InvokedFunctionArn,
}

impl fmt::Display for HeaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeaderKind::RequestId => crate::metadata::headers::REQUEST_ID,
            HeaderKind::Deadline => crate::metadata::headers::DEADLINE_MS,
            HeaderKind::InvokedFunctionArn => crate::metadata::headers::INVOKED_FUNCTION_ARN,
        })
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("next invocation is missing required header {0}")]
    MissingHeader(HeaderKind),

    #[error("unexpected status {status} for {path}")]
    UnexpectedStatusCode { path: String, status: http::StatusCode },

    #[error("connection to the control plane was lost")]
    ConnectionToControlPlaneLost,

    #[error("control plane is closing the connection")]
    ConnectionToControlPlaneGoingAway,

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("status and headers have already been sent")]
    HeadersAlreadySent,

    #[error("write after the response has been finished")]
    WriteAfterFinish,

    #[error("finish after the response has been finished")]
    FinishAfterFinish,

    #[error("the runtime is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("invalid runtime api endpoint ({0})")]
    InvalidEndpoint(String),

    #[error("invalid port ({0})")]
    InvalidPort(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("initialization failed: {0}")]
    Init(#[source] anyhow::Error),
}

impl RuntimeError {
    /// True for the "peer is going away" / "connection lost" class, which ends the poll loop
    /// quietly instead of failing the process.
    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            RuntimeError::ConnectionToControlPlaneLost
                | RuntimeError::ConnectionToControlPlaneGoingAway
        )
    }
}

impl From<reqwest::Error> for RuntimeError {
    fn from(err: reqwest::Error) -> Self {
        if is_connection_lost(&err) {
            RuntimeError::ConnectionToControlPlaneLost
        } else {
            RuntimeError::Transport(err)
        }
    }
}

/// Walks the source chain looking for a dropped connection (as opposed to e.g. a refused connect).
fn is_connection_lost(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::NotConnected
            ) {
                return true;
            }
        }
        if let Some(h) = e.downcast_ref::<hyper::Error>() {
            if h.is_incomplete_message() || h.is_closed() || h.is_canceled() {
                return true;
            }
        }
        cur = e.source();
    }
    false
}

/// Body of an `/error` or `/init/error` post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    #[serde(rename = "errorType")]
    pub error_type: String,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
}

impl ErrorDescriptor {
    pub const FUNCTION_ERROR: &'static str = "FunctionError";
    pub const INITIALIZATION_ERROR: &'static str = "InitializationError";
    pub const HANDLER_PANIC: &'static str = "Runtime.HandlerPanic";
    pub const NO_RESPONSE: &'static str = "Runtime.NoResponse";

    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
        }
    }

    pub fn function_error(err: &anyhow::Error) -> Self {
        Self::new(Self::FUNCTION_ERROR, format!("{err:#}"))
    }

    pub fn to_json_bytes(&self) -> bytes::Bytes {
        bytes::Bytes::from(serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec()))
    }
}
