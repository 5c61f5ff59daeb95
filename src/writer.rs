//! Per-invocation response writer.
//!
//! The writer never touches the network. It turns the handler's calls into [`ResponseFrame`]s
//! on the invocation's [`ResponseChannel`], and the poll client turns those frames into the
//! `/response` or `/error` post. The state machine enforces the ordering regardless of how the
//! handler drives it:
//!
//! ```text
//! NotStarted -> HeadersSent -> Streaming -> Finished
//!      \____________\______________\_____> ErrorReported
//! ```

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ErrorDescriptor, RuntimeError};

/// Content type of a streamed body that starts with a status/headers prelude.
pub const HTTP_INTEGRATION_CONTENT_TYPE: &str =
    "application/vnd.awslambda.http-integration-response";
/// Content type of a streamed body without prelude.
pub const DEFAULT_STREAM_CONTENT_TYPE: &str = "application/octet-stream";
/// Separates the JSON prelude from the body.
pub const PRELUDE_DELIMITER: [u8; 8] = [0u8; 8];
/// Starts the trailing marker appended when an error is reported after the body started.
pub const TRUNCATION_MARKER: &[u8] = b"\n<lambda-runtime-error>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    /// Whole response in one buffer (non-streaming `/response`).
    Buffered(Bytes),
    /// Error outcome. Before a stream starts this becomes an `/error` post; after, a truncation
    /// marker on the open stream.
    Error(ErrorDescriptor),
    /// Opens a streaming `/response`, optionally with an encoded status/headers prelude.
    StreamStart { prelude: Option<Bytes> },
    Chunk(Bytes),
    Finish,
}

/// Sending half of an invocation's resolution channel.
#[derive(Debug, Clone)]
pub struct ResponseChannel {
    tx: mpsc::UnboundedSender<ResponseFrame>,
}

impl ResponseChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResponseFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Never blocks. Fails when the poll client has gone away.
    pub fn send(&self, frame: ResponseFrame) -> Result<(), RuntimeError> {
        self.tx
            .send(frame)
            .map_err(|_| RuntimeError::ConnectionToControlPlaneLost)
    }

    /// True once the receiving side (the poll client) is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Status code and headers sent ahead of a streamed body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusAndHeaders {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<String>,
}

impl StatusAndHeaders {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            cookies: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// JSON prelude followed by the 8-byte NUL delimiter.
    pub fn encode_prelude(&self) -> Result<Bytes, RuntimeError> {
        let json = serde_json::to_vec(self)?;
        let mut out = BytesMut::with_capacity(json.len() + PRELUDE_DELIMITER.len());
        out.put_slice(&json);
        out.put_slice(&PRELUDE_DELIMITER);
        Ok(out.freeze())
    }
}

/// Truncation marker carrying the error descriptor, appended to an already-started stream.
pub fn truncation_marker(err: &ErrorDescriptor) -> Bytes {
    let mut out = BytesMut::from(TRUNCATION_MARKER);
    out.put_slice(&err.to_json_bytes());
    out.put_u8(b'\n');
    out.freeze()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    NotStarted,
    HeadersSent,
    Streaming,
    Finished,
    ErrorReported,
}

impl WriterState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WriterState::Finished | WriterState::ErrorReported)
    }
}

/// Response writer handed to the handler for one invocation.
#[derive(Debug)]
pub struct ResponseWriter {
    request_id: String,
    channel: ResponseChannel,
    state: WriterState,
}

impl ResponseWriter {
    pub fn new(request_id: impl Into<String>, channel: ResponseChannel) -> Self {
        Self {
            request_id: request_id.into(),
            channel,
            state: WriterState::NotStarted,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Commits status and headers. Only legal before anything else was written.
    pub async fn write_status_and_headers(
        &mut self,
        head: StatusAndHeaders,
    ) -> Result<(), RuntimeError> {
        match self.state {
            WriterState::NotStarted => {}
            WriterState::HeadersSent | WriterState::Streaming => {
                return Err(RuntimeError::HeadersAlreadySent)
            }
            WriterState::Finished | WriterState::ErrorReported => {
                return Err(RuntimeError::WriteAfterFinish)
            }
        }

        let prelude = head.encode_prelude()?;
        self.channel.send(ResponseFrame::StreamStart {
            prelude: Some(prelude),
        })?;
        self.state = WriterState::HeadersSent;
        Ok(())
    }

    /// Streams one body chunk. Without a prior [`write_status_and_headers`](Self::write_status_and_headers)
    /// the stream starts with default headers.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), RuntimeError> {
        match self.state {
            WriterState::NotStarted => {
                self.channel
                    .send(ResponseFrame::StreamStart { prelude: None })?;
            }
            WriterState::HeadersSent | WriterState::Streaming => {}
            WriterState::Finished | WriterState::ErrorReported => {
                return Err(RuntimeError::WriteAfterFinish)
            }
        }

        self.state = WriterState::Streaming;
        self.channel.send(ResponseFrame::Chunk(chunk.into()))
    }

    /// Ends the response. Finishing an untouched writer sends an empty buffered response.
    pub async fn finish(&mut self) -> Result<(), RuntimeError> {
        let frame = match self.state {
            WriterState::NotStarted => ResponseFrame::Buffered(Bytes::new()),
            WriterState::HeadersSent | WriterState::Streaming => ResponseFrame::Finish,
            WriterState::Finished | WriterState::ErrorReported => {
                return Err(RuntimeError::FinishAfterFinish)
            }
        };

        self.state = WriterState::Finished;
        self.channel.send(frame)
    }

    /// Sends `body` and ends the response. On an untouched writer this is a plain buffered
    /// (non-streaming) response.
    pub async fn write_and_finish(&mut self, body: impl Into<Bytes>) -> Result<(), RuntimeError> {
        match self.state {
            WriterState::NotStarted => {
                self.state = WriterState::Finished;
                self.channel.send(ResponseFrame::Buffered(body.into()))
            }
            WriterState::HeadersSent | WriterState::Streaming => {
                self.write(body).await?;
                self.finish().await
            }
            WriterState::Finished | WriterState::ErrorReported => {
                Err(RuntimeError::WriteAfterFinish)
            }
        }
    }

    /// Reports a failure for this invocation. Always ends in a terminal response: an `/error`
    /// post if nothing was streamed yet, a truncation marker otherwise.
    pub async fn report_error(&mut self, err: ErrorDescriptor) -> Result<(), RuntimeError> {
        if self.state.is_terminal() {
            return Err(RuntimeError::WriteAfterFinish);
        }

        self.state = WriterState::ErrorReported;
        self.channel.send(ResponseFrame::Error(err))
    }
}
