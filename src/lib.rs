//! Custom runtime client for the Lambda Runtime API.
//!
//! A [`Runtime`] runs two loops side by side: the [`RuntimeApiClient`] long-polls
//! `/runtime/invocation/next` and pushes each invocation into an [`InvocationPool`], and the
//! [`DispatchLoop`] pops them, runs the handler and hands the outcome back through the
//! invocation's [`ResponseChannel`]. Responses are buffered or streamed (with an optional
//! status/headers prelude) depending on how the handler drives its [`ResponseWriter`].
//!
//! Without `AWS_LAMBDA_RUNTIME_API` the runtime starts a [`LocalServer`] that speaks the same
//! protocol and accepts invocations on a local HTTP endpoint.
//!
//! ```no_run
//! use bytes::Bytes;
//! use lambda_runtime_client::{handler_fn, Buffered, Context};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), lambda_runtime_client::RuntimeError> {
//!     let handler = Buffered(handler_fn(|event: Bytes, _ctx: Context| async move {
//!         Ok::<_, anyhow::Error>(event)
//!     }));
//!     lambda_runtime_client::run(handler).await
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod local_server;
pub mod logging;
pub mod metadata;
pub mod pool;
pub mod runtime;
pub mod runtime_api;
pub mod writer;

pub use config::{Config, LocalServerConfig};
pub use dispatch::{DispatchLoop, InvocationOutcome};
pub use error::{ErrorDescriptor, HeaderKind, RuntimeError};
pub use handler::{handler_fn, Buffered, Handler, HandlerFn, HandlerOutput, StreamingHandler};
pub use local_server::{LocalResponse, LocalServer};
pub use metadata::{Context, InvocationMetadata};
pub use pool::{InvocationPool, PoolError};
pub use runtime::{run, run_with_init, Runtime};
pub use runtime_api::{ConnectionState, Invocation, RuntimeApiClient};
pub use writer::{ResponseChannel, ResponseFrame, ResponseWriter, StatusAndHeaders, WriterState};
