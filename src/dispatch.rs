//! Dispatch loop: pulls invocations off the pool and runs the handler on each, one at a time.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use bytes::Bytes;
use futures::FutureExt as _;
use tracing::Instrument as _;

use crate::error::{ErrorDescriptor, RuntimeError};
use crate::handler::StreamingHandler;
use crate::metadata::Context;
use crate::pool::InvocationPool;
use crate::runtime_api::Invocation;
use crate::writer::ResponseWriter;

/// Bytes of the event logged at trace level.
const EVENT_PREVIEW_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// The handler returned `Ok` and the response was finished.
    Completed,
    /// The handler failed or panicked; an error was reported if the writer was still open.
    Failed,
}

#[derive(Debug)]
pub struct DispatchLoop<H> {
    handler: H,
}

impl<H: StreamingHandler> DispatchLoop<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Runs until the pool is closed and drained, or the poll client goes away.
    pub async fn run(&self, pool: &InvocationPool<Invocation>) -> Result<(), RuntimeError> {
        while let Some(invocation) = pool.pop_next().await {
            match self.dispatch(invocation).await {
                Ok(_) => {}
                Err(err) if err.is_connection_closed() => {
                    tracing::debug!(reason = %err, "dispatch loop stopped");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        tracing::debug!(pool = pool.name(), "invocation pool closed");
        Ok(())
    }

    /// Runs the handler for one invocation. Handler errors and panics become reported errors;
    /// only failures to deliver the outcome are returned.
    pub async fn dispatch(&self, invocation: Invocation) -> Result<InvocationOutcome, RuntimeError> {
        let Invocation {
            metadata,
            event,
            responder,
        } = invocation;
        let span = tracing::info_span!("invocation", request_id = %metadata.request_id);

        async move {
            log_event_preview(&event);
            let ctx = Context::from(&metadata);
            let mut writer = ResponseWriter::new(metadata.request_id, responder);

            let result = AssertUnwindSafe(self.handler.handle(event, &mut writer, ctx))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(())) => {
                    if !writer.state().is_terminal() {
                        writer.finish().await?;
                    }
                    tracing::debug!("invocation completed");
                    Ok(InvocationOutcome::Completed)
                }
                Ok(Err(err)) => {
                    // Only a closed channel stops the loop, whatever the error says.
                    if writer.is_closed() {
                        tracing::debug!(
                            error = %format!("{err:#}"),
                            "response channel closed during handler"
                        );
                        return Err(RuntimeError::ConnectionToControlPlaneLost);
                    }
                    tracing::warn!(error = %format!("{err:#}"), "handler returned an error");
                    report(&mut writer, ErrorDescriptor::function_error(&err)).await?;
                    Ok(InvocationOutcome::Failed)
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(panic = %message, "handler panicked");
                    let desc = ErrorDescriptor::new(ErrorDescriptor::HANDLER_PANIC, message);
                    report(&mut writer, desc).await?;
                    Ok(InvocationOutcome::Failed)
                }
            }
        }
        .instrument(span)
        .await
    }
}

async fn report(writer: &mut ResponseWriter, desc: ErrorDescriptor) -> Result<(), RuntimeError> {
    if writer.state().is_terminal() {
        tracing::warn!(
            error_type = %desc.error_type,
            "response already finished, dropping error"
        );
        return Ok(());
    }
    writer.report_error(desc).await
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn log_event_preview(event: &Bytes) {
    if tracing::enabled!(tracing::Level::TRACE) {
        let end = event.len().min(EVENT_PREVIEW_LEN);
        let ellipsis = if end < event.len() { "..." } else { "" };
        let preview = format!("{}{ellipsis}", String::from_utf8_lossy(&event[..end]));
        tracing::trace!(
            event_len = event.len(),
            preview = %preview,
            "invocation event"
        );
    }
}
