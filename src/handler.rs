//! Application logic as capability traits.
//!
//! [`StreamingHandler`] is what the dispatch loop drives. [`Handler`] is the simpler
//! request/response shape; wrap it with [`Buffered`] (or build one from a closure with
//! [`handler_fn`]) to run it.

use std::{future::Future, marker::PhantomData};

use async_trait::async_trait;
use bytes::Bytes;

use crate::metadata::Context;
use crate::writer::ResponseWriter;

/// Handler that drives the response writer itself (status/headers, chunks, finish).
///
/// Returning `Ok` without finishing lets the dispatch loop finish the response.
#[async_trait]
pub trait StreamingHandler: Send + Sync {
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        ctx: Context,
    ) -> anyhow::Result<()>;
}

/// Body returned by a [`Handler`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerOutput(pub Bytes);

impl From<()> for HandlerOutput {
    fn from(_: ()) -> Self {
        Self(Bytes::new())
    }
}

impl From<&str> for HandlerOutput {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for HandlerOutput {
    fn from(value: String) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<Vec<u8>> for HandlerOutput {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<Bytes> for HandlerOutput {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl From<serde_json::Value> for HandlerOutput {
    fn from(value: serde_json::Value) -> Self {
        Self(Bytes::from(value.to_string()))
    }
}

/// Request/response handler: one event in, one buffered body out.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, event: Bytes, ctx: Context) -> anyhow::Result<HandlerOutput>;
}

/// Runs a [`Handler`] as a [`StreamingHandler`] with a single buffered response.
#[derive(Debug, Clone)]
pub struct Buffered<H>(pub H);

#[async_trait]
impl<H: Handler> StreamingHandler for Buffered<H> {
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        ctx: Context,
    ) -> anyhow::Result<()> {
        let HandlerOutput(body) = self.0.invoke(event, ctx).await?;
        writer.write_and_finish(body).await?;
        Ok(())
    }
}

/// Closure-backed [`Handler`]. See [`handler_fn`].
pub struct HandlerFn<F, R> {
    f: F,
    _output: PhantomData<fn() -> R>,
}

/// Wrap `Fn(Bytes, Context) -> Future<Output = anyhow::Result<R>>` as a [`Handler`].
pub fn handler_fn<F, Fut, R>(f: F) -> HandlerFn<F, R>
where
    F: Fn(Bytes, Context) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<R>> + Send,
    R: Into<HandlerOutput>,
{
    HandlerFn {
        f,
        _output: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, R> Handler for HandlerFn<F, R>
where
    F: Fn(Bytes, Context) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<R>> + Send,
    R: Into<HandlerOutput>,
{
    async fn invoke(&self, event: Bytes, ctx: Context) -> anyhow::Result<HandlerOutput> {
        Ok((self.f)(event, ctx).await?.into())
    }
}
