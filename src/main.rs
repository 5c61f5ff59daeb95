use async_trait::async_trait;
use bytes::Bytes;
use lambda_runtime_client::{Context, ResponseWriter, Runtime, StatusAndHeaders, StreamingHandler};

/// Echoes the event back. Events starting with `stream:` are answered as a streamed body with an
/// HTTP-integration prelude, one chunk per comma-separated item.
struct Echo;

#[async_trait]
impl StreamingHandler for Echo {
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        ctx: Context,
    ) -> anyhow::Result<()> {
        tracing::info!(
            request_id = %ctx.request_id,
            remaining_ms = ctx.remaining_time().as_millis() as u64,
            "echo"
        );

        const STREAM_PREFIX: &[u8] = b"stream:";
        if !event.starts_with(STREAM_PREFIX) {
            writer.write_and_finish(event).await?;
            return Ok(());
        }
        let items = &event[STREAM_PREFIX.len()..];

        writer
            .write_status_and_headers(
                StatusAndHeaders::new(200).with_header("content-type", "text/plain"),
            )
            .await?;
        for item in items.split(|b| *b == b',') {
            let mut line = item.to_vec();
            line.push(b'\n');
            writer.write(line).await?;
        }
        writer.finish().await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lambda_runtime_client::logging::init();

    let runtime = Runtime::new(Echo)?;
    let shutdown = runtime.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    runtime.run().await?;
    Ok(())
}
