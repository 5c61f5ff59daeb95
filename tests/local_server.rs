use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lambda_runtime_client::{
    handler_fn, Buffered, Config, Context, ErrorDescriptor, LocalServer, LocalServerConfig,
    ResponseWriter, Runtime, RuntimeApiClient, RuntimeError, StatusAndHeaders, StreamingHandler,
};
use tokio::sync::Notify;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Behaviour picked by the event: `fail`, `lost`, `panic`, `stream`, `stream-fail`,
/// `sleep:<ms>:<tag>`, anything else is echoed.
struct TestHandler;

#[async_trait]
impl StreamingHandler for TestHandler {
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        _ctx: Context,
    ) -> anyhow::Result<()> {
        let text = String::from_utf8_lossy(&event).into_owned();
        match text.as_str() {
            "fail" => anyhow::bail!("requested failure"),
            "lost" => return Err(RuntimeError::ConnectionToControlPlaneLost.into()),
            "panic" => panic!("requested panic"),
            "stream" | "stream-fail" => {
                writer
                    .write_status_and_headers(
                        StatusAndHeaders::new(418).with_header("x-my-custom-header", "yes"),
                    )
                    .await?;
                writer.write("Number: 1\n").await?;
                if text == "stream-fail" {
                    anyhow::bail!("failed mid-stream");
                }
                writer.write("Number: 2\n").await?;
                writer.finish().await?;
            }
            other => {
                if let Some(rest) = other.strip_prefix("sleep:") {
                    let (ms, tag) = rest.split_once(':').unwrap_or((rest, ""));
                    let ms: u64 = ms.parse()?;
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    writer.write_and_finish(format!("echo:{tag}")).await?;
                } else {
                    writer.write_and_finish(event).await?;
                }
            }
        }
        Ok(())
    }
}

async fn start_server() -> LocalServer {
    LocalServer::start(LocalServerConfig::ephemeral())
        .await
        .unwrap()
}

#[tokio::test]
async fn ping_pong_round_trip() {
    let server = start_server().await;
    let client = RuntimeApiClient::new(server.base_url()).unwrap();
    let runtime = Runtime::with_config(
        Buffered(handler_fn(|event: Bytes, _ctx: Context| async move {
            assert_eq!(event, Bytes::from_static(b"ping"));
            Ok::<_, anyhow::Error>("pong")
        })),
        Config::local(),
    );
    let shutdown = runtime.shutdown_token();

    let (run, (request_id, response)) = tokio::join!(runtime.run_with_client(&client), async {
        let request_id = server.enqueue("ping");
        let response = tokio::time::timeout(TIMEOUT, server.wait_for_response(&request_id))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        shutdown.cancel();
        (request_id, response)
    });

    run.unwrap();
    assert_eq!(response.request_id, request_id);
    assert_eq!(response.status, reqwest::StatusCode::OK);
    assert_eq!(response.body, Bytes::from_static(b"pong"));
    assert!(response.error_type.is_none());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn invoke_endpoint_matches_concurrent_callers() {
    let server = start_server().await;
    let client = RuntimeApiClient::new(server.base_url()).unwrap();
    let runtime = Runtime::with_config(TestHandler, Config::local());
    let shutdown = runtime.shutdown_token();
    let invoke_url = server.invoke_url();

    let (run, bodies) = tokio::join!(runtime.run_with_client(&client), async {
        let http = reqwest::Client::new();
        let calls = (0..5).map(|i| {
            let http = http.clone();
            let url = invoke_url.clone();
            async move {
                let res = http
                    .post(url)
                    .body(format!("sleep:{}:{i}", (5 - i) * 10))
                    .send()
                    .await
                    .unwrap();
                assert_eq!(res.status(), reqwest::StatusCode::OK);
                (i, res.text().await.unwrap())
            }
        });
        let bodies = tokio::time::timeout(TIMEOUT, futures::future::join_all(calls))
            .await
            .unwrap();
        shutdown.cancel();
        bodies
    });

    run.unwrap();
    for (i, body) in bodies {
        assert_eq!(body, format!("echo:{i}"));
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn errors_and_panics_are_reported_and_the_loop_continues() {
    let server = start_server().await;
    let client = RuntimeApiClient::new(server.base_url()).unwrap();
    let runtime = Runtime::with_config(TestHandler, Config::local());
    let shutdown = runtime.shutdown_token();

    let (run, (failed, panicked, ok)) = tokio::join!(runtime.run_with_client(&client), async {
        let server = &server;
        let invoke = move |event: &'static str| async move {
            tokio::time::timeout(TIMEOUT, server.invoke(event))
                .await
                .unwrap()
                .unwrap()
                .unwrap()
        };
        let failed = invoke("fail").await;
        let panicked = invoke("panic").await;
        let ok = invoke("still alive").await;
        shutdown.cancel();
        (failed, panicked, ok)
    });
    run.unwrap();

    assert_eq!(failed.status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(failed.error_type.as_deref(), Some("FunctionError"));
    let desc: ErrorDescriptor = serde_json::from_slice(&failed.body).unwrap();
    assert_eq!(desc.error_message, "requested failure");

    assert_eq!(panicked.status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(panicked.error_type.as_deref(), Some("Runtime.HandlerPanic"));

    assert_eq!(ok.status, reqwest::StatusCode::OK);
    assert_eq!(ok.body, Bytes::from_static(b"still alive"));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn handler_error_naming_a_lost_connection_is_still_an_error_response() {
    let server = start_server().await;
    let client = RuntimeApiClient::new(server.base_url()).unwrap();
    let runtime = Runtime::with_config(TestHandler, Config::local());
    let shutdown = runtime.shutdown_token();

    let (run, (lost, after)) = tokio::join!(
        tokio::time::timeout(TIMEOUT, runtime.run_with_client(&client)),
        async {
            let lost = tokio::time::timeout(TIMEOUT, server.invoke("lost"))
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let after = tokio::time::timeout(TIMEOUT, server.invoke("after"))
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            shutdown.cancel();
            (lost, after)
        }
    );
    run.unwrap().unwrap();

    assert_eq!(lost.status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(lost.error_type.as_deref(), Some("FunctionError"));
    assert_eq!(after.status, reqwest::StatusCode::OK);
    assert_eq!(after.body, Bytes::from_static(b"after"));

    server.shutdown().await.unwrap();
}

/// Signals once the handler is running, then answers after a delay.
struct SlowEcho {
    started: Arc<Notify>,
}

#[async_trait]
impl StreamingHandler for SlowEcho {
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        _ctx: Context,
    ) -> anyhow::Result<()> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_millis(200)).await;
        writer.write_and_finish(event).await?;
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_during_an_invocation_still_answers_it() {
    let server = start_server().await;
    let client = RuntimeApiClient::new(server.base_url()).unwrap();
    let started = Arc::new(Notify::new());
    let runtime = Runtime::with_config(
        SlowEcho {
            started: started.clone(),
        },
        Config::local(),
    );
    let shutdown = runtime.shutdown_token();

    let (run, (request_id, response)) = tokio::join!(
        tokio::time::timeout(TIMEOUT, runtime.run_with_client(&client)),
        async {
            let request_id = server.enqueue("in flight");
            tokio::time::timeout(TIMEOUT, started.notified())
                .await
                .unwrap();
            shutdown.cancel();
            let response = tokio::time::timeout(TIMEOUT, server.wait_for_response(&request_id))
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            (request_id, response)
        }
    );
    run.unwrap().unwrap();

    assert_eq!(response.request_id, request_id);
    assert_eq!(response.status, reqwest::StatusCode::OK);
    assert_eq!(response.body, Bytes::from_static(b"in flight"));
    assert!(!client.is_running());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn responses_are_accepted_once_per_handed_out_invocation() {
    let server = start_server().await;
    let http = reqwest::Client::new();
    let base = format!("{}/2018-06-01/runtime/invocation", server.base_url());
    let post = |id: &str, route: &str, body: &'static str| {
        http.post(format!("{base}/{id}/{route}")).body(body).send()
    };

    let unknown = post("never-issued", "response", "x").await.unwrap();
    assert_eq!(unknown.status(), reqwest::StatusCode::BAD_REQUEST);

    let request_id = server.enqueue("ping");
    let early = post(&request_id, "response", "too early").await.unwrap();
    assert_eq!(early.status(), reqwest::StatusCode::BAD_REQUEST);

    let next = http.get(format!("{base}/next")).send().await.unwrap();
    assert_eq!(next.status(), reqwest::StatusCode::OK);
    assert_eq!(next.headers()["lambda-runtime-aws-request-id"], request_id.as_str());

    let first = post(&request_id, "response", "pong").await.unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::ACCEPTED);
    let again = post(&request_id, "error", "{}").await.unwrap();
    assert_eq!(again.status(), reqwest::StatusCode::CONFLICT);

    let response = tokio::time::timeout(TIMEOUT, server.wait_for_response(&request_id))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.body, Bytes::from_static(b"pong"));
    assert!(response.error_type.is_none());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn streamed_response_carries_prelude_status_and_headers() {
    let server = start_server().await;
    let client = RuntimeApiClient::new(server.base_url()).unwrap();
    let runtime = Runtime::with_config(TestHandler, Config::local());
    let shutdown = runtime.shutdown_token();
    let invoke_url = server.invoke_url();

    let (run, (streamed, truncated)) = tokio::join!(runtime.run_with_client(&client), async {
        let http = reqwest::Client::new();
        let streamed = tokio::time::timeout(TIMEOUT, http.post(&invoke_url).body("stream").send())
            .await
            .unwrap()
            .unwrap();
        let status = streamed.status();
        let custom = streamed.headers()["x-my-custom-header"].clone();
        let body = streamed.bytes().await.unwrap();

        let truncated = tokio::time::timeout(TIMEOUT, server.invoke("stream-fail"))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        shutdown.cancel();
        ((status, custom, body), truncated)
    });
    run.unwrap();

    let (status, custom, body) = streamed;
    assert_eq!(status, reqwest::StatusCode::IM_A_TEAPOT);
    assert_eq!(custom, "yes");
    assert_eq!(body, Bytes::from_static(b"Number: 1\nNumber: 2\n"));

    assert_eq!(truncated.status, reqwest::StatusCode::IM_A_TEAPOT);
    let text = String::from_utf8_lossy(&truncated.body).into_owned();
    assert!(
        text.starts_with("Number: 1\n\n<lambda-runtime-error>"),
        "unexpected body {text:?}"
    );
    assert!(text.contains("failed mid-stream"));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_unblocks_a_pending_next() {
    let server = start_server().await;
    let next_url = format!("{}/2018-06-01/runtime/invocation/next", server.base_url());

    let pending = tokio::spawn(async move { reqwest::get(next_url).await.unwrap().status() });

    tokio::time::timeout(TIMEOUT, async {
        while server.waiting_pollers() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    tokio::time::timeout(TIMEOUT, server.shutdown())
        .await
        .unwrap()
        .unwrap();
    let status = tokio::time::timeout(TIMEOUT, pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, reqwest::StatusCode::GONE);
}

#[tokio::test]
async fn runtime_stops_when_the_local_server_goes_away() {
    let server = start_server().await;
    let client = RuntimeApiClient::new(server.base_url()).unwrap();
    let runtime = Runtime::with_config(TestHandler, Config::local());

    let (run, _) = tokio::join!(
        tokio::time::timeout(TIMEOUT, runtime.run_with_client(&client)),
        async {
            while server.waiting_pollers() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            server.shutdown().await.unwrap();
        }
    );

    run.unwrap().unwrap();
    assert!(!client.is_running());
}

#[tokio::test]
async fn init_error_is_recorded() {
    let server = start_server().await;
    let client = RuntimeApiClient::new(server.base_url()).unwrap();

    let desc = ErrorDescriptor::new(ErrorDescriptor::INITIALIZATION_ERROR, "missing table name");
    client.report_init_error(&desc).await.unwrap();

    assert_eq!(server.init_errors(), vec![desc]);
    server.shutdown().await.unwrap();
}
