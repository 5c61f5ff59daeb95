use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use lambda_runtime_client::{
    Config, Context, ConnectionState, HeaderKind, InvocationPool, ResponseWriter, Runtime,
    RuntimeApiClient, RuntimeError, StatusAndHeaders, StreamingHandler,
};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum NextMode {
    /// Serve one invocation, then answer 410 Gone.
    ServeOnce { with_request_id: bool },
    Fail(StatusCode),
    /// Never answer.
    Hang,
}

#[derive(Debug, Clone)]
struct RecordedPost {
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Clone)]
struct StubState {
    mode: NextMode,
    reject_posts: bool,
    next_calls: Arc<AtomicUsize>,
    posts: Arc<Mutex<Vec<RecordedPost>>>,
    first_next_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

struct Stub {
    base_url: String,
    state: StubState,
    server: tokio::task::JoinHandle<()>,
}

async fn spawn_stub(mode: NextMode, reject_posts: bool) -> (Stub, oneshot::Receiver<()>) {
    let (first_next_tx, first_next_rx) = oneshot::channel();
    let state = StubState {
        mode,
        reject_posts,
        next_calls: Arc::new(AtomicUsize::new(0)),
        posts: Arc::new(Mutex::new(Vec::new())),
        first_next_tx: Arc::new(Mutex::new(Some(first_next_tx))),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/2018-06-01/runtime/invocation/next", get(stub_next))
        .route(
            "/2018-06-01/runtime/invocation/{id}/response",
            post(stub_response),
        )
        .route("/2018-06-01/runtime/invocation/{id}/error", post(stub_error))
        .with_state(state.clone());

    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (
        Stub {
            base_url: format!("http://{addr}"),
            state,
            server,
        },
        first_next_rx,
    )
}

async fn stub_next(State(state): State<StubState>) -> Response<Body> {
    let call = state.next_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(tx) = state.first_next_tx.lock().await.take() {
        let _ = tx.send(());
    }

    match state.mode {
        NextMode::Hang => std::future::pending().await,
        NextMode::Fail(status) => Response::builder()
            .status(status)
            .body(Body::empty())
            .unwrap(),
        NextMode::ServeOnce { .. } if call > 0 => Response::builder()
            .status(StatusCode::GONE)
            .body(Body::empty())
            .unwrap(),
        NextMode::ServeOnce { with_request_id } => {
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header("Lambda-Runtime-Deadline-Ms", "4102444800000")
                .header(
                    "Lambda-Runtime-Invoked-Function-Arn",
                    "arn:aws:lambda:us-east-1:000000000000:function:stub",
                )
                .header("Lambda-Runtime-Trace-Id", "Root=1-5759e988-bd862e3fe1be46a994272793");
            if with_request_id {
                builder = builder.header("Lambda-Runtime-Aws-Request-Id", "req-1");
            }
            builder.body(Body::from("ping")).unwrap()
        }
    }
}

async fn record(state: &StubState, path: String, headers: HeaderMap, body: Bytes) -> StatusCode {
    state.posts.lock().await.push(RecordedPost {
        path,
        headers,
        body,
    });
    if state.reject_posts {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::ACCEPTED
    }
}

async fn stub_response(
    State(state): State<StubState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    record(&state, format!("{id}/response"), headers, body).await
}

async fn stub_error(
    State(state): State<StubState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    record(&state, format!("{id}/error"), headers, body).await
}

/// `ping` -> `pong`, `fail` -> error, `stream` -> streamed body with a prelude.
struct TestHandler;

#[async_trait]
impl StreamingHandler for TestHandler {
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        ctx: Context,
    ) -> anyhow::Result<()> {
        assert_eq!(ctx.request_id, "req-1");
        match event.as_ref() {
            b"ping" => writer.write_and_finish("pong").await?,
            b"stream" => {
                writer
                    .write_status_and_headers(
                        StatusAndHeaders::new(418).with_header("x-my-custom-header", "yes"),
                    )
                    .await?;
                writer.write("Number: 1\n").await?;
                writer.write("Number: 2\n").await?;
                writer.finish().await?;
            }
            _ => anyhow::bail!("unexpected event"),
        }
        Ok(())
    }
}

struct Fails;

#[async_trait]
impl StreamingHandler for Fails {
    async fn handle(
        &self,
        _event: Bytes,
        _writer: &mut ResponseWriter,
        _ctx: Context,
    ) -> anyhow::Result<()> {
        anyhow::bail!("handler exploded")
    }
}

struct Streams;

#[async_trait]
impl StreamingHandler for Streams {
    async fn handle(
        &self,
        _event: Bytes,
        writer: &mut ResponseWriter,
        ctx: Context,
    ) -> anyhow::Result<()> {
        TestHandler.handle(Bytes::from_static(b"stream"), writer, ctx).await
    }
}

async fn run_once<H: StreamingHandler>(handler: H, stub: &Stub) -> Result<(), RuntimeError> {
    let client = RuntimeApiClient::new(stub.base_url.clone()).unwrap();
    let runtime = Runtime::with_config(handler, Config::local());
    let result = tokio::time::timeout(Duration::from_secs(5), runtime.run_with_client(&client))
        .await
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    result
}

#[tokio::test]
async fn buffered_response_is_posted_for_the_request_id() {
    let (stub, _) = spawn_stub(NextMode::ServeOnce { with_request_id: true }, false).await;

    run_once(TestHandler, &stub).await.unwrap();

    let posts = stub.state.posts.lock().await.clone();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].path, "req-1/response");
    assert_eq!(posts[0].body, Bytes::from_static(b"pong"));
    let ua = posts[0].headers["user-agent"].to_str().unwrap();
    assert!(ua.starts_with("lambda-runtime-client/"), "user agent {ua}");
    assert_eq!(stub.state.next_calls.load(Ordering::SeqCst), 2);

    stub.server.abort();
}

#[tokio::test]
async fn handler_error_is_posted_with_error_type_header() {
    let (stub, _) = spawn_stub(NextMode::ServeOnce { with_request_id: true }, false).await;

    run_once(Fails, &stub).await.unwrap();

    let posts = stub.state.posts.lock().await.clone();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].path, "req-1/error");
    assert_eq!(
        posts[0].headers["Lambda-Runtime-Function-Error-Type"],
        HeaderValue::from_static("FunctionError")
    );
    let body: serde_json::Value = serde_json::from_slice(&posts[0].body).unwrap();
    assert_eq!(body["errorType"], "FunctionError");
    assert_eq!(body["errorMessage"], "handler exploded");

    stub.server.abort();
}

#[tokio::test]
async fn streamed_response_is_sent_chunked_with_prelude() {
    let (stub, _) = spawn_stub(NextMode::ServeOnce { with_request_id: true }, false).await;

    run_once(Streams, &stub).await.unwrap();

    let posts = stub.state.posts.lock().await.clone();
    assert_eq!(posts.len(), 1);
    let post = &posts[0];
    assert_eq!(post.path, "req-1/response");
    assert_eq!(
        post.headers["Lambda-Runtime-Function-Response-Mode"],
        HeaderValue::from_static("streaming")
    );
    assert_eq!(
        post.headers["content-type"],
        HeaderValue::from_static("application/vnd.awslambda.http-integration-response")
    );

    let delimiter = [0u8; 8];
    let split = post
        .body
        .windows(delimiter.len())
        .position(|w| w == delimiter)
        .expect("prelude delimiter");
    let prelude: serde_json::Value = serde_json::from_slice(&post.body[..split]).unwrap();
    assert_eq!(prelude["statusCode"], 418);
    assert_eq!(prelude["headers"]["x-my-custom-header"], "yes");
    assert_eq!(
        &post.body[split + delimiter.len()..],
        b"Number: 1\nNumber: 2\n"
    );

    stub.server.abort();
}

#[tokio::test]
async fn missing_request_id_fails_the_run() {
    let (stub, _) = spawn_stub(NextMode::ServeOnce { with_request_id: false }, false).await;

    let err = run_once(TestHandler, &stub).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::MissingHeader(HeaderKind::RequestId)
    ));
    assert!(stub.state.posts.lock().await.is_empty());

    stub.server.abort();
}

#[tokio::test]
async fn unexpected_next_status_fails_the_run() {
    let (stub, _) = spawn_stub(NextMode::Fail(StatusCode::INTERNAL_SERVER_ERROR), false).await;

    let err = run_once(TestHandler, &stub).await.unwrap_err();
    match err {
        RuntimeError::UnexpectedStatusCode { path, status } => {
            assert_eq!(path, "/runtime/invocation/next");
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        }
        other => panic!("unexpected error {other:?}"),
    }

    stub.server.abort();
}

#[tokio::test]
async fn rejected_response_post_does_not_stop_the_loop() {
    let (stub, _) = spawn_stub(NextMode::ServeOnce { with_request_id: true }, true).await;

    run_once(TestHandler, &stub).await.unwrap();

    assert_eq!(stub.state.posts.lock().await.len(), 1);
    assert_eq!(stub.state.next_calls.load(Ordering::SeqCst), 2);

    stub.server.abort();
}

#[tokio::test]
async fn second_run_is_rejected_while_the_first_is_polling() {
    let (stub, first_next_rx) = spawn_stub(NextMode::Hang, false).await;
    let client = RuntimeApiClient::new(stub.base_url.clone()).unwrap();
    let pool = InvocationPool::new("invocations");
    let shutdown = CancellationToken::new();

    let first = client.run(&pool, &shutdown);
    tokio::pin!(first);

    tokio::select! {
        res = &mut first => panic!("first run ended early: {res:?}"),
        res = first_next_rx => res.unwrap(),
    }
    assert!(client.is_running());

    let err = client.run(&pool, &shutdown).await.unwrap_err();
    assert!(matches!(err, RuntimeError::AlreadyRunning));
    assert!(client.is_running());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap();
    assert!(!client.is_running());
    assert_eq!(client.state(), ConnectionState::Disconnected);

    stub.server.abort();
}
