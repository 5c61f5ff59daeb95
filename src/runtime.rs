//! Wires the poll client, the invocation pool and the dispatch loop together.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::DispatchLoop;
use crate::error::{ErrorDescriptor, RuntimeError};
use crate::handler::StreamingHandler;
use crate::local_server::LocalServer;
use crate::pool::InvocationPool;
use crate::runtime_api::{RunFlag, RuntimeApiClient};

/// Poll client plus dispatch loop for one handler.
///
/// With `AWS_LAMBDA_RUNTIME_API` set it talks to that control plane; otherwise it starts a
/// [`LocalServer`] and polls it.
#[derive(Debug)]
pub struct Runtime<H> {
    dispatch: DispatchLoop<H>,
    config: Config,
    shutdown: CancellationToken,
    running: RunFlag,
}

impl<H: StreamingHandler> Runtime<H> {
    pub fn new(handler: H) -> Result<Self, RuntimeError> {
        Ok(Self::with_config(handler, Config::from_env()?))
    }

    pub fn with_config(handler: H, config: Config) -> Self {
        Self {
            dispatch: DispatchLoop::new(handler),
            config,
            shutdown: CancellationToken::new(),
            running: RunFlag::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stops polling once the in-flight invocation (if any) has been answered.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self) -> Result<(), RuntimeError> {
        let _guard = self.running.acquire()?;
        match self.config.runtime_api_base_url() {
            Some(base_url) => {
                let client = RuntimeApiClient::new(base_url)?;
                self.serve(&client).await
            }
            None => self.run_local().await,
        }
    }

    /// Runs against an existing client, e.g. one pointed at a [`LocalServer`] started elsewhere.
    pub async fn run_with_client(&self, client: &RuntimeApiClient) -> Result<(), RuntimeError> {
        let _guard = self.running.acquire()?;
        self.serve(client).await
    }

    async fn run_local(&self) -> Result<(), RuntimeError> {
        let server = LocalServer::start(self.config.local.clone()).await?;
        tracing::info!(invoke_url = %server.invoke_url(), "running against the local control plane");
        let client = RuntimeApiClient::new(server.base_url())?;

        let result = self.serve(&client).await;
        server.shutdown().await?;
        result
    }

    async fn serve(&self, client: &RuntimeApiClient) -> Result<(), RuntimeError> {
        let pool = InvocationPool::new("invocations");
        let stop_polling = self.shutdown.child_token();

        let poll = async {
            let result = client.run(&pool, &stop_polling).await;
            pool.close();
            result
        };
        // Without a consumer the poll loop would block on the first unanswered invocation.
        let dispatch = async {
            let result = self.dispatch.run(&pool).await;
            stop_polling.cancel();
            pool.close();
            result
        };
        let (poll_result, dispatch_result) = tokio::join!(poll, dispatch);

        if let Err(err) = &poll_result {
            tracing::error!(error = %err, "runtime api poll loop failed");
        }
        poll_result.and(dispatch_result)
    }
}

/// Builds the handler with `init`, then runs it. An initializer failure is reported to the
/// control plane (remote mode) and returned as [`RuntimeError::Init`].
pub async fn run_with_init<H, F, Fut>(config: Config, init: F) -> Result<(), RuntimeError>
where
    H: StreamingHandler,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<H>>,
{
    match init().await {
        Ok(handler) => Runtime::with_config(handler, config).run().await,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "handler initialization failed");
            if let Some(base_url) = config.runtime_api_base_url() {
                let client = RuntimeApiClient::new(base_url)?;
                let desc =
                    ErrorDescriptor::new(ErrorDescriptor::INITIALIZATION_ERROR, format!("{err:#}"));
                client.report_init_error(&desc).await?;
            }
            Err(RuntimeError::Init(err))
        }
    }
}

/// Installs logging, then runs `handler` with configuration from the environment.
pub async fn run<H: StreamingHandler>(handler: H) -> Result<(), RuntimeError> {
    crate::logging::init();
    Runtime::new(handler)?.run().await
}
