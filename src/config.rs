//! Runtime configuration read from the environment: remote control plane or local server.

use std::net::SocketAddr;

use crate::error::RuntimeError;

pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";
pub const DEFAULT_LOCAL_PORT: u16 = 7000;
pub const DEFAULT_INVOCATION_ENDPOINT: &str = "/invoke";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `host:port` of the control plane. `None` selects local mode.
    pub runtime_api: Option<String>,
    pub local: LocalServerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalServerConfig {
    pub host: String,
    pub port: u16,
    pub invocation_endpoint: String,
}

impl Default for LocalServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_LOCAL_HOST.to_string(),
            port: DEFAULT_LOCAL_PORT,
            invocation_endpoint: DEFAULT_INVOCATION_ENDPOINT.to_string(),
        }
    }
}

impl LocalServerConfig {
    /// Loopback on an ephemeral port.
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            ..Self::default()
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RuntimeError> {
        let runtime_api = lookup("AWS_LAMBDA_RUNTIME_API")
            .filter(|v| !v.trim().is_empty())
            .map(|v| validate_endpoint(v.trim()))
            .transpose()?;

        let host = lookup("LOCAL_LAMBDA_HOST")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_LOCAL_HOST.into());

        let port = match lookup("LOCAL_LAMBDA_PORT").filter(|v| !v.is_empty()) {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|err| RuntimeError::InvalidPort(format!("LOCAL_LAMBDA_PORT={raw}: {err}")))?,
            None => DEFAULT_LOCAL_PORT,
        };

        let invocation_endpoint = match lookup("LOCAL_LAMBDA_INVOCATION_ENDPOINT")
            .filter(|v| !v.is_empty())
        {
            Some(path) if path.starts_with('/') => path,
            Some(path) => format!("/{path}"),
            None => DEFAULT_INVOCATION_ENDPOINT.into(),
        };

        Ok(Self {
            runtime_api,
            local: LocalServerConfig {
                host,
                port,
                invocation_endpoint,
            },
        })
    }

    /// Local mode on an ephemeral loopback port.
    pub fn local() -> Self {
        Self {
            runtime_api: None,
            local: LocalServerConfig::ephemeral(),
        }
    }

    pub fn remote(endpoint: &str) -> Result<Self, RuntimeError> {
        Ok(Self {
            runtime_api: Some(validate_endpoint(endpoint)?),
            local: LocalServerConfig::default(),
        })
    }

    pub fn runtime_api_base_url(&self) -> Option<String> {
        self.runtime_api.as_ref().map(|ep| format!("http://{ep}"))
    }
}

/// Accepts `host:port` (or a socket address) with a non-empty host and a numeric port.
fn validate_endpoint(endpoint: &str) -> Result<String, RuntimeError> {
    if endpoint.parse::<SocketAddr>().is_ok() {
        return Ok(endpoint.to_string());
    }

    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| RuntimeError::InvalidEndpoint(format!("{endpoint}: missing port")))?;
    if host.is_empty() {
        return Err(RuntimeError::InvalidEndpoint(format!(
            "{endpoint}: missing host"
        )));
    }
    port.parse::<u16>().map_err(|err| {
        RuntimeError::InvalidEndpoint(format!("{endpoint}: invalid port ({err})"))
    })?;
    Ok(endpoint.to_string())
}
