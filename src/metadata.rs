//! Invocation metadata parsed from `/next` response headers, and the per-call [`Context`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;

use crate::error::{HeaderKind, RuntimeError};

/// Runtime API header names, lowercase so they can be used as static `HeaderName`s.
pub mod headers {
    pub const REQUEST_ID: &str = "lambda-runtime-aws-request-id";
    pub const DEADLINE_MS: &str = "lambda-runtime-deadline-ms";
    pub const INVOKED_FUNCTION_ARN: &str = "lambda-runtime-invoked-function-arn";
    pub const TRACE_ID: &str = "lambda-runtime-trace-id";
    pub const CLIENT_CONTEXT: &str = "lambda-runtime-client-context";
    pub const COGNITO_IDENTITY: &str = "lambda-runtime-cognito-identity";
    pub const FUNCTION_ERROR_TYPE: &str = "lambda-runtime-function-error-type";
    pub const FUNCTION_RESPONSE_MODE: &str = "lambda-runtime-function-response-mode";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationMetadata {
    pub request_id: String,
    pub deadline_epoch_millis: i64,
    pub invoked_function_arn: String,
    pub trace_id: String,
    pub client_context: Option<String>,
    pub cognito_identity: Option<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl InvocationMetadata {
    /// Parses the `/next` headers. Each missing required header has its own [`HeaderKind`]; a
    /// deadline that is not an integer counts as missing.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, RuntimeError> {
        let request_id = header_str(headers, headers::REQUEST_ID)
            .filter(|v| !v.is_empty())
            .ok_or(RuntimeError::MissingHeader(HeaderKind::RequestId))?;

        let deadline_epoch_millis = header_str(headers, headers::DEADLINE_MS)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .ok_or(RuntimeError::MissingHeader(HeaderKind::Deadline))?;

        let invoked_function_arn = header_str(headers, headers::INVOKED_FUNCTION_ARN)
            .ok_or(RuntimeError::MissingHeader(HeaderKind::InvokedFunctionArn))?;

        let trace_id = header_str(headers, headers::TRACE_ID)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{};Sampled=0", generate_trace_id()));

        Ok(Self {
            request_id: request_id.to_string(),
            deadline_epoch_millis,
            invoked_function_arn: invoked_function_arn.to_string(),
            trace_id,
            client_context: header_str(headers, headers::CLIENT_CONTEXT).map(str::to_string),
            cognito_identity: header_str(headers, headers::COGNITO_IDENTITY).map(str::to_string),
        })
    }

    /// Absolute deadline as wall-clock time.
    pub fn deadline(&self) -> SystemTime {
        if self.deadline_epoch_millis >= 0 {
            UNIX_EPOCH + Duration::from_millis(self.deadline_epoch_millis as u64)
        } else {
            UNIX_EPOCH
        }
    }
}

/// Trace id in the X-Ray layout: version `1`, epoch seconds as 8 lowercase hex digits, then a
/// 96-bit random identifier as 24 lowercase hex digits.
pub fn generate_trace_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("1-{now:08x}-{}", &random[..24])
}

/// What the handler sees of one invocation.
#[derive(Debug, Clone)]
pub struct Context {
    pub request_id: String,
    pub trace_id: String,
    pub invoked_function_arn: String,
    /// Absolute deadline. Informational only: nothing cancels the handler when it passes.
    pub deadline: SystemTime,
    pub client_context: Option<String>,
    pub cognito_identity: Option<String>,
}

impl Context {
    pub fn remaining_time(&self) -> Duration {
        self.deadline
            .duration_since(SystemTime::now())
            .unwrap_or_default()
    }
}

impl From<&InvocationMetadata> for Context {
    fn from(meta: &InvocationMetadata) -> Self {
        Self {
            request_id: meta.request_id.clone(),
            trace_id: meta.trace_id.clone(),
            invoked_function_arn: meta.invoked_function_arn.clone(),
            deadline: meta.deadline(),
            client_context: meta.client_context.clone(),
            cognito_identity: meta.cognito_identity.clone(),
        }
    }
}
