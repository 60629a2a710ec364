//! Remote code execution.
//!
//! [`ExecutionGateway`] posts the room buffer to a Piston-compatible service
//! and maps the reply onto an [`ExecutionResult`]. Any failure before a
//! program result is available becomes [`RoomError::Execution`], which the
//! session renders through [`OutputPanel`] with `failed` set so it is never
//! confused with a program's own stderr.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, RoomError};
use crate::language::Language;

/// Default public Piston endpoint.
pub const DEFAULT_EXECUTE_URL: &str = "https://emkc.org/api/v2/piston/execute";

/// Shown when the service gives no usable error text.
pub const EXECUTION_FAILED: &str = "Failed to execute code";

/// Output of one program run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Combined program output as reported by the service.
    pub output: String,
    /// Program stderr. Empty stderr is normalised to `None`.
    pub stderr: Option<String>,
}

/// Anything that can run a buffer in a language.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, code: &str, language: Language) -> Result<ExecutionResult>;
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    language: &'a str,
    version: &'a str,
    files: Vec<SourceFile<'a>>,
}

#[derive(Debug, Serialize)]
struct SourceFile<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(default)]
    run: Option<RunStage>,
}

#[derive(Debug, Deserialize)]
struct RunStage {
    #[serde(default)]
    output: String,
    #[serde(default)]
    stderr: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// JSON body sent for one run.
pub fn request_body(code: &str, language: Language) -> serde_json::Value {
    let req = RunRequest {
        language: language.as_str(),
        version: language.runtime_version(),
        files: vec![SourceFile { content: code }],
    };
    // RunRequest only holds strings, serialization cannot fail.
    serde_json::to_value(&req).unwrap_or(serde_json::Value::Null)
}

/// Map an HTTP status and body onto a run outcome.
///
/// A 2xx body without a `run` stage is an empty result. A non-2xx body's
/// `error` (or `message`) field becomes the failure text.
pub fn parse_response(status: u16, body: &[u8]) -> Result<ExecutionResult> {
    if !(200..300).contains(&status) {
        let detail = serde_json::from_slice::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.error.or(b.message))
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| EXECUTION_FAILED.to_string());
        return Err(RoomError::Execution(detail));
    }

    let parsed: RunResponse = serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "execution response was not valid JSON");
        RoomError::Execution(EXECUTION_FAILED.to_string())
    })?;

    Ok(match parsed.run {
        Some(run) => ExecutionResult {
            output: run.output,
            stderr: Some(run.stderr).filter(|s| !s.is_empty()),
        },
        None => ExecutionResult::default(),
    })
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ExecutionConfig {
    /// - connect_timeout: 5 s
    /// - request_timeout: 30 s
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_EXECUTE_URL)
    }
}

/// HTTP executor. Use [`ExecutionGateway::builder`] for construction.
#[derive(Debug, Clone)]
pub struct ExecutionGateway {
    config: ExecutionConfig,
    client: reqwest::Client,
}

impl ExecutionGateway {
    pub fn builder(endpoint: impl Into<String>) -> ExecutionGatewayBuilder {
        ExecutionGatewayBuilder::new(endpoint)
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }
}

#[async_trait]
impl Executor for ExecutionGateway {
    async fn execute(&self, code: &str, language: Language) -> Result<ExecutionResult> {
        debug!(
            language = %language,
            version = language.runtime_version(),
            bytes = code.len(),
            "submitting execution request"
        );
        let resp = self
            .client
            .post(&self.config.endpoint)
            .json(&request_body(code, language))
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, url = %self.config.endpoint, "execution request failed");
                RoomError::Execution(EXECUTION_FAILED.to_string())
            })?;

        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.map_err(|e| {
            warn!(error = %e, "execution response body unreadable");
            RoomError::Execution(EXECUTION_FAILED.to_string())
        })?;
        parse_response(status, &bytes)
    }
}

pub struct ExecutionGatewayBuilder {
    config: ExecutionConfig,
}

impl ExecutionGatewayBuilder {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            config: ExecutionConfig::new(endpoint),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn build(self) -> ExecutionGateway {
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .build()
            .unwrap_or_default();
        ExecutionGateway {
            config: self.config,
            client,
        }
    }
}

// ---------------------------------------------------------------------------
// Output panel
// ---------------------------------------------------------------------------

/// Displayable projection of a run outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputPanel {
    pub output: String,
    pub error: String,
    /// `true` when the run never produced a program result.
    pub failed: bool,
}

impl OutputPanel {
    pub fn from_outcome(outcome: &Result<ExecutionResult>) -> Self {
        match outcome {
            Ok(result) => OutputPanel {
                output: result.output.clone(),
                error: result.stderr.clone().unwrap_or_default(),
                failed: false,
            },
            Err(RoomError::Execution(detail)) => OutputPanel {
                output: String::new(),
                error: detail.clone(),
                failed: true,
            },
            Err(_) => OutputPanel {
                output: String::new(),
                error: EXECUTION_FAILED.to_string(),
                failed: true,
            },
        }
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }
}
