#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use pr_telemetry_domain::TraceId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const QA_TASK_NAME: &str = "qa_validate_and_judge";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum QaDispatchError {
    #[error("qa dispatch configuration error: {0}")]
    Config(String),
    #[error("qa dispatch transport failure: {0}")]
    Transport(String),
    #[error("qa collaborator rejected dispatch with http status {status}")]
    Rejected { status: u16, body: Option<String> },
    #[error("qa collaborator returned an unusable response: {0}")]
    Protocol(String),
}

/// Acknowledgement from the QA collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DispatchReceipt {
    pub job_id: String,
}

/// Fire-and-forget handoff of a finalized trace to validation and judging.
pub trait QaDispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    /// Returns an error when the collaborator cannot be reached or refuses the job.
    fn dispatch_for_review(&self, trace_id: TraceId) -> Result<DispatchReceipt, QaDispatchError>;
}

/// Accepts every dispatch without contacting anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQaDispatcher;

impl QaDispatcher for NoopQaDispatcher {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn dispatch_for_review(&self, trace_id: TraceId) -> Result<DispatchReceipt, QaDispatchError> {
        tracing::debug!(trace_id = %trace_id, "qa dispatch disabled; skipping");
        Ok(DispatchReceipt {
            job_id: format!("noop-{trace_id}"),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum QaDispatchMode {
    #[default]
    Disabled,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QaDispatchConfig {
    #[serde(default)]
    pub mode: QaDispatchMode,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Name of the environment variable holding a bearer token.
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for QaDispatchConfig {
    fn default() -> Self {
        Self {
            mode: QaDispatchMode::Disabled,
            url: None,
            timeout_ms: default_timeout_ms(),
            auth_bearer_env: None,
            headers: BTreeMap::new(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl QaDispatchConfig {
    /// # Errors
    /// Returns `QaDispatchError::Config` when the selected mode lacks settings.
    pub fn validate(&self) -> Result<(), QaDispatchError> {
        if self.timeout_ms == 0 {
            return Err(QaDispatchError::Config(
                "qa.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.mode == QaDispatchMode::Http {
            let url = self.url.as_deref().unwrap_or_default();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(QaDispatchError::Config(
                    "qa.url must be an http(s) url when mode is http".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Build the dispatcher the configuration selects.
    ///
    /// # Errors
    /// Returns an error for invalid settings or a missing bearer token variable.
    pub fn build(&self) -> Result<Box<dyn QaDispatcher>, QaDispatchError> {
        self.validate()?;
        match self.mode {
            QaDispatchMode::Disabled => Ok(Box::new(NoopQaDispatcher)),
            QaDispatchMode::Http => Ok(Box::new(HttpQaDispatcher::from_config(self)?)),
        }
    }
}

/// Posts `{"task", "trace_id"}` to the collaborator and expects `{"job_id"}` back.
#[derive(Debug, Clone)]
pub struct HttpQaDispatcher {
    url: String,
    timeout: Duration,
    headers: BTreeMap<String, String>,
    auth_bearer_token: Option<String>,
}

impl HttpQaDispatcher {
    /// # Errors
    /// Returns `QaDispatchError::Config` when the url is missing or the bearer
    /// token variable is unset.
    pub fn from_config(config: &QaDispatchConfig) -> Result<Self, QaDispatchError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| QaDispatchError::Config("qa.url is required".to_string()))?;
        let auth_bearer_token = match &config.auth_bearer_env {
            Some(env_name) => Some(std::env::var(env_name).map_err(|_| {
                QaDispatchError::Config(format!(
                    "missing env var '{env_name}' required by qa.auth_bearer_env"
                ))
            })?),
            None => None,
        };
        Ok(Self {
            url,
            timeout: Duration::from_millis(config.timeout_ms),
            headers: config.headers.clone(),
            auth_bearer_token,
        })
    }
}

impl QaDispatcher for HttpQaDispatcher {
    fn name(&self) -> &'static str {
        "http"
    }

    fn dispatch_for_review(&self, trace_id: TraceId) -> Result<DispatchReceipt, QaDispatchError> {
        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
        let mut req = agent
            .request("POST", &self.url)
            .set("content-type", "application/json");
        for (header, value) in &self.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        let outbound = json!({
            "task": QA_TASK_NAME,
            "trace_id": trace_id.to_string(),
        });
        let body: Value = match req.send_json(&outbound) {
            Ok(response) => response
                .into_json()
                .map_err(|err| QaDispatchError::Protocol(format!("invalid json body: {err}")))?,
            Err(ureq::Error::Status(status, response)) => {
                return Err(QaDispatchError::Rejected {
                    status,
                    body: response.into_string().ok(),
                });
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(QaDispatchError::Transport(err.to_string()));
            }
        };

        let job_id = body
            .get("job_id")
            .and_then(Value::as_str)
            .filter(|job_id| !job_id.trim().is_empty())
            .ok_or_else(|| QaDispatchError::Protocol("response lacks job_id".to_string()))?;
        Ok(DispatchReceipt {
            job_id: job_id.to_string(),
        })
    }
}
