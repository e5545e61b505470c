//! Check executors for monitored services
//!
//! One probe per invocation, selected by the service's check kind:
//! - HTTP request with status / body expectations
//! - TCP connect and immediate close
//! - Custom command with an expected exit code
//!
//! Executors never retry; cadence belongs to the scheduler.

mod custom;
mod http;
mod tcp;

pub use custom::CustomCheck;
pub use http::HttpCheck;
pub use tcp::TcpCheck;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ServiceSpec;

/// Outcome status of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
}

/// Result of one completed check invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub latency: Duration,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl CheckResult {
    pub fn up(latency: Duration) -> Self {
        Self {
            status: CheckStatus::Up,
            latency,
            completed_at: Utc::now(),
            error: None,
        }
    }

    pub fn down(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Down,
            latency,
            completed_at: Utc::now(),
            error: Some(error.into()),
        }
    }

    pub fn at(mut self, completed_at: DateTime<Utc>) -> Self {
        self.completed_at = completed_at;
        self
    }

    pub fn is_up(&self) -> bool {
        self.status == CheckStatus::Up
    }
}

/// Per-check failure, always recorded as a `down` result
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Execution(String),
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
    #[error("response mismatch: body does not contain {0:?}")]
    ResponseMismatch(String),
    #[error("unexpected exit code {code}{}", format_stderr(.stderr))]
    UnexpectedExitCode { code: i32, stderr: String },
    #[error("terminated by signal{}", format_stderr(.stderr))]
    Terminated { stderr: String },
    #[error("check cancelled")]
    Cancelled,
}

fn format_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

/// Check kind with its kind-specific target and expectations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckKind {
    Http(HttpCheck),
    Tcp(TcpCheck),
    Custom(CustomCheck),
}

impl CheckKind {
    pub fn label(&self) -> &'static str {
        match self {
            CheckKind::Http(_) => "http",
            CheckKind::Tcp(_) => "tcp",
            CheckKind::Custom(_) => "custom",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            CheckKind::Http(check) => &check.url,
            CheckKind::Tcp(check) => &check.address,
            CheckKind::Custom(check) => &check.command,
        }
    }
}

/// Resources shared by every check (HTTP connection pool)
#[derive(Clone)]
pub struct CheckContext {
    http: reqwest::Client,
}

impl CheckContext {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("symbion-watchdog/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

/// Run one check for `spec`, bounded by its timeout and aborted on `cancel`.
///
/// Dropping the probe future on timeout or cancellation releases its socket
/// and kills a spawned command.
pub async fn execute(spec: &ServiceSpec, context: &CheckContext, cancel: &CancellationToken) -> CheckResult {
    let started = Instant::now();

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CheckError::Cancelled),
        res = tokio::time::timeout(spec.timeout, probe(spec, context)) => match res {
            Ok(outcome) => outcome,
            Err(_) => Err(CheckError::Timeout(spec.timeout)),
        },
    };

    let latency = started.elapsed();
    match outcome {
        Ok(()) => CheckResult::up(latency),
        Err(e) => CheckResult::down(latency, e.to_string()),
    }
}

async fn probe(spec: &ServiceSpec, context: &CheckContext) -> Result<(), CheckError> {
    match &spec.kind {
        CheckKind::Http(check) => check.run(&context.http, spec.timeout).await,
        CheckKind::Tcp(check) => check.run(spec.timeout).await,
        CheckKind::Custom(check) => check.run(spec.timeout).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_spec(address: &str, timeout: Duration) -> ServiceSpec {
        ServiceSpec {
            name: "db".to_string(),
            kind: CheckKind::Tcp(TcpCheck {
                address: address.to_string(),
            }),
            timeout,
            interval: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_cancelled_check_is_down() {
        // Non-routable address: the connect would otherwise hang until timeout.
        let spec = tcp_spec("10.255.255.1:9", Duration::from_secs(30));
        let context = CheckContext::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = Instant::now();
        let result = execute(&spec, &context, &cancel).await;
        assert_eq!(result.status, CheckStatus::Down);
        assert_eq!(result.error.as_deref(), Some("check cancelled"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(CheckError::UnexpectedStatus(500).to_string(), "unexpected status 500");
        assert_eq!(
            CheckError::UnexpectedExitCode { code: 2, stderr: "boom".into() }.to_string(),
            "unexpected exit code 2: boom"
        );
        assert_eq!(
            CheckError::UnexpectedExitCode { code: 2, stderr: String::new() }.to_string(),
            "unexpected exit code 2"
        );
        assert_eq!(
            CheckError::Timeout(Duration::from_secs(2)).to_string(),
            "timed out after 2s"
        );
    }

    #[test]
    fn test_kind_label_and_target() {
        let spec = tcp_spec("localhost:5432", Duration::from_secs(1));
        assert_eq!(spec.kind.label(), "tcp");
        assert_eq!(spec.kind.target(), "localhost:5432");
    }
}
