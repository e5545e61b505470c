use std::time::Duration;
use tracing::debug;

use super::CheckError;

/// HTTP GET probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCheck {
    pub url: String,
    /// Exact status to require; any 2xx when unset
    pub expected_status: Option<u16>,
    /// Substring the response body must contain
    pub expected_response: Option<String>,
}

impl HttpCheck {
    pub(super) async fn run(&self, client: &reqwest::Client, timeout: Duration) -> Result<(), CheckError> {
        let response = client
            .get(&self.url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(e, timeout))?;

        let status = response.status();
        let status_ok = match self.expected_status {
            Some(expected) => status.as_u16() == expected,
            None => status.is_success(),
        };
        if !status_ok {
            return Err(CheckError::UnexpectedStatus(status.as_u16()));
        }

        if let Some(needle) = &self.expected_response {
            let body = response
                .text()
                .await
                .map_err(|e| request_error(e, timeout))?;
            if !body.contains(needle.as_str()) {
                debug!(url = %self.url, body_len = body.len(), "response body did not match");
                return Err(CheckError::ResponseMismatch(needle.clone()));
            }
        }

        Ok(())
    }
}

fn request_error(error: reqwest::Error, timeout: Duration) -> CheckError {
    if error.is_timeout() {
        CheckError::Timeout(timeout)
    } else {
        CheckError::Execution(format!("request failed: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{execute, CheckContext, CheckKind, CheckStatus};
    use super::*;
    use crate::config::ServiceSpec;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec(url: String, expected_status: Option<u16>, expected_response: Option<&str>) -> ServiceSpec {
        ServiceSpec {
            name: "api".to_string(),
            kind: CheckKind::Http(HttpCheck {
                url,
                expected_status,
                expected_response: expected_response.map(str::to_string),
            }),
            timeout: Duration::from_secs(2),
            interval: Duration::from_secs(30),
        }
    }

    async fn run(spec: &ServiceSpec) -> super::super::CheckResult {
        let context = CheckContext::new().unwrap();
        execute(spec, &context, &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_expected_status_matches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let result = run(&spec(format!("{}/health", server.uri()), Some(200), None)).await;
        assert_eq!(result.status, CheckStatus::Up);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_unexpected_status_is_down() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = run(&spec(format!("{}/health", server.uri()), Some(200), None)).await;
        assert_eq!(result.status, CheckStatus::Down);
        assert_eq!(result.error.as_deref(), Some("unexpected status 500"));
    }

    #[tokio::test]
    async fn test_default_accepts_any_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let result = run(&spec(server.uri(), None, None)).await;
        assert!(result.is_up());
    }

    #[tokio::test]
    async fn test_body_substring_required() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status":"degraded"}"#))
            .mount(&server)
            .await;

        let miss = run(&spec(server.uri(), Some(200), Some("\"status\":\"ok\""))).await;
        assert_eq!(miss.status, CheckStatus::Down);
        assert!(miss.error.unwrap().starts_with("response mismatch"));

        let hit = run(&spec(server.uri(), Some(200), Some("degraded"))).await;
        assert!(hit.is_up());
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let mut spec = spec(server.uri(), None, None);
        spec.timeout = Duration::from_millis(300);
        let started = std::time::Instant::now();
        let result = run(&spec).await;
        assert_eq!(result.status, CheckStatus::Down);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
