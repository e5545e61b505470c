use std::time::Duration;
use tokio::net::TcpStream;

use super::CheckError;

/// TCP connect probe against `host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpCheck {
    pub address: String,
}

impl TcpCheck {
    pub(super) async fn run(&self, timeout: Duration) -> Result<(), CheckError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| CheckError::Timeout(timeout))?
            .map_err(|e| CheckError::Execution(format!("connect to {} failed: {}", self.address, e)))?;

        // Connected is enough; close right away.
        drop(stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{execute, CheckContext, CheckKind, CheckStatus};
    use super::*;
    use crate::config::ServiceSpec;
    use std::time::Instant;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn spec(address: String, timeout: Duration) -> ServiceSpec {
        ServiceSpec {
            name: "db".to_string(),
            kind: CheckKind::Tcp(TcpCheck { address }),
            timeout,
            interval: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_open_port_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let result = execute(
            &spec(address, Duration::from_secs(2)),
            &CheckContext::new().unwrap(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result.status, CheckStatus::Up);
    }

    #[tokio::test]
    async fn test_closed_port_is_down_within_timeout() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let started = Instant::now();
        let result = execute(
            &spec(address, Duration::from_secs(2)),
            &CheckContext::new().unwrap(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result.status, CheckStatus::Down);
        assert!(result.error.is_some());
        assert!(started.elapsed() <= Duration::from_millis(2100));
    }
}
