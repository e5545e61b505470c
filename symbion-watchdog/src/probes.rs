/**
 * HEALTH PROBES - HTTP surface for orchestrators and load balancers
 *
 * ROUTES :
 * - GET /live    always 200 "ALIVE" while the process serves requests
 * - GET /ready   200 "READY" once the first check pass completed, else 503
 * - GET /health  200 while online or degraded, 503 when offline
 * - GET /status  current aggregate report as JSON
 *
 * No auth: bind to a private interface when exposed beyond localhost.
 */

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{Aggregator, OverallStatus};
use crate::config::SharedConfig;
use crate::reporter::AggregateReport;

#[derive(Clone)]
pub struct ProbeState {
    aggregator: Aggregator,
    ready: Arc<AtomicBool>,
    config: SharedConfig,
}

impl ProbeState {
    pub fn new(aggregator: Aggregator, ready: Arc<AtomicBool>, config: SharedConfig) -> Self {
        Self {
            aggregator,
            ready,
            config,
        }
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn health(&self) -> OverallStatus {
        self.aggregator.overall_status()
    }

    pub fn report(&self) -> AggregateReport {
        AggregateReport::from_snapshot(&self.config.load().agent_id, &self.aggregator.snapshot())
    }
}

pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

// Answering at all is the liveness signal
async fn live() -> &'static str {
    "ALIVE"
}

async fn ready(State(state): State<ProbeState>) -> impl IntoResponse {
    if state.ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn health(State(state): State<ProbeState>) -> impl IntoResponse {
    let status = state.health();
    let code = match status {
        OverallStatus::Online | OverallStatus::Degraded => StatusCode::OK,
        OverallStatus::Offline => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, status.as_str())
}

async fn status(State(state): State<ProbeState>) -> Json<AggregateReport> {
    Json(state.report())
}

/// Running probe listener
pub struct ProbeServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProbeServer {
    /// Bind `addr` and start serving. Bind errors surface here, before any
    /// check runs.
    pub async fn bind(addr: SocketAddr, state: ProbeState) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let app = router(state);
        let signal = shutdown.clone().cancelled_owned();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(signal).await {
                warn!(error = %e, "health probe server failed");
            }
            debug!("health probe server exited");
        });

        info!(addr = %local_addr, "health probes listening");
        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "health probe task failed");
        }
        info!("health probes stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::CheckResult;
    use crate::config::AgentConfig;
    use arc_swap::ArcSwap;
    use std::time::Duration;

    async fn serve(aggregator: Aggregator, ready: Arc<AtomicBool>) -> ProbeServer {
        let config = AgentConfig::from_toml_str("[agent]\nagent_id = \"probe-test\"").unwrap();
        let state = ProbeState::new(aggregator, ready, Arc::new(ArcSwap::from_pointee(config)));
        ProbeServer::bind("127.0.0.1:0".parse().unwrap(), state).await.unwrap()
    }

    async fn get(server: &ProbeServer, path: &str) -> (u16, String) {
        let response = reqwest::get(format!("http://{}{}", server.local_addr(), path))
            .await
            .unwrap();
        let code = response.status().as_u16();
        (code, response.text().await.unwrap())
    }

    #[tokio::test]
    async fn test_live_and_ready() {
        let ready = Arc::new(AtomicBool::new(false));
        let server = serve(Aggregator::new(Duration::from_secs(900)), ready.clone()).await;

        assert_eq!(get(&server, "/live").await, (200, "ALIVE".to_string()));
        assert_eq!(get(&server, "/ready").await, (503, "NOT READY".to_string()));

        ready.store(true, Ordering::Release);
        assert_eq!(get(&server, "/ready").await, (200, "READY".to_string()));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_health_follows_overall_status() {
        let aggregator = Aggregator::new(Duration::ZERO);
        aggregator.register("api");
        let server = serve(aggregator.clone(), Arc::new(AtomicBool::new(true))).await;

        assert_eq!(get(&server, "/health").await, (200, "online".to_string()));

        aggregator.update("api", CheckResult::down(Duration::from_millis(5), "refused"));
        assert_eq!(get(&server, "/health").await, (503, "offline".to_string()));

        aggregator.update("api", CheckResult::up(Duration::from_millis(5)));
        assert_eq!(get(&server, "/health").await, (200, "online".to_string()));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_status_returns_report() {
        let aggregator = Aggregator::new(Duration::from_secs(900));
        aggregator.register("api");
        aggregator.update("api", CheckResult::down(Duration::from_millis(5), "refused"));
        let server = serve(aggregator, Arc::new(AtomicBool::new(true))).await;

        let (code, body) = get(&server, "/status").await;
        assert_eq!(code, 200);
        let report: AggregateReport = serde_json::from_str(&body).unwrap();
        assert_eq!(report.agent_id, "probe-test");
        assert_eq!(report.status, OverallStatus::Degraded);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let server = serve(Aggregator::new(Duration::from_secs(900)), Arc::new(AtomicBool::new(true))).await;
        let addr = server.local_addr();
        server.stop().await;

        assert!(reqwest::get(format!("http://{}/live", addr)).await.is_err());
    }
}
