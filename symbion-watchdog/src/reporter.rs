//! Periodic aggregate report publisher
//!
//! Publishes one report right after startup, then every report interval.
//! The interval is read from the live config each cycle, and a reload wakes
//! the wait so a shorter interval applies right away instead of after the
//! old one. Publish failures are logged and the cycle moves on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{Aggregator, OverallStatus, ServiceHealth, StatusSnapshot};
use crate::bus::{Bus, BusError};
use crate::config::SharedConfig;

/// Wire form of one report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: OverallStatus,
    pub services: BTreeMap<String, ServiceReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceReport {
    pub status: ServiceHealth,
    /// Only present for successful checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub since: DateTime<Utc>,
    pub consecutive_failures: u32,
}

impl AggregateReport {
    pub fn from_snapshot(agent_id: &str, snapshot: &StatusSnapshot) -> Self {
        let services = snapshot
            .services
            .iter()
            .map(|(name, status)| {
                let result = status.last_result.as_ref();
                let report = ServiceReport {
                    status: status.health(),
                    latency_ms: result
                        .filter(|r| r.is_up())
                        .map(|r| r.latency.as_millis() as u64),
                    last_check: result.map(|r| r.completed_at),
                    error: result.and_then(|r| r.error.clone()),
                    since: status.since,
                    consecutive_failures: status.consecutive_failures,
                };
                (name.clone(), report)
            })
            .collect();

        Self {
            agent_id: agent_id.to_string(),
            timestamp: snapshot.taken_at,
            status: snapshot.overall,
            services,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Clone)]
pub struct Reporter {
    aggregator: Aggregator,
    config: SharedConfig,
    bus: Arc<dyn Bus>,
    interval_changed: Arc<Notify>,
}

impl Reporter {
    pub fn new(aggregator: Aggregator, config: SharedConfig, bus: Arc<dyn Bus>) -> Self {
        Self {
            aggregator,
            config,
            bus,
            interval_changed: Arc::new(Notify::new()),
        }
    }

    /// Recompute the pending wait whenever `signal` is notified
    pub fn with_interval_signal(mut self, signal: Arc<Notify>) -> Self {
        self.interval_changed = signal;
        self
    }

    /// Build the current report without publishing it
    pub fn current_report(&self) -> AggregateReport {
        let config = self.config.load();
        AggregateReport::from_snapshot(&config.agent_id, &self.aggregator.snapshot())
    }

    /// Publish the current snapshot once
    pub async fn publish_once(&self) -> Result<AggregateReport, BusError> {
        let subject = self.config.load().report_subject();
        let report = self.current_report();
        self.bus.publish(&subject, report.to_json()?).await?;
        debug!(
            subject = %subject,
            status = %report.status,
            services = report.services.len(),
            "report published"
        );
        Ok(report)
    }

    /// Run the publish loop until `shutdown` fires
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(subject = %self.config.load().report_subject(), "reporter started");
            'publish: loop {
                if let Err(e) = self.publish_once().await {
                    warn!(error = %e, "failed to publish report");
                }

                let published_at = Instant::now();
                loop {
                    let deadline = published_at + self.config.load().report_interval;
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break 'publish,
                        _ = tokio::time::sleep_until(deadline) => break,
                        _ = self.interval_changed.notified() => {
                            debug!(
                                interval = ?self.config.load().report_interval,
                                "report interval re-read"
                            );
                        }
                    }
                }
            }
            info!("reporter stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::CheckResult;
    use crate::config::AgentConfig;
    use arc_swap::ArcSwap;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Bus for RecordingBus {
        async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(BusError::Publish {
                    subject: subject.to_string(),
                    reason: "broker unavailable".to_string(),
                });
            }
            self.published.lock().push((subject.to_string(), payload));
            Ok(())
        }
    }

    fn config(report_interval: Duration) -> SharedConfig {
        let mut config = AgentConfig::from_toml_str(
            r#"
            [agent]
            agent_id = "web-01"
            "#,
        )
        .unwrap();
        config.report_interval = report_interval;
        Arc::new(ArcSwap::from_pointee(config))
    }

    #[test]
    fn test_report_fields() {
        let aggregator = Aggregator::new(Duration::from_secs(900));
        aggregator.register("api");
        aggregator.register("db");
        aggregator.register("cache");
        aggregator.update("api", CheckResult::up(Duration::from_millis(42)));
        aggregator.update("db", CheckResult::down(Duration::from_millis(10), "connection refused"));

        let report = AggregateReport::from_snapshot("web-01", &aggregator.snapshot());
        assert_eq!(report.agent_id, "web-01");
        assert_eq!(report.status, OverallStatus::Degraded);

        let api = &report.services["api"];
        assert_eq!(api.status, ServiceHealth::Up);
        assert_eq!(api.latency_ms, Some(42));
        assert!(api.error.is_none());

        let db = &report.services["db"];
        assert_eq!(db.status, ServiceHealth::Down);
        assert_eq!(db.latency_ms, None);
        assert_eq!(db.error.as_deref(), Some("connection refused"));
        assert_eq!(db.consecutive_failures, 1);

        let cache = &report.services["cache"];
        assert_eq!(cache.status, ServiceHealth::Unknown);
        assert!(cache.last_check.is_none());

        let json: serde_json::Value = serde_json::from_slice(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["services"]["db"]["status"], "down");
        assert!(json["services"]["db"].get("latency_ms").is_none());
        assert!(json["services"]["cache"]["last_check"].is_null());
    }

    #[tokio::test]
    async fn test_publishes_on_start_and_interval() {
        let bus = Arc::new(RecordingBus::default());
        let reporter = Reporter::new(
            Aggregator::new(Duration::from_secs(900)),
            config(Duration::from_millis(100)),
            bus.clone(),
        );

        let shutdown = CancellationToken::new();
        let handle = reporter.spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(350)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let published = bus.published.lock();
        assert!(published.len() >= 3, "expected several reports, got {}", published.len());
        assert!(published.iter().all(|(subject, _)| subject == "agent.report.web-01"));

        let report: AggregateReport = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(report.status, OverallStatus::Online);
    }

    #[tokio::test]
    async fn test_shorter_interval_applies_without_waiting_out_old_one() {
        let bus = Arc::new(RecordingBus::default());
        let shared = config(Duration::from_secs(3600));
        let signal = Arc::new(Notify::new());
        let reporter = Reporter::new(Aggregator::new(Duration::from_secs(900)), shared.clone(), bus.clone())
            .with_interval_signal(signal.clone());

        let shutdown = CancellationToken::new();
        let handle = reporter.spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bus.published.lock().len(), 1);

        let mut next = (**shared.load()).clone();
        next.report_interval = Duration::from_millis(50);
        shared.store(Arc::new(next));
        signal.notify_one();

        tokio::time::sleep(Duration::from_millis(400)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(bus.published.lock().len() >= 3, "reports: {}", bus.published.lock().len());
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_loop_alive() {
        let bus = Arc::new(RecordingBus::default());
        bus.failing.store(true, Ordering::SeqCst);
        let reporter = Reporter::new(
            Aggregator::new(Duration::from_secs(900)),
            config(Duration::from_millis(50)),
            bus.clone(),
        );

        let shutdown = CancellationToken::new();
        let handle = reporter.spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(bus.published.lock().is_empty());

        bus.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(!bus.published.lock().is_empty());
    }
}
