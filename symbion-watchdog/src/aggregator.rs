//! Status aggregator - latest check result per scheduled service
//!
//! Single owner of the service → status map. Every mutation goes through
//! this type; readers get immutable snapshots with a derived overall status.
//!
//! Overall status policy:
//! - `online`   every known service is up (or not checked yet)
//! - `degraded` something is down, but for less than the minimum offline time
//! - `offline`  something has been down continuously for at least that long

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::checks::{CheckResult, CheckStatus};

/// Externally visible status of one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    /// Scheduled, no result yet
    Unknown,
    Up,
    Down,
}

impl From<CheckStatus> for ServiceHealth {
    fn from(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Up => ServiceHealth::Up,
            CheckStatus::Down => ServiceHealth::Down,
        }
    }
}

/// Overall agent status derived from every service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Online,
    Degraded,
    Offline,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Online => "online",
            OverallStatus::Degraded => "degraded",
            OverallStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest result for a service plus continuous-state tracking
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStatus {
    pub last_result: Option<CheckResult>,
    /// When the service entered its current status
    pub since: DateTime<Utc>,
    pub consecutive_failures: u32,
}

impl ServiceStatus {
    fn pending(now: DateTime<Utc>) -> Self {
        Self {
            last_result: None,
            since: now,
            consecutive_failures: 0,
        }
    }

    pub fn health(&self) -> ServiceHealth {
        self.last_result
            .as_ref()
            .map(|r| r.status.into())
            .unwrap_or(ServiceHealth::Unknown)
    }

    /// How long the service has been continuously down at `now`
    pub fn down_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.health() != ServiceHealth::Down {
            return None;
        }
        Some((now - self.since).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Immutable point-in-time copy of the aggregator
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub taken_at: DateTime<Utc>,
    pub overall: OverallStatus,
    pub services: BTreeMap<String, ServiceStatus>,
}

impl StatusSnapshot {
    pub fn all_reported(&self) -> bool {
        self.services.values().all(|s| s.last_result.is_some())
    }
}

/// What happened to a recorded result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Service no longer scheduled, or result from a replaced schedule
    Ignored,
    Unchanged(ServiceHealth),
    Changed { from: ServiceHealth, to: ServiceHealth },
}

struct Entry {
    generation: u64,
    status: ServiceStatus,
}

struct Inner {
    services: HashMap<String, Entry>,
    minimum_offline_time: Duration,
}

#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<RwLock<Inner>>,
    generations: Arc<AtomicU64>,
}

impl Aggregator {
    pub fn new(minimum_offline_time: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                services: HashMap::new(),
                minimum_offline_time,
            })),
            generations: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn set_minimum_offline_time(&self, minimum_offline_time: Duration) {
        self.inner.write().minimum_offline_time = minimum_offline_time;
    }

    pub fn minimum_offline_time(&self) -> Duration {
        self.inner.read().minimum_offline_time
    }

    /// Add (or reset) the entry for `name`; returns its schedule generation
    pub fn register(&self, name: &str) -> u64 {
        self.transition(&[], &[name.to_string()])
            .pop()
            .map(|(_, generation)| generation)
            .unwrap_or_default()
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.inner.write().services.remove(name).is_some()
    }

    /// Remove and (re)register entries under one write lock, so no snapshot
    /// observes a partially applied change.
    pub fn transition(&self, remove: &[String], register: &[String]) -> Vec<(String, u64)> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        for name in remove {
            inner.services.remove(name);
        }

        register
            .iter()
            .map(|name| {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                inner.services.insert(
                    name.clone(),
                    Entry {
                        generation,
                        status: ServiceStatus::pending(now),
                    },
                );
                (name.clone(), generation)
            })
            .collect()
    }

    /// Replace the latest result for `name`, whatever schedule produced it
    pub fn update(&self, name: &str, result: CheckResult) -> Recorded {
        self.apply(name, None, result)
    }

    /// Replace the latest result only if `generation` is still the active
    /// schedule for `name`
    pub fn record(&self, name: &str, generation: u64, result: CheckResult) -> Recorded {
        self.apply(name, Some(generation), result)
    }

    fn apply(&self, name: &str, generation: Option<u64>, result: CheckResult) -> Recorded {
        let mut inner = self.inner.write();
        let Some(entry) = inner.services.get_mut(name) else {
            return Recorded::Ignored;
        };
        if generation.is_some_and(|g| g != entry.generation) {
            return Recorded::Ignored;
        }

        let status = &mut entry.status;
        let from = status.health();
        let to = ServiceHealth::from(result.status);

        if from != to {
            status.since = result.completed_at;
        }
        status.consecutive_failures = match result.status {
            CheckStatus::Up => 0,
            CheckStatus::Down => status.consecutive_failures.saturating_add(1),
        };
        status.last_result = Some(result);

        if from == to {
            Recorded::Unchanged(to)
        } else {
            Recorded::Changed { from, to }
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> StatusSnapshot {
        let inner = self.inner.read();
        let services: BTreeMap<String, ServiceStatus> = inner
            .services
            .iter()
            .map(|(name, entry)| (name.clone(), entry.status.clone()))
            .collect();
        let overall = overall_status(services.values(), inner.minimum_offline_time, now);
        drop(inner);

        StatusSnapshot {
            taken_at: now,
            overall,
            services,
        }
    }

    pub fn overall_status(&self) -> OverallStatus {
        let inner = self.inner.read();
        overall_status(
            inner.services.values().map(|e| &e.status),
            inner.minimum_offline_time,
            Utc::now(),
        )
    }

    /// True once every registered service has at least one result
    pub fn all_reported(&self) -> bool {
        self.inner
            .read()
            .services
            .values()
            .all(|e| e.status.last_result.is_some())
    }

    pub fn len(&self) -> usize {
        self.inner.read().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().services.contains_key(name)
    }
}

fn overall_status<'a>(
    services: impl Iterator<Item = &'a ServiceStatus>,
    minimum_offline_time: Duration,
    now: DateTime<Utc>,
) -> OverallStatus {
    let mut degraded = false;
    for status in services {
        if let Some(down_for) = status.down_for(now) {
            if down_for >= minimum_offline_time {
                return OverallStatus::Offline;
            }
            degraded = true;
        }
    }
    if degraded {
        OverallStatus::Degraded
    } else {
        OverallStatus::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn down_at(at: DateTime<Utc>) -> CheckResult {
        CheckResult::down(Duration::from_millis(5), "connection refused").at(at)
    }

    fn up_at(at: DateTime<Utc>) -> CheckResult {
        CheckResult::up(Duration::from_millis(5)).at(at)
    }

    #[test]
    fn test_since_only_moves_on_status_change() {
        let aggregator = Aggregator::new(Duration::from_secs(60));
        aggregator.register("db");
        let t0 = Utc::now();

        assert_eq!(
            aggregator.update("db", down_at(t0)),
            Recorded::Changed { from: ServiceHealth::Unknown, to: ServiceHealth::Down }
        );
        assert_eq!(
            aggregator.update("db", down_at(t0 + TimeDelta::seconds(10))),
            Recorded::Unchanged(ServiceHealth::Down)
        );

        let snapshot = aggregator.snapshot();
        let db = &snapshot.services["db"];
        assert_eq!(db.since, t0);
        assert_eq!(db.consecutive_failures, 2);
        assert_eq!(db.last_result.as_ref().unwrap().completed_at, t0 + TimeDelta::seconds(10));

        let t1 = t0 + TimeDelta::seconds(20);
        aggregator.update("db", up_at(t1));
        let db = &aggregator.snapshot().services["db"];
        assert_eq!(db.since, t1);
        assert_eq!(db.consecutive_failures, 0);
    }

    #[test]
    fn test_hysteresis_degraded_then_offline() {
        let aggregator = Aggregator::new(Duration::from_secs(900));
        aggregator.register("api");
        aggregator.register("db");
        let t0 = Utc::now();

        aggregator.update("api", up_at(t0));
        aggregator.update("db", up_at(t0));
        assert_eq!(aggregator.snapshot_at(t0).overall, OverallStatus::Online);

        aggregator.update("db", down_at(t0));
        assert_eq!(
            aggregator.snapshot_at(t0 + TimeDelta::seconds(899)).overall,
            OverallStatus::Degraded
        );
        assert_eq!(
            aggregator.snapshot_at(t0 + TimeDelta::seconds(900)).overall,
            OverallStatus::Offline
        );

        // Recovery resets the clock
        aggregator.update("db", up_at(t0 + TimeDelta::seconds(901)));
        assert_eq!(
            aggregator.snapshot_at(t0 + TimeDelta::seconds(902)).overall,
            OverallStatus::Online
        );
    }

    #[test]
    fn test_flapping_never_reaches_offline() {
        let aggregator = Aggregator::new(Duration::from_secs(60));
        aggregator.register("db");
        let t0 = Utc::now();

        for i in 0..10 {
            let at = t0 + TimeDelta::seconds(i * 30);
            if i % 2 == 0 {
                aggregator.update("db", down_at(at));
            } else {
                aggregator.update("db", up_at(at));
            }
        }
        // Last result (i = 9) is up
        assert_eq!(
            aggregator.snapshot_at(t0 + TimeDelta::seconds(300)).overall,
            OverallStatus::Online
        );
    }

    #[test]
    fn test_unknown_services_do_not_degrade() {
        let aggregator = Aggregator::new(Duration::from_secs(60));
        aggregator.register("db");
        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.overall, OverallStatus::Online);
        assert_eq!(snapshot.services["db"].health(), ServiceHealth::Unknown);
        assert!(!snapshot.all_reported());
    }

    #[test]
    fn test_results_for_unknown_service_ignored() {
        let aggregator = Aggregator::new(Duration::from_secs(60));
        assert_eq!(aggregator.update("ghost", up_at(Utc::now())), Recorded::Ignored);
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_stale_generation_ignored() {
        let aggregator = Aggregator::new(Duration::from_secs(60));
        let old = aggregator.register("db");
        let new = aggregator.register("db");
        assert_ne!(old, new);

        assert_eq!(aggregator.record("db", old, up_at(Utc::now())), Recorded::Ignored);
        assert!(matches!(
            aggregator.record("db", new, up_at(Utc::now())),
            Recorded::Changed { .. }
        ));
    }

    #[test]
    fn test_transition_is_exact() {
        let aggregator = Aggregator::new(Duration::from_secs(60));
        aggregator.transition(&[], &["a".into(), "b".into(), "c".into()]);
        aggregator.transition(&["b".into()], &["d".into()]);

        let names: Vec<String> = aggregator.snapshot().services.keys().cloned().collect();
        assert_eq!(names, vec!["a", "c", "d"]);
        assert!(aggregator.unregister("a"));
        assert!(!aggregator.contains("a"));
        assert_eq!(aggregator.len(), 2);
    }

    #[test]
    fn test_zero_minimum_offline_time_is_immediate() {
        let aggregator = Aggregator::new(Duration::ZERO);
        aggregator.register("db");
        let t0 = Utc::now();
        aggregator.update("db", down_at(t0));
        assert_eq!(aggregator.snapshot_at(t0).overall, OverallStatus::Offline);
    }
}
