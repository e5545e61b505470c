//! Service check scheduler
//!
//! One recurring timer per service. Each tick spawns at most one check task
//! for that service (single-flight); the tick loop never waits for the check.
//! Finished checks write into the aggregator and clear the in-flight flag.
//!
//! Cancellation is split in two so shutdown can drain:
//! - `ticks`  stops scheduling new checks
//! - `checks` aborts checks still running past the grace period

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::aggregator::{Aggregator, Recorded};
use crate::checks::{self, CheckContext};
use crate::config::ServiceSpec;

/// Outcome of a manual or timer tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Spawned,
    /// Previous check for the service still running
    SkippedInFlight,
    UnknownService,
}

/// Changes applied by a reload
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScheduleDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl ScheduleDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// How in-flight checks ended during shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drained: bool,
    pub cancelled: usize,
}

/// Per-service schedule state shared by the tick loop and its check tasks
struct ServiceSlot {
    spec: ServiceSpec,
    generation: u64,
    in_flight: AtomicBool,
    cancel: CancellationToken,
}

struct Worker {
    slot: Arc<ServiceSlot>,
    ticks: CancellationToken,
}

impl Worker {
    fn retire(&self) {
        self.ticks.cancel();
        self.slot.cancel.cancel();
    }
}

/// State needed to run a check, cloned into every task
#[derive(Clone)]
struct Dispatcher {
    aggregator: Aggregator,
    context: CheckContext,
    tracker: TaskTracker,
    first_pass: Arc<AtomicBool>,
}

impl Dispatcher {
    fn dispatch(&self, slot: &Arc<ServiceSlot>) -> Option<JoinHandle<()>> {
        if slot
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(service = %slot.spec.name, "check still in flight, skipping tick");
            return None;
        }

        let dispatcher = self.clone();
        let slot = slot.clone();
        Some(self.tracker.spawn(async move {
            let result = checks::execute(&slot.spec, &dispatcher.context, &slot.cancel).await;
            dispatcher.complete(&slot, result);
        }))
    }

    fn complete(&self, slot: &ServiceSlot, result: checks::CheckResult) {
        let name = &slot.spec.name;

        if slot.cancel.is_cancelled() {
            debug!(service = %name, "check cancelled, result discarded");
        } else {
            if let Some(error) = &result.error {
                debug!(service = %name, error = %error, "check failed");
            }
            match self.aggregator.record(name, slot.generation, result) {
                Recorded::Changed { from, to } => {
                    info!(service = %name, ?from, ?to, "service status changed");
                }
                Recorded::Unchanged(_) => {}
                Recorded::Ignored => {
                    debug!(service = %name, "result for retired schedule ignored");
                }
            }
        }

        slot.in_flight.store(false, Ordering::Release);
        self.refresh_first_pass();
    }

    fn refresh_first_pass(&self) {
        // Closed tracker means draining; readiness stays down
        if self.tracker.is_closed() {
            return;
        }
        if !self.first_pass.load(Ordering::Acquire) && self.aggregator.all_reported() {
            self.first_pass.store(true, Ordering::Release);
            info!(services = self.aggregator.len(), "first check pass complete");
        }
    }

    async fn run_ticks(self, slot: Arc<ServiceSlot>, ticks: CancellationToken, immediate: bool) {
        let period = slot.spec.interval;
        let now = Instant::now();
        let start = if immediate {
            now
        } else {
            // Intervals are capped by config validation; saturate anyway so
            // a hand-built spec cannot panic the tick task.
            now.checked_add(period).unwrap_or(now)
        };
        let mut ticker = interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticks.cancelled() => break,
                _ = ticker.tick() => {
                    self.dispatch(&slot);
                }
            }
        }
        debug!(service = %slot.spec.name, "tick loop stopped");
    }
}

pub struct Scheduler {
    dispatcher: Dispatcher,
    workers: Mutex<HashMap<String, Worker>>,
    ticks: CancellationToken,
    checks: CancellationToken,
}

impl Scheduler {
    pub fn new(aggregator: Aggregator, context: CheckContext) -> Self {
        Self {
            dispatcher: Dispatcher {
                aggregator,
                context,
                tracker: TaskTracker::new(),
                first_pass: Arc::new(AtomicBool::new(false)),
            },
            workers: Mutex::new(HashMap::new()),
            ticks: CancellationToken::new(),
            checks: CancellationToken::new(),
        }
    }

    /// Schedule `services` and run one check for each before returning
    pub async fn start(&self, services: &[ServiceSpec]) {
        info!(services = services.len(), "starting scheduler, running first check pass");

        let first_pass: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock();
            let names: Vec<String> = services.iter().map(|s| s.name.clone()).collect();
            let generations = self.dispatcher.aggregator.transition(&[], &names);

            services
                .iter()
                .zip(generations)
                .filter_map(|(spec, (_, generation))| {
                    let slot = self.spawn_worker(&mut workers, spec.clone(), generation, false);
                    self.dispatcher.dispatch(&slot)
                })
                .collect()
        };

        for handle in first_pass {
            if let Err(e) = handle.await {
                warn!(error = %e, "first pass check task failed");
            }
        }
        self.dispatcher.refresh_first_pass();
    }

    /// Diff `services` against the running schedule and apply the result as
    /// one transition. Unchanged services keep their timers and results.
    pub fn apply(&self, services: &[ServiceSpec]) -> ScheduleDiff {
        let mut workers = self.workers.lock();
        let mut diff = ScheduleDiff::default();

        for name in workers.keys() {
            if !services.iter().any(|s| &s.name == name) {
                diff.removed.push(name.clone());
            }
        }
        let mut changed: Vec<&ServiceSpec> = Vec::new();
        for spec in services {
            match workers.get(&spec.name) {
                None => {
                    diff.added.push(spec.name.clone());
                    changed.push(spec);
                }
                Some(worker) if worker.slot.spec != *spec => {
                    diff.updated.push(spec.name.clone());
                    changed.push(spec);
                }
                Some(_) => {}
            }
        }

        if diff.is_empty() {
            return diff;
        }

        let register: Vec<String> = changed.iter().map(|s| s.name.clone()).collect();
        let generations = self.dispatcher.aggregator.transition(&diff.removed, &register);

        for name in diff.removed.iter().chain(diff.updated.iter()) {
            if let Some(worker) = workers.remove(name) {
                worker.retire();
            }
        }
        for (spec, (_, generation)) in changed.into_iter().zip(generations) {
            self.spawn_worker(&mut workers, spec.clone(), generation, true);
        }
        drop(workers);

        self.dispatcher.refresh_first_pass();
        diff.added.sort();
        diff.removed.sort();
        diff.updated.sort();
        diff
    }

    fn spawn_worker(
        &self,
        workers: &mut HashMap<String, Worker>,
        spec: ServiceSpec,
        generation: u64,
        immediate: bool,
    ) -> Arc<ServiceSlot> {
        let name = spec.name.clone();
        let slot = Arc::new(ServiceSlot {
            spec,
            generation,
            in_flight: AtomicBool::new(false),
            cancel: self.checks.child_token(),
        });
        let ticks = self.ticks.child_token();

        debug!(
            service = %name,
            kind = slot.spec.kind.label(),
            interval = ?slot.spec.interval,
            "scheduling service"
        );
        tokio::spawn(
            self.dispatcher
                .clone()
                .run_ticks(slot.clone(), ticks.clone(), immediate),
        );

        if let Some(previous) = workers.insert(name, Worker { slot: slot.clone(), ticks }) {
            previous.retire();
        }
        slot
    }

    /// Dispatch a check for `name` now, outside its timer
    pub fn trigger(&self, name: &str) -> Dispatch {
        let slot = match self.workers.lock().get(name) {
            Some(worker) => worker.slot.clone(),
            None => return Dispatch::UnknownService,
        };
        match self.dispatcher.dispatch(&slot) {
            Some(_) => Dispatch::Spawned,
            None => Dispatch::SkippedInFlight,
        }
    }

    /// Stop ticking, give in-flight checks `grace` to finish, then cancel them
    pub async fn stop(&self, grace: Duration) -> ShutdownReport {
        self.ticks.cancel();
        let tracker = &self.dispatcher.tracker;
        tracker.close();
        self.dispatcher.first_pass.store(false, Ordering::Release);

        let in_flight = tracker.len();
        if in_flight > 0 {
            info!(in_flight, grace = ?grace, "waiting for in-flight checks");
        }

        let report = match tokio::time::timeout(grace, tracker.wait()).await {
            Ok(()) => ShutdownReport {
                drained: true,
                cancelled: 0,
            },
            Err(_) => {
                let cancelled = tracker.len();
                warn!(cancelled, "grace period elapsed, cancelling in-flight checks");
                self.checks.cancel();
                tracker.wait().await;
                ShutdownReport {
                    drained: false,
                    cancelled,
                }
            }
        };

        self.workers.lock().clear();
        info!("scheduler stopped");
        report
    }

    pub fn first_pass_complete(&self) -> bool {
        self.dispatcher.first_pass.load(Ordering::Acquire)
    }

    /// Shared readiness flag for the health probes
    pub fn readiness(&self) -> Arc<AtomicBool> {
        self.dispatcher.first_pass.clone()
    }

    pub fn scheduled(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn spec(&self, name: &str) -> Option<ServiceSpec> {
        self.workers.lock().get(name).map(|w| w.slot.spec.clone())
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.tracker.len()
    }
}
