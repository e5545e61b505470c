//! Agent orchestrator
//!
//! Owns the lifecycle of every component:
//! - start: probes listener, scheduler first pass, reporter, reload timer
//! - stop: ticks, in-flight checks (with grace), reporter, probes last
//! - reload: load a new config and apply the service diff in one step

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::bus::{Bus, BusError};
use crate::checks::CheckContext;
use crate::config::{AgentConfig, ConfigError, ConfigSource, SharedConfig};
use crate::probes::{ProbeServer, ProbeState};
use crate::reporter::Reporter;
use crate::scheduler::{ScheduleDiff, Scheduler, ShutdownReport};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind health probes on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("agent already started")]
    AlreadyStarted,
}

/// Outcome of an applied reload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub diff: ScheduleDiff,
    /// Settings that changed on disk but only apply after a restart
    pub restart_required: Vec<&'static str>,
}

/// Loads a fresh config and applies it to the running schedule. Reloads are
/// serialized so the timer and an external trigger never interleave.
#[derive(Clone)]
struct Reloader {
    source: Arc<dyn ConfigSource>,
    config: SharedConfig,
    aggregator: Aggregator,
    scheduler: Arc<Scheduler>,
    lock: Arc<tokio::sync::Mutex<()>>,
    report_interval_changed: Arc<Notify>,
}

impl Reloader {
    async fn reload(&self) -> Result<ReloadSummary, ConfigError> {
        let _guard = self.lock.lock().await;

        let mut next = match self.source.load().await {
            Ok(config) => config,
            Err(e) => {
                error!(source = %self.source.describe(), error = %e, "config reload rejected, keeping current config");
                return Err(e);
            }
        };

        let current = self.config.load_full();
        let mut restart_required = Vec::new();
        if next.health_bind != current.health_bind || next.health_port != current.health_port {
            restart_required.push("health probe address");
            next.health_bind = current.health_bind;
            next.health_port = current.health_port;
        }
        if next.bus != current.bus {
            restart_required.push("bus");
            next.bus = current.bus.clone();
        }
        if next.agent_id != current.agent_id {
            restart_required.push("agent_id");
            next.agent_id = current.agent_id.clone();
        }
        if !restart_required.is_empty() {
            warn!(settings = ?restart_required, "changed settings require a restart, keeping current values");
        }

        let report_interval_changed = next.report_interval != current.report_interval;
        self.aggregator.set_minimum_offline_time(next.minimum_offline_time);
        let diff = self.scheduler.apply(&next.services);
        self.config.store(Arc::new(next));
        if report_interval_changed {
            self.report_interval_changed.notify_one();
        }

        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            updated = diff.updated.len(),
            "config reloaded"
        );
        Ok(ReloadSummary {
            diff,
            restart_required,
        })
    }

    fn spawn_timer(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(interval) = self.config.load().config_reload_interval else {
                    info!("config reload timer disabled");
                    break;
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        // Failures are logged by reload and the old config stays active
                        let _ = self.reload().await;
                    }
                }
            }
        })
    }
}

struct Running {
    probes: ProbeServer,
    reporter: JoinHandle<()>,
    reporter_stop: CancellationToken,
    reload_timer: Option<JoinHandle<()>>,
    reload_stop: CancellationToken,
}

pub struct Agent {
    config: SharedConfig,
    aggregator: Aggregator,
    scheduler: Arc<Scheduler>,
    bus: Arc<dyn Bus>,
    reloader: Reloader,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl Agent {
    /// Wire an agent around an initial config and its collaborators. Nothing
    /// runs until `start`.
    pub fn new(
        config: AgentConfig,
        source: Arc<dyn ConfigSource>,
        bus: Arc<dyn Bus>,
    ) -> Result<Self, AgentError> {
        let aggregator = Aggregator::new(config.minimum_offline_time);
        let scheduler = Arc::new(Scheduler::new(aggregator.clone(), CheckContext::new()?));
        let config: SharedConfig = Arc::new(ArcSwap::from_pointee(config));

        let reloader = Reloader {
            source,
            config: config.clone(),
            aggregator: aggregator.clone(),
            scheduler: scheduler.clone(),
            lock: Arc::new(tokio::sync::Mutex::new(())),
            report_interval_changed: Arc::new(Notify::new()),
        };

        Ok(Self {
            config,
            aggregator,
            scheduler,
            bus,
            reloader,
            started: AtomicBool::new(false),
            running: Mutex::new(None),
        })
    }

    /// Bring components up in dependency order. Returns once the first check
    /// pass has completed and the initial report has been attempted.
    pub async fn start(&self) -> Result<(), AgentError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(AgentError::AlreadyStarted);
        }
        let config = self.config.load_full();
        info!(
            agent_id = %config.agent_id,
            services = config.services.len(),
            "starting agent"
        );

        let addr = SocketAddr::new(config.health_bind, config.health_port);
        let state = ProbeState::new(
            self.aggregator.clone(),
            self.scheduler.readiness(),
            self.config.clone(),
        );
        let probes = ProbeServer::bind(addr, state)
            .await
            .map_err(|source| AgentError::Bind { addr, source })?;

        self.scheduler.start(&config.services).await;

        let reporter_stop = CancellationToken::new();
        let reporter = Reporter::new(self.aggregator.clone(), self.config.clone(), self.bus.clone())
            .with_interval_signal(self.reloader.report_interval_changed.clone())
            .spawn(reporter_stop.clone());

        let reload_stop = CancellationToken::new();
        let reload_timer = config
            .config_reload_interval
            .map(|_| self.reloader.clone().spawn_timer(reload_stop.clone()));

        *self.running.lock() = Some(Running {
            probes,
            reporter,
            reporter_stop,
            reload_timer,
            reload_stop,
        });
        info!("agent started");
        Ok(())
    }

    /// Shut down in reverse order. Readiness drops first; the probe
    /// listener is the last thing to go.
    pub async fn stop(&self, grace: Duration) -> ShutdownReport {
        let Some(running) = self.running.lock().take() else {
            warn!("stop requested but agent is not running");
            return ShutdownReport {
                drained: true,
                cancelled: 0,
            };
        };
        info!(grace = ?grace, "stopping agent");

        running.reload_stop.cancel();
        if let Some(timer) = running.reload_timer {
            if let Err(e) = timer.await {
                warn!(error = %e, "reload timer task failed");
            }
        }

        let report = self.scheduler.stop(grace).await;

        running.reporter_stop.cancel();
        if let Err(e) = running.reporter.await {
            warn!(error = %e, "reporter task failed");
        }

        running.probes.stop().await;
        self.bus.close().await;

        info!(drained = report.drained, cancelled = report.cancelled, "agent stopped");
        report
    }

    /// Load and apply a new config now. On error the current config stays
    /// fully active.
    pub async fn reload(&self) -> Result<ReloadSummary, ConfigError> {
        self.reloader.reload().await
    }

    pub fn config(&self) -> Arc<AgentConfig> {
        self.config.load_full()
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn is_ready(&self) -> bool {
        self.scheduler.first_pass_complete()
    }

    /// Bound probe address, once started
    pub fn probe_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.probes.local_addr())
    }
}
