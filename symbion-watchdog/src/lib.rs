//! Symbion Watchdog - service monitoring agent
//!
//! Periodically checks a configured set of services (HTTP, TCP, custom
//! command), folds the results into one agent status, publishes it on the
//! bus and exposes liveness / readiness / health probes over HTTP.

pub mod agent;
pub mod aggregator;
pub mod bus;
pub mod checks;
pub mod config;
pub mod probes;
pub mod reporter;
pub mod scheduler;

pub use agent::{Agent, AgentError, ReloadSummary};
pub use aggregator::{Aggregator, OverallStatus, ServiceHealth, ServiceStatus, StatusSnapshot};
pub use bus::{Bus, BusError, MqttBus};
pub use checks::{CheckKind, CheckResult, CheckStatus};
pub use config::{AgentConfig, ConfigError, ConfigSource, FileConfigSource, ServiceSpec};
pub use reporter::{AggregateReport, ServiceReport};
pub use scheduler::{Dispatch, ScheduleDiff, ShutdownReport};
