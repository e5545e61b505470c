//! Configuration loading and validation
//!
//! Handles:
//! - TOML / JSON / YAML agent files with defaults
//! - Validation into an immutable `AgentConfig` snapshot
//! - Injectable `ConfigSource` used at startup and on hot reload

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::checks::{CheckKind, CustomCheck, HttpCheck, TcpCheck};

/// Active configuration, swapped wholesale on reload
pub type SharedConfig = Arc<ArcSwap<AgentConfig>>;

pub const DEFAULT_CONFIG_PATH: &str = "watchdog.toml";
pub const CONFIG_PATH_ENV: &str = "SYMBION_WATCHDOG_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config from {origin}: {message}")]
    Parse { origin: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Validated, immutable agent configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub agent_id: String,
    pub report_interval: Duration,
    pub check_interval: Duration,
    /// Continuous-down duration before the agent reports itself offline
    pub minimum_offline_time: Duration,
    pub health_bind: IpAddr,
    /// Port 0 binds an ephemeral port
    pub health_port: u16,
    pub config_reload_interval: Option<Duration>,
    pub shutdown_grace: Duration,
    pub log_level: String,
    pub bus: BusConfig,
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<BusCredentials>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub subject_prefix: String,
}

#[derive(Clone, PartialEq)]
pub struct BusCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BusCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One monitored service. Immutable once scheduled; a changed spec is
/// rescheduled from scratch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub kind: CheckKind,
    pub timeout: Duration,
    pub interval: Duration,
}

// Raw file model. Every field is optional so defaults live in one place.

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub agent: AgentSection,
    pub bus: BusSection,
    pub services: Vec<ServiceSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    pub agent_id: Option<String>,
    pub report_interval_secs: Option<u64>,
    pub check_interval_secs: Option<u64>,
    pub minimum_offline_secs: Option<u64>,
    pub health_bind: Option<IpAddr>,
    pub health_port: Option<u16>,
    pub config_reload_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub subject_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSection {
    pub name: String,
    pub kind: String,
    pub target: String,
    pub timeout_secs: Option<u64>,
    pub interval_secs: Option<u64>,
    pub expected_status: Option<u16>,
    pub expected_response: Option<String>,
    pub expected_exit_code: Option<i32>,
}

const DEFAULT_REPORT_INTERVAL_SECS: u64 = 60;
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;
const DEFAULT_MINIMUM_OFFLINE_SECS: u64 = 900;
const DEFAULT_HEALTH_PORT: u16 = 8080;
const DEFAULT_CONFIG_RELOAD_SECS: u64 = 3600;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SUBJECT_PREFIX: &str = "agent.report";
/// Upper bound for every duration setting (one year)
const MAX_DURATION_SECS: u64 = 365 * 24 * 3600;

impl AgentConfig {
    /// Subject the aggregate report is published on
    pub fn report_subject(&self) -> String {
        format!("{}.{}", self.bus.subject_prefix, self.agent_id)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            origin: "inline toml".to_string(),
            message: e.to_string(),
        })?;
        Self::from_file_config(file)
    }

    /// Parse a file according to its extension (TOML unless `.json`/`.yaml`)
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let origin = path.display().to_string();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

        let file: FileConfig = match extension {
            "json" => serde_json::from_str(content).map_err(|e| e.to_string()),
            "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| e.to_string()),
            _ => toml::from_str(content).map_err(|e| e.to_string()),
        }
        .map_err(|message| ConfigError::Parse { origin, message })?;

        Self::from_file_config(file)
    }

    /// Apply defaults and validate
    pub fn from_file_config(file: FileConfig) -> Result<Self, ConfigError> {
        let agent = file.agent;

        let agent_id = match agent.agent_id {
            Some(id) => id.trim().to_string(),
            None => default_agent_id(),
        };
        if agent_id.is_empty() {
            return Err(invalid("agent.agent_id must not be empty"));
        }
        if agent_id.contains(&['/', '+', '#'][..]) {
            return Err(invalid(format!(
                "agent.agent_id '{}' contains a reserved subject character",
                agent_id
            )));
        }

        let report_interval = positive_secs(
            "agent.report_interval_secs",
            agent.report_interval_secs.unwrap_or(DEFAULT_REPORT_INTERVAL_SECS),
        )?;
        let check_interval = positive_secs(
            "agent.check_interval_secs",
            agent.check_interval_secs.unwrap_or(DEFAULT_CHECK_INTERVAL_SECS),
        )?;
        let minimum_offline_time = bounded_secs(
            "agent.minimum_offline_secs",
            agent.minimum_offline_secs.unwrap_or(DEFAULT_MINIMUM_OFFLINE_SECS),
        )?;
        let config_reload_interval = match agent
            .config_reload_secs
            .unwrap_or(DEFAULT_CONFIG_RELOAD_SECS)
        {
            0 => None,
            secs => Some(positive_secs("agent.config_reload_secs", secs)?),
        };
        let shutdown_grace = bounded_secs(
            "agent.shutdown_grace_secs",
            agent.shutdown_grace_secs.unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
        )?;

        let bus = validate_bus(file.bus, &agent_id)?;

        let mut services = Vec::with_capacity(file.services.len());
        for section in file.services {
            let spec = validate_service(section, check_interval)?;
            if services.iter().any(|s: &ServiceSpec| s.name == spec.name) {
                return Err(invalid(format!("duplicate service name '{}'", spec.name)));
            }
            services.push(spec);
        }

        Ok(Self {
            agent_id,
            report_interval,
            check_interval,
            minimum_offline_time,
            health_bind: agent
                .health_bind
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            health_port: agent.health_port.unwrap_or(DEFAULT_HEALTH_PORT),
            config_reload_interval,
            shutdown_grace,
            log_level: agent.log_level.unwrap_or_else(|| "info".to_string()),
            bus,
            services,
        })
    }
}

fn validate_bus(bus: BusSection, agent_id: &str) -> Result<BusConfig, ConfigError> {
    let credentials = match (bus.username, bus.password) {
        (Some(username), Some(password)) => Some(BusCredentials { username, password }),
        (None, None) => None,
        _ => return Err(invalid("bus.username and bus.password must be set together")),
    };

    let host = bus.host.unwrap_or_else(|| "localhost".to_string());
    if host.trim().is_empty() {
        return Err(invalid("bus.host must not be empty"));
    }

    let subject_prefix = bus
        .subject_prefix
        .unwrap_or_else(|| DEFAULT_SUBJECT_PREFIX.to_string());
    if subject_prefix.is_empty() {
        return Err(invalid("bus.subject_prefix must not be empty"));
    }

    Ok(BusConfig {
        host,
        port: bus.port.unwrap_or(1883),
        client_id: bus
            .client_id
            .unwrap_or_else(|| format!("symbion-watchdog-{}", agent_id)),
        credentials,
        keep_alive: positive_secs("bus.keep_alive_secs", bus.keep_alive_secs.unwrap_or(15))?,
        connect_timeout: positive_secs(
            "bus.connect_timeout_secs",
            bus.connect_timeout_secs.unwrap_or(10),
        )?,
        subject_prefix,
    })
}

fn validate_service(section: ServiceSection, default_interval: Duration) -> Result<ServiceSpec, ConfigError> {
    let name = section.name.trim().to_string();
    if name.is_empty() {
        return Err(invalid("service name must not be empty"));
    }
    let target = section.target.trim().to_string();
    if target.is_empty() {
        return Err(invalid(format!("service '{}': target must not be empty", name)));
    }

    let timeout = positive_secs(
        &format!("service '{}' timeout_secs", name),
        section.timeout_secs.unwrap_or(DEFAULT_SERVICE_TIMEOUT_SECS),
    )?;
    let interval = match section.interval_secs {
        Some(secs) => positive_secs(&format!("service '{}' interval_secs", name), secs)?,
        None => default_interval,
    };

    let kind = match section.kind.to_ascii_lowercase().as_str() {
        "http" => {
            if section.expected_exit_code.is_some() {
                return Err(invalid(format!(
                    "service '{}': expected_exit_code only applies to custom checks",
                    name
                )));
            }
            let url = reqwest::Url::parse(&target).map_err(|e| {
                invalid(format!("service '{}': invalid URL '{}': {}", name, target, e))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(invalid(format!(
                    "service '{}': unsupported URL scheme '{}'",
                    name,
                    url.scheme()
                )));
            }
            if let Some(code) = section.expected_status {
                if !(100..=599).contains(&code) {
                    return Err(invalid(format!(
                        "service '{}': expected_status {} is not an HTTP status code",
                        name, code
                    )));
                }
            }
            CheckKind::Http(HttpCheck {
                url: target,
                expected_status: section.expected_status,
                expected_response: section.expected_response.filter(|s| !s.is_empty()),
            })
        }
        "tcp" => {
            if section.expected_status.is_some()
                || section.expected_response.is_some()
                || section.expected_exit_code.is_some()
            {
                return Err(invalid(format!(
                    "service '{}': tcp checks take no expectations",
                    name
                )));
            }
            validate_host_port(&name, &target)?;
            CheckKind::Tcp(TcpCheck { address: target })
        }
        "custom" => {
            if section.expected_status.is_some() || section.expected_response.is_some() {
                return Err(invalid(format!(
                    "service '{}': expected_status/expected_response only apply to http checks",
                    name
                )));
            }
            CheckKind::Custom(CustomCheck {
                command: target,
                expected_exit_code: section.expected_exit_code.unwrap_or(0),
            })
        }
        other => {
            return Err(invalid(format!(
                "service '{}': unknown check kind '{}' (expected http, tcp or custom)",
                name, other
            )))
        }
    };

    Ok(ServiceSpec {
        name,
        kind,
        timeout,
        interval,
    })
}

fn validate_host_port(name: &str, target: &str) -> Result<(), ConfigError> {
    let Some((host, port)) = target.rsplit_once(':') else {
        return Err(invalid(format!(
            "service '{}': tcp target '{}' must be host:port",
            name, target
        )));
    };
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid(format!(
            "service '{}': tcp target '{}' must be host:port",
            name, target
        )));
    }
    Ok(())
}

fn positive_secs(field: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(invalid(format!("{} must be greater than zero", field)));
    }
    bounded_secs(field, secs)
}

fn bounded_secs(field: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs > MAX_DURATION_SECS {
        return Err(invalid(format!(
            "{} must be at most {} seconds",
            field, MAX_DURATION_SECS
        )));
    }
    Ok(Duration::from_secs(secs))
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn default_agent_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "symbion-watchdog".to_string())
}

/// Producer of `AgentConfig` snapshots, consulted at startup and on reload
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<AgentConfig, ConfigError>;

    fn describe(&self) -> String;
}

/// Reads the agent file from disk on every load
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `--config` flag, then `SYMBION_WATCHDOG_CONFIG`, then `watchdog.toml`
    pub fn resolve(cli_path: Option<PathBuf>) -> Self {
        let path = cli_path
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self) -> Result<AgentConfig, ConfigError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Read {
                path: self.path.clone(),
                source,
            })?;
        AgentConfig::parse(&self.path, &content)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
