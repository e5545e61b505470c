/*!
Test Harness pour le watchdog

Facilite l'écriture de tests d'intégration avec:
- Bus mock et source de config pilotable déjà branchés
- Configs de test (probes sur port éphémère, reload désactivé)
- Attentes par polling et validation des rapports contre le contrat
*/

use crate::bus_stub::MockBus;
use crate::config_stub::StaticConfigSource;
use crate::contract_helpers::{workspace_contracts_dir, ContractLoader};
use anyhow::{Context, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use symbion_watchdog::{Agent, AgentConfig};

pub const TEST_AGENT_ID: &str = "test-agent";

/// Harness de test complet pour l'agent
pub struct TestHarness {
    pub bus: MockBus,
    pub source: Arc<StaticConfigSource>,
    pub contracts: ContractLoader,
}

impl TestHarness {
    pub fn new(initial: &AgentConfig) -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        Self {
            bus: MockBus::new(),
            source: Arc::new(StaticConfigSource::new(initial.clone())),
            contracts: ContractLoader::new(workspace_contracts_dir()),
        }
    }

    /// Charge les contrats du workspace
    pub fn with_contracts(mut self) -> Result<Self> {
        self.contracts.load_mqtt_contracts()?;
        log::info!("📚 Loaded contracts for testing");
        Ok(self)
    }

    /// Construit un agent branché sur le bus mock et la source pilotable
    pub fn agent(&self, config: AgentConfig) -> Result<Agent> {
        Ok(Agent::new(config, self.source.clone(), Arc::new(self.bus.clone()))?)
    }

    pub fn report_subject(&self) -> String {
        format!("agent.report.{}", TEST_AGENT_ID)
    }

    /// Dernier rapport publié, validé contre `agent.report@v1`
    pub fn last_report_checked(&self) -> Result<Value> {
        let report: Value = self
            .bus
            .last_json(&self.report_subject())?
            .context("no report published yet")?;
        let contract = self
            .contracts
            .get_contract("agent.report")
            .context("agent.report contract not loaded")?;
        contract.validate(&report)?;
        Ok(report)
    }
}

/// Config de test: probes sur 127.0.0.1 port éphémère, reload désactivé
pub fn test_config(services_toml: &str) -> AgentConfig {
    let content = format!(
        r#"
[agent]
agent_id = "{TEST_AGENT_ID}"
health_bind = "127.0.0.1"
health_port = 0
report_interval_secs = 60
config_reload_secs = 0
shutdown_grace_secs = 5

{services_toml}
"#
    );
    match AgentConfig::from_toml_str(&content) {
        Ok(config) => config,
        Err(e) => panic!("invalid test config: {e}"),
    }
}

/// Port local sur lequel personne n'écoute
pub fn closed_local_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

/// Attend qu'une condition devienne vraie (polling toutes les 20ms)
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// GET sur un probe de l'agent: (code HTTP, corps)
pub async fn probe(addr: SocketAddr, path: &str) -> Result<(u16, String)> {
    let response = reqwest::get(format!("http://{}{}", addr, path)).await?;
    let code = response.status().as_u16();
    Ok((code, response.text().await?))
}

/// Écrit un fichier de config dans `dir`
pub fn write_config(dir: &Path, file_name: &str, content: &str) -> Result<PathBuf> {
    let path = dir.join(file_name);
    std::fs::write(&path, content)?;
    Ok(path)
}
