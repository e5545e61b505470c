/*!
Source de configuration pilotable depuis les tests

Remplace `FileConfigSource` pour tester le rechargement à chaud sans
passer par le disque.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use symbion_watchdog::{AgentConfig, ConfigError, ConfigSource};

pub struct StaticConfigSource {
    next: Mutex<Result<AgentConfig, String>>,
    loads: AtomicUsize,
}

impl StaticConfigSource {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            next: Mutex::new(Ok(config)),
            loads: AtomicUsize::new(0),
        }
    }

    /// Config renvoyée au prochain `load`
    pub fn set(&self, config: AgentConfig) {
        *self.next.lock() = Ok(config);
    }

    /// Fait échouer les prochains `load` avec une erreur de validation
    pub fn fail_with(&self, message: &str) {
        *self.next.lock() = Err(message.to_string());
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load(&self) -> Result<AgentConfig, ConfigError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.next.lock().clone().map_err(ConfigError::Invalid)
    }

    fn describe(&self) -> String {
        "static test source".to_string()
    }
}
