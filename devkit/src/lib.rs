/*!
# Symbion DevKit - Stubs et utilitaires de test pour le watchdog

Bibliothèque facilitant les tests de symbion-watchdog avec:
- Bus en mémoire (pas de broker MQTT requis)
- Source de config pilotable pour le rechargement à chaud
- Validation des rapports contre les contrats JSON
- Harness et helpers d'attente
*/

pub mod bus_stub;
pub mod config_stub;
pub mod contract_helpers;
pub mod test_utils;

pub use bus_stub::MockBus;
pub use config_stub::StaticConfigSource;
pub use contract_helpers::{Contract, ContractLoader};
pub use test_utils::TestHarness;
