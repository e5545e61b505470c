/*!
Bus en mémoire pour tester le watchdog sans broker

Enregistre chaque publication et permet de simuler une panne du bus.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use symbion_watchdog::{AggregateReport, Bus, BusError};

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Implémentation de `Bus` qui garde tout en mémoire
#[derive(Clone, Default)]
pub struct MockBus {
    published: Arc<Mutex<Vec<MockMessage>>>,
    failing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simule un broker injoignable: chaque publish échoue
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<MockMessage> {
        self.published.lock().clone()
    }

    pub fn find_by_subject(&self, subject: &str) -> Vec<MockMessage> {
        self.published
            .lock()
            .iter()
            .filter(|msg| msg.subject == subject)
            .cloned()
            .collect()
    }

    pub fn count(&self, subject: &str) -> usize {
        self.find_by_subject(subject).len()
    }

    /// Parse le dernier message d'un sujet en JSON
    pub fn last_json<T>(&self, subject: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_by_subject(subject).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn last_report(&self, subject: &str) -> Result<Option<AggregateReport>> {
        self.last_json(subject)
    }

    /// Attend qu'au moins `count` messages soient publiés sur `subject`
    pub async fn wait_for_count(&self, subject: &str, count: usize, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if self.count(subject) >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        log::warn!("⏰ Timeout waiting for {} messages on {}", count, subject);
        false
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.failing.load(Ordering::SeqCst) || self.is_closed() {
            return Err(BusError::Publish {
                subject: subject.to_string(),
                reason: "mock bus unavailable".to_string(),
            });
        }
        log::info!("📤 [MOCK] Published to {}: {} bytes", subject, payload.len());
        self.published.lock().push(MockMessage {
            subject: subject.to_string(),
            payload,
        });
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
