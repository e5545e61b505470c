//! Message bus publishing
//!
//! The agent only ever publishes, so the seam is a single `Bus` trait.
//! `MqttBus` is the production implementation: one rumqttc client whose
//! event loop is driven by a background task that reconnects on error.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BusConfig;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to connect to bus at {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("failed to publish on {subject}: {reason}")]
    Publish { subject: String, reason: String },
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Release the connection. Further publishes fail.
    async fn close(&self) {}
}

pub struct MqttBus {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    reconnects: Arc<AtomicU32>,
    shutdown: CancellationToken,
}

impl MqttBus {
    /// Connect and wait for the broker's first ConnAck within the configured
    /// connect timeout. The event loop keeps reconnecting afterwards.
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let address = format!("{}:{}", config.host, config.port);

        let mut opts = MqttOptions::new(&config.client_id, &config.host, config.port);
        opts.set_keep_alive(config.keep_alive);
        if let Some(credentials) = &config.credentials {
            opts.set_credentials(&credentials.username, &credentials.password);
        }

        let (client, eventloop) = AsyncClient::new(opts, CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let reconnects = Arc::new(AtomicU32::new(0));
        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(drive_event_loop(
            eventloop,
            connected.clone(),
            reconnects.clone(),
            shutdown.clone(),
            ready_tx,
        ));

        match tokio::time::timeout(config.connect_timeout, ready_rx).await {
            Ok(Ok(())) => {
                info!(address = %address, client_id = %config.client_id, "connected to bus");
                Ok(Self {
                    client,
                    connected,
                    reconnects,
                    shutdown,
                })
            }
            Ok(Err(_)) => {
                shutdown.cancel();
                Err(BusError::Connect {
                    address,
                    reason: "event loop stopped before connecting".to_string(),
                })
            }
            Err(_) => {
                shutdown.cancel();
                Err(BusError::Connect {
                    address,
                    reason: format!("no acknowledgement within {:?}", config.connect_timeout),
                })
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Publish {
                subject: subject.to_string(),
                reason: "not connected".to_string(),
            });
        }
        // try_publish fails on a full request queue instead of parking the
        // reporter behind a dead connection.
        self.client
            .try_publish(subject, QoS::AtLeastOnce, false, payload)
            .map_err(|e| BusError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "bus disconnect request failed");
        }
        self.shutdown.cancel();
        self.connected.store(false, Ordering::Release);
        info!("bus connection closed");
    }
}

async fn drive_event_loop(
    mut eventloop: rumqttc::EventLoop,
    connected: Arc<AtomicBool>,
    reconnects: Arc<AtomicU32>,
    shutdown: CancellationToken,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    if !connected.swap(true, Ordering::AcqRel) && ready.is_none() {
                        info!("bus connection restored");
                    }
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    connected.store(false, Ordering::Release);
                }
                Ok(_) => {}
                Err(e) => {
                    if connected.swap(false, Ordering::AcqRel) {
                        warn!(error = %e, "bus connection lost, reconnecting");
                    } else {
                        debug!(error = %e, "bus connection attempt failed");
                    }
                    reconnects.fetch_add(1, Ordering::Relaxed);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }
    connected.store(false, Ordering::Release);
    debug!("bus event loop stopped");
}
