use crate::config::ConnectSettings;
use crate::error::BusError;
use courier_broker::{Connection, ConnectionEvent, Connector};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, instrument, warn};

/// Owns the single broker connection of the bus.
///
/// Connects lazily with exponential backoff. Nothing reconnects on its own: after a
/// shutdown event the handle is released and the next [`ChannelManager`] call, a
/// publish or a consumer restart, connects again.
///
/// [`ChannelManager`]: crate::topology::ChannelManager
#[derive(Debug)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ConnectSettings,
    current: RwLock<Option<Arc<dyn Connection>>>,
    gate: Mutex<()>,
    closed: AtomicBool,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, settings: ConnectSettings) -> Arc<Self> {
        Arc::new(Self {
            connector,
            settings,
            current: RwLock::new(None),
            gate: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current.read().as_ref().is_some_and(|c| c.is_open())
    }

    /// The open connection.
    ///
    /// # Errors
    /// [`BusError::NotConnected`] if there is none.
    pub fn connection(&self) -> Result<Arc<dyn Connection>, BusError> {
        match self.current.read().as_ref() {
            Some(connection) if connection.is_open() => Ok(Arc::clone(connection)),
            _ => Err(BusError::NotConnected {
                message: "No open broker connection".into(),
                context: None,
            }),
        }
    }

    /// Connects unless already connected. Concurrent callers share one attempt loop.
    ///
    /// Waits `2^attempt` seconds between attempts. Returns `Ok(false)` once the
    /// manager has been closed.
    ///
    /// # Errors
    /// [`BusError::ConnectionUnavailable`] after `connect.max_attempts` failures.
    #[instrument(skip(self), fields(max_attempts = self.settings.max_attempts))]
    pub async fn try_connect(self: &Arc<Self>) -> Result<bool, BusError> {
        if self.is_connected() {
            return Ok(true);
        }

        let _gate = self.gate.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        if self.is_connected() {
            return Ok(true);
        }

        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1_u32;
        loop {
            match self.connector.connect().await {
                Ok(connection) => {
                    info!(attempt, "Connected to broker");
                    self.watch(&connection);
                    *self.current.write() = Some(connection);
                    return Ok(true);
                },
                Err(err) if attempt >= max_attempts => {
                    error!(attempt, error = %err, "Giving up on broker connection");
                    return Err(BusError::ConnectionUnavailable {
                        message: err.to_string().into(),
                        context: Some(format!("after {attempt} attempts").into()),
                    });
                },
                Err(err) => {
                    let delay = backoff(attempt);
                    warn!(attempt, error = %err, delay_secs = delay.as_secs(), "Broker connection failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }

    /// Closes the connection; later [`Self::try_connect`] calls do nothing.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _gate = self.gate.lock().await;
        let current = self.current.write().take();
        if let Some(connection) = current {
            if let Err(err) = connection.close().await {
                warn!(error = %err, "Failed to close broker connection");
            } else {
                info!("Broker connection closed");
            }
        }
    }

    fn release(&self, connection: &Weak<dyn Connection>) {
        let mut current = self.current.write();
        if current.as_ref().is_some_and(|c| std::ptr::addr_eq(Arc::as_ptr(c), connection.as_ptr())) {
            *current = None;
        }
    }

    fn watch(self: &Arc<Self>, connection: &Arc<dyn Connection>) {
        let mut events = connection.events();
        let manager = Arc::downgrade(self);
        let connection = Arc::downgrade(connection);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Shutdown { reason }) => {
                        warn!(%reason, "Broker connection shut down");
                        if let Some(manager) = manager.upgrade() {
                            manager.release(&connection);
                        }
                        break;
                    },
                    Ok(ConnectionEvent::Blocked { reason }) => {
                        warn!(%reason, "Broker connection blocked");
                    },
                    Ok(ConnectionEvent::Unblocked) => info!("Broker connection unblocked"),
                    Ok(ConnectionEvent::CallbackError { message }) => {
                        error!(%message, "Broker connection callback failed");
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Connection event listener lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

/// `2^attempt` seconds.
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(2_u64.saturating_pow(attempt))
}
