use crate::config::{PrefetchSettings, RetrySettings};
use crate::connection::ConnectionManager;
use crate::error::{BusError, BusErrorExt};
use crate::naming;
use crate::retry::retry_delay;
use courier_broker::{Channel, ExchangeKind, QueueOptions};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// What has been declared for one event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyRecord {
    pub kind: ExchangeKind,
    /// Primary, dead-letter and retry exchanges, in declaration order.
    pub exchanges: Vec<String>,
}

/// Owns the shared channel and builds the per-event exchange/queue topology.
#[derive(Debug)]
pub struct ChannelManager {
    connections: Arc<ConnectionManager>,
    prefetch: PrefetchSettings,
    retry: RetrySettings,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    channel_gate: Mutex<()>,
    topology_gate: Mutex<()>,
    declared: DashMap<String, TopologyRecord>,
}

impl ChannelManager {
    #[must_use]
    pub fn new(
        connections: Arc<ConnectionManager>,
        prefetch: PrefetchSettings,
        retry: RetrySettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections,
            prefetch,
            retry,
            channel: RwLock::new(None),
            channel_gate: Mutex::new(()),
            topology_gate: Mutex::new(()),
            declared: DashMap::new(),
        })
    }

    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// The shared channel, opened on first use with the prefetch QoS applied.
    ///
    /// # Errors
    /// Connection failures, or the broker refusing the channel or QoS.
    pub async fn channel(&self) -> Result<Arc<dyn Channel>, BusError> {
        if let Some(channel) = self.open_channel() {
            return Ok(channel);
        }

        let _gate = self.channel_gate.lock().await;
        if let Some(channel) = self.open_channel() {
            return Ok(channel);
        }

        if !self.connections.is_connected() && !self.connections.try_connect().await? {
            return Err(BusError::ShutDown {
                message: "Connection manager is closed".into(),
                context: None,
            });
        }
        let channel =
            self.connections.connection()?.create_channel().await.context("Failed to open channel")?;
        if self.prefetch.enabled {
            channel
                .basic_qos(self.prefetch.count, self.prefetch.global)
                .await
                .context("Failed to apply prefetch")?;
        }
        debug!(prefetch = self.prefetch.count, "Channel opened");

        *self.channel.write() = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Drops the cached channel if it is no longer open, so the next call opens a new one.
    pub fn discard_if_closed(&self) {
        let mut slot = self.channel.write();
        if slot.as_ref().is_some_and(|c| !c.is_open()) {
            *slot = None;
        }
    }

    fn open_channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.read().as_ref().filter(|c| c.is_open()).cloned()
    }

    #[must_use]
    pub fn exchange_kind(&self, event: &str) -> Option<ExchangeKind> {
        self.declared.get(event).map(|record| record.kind)
    }

    #[must_use]
    pub fn topology(&self, event: &str) -> Option<TopologyRecord> {
        self.declared.get(event).map(|record| record.clone())
    }

    /// Declares the primary exchange of `event` with its dead-letter and retry tiers.
    ///
    /// Idempotent: once declared with `kind`, repeat calls touch nothing. A different
    /// kind, locally or on the broker (`406`), deletes and redeclares the primary exchange.
    ///
    /// # Errors
    /// Broker failures other than the self-healed kind conflict.
    #[instrument(skip(self, kind), fields(kind = %kind))]
    pub async fn ensure_exchange(&self, event: &str, kind: ExchangeKind) -> Result<(), BusError> {
        if self.exchange_kind(event) == Some(kind) {
            return Ok(());
        }

        let _gate = self.topology_gate.lock().await;
        match self.exchange_kind(event) {
            Some(current) if current == kind => return Ok(()),
            Some(current) => {
                warn!(%current, "Exchange kind changed in process, recreating primary exchange");
                self.recreate_exchange(&naming::exchange(event), kind).await?;
                if let Some(mut record) = self.declared.get_mut(event) {
                    record.kind = kind;
                }
                return Ok(());
            },
            None => {},
        }

        let mut exchanges = Vec::with_capacity(self.retry.max_attempts as usize + 2);

        let dlx = naming::dead_letter_exchange(event);
        let dlq = naming::dead_letter_queue(event);
        let channel = self.channel().await?;
        channel.exchange_declare(&dlx, ExchangeKind::Fanout).await.context("Failed to declare DLX")?;
        channel.queue_declare(&dlq, QueueOptions::durable()).await.context("Failed to declare DLQ")?;
        channel.queue_bind(&dlq, &dlx, "").await.context("Failed to bind DLQ")?;
        exchanges.push(dlx);

        if self.retry.enabled {
            for tier in 1..=self.retry.max_attempts {
                exchanges.push(self.declare_retry_tier(event, tier).await?);
            }
        }

        let primary = naming::exchange(event);
        let channel = self.channel().await?;
        match channel.exchange_declare(&primary, kind).await {
            Ok(()) => {},
            Err(err) if err.is_precondition_failed() => {
                warn!(exchange = %primary, error = %err, "Exchange exists with another kind, recreating");
                self.recreate_exchange(&primary, kind).await?;
            },
            Err(err) => {
                self.discard_if_closed();
                return Err(err).context("Failed to declare exchange");
            },
        }
        exchanges.insert(0, primary);

        info!(exchanges = exchanges.len(), "Event topology declared");
        self.declared.insert(event.to_owned(), TopologyRecord { kind, exchanges });
        Ok(())
    }

    async fn declare_retry_tier(&self, event: &str, tier: u32) -> Result<String, BusError> {
        let exchange = naming::retry_exchange(event, tier);
        let queue = naming::retry_queue(event, tier);
        let ttl = retry_delay(&self.retry, tier);
        let options = QueueOptions::durable()
            .argument(naming::MESSAGE_TTL_ARG, ttl)
            .argument(naming::DEAD_LETTER_EXCHANGE_ARG, naming::exchange(event));

        let channel = self.channel().await?;
        channel
            .exchange_declare(&exchange, ExchangeKind::Fanout)
            .await
            .context("Failed to declare retry exchange")?;
        match channel.queue_declare(&queue, options).await {
            Ok(()) => {},
            Err(err) if err.is_precondition_failed() => {
                self.discard_if_closed();
                warn!(%queue, ttl_ms = ttl, error = %err, "Retry queue exists with other arguments, keeping it");
            },
            Err(err) => {
                self.discard_if_closed();
                return Err(err).context("Failed to declare retry queue");
            },
        }
        self.channel()
            .await?
            .queue_bind(&queue, &exchange, "")
            .await
            .context("Failed to bind retry queue")?;
        Ok(exchange)
    }

    async fn recreate_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BusError> {
        self.discard_if_closed();
        let channel = self.channel().await?;
        channel.exchange_delete(name).await.context("Failed to delete exchange")?;
        channel.exchange_declare(name, kind).await.context("Failed to redeclare exchange")?;
        info!(exchange = %name, %kind, "Exchange recreated");
        Ok(())
    }

    /// Declares a standalone exchange, e.g. one named by the caller.
    ///
    /// # Errors
    /// Broker failures, including `406` on a kind conflict.
    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BusError> {
        let result = self.channel().await?.exchange_declare(name, kind).await;
        self.settle(result, "Failed to declare exchange")
    }

    /// # Errors
    /// Broker failures, including `406` when the queue exists with other options.
    pub async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BusError> {
        let result = self.channel().await?.queue_declare(name, options).await;
        self.settle(result, "Failed to declare queue")
    }

    /// # Errors
    /// Broker failures, e.g. `404` for an unknown exchange.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError> {
        let result = self.channel().await?.queue_bind(queue, exchange, routing_key).await;
        self.settle(result, "Failed to bind queue")
    }

    /// # Errors
    /// Broker failures.
    pub async fn delete_queue(&self, name: &str) -> Result<(), BusError> {
        let result = self.channel().await?.queue_delete(name).await;
        self.settle(result, "Failed to delete queue")
    }

    fn settle(
        &self,
        result: Result<(), courier_broker::BrokerError>,
        context: &'static str,
    ) -> Result<(), BusError> {
        if result.is_err() {
            self.discard_if_closed();
        }
        result.context(context)
    }

    /// Closes the channel, then the connection.
    pub async fn close(&self) {
        let channel = self.channel.write().take();
        if let Some(channel) = channel
            && channel.is_open()
            && let Err(err) = channel.close().await
        {
            warn!(error = %err, "Failed to close channel");
        }
        self.connections.close().await;
    }
}
