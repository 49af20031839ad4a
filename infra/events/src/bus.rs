use crate::config::BusConfig;
use crate::connection::ConnectionManager;
use crate::dispatcher::Dispatcher;
use crate::error::BusError;
use crate::event::{Event, Request, Response, short_type_name};
use crate::health::HealthStatus;
use crate::idempotency::IdempotencyCache;
use crate::metrics::{BusMetrics, InMemoryMetrics, NoopMetrics};
use crate::naming;
use crate::publisher::Publisher;
use crate::registry::{EventHandler, EventType, Subscription, SubscriptionRegistry};
use crate::retry::RetryHandler;
use crate::topology::ChannelManager;
use courier_broker::{Connector, ExchangeKind, QueueOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Where and how a handler consumes its event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use = "Options do nothing until passed to subscribe_with"]
pub struct SubscribeOptions {
    kind: Option<ExchangeKind>,
    routing_key: Option<String>,
    queue: Option<String>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exchange kind of the event; defaults to `fanout`.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Binding key. Defaults to the event name for `direct`, empty otherwise.
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Overrides the generated `queue.{event}.{handler}.{suffix}` name.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

#[derive(Debug)]
struct BusInner {
    config: BusConfig,
    channels: Arc<ChannelManager>,
    publisher: Publisher,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<dyn BusMetrics>,
    shut_down: AtomicBool,
    shutdown_gate: Mutex<()>,
}

/// The event bus: publish/subscribe, request/response, retry and dead-lettering
/// over a broker connection. Cloning shares the same bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Builds a bus over `connector`. Nothing connects until first use.
    ///
    /// Metrics are kept in an [`InMemoryMetrics`] unless `observability.metrics_enabled` is off.
    #[must_use]
    pub fn new(config: BusConfig, connector: Arc<dyn Connector>) -> Self {
        let metrics: Arc<dyn BusMetrics> = if config.observability.metrics_enabled {
            Arc::new(InMemoryMetrics::new())
        } else {
            Arc::new(NoopMetrics)
        };
        Self::with_metrics(config, connector, metrics)
    }

    #[must_use]
    pub fn with_metrics(
        config: BusConfig,
        connector: Arc<dyn Connector>,
        metrics: Arc<dyn BusMetrics>,
    ) -> Self {
        let connections = ConnectionManager::new(connector, config.connect.clone());
        let channels =
            ChannelManager::new(connections, config.prefetch.clone(), config.retry.clone());
        let registry = Arc::new(SubscriptionRegistry::new());
        let idempotency = config
            .idempotency
            .enabled
            .then(|| Arc::new(IdempotencyCache::new(&config.idempotency)));
        let retry =
            RetryHandler::new(Arc::clone(&channels), config.retry.clone(), Arc::clone(&metrics));
        let dispatcher = Dispatcher::new(
            Arc::clone(&channels),
            Arc::clone(&registry),
            idempotency,
            retry,
            Arc::clone(&metrics),
            config.concurrency.clone(),
        );
        let publisher =
            Publisher::new(Arc::clone(&channels), config.message_ttl.clone(), Arc::clone(&metrics));

        Self {
            inner: Arc::new(BusInner {
                config,
                channels,
                publisher,
                registry,
                dispatcher,
                metrics,
                shut_down: AtomicBool::new(false),
                shutdown_gate: Mutex::new(()),
            }),
        }
    }

    /// Connects to the broker named in `config` over AMQP.
    #[cfg(feature = "amqp")]
    #[must_use]
    pub fn amqp(config: BusConfig) -> Self {
        let connector = Arc::new(courier_broker::amqp::LapinConnector::new(config.amqp_uri()));
        Self::new(config, connector)
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<dyn BusMetrics> {
        &self.inner.metrics
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    /// Requests still waiting for their reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.dispatcher.pending_requests()
    }

    #[must_use]
    pub fn exchange_kind(&self, event: &str) -> Option<ExchangeKind> {
        self.inner.channels.exchange_kind(event)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.channels.connections().is_connected()
    }

    /// Connects now instead of on first use.
    ///
    /// # Errors
    /// [`BusError::ConnectionUnavailable`] once the connect attempts are exhausted.
    pub async fn try_connect(&self) -> Result<bool, BusError> {
        self.inner.channels.connections().try_connect().await
    }

    #[must_use]
    pub fn health(&self) -> HealthStatus {
        if self.inner.shut_down.load(Ordering::Acquire) {
            HealthStatus::Unhealthy("event bus is shut down".into())
        } else if self.is_connected() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy("broker connection is not open".into())
        }
    }

    fn ensure_running(&self) -> Result<(), BusError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(BusError::ShutDown { message: "event bus is shut down".into(), context: None });
        }
        Ok(())
    }

    /// Kind already declared for `E`, or `fallback` after declaring it.
    async fn resolve_kind<E: Event>(&self, fallback: ExchangeKind) -> Result<ExchangeKind, BusError> {
        if let Some(kind) = self.exchange_kind(E::NAME) {
            return Ok(kind);
        }
        warn!(event = E::NAME, kind = %fallback, "Publishing to an undeclared exchange, declaring it");
        self.inner.channels.ensure_exchange(E::NAME, fallback).await?;
        Ok(fallback)
    }

    /// Publishes `event` on its own exchange.
    ///
    /// Routes with the event name on `direct` exchanges and the empty key otherwise.
    /// An exchange nobody declared yet is declared as `fanout`.
    ///
    /// # Errors
    /// [`BusError::PublishFailure`], [`BusError::Serialization`], or connection/topology failures.
    pub async fn publish<E: Event>(&self, mut event: E) -> Result<Uuid, BusError> {
        self.ensure_running()?;
        let kind = self.resolve_kind::<E>(ExchangeKind::Fanout).await?;
        let routing_key = if kind == ExchangeKind::Direct { E::NAME } else { "" };
        self.inner
            .publisher
            .publish(&mut event, &naming::exchange(E::NAME), routing_key, E::NAME)
            .await
    }

    /// Publishes `event` on its own exchange with a caller-chosen routing key.
    /// An exchange nobody declared yet is declared as `direct`.
    ///
    /// # Errors
    /// As [`Self::publish`].
    pub async fn publish_with_routing_key<E: Event>(
        &self,
        mut event: E,
        routing_key: &str,
    ) -> Result<Uuid, BusError> {
        self.ensure_running()?;
        self.resolve_kind::<E>(ExchangeKind::Direct).await?;
        self.inner
            .publisher
            .publish(&mut event, &naming::exchange(E::NAME), routing_key, E::NAME)
            .await
    }

    /// Publishes `event` to an arbitrary exchange; no topology is declared.
    ///
    /// # Errors
    /// As [`Self::publish`]; an unknown exchange fails with [`BusError::PublishFailure`].
    pub async fn publish_to_exchange<E: Event>(
        &self,
        mut event: E,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Uuid, BusError> {
        self.ensure_running()?;
        self.inner.publisher.publish(&mut event, exchange, routing_key, E::NAME).await
    }

    /// Subscribes `handler` to `E` on a `fanout` exchange with the generated queue name.
    ///
    /// # Errors
    /// As [`Self::subscribe_with`].
    pub async fn subscribe<E, H>(&self, handler: H) -> Result<String, BusError>
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.subscribe_with::<E, H>(handler, SubscribeOptions::new()).await
    }

    /// Declares the topology of `E`, binds a durable dead-lettered queue and starts
    /// consuming it. Returns the queue name.
    ///
    /// # Errors
    /// [`BusError::DuplicateSubscription`] if `H` already consumes that queue, or
    /// connection/topology failures.
    #[instrument(skip_all, fields(event = E::NAME, handler = short_type_name::<H>()))]
    pub async fn subscribe_with<E, H>(
        &self,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<String, BusError>
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.ensure_running()?;
        let kind = options.kind.unwrap_or(ExchangeKind::Fanout);
        self.inner.channels.ensure_exchange(E::NAME, kind).await?;

        let routing_key = options.routing_key.unwrap_or_else(|| match kind {
            ExchangeKind::Direct => E::NAME.to_owned(),
            ExchangeKind::Fanout | ExchangeKind::Topic => String::new(),
        });
        let queue = options.queue.unwrap_or_else(|| {
            naming::subscriber_queue(E::NAME, short_type_name::<H>(), &routing_key)
        });

        self.bind_handler::<E, H>(handler, naming::exchange(E::NAME), routing_key, queue).await
    }

    /// Binds a handler queue to a caller-named exchange, declaring the exchange when
    /// `kind` is given. Dead-letter and retry tiers are those of `E`.
    ///
    /// # Errors
    /// As [`Self::subscribe_with`]; a missing undeclared exchange fails the bind.
    #[instrument(skip(self, handler, kind), fields(event = E::NAME))]
    pub async fn subscribe_to_exchange<E, H>(
        &self,
        handler: H,
        exchange: &str,
        routing_key: &str,
        queue: &str,
        kind: Option<ExchangeKind>,
    ) -> Result<String, BusError>
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.ensure_running()?;
        let own_kind = self.exchange_kind(E::NAME).unwrap_or(ExchangeKind::Fanout);
        self.inner.channels.ensure_exchange(E::NAME, own_kind).await?;
        if let Some(kind) = kind {
            self.inner.channels.declare_exchange(exchange, kind).await?;
        }
        self.bind_handler::<E, H>(handler, exchange.to_owned(), routing_key.to_owned(), queue.to_owned())
            .await
    }

    async fn bind_handler<E, H>(
        &self,
        handler: H,
        exchange: String,
        routing_key: String,
        queue: String,
    ) -> Result<String, BusError>
    where
        E: Event,
        H: EventHandler<E>,
    {
        let subscription =
            Subscription::new::<E, H>(Arc::new(handler), queue.clone(), routing_key.clone());
        let handler_name = subscription.handler.clone();
        self.inner.registry.add_subscription(E::NAME, EventType::of::<E>(), subscription)?;

        let declared: Result<(), BusError> = async {
            let options = QueueOptions::durable()
                .argument(naming::DEAD_LETTER_EXCHANGE_ARG, naming::dead_letter_exchange(E::NAME));
            self.inner.channels.declare_queue(&queue, options).await?;
            self.inner.channels.bind_queue(&queue, &exchange, &routing_key).await?;
            self.inner.dispatcher.start_consumer(&queue).await
        }
        .await;

        if let Err(err) = declared {
            self.inner.registry.remove_subscription(E::NAME, &handler_name, Some(&queue));
            return Err(err);
        }
        info!(event = E::NAME, handler = %handler_name, %queue, %exchange, %routing_key, "Subscribed");
        Ok(queue)
    }

    /// Forgets the in-process subscription of `H` to `E`. Broker queues and consumers stay.
    pub fn unsubscribe<E, H>(&self) -> bool
    where
        E: Event,
        H: EventHandler<E>,
    {
        let removed =
            self.inner.registry.remove_subscription(E::NAME, short_type_name::<H>(), None).is_some();
        debug!(event = E::NAME, handler = short_type_name::<H>(), removed, "Unsubscribed");
        removed
    }

    /// Sends `request` and waits up to `request.default_timeout_ms` for the correlated reply.
    ///
    /// # Errors
    /// As [`Self::request_with_timeout`].
    pub async fn request<Req, Resp>(&self, request: Req) -> Result<Resp, BusError>
    where
        Req: Request,
        Resp: Response,
    {
        let timeout = self.inner.config.request.default_timeout();
        self.request_with_timeout(request, timeout).await
    }

    /// Sends `request` with a private reply queue and waits for the correlated reply.
    ///
    /// The pending entry and the reply queue are removed whatever the outcome.
    ///
    /// # Errors
    /// [`BusError::RequestTimeout`] when no reply arrives in time,
    /// [`BusError::Deserialization`] when the reply does not decode, or publish failures.
    #[instrument(skip(self, request), fields(event = Req::NAME))]
    pub async fn request_with_timeout<Req, Resp>(
        &self,
        mut request: Req,
        timeout: Duration,
    ) -> Result<Resp, BusError>
    where
        Req: Request,
        Resp: Response,
    {
        self.ensure_running()?;
        let correlation_id = request
            .request()
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let reply_queue = naming::reply_queue(&correlation_id);
        {
            let meta = request.request_mut();
            meta.correlation_id = Some(correlation_id.clone());
            meta.reply_to = Some(reply_queue.clone());
        }

        let dispatcher = &self.inner.dispatcher;
        let reply = dispatcher.register_pending::<Resp>(&correlation_id);

        let outcome: Result<Resp, BusError> = async {
            self.inner.channels.declare_queue(&reply_queue, QueueOptions::exclusive()).await?;
            dispatcher.start_consumer(&reply_queue).await?;
            self.publish(request).await?;

            match tokio::time::timeout(timeout, reply).await {
                Ok(Ok(Some(response))) => Ok(response),
                Ok(Ok(None)) => Err(BusError::Deserialization {
                    message: format!("reply to {correlation_id} did not decode as {}", Resp::NAME)
                        .into(),
                    context: None,
                }),
                Ok(Err(_)) => Err(BusError::ShutDown {
                    message: "request abandoned by shutdown".into(),
                    context: None,
                }),
                Err(_) => Err(BusError::RequestTimeout {
                    message: format!("no reply to {correlation_id} within {timeout:?}").into(),
                    context: Some(Req::NAME.into()),
                }),
            }
        }
        .await;

        dispatcher.remove_pending(&correlation_id);
        dispatcher.stop_consumer(&reply_queue).await;
        if let Err(err) = self.inner.channels.delete_queue(&reply_queue).await {
            warn!(queue = %reply_queue, error = %err, "Failed to delete reply queue");
        }
        outcome
    }

    /// Sends `response` to the reply queue of `request`, correlated with it.
    ///
    /// # Errors
    /// [`BusError::Internal`] if `request` carries no reply address, or publish failures.
    pub async fn reply<Req, Resp>(&self, request: &Req, mut response: Resp) -> Result<Uuid, BusError>
    where
        Req: Request,
        Resp: Response,
    {
        self.ensure_running()?;
        let meta = request.request();
        let Some(reply_to) = meta.reply_to.as_deref() else {
            return Err(BusError::Internal {
                message: format!("{} has no reply address", Req::NAME).into(),
                context: None,
            });
        };
        response.response_mut().correlation_id.clone_from(&meta.correlation_id);
        self.inner.publisher.publish(&mut response, "", reply_to, Resp::NAME).await
    }

    /// Stops consumers, waits the grace period, then closes the channel and connection.
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        let _gate = self.inner.shutdown_gate.lock().await;
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down event bus");
        self.inner.dispatcher.shutdown().await;
        tokio::time::sleep(self.inner.config.shutdown.grace_period()).await;
        self.inner.channels.close().await;
        info!("Event bus shut down");
    }
}
