use crate::bus::{EventBus, SubscribeOptions};
use crate::error::BusError;
use crate::event::{Event, short_type_name};
use crate::registry::EventHandler;
use courier_broker::ExchangeKind;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{error, info, warn};

const CONNECT_WAIT: Duration = Duration::from_secs(30);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

type SubscribeFuture = Pin<Box<dyn Future<Output = Result<String, BusError>> + Send>>;
type SubscribeFn = Box<dyn FnOnce(EventBus) -> SubscribeFuture + Send>;

/// One consumer to start when the host comes up.
pub struct ConsumerRegistration {
    pub event_name: &'static str,
    pub handler_name: &'static str,
    pub kind: ExchangeKind,
    pub queue: Option<String>,
    subscribe: SubscribeFn,
}

impl fmt::Debug for ConsumerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("event_name", &self.event_name)
            .field("handler_name", &self.handler_name)
            .field("kind", &self.kind)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// Typed list of the consumers a service runs.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    registrations: Vec<ConsumerRegistration>,
}

impl ConsumerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes `E` with `handler` on the generated queue.
    pub fn add_consumer<E, H>(&mut self, handler: H, kind: ExchangeKind) -> &mut Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.push::<E, H>(kind, None, move |bus| {
            Box::pin(async move { bus.subscribe_with::<E, H>(handler, SubscribeOptions::new().kind(kind)).await })
        })
    }

    /// Consumes `E` with `handler` on a named queue.
    pub fn add_consumer_with_queue<E, H>(
        &mut self,
        handler: H,
        kind: ExchangeKind,
        queue: impl Into<String>,
    ) -> &mut Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        let queue = queue.into();
        let options = SubscribeOptions::new().kind(kind).queue(queue.clone());
        self.push::<E, H>(kind, Some(queue), move |bus| {
            Box::pin(async move { bus.subscribe_with::<E, H>(handler, options).await })
        })
    }

    /// Consumes `E` from a caller-named exchange, declaring it when `kind` is given.
    pub fn add_consumer_to_exchange<E, H>(
        &mut self,
        handler: H,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        queue: impl Into<String>,
        kind: Option<ExchangeKind>,
    ) -> &mut Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        let (exchange, routing_key, queue) = (exchange.into(), routing_key.into(), queue.into());
        let listed_kind = kind.unwrap_or(ExchangeKind::Fanout);
        self.push::<E, H>(listed_kind, Some(queue.clone()), move |bus| {
            Box::pin(async move {
                bus.subscribe_to_exchange::<E, H>(handler, &exchange, &routing_key, &queue, kind).await
            })
        })
    }

    fn push<E, H>(
        &mut self,
        kind: ExchangeKind,
        queue: Option<String>,
        subscribe: impl FnOnce(EventBus) -> SubscribeFuture + Send + 'static,
    ) -> &mut Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.registrations.push(ConsumerRegistration {
            event_name: E::NAME,
            handler_name: short_type_name::<H>(),
            kind,
            queue,
            subscribe: Box::new(subscribe),
        });
        self
    }

    #[must_use]
    pub fn registrations(&self) -> &[ConsumerRegistration] {
        &self.registrations
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

/// Runs the registered consumers for the lifetime of a process.
#[derive(Debug, Clone, Copy)]
pub struct BusHost {
    connect_wait: Duration,
    retry_interval: Duration,
}

impl Default for BusHost {
    fn default() -> Self {
        Self { connect_wait: CONNECT_WAIT, retry_interval: CONNECT_RETRY_INTERVAL }
    }
}

/// What [`BusHost::run`] managed to start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostReport {
    pub started: usize,
    pub failed: usize,
}

impl BusHost {
    #[must_use]
    pub const fn new(connect_wait: Duration, retry_interval: Duration) -> Self {
        Self { connect_wait, retry_interval }
    }

    /// Waits for the broker, subscribes every registration, then runs until
    /// `shutdown` resolves and shuts the bus down.
    ///
    /// A registration that fails to subscribe is logged and skipped.
    ///
    /// # Errors
    /// [`BusError::ConnectionUnavailable`] if no connection opens within the wait.
    pub async fn run(
        &self,
        bus: EventBus,
        registry: ConsumerRegistry,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<HostReport, BusError> {
        self.wait_for_connection(&bus).await?;

        let mut report = HostReport::default();
        for registration in registry.registrations {
            let (event, handler) = (registration.event_name, registration.handler_name);
            match (registration.subscribe)(bus.clone()).await {
                Ok(queue) => {
                    report.started += 1;
                    info!(event, handler, %queue, "Consumer registered");
                },
                Err(err) => {
                    report.failed += 1;
                    error!(event, handler, error = %err, "Consumer registration failed");
                },
            }
        }
        info!(started = report.started, failed = report.failed, "Event bus host running");

        shutdown.await;
        bus.shutdown().await;
        Ok(report)
    }

    async fn wait_for_connection(&self, bus: &EventBus) -> Result<(), BusError> {
        let waiting = async {
            loop {
                match bus.try_connect().await {
                    Ok(true) => return Ok(()),
                    Ok(false) => {
                        return Err(BusError::ShutDown {
                            message: "bus closed while waiting for the broker".into(),
                            context: None,
                        });
                    },
                    Err(err) => {
                        warn!(error = %err, "Broker not reachable yet");
                        tokio::time::sleep(self.retry_interval).await;
                    },
                }
            }
        };

        tokio::time::timeout(self.connect_wait, waiting).await.unwrap_or_else(|_| {
            Err(BusError::ConnectionUnavailable {
                message: format!("no broker connection within {:?}", self.connect_wait).into(),
                context: None,
            })
        })
    }
}
