#![allow(dead_code)]

use async_trait::async_trait;
use courier_broker::memory::InMemoryBroker;
use courier_event_bus::{
    BusConfig, Event, EventBus, EventHandler, EventMeta, InMemoryMetrics, RequestMeta,
    ResponseMeta,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize, Event)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_id: u64,
}

impl OrderCreated {
    pub fn new(order_id: u64) -> Self {
        Self { meta: EventMeta::new(), order_id }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Event)]
#[serde(rename_all = "camelCase")]
#[event(name = "orders.shipped")]
pub struct OrderShipped {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Event)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuery {
    #[serde(flatten)]
    pub meta: EventMeta,
    #[serde(flatten)]
    pub request: RequestMeta,
    pub sku: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Event)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    #[serde(flatten)]
    pub meta: EventMeta,
    #[serde(flatten)]
    pub response: ResponseMeta,
    pub sku: String,
    pub cents: u64,
}

/// Forwards every handled event and counts calls.
#[derive(Debug, Clone)]
pub struct Recorder<E> {
    pub calls: Arc<AtomicUsize>,
    seen: mpsc::UnboundedSender<E>,
}

impl<E> Recorder<E> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<E>) {
        let (seen, rx) = mpsc::unbounded_channel();
        (Self { calls: Arc::new(AtomicUsize::new(0)), seen }, rx)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<E: Event + Clone> EventHandler<E> for Recorder<E> {
    async fn handle(&self, event: E) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.seen.send(event);
        Ok(())
    }
}

/// Fails the first `failures` calls, then succeeds.
#[derive(Debug, Clone)]
pub struct Flaky {
    pub calls: Arc<AtomicUsize>,
    failures: usize,
}

impl Flaky {
    pub fn failing(failures: usize) -> Self {
        Self { calls: Arc::new(AtomicUsize::new(0)), failures }
    }

    pub fn always_failing() -> Self {
        Self::failing(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler<OrderCreated> for Flaky {
    async fn handle(&self, event: OrderCreated) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            anyhow::bail!("order {} rejected on call {call}", event.order_id);
        }
        Ok(())
    }
}

/// Holds every call for a while and remembers how many overlapped at most.
#[derive(Debug, Clone, Default)]
pub struct Slow {
    pub calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Slow {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler<OrderCreated> for Slow {
    async fn handle(&self, _event: OrderCreated) -> anyhow::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Answers price queries through the bus it is registered on.
#[derive(Debug, Clone)]
pub struct PriceDesk {
    pub bus: EventBus,
}

#[async_trait]
impl EventHandler<PriceQuery> for PriceDesk {
    async fn handle(&self, query: PriceQuery) -> anyhow::Result<()> {
        let quote = PriceQuote {
            meta: EventMeta::new(),
            response: ResponseMeta::default(),
            sku: query.sku.clone(),
            cents: 1999,
        };
        self.bus.reply(&query, quote).await?;
        Ok(())
    }
}

/// Fast settings: short retry tiers, no shutdown grace.
pub fn test_config() -> BusConfig {
    let mut config = BusConfig::default();
    config.retry.initial_delay_ms = 20;
    config.retry.max_delay_ms = 80;
    config.shutdown.grace_period_ms = 0;
    config.request.default_timeout_ms = 2_000;
    config
}

pub fn bus_on(broker: &InMemoryBroker, config: BusConfig) -> (EventBus, Arc<InMemoryMetrics>) {
    let metrics = Arc::new(InMemoryMetrics::new());
    let bus = EventBus::with_metrics(config, Arc::new(broker.clone()), metrics.clone());
    (bus, metrics)
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Gives in-flight deliveries a moment to be processed.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
