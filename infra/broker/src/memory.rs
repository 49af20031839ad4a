//! In-process broker with AMQP 0-9-1 routing semantics.
//!
//! Everything lives behind one mutex. Deliveries are pushed into unbounded
//! per-consumer streams, bounded by the consumer's prefetch. Message TTL is
//! enforced with `tokio` timers, so tests running with a paused clock can
//! fast-forward through retry tiers.

use crate::{
    BrokerError, Channel, Connection, ConnectionEvent, Connector, Consumer, Delivery,
    ExchangeKind, MessageProperties, QueueOptions,
};
use async_trait::async_trait;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
const DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
const MESSAGE_TTL: &str = "x-message-ttl";
const FIRST_DEATH_REASON: &str = "x-first-death-reason";
const FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
const EVENT_BUFFER: usize = 16;

/// Counters over every broker call, for asserting on topology traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections_opened: u64,
    pub channels_opened: u64,
    pub qos_calls: u64,
    pub exchange_declares: u64,
    pub exchange_deletes: u64,
    pub queue_declares: u64,
    pub queue_binds: u64,
    pub queue_deletes: u64,
    pub published: u64,
    /// Mandatory messages that matched no queue.
    pub returned: u64,
    pub dead_lettered: u64,
    pub expired: u64,
}

/// A message waiting in a queue, as seen by [`InMemoryBroker::peek`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// The in-memory broker. Cloning shares the same broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    refuse_connects: AtomicU32,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    exchanges: FxHashMap<String, Exchange>,
    queues: FxHashMap<String, Queue>,
    unacked: FxHashMap<u64, Unacked>,
    channels: FxHashMap<u64, ChannelRecord>,
    connections: FxHashMap<u64, ConnectionRecord>,
    stats: BrokerStats,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Debug, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Debug)]
struct Queue {
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

#[derive(Debug, Clone)]
struct Message {
    seq: u64,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    body: Vec<u8>,
}

#[derive(Debug)]
struct ConsumerSlot {
    tag: String,
    channel: u64,
    sender: mpsc::UnboundedSender<Delivery>,
    auto_ack: bool,
    prefetch: u16,
    in_flight: usize,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_tag: String,
    channel: u64,
    message: Message,
}

#[derive(Debug)]
struct ChannelRecord {
    connection: u64,
    open: Arc<AtomicBool>,
    prefetch: u16,
}

#[derive(Debug)]
struct ConnectionRecord {
    open: Arc<AtomicBool>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: u32) {
        self.inner.refuse_connects.store(count, Ordering::SeqCst);
    }

    /// Closes every open connection as if the broker went away.
    pub fn drop_connections(&self, reason: &str) {
        let mut state = self.inner.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id, Some(ConnectionEvent::Shutdown { reason: reason.to_owned() }));
        }
    }

    /// Broadcasts a resource alarm to every open connection.
    pub fn block_connections(&self, reason: &str) {
        let state = self.inner.state.lock();
        for record in state.connections.values() {
            let _ = record.events.send(ConnectionEvent::Blocked { reason: reason.to_owned() });
        }
    }

    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        self.inner.state.lock().stats
    }

    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    #[must_use]
    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.inner.state.lock().exchanges.get(name).map(|e| e.kind)
    }

    /// `(queue, routing_key)` pairs bound to `exchange`.
    #[must_use]
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.inner.state.lock().exchanges.get(exchange).map_or_else(Vec::new, |e| {
            e.bindings.iter().map(|b| (b.queue.clone(), b.routing_key.clone())).collect()
        })
    }

    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.state.lock().queues.contains_key(name)
    }

    #[must_use]
    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.inner.state.lock().queues.get(name).map(|q| q.options.clone())
    }

    /// Messages waiting for a consumer, or `None` when the queue does not exist.
    #[must_use]
    pub fn ready_count(&self, name: &str) -> Option<usize> {
        self.inner.state.lock().queues.get(name).map(|q| q.ready.len())
    }

    #[must_use]
    pub fn consumer_count(&self, name: &str) -> usize {
        self.inner.state.lock().queues.get(name).map_or(0, |q| q.consumers.len())
    }

    /// Deliveries handed out and not yet acked or nacked.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.inner.state.lock().unacked.len()
    }

    /// Snapshot of the messages waiting in `queue`.
    #[must_use]
    pub fn peek(&self, queue: &str) -> Vec<QueuedMessage> {
        self.inner.state.lock().queues.get(queue).map_or_else(Vec::new, |q| {
            q.ready
                .iter()
                .map(|m| QueuedMessage {
                    exchange: m.exchange.clone(),
                    routing_key: m.routing_key.clone(),
                    properties: m.properties.clone(),
                    body: m.body.clone(),
                })
                .collect()
        })
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        let refused = self
            .inner
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::Connection {
                message: "connection refused".into(),
                context: Some("in-memory broker".into()),
            });
        }

        let mut state = self.inner.state.lock();
        let id = state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        state.connections.insert(id, ConnectionRecord { open: open.clone(), events: events.clone() });
        state.stats.connections_opened += 1;
        debug!(connection = id, "In-memory connection opened");

        Ok(Arc::new(MemoryConnection { id, inner: self.inner.clone(), open, events }))
    }
}

/// A connection to an [`InMemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    inner: Arc<Inner>,
    open: Arc<AtomicBool>,
    events: broadcast::Sender<ConnectionEvent>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::closed("connection"));
        }
        let mut state = self.inner.state.lock();
        let id = state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        state
            .channels
            .insert(id, ChannelRecord { connection: self.id, open: open.clone(), prefetch: 0 });
        state.stats.channels_opened += 1;

        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            inner: self.inner.clone(),
            open,
            connection_open: self.open.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.state.lock().close_connection(self.id, None);
        Ok(())
    }
}

/// A channel on a [`MemoryConnection`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    inner: Arc<Inner>,
    open: Arc<AtomicBool>,
    connection_open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn state(&self) -> Result<parking_lot::MutexGuard<'_, State>, BrokerError> {
        if !self.connection_open.load(Ordering::SeqCst) {
            return Err(BrokerError::closed("connection"));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::closed("channel"));
        }
        Ok(self.inner.state.lock())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    async fn basic_qos(&self, prefetch_count: u16, _global: bool) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        state.stats.qos_calls += 1;
        if let Some(record) = state.channels.get_mut(&self.id) {
            record.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        state.stats.exchange_declares += 1;
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => {
                let message = format!(
                    "inequivalent arg 'type' for exchange '{name}': received '{kind}' but current is '{}'",
                    existing.kind
                );
                Err(state.fail_channel(self.id, BrokerError::PreconditionFailed {
                    message: message.into(),
                    context: None,
                }))
            },
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_owned(), Exchange { kind, bindings: Vec::new() });
                trace!(exchange = name, %kind, "Exchange declared");
                Ok(())
            },
        }
    }

    async fn exchange_delete(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        state.stats.exchange_deletes += 1;
        state.exchanges.remove(name);
        Ok(())
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        state.stats.queue_declares += 1;
        if name.is_empty() {
            return Err(BrokerError::Channel { message: "queue name required".into(), context: None });
        }

        if let Some(existing) = state.queues.get(name) {
            if existing.owner.is_some_and(|owner| owner != self.connection) {
                let message = format!("cannot obtain exclusive access to locked queue '{name}'");
                return Err(state.fail_channel(self.id, BrokerError::Channel {
                    message: message.into(),
                    context: Some("RESOURCE_LOCKED (405)".into()),
                }));
            }
            if existing.options != options {
                let message = format!("inequivalent arguments for queue '{name}'");
                return Err(state.fail_channel(self.id, BrokerError::PreconditionFailed {
                    message: message.into(),
                    context: None,
                }));
            }
            return Ok(());
        }

        let owner = options.exclusive.then_some(self.connection);
        state.queues.insert(name.to_owned(), Queue {
            options,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        });
        trace!(queue = name, "Queue declared");
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        state.stats.queue_binds += 1;
        if !state.queues.contains_key(queue) {
            let message = format!("no queue '{queue}'");
            return Err(state.fail_channel(self.id, not_found(message)));
        }
        let Some(target) = state.exchanges.get_mut(exchange) else {
            let message = format!("no exchange '{exchange}'");
            return Err(state.fail_channel(self.id, not_found(message)));
        };

        let binding = Binding { queue: queue.to_owned(), routing_key: routing_key.to_owned() };
        if !target.bindings.contains(&binding) {
            target.bindings.push(binding);
        }
        Ok(())
    }

    async fn queue_delete(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        state.stats.queue_deletes += 1;
        state.delete_queue(name);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        let targets = match state.route(exchange, routing_key) {
            Ok(targets) => targets,
            Err(err) => return Err(state.fail_channel(self.id, err)),
        };
        state.stats.published += 1;

        if targets.is_empty() {
            if mandatory {
                state.stats.returned += 1;
                debug!(exchange, routing_key, "Mandatory message returned as unroutable");
            }
            return Ok(());
        }

        for queue in targets {
            let seq = state.next_id();
            let message = Message {
                seq,
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
                properties: properties.clone(),
                body: body.clone(),
            };
            state.enqueue(&self.inner, &queue, message);
        }
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, auto_ack: bool) -> Result<Consumer, BrokerError> {
        let mut state = self.state()?;
        let prefetch = state.channels.get(&self.id).map_or(0, |c| c.prefetch);
        let tag = format!("amq.ctag-{}", state.next_id());

        let Some(target) = state.queues.get_mut(queue) else {
            let message = format!("no queue '{queue}'");
            return Err(state.fail_channel(self.id, not_found(message)));
        };
        let (sender, deliveries) = mpsc::unbounded_channel();
        target.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            channel: self.id,
            sender,
            auto_ack,
            prefetch,
            in_flight: 0,
        });
        state.pump(queue);
        debug!(queue, consumer_tag = %tag, "Consumer started");

        Ok(Consumer { tag, deliveries })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        let unacked = state.settle(delivery_tag)?;
        state.pump(&unacked.queue);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        let Unacked { queue, mut message, .. } = state.settle(delivery_tag)?;
        if requeue {
            message.redelivered = true;
            if let Some(target) = state.queues.get_mut(&queue) {
                target.ready.push_front(message);
            }
        } else {
            state.dead_letter(&self.inner, &queue, message, "rejected");
        }
        state.pump(&queue);
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        state.remove_consumers(|slot| slot.tag == consumer_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        state.close_channel(self.id);
        Ok(())
    }
}

impl Inner {
    fn expire(self: &Arc<Self>, queue: &str, seq: u64) {
        let mut state = self.state.lock();
        let Some(target) = state.queues.get_mut(queue) else { return };
        let Some(position) = target.ready.iter().position(|m| m.seq == seq) else { return };
        let Some(message) = target.ready.remove(position) else { return };
        state.stats.expired += 1;
        state.dead_letter(self, queue, message, "expired");
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                Vec::new()
            });
        }

        let Some(target) = self.exchanges.get(exchange) else {
            return Err(not_found(format!("no exchange '{exchange}'")));
        };

        let mut queues: Vec<String> = Vec::new();
        for binding in &target.bindings {
            let matched = match target.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        Ok(queues)
    }

    fn enqueue(&mut self, inner: &Arc<Inner>, queue: &str, message: Message) {
        let Some(target) = self.queues.get_mut(queue) else { return };

        let queue_ttl = target.options.arguments.get_int(MESSAGE_TTL);
        let message_ttl = message.properties.expiration.as_deref().and_then(|e| e.parse().ok());
        let ttl = match (queue_ttl, message_ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        if let Some(ttl) = ttl {
            let weak = Arc::downgrade(inner);
            let name = queue.to_owned();
            let seq = message.seq;
            let delay = Duration::from_millis(u64::try_from(ttl).unwrap_or(0));
            tokio::spawn(expire_after(weak, name, seq, delay));
        }

        target.ready.push_back(message);
        self.pump(queue);
    }

    /// Hands ready messages to consumers with spare prefetch capacity, round robin.
    fn pump(&mut self, queue: &str) {
        let Self { queues, unacked, next_id, .. } = self;
        let Some(target) = queues.get_mut(queue) else { return };

        loop {
            target.consumers.retain(|slot| !slot.sender.is_closed());
            if target.ready.is_empty() || target.consumers.is_empty() {
                return;
            }

            let count = target.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (target.next_consumer + offset) % count)
                .find(|&i| target.consumers[i].has_capacity())
            else {
                return;
            };
            target.next_consumer = (index + 1) % count;

            let Some(message) = target.ready.pop_front() else { return };
            *next_id += 1;
            let delivery_tag = *next_id;
            let slot = &mut target.consumers[index];
            let delivery = Delivery {
                delivery_tag,
                consumer_tag: slot.tag.clone(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if slot.sender.send(delivery).is_err() {
                target.ready.push_front(message);
                continue;
            }
            if !slot.auto_ack {
                slot.in_flight += 1;
                unacked.insert(delivery_tag, Unacked {
                    queue: queue.to_owned(),
                    consumer_tag: slot.tag.clone(),
                    channel: slot.channel,
                    message,
                });
            }
        }
    }

    fn settle(&mut self, delivery_tag: u64) -> Result<Unacked, BrokerError> {
        let Some(unacked) = self.unacked.remove(&delivery_tag) else {
            return Err(BrokerError::PreconditionFailed {
                message: format!("unknown delivery tag {delivery_tag}").into(),
                context: None,
            });
        };
        if let Some(slot) = self
            .queues
            .get_mut(&unacked.queue)
            .and_then(|q| q.consumers.iter_mut().find(|c| c.tag == unacked.consumer_tag))
        {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        Ok(unacked)
    }

    fn dead_letter(&mut self, inner: &Arc<Inner>, queue: &str, mut message: Message, reason: &str) {
        let Some(arguments) = self.queues.get(queue).map(|q| q.options.arguments.clone()) else {
            return;
        };
        let Some(exchange) = arguments.get_str(DEAD_LETTER_EXCHANGE) else {
            trace!(queue, reason, "Message discarded without dead-letter exchange");
            return;
        };
        let routing_key =
            arguments.get_str(DEAD_LETTER_ROUTING_KEY).unwrap_or(&message.routing_key).to_owned();

        let Ok(targets) = self.route(exchange, &routing_key) else {
            debug!(queue, exchange, "Dead-letter exchange missing, message dropped");
            return;
        };

        self.stats.dead_lettered += 1;
        let headers = &mut message.properties.headers;
        if headers.get(FIRST_DEATH_REASON).is_none() {
            headers.insert(FIRST_DEATH_REASON, reason);
        }
        if headers.get(FIRST_DEATH_QUEUE).is_none() {
            headers.insert(FIRST_DEATH_QUEUE, queue);
        }
        message.properties.expiration = None;
        message.exchange = exchange.to_owned();
        message.routing_key = routing_key;
        message.redelivered = false;

        for target in targets {
            let mut copy = message.clone();
            copy.seq = self.next_id();
            self.enqueue(inner, &target, copy);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_none() {
            return;
        }
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != name);
        }
        trace!(queue = name, "Queue deleted");
    }

    fn remove_consumers(&mut self, predicate: impl Fn(&ConsumerSlot) -> bool) {
        let mut emptied = Vec::new();
        for (name, queue) in &mut self.queues {
            let before = queue.consumers.len();
            queue.consumers.retain(|slot| !predicate(slot));
            if queue.consumers.len() < before && queue.consumers.is_empty() && queue.options.auto_delete
            {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            self.delete_queue(&name);
        }
    }

    /// Requeues unacked deliveries and drops consumers; the channel is unusable afterwards.
    fn close_channel(&mut self, id: u64) {
        let Some(record) = self.channels.remove(&id) else { return };
        record.open.store(false, Ordering::SeqCst);
        self.remove_consumers(|slot| slot.channel == id);

        let tags: Vec<u64> =
            self.unacked.iter().filter(|(_, u)| u.channel == id).map(|(tag, _)| *tag).collect();
        let mut touched = Vec::new();
        for tag in tags {
            let Some(Unacked { queue, mut message, .. }) = self.unacked.remove(&tag) else {
                continue;
            };
            if let Some(target) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                target.ready.push_front(message);
                touched.push(queue);
            }
        }
        for queue in touched {
            self.pump(&queue);
        }
    }

    fn fail_channel(&mut self, id: u64, err: BrokerError) -> BrokerError {
        debug!(channel = id, error = %err, "Channel closed by broker");
        self.close_channel(id);
        err
    }

    fn close_connection(&mut self, id: u64, event: Option<ConnectionEvent>) {
        let Some(record) = self.connections.remove(&id) else { return };
        record.open.store(false, Ordering::SeqCst);

        let channels: Vec<u64> =
            self.channels.iter().filter(|(_, c)| c.connection == id).map(|(cid, _)| *cid).collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.delete_queue(&queue);
        }

        if let Some(event) = event {
            let _ = record.events.send(event);
        }
        debug!(connection = id, "In-memory connection closed");
    }
}

async fn expire_after(inner: Weak<Inner>, queue: String, seq: u64, delay: Duration) {
    tokio::time::sleep(delay).await;
    if let Some(inner) = inner.upgrade() {
        inner.expire(&queue, seq);
    }
}

fn not_found(message: String) -> BrokerError {
    BrokerError::NotFound { message: message.into(), context: None }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more words.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn words(s: &str) -> Vec<&str> {
        if s.is_empty() { Vec::new() } else { s.split('.').collect() }
    }

    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => key
                .split_first()
                .is_some_and(|(&head, tail)| (word == "*" || word == head) && matches(rest, tail)),
        }
    }

    matches(&words(pattern), &words(routing_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("orders.*.eu", "orders.created.eu"));
        assert!(!topic_matches("orders.*.eu", "orders.created.us"));
        assert!(!topic_matches("orders.*.eu", "orders.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#.eu", "orders.created.eu"));
        assert!(!topic_matches("orders", "orders.created"));
        assert!(topic_matches("", ""));
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.queue_declare("reply.1", QueueOptions::exclusive()).await.unwrap();

        channel
            .basic_publish("", "reply.1", true, MessageProperties::default(), b"{}".to_vec())
            .await
            .unwrap();
        channel
            .basic_publish("", "reply.unknown", true, MessageProperties::default(), Vec::new())
            .await
            .unwrap();

        assert_eq!(broker.ready_count("reply.1"), Some(1));
        assert_eq!(broker.stats().returned, 1);
    }

    #[tokio::test]
    async fn closing_connection_removes_exclusive_queues() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.queue_declare("reply.2", QueueOptions::exclusive()).await.unwrap();
        channel.queue_declare("queue.durable", QueueOptions::durable()).await.unwrap();

        connection.close().await.unwrap();

        assert!(!broker.has_queue("reply.2"));
        assert!(broker.has_queue("queue.durable"));
        assert!(!channel.is_open());
    }
}
