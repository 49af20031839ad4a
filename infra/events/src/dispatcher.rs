use crate::config::ConcurrencySettings;
use crate::error::{BusError, BusErrorExt};
use crate::event::Response;
use crate::idempotency::IdempotencyCache;
use crate::metrics::BusMetrics;
use crate::registry::SubscriptionRegistry;
use crate::retry::RetryHandler;
use crate::topology::ChannelManager;
use courier_broker::{Channel, Delivery};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore, oneshot};
use tracing::{debug, error, info, warn};

const RESTART_INITIAL_DELAY: Duration = Duration::from_millis(100);
const RESTART_MAX_DELAY: Duration = Duration::from_secs(5);

/// Completes one pending request from a raw reply body.
type ReplyResolver = Box<dyn FnOnce(&[u8]) + Send + Sync>;

#[derive(Debug)]
struct ActiveConsumer {
    tag: String,
    channel: Arc<dyn Channel>,
    semaphore: Option<Arc<Semaphore>>,
}

enum Settle {
    Ack,
    Reject,
}

/// Runs the receive loops and the per-message pipeline.
///
/// A receive loop that ends while its queue is still subscribed (the shared channel
/// was closed by the broker, or the connection dropped) is started again on a fresh
/// channel.
pub struct Dispatcher {
    channels: Arc<ChannelManager>,
    registry: Arc<SubscriptionRegistry>,
    idempotency: Option<Arc<IdempotencyCache>>,
    retry: RetryHandler,
    metrics: Arc<dyn BusMetrics>,
    concurrency: ConcurrencySettings,
    consumers: DashMap<String, ActiveConsumer>,
    subscribed: DashSet<String>,
    pending: DashMap<String, ReplyResolver>,
    start_gate: Mutex<()>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("consumers", &self.consumers.len())
            .field("pending", &self.pending.len())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        channels: Arc<ChannelManager>,
        registry: Arc<SubscriptionRegistry>,
        idempotency: Option<Arc<IdempotencyCache>>,
        retry: RetryHandler,
        metrics: Arc<dyn BusMetrics>,
        concurrency: ConcurrencySettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            channels,
            registry,
            idempotency,
            retry,
            metrics,
            concurrency,
            consumers: DashMap::new(),
            subscribed: DashSet::new(),
            pending: DashMap::new(),
            start_gate: Mutex::new(()),
            stopped: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn is_consuming(&self, queue: &str) -> bool {
        self.consumers.contains_key(queue)
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Starts consuming `queue`; a no-op if a consumer for it is already running.
    ///
    /// # Errors
    /// [`BusError::ShutDown`] after [`Self::shutdown`], or broker failures.
    pub async fn start_consumer(self: &Arc<Self>, queue: &str) -> Result<(), BusError> {
        let _gate = self.start_gate.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return Err(BusError::ShutDown { message: "dispatcher stopped".into(), context: None });
        }
        if self.consumers.contains_key(queue) {
            return Ok(());
        }

        let channel = self.channels.channel().await?;
        let consumer = match channel.basic_consume(queue, false).await {
            Ok(consumer) => consumer,
            Err(err) => {
                self.channels.discard_if_closed();
                return Err(err).context("Failed to start consumer");
            },
        };

        let semaphore = self
            .concurrency
            .enabled
            .then(|| Arc::new(Semaphore::new(self.concurrency.max_degree_of_parallelism.max(1))));
        info!(queue, tag = %consumer.tag, "Consumer started");

        self.subscribed.insert(queue.to_owned());
        self.consumers.insert(
            queue.to_owned(),
            ActiveConsumer {
                tag: consumer.tag.clone(),
                channel: Arc::clone(&channel),
                semaphore: semaphore.clone(),
            },
        );
        self.spawn_loop(queue.to_owned(), consumer, channel, semaphore);
        Ok(())
    }

    fn spawn_loop(
        self: &Arc<Self>,
        queue: String,
        mut consumer: courier_broker::Consumer,
        channel: Arc<dyn Channel>,
        semaphore: Option<Arc<Semaphore>>,
    ) {
        let dispatcher: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(delivery) = consumer.deliveries.recv().await {
                let permit = match &semaphore {
                    Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    None => None,
                };
                let Some(dispatcher) = dispatcher.upgrade() else {
                    break;
                };
                let channel = Arc::clone(&channel);
                let queue = queue.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    dispatcher.process(&channel, &queue, delivery).await;
                });
            }

            debug!(%queue, tag = %consumer.tag, "Consumer stream ended");
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.consumers.remove_if(&queue, |_, active| active.tag == consumer.tag);
                if dispatcher.wants(&queue) {
                    warn!(%queue, "Consumer lost, restarting");
                    dispatcher.restart(queue);
                }
            }
        });
    }

    fn wants(&self, queue: &str) -> bool {
        !self.stopped.load(Ordering::Acquire) && self.subscribed.contains(queue)
    }

    /// Starts `queue` again, backing off between failed attempts, until it consumes,
    /// is unsubscribed, disappears from the broker or the dispatcher stops.
    fn restart(self: &Arc<Self>, queue: String) {
        let dispatcher = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut delay = RESTART_INITIAL_DELAY;
            loop {
                let Some(this) = dispatcher.upgrade() else { return };
                if !this.wants(&queue) {
                    return;
                }
                match this.start_consumer(&queue).await {
                    Ok(()) => {
                        info!(%queue, "Consumer restarted");
                        return;
                    },
                    Err(err) if err.is_not_found() => {
                        warn!(%queue, error = %err, "Queue is gone, consumer not restarted");
                        this.subscribed.remove(&queue);
                        return;
                    },
                    Err(BusError::ShutDown { .. }) => return,
                    Err(err) => {
                        warn!(%queue, error = %err, retry_in_ms = delay.as_millis(), "Consumer restart failed");
                    },
                }
                drop(this);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RESTART_MAX_DELAY);
            }
        });
    }

    /// Cancels the consumer of `queue`, if any, and stops restarting it.
    pub async fn stop_consumer(&self, queue: &str) {
        self.subscribed.remove(queue);
        let Some((_, active)) = self.consumers.remove(queue) else {
            return;
        };
        if let Some(semaphore) = &active.semaphore {
            semaphore.close();
        }
        if let Err(err) = active.channel.basic_cancel(&active.tag).await {
            debug!(queue, tag = %active.tag, error = %err, "Consumer cancel failed");
        }
    }

    /// Registers a pending request; the receiver yields `None` when the reply does not decode.
    pub fn register_pending<R: Response>(&self, correlation_id: &str) -> oneshot::Receiver<Option<R>> {
        let (tx, rx) = oneshot::channel();
        let id = correlation_id.to_owned();
        let resolver: ReplyResolver = Box::new(move |body: &[u8]| {
            let reply = match serde_json::from_slice::<R>(body) {
                Ok(reply) => Some(reply),
                Err(err) => {
                    warn!(correlation_id = %id, error = %err, "Reply could not be decoded");
                    None
                },
            };
            let _ = tx.send(reply);
        });
        self.pending.insert(correlation_id.to_owned(), resolver);
        rx
    }

    pub fn remove_pending(&self, correlation_id: &str) {
        self.pending.remove(correlation_id);
    }

    async fn process(&self, channel: &Arc<dyn Channel>, queue: &str, delivery: Delivery) {
        let event =
            delivery.properties.kind.clone().unwrap_or_else(|| delivery.routing_key.clone());
        let dedup_key =
            delivery.properties.message_id.as_deref().map(|id| format!("{queue}:{id}"));

        if let (Some(cache), Some(key)) = (&self.idempotency, &dedup_key)
            && cache.is_processed(key)
        {
            debug!(%event, %key, "Duplicate delivery skipped");
            self.metrics.record_duplicate(&event);
            settle(channel, &delivery, Settle::Ack).await;
            return;
        }

        if delivery.properties.reply_to.is_none()
            && let Some(correlation_id) = &delivery.properties.correlation_id
            && let Some((_, resolve)) = self.pending.remove(correlation_id)
        {
            debug!(%event, %correlation_id, "Reply received");
            resolve(&delivery.body);
            settle(channel, &delivery, Settle::Ack).await;
            return;
        }

        let Some(subscriptions) = self.registry.handlers_for_event(&event) else {
            warn!(%event, queue, "No subscription for delivered event, dropping");
            settle(channel, &delivery, Settle::Ack).await;
            return;
        };
        let Some(subscription) = subscriptions.into_iter().find(|s| s.queue == queue) else {
            warn!(%event, queue, "No handler bound to this queue, dead-lettering");
            settle(channel, &delivery, Settle::Reject).await;
            return;
        };

        let started = Instant::now();
        let future = match (subscription.invoker)(&delivery.body) {
            Ok(future) => future,
            Err(err) => {
                error!(%event, queue, error = %err, "Undecodable message, dead-lettering");
                self.metrics.record_consumed(&event, started.elapsed(), false);
                settle(channel, &delivery, Settle::Reject).await;
                return;
            },
        };

        let failure = match tokio::spawn(future).await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(join) if join.is_panic() => Some("handler panicked".to_owned()),
            Err(join) => Some(join.to_string()),
        };
        self.metrics.record_consumed(&event, started.elapsed(), failure.is_none());

        let Some(reason) = failure else {
            if let (Some(cache), Some(key)) = (&self.idempotency, dedup_key) {
                cache.mark_processed(key);
            }
            debug!(%event, handler = %subscription.handler, "Handled");
            settle(channel, &delivery, Settle::Ack).await;
            return;
        };

        warn!(%event, handler = %subscription.handler, %reason, "Handler failed");
        let outcome = match self.retry.try_retry(&delivery, &event).await {
            Ok(true) => Settle::Ack,
            Ok(false) => Settle::Reject,
            Err(err) => {
                error!(%event, error = %err, "Retry failed, dead-lettering");
                Settle::Reject
            },
        };
        settle(channel, &delivery, outcome).await;
    }

    /// Cancels every consumer and releases the concurrency limits; pending
    /// requests are dropped.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _gate = self.start_gate.lock().await;

        let queues: Vec<String> = self.consumers.iter().map(|entry| entry.key().clone()).collect();
        for queue in queues {
            let Some((_, active)) = self.consumers.remove(&queue) else {
                continue;
            };
            if let Some(semaphore) = &active.semaphore {
                semaphore.close();
            }
            if let Err(err) = active.channel.basic_cancel(&active.tag).await {
                warn!(%queue, tag = %active.tag, error = %err, "Failed to cancel consumer");
            }
        }
        self.pending.clear();
        info!("Dispatcher stopped");
    }
}

async fn settle(channel: &Arc<dyn Channel>, delivery: &Delivery, settle: Settle) {
    let result = match settle {
        Settle::Ack => channel.basic_ack(delivery.delivery_tag).await,
        Settle::Reject => channel.basic_nack(delivery.delivery_tag, false).await,
    };
    if let Err(err) = result {
        warn!(tag = delivery.delivery_tag, error = %err, "Failed to settle delivery");
    }
}
