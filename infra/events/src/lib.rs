//! # Event Bus
//!
//! A broker-backed, type-safe, asynchronous event bus.
//!
//! ## Overview
//!
//! [`EventBus`] publishes serde payloads to per-event exchanges and runs handlers
//! for them from durable queues. Around that it builds the broker-side plumbing
//! every service on the broker agrees on:
//!
//! * `exchange.{Event}` with `fanout`, `direct` or `topic` routing,
//! * a dead-letter exchange and queue per event (`exchange.{Event}.dlx`, `queue.{Event}.dlq`),
//! * delayed retry tiers (`exchange.{Event}.retry-N` / `queue.{Event}.retry-N`) whose
//!   message TTL grows with the configured backoff,
//! * request/response over private `reply.{correlationId}` queues.
//!
//! Deliveries are deduplicated per queue, throttled per consumer and acknowledged
//! after the handler returns. A failing handler sends the message to the next retry
//! tier; once the tiers are exhausted it ends in the dead-letter queue.
//!
//! # Example
//!
//! ```rust
//! use courier_broker::memory::InMemoryBroker;
//! use courier_event_bus::{BusConfig, Event, EventBus, EventHandler, EventMeta};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Event)]
//! struct UserCreated {
//!     #[serde(flatten)]
//!     meta: EventMeta,
//!     id: u64,
//! }
//!
//! struct Welcome;
//!
//! #[async_trait::async_trait]
//! impl EventHandler<UserCreated> for Welcome {
//!     async fn handle(&self, event: UserCreated) -> anyhow::Result<()> {
//!         assert_eq!(event.id, 42);
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), courier_event_bus::BusError> {
//! let bus = EventBus::new(BusConfig::default(), Arc::new(InMemoryBroker::new()));
//! let queue = bus.subscribe::<UserCreated, _>(Welcome).await?;
//! assert_eq!(queue, "queue.UserCreated.Welcome.default");
//!
//! bus.publish(UserCreated { meta: EventMeta::new(), id: 42 }).await?;
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```

extern crate self as courier_event_bus;

mod bus;
mod error;
mod event;
mod health;

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod host;
pub mod idempotency;
pub mod metrics;
pub mod naming;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod topology;

pub use crate::bus::{EventBus, SubscribeOptions};
pub use crate::config::{BusConfig, load_config};
pub use crate::error::{BusError, BusErrorExt};
pub use crate::event::{Event, EventMeta, Request, RequestMeta, Response, ResponseMeta, short_type_name};
pub use crate::health::HealthStatus;
pub use crate::host::{BusHost, ConsumerRegistry, HostReport};
pub use crate::metrics::{BusMetrics, InMemoryMetrics, NoopMetrics};
pub use crate::registry::{EventHandler, SubscriptionRegistry};
pub use courier_broker::ExchangeKind;
pub use courier_derive::Event;
