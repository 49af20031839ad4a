//! # Broker
//!
//! The raw broker primitive the event bus is built on: a connector that opens
//! connections, connections that open channels, and channels that speak the
//! subset of AMQP 0-9-1 the bus needs (QoS, exchange/queue topology, publish,
//! consume, ack/nack, cancel).
//!
//! Two implementations ship with the crate:
//!
//! * [`memory::InMemoryBroker`] keeps exchanges, queues and bindings in process and
//!   reproduces the broker behaviour the bus relies on (fanout/direct/topic routing,
//!   dead-lettering, per-queue message TTL, prefetch, `406` on conflicting redeclaration).
//! * `amqp::LapinConnector` (feature `amqp`) talks to a real broker through `lapin`.

mod error;
mod types;

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use crate::error::{BrokerError, BrokerErrorExt};
pub use crate::types::{
    Consumer, ConnectionEvent, Delivery, ExchangeKind, FieldTable, FieldValue, MessageProperties,
    QueueOptions,
};

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Opens a fresh connection.
    ///
    /// # Errors
    /// [`BrokerError::Connection`] when the broker is unreachable or refuses the login.
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError>;
}

/// A live broker connection.
#[async_trait]
pub trait Connection: Send + Sync + Debug {
    fn is_open(&self) -> bool;

    /// Lifecycle notifications for this connection.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// # Errors
    /// [`BrokerError::Closed`] if the connection is no longer open.
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// # Errors
    /// Transport failures while closing.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A multiplexed channel on a [`Connection`].
///
/// A `406`/`404` reply closes the channel; callers must open a new one.
#[async_trait]
pub trait Channel: Send + Sync + Debug {
    fn is_open(&self) -> bool;

    /// Caps unacknowledged deliveries per consumer (or per channel when `global`).
    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), BrokerError>;

    /// Declares a durable exchange. Redeclaring with another kind fails with `406`.
    async fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    async fn exchange_delete(&self, name: &str) -> Result<(), BrokerError>;

    /// Declares a queue. Redeclaring with other options or arguments fails with `406`.
    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn queue_delete(&self, name: &str) -> Result<(), BrokerError>;

    /// Publishes `body`. The empty exchange name is the default exchange, which routes
    /// by queue name. Unroutable `mandatory` messages are returned by the broker, not failed.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    async fn basic_consume(&self, queue: &str, auto_ack: bool) -> Result<Consumer, BrokerError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
