use courier_broker::BrokerError;
use std::borrow::Cow;

/// Errors surfaced by the event bus.
///
/// Handler failures and exhausted retries never show up here; they end in the
/// dead-letter queue and are only visible through logs and metrics.
#[courier_derive::bus_error]
pub enum BusError {
    /// A connection was required but none is open.
    #[error("Not connected{}: {message}", format_context(.context))]
    NotConnected { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The connect loop gave up after the configured number of attempts.
    #[error("Broker connection unavailable{}: {message}", format_context(.context))]
    ConnectionUnavailable { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Broker error{}: {source}", format_context(.context))]
    Broker { source: BrokerError, context: Option<Cow<'static, str>> },

    /// The same handler is already registered on the same queue for the event.
    #[error("Duplicate subscription{}: {message}", format_context(.context))]
    DuplicateSubscription { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Serialization error{}: {source}", format_context(.context))]
    Serialization { source: serde_json::Error, context: Option<Cow<'static, str>> },

    #[error("Deserialization error{}: {message}", format_context(.context))]
    Deserialization { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// No correlated reply arrived in time.
    #[error("Request timed out{}: {message}", format_context(.context))]
    RequestTimeout { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The broker rejected the publish or the channel failed mid-send.
    #[error("Publish failed{}: {message}", format_context(.context))]
    PublishFailure { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The bus has been shut down.
    #[error("Event bus is shut down{}: {message}", format_context(.context))]
    ShutDown { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Configuration error{}: {source}", format_context(.context))]
    Config { source: config::ConfigError, context: Option<Cow<'static, str>> },

    #[error("Internal error{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

impl BusError {
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    #[must_use]
    pub const fn is_duplicate_subscription(&self) -> bool {
        matches!(self, Self::DuplicateSubscription { .. })
    }

    /// True for a `404` reply from the broker, e.g. a queue that no longer exists.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Broker { source, .. } if source.is_not_found())
    }

    /// True for a `406` reply from the broker.
    #[must_use]
    pub const fn is_topology_conflict(&self) -> bool {
        matches!(self, Self::Broker { source, .. } if source.is_precondition_failed())
    }
}
