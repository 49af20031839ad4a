use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;

/// Exchange routing kinds used by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Fanout,
    Direct,
    Topic,
}

impl ExchangeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fanout => "fanout",
            Self::Direct => "direct",
            Self::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fanout" => Ok(Self::Fanout),
            "direct" => Ok(Self::Direct),
            "topic" => Ok(Self::Topic),
            other => Err(format!("unknown exchange kind '{other}'")),
        }
    }
}

/// A header or argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Ordered key/value table used for message headers and declaration arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldTable(BTreeMap<String, FieldValue>);

impl FieldTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    /// Integer lookup; numeric strings are accepted since some clients stringify headers.
    #[must_use]
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            FieldValue::Int(value) => Some(*value),
            FieldValue::Str(value) => value.trim().parse().ok(),
            FieldValue::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            FieldValue::Str(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for FieldTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Transport envelope attached to every published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Delivery mode 2 when set.
    pub persistent: bool,
    /// The AMQP `type` property; carries the event name.
    pub kind: Option<String>,
    pub message_id: Option<String>,
    /// Unix seconds.
    pub timestamp: Option<u64>,
    pub content_type: Option<String>,
    /// Per-message TTL in milliseconds, rendered as a decimal string.
    pub expiration: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: FieldTable,
}

/// Declaration flags and arguments for a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

impl QueueOptions {
    /// Durable, shared and kept after the last consumer leaves.
    #[must_use]
    pub fn durable() -> Self {
        Self { durable: true, ..Self::default() }
    }

    /// Non-durable, owned by the declaring connection and removed with its last consumer.
    #[must_use]
    pub fn exclusive() -> Self {
        Self { durable: false, exclusive: true, auto_delete: true, arguments: FieldTable::new() }
    }

    #[must_use]
    pub fn argument(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.arguments.insert(key, value);
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// A started consumer: its broker-assigned tag and the delivery stream.
///
/// The stream ends when the consumer is cancelled, its queue is deleted or the channel closes.
#[derive(Debug)]
pub struct Consumer {
    pub tag: String,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The broker or the network closed the connection.
    Shutdown { reason: String },
    /// The broker stopped accepting publishes (resource alarm).
    Blocked { reason: String },
    Unblocked,
    /// A client callback failed.
    CallbackError { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_kind_parses_case_insensitively() {
        assert_eq!("Topic".parse::<ExchangeKind>(), Ok(ExchangeKind::Topic));
        assert_eq!("fanout".parse::<ExchangeKind>(), Ok(ExchangeKind::Fanout));
        assert!("headers".parse::<ExchangeKind>().is_err());
        assert_eq!(ExchangeKind::Direct.to_string(), "direct");
    }

    #[test]
    fn field_table_int_lookup_accepts_numeric_strings() {
        let table = FieldTable::new().with("x-retry-count", "2").with("x-message-ttl", 1000_i64);
        assert_eq!(table.get_int("x-retry-count"), Some(2));
        assert_eq!(table.get_int("x-message-ttl"), Some(1000));
        assert_eq!(table.get_int("missing"), None);
        assert_eq!(table.get_str("x-retry-count"), Some("2"));
    }

    #[test]
    fn argument_tables_compare_by_content() {
        let a = QueueOptions::durable().argument("x-dead-letter-exchange", "exchange.A.dlx");
        let b = QueueOptions::durable().argument("x-dead-letter-exchange", "exchange.A.dlx");
        let c = QueueOptions::durable();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
