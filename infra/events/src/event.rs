use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity every event carries on the wire (`id`, `createdOn`).
///
/// Flatten it into the payload struct:
///
/// ```rust
/// use courier_event_bus::{Event, EventMeta};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize, Event)]
/// #[serde(rename_all = "camelCase")]
/// struct OrderCreated {
///     #[serde(flatten)]
///     meta: EventMeta,
///     order_id: u64,
/// }
///
/// let event = OrderCreated { meta: EventMeta::new(), order_id: 7 };
/// assert_eq!(<OrderCreated as Event>::NAME, "OrderCreated");
/// assert!(!event.meta().is_unassigned());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    #[serde(default)]
    pub id: Uuid,
    #[serde(default = "unix_epoch")]
    pub created_on: DateTime<Utc>,
}

impl EventMeta {
    /// Fresh identity: random id, current time.
    #[must_use]
    pub fn new() -> Self {
        Self { id: Uuid::new_v4(), created_on: Utc::now() }
    }

    /// Nil id and epoch timestamp; the publisher fills both in at send time.
    #[must_use]
    pub const fn unassigned() -> Self {
        Self { id: Uuid::nil(), created_on: DateTime::UNIX_EPOCH }
    }

    #[must_use]
    pub fn is_unassigned(&self) -> bool {
        self.id.is_nil() || self.created_on == DateTime::UNIX_EPOCH
    }

    /// Replaces whichever of id/timestamp still holds its default.
    pub(crate) fn assign_if_unset(&mut self) {
        if self.id.is_nil() {
            self.id = Uuid::new_v4();
        }
        if self.created_on == DateTime::UNIX_EPOCH {
            self.created_on = Utc::now();
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}

const fn unix_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Correlation fields carried by request payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Correlation field carried by response payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// A payload that can travel over the bus.
///
/// Usually derived with `#[derive(Event)]`, which locates the [`EventMeta`] field and,
/// when present, the [`RequestMeta`] / [`ResponseMeta`] fields.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Wire name: drives exchange/queue naming and the message `type` property.
    const NAME: &'static str;

    fn meta(&self) -> &EventMeta;

    fn meta_mut(&mut self) -> &mut EventMeta;

    fn request_meta(&self) -> Option<&RequestMeta> {
        None
    }

    fn request_meta_mut(&mut self) -> Option<&mut RequestMeta> {
        None
    }

    fn response_meta(&self) -> Option<&ResponseMeta> {
        None
    }

    fn response_meta_mut(&mut self) -> Option<&mut ResponseMeta> {
        None
    }
}

/// An event that expects a correlated [`Response`].
pub trait Request: Event {
    fn request(&self) -> &RequestMeta;

    fn request_mut(&mut self) -> &mut RequestMeta;
}

/// The reply to a [`Request`].
pub trait Response: Event {
    fn response(&self) -> &ResponseMeta;

    fn response_mut(&mut self) -> &mut ResponseMeta;
}

/// Last path segment of a type name, generics stripped: `app::handlers::Audit<X>` -> `Audit`.
#[must_use]
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
