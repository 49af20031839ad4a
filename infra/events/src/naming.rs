//! Broker-side names shared with every other service on the same broker.

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";
pub const FIRST_DEATH_REASON_HEADER: &str = "x-first-death-reason";
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
pub const MESSAGE_TTL_ARG: &str = "x-message-ttl";
pub const CONTENT_TYPE_JSON: &str = "application/json";

const DEFAULT_SUFFIX: &str = "default";

#[must_use]
pub fn exchange(event: &str) -> String {
    format!("exchange.{event}")
}

#[must_use]
pub fn dead_letter_exchange(event: &str) -> String {
    format!("exchange.{event}.dlx")
}

#[must_use]
pub fn dead_letter_queue(event: &str) -> String {
    format!("queue.{event}.dlq")
}

#[must_use]
pub fn retry_exchange(event: &str, tier: u32) -> String {
    format!("exchange.{event}.retry-{tier}")
}

#[must_use]
pub fn retry_queue(event: &str, tier: u32) -> String {
    format!("queue.{event}.retry-{tier}")
}

#[must_use]
pub fn reply_queue(correlation_id: &str) -> String {
    format!("reply.{correlation_id}")
}

/// `queue.{event}.{handler}.{suffix}`, see [`routing_key_suffix`].
#[must_use]
pub fn subscriber_queue(event: &str, handler: &str, routing_key: &str) -> String {
    format!("queue.{event}.{handler}.{}", routing_key_suffix(routing_key))
}

/// Makes a routing key safe for a queue name: `orders.*.eu` becomes `orders_any_eu`,
/// `#` becomes `all`, and the empty key becomes `default`.
#[must_use]
pub fn routing_key_suffix(routing_key: &str) -> String {
    if routing_key.is_empty() {
        return DEFAULT_SUFFIX.to_owned();
    }
    routing_key.replace('.', "_").replace('*', "any").replace('#', "all")
}
