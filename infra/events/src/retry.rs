use crate::config::RetrySettings;
use crate::error::{BusError, BusErrorExt};
use crate::metrics::BusMetrics;
use crate::naming;
use crate::topology::ChannelManager;
use courier_broker::{Delivery, MessageProperties};
use std::sync::Arc;
use tracing::{info, warn};

/// Delay of retry tier `tier` (1-based) in milliseconds:
/// `min(initial * multiplier^(tier - 1), max)`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn retry_delay(settings: &RetrySettings, tier: u32) -> u64 {
    let exponent = i32::try_from(tier.saturating_sub(1)).unwrap_or(i32::MAX);
    let raw = settings.initial_delay_ms as f64 * settings.backoff_multiplier.powi(exponent);
    let capped = raw.min(settings.max_delay_ms as f64);
    if capped.is_finite() && capped > 0.0 { capped as u64 } else { 0 }
}

/// Number of earlier retries recorded on a delivery; absent or malformed counts as zero.
#[must_use]
pub fn retry_count(delivery: &Delivery) -> u32 {
    delivery
        .properties
        .headers
        .get_int(naming::RETRY_COUNT_HEADER)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

/// Sends failed deliveries into the broker-side retry tiers.
#[derive(Debug)]
pub struct RetryHandler {
    channels: Arc<ChannelManager>,
    settings: RetrySettings,
    metrics: Arc<dyn BusMetrics>,
}

impl RetryHandler {
    #[must_use]
    pub fn new(
        channels: Arc<ChannelManager>,
        settings: RetrySettings,
        metrics: Arc<dyn BusMetrics>,
    ) -> Self {
        Self { channels, settings, metrics }
    }

    /// Republishes `delivery` to its next retry tier.
    ///
    /// The copy keeps the delivery's routing key instead of an empty one, so it
    /// still matches `direct` and `topic` bindings when the tier dead-letters it
    /// back to the primary exchange. On `fanout` exchanges it reaches every bound
    /// queue again; queues that already handled it drop it as a duplicate.
    ///
    /// Returns `false` when retries are disabled or exhausted; the caller then
    /// rejects the delivery so it lands in the dead-letter queue.
    ///
    /// # Errors
    /// [`BusError::PublishFailure`] if the republish fails.
    pub async fn try_retry(&self, delivery: &Delivery, event: &str) -> Result<bool, BusError> {
        let count = retry_count(delivery);
        if !self.settings.enabled || count >= self.settings.max_attempts {
            warn!(event, retries = count, "Retries exhausted, dead-lettering");
            return Ok(false);
        }

        let tier = count + 1;
        let source = &delivery.properties;
        let mut headers = source.headers.clone();
        headers.insert(naming::RETRY_COUNT_HEADER, tier);
        headers.insert(naming::ORIGINAL_QUEUE_HEADER, delivery.routing_key.as_str());
        headers.insert(naming::FIRST_DEATH_REASON_HEADER, "rejected");

        let properties = MessageProperties {
            persistent: true,
            kind: source.kind.clone(),
            message_id: source.message_id.clone(),
            timestamp: source.timestamp,
            content_type: source.content_type.clone(),
            expiration: None,
            correlation_id: source.correlation_id.clone(),
            reply_to: None,
            headers,
        };

        let exchange = naming::retry_exchange(event, tier);
        let channel = self.channels.channel().await?;
        if let Err(err) = channel
            .basic_publish(&exchange, &delivery.routing_key, false, properties, delivery.body.clone())
            .await
        {
            self.channels.discard_if_closed();
            return Err(BusError::PublishFailure {
                message: err.to_string().into(),
                context: None,
            })
            .context("Failed to republish for retry");
        }

        self.metrics.record_retry(event, tier);
        info!(
            event,
            tier,
            delay_ms = retry_delay(&self.settings, tier),
            message_id = source.message_id.as_deref().unwrap_or_default(),
            "Message scheduled for retry"
        );
        Ok(true)
    }
}
