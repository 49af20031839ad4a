use crate::config::MessageTtlSettings;
use crate::error::BusError;
use crate::event::Event;
use crate::metrics::BusMetrics;
use crate::naming;
use crate::topology::ChannelManager;
use courier_broker::{FieldTable, MessageProperties};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Serializes events and sends them with the bus envelope.
#[derive(Debug)]
pub struct Publisher {
    channels: Arc<ChannelManager>,
    ttl: MessageTtlSettings,
    metrics: Arc<dyn BusMetrics>,
}

impl Publisher {
    #[must_use]
    pub fn new(
        channels: Arc<ChannelManager>,
        ttl: MessageTtlSettings,
        metrics: Arc<dyn BusMetrics>,
    ) -> Self {
        Self { channels, ttl, metrics }
    }

    /// Publishes `event` to `exchange` with `routing_key`; returns the message id.
    ///
    /// Assigns the event id and timestamp if they are still unset. Never retries.
    ///
    /// # Errors
    /// [`BusError::Serialization`] for unserializable payloads,
    /// [`BusError::PublishFailure`] when the broker rejects the message.
    #[instrument(skip(self, event, event_name), fields(event = event_name))]
    pub async fn publish<E: Event>(
        &self,
        event: &mut E,
        exchange: &str,
        routing_key: &str,
        event_name: &str,
    ) -> Result<Uuid, BusError> {
        let started = Instant::now();
        event.meta_mut().assign_if_unset();

        let body = serde_json::to_vec(&*event)?;
        let properties = self.properties(event, event_name);
        let message_id = event.meta().id;

        let channel = self.channels.channel().await?;
        let sent = channel.basic_publish(exchange, routing_key, true, properties, body).await;
        self.metrics.record_published(event_name, started.elapsed(), sent.is_ok());
        if let Err(err) = sent {
            self.channels.discard_if_closed();
            return Err(BusError::PublishFailure {
                message: err.to_string().into(),
                context: Some(format!("exchange '{exchange}'").into()),
            });
        }

        debug!(%message_id, "Published");
        Ok(message_id)
    }

    fn properties<E: Event>(&self, event: &E, event_name: &str) -> MessageProperties {
        let meta = event.meta();
        let mut properties = MessageProperties {
            persistent: true,
            kind: Some(event_name.to_owned()),
            message_id: Some(meta.id.to_string()),
            timestamp: u64::try_from(meta.created_on.timestamp()).ok(),
            content_type: Some(naming::CONTENT_TYPE_JSON.to_owned()),
            expiration: self.ttl.enabled.then(|| self.ttl.default_ttl_ms.to_string()),
            correlation_id: None,
            reply_to: None,
            headers: FieldTable::new(),
        };
        if let Some(request) = event.request_meta() {
            properties.correlation_id.clone_from(&request.correlation_id);
            properties.reply_to.clone_from(&request.reply_to);
        } else if let Some(response) = event.response_meta() {
            properties.correlation_id.clone_from(&response.correlation_id);
        }
        properties
    }
}
