// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Messages are published through the default exchange straight into the named
//! queue, marked persistent. Two flavours exist:
//!
//! - `publish`: returns once the channel accepted the frame.
//! - `publish_with_confirmation`: publishes as mandatory and waits, bounded by a
//!   timeout, for the broker's ack or nack of that single message.
//!
//! Nothing here retries a publish. Without idempotency keys a retry could
//! deliver the message twice, so the decision stays with the caller.

use crate::{
    channel::Confirmation,
    errors::{AmqpError, BatchPublishError, BrokerError},
    otel,
    session::{Session, SessionGuard},
};
use lapin::{
    protocol::basic::AMQPProperties,
    types::{FieldTable, ShortString},
};
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Content type for text payloads
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// An opaque payload plus the properties the broker cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>, content_type: &str) -> Self {
        Message {
            payload: payload.into(),
            content_type: content_type.to_owned(),
            persistent: true,
        }
    }

    /// A persistent `text/plain` message.
    pub fn text(text: &str) -> Self {
        Message::new(text.as_bytes(), TEXT_CONTENT_TYPE)
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    fn properties(&self) -> AMQPProperties {
        let mut headers = BTreeMap::new();
        otel::inject_current(&mut headers);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        AMQPProperties::default()
            .with_content_type(ShortString::from(self.content_type.clone()))
            .with_delivery_mode(if self.persistent {
                DELIVERY_MODE_PERSISTENT
            } else {
                DELIVERY_MODE_TRANSIENT
            })
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_timestamp(timestamp)
            .with_headers(FieldTable::from(headers))
    }
}

/// Publishes into queues of one session.
pub struct RabbitMQPublisher {
    session: Arc<Session>,
}

impl RabbitMQPublisher {
    /// Creates a new publisher on `session`.
    ///
    /// # Parameters
    /// * `session` - The session whose channel publishes
    ///
    /// # Returns
    /// A new publisher wrapped in an Arc
    pub fn new(session: Arc<Session>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { session })
    }

    /// Puts the session's channel in confirm mode. Called implicitly by the
    /// first confirmed publish; exposed so setup can fail early.
    pub async fn enable_confirms(&self) -> Result<(), AmqpError> {
        let mut guard = self.session.acquire().await?;
        ensure_confirms(&mut guard).await
    }

    /// Fire-and-forget publish through the default exchange.
    ///
    /// # Parameters
    /// * `queue` - The destination queue, used as routing key
    /// * `message` - The message to publish
    ///
    /// # Returns
    /// Ok once the channel accepted the message, the broker outcome is unknown
    pub async fn publish(&self, queue: &str, message: &Message) -> Result<(), AmqpError> {
        let guard = self.session.acquire().await?;

        match guard
            .channel
            .basic_publish("", queue, false, &message.payload, message.properties())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error publishing message");
                Err(publishing_error(queue, err))
            }
            // A confirmation for this publish, if any, is deliberately dropped.
            Ok(_) => {
                debug!(queue, "message published");
                Ok(())
            }
        }
    }

    /// Publishes `message` as mandatory and waits up to `timeout` for the broker.
    ///
    /// - ack: `Ok(())`
    /// - nack: `AmqpError::NotConfirmed`
    /// - returned as unroutable: `AmqpError::Unroutable`
    /// - no answer in time: `AmqpError::ConfirmationTimeout`, the message may
    ///   still be accepted later.
    ///
    /// # Parameters
    /// * `queue` - The destination queue, used as routing key
    /// * `message` - The message to publish
    /// * `timeout` - Upper bound for the publish and the broker's answer
    pub async fn publish_with_confirmation(
        &self,
        queue: &str,
        message: &Message,
        timeout: Duration,
    ) -> Result<(), AmqpError> {
        let mut guard = self.session.acquire().await?;
        ensure_confirms(&mut guard).await?;

        let channel = guard.channel;
        let properties = message.properties();
        let exchange = async {
            let pending = channel
                .basic_publish("", queue, true, &message.payload, properties)
                .await?;
            pending.await
        };

        let confirmation = match tokio::time::timeout(timeout, exchange).await {
            Err(_) => {
                warn!(queue, timeout_ms = timeout.as_millis() as u64, "timeout waiting for confirmation");
                return Err(AmqpError::ConfirmationTimeout {
                    queue: queue.to_owned(),
                    timeout,
                });
            }
            Ok(Err(err)) => {
                error!(error = err.to_string(), queue, "error publishing message");
                return Err(publishing_error(queue, err));
            }
            Ok(Ok(confirmation)) => confirmation,
        };

        match confirmation {
            Confirmation::Ack => {
                debug!(queue, "message confirmed by broker");
                Ok(())
            }
            Confirmation::Returned => {
                warn!(queue, "message returned as unroutable");
                Err(AmqpError::Unroutable(queue.to_owned()))
            }
            Confirmation::Nack | Confirmation::NotRequested => {
                warn!(queue, "message not confirmed");
                Err(AmqpError::NotConfirmed(queue.to_owned()))
            }
        }
    }

    /// Publishes each message with confirmation, in order, stopping at the
    /// first failure. Returns the number of confirmed messages.
    ///
    /// Not atomic: messages confirmed before the failure stay published.
    pub async fn publish_batch(
        &self,
        queue: &str,
        messages: &[Message],
        timeout: Duration,
    ) -> Result<usize, BatchPublishError> {
        let mut confirmed = 0;

        for (i, message) in messages.iter().enumerate() {
            if let Err(source) = self.publish_with_confirmation(queue, message, timeout).await {
                error!(
                    error = source.to_string(),
                    position = i + 1,
                    confirmed,
                    "batch publish stopped"
                );
                return Err(BatchPublishError { confirmed, source });
            }
            confirmed += 1;
        }

        Ok(confirmed)
    }
}

async fn ensure_confirms(guard: &mut SessionGuard<'_>) -> Result<(), AmqpError> {
    if guard.state.confirms_enabled() {
        return Ok(());
    }

    match guard.channel.confirm_select().await {
        Err(err) => {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            Err(AmqpError::ConfirmSelectError(err.to_string()))
        }
        Ok(_) => {
            debug!("publisher confirms enabled");
            guard.state.set_confirms_enabled();
            Ok(())
        }
    }
}

fn publishing_error(queue: &str, err: BrokerError) -> AmqpError {
    AmqpError::PublishingError {
        queue: queue.to_owned(),
        cause: err.to_string(),
    }
}
