// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Polling consumption with `basic.get`. A fetch never blocks waiting for a
//! message: an empty queue is reported right away as `AmqpError::EmptyQueue`.
//!
//! Per message the lifecycle is:
//!
//! ```text
//! ready --fetch(auto_ack)--> committed
//! ready --fetch(manual)----> unsettled(tag) --ack--> committed
//!                                           --nack(requeue)----> ready
//!                                           --nack(no requeue)-> dead-lettered or dropped
//! ```
//!
//! Auto-ack fetches are at-most-once: the broker forgets the message as soon as
//! it is handed out, a crash afterwards loses it.

use crate::{
    errors::{AmqpError, BrokerError, BrokerErrorKind},
    otel,
    session::Session,
};
use lapin::{protocol::basic::AMQPProperties, types::FieldTable};
use opentelemetry::trace::{Span, Status};
use std::{fmt, sync::Arc};
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Broker handle of a fetched, not yet settled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(tag: u64) -> Self {
        DeliveryTag(tag)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message taken from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
    /// Only present for manual-ack fetches.
    pub delivery_tag: Option<DeliveryTag>,
    pub redelivered: bool,
    /// Messages left in the queue after this one.
    pub message_count: u32,
    /// How many times the message was dead-lettered.
    pub death_count: i64,
}

impl ReceivedMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Fetches and settles messages on one session.
pub struct RabbitMQConsumer {
    session: Arc<Session>,
}

impl RabbitMQConsumer {
    /// Creates a new consumer on `session`.
    ///
    /// # Parameters
    /// * `session` - The session whose channel fetches and settles messages
    ///
    /// # Returns
    /// A new consumer wrapped in an Arc
    pub fn new(session: Arc<Session>) -> Arc<RabbitMQConsumer> {
        Arc::new(RabbitMQConsumer { session })
    }

    /// Takes the next message of `queue`.
    ///
    /// With `auto_ack` the message is committed on delivery and no tag is
    /// returned. Otherwise the message stays unsettled until `ack` or `nack`.
    ///
    /// # Parameters
    /// * `queue` - The queue to take the message from
    /// * `auto_ack` - Whether the broker settles the message on delivery
    ///
    /// # Returns
    /// The message, `AmqpError::EmptyQueue` when nothing is ready, or
    /// `AmqpError::QueueNotFound` when the queue does not exist. The broker
    /// closes the channel after a missing queue, see `Session::is_open`.
    pub async fn fetch(&self, queue: &str, auto_ack: bool) -> Result<ReceivedMessage, AmqpError> {
        let mut guard = self.session.acquire().await?;

        let message = match guard.channel.basic_get(queue, auto_ack).await {
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to consume message");
                return Err(consumer_error(queue, err));
            }
            Ok(None) => {
                debug!(queue, "no messages available");
                return Err(AmqpError::EmptyQueue(queue.to_owned()));
            }
            Ok(Some(message)) => message,
        };

        let mut span = otel::new_span(&message.properties, queue);
        span.set_status(Status::Ok);

        let delivery_tag = if auto_ack {
            None
        } else {
            guard.state.track(message.delivery_tag);
            Some(DeliveryTag(message.delivery_tag))
        };

        debug!(
            queue,
            delivery_tag = message.delivery_tag,
            redelivered = message.redelivered,
            auto_ack,
            "message fetched"
        );

        Ok(ReceivedMessage {
            queue: queue.to_owned(),
            content_type: message.properties.content_type().as_ref().map(|c| c.to_string()),
            death_count: extract_death_count(&message.properties),
            delivery_tag,
            redelivered: message.redelivered,
            message_count: message.message_count,
            payload: message.data,
        })
    }

    /// Commits an unsettled message.
    ///
    /// # Parameters
    /// * `tag` - The delivery tag returned by a manual `fetch`
    ///
    /// # Returns
    /// `AmqpError::AckMessageError` when the tag is unknown or already settled
    pub async fn ack(&self, tag: DeliveryTag) -> Result<(), AmqpError> {
        let mut guard = self.session.acquire().await?;

        if !guard.state.settle(tag.0) {
            warn!(delivery_tag = tag.0, "ack of an unknown or settled delivery tag");
            return Err(AmqpError::AckMessageError {
                tag: tag.0,
                cause: "unknown or already settled delivery tag".to_owned(),
            });
        }

        match guard.channel.basic_ack(tag.0).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    delivery_tag = tag.0,
                    "error while acking message"
                );
                Err(AmqpError::AckMessageError {
                    tag: tag.0,
                    cause: err.to_string(),
                })
            }
            _ => {
                debug!(delivery_tag = tag.0, "message acknowledged");
                Ok(())
            }
        }
    }

    /// Rejects an unsettled message.
    ///
    /// With `requeue` the broker puts it back in its queue. Without, the broker
    /// dead-letters it when the queue has a dead-letter exchange, or drops it.
    pub async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), AmqpError> {
        let mut guard = self.session.acquire().await?;

        if !guard.state.settle(tag.0) {
            warn!(delivery_tag = tag.0, "nack of an unknown or settled delivery tag");
            return Err(AmqpError::NackMessageError {
                tag: tag.0,
                cause: "unknown or already settled delivery tag".to_owned(),
            });
        }

        match guard.channel.basic_nack(tag.0, requeue).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    delivery_tag = tag.0,
                    "error while nacking message"
                );
                Err(AmqpError::NackMessageError {
                    tag: tag.0,
                    cause: err.to_string(),
                })
            }
            _ => {
                debug!(delivery_tag = tag.0, requeue, "message rejected");
                Ok(())
            }
        }
    }

    /// Fetches the next message of `queue` manually and acknowledges it.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume from
    ///
    /// # Returns
    /// The committed message
    pub async fn consume_and_ack(&self, queue: &str) -> Result<ReceivedMessage, AmqpError> {
        let message = self.fetch(queue, false).await?;
        self.ack(unsettled_tag(&message)?).await?;
        Ok(message)
    }

    /// Fetches the next message of `queue` manually and rejects it.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume from
    /// * `requeue` - Whether the broker puts the message back in `queue`
    ///
    /// # Returns
    /// The rejected message
    pub async fn consume_and_nack(
        &self,
        queue: &str,
        requeue: bool,
    ) -> Result<ReceivedMessage, AmqpError> {
        let message = self.fetch(queue, false).await?;
        self.nack(unsettled_tag(&message)?, requeue).await?;
        Ok(message)
    }

    /// Rejects the next message of `queue` without requeue, which routes it to
    /// the queue's dead-letter exchange.
    pub async fn reject_message(&self, queue: &str) -> Result<ReceivedMessage, AmqpError> {
        self.consume_and_nack(queue, false).await
    }

    /// Takes the next dead-lettered message, auto-acked.
    ///
    /// # Parameters
    /// * `dlq` - The dead-letter queue name
    ///
    /// # Returns
    /// The message with its `death_count`, or `AmqpError::EmptyQueue`
    pub async fn consume_from_dead_letter_queue(
        &self,
        dlq: &str,
    ) -> Result<ReceivedMessage, AmqpError> {
        self.fetch(dlq, true).await
    }
}

fn unsettled_tag(message: &ReceivedMessage) -> Result<DeliveryTag, AmqpError> {
    message.delivery_tag.ok_or_else(|| {
        AmqpError::InternalError(format!(
            "manual fetch from `{}` returned no delivery tag",
            message.queue
        ))
    })
}

fn consumer_error(queue: &str, err: BrokerError) -> AmqpError {
    match err.kind {
        BrokerErrorKind::NotFound => AmqpError::QueueNotFound(queue.to_owned()),
        _ => AmqpError::ConsumerError {
            queue: queue.to_owned(),
            cause: err.to_string(),
        },
    }
}

/// Reads the dead-letter count from the first `x-death` entry.
fn extract_death_count(props: &AMQPProperties) -> i64 {
    let headers = match props.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|arr| arr.as_slice().first())
        .and_then(|value| value.as_field_table())
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .and_then(|value| value.as_long_long_int())
        .unwrap_or_default()
}
