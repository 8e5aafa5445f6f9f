// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Service
//!
//! `MessageService` is the entry point used by an HTTP or CLI front end. It
//! opens the session, installs the topology of the configured
//! [`DeliveryMode`], and maps each text-level request onto the delivery core:
//!
//! | Request | AutoAck | DeadLetter | Quorum |
//! |---|---|---|---|
//! | `publish` | publish | publish | publish with confirmation |
//! | `consume` | auto-ack fetch | auto-ack fetch | fetch + ack |
//! | `consume_and_fail` | fetch + nack(requeue) | fetch + nack(requeue) | fetch + nack(requeue) |
//! | `reject` | fetch + nack (dropped) | fetch + nack (dead-lettered) | fetch + nack (dropped) |
//! | `consume_dlq` | error | auto-ack fetch from DLQ | error |
//! | `stats` | passive describe | passive describe | passive describe |

use crate::{
    configs::{DeliveryMode, RabbitMQConfigs},
    consumer::RabbitMQConsumer,
    errors::AmqpError,
    publisher::{Message, RabbitMQPublisher},
    queue::QueueDefinition,
    session::Session,
    stats::describe_queue,
    topology::{declare_dead_letter_topology, declare_queue},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Queue statistics as reported to the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub queue_name: String,
    pub queue_type: &'static str,
    pub messages: u32,
    pub consumers: u32,
}

pub struct MessageService {
    cfg: RabbitMQConfigs,
    session: Arc<Session>,
    publisher: Arc<RabbitMQPublisher>,
    consumer: Arc<RabbitMQConsumer>,
}

impl MessageService {
    /// Connects to the configured broker and installs the topology.
    pub async fn start(cfg: RabbitMQConfigs) -> Result<MessageService, AmqpError> {
        let session = Session::open(&cfg.url, &cfg.connection_name).await?;
        Self::with_session(cfg, session).await
    }

    /// Installs the topology on an already open session.
    ///
    /// The session is closed again when the setup fails.
    pub async fn with_session(
        cfg: RabbitMQConfigs,
        session: Arc<Session>,
    ) -> Result<MessageService, AmqpError> {
        let service = MessageService {
            publisher: RabbitMQPublisher::new(session.clone()),
            consumer: RabbitMQConsumer::new(session.clone()),
            session,
            cfg,
        };

        if let Err(err) = service.setup().await {
            error!(error = err.to_string(), "failure to set up the topology");
            service.session.close().await;
            return Err(err);
        }

        info!(
            queue = service.cfg.queue_name.as_str(),
            mode = ?service.cfg.mode,
            "message service started"
        );
        Ok(service)
    }

    async fn setup(&self) -> Result<(), AmqpError> {
        let cfg = &self.cfg;

        match cfg.mode {
            DeliveryMode::AutoAck => {
                declare_queue(&self.session, &QueueDefinition::new(&cfg.queue_name).durable())
                    .await?;
            }
            DeliveryMode::DeadLetter => {
                declare_dead_letter_topology(
                    &self.session,
                    &cfg.dlx_exchange,
                    &cfg.dlq_name,
                    &cfg.dlx_routing_key,
                )
                .await?;
                declare_queue(
                    &self.session,
                    &QueueDefinition::new(&cfg.queue_name)
                        .durable()
                        .with_dead_letter(&cfg.dlx_exchange, &cfg.dlx_routing_key),
                )
                .await?;
            }
            DeliveryMode::Quorum => {
                self.publisher.enable_confirms().await?;
                declare_queue(&self.session, &QueueDefinition::new(&cfg.queue_name).quorum())
                    .await?;
            }
        }

        Ok(())
    }

    pub fn mode(&self) -> DeliveryMode {
        self.cfg.mode
    }

    pub async fn publish(&self, text: &str) -> Result<(), AmqpError> {
        if text.is_empty() {
            return Err(AmqpError::InvalidMessage(
                "message cannot be empty".to_owned(),
            ));
        }

        let message = Message::text(text);
        match self.cfg.mode {
            DeliveryMode::Quorum => {
                self.publisher
                    .publish_with_confirmation(
                        &self.cfg.queue_name,
                        &message,
                        self.cfg.confirm_timeout(),
                    )
                    .await
            }
            _ => self.publisher.publish(&self.cfg.queue_name, &message).await,
        }
    }

    pub async fn consume(&self) -> Result<String, AmqpError> {
        let message = match self.cfg.mode {
            DeliveryMode::Quorum => self.consumer.consume_and_ack(&self.cfg.queue_name).await?,
            _ => self.consumer.fetch(&self.cfg.queue_name, true).await?,
        };

        Ok(message.text())
    }

    /// Simulates a processing failure: the message goes back to the queue.
    pub async fn consume_and_fail(&self) -> Result<String, AmqpError> {
        let message = self
            .consumer
            .consume_and_nack(&self.cfg.queue_name, true)
            .await?;

        Ok(message.text())
    }

    /// Rejects the next message without requeue.
    pub async fn reject(&self) -> Result<String, AmqpError> {
        let message = self.consumer.reject_message(&self.cfg.queue_name).await?;
        Ok(message.text())
    }

    pub async fn consume_dlq(&self) -> Result<String, AmqpError> {
        if self.cfg.mode != DeliveryMode::DeadLetter {
            return Err(AmqpError::DeadLetterNotConfigured);
        }

        let message = self
            .consumer
            .consume_from_dead_letter_queue(&self.cfg.dlq_name)
            .await?;

        Ok(message.text())
    }

    pub async fn stats(&self) -> Result<ServiceStats, AmqpError> {
        let stats = describe_queue(&self.session, &self.cfg.queue_name).await?;

        Ok(ServiceStats {
            queue_name: self.cfg.queue_name.clone(),
            queue_type: match self.cfg.mode {
                DeliveryMode::Quorum => "quorum",
                _ => "classic",
            },
            messages: stats.message_count,
            consumers: stats.consumer_count,
        })
    }

    pub async fn health(&self) -> bool {
        self.session.is_open().await
    }

    pub async fn shutdown(&self) {
        self.session.close().await;
    }
}
