// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module defines `AmqpChannel`, the seam between the delivery core and the
//! broker, and its lapin implementation. Everything above this module (session,
//! topology, publisher, consumer) only talks to the trait, which is also where
//! test doubles plug in.
//!
//! A pending publisher confirmation is returned as its own future. Dropping it
//! discards the confirmation, so a late ack for a timed-out publish can never be
//! observed by the next publish.

use crate::{
    errors::{AmqpError, BrokerError},
    exchange::ExchangeDefinition,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    publisher_confirm,
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use tracing::{debug, error, warn};

/// AMQP reply code used for a normal close
const REPLY_SUCCESS: u16 = 200;

/// Broker outcome of a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// Mandatory publish that no queue accepted.
    Returned,
    /// The channel is not in confirm mode.
    NotRequested,
}

/// Future resolving to the confirmation of one publish.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, BrokerError>>;

/// Counters reported by a queue declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueState {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A message returned by `basic.get`.
#[derive(Debug, Clone, Default)]
pub struct GetMessage {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub message_count: u32,
    pub data: Vec<u8>,
    pub properties: AMQPProperties,
}

/// Operations the delivery core needs from a broker channel.
///
/// Implementations are not required to be safe for concurrent use, callers
/// serialize access through [`Session`](crate::session::Session).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), BrokerError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueState, BrokerError>;

    /// Passive declare. Never creates the queue.
    async fn queue_inspect(&self, name: &str) -> Result<QueueState, BrokerError>;

    async fn queue_bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), BrokerError>;

    async fn confirm_select(&self) -> Result<(), BrokerError>;

    /// Writes the message. The returned future only resolves to something
    /// meaningful once the channel is in confirm mode.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: &[u8],
        properties: AMQPProperties,
    ) -> Result<PendingConfirm, BrokerError>;

    async fn basic_get(&self, queue: &str, no_ack: bool) -> Result<Option<GetMessage>, BrokerError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close_channel(&self) -> Result<(), BrokerError>;

    async fn close_connection(&self) -> Result<(), BrokerError>;

    /// Whether both the channel and its connection are still usable. The broker
    /// closes a channel on its own after a channel-level error (404, 406).
    fn is_connected(&self) -> bool;
}

/// lapin implementation of `AmqpChannel`: one connection and its command channel.
pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
}

/// Connects to `uri` and opens the command channel.
///
/// When the channel cannot be created the connection is closed before
/// returning, so a failed open leaves nothing behind.
pub async fn new_amqp_channel(uri: &str, connection_name: &str) -> Result<LapinChannel, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(connection_name.to_owned()));

    let connection = match Connection::connect(uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match connection.create_channel().await {
        Ok(channel) => {
            debug!("channel created");
            Ok(LapinChannel {
                connection,
                channel,
            })
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            if let Err(close_err) = connection.close(REPLY_SUCCESS, "channel setup failed").await {
                warn!(error = close_err.to_string(), "failure to close connection");
            }
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::from)
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueState, BrokerError> {
        let queue = self.channel.queue_declare(name, options, args).await?;

        Ok(QueueState {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_inspect(&self, name: &str) -> Result<QueueState, BrokerError> {
        // A 404 closes the channel it happened on, keep it off the command channel.
        let scratch = self.connection.create_channel().await?;

        let result = scratch
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        if scratch.status().connected() {
            if let Err(err) = scratch.close(REPLY_SUCCESS, "inspect done").await {
                debug!(error = err.to_string(), "failure to close inspect channel");
            }
        }

        let queue = result?;
        Ok(QueueState {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::from)
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(BrokerError::from)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: &[u8],
        properties: AMQPProperties,
    ) -> Result<PendingConfirm, BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await?;

        Ok(Box::pin(async move {
            let confirmation = match confirm.await.map_err(BrokerError::from)? {
                publisher_confirm::Confirmation::Ack(None) => Confirmation::Ack,
                publisher_confirm::Confirmation::Ack(Some(_)) => Confirmation::Returned,
                publisher_confirm::Confirmation::Nack(_) => Confirmation::Nack,
                publisher_confirm::Confirmation::NotRequested => Confirmation::NotRequested,
            };
            Ok::<_, BrokerError>(confirmation)
        }))
    }

    async fn basic_get(&self, queue: &str, no_ack: bool) -> Result<Option<GetMessage>, BrokerError> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack })
            .await?;

        Ok(message.map(|msg| GetMessage {
            delivery_tag: msg.delivery.delivery_tag,
            redelivered: msg.delivery.redelivered,
            message_count: msg.message_count,
            data: msg.delivery.data,
            properties: msg.delivery.properties,
        }))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(BrokerError::from)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(BrokerError::from)
    }

    async fn close_channel(&self) -> Result<(), BrokerError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "session closed")
            .await
            .map_err(BrokerError::from)
    }

    async fn close_connection(&self) -> Result<(), BrokerError> {
        if !self.connection.status().connected() {
            return Ok(());
        }

        self.connection
            .close(REPLY_SUCCESS, "session closed")
            .await
            .map_err(BrokerError::from)
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}
