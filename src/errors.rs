// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for RabbitMQ Delivery
//!
//! Two layers of errors live here. `BrokerError` is what the broker seam
//! (`AmqpChannel`) reports: the raw failure text plus a classified kind.
//! `AmqpError` is the caller-facing taxonomy. Every variant names the operation's
//! target (queue, exchange or delivery tag) and keeps the broker cause, so the
//! caller can decide whether a retry makes sense. Nothing in this crate retries
//! on its own.

use std::time::Duration;
use thiserror::Error;

/// Classification of a broker-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// 406: redeclaration with different arguments, unknown delivery tag, ...
    PreconditionFailed,
    /// 404: the entity does not exist.
    NotFound,
    /// The channel or connection is no longer usable.
    Closed,
    Other,
}

/// A failure reported by the broker or by the client library talking to it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        BrokerError {
            kind,
            message: message.into(),
        }
    }

    pub fn closed() -> Self {
        BrokerError::new(BrokerErrorKind::Closed, "channel is closed")
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        use lapin::protocol::{AMQPErrorKind, AMQPSoftError};

        let kind = match &err {
            lapin::Error::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    BrokerErrorKind::PreconditionFailed
                }
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BrokerErrorKind::NotFound,
                _ => BrokerErrorKind::Other,
            },
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                BrokerErrorKind::Closed
            }
            _ => BrokerErrorKind::Other,
        };

        BrokerError::new(kind, err.to_string())
    }
}

/// Represents errors that can occur during delivery operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Configuration could not be loaded or is invalid
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The session was already closed
    #[error("session is closed")]
    SessionClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{exchange}`: {cause}")]
    DeclareExchangeError { exchange: String, cause: String },

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{queue}`: {cause}")]
    DeclareQueueError { queue: String, cause: String },

    /// The entity already exists with different arguments
    #[error("topology conflict on `{name}`: {cause}")]
    TopologyConflict { name: String, cause: String },

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{queue}` to exchange `{exchange}`: {cause}")]
    BindingExchangeToQueueError {
        exchange: String,
        queue: String,
        cause: String,
    },

    /// Error enabling publisher confirms on the channel
    #[error("failure to enable publisher confirms: {0}")]
    ConfirmSelectError(String),

    /// Error publishing a message
    #[error("failure to publish to `{queue}`: {cause}")]
    PublishingError { queue: String, cause: String },

    /// The broker answered the publish with a nack
    #[error("message to `{0}` was not confirmed by the broker")]
    NotConfirmed(String),

    /// No confirmation arrived in time, the outcome is unknown
    #[error("timeout after {timeout:?} waiting for confirmation of publish to `{queue}`")]
    ConfirmationTimeout { queue: String, timeout: Duration },

    /// A mandatory publish could not be routed to any queue
    #[error("message to `{0}` was returned as unroutable")]
    Unroutable(String),

    /// The message was rejected before reaching the broker
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// No message available, this is not a fault
    #[error("no messages available in queue `{0}`")]
    EmptyQueue(String),

    /// Passive query against a queue that does not exist
    #[error("queue `{0}` not found")]
    QueueNotFound(String),

    /// Error retrieving a message
    #[error("failure to consume from `{queue}`: {cause}")]
    ConsumerError { queue: String, cause: String },

    /// Error acknowledging a message
    #[error("failure to ack message with delivery tag {tag}: {cause}")]
    AckMessageError { tag: u64, cause: String },

    /// Error negative-acknowledging a message
    #[error("failure to nack message with delivery tag {tag}: {cause}")]
    NackMessageError { tag: u64, cause: String },

    /// Dead-letter operation on a session without dead-letter topology
    #[error("no dead-letter topology is configured")]
    DeadLetterNotConfigured,
}

/// Returned by a batch publish that stopped early.
///
/// Messages counted in `confirmed` were accepted by the broker and are not
/// rolled back.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("batch stopped after {confirmed} confirmed messages: {source}")]
pub struct BatchPublishError {
    pub confirmed: usize,
    #[source]
    pub source: AmqpError,
}
