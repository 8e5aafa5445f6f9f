// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Passive queue introspection. Describing a queue never declares it.

use crate::{
    errors::{AmqpError, BrokerErrorKind},
    session::Session,
};
use serde::Serialize;
use tracing::{debug, error};

/// Counters of an existing queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Messages ready for delivery, unsettled ones are not counted.
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Reads the counters of `queue` with a passive declare.
///
/// # Parameters
/// * `session` - The session to inspect through
/// * `queue` - The queue name
///
/// # Returns
/// The counters, or `AmqpError::QueueNotFound` when the queue does not exist
pub async fn describe_queue(session: &Session, queue: &str) -> Result<QueueStats, AmqpError> {
    let guard = session.acquire().await?;

    match guard.channel.queue_inspect(queue).await {
        Ok(state) => {
            debug!(
                queue,
                messages = state.message_count,
                consumers = state.consumer_count,
                "queue described"
            );
            Ok(QueueStats {
                message_count: state.message_count,
                consumer_count: state.consumer_count,
            })
        }
        Err(err) if err.kind == BrokerErrorKind::NotFound => {
            debug!(queue, "queue not found");
            Err(AmqpError::QueueNotFound(queue.to_owned()))
        }
        Err(err) => {
            error!(error = err.to_string(), queue, "failure to describe queue");
            Err(AmqpError::ConsumerError {
                queue: queue.to_owned(),
                cause: err.to_string(),
            })
        }
    }
}
