// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares exchanges, queues and the bindings between them.
//! Declarations are idempotent: running the same topology against a broker that
//! already has it is a no-op, while a declaration whose arguments differ from
//! the existing entity is reported as `AmqpError::TopologyConflict`. Conflicts
//! are never repaired here.
//!
//! The main components are:
//! - `Topology` trait: builder interface for a set of declarations
//! - `AmqpTopology`: implementation installing through a `Session`
//! - `declare_queue` / `declare_dead_letter_topology`: single-shot helpers

use crate::{
    channel::{AmqpChannel, QueueState},
    errors::{AmqpError, BrokerError, BrokerErrorKind},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    session::Session,
};
use async_trait::async_trait;
use lapin::options::QueueDeclareOptions;
use std::sync::Arc;
use tracing::{debug, error};

/// Builder interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the RabbitMQ server.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    session: Arc<Session>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    /// Creates an empty topology installed through `session`.
    pub fn new(session: Arc<Session>) -> AmqpTopology {
        AmqpTopology {
            session,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }

    /// Adds a complete dead-letter topology: a durable direct exchange, a
    /// durable DLQ and the binding between them on `routing_key`.
    pub fn dead_letter(self, exchange: &str, dlq: &str, routing_key: &str) -> Self {
        self.exchange(ExchangeDefinition::new(exchange).direct().durable())
            .queue(QueueDefinition::new(dlq).durable())
            .queue_binding(
                QueueBinding::new(dlq)
                    .exchange(exchange)
                    .routing_key(routing_key),
            )
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs in dependency order:
    /// 1. exchanges
    /// 2. queues without a dead-letter target
    /// 3. queue bindings
    /// 4. queues that dead-letter into one of the above
    async fn install(&self) -> Result<(), AmqpError> {
        let guard = self.session.acquire().await?;
        let channel = guard.channel;

        for exch in &self.exchanges {
            install_exchange(channel, exch).await?;
        }

        for def in self.queues.iter().filter(|q| q.dead_letter.is_none()) {
            install_queue(channel, def).await?;
        }

        for binding in &self.queues_binding {
            install_binding(channel, binding).await?;
        }

        for def in self.queues.iter().filter(|q| q.dead_letter.is_some()) {
            install_queue(channel, def).await?;
        }

        debug!("topology installed");
        Ok(())
    }
}

/// Declares a single queue with the broker arguments derived from `def`.
///
/// When `def` dead-letters, the referenced exchange has to exist already.
///
/// # Parameters
/// * `session` - The session to declare on
/// * `def` - The queue definition
///
/// # Returns
/// The queue counters, or `AmqpError::TopologyConflict` when the queue exists
/// with different arguments
pub async fn declare_queue(
    session: &Session,
    def: &QueueDefinition,
) -> Result<QueueState, AmqpError> {
    let guard = session.acquire().await?;
    install_queue(guard.channel, def).await
}

/// Declares the direct exchange `exchange`, the queue `dlq` and binds them on
/// `routing_key`. Must run before the queue that dead-letters into `exchange`.
pub async fn declare_dead_letter_topology(
    session: &Arc<Session>,
    exchange: &str,
    dlq: &str,
    routing_key: &str,
) -> Result<(), AmqpError> {
    AmqpTopology::new(session.clone())
        .dead_letter(exchange, dlq, routing_key)
        .install()
        .await
}

async fn install_exchange(
    channel: &dyn AmqpChannel,
    exch: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", exch.name);

    match channel.exchange_declare(exch).await {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = exch.name.as_str(),
                "error to declare the exchange"
            );
            Err(declare_error(&exch.name, err, |name, cause| {
                AmqpError::DeclareExchangeError {
                    exchange: name,
                    cause,
                }
            }))
        }
        _ => {
            debug!("exchange: {} was created", exch.name);
            Ok(())
        }
    }
}

async fn install_queue(
    channel: &dyn AmqpChannel,
    def: &QueueDefinition,
) -> Result<QueueState, AmqpError> {
    debug!("creating queue: {}", def.name);

    match channel
        .queue_declare(
            &def.name,
            QueueDeclareOptions {
                passive: false,
                durable: def.durable,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            def.arguments(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = def.name.as_str(),
                "error to declare the queue"
            );
            Err(declare_error(&def.name, err, |name, cause| {
                AmqpError::DeclareQueueError { queue: name, cause }
            }))
        }
        Ok(state) => {
            debug!(
                messages = state.message_count,
                consumers = state.consumer_count,
                quorum = def.quorum,
                "queue: {} was created",
                def.name
            );
            Ok(state)
        }
    }
}

async fn install_binding(
    channel: &dyn AmqpChannel,
    binding: &QueueBinding,
) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue_name, binding.exchange_name, binding.routing_key
    );

    match channel
        .queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(AmqpError::BindingExchangeToQueueError {
                exchange: binding.exchange_name.clone(),
                queue: binding.queue_name.clone(),
                cause: err.to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn declare_error(
    name: &str,
    err: BrokerError,
    otherwise: impl FnOnce(String, String) -> AmqpError,
) -> AmqpError {
    match err.kind {
        BrokerErrorKind::PreconditionFailed => AmqpError::TopologyConflict {
            name: name.to_owned(),
            cause: err.message,
        },
        _ => otherwise(name.to_owned(), err.message),
    }
}
