// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! It only models what the delivery core relies on: declare/redeclare rules,
//! the default and direct exchanges, `basic.get`, ack/nack with requeue or
//! dead-lettering, and publisher confirms that can be answered, refused or held
//! back forever. Like a real broker it closes the channel when a message is
//! fetched from a missing queue or an unknown delivery tag is settled.

use crate::{
    channel::{AmqpChannel, Confirmation, GetMessage, PendingConfirm, QueueState},
    errors::{BrokerError, BrokerErrorKind},
    exchange::ExchangeDefinition,
    queue::{table_str, AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY},
};
use async_trait::async_trait;
use lapin::{
    options::QueueDeclareOptions,
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Mutex,
};
use tokio::sync::oneshot;

/// How the broker answers publishes once confirm mode is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfirmBehavior {
    Ack,
    Nack,
    /// Never answer until `release_held` is called.
    Hold,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    data: Vec<u8>,
    properties: AMQPProperties,
    redelivered: bool,
}

#[derive(Debug)]
struct MemQueue {
    durable: bool,
    args: FieldTable,
    messages: VecDeque<StoredMessage>,
}

struct BrokerState {
    channel_open: bool,
    connection_open: bool,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, MemQueue>,
    bindings: Vec<(String, String, String)>,
    unacked: HashMap<u64, (String, StoredMessage)>,
    next_tag: u64,
    confirm_mode: bool,
    confirm_behavior: ConfirmBehavior,
    held: Vec<oneshot::Sender<Confirmation>>,
    calls: Vec<String>,
}

pub(crate) struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub(crate) fn new() -> Self {
        MemoryBroker {
            state: Mutex::new(BrokerState {
                channel_open: true,
                connection_open: true,
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                bindings: vec![],
                unacked: HashMap::new(),
                next_tag: 0,
                confirm_mode: false,
                confirm_behavior: ConfirmBehavior::Ack,
                held: vec![],
                calls: vec![],
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().expect("broker state poisoned")
    }

    pub(crate) fn set_confirm_behavior(&self, behavior: ConfirmBehavior) {
        self.lock().confirm_behavior = behavior;
    }

    /// Answers every held confirmation with `confirmation`.
    pub(crate) fn release_held(&self, confirmation: Confirmation) -> usize {
        let held: Vec<_> = self.lock().held.drain(..).collect();
        let count = held.len();
        for sender in held {
            let _ = sender.send(confirmation);
        }
        count
    }

    pub(crate) fn ready_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub(crate) fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub(crate) fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub(crate) fn is_confirm_mode(&self) -> bool {
        self.lock().confirm_mode
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Closes the channel from the broker side.
    pub(crate) fn kill_channel(&self) {
        let mut state = self.lock();
        state.channel_open = false;
        state.requeue_unacked();
    }
}

impl BrokerState {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.channel_open && self.connection_open {
            Ok(())
        } else {
            Err(BrokerError::closed())
        }
    }

    /// Delivers to the queues matched by `exchange`/`key`, returns whether any matched.
    fn route(&mut self, exchange: &str, key: &str, message: StoredMessage) -> bool {
        let targets: Vec<String> = if exchange.is_empty() {
            if self.queues.contains_key(key) {
                vec![key.to_owned()]
            } else {
                vec![]
            }
        } else {
            self.bindings
                .iter()
                .filter(|(_, ex, k)| ex == exchange && k == key)
                .map(|(q, _, _)| q.clone())
                .collect()
        };

        for target in &targets {
            if let Some(queue) = self.queues.get_mut(target) {
                queue.messages.push_back(message.clone());
            }
        }

        !targets.is_empty()
    }

    fn dead_letter(&mut self, source: &str, mut message: StoredMessage) {
        let Some(queue) = self.queues.get(source) else {
            return;
        };
        let Some(exchange) = table_str(&queue.args, AMQP_HEADERS_DEAD_LETTER_EXCHANGE) else {
            return;
        };
        let exchange = exchange.to_owned();
        let key = table_str(&queue.args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
            .unwrap_or_default()
            .to_owned();

        let mut headers = message
            .properties
            .headers()
            .as_ref()
            .map(|table| table.inner().clone())
            .unwrap_or_default();
        let previous = headers
            .get("x-death")
            .and_then(|value| value.as_array())
            .and_then(|arr| arr.as_slice().first().cloned())
            .and_then(|value| value.as_field_table().cloned())
            .and_then(|table| table.inner().get("count").cloned())
            .and_then(|count| count.as_long_long_int())
            .unwrap_or_default();

        let mut death = BTreeMap::new();
        death.insert(
            ShortString::from("count"),
            AMQPValue::LongLongInt(previous + 1),
        );
        death.insert(
            ShortString::from("queue"),
            AMQPValue::LongString(LongString::from(source.to_owned())),
        );
        death.insert(
            ShortString::from("reason"),
            AMQPValue::LongString(LongString::from("rejected")),
        );
        headers.insert(
            ShortString::from("x-death"),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(
                FieldTable::from(death),
            )])),
        );

        message.properties = message.properties.with_headers(FieldTable::from(headers));
        message.redelivered = false;
        self.route(&exchange, &key, message);
    }

    fn requeue_unacked(&mut self) {
        let mut pending: Vec<_> = self.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, (queue, mut message)) in pending {
            if let Some(q) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                q.messages.push_front(message);
            }
        }
    }
}

#[async_trait]
impl AmqpChannel for MemoryBroker {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.calls.push(format!("exchange_declare:{}", def.name));

        let conflict = state
            .exchanges
            .get(&def.name)
            .map(|existing| existing.kind != def.kind || existing.durable != def.durable);

        match conflict {
            Some(true) => Err(BrokerError::new(
                BrokerErrorKind::PreconditionFailed,
                "inequivalent arg 'type'",
            )),
            Some(false) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueState, BrokerError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.calls.push(format!("queue_declare:{name}"));

        if let Some(existing) = state.queues.get(name) {
            if existing.durable != options.durable || existing.args.inner() != args.inner() {
                return Err(BrokerError::new(
                    BrokerErrorKind::PreconditionFailed,
                    format!("PRECONDITION_FAILED - inequivalent arg for queue '{name}'"),
                ));
            }
            return Ok(QueueState {
                message_count: existing.messages.len() as u32,
                consumer_count: 0,
            });
        }

        if options.passive {
            return Err(BrokerError::new(
                BrokerErrorKind::NotFound,
                format!("NOT_FOUND - no queue '{name}'"),
            ));
        }

        if let Some(exchange) = table_str(&args, AMQP_HEADERS_DEAD_LETTER_EXCHANGE) {
            if !state.exchanges.contains_key(exchange) {
                return Err(BrokerError::new(
                    BrokerErrorKind::NotFound,
                    format!("NOT_FOUND - no exchange '{exchange}'"),
                ));
            }
        }

        state.queues.insert(
            name.to_owned(),
            MemQueue {
                durable: options.durable,
                args,
                messages: VecDeque::new(),
            },
        );

        Ok(QueueState::default())
    }

    async fn queue_inspect(&self, name: &str) -> Result<QueueState, BrokerError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.calls.push(format!("queue_inspect:{name}"));

        state
            .queues
            .get(name)
            .map(|q| QueueState {
                message_count: q.messages.len() as u32,
                consumer_count: 0,
            })
            .ok_or_else(|| {
                BrokerError::new(
                    BrokerErrorKind::NotFound,
                    format!("NOT_FOUND - no queue '{name}'"),
                )
            })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.calls.push(format!("queue_bind:{queue}:{exchange}:{key}"));

        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::new(BrokerErrorKind::NotFound, "NOT_FOUND"));
        }

        let binding = (queue.to_owned(), exchange.to_owned(), key.to_owned());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.calls.push("confirm_select".to_owned());
        state.confirm_mode = true;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: &[u8],
        properties: AMQPProperties,
    ) -> Result<PendingConfirm, BrokerError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.calls.push(format!("basic_publish:{routing_key}"));

        let behavior = state.confirm_behavior;
        let confirm_mode = state.confirm_mode;
        let refused = confirm_mode && behavior == ConfirmBehavior::Nack;

        let routed = !refused
            && state.route(
                exchange,
                routing_key,
                StoredMessage {
                    data: payload.to_vec(),
                    properties,
                    redelivered: false,
                },
            );

        let outcome = if !confirm_mode {
            Confirmation::NotRequested
        } else if refused {
            Confirmation::Nack
        } else if mandatory && !routed {
            Confirmation::Returned
        } else if behavior == ConfirmBehavior::Hold {
            let (tx, rx) = oneshot::channel();
            state.held.push(tx);
            return Ok(Box::pin(async move {
                rx.await.map_err(|_| BrokerError::closed())
            }));
        } else {
            Confirmation::Ack
        };

        Ok(Box::pin(async move { Ok::<_, BrokerError>(outcome) }))
    }

    async fn basic_get(&self, queue: &str, no_ack: bool) -> Result<Option<GetMessage>, BrokerError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.calls.push(format!("basic_get:{queue}"));

        let Some(q) = state.queues.get_mut(queue) else {
            state.channel_open = false;
            return Err(BrokerError::new(
                BrokerErrorKind::NotFound,
                format!("NOT_FOUND - no queue '{queue}'"),
            ));
        };
        let Some(message) = q.messages.pop_front() else {
            return Ok(None);
        };
        let remaining = q.messages.len() as u32;

        state.next_tag += 1;
        let tag = state.next_tag;
        if !no_ack {
            state
                .unacked
                .insert(tag, (queue.to_owned(), message.clone()));
        }

        Ok(Some(GetMessage {
            delivery_tag: tag,
            redelivered: message.redelivered,
            message_count: remaining,
            data: message.data,
            properties: message.properties,
        }))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state.calls.push(format!("basic_ack:{delivery_tag}"));

        if state.unacked.remove(&delivery_tag).is_none() {
            state.channel_open = false;
            return Err(BrokerError::new(
                BrokerErrorKind::PreconditionFailed,
                format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"),
            ));
        }
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.ensure_open()?;
        state
            .calls
            .push(format!("basic_nack:{delivery_tag}:{requeue}"));

        let Some((queue, mut message)) = state.unacked.remove(&delivery_tag) else {
            state.channel_open = false;
            return Err(BrokerError::new(
                BrokerErrorKind::PreconditionFailed,
                format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"),
            ));
        };

        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.messages.push_front(message);
            }
        } else {
            state.dead_letter(&queue, message);
        }
        Ok(())
    }

    async fn close_channel(&self) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.calls.push("close_channel".to_owned());
        state.channel_open = false;
        state.requeue_unacked();
        Ok(())
    }

    async fn close_connection(&self) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.calls.push("close_connection".to_owned());
        state.channel_open = false;
        state.connection_open = false;
        state.requeue_unacked();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().ensure_open().is_ok()
    }
}
