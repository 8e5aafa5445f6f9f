// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Session
//!
//! A `Session` owns one connection and its command channel. Publisher, consumer,
//! topology and stats all run through it. The channel must not be used
//! concurrently, so every operation first takes the session lock and holds it
//! until the broker answered; that includes the wait for a publisher
//! confirmation, which keeps a single confirmation in flight per channel.
//!
//! The session also tracks the delivery tags handed out by manual-ack fetches.
//! A tag leaves the set on its first ack or nack, so settling it twice is
//! rejected locally instead of making the broker close the channel.

use crate::{
    channel::{new_amqp_channel, AmqpChannel},
    errors::AmqpError,
};
use std::{collections::HashSet, sync::Arc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    closed: bool,
    confirms_enabled: bool,
    outstanding: HashSet<u64>,
}

impl SessionState {
    pub(crate) fn track(&mut self, delivery_tag: u64) {
        self.outstanding.insert(delivery_tag);
    }

    /// Removes the tag, returning false when it was not outstanding.
    pub(crate) fn settle(&mut self, delivery_tag: u64) -> bool {
        self.outstanding.remove(&delivery_tag)
    }

    pub(crate) fn confirms_enabled(&self) -> bool {
        self.confirms_enabled
    }

    pub(crate) fn set_confirms_enabled(&mut self) {
        self.confirms_enabled = true;
    }
}

/// Exclusive access to the session's channel for the duration of one operation.
pub(crate) struct SessionGuard<'s> {
    pub(crate) channel: &'s dyn AmqpChannel,
    pub(crate) state: MutexGuard<'s, SessionState>,
}

/// One logical connection + command channel to the broker.
pub struct Session {
    channel: Arc<dyn AmqpChannel>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Connects to the broker at `uri` and opens the command channel.
    ///
    /// No retry is attempted, reconnect policies belong to the caller.
    pub async fn open(uri: &str, connection_name: &str) -> Result<Arc<Session>, AmqpError> {
        let channel = new_amqp_channel(uri, connection_name).await?;
        info!(connection = connection_name, "amqp session opened");

        Ok(Session::from_channel(Arc::new(channel)))
    }

    /// Builds a session on an already established channel.
    pub fn from_channel(channel: Arc<dyn AmqpChannel>) -> Arc<Session> {
        Arc::new(Session {
            channel,
            state: Mutex::new(SessionState::default()),
        })
    }

    pub(crate) async fn acquire(&self) -> Result<SessionGuard<'_>, AmqpError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(AmqpError::SessionClosed);
        }

        Ok(SessionGuard {
            channel: self.channel.as_ref(),
            state,
        })
    }

    /// Reports whether the session can still serve operations.
    ///
    /// # Returns
    /// `false` once `close` was called, or when the broker closed the channel
    /// or the connection underneath the session
    pub async fn is_open(&self) -> bool {
        let state = self.state.lock().await;
        !state.closed && self.channel.is_connected()
    }

    /// Closes the channel, then the connection.
    ///
    /// Safe to call more than once. Failures are logged and never returned:
    /// there is nothing a caller can do about a session that fails to close.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            debug!("session already closed");
            return;
        }
        state.closed = true;

        if !state.outstanding.is_empty() {
            debug!(
                count = state.outstanding.len(),
                "closing session with unsettled deliveries, the broker will requeue them"
            );
            state.outstanding.clear();
        }

        if let Err(err) = self.channel.close_channel().await {
            error!(error = err.to_string(), "failure to close the channel");
        }

        if let Err(err) = self.channel.close_connection().await {
            error!(error = err.to_string(), "failure to close the connection");
        }

        info!("amqp session closed");
    }
}
