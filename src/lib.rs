// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable message delivery over RabbitMQ: topology setup, confirmed
//! publishing, polling consumption with explicit settlement, dead-lettering and
//! passive queue statistics.

mod otel;

pub mod channel;
pub mod configs;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod service;
pub mod session;
pub mod stats;
pub mod topology;

#[cfg(test)]
mod testing;
