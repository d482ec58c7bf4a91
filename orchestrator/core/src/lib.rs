// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! AEGIS Relay core
//!
//! Deterministic-replay execution runtime coupled to an agent-to-agent
//! messaging substrate.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Domain:** envelopes, topics, checkpoints, registrations, configuration
//! - **Application:** activity boundary, runtime executor, agent registry,
//!   policy gates, idempotency guard, retention
//! - **Infrastructure:** A2A validation and security, transport, event bus,
//!   PostgreSQL / in-memory repositories, HTTP collaborators

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
