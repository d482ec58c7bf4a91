// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain model for the relay: envelopes, topics, checkpoints, registrations,
//! policy contracts and node configuration.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and repository/evaluator traits; no I/O

pub mod agent;
pub mod checkpoint;
pub mod envelope;
pub mod events;
pub mod execution;
pub mod node_config;
pub mod policy;
pub mod repository;
pub mod security_context;
pub mod topic;
