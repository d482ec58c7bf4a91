// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the relay CLI

pub mod config;
pub mod registry;
pub mod topic;
pub mod trace;

pub use self::config::ConfigCommand;
pub use self::registry::RegistryCommand;
pub use self::topic::TopicCommand;
pub use self::trace::TraceCommand;
