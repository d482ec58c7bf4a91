// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! AEGIS Relay operator CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Command implementations, logging setup and store wiring
//!   for the `relay` binary

pub mod commands;
pub mod logging;
pub mod stores;
