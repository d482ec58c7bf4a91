// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Security Context Domain Module
//!
//! Authorization vocabulary shared by bearer and capability tokens.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`capability`] | `ScopePattern` grant matching, `GrantSet` |
//!
//! Token decoding and envelope signatures live in
//! [`crate::infrastructure::a2a`]; this module only decides whether a granted
//! pattern covers a required scope or capability.

pub mod capability;

pub use capability::{GrantSet, ScopePattern};
