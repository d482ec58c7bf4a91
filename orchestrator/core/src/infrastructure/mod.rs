// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod a2a;
pub mod context_client;
pub mod db;
pub mod event_bus;
pub mod policy_client;
pub mod repositories;
pub mod transport;

pub use context_client::ContextClient;
pub use policy_client::{HttpPolicyEvaluator, StaticPolicyEvaluator};
