// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod activity;
pub mod executor;
pub mod idempotency;
pub mod policy;
pub mod registry;
pub mod retention;

// Re-export services for convenience
pub use activity::{ActivityContext, ActivityError};
pub use executor::{
    ExecutorConfig, RedactionPolicy, RuntimeExecutor, StepContext, StepGraph, StepHandler, StepOutcome,
};
pub use idempotency::{CachedOutcome, IdempotencyClaim, IdempotencyError, IdempotencyGuard, IdempotencyOutcome};
pub use policy::{PolicyGate, PolicyViolationError};
pub use registry::{AgentRegistry, HeartbeatTask, LeaseExpiryChecker, RegistryError};
pub use retention::{RetentionConfig, RetentionJob, RetentionReport};
