// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Coordination Domain Layer
//!
//! Value types shared by the outbound and inbound halves of agent-to-agent
//! coordination. No I/O dependencies.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`draft`] | `EnvelopeDraft` |
//! | [`handled`] | `HandledEnvelope` |
//! | [`invocation`] | `InvocationContext` |

pub mod draft;
pub mod handled;
pub mod invocation;

pub use draft::EnvelopeDraft;
pub use handled::HandledEnvelope;
pub use invocation::InvocationContext;
