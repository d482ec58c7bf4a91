// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `aegis-relay-swarm`: Agent-to-Agent Coordination
//!
//! Lets independent agents delegate work to one another over the relay
//! transport.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `EnvelopeDraft`, `HandledEnvelope`, `InvocationContext` |
//! | [`application`] | Application | `EnvelopeFactory`, `EnvelopeSender`, `SpecialistInvoker`, `InboundDispatcher`, `DecisionNoticePublisher` |
//!
//! ## Key Concepts
//!
//! - **Outbound**: every envelope is built by the [`EnvelopeFactory`](application::EnvelopeFactory)
//!   (sealed, credentialed, signed) and leaves through the
//!   [`EnvelopeSender`](application::EnvelopeSender) (pre-send policy, bounded
//!   publish retry, dead-letter on exhaustion).
//! - **InvokeSpecialist**: discovery, request and a correlated reply within a
//!   time budget. Delivery failures come back as a `SpecialistResult`.
//! - **Inbound**: the [`InboundDispatcher`](application::InboundDispatcher)
//!   validates, authenticates, runs post-receive policy and deduplicates
//!   before routing by `meta.type`, then replies to `reply_to`.
//! - **Call graph**: delegations carry the caller's `trace_id` and
//!   `depth + 1`; the runtime executor refuses traces deeper than
//!   `runtime.max_depth`.

pub mod application;
pub mod domain;

pub use domain::*;
