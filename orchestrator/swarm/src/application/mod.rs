// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Coordination services
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Outbound envelope construction and delivery, specialist
//!   invocation, inbound dispatch and decision notices

pub mod decisions;
pub mod dispatcher;
pub mod factory;
pub mod handlers;
pub mod invoker;
pub mod sender;

pub use decisions::DecisionNoticePublisher;
pub use dispatcher::{DispatchError, DispatchOutcome, InboundDispatcher, InboundHandler};
pub use factory::EnvelopeFactory;
pub use handlers::{
    child_trace_id, CancelDirectiveHandler, ContextRequestHandler, InvocationRunHandler, TaskRunHandler,
};
pub use invoker::{InvokeError, SpecialistInvoker};
pub use sender::{EnvelopeSender, SendError};
