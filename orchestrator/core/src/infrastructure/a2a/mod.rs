// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent-to-Agent Envelope Protocol
//!
//! Everything an envelope passes through between "built" and "handled":
//!
//! - [`validator`]: structural and semantic checks per envelope type
//! - [`signature`]: HMAC-SHA256 over the canonical `{meta, payload}` bytes
//! - [`token`]: bearer and capability JWT issuance and verification
//! - [`replay_guard`]: freshness window and seen-key tracking
//! - [`middleware`]: the composed inbound security check
//!
//! Every rejection is a [`SecurityError`] with a stable `code()` so callers can
//! decide between retrying and escalating. Nothing in this module drops an
//! envelope silently.

pub mod middleware;
pub mod replay_guard;
pub mod signature;
pub mod token;
pub mod validator;

pub use middleware::EnvelopeSecurity;
pub use replay_guard::ReplayGuard;
pub use signature::EnvelopeSigner;
pub use token::{BearerClaims, CapabilityClaims, TokenIssuer, TokenKey, TokenVerifier};
pub use validator::{EnvelopeValidator, ValidationError, ValidationIssue, ValidationReport};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecurityError {
    #[error("token signature is invalid")]
    TokenInvalidSignature,

    #[error("token has expired")]
    TokenExpired,

    #[error("token is invalid: {0}")]
    TokenInvalid(String),

    #[error("{0} token is required but missing")]
    MissingToken(&'static str),

    #[error("scope '{required}' denied: {reason}")]
    ScopeDenied { required: String, reason: String },

    #[error("capability '{capability}' is not granted by the capability token")]
    CapabilityDenied { capability: String },

    #[error("signature mismatch on message {message_id}: {reason}")]
    SignatureMismatch { message_id: String, reason: String },

    #[error("replay detected for message {message_id}: {reason}")]
    ReplayDetected { message_id: String, reason: String },

    #[error("security configuration error: {0}")]
    Configuration(String),
}

impl SecurityError {
    pub fn code(&self) -> &'static str {
        match self {
            SecurityError::TokenInvalidSignature => "E_TOKEN_INVALID_SIGNATURE",
            SecurityError::TokenExpired => "E_TOKEN_EXPIRED",
            SecurityError::TokenInvalid(_) | SecurityError::MissingToken(_) => "E_TOKEN_INVALID",
            SecurityError::ScopeDenied { .. } => "E_SCOPE_DENIED",
            SecurityError::CapabilityDenied { .. } => "E_CAPABILITY_DENIED",
            SecurityError::SignatureMismatch { .. } => "E_SIGNATURE_MISMATCH",
            SecurityError::ReplayDetected { .. } => "E_REPLAY_DETECTED",
            SecurityError::Configuration(_) => "E_SECURITY_CONFIG",
        }
    }
}
