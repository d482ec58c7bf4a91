// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Envelope Security Middleware
//!
//! Composes signature verification, the freshness window, bearer token
//! verification, capability token verification and replay tracking into the
//! single check every inbound envelope passes.
//!
//! ## Processing Pipeline
//!
//! ```text
//! inbound Envelope
//!   └─ EnvelopeSecurity::verify_credentials(&envelope, now)
//!         ├─ EnvelopeSigner::verify            → E_SIGNATURE_MISMATCH
//!         ├─ ReplayGuard::check_freshness      → E_REPLAY_DETECTED
//!         ├─ TokenVerifier::verify_bearer      → E_TOKEN_* / E_SCOPE_DENIED
//!         │     └─ sub == meta.from.id, scope "envelope:<type>"
//!         └─ TokenVerifier::verify_capability  → E_CAPABILITY_DENIED
//!   └─ EnvelopeSecurity::check_replay(&envelope, now)
//!         └─ ReplayGuard::check_and_record     → E_REPLAY_DETECTED
//! ```
//!
//! The two halves are separate so the inbound dispatcher can consult the
//! idempotency store between them: a duplicate with a recorded outcome is
//! answered from the store, and only a key that is claimed for processing is
//! entered into the replay window.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::domain::envelope::{Envelope, Payload};
use crate::domain::node_config::{resolve_secret, SecurityConfig, TokenAlgorithm};
use crate::infrastructure::a2a::token::require_scope;
use crate::infrastructure::a2a::{EnvelopeSigner, ReplayGuard, SecurityError, TokenKey, TokenVerifier};

pub struct EnvelopeSecurity {
    verifier: Option<Arc<TokenVerifier>>,
    signer: Option<EnvelopeSigner>,
    replay: ReplayGuard,
    require_auth_token: bool,
    require_signatures: bool,
}

impl EnvelopeSecurity {
    /// Permissive instance: freshness and replay checks only.
    pub fn new(freshness_window: std::time::Duration) -> Self {
        Self {
            verifier: None,
            signer: None,
            replay: ReplayGuard::new(freshness_window),
            require_auth_token: false,
            require_signatures: false,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_signer(mut self, signer: EnvelopeSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn require_auth_token(mut self, required: bool) -> Self {
        self.require_auth_token = required;
        self
    }

    pub fn require_signatures(mut self, required: bool) -> Self {
        self.require_signatures = required;
        self
    }

    /// Build from the `security` section of the node configuration.
    pub fn from_config(config: &SecurityConfig) -> anyhow::Result<Self> {
        let mut security = Self::new(config.freshness_window)
            .require_auth_token(config.require_auth_token)
            .require_signatures(config.require_signatures);

        if let Some(signing_key) = &config.signing_key {
            let key = resolve_secret(signing_key)?;
            security = security.with_signer(EnvelopeSigner::new(key.as_bytes())?);
        }

        let token_key = match config.token_algorithm {
            TokenAlgorithm::Hs256 => match &config.token_secret {
                Some(secret) => Some(TokenKey::Hmac(resolve_secret(secret)?.into_bytes())),
                None => None,
            },
            TokenAlgorithm::Rs256 => match &config.token_public_key_path {
                Some(path) => Some(TokenKey::RsaPublicPem(read_pem(path)?)),
                None => None,
            },
        };
        if let Some(key) = token_key {
            security = security.with_verifier(Arc::new(TokenVerifier::new(key, &config.issuer)?));
        }

        if security.require_auth_token && security.verifier.is_none() {
            anyhow::bail!("security.require_auth_token is set but no token key is configured");
        }
        if security.require_signatures && security.signer.is_none() {
            anyhow::bail!("security.require_signatures is set but no signing key is configured");
        }
        Ok(security)
    }

    pub fn signer(&self) -> Option<&EnvelopeSigner> {
        self.signer.as_ref()
    }

    pub fn replay_guard(&self) -> &ReplayGuard {
        &self.replay
    }

    fn verify_signature(&self, envelope: &Envelope) -> Result<(), SecurityError> {
        match (&self.signer, envelope.meta.signature.is_some()) {
            (Some(signer), true) => signer.verify(envelope),
            (Some(signer), false) if self.require_signatures => signer.verify(envelope),
            (None, true) if self.require_signatures => Err(SecurityError::Configuration(
                "signatures are required but no signing key is configured".into(),
            )),
            _ => Ok(()),
        }
    }

    fn verifier(&self) -> Result<&TokenVerifier, SecurityError> {
        self.verifier
            .as_deref()
            .ok_or_else(|| SecurityError::Configuration("token presented but no verifier is configured".into()))
    }

    fn verify_bearer(&self, envelope: &Envelope) -> Result<(), SecurityError> {
        let meta = &envelope.meta;
        let Some(token) = meta.auth_token.as_deref() else {
            return if self.require_auth_token {
                Err(SecurityError::MissingToken("bearer"))
            } else {
                Ok(())
            };
        };
        let claims = self.verifier()?.verify_bearer(token, &meta.tenant, &meta.project)?;
        if claims.sub != meta.from.id {
            return Err(SecurityError::ScopeDenied {
                required: format!("sub:{}", meta.from.id),
                reason: format!("token subject '{}' does not match sender", claims.sub),
            });
        }
        require_scope(&claims, &format!("envelope:{}", meta.envelope_type))
    }

    fn verify_capability(&self, envelope: &Envelope) -> Result<(), SecurityError> {
        let Payload::SpecialistInvocationRequest(request) = &envelope.payload else {
            return Ok(());
        };
        let meta = &envelope.meta;
        match meta.capability_token.as_deref() {
            Some(token) => {
                self.verifier()?
                    .verify_capability(token, &meta.tenant, &meta.project, &request.capability)?;
                Ok(())
            }
            None if self.require_auth_token => Err(SecurityError::MissingToken("capability")),
            None => Ok(()),
        }
    }

    /// Signature, freshness and tokens. Does not touch the replay window.
    pub fn verify_credentials(&self, envelope: &Envelope, now: DateTime<Utc>) -> Result<(), SecurityError> {
        let result = self
            .verify_signature(envelope)
            .and_then(|_| self.replay.check_freshness(&envelope.meta.message_id, envelope.meta.ts, now))
            .and_then(|_| self.verify_bearer(envelope))
            .and_then(|_| self.verify_capability(envelope));
        if let Err(e) = &result {
            reject(envelope, e);
        }
        result
    }

    /// Enter the envelope's idempotency key into the replay window.
    pub fn check_replay(&self, envelope: &Envelope, now: DateTime<Utc>) -> Result<(), SecurityError> {
        let result = self.replay.check_and_record(
            &envelope.idempotency_key(),
            &envelope.meta.message_id,
            envelope.meta.ts,
            now,
        );
        if let Err(e) = &result {
            reject(envelope, e);
        }
        result
    }

    pub fn verify(&self, envelope: &Envelope, now: DateTime<Utc>) -> Result<(), SecurityError> {
        self.verify_credentials(envelope, now)?;
        self.check_replay(envelope, now)?;
        debug!(message_id = %envelope.meta.message_id, "Envelope passed security checks");
        Ok(())
    }
}

fn reject(envelope: &Envelope, error: &SecurityError) {
    warn!(
        message_id = %envelope.meta.message_id,
        trace_id = %envelope.meta.trace_id,
        from = %envelope.meta.from,
        code = error.code(),
        "Envelope rejected: {}",
        error
    );
    metrics::counter!("relay_security_rejections_total", "code" => error.code()).increment(1);
}

fn read_pem(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read token public key {}: {}", path.display(), e))
}
