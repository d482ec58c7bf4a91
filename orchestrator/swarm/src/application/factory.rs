// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Envelope Factory
//!
//! Turns an [`EnvelopeDraft`] into a wire-ready envelope for the local agent:
//!
//! 1. fill `meta` from the node identity and a millisecond timestamp
//! 2. seal (`message_id` = hash of the immutable fields)
//! 3. derive the idempotency key unless the draft pinned one
//! 4. attach a bearer token, plus a capability token scoped to the requested
//!    capability for `SpecialistInvocationRequest`
//! 5. sign; nothing touches the envelope after this

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use aegis_relay_core::domain::envelope::{
    derive_idempotency_key, now_millis, AgentIdentity, Envelope, EnvelopeMeta, Payload, PROTOCOL_VERSION,
};
use aegis_relay_core::domain::node_config::{resolve_secret, NodeConfigSpec, TokenAlgorithm};
use aegis_relay_core::infrastructure::a2a::{EnvelopeSigner, SecurityError, TokenIssuer};

use crate::domain::EnvelopeDraft;

const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

struct Credentials {
    issuer: Arc<TokenIssuer>,
    scopes: Vec<String>,
    ttl: Duration,
}

pub struct EnvelopeFactory {
    identity: AgentIdentity,
    tenant: String,
    project: String,
    credentials: Option<Credentials>,
    signer: Option<EnvelopeSigner>,
}

impl EnvelopeFactory {
    pub fn new(identity: AgentIdentity, tenant: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            identity,
            tenant: tenant.into(),
            project: project.into(),
            credentials: None,
            signer: None,
        }
    }

    /// Attach bearer tokens granting `envelope:*` to every envelope built.
    pub fn with_token_issuer(self, issuer: Arc<TokenIssuer>, ttl: Duration) -> Self {
        self.with_scoped_tokens(issuer, ["envelope:*"], ttl)
    }

    pub fn with_scoped_tokens<I, S>(mut self, issuer: Arc<TokenIssuer>, scopes: I, ttl: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.credentials = Some(Credentials {
            issuer,
            scopes: scopes.into_iter().map(Into::into).collect(),
            ttl,
        });
        self
    }

    pub fn with_signer(mut self, signer: EnvelopeSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Factory for the node described by `spec`. Tokens are minted only for
    /// HS256, where the verification secret is also the signing secret.
    pub fn from_config(spec: &NodeConfigSpec) -> anyhow::Result<Self> {
        let node = &spec.node;
        let security = &spec.security;
        let mut factory = Self::new(
            AgentIdentity::new(&node.agent_type, &node.agent_id, &node.agent_version),
            &node.tenant,
            &node.project,
        );
        if let Some(key) = &security.signing_key {
            let key = resolve_secret(key).context("resolving security.signing_key")?;
            factory = factory.with_signer(EnvelopeSigner::new(key.as_bytes())?);
        }
        if let (TokenAlgorithm::Hs256, Some(secret)) = (security.token_algorithm, &security.token_secret) {
            let secret = resolve_secret(secret).context("resolving security.token_secret")?;
            let issuer = TokenIssuer::hs256(secret.as_bytes(), &security.issuer)?;
            factory = factory.with_token_issuer(Arc::new(issuer), DEFAULT_TOKEN_TTL);
        }
        Ok(factory)
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn build(&self, draft: EnvelopeDraft) -> Result<Envelope, SecurityError> {
        let mut envelope = Envelope {
            meta: EnvelopeMeta {
                version: PROTOCOL_VERSION.to_string(),
                message_id: String::new(),
                trace_id: draft.trace_id,
                ts: now_millis(),
                from: self.identity.clone(),
                to: draft.to,
                tenant: self.tenant.clone(),
                project: self.project.clone(),
                envelope_type: draft.payload.envelope_type(),
                depth: draft.depth,
                priority: draft.priority,
                correlation_id: draft.correlation_id,
                reply_to: draft.reply_to,
                idempotency_key: None,
                auth_token: None,
                capability_token: None,
                signature: None,
            },
            payload: draft.payload,
        }
        .seal();

        envelope.meta.idempotency_key = Some(match draft.idempotency_key {
            Some(key) => key,
            None => derive_idempotency_key(&envelope.meta),
        });

        if let Some(credentials) = &self.credentials {
            self.attach_tokens(&mut envelope, credentials)?;
        }
        if let Some(signer) = &self.signer {
            signer.sign(&mut envelope);
        }
        Ok(envelope)
    }

    /// Build the response to `request`.
    pub fn reply(&self, request: &Envelope, payload: Payload) -> Result<Envelope, SecurityError> {
        self.build(EnvelopeDraft::reply_to_envelope(request, payload))
    }

    fn attach_tokens(&self, envelope: &mut Envelope, credentials: &Credentials) -> Result<(), SecurityError> {
        envelope.meta.auth_token = Some(credentials.issuer.issue_bearer(
            &self.identity.id,
            &self.tenant,
            &self.project,
            credentials.scopes.iter().cloned(),
            credentials.ttl,
        )?);

        if let Payload::SpecialistInvocationRequest(request) = &envelope.payload {
            envelope.meta.capability_token = Some(credentials.issuer.issue_capability(
                &self.identity.id,
                &self.tenant,
                &self.project,
                [request.capability.clone()],
                Some(envelope.meta.trace_id.to_string()),
                credentials.ttl,
            )?);
        }
        Ok(())
    }
}
