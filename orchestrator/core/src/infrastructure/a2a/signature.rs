// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HMAC-SHA256 envelope signatures.
//!
//! The signed bytes are the canonical JSON of `{meta, payload}` with
//! `meta.signature` removed. Canonical means `serde_json` with sorted object
//! keys, so sender and receiver produce identical bytes for equal envelopes.

use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::domain::envelope::Envelope;
use crate::infrastructure::a2a::SecurityError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct EnvelopeSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for EnvelopeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeSigner").finish_non_exhaustive()
    }
}

impl EnvelopeSigner {
    pub fn new(key: &[u8]) -> Result<Self, SecurityError> {
        if key.is_empty() {
            return Err(SecurityError::Configuration("signing key must not be empty".into()));
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| SecurityError::Configuration(format!("invalid signing key: {e}")))?;
        Ok(Self { mac })
    }

    pub fn canonical_bytes(envelope: &Envelope) -> Vec<u8> {
        let mut meta = envelope.meta.clone();
        meta.signature = None;
        let document = json!({ "meta": meta, "payload": envelope.payload });
        serde_json::to_vec(&document).unwrap_or_default()
    }

    fn tag(&self, envelope: &Envelope) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(&Self::canonical_bytes(envelope));
        mac.finalize().into_bytes().to_vec()
    }

    pub fn signature_for(&self, envelope: &Envelope) -> String {
        hex::encode(self.tag(envelope))
    }

    /// Sign in place. Must be the last mutation of the envelope.
    pub fn sign(&self, envelope: &mut Envelope) {
        envelope.meta.signature = Some(self.signature_for(envelope));
    }

    pub fn verify(&self, envelope: &Envelope) -> Result<(), SecurityError> {
        let mismatch = |reason: &str| SecurityError::SignatureMismatch {
            message_id: envelope.meta.message_id.clone(),
            reason: reason.to_string(),
        };
        let provided = envelope
            .meta
            .signature
            .as_deref()
            .ok_or_else(|| mismatch("signature missing"))?;
        let provided = hex::decode(provided).map_err(|_| mismatch("signature is not hex"))?;
        let expected = self.tag(envelope);
        if expected.ct_eq(&provided).into() {
            Ok(())
        } else {
            Err(mismatch("signature does not match envelope content"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::test_support::{sample_envelope, task_request};

    #[test]
    fn test_sign_then_verify() {
        let signer = EnvelopeSigner::new(b"shared-secret").unwrap();
        let mut envelope = sample_envelope(task_request());
        signer.sign(&mut envelope);
        assert_eq!(envelope.meta.signature.as_ref().map(String::len), Some(64));
        assert!(signer.verify(&envelope).is_ok());
    }

    #[test]
    fn test_tampering_is_detected() {
        let signer = EnvelopeSigner::new(b"shared-secret").unwrap();
        let mut envelope = sample_envelope(task_request());
        signer.sign(&mut envelope);
        envelope.meta.project = "elsewhere".into();
        let err = signer.verify(&envelope).unwrap_err();
        assert_eq!(err.code(), "E_SIGNATURE_MISMATCH");
    }

    #[test]
    fn test_wrong_key_and_missing_signature() {
        let signer = EnvelopeSigner::new(b"shared-secret").unwrap();
        let other = EnvelopeSigner::new(b"other-secret").unwrap();
        let mut envelope = sample_envelope(task_request());
        assert!(signer.verify(&envelope).is_err());
        other.sign(&mut envelope);
        assert!(signer.verify(&envelope).is_err());
        envelope.meta.signature = Some("zz".into());
        assert!(signer.verify(&envelope).is_err());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(EnvelopeSigner::new(b"").is_err());
    }
}
