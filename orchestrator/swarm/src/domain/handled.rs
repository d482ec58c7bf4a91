// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! What the inbound dispatcher records in the dedup ledger after a handler
//! succeeds, so a redelivered envelope can be answered without running the
//! handler again.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use aegis_relay_core::domain::envelope::{Envelope, EnvelopeType, Payload};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandledEnvelope {
    pub message_id: String,
    pub envelope_type: EnvelopeType,
    /// Type of the handler's response payload, if it returned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<EnvelopeType>,
    #[serde(default)]
    pub response: Value,
    /// Reply envelope published to `reply_to`; republished verbatim on redelivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<Envelope>,
}

impl HandledEnvelope {
    pub fn new(envelope: &Envelope, response: Option<&Payload>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: envelope.meta.message_id.clone(),
            envelope_type: envelope.envelope_type(),
            response_type: response.map(Payload::envelope_type),
            response: match response {
                Some(payload) => payload.to_value()?,
                None => Value::Null,
            },
            reply: None,
        })
    }

    pub fn with_reply(mut self, reply: Envelope) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Decode the recorded response back into its typed payload.
    pub fn response_payload(&self) -> Option<Payload> {
        let response_type = self.response_type?;
        Payload::decode(response_type, self.response.clone()).ok()
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
