// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! DecisionNotice publisher: the four canonical outcomes of a review.

use std::sync::Arc;

use serde_json::Value;

use aegis_relay_core::domain::envelope::{AgentIdentity, Decision, DecisionNotice, Envelope, Payload};
use aegis_relay_core::domain::execution::TraceId;
use aegis_relay_core::infrastructure::transport::PublishReceipt;

use crate::application::factory::EnvelopeFactory;
use crate::application::sender::{EnvelopeSender, SendError};
use crate::domain::EnvelopeDraft;

pub struct DecisionNoticePublisher {
    factory: Arc<EnvelopeFactory>,
    sender: EnvelopeSender,
    topic: String,
}

impl DecisionNoticePublisher {
    pub fn new(factory: Arc<EnvelopeFactory>, sender: EnvelopeSender, topic: impl Into<String>) -> Self {
        Self {
            factory,
            sender,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Approve, carrying the approved proposal.
    pub async fn approve(
        &self,
        trace_id: TraceId,
        to: AgentIdentity,
        rationale: impl Into<String>,
        proposal: Value,
    ) -> Result<Envelope, SendError> {
        self.publish(trace_id, to, Decision::Approve, rationale.into(), Some(proposal))
            .await
    }

    pub async fn reject(&self, trace_id: TraceId, to: AgentIdentity, rationale: impl Into<String>) -> Result<Envelope, SendError> {
        self.publish(trace_id, to, Decision::Reject, rationale.into(), None).await
    }

    pub async fn defer(&self, trace_id: TraceId, to: AgentIdentity, rationale: impl Into<String>) -> Result<Envelope, SendError> {
        self.publish(trace_id, to, Decision::Defer, rationale.into(), None).await
    }

    pub async fn escalate(&self, trace_id: TraceId, to: AgentIdentity, rationale: impl Into<String>) -> Result<Envelope, SendError> {
        self.publish(trace_id, to, Decision::Escalate, rationale.into(), None).await
    }

    async fn publish(
        &self,
        trace_id: TraceId,
        to: AgentIdentity,
        decision: Decision,
        rationale: String,
        proposal: Option<Value>,
    ) -> Result<Envelope, SendError> {
        let envelope = self.factory.build(EnvelopeDraft::new(
            to,
            Payload::DecisionNotice(DecisionNotice {
                decision,
                rationale,
                proposal,
            }),
            trace_id,
        ))?;
        let PublishReceipt { offset, .. } = self.sender.send(&self.topic, &envelope).await?;
        tracing::info!(
            trace_id = %trace_id,
            message_id = %envelope.meta.message_id,
            decision = ?decision,
            offset,
            "Decision notice published"
        );
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_relay_core::application::policy::PolicyGate;
    use aegis_relay_core::domain::node_config::TransportConfig;
    use aegis_relay_core::infrastructure::transport::{InMemoryLogTransport, Transport};
    use serde_json::json;

    const TOPIC: &str = "qa.acme.checkout.cmo.decisions.create";

    fn publisher(transport: &InMemoryLogTransport) -> DecisionNoticePublisher {
        let factory = Arc::new(EnvelopeFactory::new(
            AgentIdentity::new("orchestrator", "cmo-1", "1.0.0"),
            "acme",
            "checkout",
        ));
        let sender = EnvelopeSender::new(Arc::new(transport.clone()), PolicyGate::permissive());
        DecisionNoticePublisher::new(factory, sender, TOPIC)
    }

    #[tokio::test]
    async fn test_each_outcome_publishes_a_notice() {
        let transport = InMemoryLogTransport::new(TransportConfig::default());
        let publisher = publisher(&transport);
        let to = AgentIdentity::new("specialist", "healer-7", "0.4.1");
        let trace_id = TraceId::new();

        publisher
            .approve(trace_id, to.clone(), "selector fix verified", json!({"selector": "#buy-now"}))
            .await
            .unwrap();
        publisher.reject(trace_id, to.clone(), "breaks checkout").await.unwrap();
        publisher.defer(trace_id, to.clone(), "needs more data").await.unwrap();
        publisher.escalate(trace_id, to, "human review").await.unwrap();

        let mut consumer = transport.subscribe(TOPIC, "auditors").await.unwrap();
        let mut decisions = Vec::new();
        for _ in 0..4 {
            let delivery = consumer.next().await.unwrap();
            let Payload::DecisionNotice(notice) = &delivery.envelope.payload else {
                panic!("expected a decision notice");
            };
            decisions.push((notice.decision, notice.proposal.is_some()));
            consumer.ack(&delivery).await.unwrap();
        }
        assert_eq!(
            decisions,
            vec![
                (Decision::Approve, true),
                (Decision::Reject, false),
                (Decision::Defer, false),
                (Decision::Escalate, false),
            ]
        );
    }
}
