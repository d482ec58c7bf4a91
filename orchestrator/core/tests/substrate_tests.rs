//! Integration tests for the messaging substrate
//!
//! Lease expiry through the background checker, and publisher backpressure
//! against a consumer group that stops acknowledging.

use std::sync::Arc;
use std::time::Duration;

use aegis_relay_core::application::registry::{AgentRegistry, LeaseExpiryChecker};
use aegis_relay_core::domain::agent::{AgentRegistration, AgentStatus, DiscoveryQuery};
use aegis_relay_core::domain::envelope::{
    now_millis, AgentIdentity, Envelope, EnvelopeMeta, Payload, TaskRequest, PROTOCOL_VERSION,
};
use aegis_relay_core::domain::execution::TraceId;
use aegis_relay_core::domain::node_config::{RegistryConfig, TransportConfig};
use aegis_relay_core::domain::topic::{build_topic, parse_topic, TopicComponents};
use aegis_relay_core::infrastructure::event_bus::EventBus;
use aegis_relay_core::infrastructure::repositories::InMemoryAgentRegistryRepository;
use aegis_relay_core::infrastructure::transport::{InMemoryLogTransport, Transport, TransportError};
use proptest::prelude::*;
use serde_json::json;

const TOPIC: &str = "qa.acme.checkout.healing.selector.invoke";

fn registry(config: RegistryConfig) -> Arc<AgentRegistry> {
    Arc::new(AgentRegistry::new(
        Arc::new(InMemoryAgentRegistryRepository::new()),
        EventBus::with_default_capacity(),
        config,
    ))
}

fn specialist(id: &str) -> AgentRegistration {
    AgentRegistration::new(
        AgentIdentity::new("specialist", id, "0.4.1"),
        "acme",
        "checkout",
        ["healing.selector"],
    )
}

fn task(n: u32) -> Envelope {
    let payload = Payload::TaskRequest(TaskRequest {
        task_id: format!("task-{n}"),
        task_type: "triage".into(),
        inputs: json!({"ticket": n}),
        deadline: None,
    });
    Envelope {
        meta: EnvelopeMeta {
            version: PROTOCOL_VERSION.to_string(),
            message_id: String::new(),
            trace_id: TraceId::new(),
            ts: now_millis(),
            from: AgentIdentity::new("orchestrator", "cmo-1", "1.0.0"),
            to: AgentIdentity::new("specialist", "healer-7", "0.4.1"),
            tenant: "acme".into(),
            project: "checkout".into(),
            envelope_type: payload.envelope_type(),
            depth: 0,
            priority: None,
            correlation_id: None,
            reply_to: None,
            idempotency_key: None,
            auth_token: None,
            capability_token: None,
            signature: None,
        },
        payload,
    }
    .seal()
}

#[tokio::test]
async fn test_lapsed_agent_drops_out_of_discovery() {
    let registry = registry(RegistryConfig {
        expiry_check_interval: Duration::from_millis(20),
        ..RegistryConfig::default()
    });
    registry.register(specialist("healer-7")).await.unwrap();
    registry.register(specialist("healer-8")).await.unwrap();
    registry.heartbeat("healer-7", Duration::from_millis(50)).await.unwrap();
    registry.heartbeat("healer-8", Duration::from_secs(60)).await.unwrap();

    let query = DiscoveryQuery::new("acme", "checkout").with_capability("healing.selector");
    assert_eq!(registry.discover(&query).await.unwrap().len(), 2);

    let checker = Arc::new(LeaseExpiryChecker::new(registry.clone()));
    let shutdown = checker.shutdown_token();
    let handle = checker.start();

    // healer-7 never heartbeats again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let found: Vec<String> = registry
        .discover(&query)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.agent_id().to_string())
        .collect();
    assert_eq!(found, vec!["healer-8".to_string()]);

    let lapsed = registry.find("healer-7").await.unwrap().unwrap();
    assert_eq!(lapsed.status, AgentStatus::Unavailable);
    // An expired lease cannot be silently renewed; the agent must register again.
    assert!(registry.heartbeat("healer-7", Duration::from_secs(60)).await.is_err());

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_publish_blocks_until_consumer_drains() {
    let transport = InMemoryLogTransport::new(TransportConfig {
        backpressure_threshold: 5,
        publish_pause_timeout: Duration::from_secs(5),
        ..TransportConfig::default()
    });
    let mut consumer = transport.subscribe(TOPIC, "healers").await.unwrap();
    for n in 0..5 {
        transport.try_publish(TOPIC, &task(n)).unwrap();
    }
    assert!(transport.is_paused("healers"));

    let publisher = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.publish(TOPIC, &task(99)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!publisher.is_finished(), "publish must wait while the group is paused");

    // The resume mark is floor(5 * 0.8) = 4, so a single ack reopens the gate.
    let delivery = consumer.next().await.unwrap();
    consumer.ack(&delivery).await.unwrap();

    let receipt = tokio::time::timeout(Duration::from_secs(2), publisher)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(receipt.topic, TOPIC);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Consumer never acks while publishing: the gate closes at `T` and stays
    /// closed until acknowledgements bring pending down to `floor(0.8 T)`.
    #[test]
    fn prop_backpressure_hysteresis(threshold in 1usize..40) {
        tokio_test::block_on(async move {
            let transport = InMemoryLogTransport::new(TransportConfig {
                backpressure_threshold: threshold,
                partitions: 4,
                ..TransportConfig::default()
            });
            let mut consumer = transport.subscribe(TOPIC, "healers").await.unwrap();
            let resume_at = ((threshold as f64) * 0.8).floor() as usize;
            let resume_at = resume_at.min(threshold - 1);

            let mut published = 0u32;
            loop {
                match transport.try_publish(TOPIC, &task(published)) {
                    Ok(_) => published += 1,
                    Err(TransportError::Backpressure { .. }) => break,
                    Err(e) => panic!("unexpected publish error: {e}"),
                }
                assert!(published as usize <= threshold, "publishing never paused");
            }
            assert_eq!(published as usize, threshold);
            assert!(transport.is_paused("healers"));

            // Deliveries of one partition are handed out one at a time, so drain by
            // taking and acknowledging in turn.
            for _ in 0..threshold {
                let delivery = consumer.next().await.unwrap();
                consumer.ack(&delivery).await.unwrap();
                let pending = transport.pending("healers");
                assert_eq!(transport.is_paused("healers"), pending > resume_at, "pending {pending}");
                if pending > resume_at {
                    assert!(matches!(
                        transport.try_publish(TOPIC, &task(1_000)),
                        Err(TransportError::Backpressure { .. })
                    ));
                }
            }
            assert_eq!(transport.pending("healers"), 0);
            assert!(transport.try_publish(TOPIC, &task(2_000)).is_ok());
        });
    }

    #[test]
    fn prop_topic_round_trip(
        tenant in "[A-Za-z0-9_-]{1,12}",
        project in "[A-Za-z0-9_-]{1,12}",
        domain in "[a-z]{1,8}",
        entity in "[a-z][a-z0-9-]{0,8}",
        verb in "[a-z]{1,8}",
    ) {
        let components = TopicComponents::new(tenant, project, domain, entity, verb);
        let topic = build_topic(&components).unwrap();
        prop_assert_eq!(parse_topic(&topic).unwrap(), components);
    }
}

#[test]
fn test_topic_round_trip_scenario() {
    let components = TopicComponents::new("acme", "p1", "cmo", "decisions", "create");
    let topic = build_topic(&components).unwrap();
    assert_eq!(topic, "qa.acme.p1.cmo.decisions.create");
    assert_eq!(parse_topic(&topic).unwrap(), components);
}
