// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # In-Memory Partitioned Log Transport
//!
//! Topics are append-only logs split into `partitions`; a record's partition
//! comes from its `{tenant}:{project}:{trace_id}` key. Consumer groups keep a
//! cursor per partition plus the records they have in flight.
//!
//! ## Ordering
//!
//! A partition with a record in flight (or queued for redelivery) is not read
//! past until that record is acked or dead-lettered. Within a group this keeps
//! per-trace order even with several members pulling concurrently.
//!
//! ## Pending
//!
//! `pending(group)` = records not yet delivered + in flight + awaiting
//! redelivery. Every change re-evaluates each group's [`BackpressureGate`];
//! `publish` waits while any group subscribed to the topic is paused.
//!
//! ## Retention
//!
//! Each partition keeps at most `retained_records` records. Older records are
//! dropped from the front, but never past the lowest cursor, in-flight or
//! redelivery offset of a group whose pattern matches the topic. Offsets stay
//! absolute: a partition remembers the offset of its first retained record.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use crate::domain::envelope::Envelope;
use crate::domain::events::TransportEvent;
use crate::domain::node_config::TransportConfig;
use crate::domain::topic::{dead_letter_topic, generate_partition_key, parse_topic, partition_for, TopicPattern};
use crate::infrastructure::a2a::EnvelopeValidator;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::transport::{
    correlation_key, BackpressureGate, Consumer, DeadLetter, DeadLetterReason, Delivery, GateTransition, NackOutcome,
    PublishReceipt, Transport, TransportError,
};

type PartitionRef = (String, usize);

struct TopicLog {
    partitions: Vec<PartitionLog>,
}

#[derive(Clone, Default)]
struct PartitionLog {
    /// Offset of `records[0]`.
    base: u64,
    records: VecDeque<Envelope>,
}

impl PartitionLog {
    fn end(&self) -> u64 {
        self.base + self.records.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&Envelope> {
        offset
            .checked_sub(self.base)
            .and_then(|index| self.records.get(index as usize))
    }
}

struct InFlight {
    topic: String,
    partition: usize,
    offset: u64,
    attempt: u32,
    delivered_at: Instant,
}

struct Redelivery {
    topic: String,
    partition: usize,
    offset: u64,
    attempt: u32,
}

struct GroupState {
    pattern: TopicPattern,
    cursors: HashMap<PartitionRef, u64>,
    in_flight: HashMap<u64, InFlight>,
    redeliver: VecDeque<Redelivery>,
    gate: BackpressureGate,
    rotation: usize,
}

impl GroupState {
    /// Lowest offset of `partition` this group still needs.
    fn low_water(&self, topic: &str, partition: usize, base: u64) -> u64 {
        let cursor = self
            .cursors
            .get(&(topic.to_string(), partition))
            .copied()
            .unwrap_or(base);
        let in_flight = self
            .in_flight
            .values()
            .filter(|f| f.partition == partition && f.topic == topic)
            .map(|f| f.offset);
        let redeliver = self
            .redeliver
            .iter()
            .filter(|r| r.partition == partition && r.topic == topic)
            .map(|r| r.offset);
        in_flight.chain(redeliver).fold(cursor, u64::min)
    }

    fn blocks(&self, topic: &str, partition: usize) -> bool {
        self.in_flight
            .values()
            .any(|f| f.partition == partition && f.topic == topic)
            || self
                .redeliver
                .iter()
                .any(|r| r.partition == partition && r.topic == topic)
    }
}

struct GateChange {
    group: String,
    transition: GateTransition,
    pending: usize,
    threshold: usize,
}

#[derive(Default)]
struct LogState {
    topics: BTreeMap<String, TopicLog>,
    groups: HashMap<String, GroupState>,
    dead_letters: HashMap<String, Vec<DeadLetter>>,
    next_delivery_id: u64,
    closed: bool,
}

fn pending_for(topics: &BTreeMap<String, TopicLog>, group: &GroupState) -> usize {
    let undelivered: usize = topics
        .iter()
        .filter(|(name, _)| group.pattern.matches(name))
        .map(|(name, log)| {
            log.partitions
                .iter()
                .enumerate()
                .map(|(p, log)| {
                    let cursor = group.cursors.get(&(name.clone(), p)).copied().unwrap_or(0);
                    log.end().saturating_sub(cursor.max(log.base)) as usize
                })
                .sum::<usize>()
        })
        .sum();
    undelivered + group.in_flight.len() + group.redeliver.len()
}

impl LogState {
    fn observe_gates(&mut self) -> Vec<GateChange> {
        let topics = &self.topics;
        let mut changes = Vec::new();
        for (name, group) in self.groups.iter_mut() {
            let pending = pending_for(topics, group);
            metrics::gauge!("relay_transport_pending", "group" => name.clone()).set(pending as f64);
            let transition = group.gate.observe(pending);
            if transition != GateTransition::Unchanged {
                changes.push(GateChange {
                    group: name.clone(),
                    transition,
                    pending,
                    threshold: group.gate.threshold(),
                });
            }
        }
        changes
    }

    fn publish_blocked(&self, topic: &str) -> bool {
        self.groups
            .values()
            .any(|g| g.gate.is_paused() && g.pattern.matches(topic))
    }

    fn record(&self, topic: &str, partition: usize, offset: u64) -> Option<&Envelope> {
        self.topics
            .get(topic)
            .and_then(|log| log.partitions.get(partition))
            .and_then(|log| log.get(offset))
    }

    /// Drop records beyond `retain` that no matching group still needs.
    /// Returns how many were dropped.
    fn trim(&mut self, topic: &str, partition: usize, retain: usize) -> usize {
        let Some(log) = self.topics.get(topic).and_then(|t| t.partitions.get(partition)) else {
            return 0;
        };
        if log.records.len() <= retain {
            return 0;
        }
        let floor = self
            .groups
            .values()
            .filter(|g| g.pattern.matches(topic))
            .map(|g| g.low_water(topic, partition, log.base))
            .min()
            .unwrap_or(u64::MAX);
        let Some(log) = self
            .topics
            .get_mut(topic)
            .and_then(|t| t.partitions.get_mut(partition))
        else {
            return 0;
        };
        let mut dropped = 0;
        while log.records.len() > retain && log.base < floor {
            log.records.pop_front();
            log.base += 1;
            dropped += 1;
        }
        dropped
    }

    fn take_next(&mut self, group_name: &str) -> Option<Delivery> {
        let topics = &self.topics;
        let group = self.groups.get_mut(group_name)?;

        let (topic, partition, offset, attempt) = if let Some(r) = group.redeliver.pop_front() {
            (r.topic, r.partition, r.offset, r.attempt)
        } else {
            let candidates: Vec<(String, usize, u64, u64)> = topics
                .iter()
                .filter(|(name, _)| group.pattern.matches(name))
                .flat_map(|(name, log)| {
                    log.partitions
                        .iter()
                        .enumerate()
                        .map(move |(p, log)| (name.clone(), p, log.base, log.end()))
                })
                .filter(|(name, p, base, end)| {
                    let cursor = group.cursors.get(&(name.clone(), *p)).copied().unwrap_or(0);
                    cursor.max(*base) < *end && !group.blocks(name, *p)
                })
                .collect();
            if candidates.is_empty() {
                return None;
            }
            let (name, p, base, _) = candidates[group.rotation % candidates.len()].clone();
            group.rotation = group.rotation.wrapping_add(1);
            let cursor = group.cursors.entry((name.clone(), p)).or_insert(base);
            let offset = (*cursor).max(base);
            *cursor = offset + 1;
            (name, p, offset, 1)
        };

        let envelope = topics
            .get(&topic)
            .and_then(|log| log.partitions.get(partition))
            .and_then(|log| log.get(offset))?
            .clone();
        self.next_delivery_id += 1;
        let delivery_id = self.next_delivery_id;
        let group = self.groups.get_mut(group_name)?;
        group.in_flight.insert(
            delivery_id,
            InFlight {
                topic: topic.clone(),
                partition,
                offset,
                attempt,
                delivered_at: Instant::now(),
            },
        );
        Some(Delivery {
            delivery_id,
            topic,
            partition,
            offset,
            attempt,
            envelope,
        })
    }

    /// Redeliver or dead-letter an in-flight record that was nacked or timed out.
    fn settle_failed(
        &mut self,
        group_name: &str,
        flight: InFlight,
        max_redeliveries: u32,
        detail: &str,
    ) -> (NackOutcome, Option<DeadLetter>) {
        if flight.attempt > max_redeliveries {
            let envelope = self.record(&flight.topic, flight.partition, flight.offset).cloned();
            let dead = envelope.map(|envelope| DeadLetter {
                dead_letter_topic: dead_letter_topic(&flight.topic),
                topic: flight.topic.clone(),
                reason: DeadLetterReason::MaxRedeliveries,
                detail: detail.to_string(),
                attempts: flight.attempt,
                envelope,
                dead_lettered_at: Utc::now(),
            });
            if let Some(dead) = &dead {
                self.dead_letters
                    .entry(flight.topic.clone())
                    .or_default()
                    .push(dead.clone());
            }
            (NackOutcome::DeadLettered, dead)
        } else {
            let next_attempt = flight.attempt + 1;
            if let Some(group) = self.groups.get_mut(group_name) {
                group.redeliver.push_back(Redelivery {
                    topic: flight.topic,
                    partition: flight.partition,
                    offset: flight.offset,
                    attempt: next_attempt,
                });
            }
            (NackOutcome::Redeliver { next_attempt }, None)
        }
    }

    fn reclaim_stale(&mut self, group_name: &str, ack_timeout: Duration, max_redeliveries: u32) -> Vec<DeadLetter> {
        let Some(group) = self.groups.get_mut(group_name) else {
            return Vec::new();
        };
        let stale: Vec<u64> = group
            .in_flight
            .iter()
            .filter(|(_, f)| f.delivered_at.elapsed() >= ack_timeout)
            .map(|(id, _)| *id)
            .collect();
        let flights: Vec<InFlight> = stale.iter().filter_map(|id| group.in_flight.remove(id)).collect();
        let mut dead = Vec::new();
        for flight in flights {
            debug!(group = group_name, topic = %flight.topic, offset = flight.offset, "Reclaiming unacknowledged delivery");
            if let (_, Some(letter)) = self.settle_failed(group_name, flight, max_redeliveries, "ack timeout") {
                dead.push(letter);
            }
        }
        dead
    }
}

struct Shared {
    config: TransportConfig,
    validator: EnvelopeValidator,
    state: Mutex<LogState>,
    changed: Notify,
    waiters: DashMap<String, oneshot::Sender<Envelope>>,
    events: Option<EventBus>,
}

impl Shared {
    /// Emit events and metrics for state changes, then wake waiting publishers and consumers.
    fn after_change(&self, gates: Vec<GateChange>, dead: Vec<DeadLetter>) {
        for change in gates {
            match change.transition {
                GateTransition::Paused => {
                    warn!(group = %change.group, pending = change.pending, threshold = change.threshold, "Publisher paused by backpressure");
                    if let Some(bus) = &self.events {
                        bus.publish_transport_event(TransportEvent::PublisherPaused {
                            group: change.group,
                            pending: change.pending,
                            threshold: change.threshold,
                            paused_at: Utc::now(),
                        });
                    }
                }
                GateTransition::Resumed => {
                    info!(group = %change.group, pending = change.pending, "Publisher resumed");
                    if let Some(bus) = &self.events {
                        bus.publish_transport_event(TransportEvent::PublisherResumed {
                            group: change.group,
                            pending: change.pending,
                            resumed_at: Utc::now(),
                        });
                    }
                }
                GateTransition::Unchanged => {}
            }
        }
        for letter in dead {
            self.announce_dead_letter(&letter);
        }
        self.changed.notify_waiters();
    }

    fn announce_dead_letter(&self, letter: &DeadLetter) {
        warn!(
            topic = %letter.topic,
            message_id = %letter.envelope.meta.message_id,
            trace_id = %letter.envelope.meta.trace_id,
            reason = %letter.reason,
            "Envelope dead-lettered: {}",
            letter.detail
        );
        metrics::counter!("relay_envelopes_dead_lettered_total", "reason" => letter.reason.as_str()).increment(1);
        if let Some(bus) = &self.events {
            bus.publish_transport_event(TransportEvent::EnvelopeDeadLettered {
                topic: letter.topic.clone(),
                message_id: letter.envelope.meta.message_id.clone(),
                trace_id: letter.envelope.meta.trace_id,
                reason: letter.reason.as_str().to_string(),
                dead_lettered_at: letter.dead_lettered_at,
            });
        }
    }

    fn route_reply(&self, envelope: &Envelope) {
        if !envelope.envelope_type().is_response() {
            return;
        }
        let Some(correlation_id) = envelope.meta.correlation_id.as_deref() else {
            return;
        };
        if let Some((_, waiter)) = self.waiters.remove(correlation_id) {
            if waiter.send(envelope.clone()).is_err() {
                debug!(correlation_id, "Reply waiter already gone");
            }
        }
    }
}

/// Removes a reply waiter when the request finishes, however it finishes.
struct WaiterGuard<'a> {
    waiters: &'a DashMap<String, oneshot::Sender<Envelope>>,
    key: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.remove(&self.key);
    }
}

#[derive(Clone)]
pub struct InMemoryLogTransport {
    shared: Arc<Shared>,
}

impl InMemoryLogTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_event_bus(config: TransportConfig, events: EventBus) -> Self {
        Self::build(config, Some(events))
    }

    fn build(config: TransportConfig, events: Option<EventBus>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                validator: EnvelopeValidator::new(),
                state: Mutex::new(LogState::default()),
                changed: Notify::new(),
                waiters: DashMap::new(),
                events,
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Records not yet acknowledged by `group`.
    pub fn pending(&self, group: &str) -> usize {
        let state = self.shared.state.lock();
        state
            .groups
            .get(group)
            .map(|g| pending_for(&state.topics, g))
            .unwrap_or(0)
    }

    pub fn is_paused(&self, group: &str) -> bool {
        self.shared
            .state
            .lock()
            .groups
            .get(group)
            .is_some_and(|g| g.gate.is_paused())
    }

    /// Envelopes still retained on `topic`, in partition then offset order.
    pub fn records(&self, topic: &str) -> Vec<Envelope> {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .map(|log| {
                log.partitions
                    .iter()
                    .flat_map(|p| p.records.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stop the transport: consumers and publishers fail with `Closed`, reply waiters are dropped.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.waiters.clear();
        self.shared.changed.notify_waiters();
    }

    fn validate(&self, topic: &str, envelope: &Envelope) -> Result<(), TransportError> {
        parse_topic(topic)?;
        if !self.shared.config.validate_on_publish {
            return Ok(());
        }
        let report = self.shared.validator.validate_envelope(envelope);
        if report.valid {
            return Ok(());
        }
        let detail = report.summary();
        self.push_dead_letter(topic, envelope, DeadLetterReason::Validation, &detail, 0);
        Err(TransportError::Validation(detail))
    }

    fn push_dead_letter(&self, topic: &str, envelope: &Envelope, reason: DeadLetterReason, detail: &str, attempts: u32) {
        let letter = DeadLetter {
            topic: topic.to_string(),
            dead_letter_topic: dead_letter_topic(topic),
            reason,
            detail: detail.to_string(),
            attempts,
            envelope: envelope.clone(),
            dead_lettered_at: Utc::now(),
        };
        self.shared
            .state
            .lock()
            .dead_letters
            .entry(topic.to_string())
            .or_default()
            .push(letter.clone());
        self.shared.announce_dead_letter(&letter);
    }

    /// Append without checking the backpressure gate. Caller holds the lock.
    fn append(&self, state: &mut LogState, topic: &str, envelope: &Envelope) -> PublishReceipt {
        let partitions = self.shared.config.partitions.max(1);
        let key = generate_partition_key(&envelope.meta.tenant, &envelope.meta.project, &envelope.meta.trace_id);
        let partition = partition_for(&key, partitions);
        let log = state.topics.entry(topic.to_string()).or_insert_with(|| TopicLog {
            partitions: vec![PartitionLog::default(); partitions],
        });
        let part = &mut log.partitions[partition];
        part.records.push_back(envelope.clone());
        let offset = part.end() - 1;
        self.trim(state, topic, partition);
        PublishReceipt {
            topic: topic.to_string(),
            partition,
            offset,
            message_id: envelope.meta.message_id.clone(),
        }
    }

    fn trim(&self, state: &mut LogState, topic: &str, partition: usize) {
        let dropped = state.trim(topic, partition, self.shared.config.retained_records);
        if dropped > 0 {
            debug!(topic, partition, dropped, "Trimmed retained records");
        }
    }

    fn commit_publish(&self, mut state: parking_lot::MutexGuard<'_, LogState>, topic: &str, envelope: &Envelope) -> PublishReceipt {
        let receipt = self.append(&mut state, topic, envelope);
        let gates = state.observe_gates();
        drop(state);
        self.shared.after_change(gates, Vec::new());
        self.shared.route_reply(envelope);
        metrics::counter!("relay_envelopes_published_total").increment(1);
        debug!(topic, partition = receipt.partition, offset = receipt.offset, message_id = %receipt.message_id, "Envelope published");
        receipt
    }

    /// Publish only if no subscribed group is paused; never waits.
    pub fn try_publish(&self, topic: &str, envelope: &Envelope) -> Result<PublishReceipt, TransportError> {
        self.validate(topic, envelope)?;
        let state = self.shared.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.publish_blocked(topic) {
            return Err(TransportError::Backpressure {
                topic: topic.to_string(),
                waited: Duration::ZERO,
            });
        }
        Ok(self.commit_publish(state, topic, envelope))
    }
}

#[async_trait]
impl Transport for InMemoryLogTransport {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<PublishReceipt, TransportError> {
        self.validate(topic, envelope)?;
        let wait_limit = self.shared.config.publish_pause_timeout;
        let started = Instant::now();
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.shared.state.lock();
                if state.closed {
                    return Err(TransportError::Closed);
                }
                if !state.publish_blocked(topic) {
                    return Ok(self.commit_publish(state, topic, envelope));
                }
            }
            let waited = started.elapsed();
            if waited >= wait_limit {
                return Err(TransportError::Backpressure {
                    topic: topic.to_string(),
                    waited,
                });
            }
            let _ = tokio::time::timeout(wait_limit - waited, notified).await;
        }
    }

    async fn subscribe(&self, pattern: &str, group: &str) -> Result<Box<dyn Consumer>, TransportError> {
        let parsed = TopicPattern::parse(pattern)?;
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if let Some(existing) = state.groups.get(group) {
            if existing.pattern != parsed {
                return Err(TransportError::GroupPatternMismatch {
                    group: group.to_string(),
                    existing: existing.pattern.to_string(),
                    requested: pattern.to_string(),
                });
            }
        } else {
            state.groups.insert(
                group.to_string(),
                GroupState {
                    pattern: parsed,
                    cursors: HashMap::new(),
                    in_flight: HashMap::new(),
                    redeliver: VecDeque::new(),
                    gate: BackpressureGate::new(
                        self.shared.config.backpressure_threshold,
                        self.shared.config.resume_ratio,
                    ),
                    rotation: 0,
                },
            );
            info!(group, pattern, "Consumer group created");
        }
        let gates = state.observe_gates();
        drop(state);
        self.shared.after_change(gates, Vec::new());
        Ok(Box::new(LogConsumer {
            shared: Arc::clone(&self.shared),
            group: group.to_string(),
        }))
    }

    async fn request(&self, topic: &str, envelope: &Envelope, timeout: Duration) -> Result<Envelope, TransportError> {
        if envelope.meta.reply_to.is_none() {
            return Err(TransportError::MissingReplyTo {
                message_id: envelope.meta.message_id.clone(),
            });
        }
        let key = correlation_key(envelope);
        let (tx, rx) = oneshot::channel();
        self.shared.waiters.insert(key.clone(), tx);
        let _guard = WaiterGuard {
            waiters: &self.shared.waiters,
            key: key.clone(),
        };

        let exchange = async {
            self.publish(topic, envelope).await?;
            rx.await.map_err(|_| TransportError::Closed)
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::RequestTimeout {
                correlation_id: key,
                timeout,
            }),
        }
    }

    async fn dead_letter(
        &self,
        topic: &str,
        envelope: &Envelope,
        reason: DeadLetterReason,
        detail: &str,
    ) -> Result<(), TransportError> {
        self.push_dead_letter(topic, envelope, reason, detail, 0);
        Ok(())
    }

    async fn dead_letters(&self, topic: &str) -> Result<Vec<DeadLetter>, TransportError> {
        Ok(self
            .shared
            .state
            .lock()
            .dead_letters
            .get(topic)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct LogConsumer {
    shared: Arc<Shared>,
    group: String,
}

#[async_trait]
impl Consumer for LogConsumer {
    fn group(&self) -> &str {
        &self.group
    }

    async fn next(&mut self) -> Result<Delivery, TransportError> {
        let ack_timeout = self.shared.config.ack_timeout;
        let max_redeliveries = self.shared.config.max_redeliveries;
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(TransportError::Closed);
                }
                let dead = state.reclaim_stale(&self.group, ack_timeout, max_redeliveries);
                let delivery = state.take_next(&self.group);
                let gates = state.observe_gates();
                drop(state);
                if delivery.is_some() || !dead.is_empty() || !gates.is_empty() {
                    self.shared.after_change(gates, dead);
                }
                if let Some(delivery) = delivery {
                    return Ok(delivery);
                }
            }
            let _ = tokio::time::timeout(ack_timeout, notified).await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        let Some(flight) = state
            .groups
            .get_mut(&self.group)
            .and_then(|g| g.in_flight.remove(&delivery.delivery_id))
        else {
            return Err(TransportError::UnknownDelivery(delivery.delivery_id));
        };
        let dropped = state.trim(&flight.topic, flight.partition, self.shared.config.retained_records);
        if dropped > 0 {
            debug!(topic = %flight.topic, partition = flight.partition, dropped, "Trimmed retained records");
        }
        let gates = state.observe_gates();
        drop(state);
        self.shared.after_change(gates, Vec::new());
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, TransportError> {
        let max_redeliveries = self.shared.config.max_redeliveries;
        let mut state = self.shared.state.lock();
        let flight = state
            .groups
            .get_mut(&self.group)
            .and_then(|g| g.in_flight.remove(&delivery.delivery_id))
            .ok_or(TransportError::UnknownDelivery(delivery.delivery_id))?;
        let (outcome, dead) = state.settle_failed(&self.group, flight, max_redeliveries, reason);
        let gates = state.observe_gates();
        drop(state);
        self.shared.after_change(gates, dead.into_iter().collect());
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::test_support::{sample_envelope, task_request};
    use crate::domain::envelope::{EnvelopeType, Payload, TaskResult, TaskStatus};
    use crate::domain::execution::TraceId;
    use serde_json::json;

    const TOPIC: &str = "qa.acme.checkout.healing.selector.invoke";
    const PATTERN: &str = "qa.acme.checkout.healing.*.invoke";

    fn config() -> TransportConfig {
        TransportConfig {
            partitions: 4,
            backpressure_threshold: 10,
            max_redeliveries: 2,
            ack_timeout: Duration::from_secs(30),
            publish_pause_timeout: Duration::from_millis(50),
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_publish_then_consume_and_ack() {
        let transport = InMemoryLogTransport::new(config());
        let mut consumer = transport.subscribe(PATTERN, "healers").await.unwrap();
        let envelope = sample_envelope(task_request());
        let receipt = transport.publish(TOPIC, &envelope).await.unwrap();
        assert_eq!(receipt.message_id, envelope.meta.message_id);

        let delivery = consumer.next().await.unwrap();
        assert_eq!(delivery.envelope, envelope);
        assert_eq!(delivery.attempt, 1);
        assert_eq!(transport.pending("healers"), 1);
        consumer.ack(&delivery).await.unwrap();
        assert_eq!(transport.pending("healers"), 0);
        assert!(matches!(
            consumer.ack(&delivery).await,
            Err(TransportError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn test_group_members_share_work_and_keep_trace_order() {
        let transport = InMemoryLogTransport::new(config());
        let mut a = transport.subscribe(PATTERN, "healers").await.unwrap();
        let mut b = transport.subscribe(PATTERN, "healers").await.unwrap();

        let trace_id = TraceId::new();
        let mut first = sample_envelope(task_request());
        first.meta.trace_id = trace_id;
        let first = first.seal();
        let mut second = sample_envelope(task_request());
        second.meta.trace_id = trace_id;
        second.meta.ts = first.meta.ts + chrono::Duration::milliseconds(1);
        let second = second.seal();
        transport.publish(TOPIC, &first).await.unwrap();
        transport.publish(TOPIC, &second).await.unwrap();

        let got = a.next().await.unwrap();
        assert_eq!(got.envelope.meta.message_id, first.meta.message_id);
        // Same partition is blocked while `first` is in flight.
        let blocked = tokio::time::timeout(Duration::from_millis(30), b.next()).await;
        assert!(blocked.is_err());
        a.ack(&got).await.unwrap();
        let next = b.next().await.unwrap();
        assert_eq!(next.envelope.meta.message_id, second.meta.message_id);
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let transport = InMemoryLogTransport::new(config());
        let mut consumer = transport.subscribe(PATTERN, "healers").await.unwrap();
        let envelope = sample_envelope(task_request());
        transport.publish(TOPIC, &envelope).await.unwrap();

        for expected_attempt in 1..=3 {
            let delivery = consumer.next().await.unwrap();
            assert_eq!(delivery.attempt, expected_attempt);
            let outcome = consumer.nack(&delivery, "handler failed").await.unwrap();
            if expected_attempt < 3 {
                assert_eq!(outcome, NackOutcome::Redeliver { next_attempt: expected_attempt + 1 });
            } else {
                assert_eq!(outcome, NackOutcome::DeadLettered);
            }
        }
        let dead = transport.dead_letters(TOPIC).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::MaxRedeliveries);
        assert_eq!(dead[0].dead_letter_topic, format!("{TOPIC}-dlq"));
        assert_eq!(transport.pending("healers"), 0);
    }

    #[tokio::test]
    async fn test_invalid_envelope_goes_to_dead_letter() {
        let transport = InMemoryLogTransport::new(config());
        let mut envelope = sample_envelope(task_request());
        envelope.meta.message_id = "not-a-hash".into();
        let err = transport.publish(TOPIC, &envelope).await.unwrap_err();
        assert!(matches!(err, TransportError::Validation(_)));
        let dead = transport.dead_letters(TOPIC).await.unwrap();
        assert_eq!(dead[0].reason, DeadLetterReason::Validation);
        assert!(transport.records(TOPIC).is_empty());

        let wildcard = transport.publish("qa.acme.*.healing.selector.invoke", &sample_envelope(task_request())).await;
        assert!(matches!(wildcard, Err(TransportError::InvalidTopic(_))));
    }

    #[tokio::test]
    async fn test_unacked_delivery_is_redelivered_after_ack_timeout() {
        let transport = InMemoryLogTransport::new(TransportConfig {
            ack_timeout: Duration::from_millis(20),
            ..config()
        });
        let mut consumer = transport.subscribe(PATTERN, "healers").await.unwrap();
        transport.publish(TOPIC, &sample_envelope(task_request())).await.unwrap();
        let first = consumer.next().await.unwrap();
        let again = consumer.next().await.unwrap();
        assert_eq!(again.offset, first.offset);
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn test_backpressure_pauses_blocking_publish() {
        let transport = InMemoryLogTransport::new(config());
        let _consumer = transport.subscribe(PATTERN, "healers").await.unwrap();
        for _ in 0..10 {
            transport.try_publish(TOPIC, &sample_envelope(task_request())).unwrap();
        }
        assert!(transport.is_paused("healers"));
        let err = transport.publish(TOPIC, &sample_envelope(task_request())).await.unwrap_err();
        assert!(matches!(err, TransportError::Backpressure { .. }));
        assert!(err.is_retriable());
        // Topics no paused group reads are unaffected.
        assert!(transport
            .try_publish("qa.acme.checkout.cmo.decisions.create", &sample_envelope(task_request()))
            .is_ok());
    }

    #[tokio::test]
    async fn test_request_receives_correlated_reply() {
        let transport = InMemoryLogTransport::new(config());
        let mut consumer = transport.subscribe(PATTERN, "healers").await.unwrap();
        let responder = transport.clone();
        tokio::spawn(async move {
            let delivery = consumer.next().await.unwrap();
            let request = delivery.envelope.clone();
            let mut reply = sample_envelope(Payload::TaskResult(TaskResult {
                task_id: "task-1".into(),
                status: TaskStatus::Succeeded,
                output: json!({"fixed": true}),
                error: None,
            }));
            reply.meta.trace_id = request.meta.trace_id;
            reply.meta.correlation_id = Some(correlation_key(&request));
            let reply = reply.seal();
            let reply_topic = request.meta.reply_to.clone().unwrap();
            responder.publish(&reply_topic, &reply).await.unwrap();
            consumer.ack(&delivery).await.unwrap();
        });

        let mut request = sample_envelope(task_request());
        request.meta.reply_to = Some("qa.acme.checkout.cmo.inbox.reply".into());
        let request = request.seal();
        let reply = transport
            .request(TOPIC, &request, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.envelope_type(), EnvelopeType::TaskResult);
        assert_eq!(reply.meta.correlation_id.as_deref(), Some(request.meta.message_id.as_str()));
    }

    #[tokio::test]
    async fn test_request_times_out_without_reply() {
        let transport = InMemoryLogTransport::new(config());
        let mut request = sample_envelope(task_request());
        assert!(matches!(
            transport.request(TOPIC, &request, Duration::from_millis(20)).await,
            Err(TransportError::MissingReplyTo { .. })
        ));
        request.meta.reply_to = Some("qa.acme.checkout.cmo.inbox.reply".into());
        let request = request.seal();
        let started = Instant::now();
        let err = transport
            .request(TOPIC, &request, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RequestTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(transport.shared.waiters.is_empty());
    }

    #[tokio::test]
    async fn test_retention_trims_only_records_every_group_has_passed() {
        let transport = InMemoryLogTransport::new(TransportConfig {
            partitions: 1,
            retained_records: 3,
            ..config()
        });
        // Reply topics have no consumer group, so only the cap applies.
        let replies = "qa.acme.checkout.cmo.inbox.reply";
        let mut last = None;
        for _ in 0..5 {
            last = Some(transport.publish(replies, &sample_envelope(task_request())).await.unwrap());
        }
        assert_eq!(last.unwrap().offset, 4);
        assert_eq!(transport.records(replies).len(), 3);

        let mut consumer = transport.subscribe(PATTERN, "healers").await.unwrap();
        for _ in 0..5 {
            transport.publish(TOPIC, &sample_envelope(task_request())).await.unwrap();
        }
        assert_eq!(transport.records(TOPIC).len(), 5, "unconsumed records are kept");

        let first = consumer.next().await.unwrap();
        assert_eq!(first.offset, 0);
        consumer.ack(&first).await.unwrap();
        let second = consumer.next().await.unwrap();
        assert_eq!(transport.records(TOPIC).len(), 4, "in-flight record is kept");
        consumer.ack(&second).await.unwrap();
        assert_eq!(transport.records(TOPIC).len(), 3);

        for expected in 2..5 {
            let delivery = consumer.next().await.unwrap();
            assert_eq!(delivery.offset, expected);
            consumer.ack(&delivery).await.unwrap();
        }
        assert_eq!(transport.records(TOPIC).len(), 3);
        assert_eq!(transport.pending("healers"), 0);

        // A group created later starts at the oldest retained record.
        let mut late = transport.subscribe(PATTERN, "auditors").await.unwrap();
        assert_eq!(transport.pending("auditors"), 3);
        assert_eq!(late.next().await.unwrap().offset, 2);
    }

    #[tokio::test]
    async fn test_group_pattern_is_fixed() {
        let transport = InMemoryLogTransport::new(config());
        transport.subscribe(PATTERN, "healers").await.unwrap();
        let err = transport.subscribe("qa.acme.checkout.*.*.*", "healers").await;
        assert!(matches!(err, Err(TransportError::GroupPatternMismatch { .. })));
    }
}
