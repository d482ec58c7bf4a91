// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Replay protection: an envelope is accepted only when its `ts` lies inside
//! the freshness window and its idempotency key has not been seen before.
//!
//! A seen key is kept until `max(ts, seen_at) + window`. Freshness accepts a
//! `ts` up to one window in the future, so expiring keys by receipt time alone
//! would let a future-dated envelope through a second time while its `ts` is
//! still fresh. Past the stored expiry the freshness check rejects the
//! envelope on its own.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::domain::envelope::Envelope;
use crate::infrastructure::a2a::SecurityError;

const PURGE_EVERY: usize = 1024;

#[derive(Debug)]
pub struct ReplayGuard {
    window: chrono::Duration,
    /// Idempotency key to the instant it may be accepted again.
    seen: DashMap<String, DateTime<Utc>>,
    inserts: AtomicUsize,
}

impl ReplayGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(300)),
            seen: DashMap::new(),
            inserts: AtomicUsize::new(0),
        }
    }

    pub fn window(&self) -> chrono::Duration {
        self.window
    }

    pub fn check_freshness(
        &self,
        message_id: &str,
        ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), SecurityError> {
        let skew = (now - ts).abs();
        if skew > self.window {
            return Err(SecurityError::ReplayDetected {
                message_id: message_id.to_string(),
                reason: format!(
                    "timestamp {} is outside the {}s freshness window",
                    ts.to_rfc3339(),
                    self.window.num_seconds()
                ),
            });
        }
        Ok(())
    }

    /// Record `key` (from an envelope stamped `ts`) as seen at `now`, failing
    /// if it is still remembered.
    pub fn check_and_record(
        &self,
        key: &str,
        message_id: &str,
        ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), SecurityError> {
        let expires_at = ts.max(now) + self.window;
        match self.seen.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if now <= *entry.get() {
                    return Err(SecurityError::ReplayDetected {
                        message_id: message_id.to_string(),
                        reason: format!("idempotency key '{key}' already seen"),
                    });
                }
                entry.insert(expires_at);
            }
            Entry::Vacant(entry) => {
                entry.insert(expires_at);
            }
        }
        if self.inserts.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired(now);
        }
        Ok(())
    }

    pub fn check_envelope(&self, envelope: &Envelope, now: DateTime<Utc>) -> Result<(), SecurityError> {
        self.check_freshness(&envelope.meta.message_id, envelope.meta.ts, now)?;
        let meta = &envelope.meta;
        self.check_and_record(&envelope.idempotency_key(), &meta.message_id, meta.ts, now)
    }

    /// Drop keys whose expiry has passed. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, expires_at| now <= *expires_at);
        before.saturating_sub(self.seen.len())
    }

    pub fn tracked(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::test_support::{sample_envelope, task_request};

    #[test]
    fn test_duplicate_key_rejected_inside_window() {
        let guard = ReplayGuard::new(Duration::from_secs(300));
        let envelope = sample_envelope(task_request());
        let now = envelope.meta.ts;
        assert!(guard.check_envelope(&envelope, now).is_ok());
        let err = guard.check_envelope(&envelope, now).unwrap_err();
        assert_eq!(err.code(), "E_REPLAY_DETECTED");
    }

    #[test]
    fn test_stale_and_future_timestamps_rejected() {
        let guard = ReplayGuard::new(Duration::from_secs(300));
        let envelope = sample_envelope(task_request());
        let ts = envelope.meta.ts;
        assert!(guard.check_envelope(&envelope, ts + chrono::Duration::seconds(301)).is_err());
        assert!(guard.check_envelope(&envelope, ts - chrono::Duration::seconds(301)).is_err());
        assert!(guard.check_freshness("m", ts, ts + chrono::Duration::seconds(300)).is_ok());
    }

    #[test]
    fn test_purge_forgets_old_keys() {
        let guard = ReplayGuard::new(Duration::from_secs(10));
        let now = Utc::now();
        guard.check_and_record("a", "m1", now, now).unwrap();
        let later = now + chrono::Duration::seconds(8);
        guard.check_and_record("b", "m2", later, later).unwrap();
        assert_eq!(guard.purge_expired(now + chrono::Duration::seconds(15)), 1);
        assert_eq!(guard.tracked(), 1);
    }

    #[test]
    fn test_key_reusable_after_window() {
        let guard = ReplayGuard::new(Duration::from_secs(10));
        let now = Utc::now();
        guard.check_and_record("a", "m1", now, now).unwrap();
        assert!(guard
            .check_and_record("a", "m1", now, now + chrono::Duration::seconds(11))
            .is_ok());
    }

    #[test]
    fn test_future_dated_envelope_stays_rejected_while_fresh() {
        let guard = ReplayGuard::new(Duration::from_secs(300));
        let mut envelope = sample_envelope(task_request());
        let received = envelope.meta.ts;
        envelope.meta.ts = received + chrono::Duration::seconds(299);

        assert!(guard.check_envelope(&envelope, received).is_ok());
        // Still inside the freshness window relative to its ts, past one window since receipt.
        let later = received + chrono::Duration::seconds(301);
        assert!(guard.check_freshness("m", envelope.meta.ts, later).is_ok());
        let err = guard.check_envelope(&envelope, later).unwrap_err();
        assert_eq!(err.code(), "E_REPLAY_DETECTED");

        // Once the ts itself is stale the freshness check takes over.
        let stale = envelope.meta.ts + chrono::Duration::seconds(301);
        assert_eq!(guard.purge_expired(stale), 1);
        assert!(guard.check_envelope(&envelope, stale).is_err());
    }
}
