// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Correlates the legs of one XCM message across independent block streams.
//!
//! Each observed leg computes its match key, looks up the counterpart
//! namespace under the engine mutex, and either joins (emitting the next
//! lifecycle notification) or persists itself as a half match with a TTL.
//! Per `(message_hash, subscription)` the emission order is
//! `Sent → Relayed? → (Received | Timeout)`; matched and timed-out hashes
//! are terminal and later observations are treated as duplicates.

use super::store::{Namespace, PendingStore};
use super::types::{outbound_key, relay_key, DedupCache, PendingContext, PendingEntry};
use crate::metrics::MonitorMetrics;
use crate::types::{
    now_millis, XcmInbound, XcmNotifyMessage, XcmRelayedContext, XcmSentContext,
    DEFAULT_OUTBOUND_TTL_MS,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Invoked for every emitted lifecycle notification. Supplied by the
/// switchboard at construction, which breaks the reference cycle between
/// the two components.
pub type WaypointCallback = Arc<dyn Fn(XcmNotifyMessage) + Send + Sync>;

/// Replay suppression window for repeated block observations.
const REPLAY_GUARD_TTL: Duration = Duration::from_secs(600);
const REPLAY_GUARD_CAPACITY: usize = 16_384;

/// Retention of terminal / relayed-once markers.
const LIFECYCLE_GUARD_TTL: Duration = Duration::from_millis(DEFAULT_OUTBOUND_TTL_MS);
const LIFECYCLE_GUARD_CAPACITY: usize = 65_536;

pub struct MatchingEngine {
    store: Arc<PendingStore>,
    /// Serializes every get-counterpart → delete/put critical section.
    mutex: Mutex<()>,
    on_waypoint: WaypointCallback,
    /// Suppresses duplicate `(subscription, hash, block_hash)` observations.
    replay_guard: DedupCache,
    /// Terminal markers (`term:`) and relayed-once markers (`relayed:`).
    lifecycle_guard: DedupCache,
    /// TTL applied to counterpart-less inbound and relay halves.
    counterpart_ttl: Duration,
    metrics: Option<Arc<MonitorMetrics>>,
}

impl MatchingEngine {
    pub fn new(
        store: Arc<PendingStore>,
        counterpart_ttl: Duration,
        on_waypoint: WaypointCallback,
    ) -> Self {
        Self {
            store,
            mutex: Mutex::new(()),
            on_waypoint,
            replay_guard: DedupCache::new(REPLAY_GUARD_TTL, REPLAY_GUARD_CAPACITY),
            lifecycle_guard: DedupCache::new(LIFECYCLE_GUARD_TTL, LIFECYCLE_GUARD_CAPACITY),
            counterpart_ttl,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MonitorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// A sent leg was observed on the origin chain under `sub`.
    ///
    /// Always emits `Sent` on first sight, then joins any waiting relay or
    /// inbound counterpart, otherwise persists the half match for `ttl`.
    pub async fn on_outbound_message(&self, sub: &str, sent: XcmSentContext, ttl: Duration) {
        let _guard = self.mutex.lock().await;
        let hash = sent.message_hash;

        if self.lifecycle_guard.contains(&format!("term:{sub}:{hash}")) {
            debug!("[{}] {hash} already terminal for {sub}, ignoring sent leg", sent.origin);
            self.count_duplicate();
            return;
        }
        if !self
            .replay_guard
            .insert(format!("sent:{sub}:{hash}:{}", sent.block_hash))
        {
            debug!(
                "[{}] duplicate sent observation for {hash} at {}",
                sent.origin, sent.block_hash
            );
            self.count_duplicate();
            return;
        }

        self.emit(XcmNotifyMessage::Sent {
            subscription_id: sub.to_string(),
            sent: sent.clone(),
        });

        // A relay leg may have arrived first
        let rkey = relay_key(&hash, &sent.origin, &sent.destination);
        match self.store.get(Namespace::Relay, &rkey) {
            Ok(Some(entry)) => {
                if let PendingContext::Relayed(relayed) = entry.context.clone() {
                    if let Err(e) = self.store.delete(Namespace::Relay, &rkey) {
                        warn!("failed to delete relay entry {rkey}: {e}");
                    }
                    self.emit_relayed(&union(&entry.subscription_ids, sub), &sent, &relayed);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("relay lookup failed for {rkey}: {e}"),
        }

        // Out-of-order delivery: the inbound leg may already be waiting
        let okey = outbound_key(&hash, &sent.destination);
        match self.store.get(Namespace::Inbound, &okey) {
            Ok(Some(entry)) => {
                if let PendingContext::Received(received) = entry.context.clone() {
                    if let Err(e) = self.store.delete(Namespace::Inbound, &okey) {
                        warn!("failed to delete inbound entry {okey}: {e}");
                    }
                    self.emit_received(&union(&entry.subscription_ids, sub), &sent, &received);
                    self.update_pending_gauges();
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                // Retried at the next observation of this message
                warn!("inbound lookup failed for {okey}: {e}");
            }
        }

        let expires_at = now_millis() + ttl.as_millis() as u64;
        let mut subscription_ids = match self.store.get(Namespace::Outbound, &okey) {
            Ok(Some(existing)) => existing.subscription_ids,
            _ => BTreeSet::new(),
        };
        subscription_ids.insert(sub.to_string());
        let entry = PendingEntry {
            key: okey.clone(),
            context: PendingContext::Sent(sent),
            subscription_ids,
            expires_at,
        };
        if let Err(e) = self.store.put(Namespace::Outbound, &entry) {
            warn!("failed to persist outbound half for {okey}: {e}");
        }
        self.update_pending_gauges();
    }

    /// A received leg was observed on a destination chain under `sub`.
    pub async fn on_inbound_message(&self, sub: &str, inbound: XcmInbound) {
        let _guard = self.mutex.lock().await;
        let received = inbound.received;
        let hash = received.message_hash;

        if self.lifecycle_guard.contains(&format!("term:{sub}:{hash}")) {
            debug!(
                "[{}] {hash} already terminal for {sub}, ignoring received leg",
                inbound.chain
            );
            self.count_duplicate();
            return;
        }
        if !self
            .replay_guard
            .insert(format!("recv:{sub}:{hash}:{}", received.block_hash))
        {
            debug!(
                "[{}] duplicate received observation for {hash} at {}",
                inbound.chain, received.block_hash
            );
            self.count_duplicate();
            return;
        }

        let okey = outbound_key(&hash, &inbound.chain);
        match self.store.get(Namespace::Outbound, &okey) {
            Ok(Some(entry)) => {
                if let PendingContext::Sent(sent) = entry.context.clone() {
                    if let Err(e) = self.store.delete(Namespace::Outbound, &okey) {
                        warn!("failed to delete outbound entry {okey}: {e}");
                    }
                    self.emit_received(&union(&entry.subscription_ids, sub), &sent, &received);
                    self.update_pending_gauges();
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("outbound lookup failed for {okey}: {e}"),
        }

        // No sent leg yet: persist on the inbound side and wait
        let expires_at = now_millis() + self.counterpart_ttl.as_millis() as u64;
        let mut subscription_ids = match self.store.get(Namespace::Inbound, &okey) {
            Ok(Some(existing)) => existing.subscription_ids,
            _ => BTreeSet::new(),
        };
        subscription_ids.insert(sub.to_string());
        let entry = PendingEntry {
            key: okey.clone(),
            context: PendingContext::Received(received),
            subscription_ids,
            expires_at,
        };
        if let Err(e) = self.store.put(Namespace::Inbound, &entry) {
            warn!("failed to persist inbound half for {okey}: {e}");
        }
        self.update_pending_gauges();
    }

    /// A relay leg was observed on the relay chain under `sub`.
    ///
    /// Joining a waiting sent leg emits `Relayed` but keeps the outbound
    /// entry, since the received leg is still due.
    pub async fn on_relayed_message(&self, sub: &str, relayed: XcmRelayedContext) {
        let _guard = self.mutex.lock().await;
        let hash = relayed.message_hash;

        if self.lifecycle_guard.contains(&format!("term:{sub}:{hash}")) {
            debug!(
                "[{}] {hash} already terminal for {sub}, ignoring relay leg",
                relayed.origin
            );
            self.count_duplicate();
            return;
        }
        if !self
            .replay_guard
            .insert(format!("relay:{sub}:{hash}:{}", relayed.relay_block_hash))
        {
            debug!(
                "[{}] duplicate relay observation for {hash} at {}",
                relayed.origin, relayed.relay_block_hash
            );
            self.count_duplicate();
            return;
        }

        let okey = outbound_key(&hash, &relayed.destination);
        match self.store.get(Namespace::Outbound, &okey) {
            Ok(Some(entry)) => {
                if let PendingContext::Sent(sent) = entry.context.clone() {
                    self.emit_relayed(&union(&entry.subscription_ids, sub), &sent, &relayed);
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("outbound lookup failed for {okey}: {e}"),
        }

        let rkey = relay_key(&hash, &relayed.origin, &relayed.destination);
        let expires_at = now_millis() + self.counterpart_ttl.as_millis() as u64;
        let mut subscription_ids = match self.store.get(Namespace::Relay, &rkey) {
            Ok(Some(existing)) => existing.subscription_ids,
            _ => BTreeSet::new(),
        };
        subscription_ids.insert(sub.to_string());
        let entry = PendingEntry {
            key: rkey.clone(),
            context: PendingContext::Relayed(relayed),
            subscription_ids,
            expires_at,
        };
        if let Err(e) = self.store.put(Namespace::Relay, &entry) {
            warn!("failed to persist relay half for {rkey}: {e}");
        }
        self.update_pending_gauges();
    }

    /// Withdraw a subscription from all pending state. Touched hashes are
    /// marked terminal for this subscription so a counterpart arriving after
    /// the unsubscribe neither emits nor writes.
    pub async fn clear_pending_states(&self, sub: &str) {
        let _guard = self.mutex.lock().await;
        match self.store.clear_for_subscription(sub) {
            Ok(touched) => {
                for hash in &touched {
                    self.lifecycle_guard.insert(format!("term:{sub}:{hash}"));
                }
                if !touched.is_empty() {
                    info!(
                        "cleared {} pending entries for subscription {sub}",
                        touched.len()
                    );
                }
            }
            Err(e) => warn!("failed to clear pending state for {sub}: {e}"),
        }
        self.update_pending_gauges();
    }

    /// Reap expired entries. Sent halves time out with a notification;
    /// counterpart-less inbound/relay halves are dropped silently.
    pub async fn sweep(&self, now_ms: u64) {
        let _guard = self.mutex.lock().await;

        match self.store.iter_expired(Namespace::Outbound, now_ms) {
            Ok(expired) => {
                for entry in expired {
                    if let Err(e) = self.store.delete(Namespace::Outbound, &entry.key) {
                        warn!("sweep failed to delete {}: {e}", entry.key);
                        continue;
                    }
                    if let PendingContext::Sent(sent) = entry.context {
                        let hash = sent.message_hash;
                        for sub in &entry.subscription_ids {
                            if self.lifecycle_guard.insert(format!("term:{sub}:{hash}")) {
                                if let Some(m) = &self.metrics {
                                    m.timeouts_total.inc();
                                }
                                self.emit(XcmNotifyMessage::Timeout {
                                    subscription_id: sub.clone(),
                                    sent: sent.clone(),
                                });
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("sweep failed to scan outbound entries: {e}"),
        }

        for ns in [Namespace::Inbound, Namespace::Relay] {
            match self.store.iter_expired(ns, now_ms) {
                Ok(expired) => {
                    let reaped = expired.len();
                    for entry in expired {
                        if let Err(e) = self.store.delete(ns, &entry.key) {
                            warn!("sweep failed to delete {}: {e}", entry.key);
                        }
                    }
                    if reaped > 0 {
                        debug!("sweep reaped {reaped} {} halves", ns.as_str());
                    }
                }
                Err(e) => warn!("sweep failed to scan {} entries: {e}", ns.as_str()),
            }
        }
        self.update_pending_gauges();
    }

    /// Emit `Received` for every subscription that observed a leg, marking
    /// each terminal.
    fn emit_received(
        &self,
        subs: &BTreeSet<String>,
        sent: &XcmSentContext,
        received: &crate::types::XcmReceivedContext,
    ) {
        let hash = sent.message_hash;
        for sub in subs {
            if self.lifecycle_guard.insert(format!("term:{sub}:{hash}")) {
                if let Some(m) = &self.metrics {
                    m.matched_total.inc();
                }
                self.emit(XcmNotifyMessage::Received {
                    subscription_id: sub.clone(),
                    sent: sent.clone(),
                    received: received.clone(),
                });
            }
        }
    }

    /// Emit `Relayed` at most once per subscription and hash.
    fn emit_relayed(
        &self,
        subs: &BTreeSet<String>,
        sent: &XcmSentContext,
        relayed: &XcmRelayedContext,
    ) {
        let hash = sent.message_hash;
        for sub in subs {
            if self.lifecycle_guard.insert(format!("relayed:{sub}:{hash}")) {
                self.emit(XcmNotifyMessage::Relayed {
                    subscription_id: sub.clone(),
                    sent: sent.clone(),
                    relayed: relayed.clone(),
                });
            }
        }
    }

    fn emit(&self, msg: XcmNotifyMessage) {
        debug!(
            "waypoint {} for {} under {}",
            msg.event_type(),
            msg.message_hash(),
            msg.subscription_id()
        );
        if let Some(m) = &self.metrics {
            m.notifications_total
                .with_label_values(&[&msg.event_type().to_string().to_lowercase()])
                .inc();
        }
        // Emission failures must not abort the state transition; the
        // callback is expected to contain its own errors.
        (self.on_waypoint)(msg);
    }

    fn count_duplicate(&self) {
        if let Some(m) = &self.metrics {
            m.duplicates_total.inc();
        }
    }

    fn update_pending_gauges(&self) {
        if let Some(m) = &self.metrics {
            for ns in Namespace::ALL {
                m.pending_entries
                    .with_label_values(&[ns.as_str()])
                    .set(self.store.count(ns) as i64);
            }
        }
    }
}

fn union(subs: &BTreeSet<String>, extra: &str) -> BTreeSet<String> {
    let mut all = subs.clone();
    all.insert(extra.to_string());
    all
}
