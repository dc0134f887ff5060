// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pending half-match records and their key conventions.

use crate::types::{
    MessageHash, NetworkId, XcmReceivedContext, XcmRelayedContext, XcmSentContext,
};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Key a sent or received leg is stored and looked up under.
pub fn outbound_key(hash: &MessageHash, destination: &NetworkId) -> String {
    format!("{hash}:{destination}")
}

/// Key a relay leg is stored and looked up under.
pub fn relay_key(hash: &MessageHash, origin: &NetworkId, destination: &NetworkId) -> String {
    format!("{hash}:{origin}:{destination}")
}

/// The surviving context of a half-observed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PendingContext {
    Sent(XcmSentContext),
    Received(XcmReceivedContext),
    Relayed(XcmRelayedContext),
}

impl PendingContext {
    pub fn kind(&self) -> &'static str {
        match self {
            PendingContext::Sent(_) => "sent",
            PendingContext::Received(_) => "received",
            PendingContext::Relayed(_) => "relayed",
        }
    }

    pub fn message_hash(&self) -> MessageHash {
        match self {
            PendingContext::Sent(c) => c.message_hash,
            PendingContext::Received(c) => c.message_hash,
            PendingContext::Relayed(c) => c.message_hash,
        }
    }
}

/// A persisted half-match awaiting its counterpart or expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub key: String,
    #[serde(flatten)]
    pub context: PendingContext,
    pub subscription_ids: BTreeSet<String>,
    /// Unix milliseconds after which the sweep reaps this entry.
    pub expires_at: u64,
}

impl PendingEntry {
    pub fn new(
        key: String,
        context: PendingContext,
        subscription_id: &str,
        expires_at: u64,
    ) -> Self {
        let mut subscription_ids = BTreeSet::new();
        subscription_ids.insert(subscription_id.to_string());
        Self {
            key,
            context,
            subscription_ids,
            expires_at,
        }
    }
}

/// Bounded TTL'd set of already-seen keys.
///
/// Backs the engine's replay suppression and the at-most-once guards for
/// terminal notifications. Entries expire after the TTL; when the cache is
/// full the oldest entry is evicted, so the guarantees are best-effort over
/// the retention window.
#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    capacity: usize,
    seen: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `key`; returns true the first time it is seen within the TTL.
    pub fn insert(&self, key: String) -> bool {
        let mut seen = self.seen.lock().unwrap();
        let now = Instant::now();

        if seen.len() >= self.capacity {
            let ttl = self.ttl;
            seen.retain(|_, at| now.duration_since(*at) < ttl);
        }
        if seen.len() >= self.capacity {
            if let Some(oldest) = seen
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(k, _)| k.clone())
            {
                seen.remove(&oldest);
            }
        }

        match seen.entry(key) {
            Entry::Occupied(mut slot) => {
                if now.duration_since(*slot.get()) < self.ttl {
                    false
                } else {
                    slot.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let seen = self.seen.lock().unwrap();
        seen.get(key)
            .map(|at| at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
