// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable pending-state store.
//!
//! Three keyed namespaces (outbound, inbound, relay) over one backing sled
//! database, so all pending state coexists with the subscription records in
//! a single directory. Values are canonical JSON, self-describing via the
//! entry's `kind` tag. The store supplies no locking; the matching engine
//! serializes access.

use super::types::PendingEntry;
use crate::error::MonitorResult;
use crate::types::MessageHash;
use tracing::debug;

/// Logical namespace of a pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Outbound,
    Inbound,
    Relay,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Outbound, Namespace::Inbound, Namespace::Relay];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Outbound => "outbound",
            Namespace::Inbound => "inbound",
            Namespace::Relay => "relay",
        }
    }

    fn tree_name(&self) -> &'static str {
        match self {
            Namespace::Outbound => "pending_outbound",
            Namespace::Inbound => "pending_inbound",
            Namespace::Relay => "pending_relay",
        }
    }
}

/// Keyed map of pending half-matches, partitioned by namespace.
pub struct PendingStore {
    outbound: sled::Tree,
    inbound: sled::Tree,
    relay: sled::Tree,
}

impl PendingStore {
    pub fn new(db: &sled::Db) -> MonitorResult<Self> {
        Ok(Self {
            outbound: db.open_tree(Namespace::Outbound.tree_name())?,
            inbound: db.open_tree(Namespace::Inbound.tree_name())?,
            relay: db.open_tree(Namespace::Relay.tree_name())?,
        })
    }

    fn tree(&self, ns: Namespace) -> &sled::Tree {
        match ns {
            Namespace::Outbound => &self.outbound,
            Namespace::Inbound => &self.inbound,
            Namespace::Relay => &self.relay,
        }
    }

    pub fn get(&self, ns: Namespace, key: &str) -> MonitorResult<Option<PendingEntry>> {
        match self.tree(ns).get(key.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Unconditional upsert under the entry's own key.
    pub fn put(&self, ns: Namespace, entry: &PendingEntry) -> MonitorResult<()> {
        let raw = serde_json::to_vec(entry)?;
        self.tree(ns).insert(entry.key.as_bytes(), raw)?;
        Ok(())
    }

    /// Idempotent delete.
    pub fn delete(&self, ns: Namespace, key: &str) -> MonitorResult<()> {
        self.tree(ns).remove(key.as_bytes())?;
        Ok(())
    }

    /// Entries whose `expires_at` is at or before `now_ms`, in key order.
    pub fn iter_expired(&self, ns: Namespace, now_ms: u64) -> MonitorResult<Vec<PendingEntry>> {
        let mut expired = Vec::new();
        for item in self.tree(ns).iter() {
            let (_, raw) = item?;
            let entry: PendingEntry = serde_json::from_slice(&raw)?;
            if entry.expires_at <= now_ms {
                expired.push(entry);
            }
        }
        Ok(expired)
    }

    /// Withdraw `sub_id` from every entry; entries left with no subscribers
    /// are removed. Returns the message hashes of every touched entry so the
    /// caller can fence late counterparts.
    pub fn clear_for_subscription(&self, sub_id: &str) -> MonitorResult<Vec<MessageHash>> {
        let mut touched = Vec::new();
        let mut removed = 0;
        for ns in Namespace::ALL {
            let tree = self.tree(ns);
            let mut deletions: Vec<Vec<u8>> = Vec::new();
            let mut rewrites: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

            for item in tree.iter() {
                let (key, raw) = item?;
                let mut entry: PendingEntry = serde_json::from_slice(&raw)?;
                if !entry.subscription_ids.remove(sub_id) {
                    continue;
                }
                touched.push(entry.context.message_hash());
                if entry.subscription_ids.is_empty() {
                    deletions.push(key.to_vec());
                } else {
                    rewrites.push((key.to_vec(), serde_json::to_vec(&entry)?));
                }
            }
            for key in deletions {
                tree.remove(key)?;
                removed += 1;
            }
            for (key, raw) in rewrites {
                tree.insert(key, raw)?;
            }
        }
        debug!("deleted {removed} pending entries for subscription {sub_id}");
        Ok(touched)
    }

    pub fn count(&self, ns: Namespace) -> usize {
        self.tree(ns).len()
    }

    pub fn flush(&self) -> MonitorResult<()> {
        self.outbound.flush()?;
        self.inbound.flush()?;
        self.relay.flush()?;
        Ok(())
    }
}
