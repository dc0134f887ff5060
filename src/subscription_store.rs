// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable subscription descriptors.
//!
//! One keyed tree in the shared backing database. Ephemeral subscriptions
//! never reach this store; everything in here is reloaded and monitored
//! again on startup.

use crate::error::MonitorResult;
use crate::types::{NetworkId, Subscription};

const SUBSCRIPTIONS_TREE: &str = "subscriptions";

pub struct SubscriptionStore {
    tree: sled::Tree,
}

impl SubscriptionStore {
    pub fn new(db: &sled::Db) -> MonitorResult<Self> {
        Ok(Self {
            tree: db.open_tree(SUBSCRIPTIONS_TREE)?,
        })
    }

    pub fn insert(&self, sub: &Subscription) -> MonitorResult<()> {
        let raw = serde_json::to_vec(sub)?;
        self.tree.insert(sub.id.as_bytes(), raw)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Idempotent removal.
    pub fn remove(&self, id: &str) -> MonitorResult<()> {
        self.tree.remove(id.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    pub fn get_by_id(&self, id: &str) -> MonitorResult<Option<Subscription>> {
        match self.tree.get(id.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Every descriptor that involves `chain` as origin or destination.
    pub fn get_by_network(&self, chain: &NetworkId) -> MonitorResult<Vec<Subscription>> {
        let mut matches = Vec::new();
        for item in self.tree.iter() {
            let (_, raw) = item?;
            let sub: Subscription = serde_json::from_slice(&raw)?;
            if sub.origin == *chain || sub.destinations.contains(chain) {
                matches.push(sub);
            }
        }
        Ok(matches)
    }

    pub fn list(&self) -> MonitorResult<Vec<Subscription>> {
        let mut all = Vec::new();
        for item in self.tree.iter() {
            let (_, raw) = item?;
            all.push(serde_json::from_slice(&raw)?);
        }
        Ok(all)
    }

    pub fn count(&self) -> usize {
        self.tree.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventsSpec, SendersSpec, DEFAULT_OUTBOUND_TTL_MS};

    fn store() -> SubscriptionStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SubscriptionStore::new(&db).unwrap()
    }

    fn sub(id: &str, origin: &str, dest: &str) -> Subscription {
        Subscription {
            id: id.to_string(),
            origin: NetworkId::new(origin),
            senders: SendersSpec::Any,
            destinations: vec![NetworkId::new(dest)],
            events: EventsSpec::Any,
            ephemeral: false,
            outbound_ttl: DEFAULT_OUTBOUND_TTL_MS,
        }
    }

    #[test]
    fn test_crud_round_trip() {
        let store = store();
        let s = sub("s1", "urn:ocn:polkadot:1000", "urn:ocn:polkadot:2004");

        store.insert(&s).unwrap();
        assert_eq!(store.get_by_id("s1").unwrap().unwrap(), s);
        assert_eq!(store.count(), 1);

        store.remove("s1").unwrap();
        assert!(store.get_by_id("s1").unwrap().is_none());
        // Idempotent
        store.remove("s1").unwrap();
    }

    #[test]
    fn test_get_by_network_matches_origin_and_destination() {
        let store = store();
        store
            .insert(&sub("a", "urn:ocn:polkadot:1000", "urn:ocn:polkadot:2004"))
            .unwrap();
        store
            .insert(&sub("b", "urn:ocn:polkadot:2004", "urn:ocn:polkadot:0"))
            .unwrap();
        store
            .insert(&sub("c", "urn:ocn:polkadot:0", "urn:ocn:polkadot:1000"))
            .unwrap();

        let para = NetworkId::new("urn:ocn:polkadot:2004");
        let mut ids: Vec<String> = store
            .get_by_network(&para)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_insert_overwrites_same_id() {
        let store = store();
        store
            .insert(&sub("s1", "urn:ocn:polkadot:1000", "urn:ocn:polkadot:2004"))
            .unwrap();
        let mut updated = sub("s1", "urn:ocn:polkadot:1000", "urn:ocn:polkadot:2004");
        updated.ephemeral = false;
        updated.outbound_ttl = 1_000;
        store.insert(&updated).unwrap();

        assert_eq!(store.count(), 1);
        assert_eq!(store.get_by_id("s1").unwrap().unwrap().outbound_ttl, 1_000);
    }
}
