// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mutable content filters over structured records.
//!
//! A [`ControlQuery`] wraps a boolean combination of field tests (`$eq`,
//! `$in`, `$or`) that observers evaluate against JSON records. The
//! switchboard swaps the criteria in place when subscription criteria
//! mutate; in-flight events evaluate whatever version is current.

use crate::types::{NetworkId, SendersSpec};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::RwLock;

/// A boolean combination of field tests. Field paths are dot-separated;
/// a path segment that lands on an array tests every element.
#[derive(Debug, Clone, PartialEq)]
pub enum Criteria {
    /// Matches every record.
    Always,
    /// Matches no record.
    Never,
    /// `$eq`: the field resolves to this exact value.
    Eq { field: String, value: Value },
    /// `$in`: the field resolves to a string in this set.
    In {
        field: String,
        values: HashSet<String>,
    },
    /// `$or`: any branch matches.
    Or(Vec<Criteria>),
}

impl Criteria {
    pub fn evaluate(&self, record: &Value) -> bool {
        match self {
            Criteria::Always => true,
            Criteria::Never => false,
            Criteria::Eq { field, value } => {
                collect_values(record, field).iter().any(|v| *v == value)
            }
            Criteria::In { field, values } => collect_values(record, field)
                .iter()
                .any(|v| v.as_str().map(|s| values.contains(s)).unwrap_or(false)),
            Criteria::Or(branches) => branches.iter().any(|c| c.evaluate(record)),
        }
    }
}

/// Resolve a dotted path against a record, flattening arrays along the way.
fn collect_values<'a>(record: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![record];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => {
                    if let Some(v) = map.get(segment) {
                        next.push(v);
                    }
                }
                Value::Array(items) => {
                    for item in items {
                        if let Some(v) = item.get(segment) {
                            next.push(v);
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
        if current.is_empty() {
            break;
        }
    }
    // Flatten a trailing array so membership tests see its elements
    let mut flat = Vec::with_capacity(current.len());
    for value in current {
        match value {
            Value::Array(items) => flat.extend(items.iter()),
            other => flat.push(other),
        }
    }
    flat
}

/// Thread-safe, swappable criteria. An evaluation sees either the previous
/// or the new criteria, never a torn state.
#[derive(Debug)]
pub struct ControlQuery {
    criteria: RwLock<Criteria>,
}

impl ControlQuery {
    pub fn new(criteria: Criteria) -> Self {
        Self {
            criteria: RwLock::new(criteria),
        }
    }

    pub fn evaluate(&self, record: &Value) -> bool {
        self.criteria.read().unwrap().evaluate(record)
    }

    /// Atomically replace the criteria.
    pub fn change(&self, criteria: Criteria) {
        *self.criteria.write().unwrap() = criteria;
    }

    pub fn snapshot(&self) -> Criteria {
        self.criteria.read().unwrap().clone()
    }
}

/// Sender control derived from a subscription's `senders`: tests signer and
/// extra-signer membership in both address and public-key form.
pub fn senders_criteria(spec: &SendersSpec) -> Criteria {
    match spec {
        SendersSpec::Any => Criteria::Always,
        SendersSpec::Accounts(accounts) if accounts.is_empty() => Criteria::Never,
        SendersSpec::Accounts(accounts) => {
            let values: HashSet<String> = accounts.iter().cloned().collect();
            Criteria::Or(
                [
                    "extrinsic.signer.id",
                    "extrinsic.signer.publicKey",
                    "extrinsic.extraSigners.id",
                    "extrinsic.extraSigners.publicKey",
                ]
                .iter()
                .map(|field| Criteria::In {
                    field: field.to_string(),
                    values: values.clone(),
                })
                .collect(),
            )
        }
    }
}

/// Message control derived from a subscription's `destinations`: tests
/// recipient membership.
pub fn destinations_criteria(destinations: &[NetworkId]) -> Criteria {
    Criteria::In {
        field: "recipient".to_string(),
        values: destinations.iter().map(|d| d.as_str().to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_eq_on_nested_field() {
        let c = Criteria::Eq {
            field: "extrinsic.signer.id".to_string(),
            value: json!("alice"),
        };
        assert!(c.evaluate(&json!({"extrinsic": {"signer": {"id": "alice"}}})));
        assert!(!c.evaluate(&json!({"extrinsic": {"signer": {"id": "bob"}}})));
        assert!(!c.evaluate(&json!({"extrinsic": {}})));
    }

    #[test]
    fn test_in_over_array_field() {
        let c = Criteria::In {
            field: "extrinsic.extraSigners.id".to_string(),
            values: ["carol".to_string()].into_iter().collect(),
        };
        let record = json!({
            "extrinsic": {
                "extraSigners": [{"id": "dave"}, {"id": "carol"}]
            }
        });
        assert!(c.evaluate(&record));
        assert!(!c.evaluate(&json!({"extrinsic": {"extraSigners": [{"id": "dave"}]}})));
    }

    #[test]
    fn test_or_combination() {
        let c = Criteria::Or(vec![
            Criteria::Eq {
                field: "recipient".to_string(),
                value: json!("urn:ocn:polkadot:2004"),
            },
            Criteria::Eq {
                field: "recipient".to_string(),
                value: json!("urn:ocn:polkadot:2000"),
            },
        ]);
        assert!(c.evaluate(&json!({"recipient": "urn:ocn:polkadot:2000"})));
        assert!(!c.evaluate(&json!({"recipient": "urn:ocn:polkadot:1000"})));
    }

    #[test]
    fn test_change_swaps_atomically() {
        let query = ControlQuery::new(Criteria::In {
            field: "recipient".to_string(),
            values: ["urn:ocn:polkadot:2004".to_string()].into_iter().collect(),
        });
        let to_2000 = json!({"recipient": "urn:ocn:polkadot:2000"});
        assert!(!query.evaluate(&to_2000));

        query.change(Criteria::In {
            field: "recipient".to_string(),
            values: [
                "urn:ocn:polkadot:2004".to_string(),
                "urn:ocn:polkadot:2000".to_string(),
            ]
            .into_iter()
            .collect(),
        });
        assert!(query.evaluate(&to_2000));
    }

    #[test]
    fn test_senders_criteria_wildcard_and_empty() {
        assert_eq!(senders_criteria(&SendersSpec::Any), Criteria::Always);
        assert_eq!(
            senders_criteria(&SendersSpec::Accounts(vec![])),
            Criteria::Never
        );
    }

    #[test]
    fn test_senders_criteria_matches_either_form() {
        let c = senders_criteria(&SendersSpec::Accounts(vec![
            "addrA".to_string(),
            "0xpubB".to_string(),
        ]));
        // Address form on the signer
        assert!(c.evaluate(&json!({
            "extrinsic": {"signer": {"id": "addrA", "publicKey": "0xother"}}
        })));
        // Public-key form on an extra signer
        assert!(c.evaluate(&json!({
            "extrinsic": {
                "signer": {"id": "someone", "publicKey": "0xelse"},
                "extraSigners": [{"id": "x", "publicKey": "0xpubB"}]
            }
        })));
        assert!(!c.evaluate(&json!({
            "extrinsic": {"signer": {"id": "stranger", "publicKey": "0xnope"}}
        })));
    }

    #[test]
    fn test_destinations_criteria() {
        let c = destinations_criteria(&[
            NetworkId::new("urn:ocn:polkadot:2004"),
            NetworkId::new("urn:ocn:polkadot:0"),
        ]);
        assert!(c.evaluate(&json!({"recipient": "urn:ocn:polkadot:0"})));
        assert!(!c.evaluate(&json!({"recipient": "urn:ocn:polkadot:2000"})));
    }
}
