// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Core data model: network identities, subscription descriptors and the
//! lifecycle contexts observed for each XCM message.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::MonitorError;

/// Default time a sent leg waits for its counterpart: 6 hours.
pub const DEFAULT_OUTBOUND_TTL_MS: u64 = 21_600_000;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Opaque URN identifying a chain within a consensus system,
/// e.g. `urn:ocn:polkadot:0`. Equality is textual.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(String);

impl NetworkId {
    pub fn new(urn: impl Into<String>) -> Self {
        Self(urn.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NetworkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Whether a network is a relay chain or a parachain bound to one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkKind {
    Relay,
    Parachain { relay: NetworkId },
}

/// A network known to the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: NetworkId,
    pub kind: NetworkKind,
}

impl NetworkInfo {
    pub fn is_relay(&self) -> bool {
        matches!(self.kind, NetworkKind::Relay)
    }

    /// The relay chain this network settles through. A relay is its own relay.
    pub fn relay(&self) -> &NetworkId {
        match &self.kind {
            NetworkKind::Relay => &self.id,
            NetworkKind::Parachain { relay } => relay,
        }
    }
}

/// The set of networks the monitor is configured to observe.
#[derive(Debug, Clone, Default)]
pub struct NetworkRegistry {
    networks: HashMap<NetworkId, NetworkInfo>,
}

impl NetworkRegistry {
    pub fn new(networks: Vec<NetworkInfo>) -> Self {
        Self {
            networks: networks.into_iter().map(|n| (n.id.clone(), n)).collect(),
        }
    }

    pub fn get(&self, id: &NetworkId) -> Option<&NetworkInfo> {
        self.networks.get(id)
    }

    pub fn contains(&self, id: &NetworkId) -> bool {
        self.networks.contains_key(id)
    }

    pub fn is_relay(&self, id: &NetworkId) -> bool {
        self.get(id).map(|n| n.is_relay()).unwrap_or(false)
    }

    /// Relay chain for `id`, if the network is known.
    pub fn relay_of(&self, id: &NetworkId) -> Option<NetworkId> {
        self.get(id).map(|n| n.relay().clone())
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

/// 32-byte message hash, rendered as `0x`-prefixed hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHash(pub [u8; 32]);

impl MessageHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MessageHash {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim_start_matches("0x");
        let bytes = hex::decode(raw)
            .map_err(|e| MonitorError::Generic(format!("invalid message hash {s}: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MonitorError::Generic(format!("message hash {s} is not 32 bytes")))?;
        Ok(Self(arr))
    }
}

impl Serialize for MessageHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// An account in both of its accepted forms: the chain address and the raw
/// public key hex. Sender filters accept either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountKey {
    pub id: String,
    pub public_key: String,
}

/// Sender criteria of a subscription: the `"*"` wildcard or a finite set of
/// account identifiers. An explicit empty set matches nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendersSpec {
    Any,
    Accounts(Vec<String>),
}

impl Serialize for SendersSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SendersSpec::Any => serializer.serialize_str("*"),
            SendersSpec::Accounts(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for SendersSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) if s == "*" => Ok(SendersSpec::Any),
            serde_json::Value::Array(items) => {
                let mut accounts = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        serde_json::Value::String(s) => accounts.push(s),
                        other => {
                            return Err(D::Error::custom(format!(
                                "senders entries must be strings, got {other}"
                            )))
                        }
                    }
                }
                Ok(SendersSpec::Accounts(accounts))
            }
            other => Err(D::Error::custom(format!(
                "senders must be \"*\" or an array, got {other}"
            ))),
        }
    }
}

/// Lifecycle event kinds observable for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum XcmEventType {
    Sent,
    Received,
    Relayed,
    Timeout,
    Hop,
}

impl fmt::Display for XcmEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            XcmEventType::Sent => "Sent",
            XcmEventType::Received => "Received",
            XcmEventType::Relayed => "Relayed",
            XcmEventType::Timeout => "Timeout",
            XcmEventType::Hop => "Hop",
        };
        write!(f, "{name}")
    }
}

/// Event criteria of a subscription: the `"*"` wildcard or a subset of kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventsSpec {
    Any,
    Only(BTreeSet<XcmEventType>),
}

impl EventsSpec {
    pub fn admits(&self, kind: XcmEventType) -> bool {
        match self {
            EventsSpec::Any => true,
            EventsSpec::Only(set) => set.contains(&kind),
        }
    }
}

impl Default for EventsSpec {
    fn default() -> Self {
        EventsSpec::Any
    }
}

impl Serialize for EventsSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EventsSpec::Any => serializer.serialize_str("*"),
            EventsSpec::Only(set) => set.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for EventsSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) if s == "*" => Ok(EventsSpec::Any),
            serde_json::Value::Array(items) => {
                let set: BTreeSet<XcmEventType> =
                    serde_json::from_value(serde_json::Value::Array(items))
                        .map_err(D::Error::custom)?;
                Ok(EventsSpec::Only(set))
            }
            other => Err(D::Error::custom(format!(
                "events must be \"*\" or an array, got {other}"
            ))),
        }
    }
}

fn default_outbound_ttl() -> u64 {
    DEFAULT_OUTBOUND_TTL_MS
}

/// A subscription descriptor, as accepted and returned on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub origin: NetworkId,
    pub senders: SendersSpec,
    pub destinations: Vec<NetworkId>,
    #[serde(default)]
    pub events: EventsSpec,
    #[serde(default)]
    pub ephemeral: bool,
    /// Outbound leg time-to-live, milliseconds.
    #[serde(rename = "outboundTTL", default = "default_outbound_ttl")]
    pub outbound_ttl: u64,
}

impl Subscription {
    /// Structural validation against the configured network table.
    pub fn validate(&self, networks: &NetworkRegistry) -> Result<(), MonitorError> {
        if self.id.is_empty() {
            return Err(MonitorError::InvalidSubscription(
                "subscription id must not be empty".to_string(),
            ));
        }
        if !networks.contains(&self.origin) {
            return Err(MonitorError::InvalidSubscription(format!(
                "unknown origin network {}",
                self.origin
            )));
        }
        if self.destinations.is_empty() {
            return Err(MonitorError::InvalidSubscription(
                "destinations must not be empty".to_string(),
            ));
        }
        for dest in &self.destinations {
            if !networks.contains(dest) {
                return Err(MonitorError::InvalidSubscription(format!(
                    "unknown destination network {dest}"
                )));
            }
            if *dest == self.origin {
                return Err(MonitorError::InvalidSubscription(format!(
                    "origin {} must not appear in destinations",
                    self.origin
                )));
            }
        }
        if self.outbound_ttl == 0 {
            return Err(MonitorError::InvalidSubscription(
                "outboundTTL must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Execution outcome recorded with a sent or received leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XcmOutcome {
    Success,
    Fail,
}

/// Origin-side observation of an XCM message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XcmSentContext {
    pub message_hash: MessageHash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageHash>,
    pub origin: NetworkId,
    pub destination: NetworkId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<AccountKey>,
    pub block_hash: String,
    pub block_number: u64,
    pub extrinsic_id: String,
    pub sent_at: u64,
    pub outcome: XcmOutcome,
}

/// Destination-side observation of an XCM message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XcmReceivedContext {
    pub message_hash: MessageHash,
    pub destination: NetworkId,
    pub block_hash: String,
    pub block_number: u64,
    pub outcome: XcmOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Relay-chain observation of an XCM message in transit between parachains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XcmRelayedContext {
    pub message_hash: MessageHash,
    pub origin: NetworkId,
    pub destination: NetworkId,
    pub relay_block_hash: String,
    pub relay_block_number: u64,
}

/// Inbound observation paired with the chain it was seen on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XcmInbound {
    pub chain: NetworkId,
    pub received: XcmReceivedContext,
}

/// A lifecycle notification emitted by the matching engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum XcmNotifyMessage {
    #[serde(rename_all = "camelCase")]
    Sent {
        subscription_id: String,
        sent: XcmSentContext,
    },
    #[serde(rename_all = "camelCase")]
    Received {
        subscription_id: String,
        sent: XcmSentContext,
        received: XcmReceivedContext,
    },
    #[serde(rename_all = "camelCase")]
    Relayed {
        subscription_id: String,
        sent: XcmSentContext,
        relayed: XcmRelayedContext,
    },
    #[serde(rename_all = "camelCase")]
    Timeout {
        subscription_id: String,
        sent: XcmSentContext,
    },
    #[serde(rename_all = "camelCase")]
    Hop {
        subscription_id: String,
        sent: XcmSentContext,
        relayed: XcmRelayedContext,
    },
}

impl XcmNotifyMessage {
    pub fn subscription_id(&self) -> &str {
        match self {
            XcmNotifyMessage::Sent { subscription_id, .. }
            | XcmNotifyMessage::Received { subscription_id, .. }
            | XcmNotifyMessage::Relayed { subscription_id, .. }
            | XcmNotifyMessage::Timeout { subscription_id, .. }
            | XcmNotifyMessage::Hop { subscription_id, .. } => subscription_id,
        }
    }

    pub fn event_type(&self) -> XcmEventType {
        match self {
            XcmNotifyMessage::Sent { .. } => XcmEventType::Sent,
            XcmNotifyMessage::Received { .. } => XcmEventType::Received,
            XcmNotifyMessage::Relayed { .. } => XcmEventType::Relayed,
            XcmNotifyMessage::Timeout { .. } => XcmEventType::Timeout,
            XcmNotifyMessage::Hop { .. } => XcmEventType::Hop,
        }
    }

    pub fn message_hash(&self) -> MessageHash {
        match self {
            XcmNotifyMessage::Sent { sent, .. }
            | XcmNotifyMessage::Received { sent, .. }
            | XcmNotifyMessage::Relayed { sent, .. }
            | XcmNotifyMessage::Timeout { sent, .. }
            | XcmNotifyMessage::Hop { sent, .. } => sent.message_hash,
        }
    }

    /// The message sender, when known. Re-checked against the subscription's
    /// senders filter at fan-out.
    pub fn sender(&self) -> Option<&AccountKey> {
        match self {
            XcmNotifyMessage::Sent { sent, .. }
            | XcmNotifyMessage::Received { sent, .. }
            | XcmNotifyMessage::Relayed { sent, .. }
            | XcmNotifyMessage::Timeout { sent, .. }
            | XcmNotifyMessage::Hop { sent, .. } => sent.sender.as_ref(),
        }
    }
}
