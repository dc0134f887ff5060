// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! XCM extraction contract.
//!
//! The binary-format decoders for the UMP/DMP/HRMP envelopes live outside
//! the monitor; what the core needs is a pure mapping from decoded block
//! content to the sent/received/relayed contexts. [`JsonFieldExtractor`]
//! implements that mapping over pre-decoded runtime events, which is what
//! the in-process block source delivers.

use crate::error::{MonitorError, MonitorResult};
use crate::ingress::{BlockEvent, ExtrinsicWithEvents};
use crate::types::{
    MessageHash, NetworkId, NetworkInfo, XcmOutcome, XcmReceivedContext, XcmRelayedContext,
    XcmSentContext,
};
use serde_json::Value;
use std::fmt;

/// Transport protocol an XCM message travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XcmProtocol {
    /// Upward: parachain to relay.
    Ump,
    /// Downward: relay to parachain.
    Dmp,
    /// Horizontal: parachain to parachain.
    Hrmp,
}

impl fmt::Display for XcmProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            XcmProtocol::Ump => "ump",
            XcmProtocol::Dmp => "dmp",
            XcmProtocol::Hrmp => "hrmp",
        };
        write!(f, "{name}")
    }
}

/// Outbound protocols a chain can emit on, by its relay/parachain identity.
pub fn outbound_protocols(origin: &NetworkInfo) -> Vec<XcmProtocol> {
    if origin.is_relay() {
        vec![XcmProtocol::Dmp]
    } else {
        vec![XcmProtocol::Ump, XcmProtocol::Hrmp]
    }
}

/// Inbound protocol for a leg: UMP when the destination is the relay, DMP
/// when the origin is, HRMP between parachains.
pub fn inbound_protocol(origin_is_relay: bool, destination_is_relay: bool) -> XcmProtocol {
    if destination_is_relay {
        XcmProtocol::Ump
    } else if origin_is_relay {
        XcmProtocol::Dmp
    } else {
        XcmProtocol::Hrmp
    }
}

/// Pure extraction functions from decoded block content to XCM contexts.
pub trait XcmExtractor: Send + Sync {
    /// XCM sends emitted by one extrinsic on the origin chain.
    fn extract_outbound(
        &self,
        protocol: XcmProtocol,
        origin: &NetworkId,
        xt: &ExtrinsicWithEvents,
    ) -> MonitorResult<Vec<XcmSentContext>>;

    /// The inbound execution record carried by one runtime event, if any.
    fn extract_inbound(
        &self,
        protocol: XcmProtocol,
        chain: &NetworkId,
        event: &BlockEvent,
    ) -> MonitorResult<Option<XcmReceivedContext>>;

    /// Horizontal messages carried through one relay-chain extrinsic.
    fn extract_relayed(
        &self,
        relay: &NetworkId,
        xt: &ExtrinsicWithEvents,
    ) -> MonitorResult<Vec<XcmRelayedContext>>;
}

/// Extractor over pre-decoded runtime events.
///
/// Recognizes the conventional pallet/event names and expects the decoder
/// to have surfaced hashes and recipients as JSON fields.
pub struct JsonFieldExtractor;

impl JsonFieldExtractor {
    pub fn new() -> Self {
        Self
    }

    fn parse_hash(data: &Value, field: &str) -> MonitorResult<MessageHash> {
        let raw = data
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| MonitorError::ExtractorDecode(format!("missing {field}")))?;
        raw.parse()
            .map_err(|e| MonitorError::ExtractorDecode(format!("bad {field}: {e}")))
    }

    fn parse_outcome(data: &Value) -> XcmOutcome {
        match data.get("outcome").and_then(|v| v.as_str()) {
            Some("Fail") => XcmOutcome::Fail,
            _ => XcmOutcome::Success,
        }
    }
}

impl XcmExtractor for JsonFieldExtractor {
    fn extract_outbound(
        &self,
        protocol: XcmProtocol,
        origin: &NetworkId,
        xt: &ExtrinsicWithEvents,
    ) -> MonitorResult<Vec<XcmSentContext>> {
        let (section, method) = match protocol {
            XcmProtocol::Hrmp => ("xcmpQueue", "XcmpMessageSent"),
            XcmProtocol::Ump => ("parachainSystem", "UpwardMessageSent"),
            XcmProtocol::Dmp => ("xcmPallet", "Sent"),
        };

        let mut sent = Vec::new();
        for event in &xt.events {
            if event.section != section || event.method != method {
                continue;
            }
            let message_hash = Self::parse_hash(&event.data, "messageHash")?;
            let message_id = match event.data.get("messageId").and_then(|v| v.as_str()) {
                Some(raw) => Some(raw.parse().map_err(|e| {
                    MonitorError::ExtractorDecode(format!("bad messageId: {e}"))
                })?),
                None => None,
            };
            let destination = event
                .data
                .get("recipient")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    MonitorError::ExtractorDecode(format!(
                        "{section}.{method} without recipient in {}",
                        xt.extrinsic_id
                    ))
                })?;
            sent.push(XcmSentContext {
                message_hash,
                message_id,
                origin: origin.clone(),
                destination: NetworkId::new(destination),
                sender: xt.signer.clone(),
                block_hash: xt.block_hash.clone(),
                block_number: xt.block_number,
                extrinsic_id: xt.extrinsic_id.clone(),
                sent_at: xt.timestamp_ms,
                outcome: Self::parse_outcome(&event.data),
            });
        }
        Ok(sent)
    }

    fn extract_inbound(
        &self,
        protocol: XcmProtocol,
        chain: &NetworkId,
        event: &BlockEvent,
    ) -> MonitorResult<Option<XcmReceivedContext>> {
        let matched = match protocol {
            XcmProtocol::Hrmp => {
                event.section == "xcmpQueue"
                    && (event.method == "Success" || event.method == "Fail")
            }
            XcmProtocol::Ump => event.section == "messageQueue" && event.method == "Processed",
            XcmProtocol::Dmp => {
                event.section == "dmpQueue" && event.method == "ExecutedDownward"
            }
        };
        if !matched {
            return Ok(None);
        }

        let message_hash = Self::parse_hash(&event.data, "messageHash")?;
        let outcome = if event.method == "Fail" {
            XcmOutcome::Fail
        } else {
            Self::parse_outcome(&event.data)
        };
        let error = event
            .data
            .get("error")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Ok(Some(XcmReceivedContext {
            message_hash,
            destination: chain.clone(),
            block_hash: event.block_hash.clone(),
            block_number: event.block_number,
            outcome,
            error,
        }))
    }

    fn extract_relayed(
        &self,
        relay: &NetworkId,
        xt: &ExtrinsicWithEvents,
    ) -> MonitorResult<Vec<XcmRelayedContext>> {
        if xt.call_section != "paraInherent" || xt.call_method != "enter" {
            return Ok(vec![]);
        }
        let messages = match xt.args.get("horizontalMessages").and_then(|v| v.as_array()) {
            Some(list) => list,
            None => return Ok(vec![]),
        };

        let mut relayed = Vec::with_capacity(messages.len());
        for msg in messages {
            let message_hash = Self::parse_hash(msg, "messageHash")?;
            let origin = msg.get("origin").and_then(|v| v.as_str()).ok_or_else(|| {
                MonitorError::ExtractorDecode(format!(
                    "horizontal message without origin in {} on {relay}",
                    xt.extrinsic_id
                ))
            })?;
            let destination = msg
                .get("destination")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    MonitorError::ExtractorDecode(format!(
                        "horizontal message without destination in {} on {relay}",
                        xt.extrinsic_id
                    ))
                })?;
            relayed.push(XcmRelayedContext {
                message_hash,
                origin: NetworkId::new(origin),
                destination: NetworkId::new(destination),
                relay_block_hash: xt.block_hash.clone(),
                relay_block_number: xt.block_number,
            });
        }
        Ok(relayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NetworkKind, AccountKey};
    use serde_json::json;

    fn hash_hex(byte: u8) -> String {
        format!("0x{}", hex::encode([byte; 32]))
    }

    fn xt_with_events(events: Vec<BlockEvent>) -> ExtrinsicWithEvents {
        ExtrinsicWithEvents {
            chain: NetworkId::new("urn:ocn:polkadot:1000"),
            block_hash: "0xb1".to_string(),
            block_number: 42,
            extrinsic_id: "42-1".to_string(),
            timestamp_ms: 1_700_000_000_000,
            signer: Some(AccountKey {
                id: "addrA".to_string(),
                public_key: "0xpubA".to_string(),
            }),
            extra_signers: vec![],
            call_section: "polkadotXcm".to_string(),
            call_method: "limitedReserveTransferAssets".to_string(),
            args: json!({}),
            events,
        }
    }

    fn sent_event(section: &str, method: &str, data: Value) -> BlockEvent {
        BlockEvent {
            chain: NetworkId::new("urn:ocn:polkadot:1000"),
            block_hash: "0xb1".to_string(),
            block_number: 42,
            index: 3,
            section: section.to_string(),
            method: method.to_string(),
            data,
        }
    }

    #[test]
    fn test_outbound_protocol_table() {
        let relay = NetworkInfo {
            id: NetworkId::new("urn:ocn:polkadot:0"),
            kind: NetworkKind::Relay,
        };
        let para = NetworkInfo {
            id: NetworkId::new("urn:ocn:polkadot:1000"),
            kind: NetworkKind::Parachain {
                relay: NetworkId::new("urn:ocn:polkadot:0"),
            },
        };
        assert_eq!(outbound_protocols(&relay), vec![XcmProtocol::Dmp]);
        assert_eq!(
            outbound_protocols(&para),
            vec![XcmProtocol::Ump, XcmProtocol::Hrmp]
        );
    }

    #[test]
    fn test_inbound_protocol_table() {
        assert_eq!(inbound_protocol(false, true), XcmProtocol::Ump);
        assert_eq!(inbound_protocol(true, false), XcmProtocol::Dmp);
        assert_eq!(inbound_protocol(false, false), XcmProtocol::Hrmp);
    }

    #[test]
    fn test_extract_outbound_hrmp() {
        let extractor = JsonFieldExtractor::new();
        let xt = xt_with_events(vec![sent_event(
            "xcmpQueue",
            "XcmpMessageSent",
            json!({
                "messageHash": hash_hex(0xaa),
                "recipient": "urn:ocn:polkadot:2004"
            }),
        )]);
        let sent = extractor
            .extract_outbound(
                XcmProtocol::Hrmp,
                &NetworkId::new("urn:ocn:polkadot:1000"),
                &xt,
            )
            .unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, NetworkId::new("urn:ocn:polkadot:2004"));
        assert_eq!(sent[0].sender.as_ref().unwrap().id, "addrA");
        assert_eq!(sent[0].outcome, XcmOutcome::Success);
    }

    #[test]
    fn test_extract_outbound_ignores_other_protocols() {
        let extractor = JsonFieldExtractor::new();
        let xt = xt_with_events(vec![sent_event(
            "xcmpQueue",
            "XcmpMessageSent",
            json!({
                "messageHash": hash_hex(0xaa),
                "recipient": "urn:ocn:polkadot:2004"
            }),
        )]);
        let sent = extractor
            .extract_outbound(
                XcmProtocol::Ump,
                &NetworkId::new("urn:ocn:polkadot:1000"),
                &xt,
            )
            .unwrap();
        assert!(sent.is_empty());
    }

    #[test]
    fn test_extract_outbound_missing_hash_is_decode_error() {
        let extractor = JsonFieldExtractor::new();
        let xt = xt_with_events(vec![sent_event(
            "xcmpQueue",
            "XcmpMessageSent",
            json!({"recipient": "urn:ocn:polkadot:2004"}),
        )]);
        let err = extractor
            .extract_outbound(
                XcmProtocol::Hrmp,
                &NetworkId::new("urn:ocn:polkadot:1000"),
                &xt,
            )
            .unwrap_err();
        assert_eq!(err.error_type(), "extractor_decode");
    }

    #[test]
    fn test_extract_inbound_hrmp_fail_carries_error() {
        let extractor = JsonFieldExtractor::new();
        let event = sent_event(
            "xcmpQueue",
            "Fail",
            json!({
                "messageHash": hash_hex(0xbb),
                "error": "UntrustedReserveLocation"
            }),
        );
        let received = extractor
            .extract_inbound(
                XcmProtocol::Hrmp,
                &NetworkId::new("urn:ocn:polkadot:2004"),
                &event,
            )
            .unwrap()
            .unwrap();
        assert_eq!(received.outcome, XcmOutcome::Fail);
        assert_eq!(received.error.as_deref(), Some("UntrustedReserveLocation"));
    }

    #[test]
    fn test_extract_relayed_from_para_inherent() {
        let extractor = JsonFieldExtractor::new();
        let mut xt = xt_with_events(vec![]);
        xt.call_section = "paraInherent".to_string();
        xt.call_method = "enter".to_string();
        xt.args = json!({
            "horizontalMessages": [{
                "messageHash": hash_hex(0xcc),
                "origin": "urn:ocn:polkadot:1000",
                "destination": "urn:ocn:polkadot:2004"
            }]
        });
        let relayed = extractor
            .extract_relayed(&NetworkId::new("urn:ocn:polkadot:0"), &xt)
            .unwrap();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].origin, NetworkId::new("urn:ocn:polkadot:1000"));
        assert_eq!(relayed[0].relay_block_number, 42);
    }

    #[test]
    fn test_extract_relayed_ignores_other_calls() {
        let extractor = JsonFieldExtractor::new();
        let xt = xt_with_events(vec![]);
        let relayed = extractor
            .extract_relayed(&NetworkId::new("urn:ocn:polkadot:0"), &xt)
            .unwrap();
        assert!(relayed.is_empty());
    }
}
