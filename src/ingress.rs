// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Block-source contract.
//!
//! Chain connectivity lives outside the monitor: whatever speaks to the
//! chains exposes one hot stream of finalized blocks per network plus
//! on-demand storage reads. The monitor consumes decoded blocks and never
//! replays missed ones; the source is authoritative.

use crate::error::{MonitorError, MonitorResult};
use crate::types::{AccountKey, NetworkId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Depth of each per-subscriber finalized-block channel.
pub const BLOCK_CHANNEL_SIZE: usize = 64;

/// One decoded runtime event, annotated with its position in the block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockEvent {
    pub chain: NetworkId,
    pub block_hash: String,
    pub block_number: u64,
    /// Event index within the block.
    pub index: u32,
    pub section: String,
    pub method: String,
    pub data: serde_json::Value,
}

/// One decoded extrinsic with the events it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtrinsicWithEvents {
    pub chain: NetworkId,
    pub block_hash: String,
    pub block_number: u64,
    /// Position id in `<block-number>-<index>` form.
    pub extrinsic_id: String,
    pub timestamp_ms: u64,
    pub signer: Option<AccountKey>,
    pub extra_signers: Vec<AccountKey>,
    pub call_section: String,
    pub call_method: String,
    pub args: serde_json::Value,
    pub events: Vec<BlockEvent>,
}

/// A finalized block with its extrinsics and event annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedBlockWithEvents {
    pub chain: NetworkId,
    pub block_hash: String,
    pub block_number: u64,
    pub parent_hash: String,
    pub timestamp_ms: u64,
    pub author: Option<String>,
    pub extrinsics: Vec<ExtrinsicWithEvents>,
    /// Every event in the block, in index order (includes extrinsic events).
    pub events: Vec<BlockEvent>,
}

/// Contract the chain-connectivity layer fulfils.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Hot stream of finalized blocks for `chain`, in finalization order.
    async fn finalized_blocks(
        &self,
        chain: &NetworkId,
    ) -> MonitorResult<mpsc::Receiver<SignedBlockWithEvents>>;

    /// On-demand storage read, at `block_hash` or best when absent.
    async fn get_storage(
        &self,
        chain: &NetworkId,
        key: &[u8],
        block_hash: Option<&str>,
    ) -> MonitorResult<Option<Vec<u8>>>;
}

/// In-process block source fed through channels.
///
/// The production deployment plugs an RPC-backed source in behind the same
/// trait; this one backs tests and embedders that already hold decoded
/// blocks. Blocks injected while a chain has no open stream are dropped,
/// matching the no-replay contract.
pub struct ChannelBlockSource {
    senders: Mutex<HashMap<NetworkId, Vec<mpsc::Sender<SignedBlockWithEvents>>>>,
}

impl ChannelBlockSource {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver a finalized block to every open stream of its chain.
    pub async fn inject(&self, block: SignedBlockWithEvents) {
        let targets: Vec<mpsc::Sender<SignedBlockWithEvents>> = {
            let senders = self.senders.lock().unwrap();
            senders.get(&block.chain).cloned().unwrap_or_default()
        };
        let mut dead = false;
        for tx in &targets {
            if tx.send(block.clone()).await.is_err() {
                dead = true;
            }
        }
        if dead {
            let mut senders = self.senders.lock().unwrap();
            if let Some(list) = senders.get_mut(&block.chain) {
                list.retain(|tx| !tx.is_closed());
            }
        }
    }

    /// Number of open finalized-block streams for `chain`. Lets tests wait
    /// for observers to attach before injecting.
    pub fn stream_count(&self, chain: &NetworkId) -> usize {
        let mut senders = self.senders.lock().unwrap();
        if let Some(list) = senders.get_mut(chain) {
            list.retain(|tx| !tx.is_closed());
            list.len()
        } else {
            0
        }
    }
}

#[async_trait]
impl BlockSource for ChannelBlockSource {
    async fn finalized_blocks(
        &self,
        chain: &NetworkId,
    ) -> MonitorResult<mpsc::Receiver<SignedBlockWithEvents>> {
        let (tx, rx) = mpsc::channel(BLOCK_CHANNEL_SIZE);
        let mut senders = self.senders.lock().unwrap();
        senders.entry(chain.clone()).or_default().push(tx);
        Ok(rx)
    }

    async fn get_storage(
        &self,
        _chain: &NetworkId,
        _key: &[u8],
        _block_hash: Option<&str>,
    ) -> MonitorResult<Option<Vec<u8>>> {
        Err(MonitorError::Generic(
            "channel block source has no storage backend".to_string(),
        ))
    }
}
