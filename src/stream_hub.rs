// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared per-chain block streams.
//!
//! At most one upstream finalized-block stream is held per chain, created
//! lazily on first attach and released when the last observer detaches.
//! Each block is decomposed into its events and extrinsics and multicast to
//! every attached observer. Fan-out sends block on slow observers; an
//! attached observer never loses events.

use crate::error::MonitorResult;
use crate::ingress::{BlockEvent, BlockSource, ExtrinsicWithEvents};
use crate::metrics::MonitorMetrics;
use crate::types::NetworkId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Depth of each observer channel.
const OBSERVER_CHANNEL_SIZE: usize = 64;

type SubscriberList<T> = Arc<StdMutex<Vec<(u64, mpsc::Sender<Arc<T>>)>>>;

struct ChainFanout {
    cancel: CancellationToken,
    shared: Arc<FanoutState>,
}

struct FanoutState {
    chain: NetworkId,
    cancel: CancellationToken,
    next_id: AtomicU64,
    event_subs: SubscriberList<BlockEvent>,
    extrinsic_subs: SubscriberList<ExtrinsicWithEvents>,
}

impl FanoutState {
    fn observer_count(&self) -> usize {
        self.event_subs.lock().unwrap().len() + self.extrinsic_subs.lock().unwrap().len()
    }
}

/// A handle on one shared stream. Dropping it detaches the observer; when
/// the last observer of a chain detaches, the upstream is released.
pub struct SharedStream<T> {
    rx: mpsc::Receiver<Arc<T>>,
    _guard: StreamGuard<T>,
}

impl<T> SharedStream<T> {
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        self.rx.recv().await
    }
}

struct StreamGuard<T> {
    id: u64,
    list: SubscriberList<T>,
    shared: Arc<FanoutState>,
}

impl<T> Drop for StreamGuard<T> {
    fn drop(&mut self) {
        {
            let mut list = self.list.lock().unwrap();
            list.retain(|(id, _)| *id != self.id);
        }
        if self.shared.observer_count() == 0 {
            debug!(
                "[{}] last observer detached, releasing upstream",
                self.shared.chain
            );
            self.shared.cancel.cancel();
        }
    }
}

/// Per-chain shared, reference-counted block event and extrinsic streams.
pub struct StreamHub {
    source: Arc<dyn BlockSource>,
    chains: Mutex<HashMap<NetworkId, ChainFanout>>,
    metrics: Option<Arc<MonitorMetrics>>,
}

impl StreamHub {
    pub fn new(source: Arc<dyn BlockSource>) -> Self {
        Self {
            source,
            chains: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MonitorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Attach to the shared block-events stream of `chain`.
    pub async fn shared_events(&self, chain: &NetworkId) -> MonitorResult<SharedStream<BlockEvent>> {
        let shared = self.fanout(chain).await?;
        let (tx, rx) = mpsc::channel(OBSERVER_CHANNEL_SIZE);
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        shared.event_subs.lock().unwrap().push((id, tx));
        Ok(SharedStream {
            rx,
            _guard: StreamGuard {
                id,
                list: shared.event_subs.clone(),
                shared,
            },
        })
    }

    /// Attach to the shared block-extrinsics stream of `chain`.
    pub async fn shared_extrinsics(
        &self,
        chain: &NetworkId,
    ) -> MonitorResult<SharedStream<ExtrinsicWithEvents>> {
        let shared = self.fanout(chain).await?;
        let (tx, rx) = mpsc::channel(OBSERVER_CHANNEL_SIZE);
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        shared.extrinsic_subs.lock().unwrap().push((id, tx));
        Ok(SharedStream {
            rx,
            _guard: StreamGuard {
                id,
                list: shared.extrinsic_subs.clone(),
                shared,
            },
        })
    }

    /// Upstreams currently held. For inspection.
    pub async fn upstream_count(&self) -> usize {
        let chains = self.chains.lock().await;
        chains
            .values()
            .filter(|c| !c.cancel.is_cancelled())
            .count()
    }

    async fn fanout(&self, chain: &NetworkId) -> MonitorResult<Arc<FanoutState>> {
        let mut chains = self.chains.lock().await;
        if let Some(existing) = chains.get(chain) {
            if !existing.cancel.is_cancelled() {
                return Ok(existing.shared.clone());
            }
        }

        let upstream = self.source.finalized_blocks(chain).await?;
        let cancel = CancellationToken::new();
        let shared = Arc::new(FanoutState {
            chain: chain.clone(),
            cancel: cancel.clone(),
            next_id: AtomicU64::new(0),
            event_subs: Arc::new(StdMutex::new(Vec::new())),
            extrinsic_subs: Arc::new(StdMutex::new(Vec::new())),
        });
        info!("[{chain}] attaching upstream finalized-block stream");
        tokio::spawn(run_fanout(upstream, shared.clone(), self.metrics.clone()));
        chains.insert(
            chain.clone(),
            ChainFanout {
                cancel,
                shared: shared.clone(),
            },
        );
        Ok(shared)
    }
}

async fn run_fanout(
    mut upstream: mpsc::Receiver<crate::ingress::SignedBlockWithEvents>,
    shared: Arc<FanoutState>,
    metrics: Option<Arc<MonitorMetrics>>,
) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!("[{}] fanout cancelled", shared.chain);
                break;
            }
            block = upstream.recv() => {
                let block = match block {
                    Some(b) => b,
                    None => {
                        warn!("[{}] upstream block stream ended", shared.chain);
                        break;
                    }
                };
                if let Some(m) = &metrics {
                    m.blocks_observed_total
                        .with_label_values(&[shared.chain.as_str()])
                        .inc();
                }

                let events: Vec<Arc<BlockEvent>> =
                    block.events.iter().cloned().map(Arc::new).collect();
                let extrinsics: Vec<Arc<ExtrinsicWithEvents>> =
                    block.extrinsics.iter().cloned().map(Arc::new).collect();

                for item in events {
                    multicast(&shared.event_subs, item).await;
                }
                for item in extrinsics {
                    multicast(&shared.extrinsic_subs, item).await;
                }
            }
        }
    }
    // Upstream gone: close every observer channel so legs notice and retry
    shared.cancel.cancel();
    shared.event_subs.lock().unwrap().clear();
    shared.extrinsic_subs.lock().unwrap().clear();
}

/// Deliver one item to every subscriber, blocking on the slowest. Closed
/// subscribers are pruned.
async fn multicast<T>(list: &SubscriberList<T>, item: Arc<T>) {
    let targets: Vec<(u64, mpsc::Sender<Arc<T>>)> = list.lock().unwrap().clone();
    let mut dead = Vec::new();
    for (id, tx) in &targets {
        if tx.send(item.clone()).await.is_err() {
            dead.push(*id);
        }
    }
    if !dead.is_empty() {
        let mut subs = list.lock().unwrap();
        subs.retain(|(id, _)| !dead.contains(id));
    }
}
