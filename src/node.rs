// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Node wiring.
//!
//! One [`Services`] value owns every process-wide registry and is threaded
//! through the constructors; there are no hidden singletons. The engine
//! emits back to the switchboard through a waypoint channel supplied at
//! construction.

use crate::config::MonitorConfig;
use crate::extractor::JsonFieldExtractor;
use crate::ingress::BlockSource;
use crate::matching::{MatchingEngine, PendingStore};
use crate::metrics::MonitorMetrics;
use crate::notifier::{log_listener, NotifierHub, WebhookNotifier};
use crate::server::run_server;
use crate::stream_hub::StreamHub;
use crate::subscription_store::SubscriptionStore;
use crate::switchboard::{Switchboard, SwitchboardConfig};
use crate::types::now_millis;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Process-wide service registry.
pub struct Services {
    pub networks: crate::types::NetworkRegistry,
    pub pending_store: Arc<PendingStore>,
    pub subscription_store: Arc<SubscriptionStore>,
    pub hub: Arc<StreamHub>,
    pub engine: Arc<MatchingEngine>,
    pub notifier: Arc<NotifierHub>,
    pub switchboard: Switchboard,
    pub metrics: Arc<MonitorMetrics>,
}

/// Handle on a running monitor node.
pub struct MonitorHandle {
    pub services: Services,
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl MonitorHandle {
    /// Block until the node's tasks finish (normally: never).
    pub async fn wait(self) -> anyhow::Result<()> {
        for handle in self.handles {
            handle
                .await
                .map_err(|e| anyhow::anyhow!("task join error: {e}"))?;
        }
        Ok(())
    }

    /// Detach every observer and stop the background tasks. A sweep in
    /// flight finishes its pass.
    pub async fn shutdown(self) {
        self.services.switchboard.stop().await;
        self.cancel.cancel();
        for handle in self.handles {
            handle.abort();
        }
        info!("monitor node stopped");
    }
}

/// Wire the services and start the node: sweep scheduler, waypoint fan-out,
/// persisted subscriptions and the management server.
pub async fn run_monitor_node(
    config: MonitorConfig,
    source: Arc<dyn BlockSource>,
    registry: prometheus::Registry,
) -> anyhow::Result<MonitorHandle> {
    config.validate()?;
    let networks = config.network_registry()?;
    let metrics = Arc::new(MonitorMetrics::new(&registry));

    let db = sled::open(&config.db_path)?;
    let pending_store = Arc::new(PendingStore::new(&db)?);
    let subscription_store = Arc::new(SubscriptionStore::new(&db)?);

    let (waypoint_tx, waypoint_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(
        MatchingEngine::new(
            pending_store.clone(),
            config.sweep_expiry(),
            Arc::new(move |msg| {
                let _ = waypoint_tx.send(msg);
            }),
        )
        .with_metrics(metrics.clone()),
    );

    let hub = Arc::new(StreamHub::new(source).with_metrics(metrics.clone()));

    let notifier = NotifierHub::new().with_metrics(metrics.clone());
    notifier.on(None, log_listener());
    if let Some(url) = &config.webhook_url {
        info!("webhook notifier configured for {url}");
        notifier.on(None, Arc::new(WebhookNotifier::new(url)).listener());
    }
    let notifier = Arc::new(notifier);

    let switchboard = Switchboard::new(
        SwitchboardConfig {
            max_ephemeral: config.subscription_max_ephemeral,
            max_persistent: config.subscription_max_persistent,
            retry_delay: config.sub_error_retry(),
        },
        networks.clone(),
        hub.clone(),
        engine.clone(),
        notifier.clone(),
        subscription_store.clone(),
        Arc::new(JsonFieldExtractor::new()),
        Some(metrics.clone()),
    );

    let mut handles = Vec::new();
    let cancel = CancellationToken::new();

    handles.push(switchboard.spawn_fanout(waypoint_rx));
    handles.push(spawn_sweep_scheduler(
        engine.clone(),
        config.scheduler_frequency(),
        cancel.clone(),
    ));

    switchboard.start().await?;

    let socket_address = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        config.server_listen_port,
    );
    handles.push(run_server(
        &socket_address,
        switchboard.clone(),
        Arc::new(registry),
    ));

    info!(
        "monitor node started: {} networks, db at {}",
        networks.len(),
        config.db_path.display()
    );
    Ok(MonitorHandle {
        services: Services {
            networks,
            pending_store,
            subscription_store,
            hub,
            engine,
            notifier,
            switchboard,
            metrics,
        },
        handles,
        cancel,
    })
}

fn spawn_sweep_scheduler(
    engine: Arc<MatchingEngine>,
    frequency: std::time::Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(frequency);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("sweep scheduler cancelled");
                    break;
                }
                _ = interval.tick() => {
                    engine.sweep(now_millis()).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::ChannelBlockSource;
    use crate::types::{
        EventsSpec, NetworkId, SendersSpec, Subscription, DEFAULT_OUTBOUND_TTL_MS,
    };

    fn config(db_path: std::path::PathBuf) -> MonitorConfig {
        let mut config: MonitorConfig = serde_json::from_str(
            r#"{
                "db-path": "unused",
                "server-listen-port": 0,
                "networks": [
                    { "id": "urn:ocn:polkadot:0", "relay": true },
                    { "id": "urn:ocn:polkadot:1000" },
                    { "id": "urn:ocn:polkadot:2004" }
                ]
            }"#,
        )
        .unwrap();
        config.db_path = db_path;
        config
    }

    #[tokio::test]
    async fn test_node_boots_and_accepts_subscriptions() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ChannelBlockSource::new());
        let handle = run_monitor_node(
            config(dir.path().join("db")),
            source,
            prometheus::Registry::new(),
        )
        .await
        .unwrap();

        let descriptor = Subscription {
            id: "boot-1".to_string(),
            origin: NetworkId::new("urn:ocn:polkadot:1000"),
            senders: SendersSpec::Any,
            destinations: vec![NetworkId::new("urn:ocn:polkadot:2004")],
            events: EventsSpec::Any,
            ephemeral: false,
            outbound_ttl: DEFAULT_OUTBOUND_TTL_MS,
        };
        handle
            .services
            .switchboard
            .subscribe(descriptor)
            .await
            .unwrap();
        assert_eq!(handle.services.switchboard.subscription_count().await, 1);
        assert_eq!(handle.services.subscription_store.count(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_persisted_subscriptions_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db");

        let handle = run_monitor_node(
            config(db_path.clone()),
            Arc::new(ChannelBlockSource::new()),
            prometheus::Registry::new(),
        )
        .await
        .unwrap();
        handle
            .services
            .switchboard
            .subscribe(Subscription {
                id: "durable-1".to_string(),
                origin: NetworkId::new("urn:ocn:polkadot:1000"),
                senders: SendersSpec::Any,
                destinations: vec![NetworkId::new("urn:ocn:polkadot:2004")],
                events: EventsSpec::Any,
                ephemeral: false,
                outbound_ttl: DEFAULT_OUTBOUND_TTL_MS,
            })
            .await
            .unwrap();
        handle.shutdown().await;
        // Let cancelled tasks drop their store handles and release the db lock
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let handle = run_monitor_node(
            config(db_path),
            Arc::new(ChannelBlockSource::new()),
            prometheus::Registry::new(),
        )
        .await
        .unwrap();
        assert!(handle.services.switchboard.get("durable-1").await.is_some());
        handle.shutdown().await;
    }
}
