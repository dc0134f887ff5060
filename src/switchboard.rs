// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Subscription registry and supervisor.
//!
//! Per subscription the switchboard attaches origin observers (one per
//! outbound protocol of the origin chain), one destination observer per
//! destination, and a relay observer when the descriptor wants `Relayed`
//! events for a parachain-to-parachain route. Observers pipe the shared
//! chain streams through the protocol extractors, filter with the mutable
//! control queries and feed the matching engine. A failing leg is detached
//! and re-derived from the descriptor after a fixed backoff; the
//! subscription itself survives leg failures.
//!
//! Emitted notifications come back through the engine's waypoint channel
//! and are fanned out here, re-checking the events filter and the senders
//! control against the current descriptor before they reach the notifier.

use crate::control_query::{destinations_criteria, senders_criteria, ControlQuery};
use crate::error::{MonitorError, MonitorResult};
use crate::extractor::{inbound_protocol, outbound_protocols, XcmExtractor, XcmProtocol};
use crate::matching::MatchingEngine;
use crate::metrics::MonitorMetrics;
use crate::notifier::NotifierHub;
use crate::stream_hub::StreamHub;
use crate::subscription_store::SubscriptionStore;
use crate::types::{
    AccountKey, NetworkId, NetworkRegistry, Subscription, XcmEventType, XcmInbound,
    XcmNotifyMessage,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SwitchboardConfig {
    pub max_ephemeral: u32,
    pub max_persistent: u32,
    /// Backoff before a failed observer leg is re-attached.
    pub retry_delay: Duration,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            max_ephemeral: 10_000,
            max_persistent: 10_000,
            retry_delay: Duration::from_millis(5_000),
        }
    }
}

/// One running observer task.
struct ObserverLeg {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

impl ObserverLeg {
    fn detach(&self) {
        self.cancel.cancel();
    }
}

struct SubscriptionHandler {
    descriptor: Arc<StdRwLock<Subscription>>,
    senders_control: Arc<ControlQuery>,
    message_control: Arc<ControlQuery>,
    origin_legs: Vec<ObserverLeg>,
    destination_legs: HashMap<NetworkId, ObserverLeg>,
    relay_leg: Option<ObserverLeg>,
}

impl SubscriptionHandler {
    fn detach_all(&self) {
        for leg in &self.origin_legs {
            leg.detach();
        }
        for leg in self.destination_legs.values() {
            leg.detach();
        }
        if let Some(leg) = &self.relay_leg {
            leg.detach();
        }
    }
}

/// Everything an observer leg needs, cloned out of the switchboard so leg
/// tasks hold no reference back into the handler map.
#[derive(Clone)]
struct LegContext {
    hub: Arc<StreamHub>,
    engine: Arc<MatchingEngine>,
    extractor: Arc<dyn XcmExtractor>,
    metrics: Option<Arc<MonitorMetrics>>,
    retry_delay: Duration,
}

struct Inner {
    config: SwitchboardConfig,
    networks: NetworkRegistry,
    engine: Arc<MatchingEngine>,
    notifier: Arc<NotifierHub>,
    store: Arc<SubscriptionStore>,
    leg_ctx: LegContext,
    handlers: Mutex<HashMap<String, SubscriptionHandler>>,
    metrics: Option<Arc<MonitorMetrics>>,
}

#[derive(Clone)]
pub struct Switchboard {
    inner: Arc<Inner>,
}

impl Switchboard {
    pub fn new(
        config: SwitchboardConfig,
        networks: NetworkRegistry,
        hub: Arc<StreamHub>,
        engine: Arc<MatchingEngine>,
        notifier: Arc<NotifierHub>,
        store: Arc<SubscriptionStore>,
        extractor: Arc<dyn XcmExtractor>,
        metrics: Option<Arc<MonitorMetrics>>,
    ) -> Self {
        let leg_ctx = LegContext {
            hub,
            engine: engine.clone(),
            extractor,
            metrics: metrics.clone(),
            retry_delay: config.retry_delay,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                networks,
                engine,
                notifier,
                store,
                leg_ctx,
                handlers: Mutex::new(HashMap::new()),
                metrics,
            }),
        }
    }

    /// Consume the engine's waypoint channel and fan notifications out to
    /// the notifier, applying the events filter and the senders re-check.
    pub fn spawn_fanout(&self, mut rx: mpsc::UnboundedReceiver<XcmNotifyMessage>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                dispatch(&inner, msg).await;
            }
            debug!("waypoint channel closed, fan-out task exiting");
        })
    }

    /// Register and begin monitoring a new subscription.
    pub async fn subscribe(&self, descriptor: Subscription) -> MonitorResult<()> {
        self.subscribe_inner(descriptor, true).await
    }

    async fn subscribe_inner(&self, descriptor: Subscription, persist: bool) -> MonitorResult<()> {
        descriptor.validate(&self.inner.networks)?;
        let mut handlers = self.inner.handlers.lock().await;
        if handlers.contains_key(&descriptor.id) {
            return Err(MonitorError::DuplicateSubscription(descriptor.id));
        }

        let (ephemeral, persistent) = subscription_counts(&handlers);
        if descriptor.ephemeral && ephemeral >= self.inner.config.max_ephemeral {
            return Err(MonitorError::TooManySubscribers {
                kind: "ephemeral",
                limit: self.inner.config.max_ephemeral,
            });
        }
        if !descriptor.ephemeral && persistent >= self.inner.config.max_persistent {
            return Err(MonitorError::TooManySubscribers {
                kind: "persistent",
                limit: self.inner.config.max_persistent,
            });
        }

        if persist && !descriptor.ephemeral {
            self.inner.store.insert(&descriptor)?;
        }

        info!(
            "monitoring subscription {} ({} -> {:?})",
            descriptor.id, descriptor.origin, descriptor.destinations
        );
        let handler = self.monitor(descriptor);
        let id = handler.descriptor.read().unwrap().id.clone();
        handlers.insert(id, handler);
        self.update_subscription_gauges(&handlers);
        Ok(())
    }

    /// Compose the observer legs for one descriptor.
    fn monitor(&self, descriptor: Subscription) -> SubscriptionHandler {
        let networks = &self.inner.networks;
        let senders_control = Arc::new(ControlQuery::new(senders_criteria(&descriptor.senders)));
        let message_control = Arc::new(ControlQuery::new(destinations_criteria(
            &descriptor.destinations,
        )));
        let sub_id = descriptor.id.clone();
        let origin = descriptor.origin.clone();
        let destinations = descriptor.destinations.clone();
        let origin_info = networks
            .get(&origin)
            .expect("validated descriptor has a known origin")
            .clone();
        let shared = Arc::new(StdRwLock::new(descriptor));

        let mut origin_legs = Vec::new();
        for protocol in outbound_protocols(&origin_info) {
            origin_legs.push(spawn_origin_leg(
                self.inner.leg_ctx.clone(),
                sub_id.clone(),
                shared.clone(),
                origin.clone(),
                protocol,
                message_control.clone(),
            ));
        }

        let mut destination_legs = HashMap::new();
        for dest in &destinations {
            destination_legs.insert(
                dest.clone(),
                spawn_destination_leg(
                    self.inner.leg_ctx.clone(),
                    sub_id.clone(),
                    origin_info.is_relay(),
                    networks.is_relay(dest),
                    dest.clone(),
                ),
            );
        }

        let mut handler = SubscriptionHandler {
            descriptor: shared,
            senders_control,
            message_control,
            origin_legs,
            destination_legs,
            relay_leg: None,
        };
        self.ensure_relay_leg(&mut handler);
        handler
    }

    /// Tear a subscription down. Idempotent: unknown ids only warn.
    pub async fn unsubscribe(&self, id: &str) {
        let mut handlers = self.inner.handlers.lock().await;
        match handlers.remove(id) {
            Some(handler) => {
                handler.detach_all();
                self.update_subscription_gauges(&handlers);
                drop(handlers);
                // An in-flight match for this id completes under the engine
                // mutex before the pending state is withdrawn
                self.inner.engine.clear_pending_states(id).await;
                if let Err(e) = self.inner.store.remove(id) {
                    warn!("failed to remove persisted subscription {id}: {e}");
                }
                info!("unsubscribed {id}");
            }
            None => warn!("unsubscribe for unknown subscription {id}"),
        }
    }

    /// Replace the senders filter of a live subscription.
    pub async fn update_senders(&self, id: &str, senders: crate::types::SendersSpec) {
        let handlers = self.inner.handlers.lock().await;
        match handlers.get(id) {
            Some(handler) => {
                handler.descriptor.write().unwrap().senders = senders.clone();
                handler.senders_control.change(senders_criteria(&senders));
                self.persist_current(handler);
                debug!("updated senders for {id}");
            }
            None => warn!("updateSenders for unknown subscription {id}"),
        }
    }

    /// Replace the destinations of a live subscription, reconciling the
    /// destination observer legs.
    pub async fn update_destinations(
        &self,
        id: &str,
        destinations: Vec<NetworkId>,
    ) -> MonitorResult<()> {
        let mut handlers = self.inner.handlers.lock().await;
        let Some(handler) = handlers.get_mut(id) else {
            warn!("updateDestinations for unknown subscription {id}");
            return Ok(());
        };

        let mut candidate = handler.descriptor.read().unwrap().clone();
        candidate.destinations = destinations.clone();
        candidate.validate(&self.inner.networks)?;

        let origin_is_relay = self.inner.networks.is_relay(&candidate.origin);
        // Reconcile legs: drop removed destinations, attach new ones
        handler.destination_legs.retain(|dest, leg| {
            if destinations.contains(dest) {
                true
            } else {
                leg.detach();
                false
            }
        });
        for dest in &destinations {
            if !handler.destination_legs.contains_key(dest) {
                handler.destination_legs.insert(
                    dest.clone(),
                    spawn_destination_leg(
                        self.inner.leg_ctx.clone(),
                        id.to_string(),
                        origin_is_relay,
                        self.inner.networks.is_relay(dest),
                        dest.clone(),
                    ),
                );
            }
        }

        *handler.descriptor.write().unwrap() = candidate;
        handler
            .message_control
            .change(destinations_criteria(&destinations));
        self.ensure_relay_leg(handler);
        self.persist_current(handler);
        debug!("updated destinations for {id}: {destinations:?}");
        Ok(())
    }

    /// Replace the events filter of a live subscription.
    pub async fn update_events(&self, id: &str, events: crate::types::EventsSpec) {
        let mut handlers = self.inner.handlers.lock().await;
        match handlers.get_mut(id) {
            Some(handler) => {
                handler.descriptor.write().unwrap().events = events;
                self.ensure_relay_leg(handler);
                self.persist_current(handler);
                debug!("updated events for {id}");
            }
            None => warn!("updateEvents for unknown subscription {id}"),
        }
    }

    /// Replace a whole descriptor in place.
    pub async fn update_subscription(&self, descriptor: Subscription) -> MonitorResult<()> {
        descriptor.validate(&self.inner.networks)?;
        let id = descriptor.id.clone();
        {
            let handlers = self.inner.handlers.lock().await;
            if !handlers.contains_key(&id) {
                warn!("updateSubscription for unknown subscription {id}");
                return Ok(());
            }
        }
        self.update_destinations(&id, descriptor.destinations.clone())
            .await?;
        self.update_senders(&id, descriptor.senders.clone()).await;
        self.update_events(&id, descriptor.events.clone()).await;

        let mut handlers = self.inner.handlers.lock().await;
        if let Some(handler) = handlers.get_mut(&id) {
            {
                let mut current = handler.descriptor.write().unwrap();
                current.ephemeral = descriptor.ephemeral;
                current.outbound_ttl = descriptor.outbound_ttl;
            }
            if descriptor.ephemeral {
                if let Err(e) = self.inner.store.remove(&id) {
                    warn!("failed to unpersist {id}: {e}");
                }
            } else {
                self.persist_current(handler);
            }
            self.update_subscription_gauges(&handlers);
        }
        Ok(())
    }

    /// Load every persisted subscription and begin monitoring.
    pub async fn start(&self) -> MonitorResult<()> {
        let persisted = self.inner.store.list()?;
        info!(
            "switchboard starting with {} persisted subscriptions",
            persisted.len()
        );
        for descriptor in persisted {
            let id = descriptor.id.clone();
            if let Err(e) = self.subscribe_inner(descriptor, false).await {
                warn!("failed to restore subscription {id}: {e}");
            }
        }
        Ok(())
    }

    /// Detach every observer. Ephemeral subscriptions do not survive this.
    pub async fn stop(&self) {
        let mut handlers = self.inner.handlers.lock().await;
        for (_, handler) in handlers.drain() {
            handler.detach_all();
        }
        self.update_subscription_gauges(&handlers);
        info!("switchboard stopped");
    }

    pub async fn get(&self, id: &str) -> Option<Subscription> {
        let handlers = self.inner.handlers.lock().await;
        handlers
            .get(id)
            .map(|h| h.descriptor.read().unwrap().clone())
    }

    pub async fn list(&self) -> Vec<Subscription> {
        let handlers = self.inner.handlers.lock().await;
        let mut subs: Vec<Subscription> = handlers
            .values()
            .map(|h| h.descriptor.read().unwrap().clone())
            .collect();
        subs.sort_by(|a, b| a.id.cmp(&b.id));
        subs
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.handlers.lock().await.len()
    }

    /// Attach or drop the relay observer to match the current descriptor:
    /// wanted only when `Relayed` events are admitted, the origin is a
    /// parachain and at least one destination is one too.
    fn ensure_relay_leg(&self, handler: &mut SubscriptionHandler) {
        let descriptor = handler.descriptor.read().unwrap().clone();
        let networks = &self.inner.networks;
        let wanted = descriptor.events.admits(XcmEventType::Relayed)
            && !networks.is_relay(&descriptor.origin)
            && descriptor
                .destinations
                .iter()
                .any(|d| !networks.is_relay(d));

        if wanted && handler.relay_leg.is_none() {
            if let Some(relay) = networks.relay_of(&descriptor.origin) {
                handler.relay_leg = Some(spawn_relay_leg(
                    self.inner.leg_ctx.clone(),
                    descriptor.id.clone(),
                    descriptor.origin.clone(),
                    relay,
                    handler.message_control.clone(),
                ));
            }
        } else if !wanted {
            if let Some(leg) = handler.relay_leg.take() {
                leg.detach();
            }
        }
    }

    fn persist_current(&self, handler: &SubscriptionHandler) {
        let descriptor = handler.descriptor.read().unwrap().clone();
        if descriptor.ephemeral {
            return;
        }
        if let Err(e) = self.inner.store.insert(&descriptor) {
            warn!("failed to persist subscription {}: {e}", descriptor.id);
        }
    }

    fn update_subscription_gauges(&self, handlers: &HashMap<String, SubscriptionHandler>) {
        if let Some(m) = &self.inner.metrics {
            let (ephemeral, persistent) = subscription_counts(handlers);
            m.active_subscriptions
                .with_label_values(&["ephemeral"])
                .set(ephemeral as i64);
            m.active_subscriptions
                .with_label_values(&["persistent"])
                .set(persistent as i64);
        }
    }
}

fn subscription_counts(handlers: &HashMap<String, SubscriptionHandler>) -> (u32, u32) {
    let mut ephemeral = 0;
    let mut persistent = 0;
    for handler in handlers.values() {
        if handler.descriptor.read().unwrap().ephemeral {
            ephemeral += 1;
        } else {
            persistent += 1;
        }
    }
    (ephemeral, persistent)
}

/// Fan one emitted notification out to the notifier, if its subscription is
/// still live and its filters still admit the message.
async fn dispatch(inner: &Arc<Inner>, msg: XcmNotifyMessage) {
    let (descriptor, admitted) = {
        let handlers = inner.handlers.lock().await;
        let Some(handler) = handlers.get(msg.subscription_id()) else {
            debug!(
                "dropping {} for vanished subscription {}",
                msg.event_type(),
                msg.subscription_id()
            );
            return;
        };
        let descriptor = handler.descriptor.read().unwrap().clone();
        // The descriptor may have mutated since the sent leg was recorded,
        // so the senders filter is re-evaluated here
        let admitted = descriptor.events.admits(msg.event_type())
            && handler.senders_control.evaluate(&sender_record(msg.sender()));
        (descriptor, admitted)
    };
    if !admitted {
        debug!(
            "suppressing {} for {} (filters)",
            msg.event_type(),
            msg.subscription_id()
        );
        return;
    }
    inner.notifier.notify(&descriptor, &msg);
}

fn sender_record(sender: Option<&AccountKey>) -> serde_json::Value {
    match sender {
        Some(account) => json!({
            "extrinsic": {
                "signer": {"id": account.id, "publicKey": account.public_key},
                "extraSigners": []
            }
        }),
        None => json!({"extrinsic": {"extraSigners": []}}),
    }
}

fn spawn_origin_leg(
    ctx: LegContext,
    sub_id: String,
    descriptor: Arc<StdRwLock<Subscription>>,
    origin: NetworkId,
    protocol: XcmProtocol,
    message_control: Arc<ControlQuery>,
) -> ObserverLeg {
    let cancel = CancellationToken::new();
    let leg_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        loop {
            match ctx.hub.shared_extrinsics(&origin).await {
                Ok(mut stream) => {
                    debug!("[{origin}] origin observer attached for {sub_id} ({protocol})");
                    loop {
                        tokio::select! {
                            _ = leg_cancel.cancelled() => return,
                            item = stream.recv() => match item {
                                Some(xt) => {
                                    let ttl = Duration::from_millis(
                                        descriptor.read().unwrap().outbound_ttl,
                                    );
                                    match ctx.extractor.extract_outbound(protocol, &origin, &xt) {
                                        Ok(sents) => {
                                            for sent in sents {
                                                let record = json!({
                                                    "recipient": sent.destination.as_str()
                                                });
                                                if !message_control.evaluate(&record) {
                                                    continue;
                                                }
                                                ctx.engine
                                                    .on_outbound_message(&sub_id, sent, ttl)
                                                    .await;
                                            }
                                        }
                                        Err(e) => {
                                            warn!("[{origin}] outbound extraction failed: {e}");
                                            if let Some(m) = &ctx.metrics {
                                                m.extractor_errors_total
                                                    .with_label_values(&[origin.as_str()])
                                                    .inc();
                                            }
                                        }
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                }
                Err(e) => warn!("[{origin}] failed to attach origin observer: {e}"),
            }
            if leg_cancel.is_cancelled() {
                return;
            }
            if let Some(m) = &ctx.metrics {
                m.subscription_errors_total
                    .with_label_values(&[origin.as_str()])
                    .inc();
            }
            warn!(
                "[{origin}] origin observer for {sub_id} ({protocol}) lost, retrying in {:?}",
                ctx.retry_delay
            );
            tokio::select! {
                _ = leg_cancel.cancelled() => return,
                _ = tokio::time::sleep(ctx.retry_delay) => {}
            }
        }
    });
    ObserverLeg {
        cancel,
        _handle: handle,
    }
}

fn spawn_destination_leg(
    ctx: LegContext,
    sub_id: String,
    origin_is_relay: bool,
    destination_is_relay: bool,
    destination: NetworkId,
) -> ObserverLeg {
    let protocol = inbound_protocol(origin_is_relay, destination_is_relay);
    let cancel = CancellationToken::new();
    let leg_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        loop {
            match ctx.hub.shared_events(&destination).await {
                Ok(mut stream) => {
                    debug!(
                        "[{destination}] destination observer attached for {sub_id} ({protocol})"
                    );
                    loop {
                        tokio::select! {
                            _ = leg_cancel.cancelled() => return,
                            item = stream.recv() => match item {
                                Some(event) => {
                                    match ctx.extractor.extract_inbound(
                                        protocol,
                                        &destination,
                                        &event,
                                    ) {
                                        Ok(Some(received)) => {
                                            ctx.engine
                                                .on_inbound_message(
                                                    &sub_id,
                                                    XcmInbound {
                                                        chain: destination.clone(),
                                                        received,
                                                    },
                                                )
                                                .await;
                                        }
                                        Ok(None) => {}
                                        Err(e) => {
                                            warn!(
                                                "[{destination}] inbound extraction failed: {e}"
                                            );
                                            if let Some(m) = &ctx.metrics {
                                                m.extractor_errors_total
                                                    .with_label_values(&[destination.as_str()])
                                                    .inc();
                                            }
                                        }
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                }
                Err(e) => warn!("[{destination}] failed to attach destination observer: {e}"),
            }
            if leg_cancel.is_cancelled() {
                return;
            }
            if let Some(m) = &ctx.metrics {
                m.subscription_errors_total
                    .with_label_values(&[destination.as_str()])
                    .inc();
            }
            warn!(
                "[{destination}] destination observer for {sub_id} lost, retrying in {:?}",
                ctx.retry_delay
            );
            tokio::select! {
                _ = leg_cancel.cancelled() => return,
                _ = tokio::time::sleep(ctx.retry_delay) => {}
            }
        }
    });
    ObserverLeg {
        cancel,
        _handle: handle,
    }
}

fn spawn_relay_leg(
    ctx: LegContext,
    sub_id: String,
    origin: NetworkId,
    relay: NetworkId,
    message_control: Arc<ControlQuery>,
) -> ObserverLeg {
    let cancel = CancellationToken::new();
    let leg_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        loop {
            match ctx.hub.shared_extrinsics(&relay).await {
                Ok(mut stream) => {
                    debug!("[{relay}] relay observer attached for {sub_id}");
                    loop {
                        tokio::select! {
                            _ = leg_cancel.cancelled() => return,
                            item = stream.recv() => match item {
                                Some(xt) => {
                                    match ctx.extractor.extract_relayed(&relay, &xt) {
                                        Ok(relayed) => {
                                            for context in relayed {
                                                if context.origin != origin {
                                                    continue;
                                                }
                                                let record = json!({
                                                    "recipient": context.destination.as_str()
                                                });
                                                if !message_control.evaluate(&record) {
                                                    continue;
                                                }
                                                ctx.engine
                                                    .on_relayed_message(&sub_id, context)
                                                    .await;
                                            }
                                        }
                                        Err(e) => {
                                            warn!("[{relay}] relay extraction failed: {e}");
                                            if let Some(m) = &ctx.metrics {
                                                m.extractor_errors_total
                                                    .with_label_values(&[relay.as_str()])
                                                    .inc();
                                            }
                                        }
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                }
                Err(e) => warn!("[{relay}] failed to attach relay observer: {e}"),
            }
            if leg_cancel.is_cancelled() {
                return;
            }
            if let Some(m) = &ctx.metrics {
                m.subscription_errors_total
                    .with_label_values(&[relay.as_str()])
                    .inc();
            }
            warn!(
                "[{relay}] relay observer for {sub_id} lost, retrying in {:?}",
                ctx.retry_delay
            );
            tokio::select! {
                _ = leg_cancel.cancelled() => return,
                _ = tokio::time::sleep(ctx.retry_delay) => {}
            }
        }
    });
    ObserverLeg {
        cancel,
        _handle: handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::JsonFieldExtractor;
    use crate::ingress::{
        BlockEvent, ChannelBlockSource, ExtrinsicWithEvents, SignedBlockWithEvents,
    };
    use crate::matching::{outbound_key, relay_key, Namespace, PendingStore};
    use crate::types::{EventsSpec, MessageHash, SendersSpec, DEFAULT_OUTBOUND_TTL_MS};
    use std::collections::BTreeSet;

    const RELAY: &str = "urn:ocn:polkadot:0";
    const PARA_1000: &str = "urn:ocn:polkadot:1000";
    const PARA_2000: &str = "urn:ocn:polkadot:2000";
    const PARA_2004: &str = "urn:ocn:polkadot:2004";

    struct World {
        source: Arc<ChannelBlockSource>,
        switchboard: Switchboard,
        pending: Arc<PendingStore>,
        notifications: mpsc::UnboundedReceiver<XcmNotifyMessage>,
        _fanout: JoinHandle<()>,
    }

    fn networks() -> NetworkRegistry {
        use crate::types::{NetworkInfo, NetworkKind};
        let relay = NetworkId::new(RELAY);
        let para = |id: &str| NetworkInfo {
            id: NetworkId::new(id),
            kind: NetworkKind::Parachain {
                relay: relay.clone(),
            },
        };
        NetworkRegistry::new(vec![
            NetworkInfo {
                id: relay.clone(),
                kind: NetworkKind::Relay,
            },
            para(PARA_1000),
            para(PARA_2000),
            para(PARA_2004),
        ])
    }

    fn world_with_caps(max_ephemeral: u32, max_persistent: u32) -> World {
        let source = Arc::new(ChannelBlockSource::new());
        let hub = Arc::new(StreamHub::new(source.clone()));
        let db = sled::Config::new().temporary(true).open().unwrap();
        let pending = Arc::new(PendingStore::new(&db).unwrap());
        let subs = Arc::new(SubscriptionStore::new(&db).unwrap());

        let (way_tx, way_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(MatchingEngine::new(
            pending.clone(),
            Duration::from_secs(3600),
            Arc::new(move |msg| {
                let _ = way_tx.send(msg);
            }),
        ));

        let notifier = Arc::new(NotifierHub::new());
        let (note_tx, note_rx) = mpsc::unbounded_channel();
        notifier.on(
            None,
            Arc::new(move |_, msg| {
                let _ = note_tx.send(msg.clone());
                Ok(())
            }),
        );

        let switchboard = Switchboard::new(
            SwitchboardConfig {
                max_ephemeral,
                max_persistent,
                retry_delay: Duration::from_millis(50),
            },
            networks(),
            hub,
            engine,
            notifier,
            subs,
            Arc::new(JsonFieldExtractor::new()),
            None,
        );
        let fanout = switchboard.spawn_fanout(way_rx);
        World {
            source,
            switchboard,
            pending,
            notifications: note_rx,
            _fanout: fanout,
        }
    }

    fn world() -> World {
        world_with_caps(100, 100)
    }

    fn sub(id: &str, destinations: Vec<&str>) -> Subscription {
        Subscription {
            id: id.to_string(),
            origin: NetworkId::new(PARA_1000),
            senders: SendersSpec::Any,
            destinations: destinations.into_iter().map(NetworkId::new).collect(),
            events: EventsSpec::Any,
            ephemeral: false,
            outbound_ttl: DEFAULT_OUTBOUND_TTL_MS,
        }
    }

    fn hash_hex(byte: u8) -> String {
        format!("0x{}", hex::encode([byte; 32]))
    }

    fn sent_block(hash_byte: u8, recipient: &str, signer: &str) -> SignedBlockWithEvents {
        let chain = NetworkId::new(PARA_1000);
        let block_hash = format!("0xa{hash_byte:02x}");
        let event = BlockEvent {
            chain: chain.clone(),
            block_hash: block_hash.clone(),
            block_number: 100 + hash_byte as u64,
            index: 1,
            section: "xcmpQueue".to_string(),
            method: "XcmpMessageSent".to_string(),
            data: serde_json::json!({
                "messageHash": hash_hex(hash_byte),
                "recipient": recipient
            }),
        };
        let xt = ExtrinsicWithEvents {
            chain: chain.clone(),
            block_hash: block_hash.clone(),
            block_number: 100 + hash_byte as u64,
            extrinsic_id: format!("{}-1", 100 + hash_byte as u64),
            timestamp_ms: 1_700_000_000_000,
            signer: Some(AccountKey {
                id: signer.to_string(),
                public_key: format!("0xpub-{signer}"),
            }),
            extra_signers: vec![],
            call_section: "polkadotXcm".to_string(),
            call_method: "limitedReserveTransferAssets".to_string(),
            args: serde_json::json!({}),
            events: vec![event.clone()],
        };
        SignedBlockWithEvents {
            chain,
            block_hash,
            block_number: 100 + hash_byte as u64,
            parent_hash: "0xa00".to_string(),
            timestamp_ms: 1_700_000_000_000,
            author: None,
            extrinsics: vec![xt],
            events: vec![event],
        }
    }

    fn received_block(chain: &str, hash_byte: u8) -> SignedBlockWithEvents {
        let chain = NetworkId::new(chain);
        let block_hash = format!("0xr{hash_byte:02x}");
        let event = BlockEvent {
            chain: chain.clone(),
            block_hash: block_hash.clone(),
            block_number: 50 + hash_byte as u64,
            index: 0,
            section: "xcmpQueue".to_string(),
            method: "Success".to_string(),
            data: serde_json::json!({"messageHash": hash_hex(hash_byte)}),
        };
        SignedBlockWithEvents {
            chain,
            block_hash,
            block_number: 50 + hash_byte as u64,
            parent_hash: "0xr00".to_string(),
            timestamp_ms: 1_700_000_000_500,
            author: None,
            extrinsics: vec![],
            events: vec![event],
        }
    }

    fn relay_block(hash_byte: u8, origin: &str, destination: &str) -> SignedBlockWithEvents {
        let chain = NetworkId::new(RELAY);
        let block_hash = format!("0xy{hash_byte:02x}");
        let xt = ExtrinsicWithEvents {
            chain: chain.clone(),
            block_hash: block_hash.clone(),
            block_number: 75 + hash_byte as u64,
            extrinsic_id: format!("{}-0", 75 + hash_byte as u64),
            timestamp_ms: 1_700_000_000_250,
            signer: None,
            extra_signers: vec![],
            call_section: "paraInherent".to_string(),
            call_method: "enter".to_string(),
            args: serde_json::json!({
                "horizontalMessages": [{
                    "messageHash": hash_hex(hash_byte),
                    "origin": origin,
                    "destination": destination
                }]
            }),
            events: vec![],
        };
        SignedBlockWithEvents {
            chain,
            block_hash,
            block_number: 75 + hash_byte as u64,
            parent_hash: "0xy00".to_string(),
            timestamp_ms: 1_700_000_000_250,
            author: None,
            extrinsics: vec![xt],
            events: vec![],
        }
    }

    async fn wait_streams(source: &ChannelBlockSource, chain: &str, n: usize) {
        let chain = NetworkId::new(chain);
        for _ in 0..200 {
            if source.stream_count(&chain) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("observers never attached to {chain}");
    }

    async fn next_notification(
        rx: &mut mpsc::UnboundedReceiver<XcmNotifyMessage>,
    ) -> XcmNotifyMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("notification channel closed")
    }

    async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<XcmNotifyMessage>) {
        let outcome = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(outcome.is_err(), "unexpected notification: {outcome:?}");
    }

    #[tokio::test]
    async fn test_subscribe_caps() {
        let w = world_with_caps(1, 1);

        let mut eph = sub("e1", vec![PARA_2004]);
        eph.ephemeral = true;
        w.switchboard.subscribe(eph).await.unwrap();

        let mut eph2 = sub("e2", vec![PARA_2004]);
        eph2.ephemeral = true;
        let err = w.switchboard.subscribe(eph2).await.unwrap_err();
        assert_eq!(err.error_type(), "too_many_subscribers");

        w.switchboard.subscribe(sub("p1", vec![PARA_2004])).await.unwrap();
        let err = w
            .switchboard
            .subscribe(sub("p2", vec![PARA_2004]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MonitorError::TooManySubscribers {
                kind: "persistent",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected() {
        let w = world();
        w.switchboard.subscribe(sub("s1", vec![PARA_2004])).await.unwrap();
        let err = w
            .switchboard
            .subscribe(sub("s1", vec![PARA_2000]))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "duplicate_subscription");
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let w = world();
        w.switchboard.subscribe(sub("s1", vec![PARA_2004])).await.unwrap();
        w.switchboard.unsubscribe("s1").await;
        assert_eq!(w.switchboard.subscription_count().await, 0);
        // Second call and unknown ids only warn
        w.switchboard.unsubscribe("s1").await;
        w.switchboard.unsubscribe("never-existed").await;
    }

    #[tokio::test]
    async fn test_sent_then_received_flow() {
        let mut w = world();
        w.switchboard.subscribe(sub("s1", vec![PARA_2004])).await.unwrap();
        wait_streams(&w.source, PARA_1000, 1).await;
        wait_streams(&w.source, PARA_2004, 1).await;

        w.source.inject(sent_block(0xaa, PARA_2004, "alice")).await;
        let first = next_notification(&mut w.notifications).await;
        assert_eq!(first.event_type(), XcmEventType::Sent);
        assert_eq!(first.subscription_id(), "s1");

        w.source.inject(received_block(PARA_2004, 0xaa)).await;
        let second = next_notification(&mut w.notifications).await;
        assert_eq!(second.event_type(), XcmEventType::Received);
        assert_eq!(second.subscription_id(), "s1");

        // Pending state fully consumed
        let key = outbound_key(&MessageHash([0xaa; 32]), &NetworkId::new(PARA_2004));
        assert!(w.pending.get(Namespace::Outbound, &key).unwrap().is_none());
        assert!(w.pending.get(Namespace::Inbound, &key).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_destination_criteria_mutation() {
        let mut w = world();
        w.switchboard.subscribe(sub("s1", vec![PARA_2004])).await.unwrap();
        wait_streams(&w.source, PARA_1000, 1).await;

        // Message to a destination outside the filter is dropped
        w.source.inject(sent_block(0x01, PARA_2000, "alice")).await;
        expect_silence(&mut w.notifications).await;

        w.switchboard
            .update_destinations("s1", vec![NetworkId::new(PARA_2004), NetworkId::new(PARA_2000)])
            .await
            .unwrap();

        // Same route now admitted
        w.source.inject(sent_block(0x02, PARA_2000, "alice")).await;
        let msg = next_notification(&mut w.notifications).await;
        assert_eq!(msg.event_type(), XcmEventType::Sent);
    }

    #[tokio::test]
    async fn test_sender_recheck_at_fanout() {
        let mut w = world();
        w.switchboard.subscribe(sub("s1", vec![PARA_2004])).await.unwrap();
        wait_streams(&w.source, PARA_1000, 1).await;
        wait_streams(&w.source, PARA_2004, 1).await;

        // Sent recorded while senders = "*"
        w.source.inject(sent_block(0x03, PARA_2004, "acctB")).await;
        let first = next_notification(&mut w.notifications).await;
        assert_eq!(first.event_type(), XcmEventType::Sent);

        // Narrow the filter before the received leg arrives
        w.switchboard
            .update_senders("s1", SendersSpec::Accounts(vec!["acctA".to_string()]))
            .await;

        // Engine still matches internally; fan-out suppresses delivery
        w.source.inject(received_block(PARA_2004, 0x03)).await;
        expect_silence(&mut w.notifications).await;
    }

    #[tokio::test]
    async fn test_events_filter_at_fanout() {
        let mut w = world();
        let mut s = sub("s1", vec![PARA_2004]);
        s.events = EventsSpec::Only(BTreeSet::from([XcmEventType::Received]));
        w.switchboard.subscribe(s).await.unwrap();
        wait_streams(&w.source, PARA_1000, 1).await;
        wait_streams(&w.source, PARA_2004, 1).await;

        w.source.inject(sent_block(0x04, PARA_2004, "alice")).await;
        expect_silence(&mut w.notifications).await;

        w.source.inject(received_block(PARA_2004, 0x04)).await;
        let msg = next_notification(&mut w.notifications).await;
        assert_eq!(msg.event_type(), XcmEventType::Received);
    }

    #[tokio::test]
    async fn test_relayed_flow() {
        let mut w = world();
        w.switchboard.subscribe(sub("s1", vec![PARA_2004])).await.unwrap();
        wait_streams(&w.source, PARA_1000, 1).await;
        wait_streams(&w.source, PARA_2004, 1).await;
        // Relay leg exists: both ends of the route are parachains
        wait_streams(&w.source, RELAY, 1).await;

        w.source.inject(sent_block(0x05, PARA_2004, "alice")).await;
        assert_eq!(
            next_notification(&mut w.notifications).await.event_type(),
            XcmEventType::Sent
        );

        w.source.inject(relay_block(0x05, PARA_1000, PARA_2004)).await;
        assert_eq!(
            next_notification(&mut w.notifications).await.event_type(),
            XcmEventType::Relayed
        );

        w.source.inject(received_block(PARA_2004, 0x05)).await;
        assert_eq!(
            next_notification(&mut w.notifications).await.event_type(),
            XcmEventType::Received
        );
    }

    #[tokio::test]
    async fn test_no_relay_leg_when_events_exclude_relayed() {
        let w = world();
        let mut s = sub("s1", vec![PARA_2004]);
        s.events = EventsSpec::Only(BTreeSet::from([XcmEventType::Sent, XcmEventType::Received]));
        w.switchboard.subscribe(s).await.unwrap();
        wait_streams(&w.source, PARA_1000, 1).await;
        wait_streams(&w.source, PARA_2004, 1).await;

        assert_eq!(w.source.stream_count(&NetworkId::new(RELAY)), 0);

        // Widening the events filter attaches the relay observer
        w.switchboard.update_events("s1", EventsSpec::Any).await;
        wait_streams(&w.source, RELAY, 1).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_race_clears_pending_and_silences() {
        let mut w = world();
        w.switchboard.subscribe(sub("s1", vec![PARA_2004])).await.unwrap();
        wait_streams(&w.source, PARA_1000, 1).await;
        wait_streams(&w.source, PARA_2004, 1).await;

        w.source.inject(sent_block(0x06, PARA_2004, "alice")).await;
        assert_eq!(
            next_notification(&mut w.notifications).await.event_type(),
            XcmEventType::Sent
        );
        let key = outbound_key(&MessageHash([0x06; 32]), &NetworkId::new(PARA_2004));
        assert!(w.pending.get(Namespace::Outbound, &key).unwrap().is_some());

        w.switchboard.unsubscribe("s1").await;
        assert!(w.pending.get(Namespace::Outbound, &key).unwrap().is_none());

        // The counterpart arriving afterwards produces nothing
        w.source.inject(received_block(PARA_2004, 0x06)).await;
        expect_silence(&mut w.notifications).await;
        assert!(w.pending.get(Namespace::Inbound, &key).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_race_silences_relay_leg() {
        let mut w = world();
        w.switchboard.subscribe(sub("s1", vec![PARA_2004])).await.unwrap();
        wait_streams(&w.source, PARA_1000, 1).await;
        wait_streams(&w.source, PARA_2004, 1).await;
        wait_streams(&w.source, RELAY, 1).await;

        w.source.inject(sent_block(0x07, PARA_2004, "alice")).await;
        assert_eq!(
            next_notification(&mut w.notifications).await.event_type(),
            XcmEventType::Sent
        );

        w.switchboard.unsubscribe("s1").await;

        // A relay leg observed after the unsubscribe neither emits nor
        // leaves a relay half behind
        w.source.inject(relay_block(0x07, PARA_1000, PARA_2004)).await;
        expect_silence(&mut w.notifications).await;
        let rkey = relay_key(
            &MessageHash([0x07; 32]),
            &NetworkId::new(PARA_1000),
            &NetworkId::new(PARA_2004),
        );
        assert!(w.pending.get(Namespace::Relay, &rkey).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_then_start_restores_persisted_only() {
        let w = world();
        w.switchboard.subscribe(sub("p1", vec![PARA_2004])).await.unwrap();
        let mut eph = sub("e1", vec![PARA_2004]);
        eph.ephemeral = true;
        w.switchboard.subscribe(eph).await.unwrap();
        assert_eq!(w.switchboard.subscription_count().await, 2);

        w.switchboard.stop().await;
        assert_eq!(w.switchboard.subscription_count().await, 0);

        w.switchboard.start().await.unwrap();
        assert_eq!(w.switchboard.subscription_count().await, 1);
        assert!(w.switchboard.get("p1").await.is_some());
        assert!(w.switchboard.get("e1").await.is_none());
    }

    #[tokio::test]
    async fn test_update_for_unknown_subscription_warns_only() {
        let w = world();
        // None of these return errors for unknown ids
        w.switchboard
            .update_senders("ghost", SendersSpec::Any)
            .await;
        w.switchboard
            .update_destinations("ghost", vec![NetworkId::new(PARA_2004)])
            .await
            .unwrap();
        w.switchboard.update_events("ghost", EventsSpec::Any).await;
        w.switchboard
            .update_subscription(sub("ghost", vec![PARA_2004]))
            .await
            .unwrap();
    }
}
