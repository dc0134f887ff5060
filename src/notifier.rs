// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Notification dispatch.
//!
//! The hub presents an event-listener interface keyed by notification kind.
//! Every emitted message is handed to each matching listener; a listener
//! failure is caught, counted and reported without aborting dispatch to the
//! others. Delivery durability is the listener's own concern.

use crate::error::MonitorError;
use crate::metrics::MonitorMetrics;
use crate::types::{Subscription, XcmEventType, XcmNotifyMessage};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const WEBHOOK_MAX_RETRIES: u32 = 3;
const WEBHOOK_RETRY_DELAY_SECS: u64 = 2;

/// Identifier returned by [`NotifierHub::on`], used to detach a listener.
pub type ListenerId = u64;

/// A notification listener. Kept synchronous; listeners doing I/O spawn
/// their own tasks.
pub type NotifyListener =
    Arc<dyn Fn(&Subscription, &XcmNotifyMessage) -> Result<(), MonitorError> + Send + Sync>;

/// Listener registration key: one kind, or every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ListenKey {
    All,
    Kind(XcmEventType),
}

pub struct NotifierHub {
    listeners: RwLock<HashMap<ListenKey, Vec<(ListenerId, NotifyListener)>>>,
    next_id: AtomicU64,
    metrics: Option<Arc<MonitorMetrics>>,
}

impl NotifierHub {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MonitorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a listener for one notification kind, or all kinds when
    /// `kind` is `None`.
    pub fn on(&self, kind: Option<XcmEventType>, listener: NotifyListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let key = match kind {
            Some(k) => ListenKey::Kind(k),
            None => ListenKey::All,
        };
        self.listeners
            .write()
            .unwrap()
            .entry(key)
            .or_default()
            .push((id, listener));
        id
    }

    /// Detach a listener. Unknown ids are ignored.
    pub fn off(&self, id: ListenerId) {
        let mut listeners = self.listeners.write().unwrap();
        for list in listeners.values_mut() {
            list.retain(|(lid, _)| *lid != id);
        }
    }

    /// Dispatch one message to every listener registered for its kind.
    pub fn notify(&self, descriptor: &Subscription, message: &XcmNotifyMessage) {
        let targets: Vec<NotifyListener> = {
            let listeners = self.listeners.read().unwrap();
            let mut targets = Vec::new();
            if let Some(list) = listeners.get(&ListenKey::All) {
                targets.extend(list.iter().map(|(_, l)| l.clone()));
            }
            if let Some(list) = listeners.get(&ListenKey::Kind(message.event_type())) {
                targets.extend(list.iter().map(|(_, l)| l.clone()));
            }
            targets
        };

        debug!(
            "dispatching {} for {} to {} listeners",
            message.event_type(),
            message.subscription_id(),
            targets.len()
        );
        for listener in targets {
            if let Err(e) = listener(descriptor, message) {
                warn!(
                    "notify listener failed for {} ({}): {e}",
                    message.subscription_id(),
                    message.event_type()
                );
                if let Some(m) = &self.metrics {
                    m.notify_errors_total.inc();
                }
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap()
            .values()
            .map(|l| l.len())
            .sum()
    }
}

/// Listener that logs every notification. The default sink.
pub fn log_listener() -> NotifyListener {
    Arc::new(|descriptor, message| {
        info!(
            "[{}] {} {} ({} -> {:?})",
            descriptor.id,
            message.event_type(),
            message.message_hash(),
            descriptor.origin,
            descriptor.destinations,
        );
        Ok(())
    })
}

/// Listener that POSTs each notification as JSON to a webhook endpoint,
/// retrying transient failures in the background.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    pub fn listener(self: Arc<Self>) -> NotifyListener {
        Arc::new(move |_descriptor, message| {
            let this = self.clone();
            let payload = serde_json::to_value(message)
                .map_err(|e| MonitorError::NotifierListener(format!("encode: {e}")))?;
            tokio::spawn(async move {
                this.post_with_retry(payload).await;
            });
            Ok(())
        })
    }

    async fn post_with_retry(&self, payload: serde_json::Value) {
        for attempt in 1..=WEBHOOK_MAX_RETRIES {
            match self
                .client
                .post(&self.url)
                .json(&payload)
                .timeout(Duration::from_secs(10))
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return,
                Ok(response) => warn!(
                    "webhook {} returned {} (attempt {attempt}/{WEBHOOK_MAX_RETRIES})",
                    self.url,
                    response.status()
                ),
                Err(e) => warn!(
                    "webhook {} failed: {e} (attempt {attempt}/{WEBHOOK_MAX_RETRIES})",
                    self.url
                ),
            }
            if attempt < WEBHOOK_MAX_RETRIES {
                tokio::time::sleep(Duration::from_secs(WEBHOOK_RETRY_DELAY_SECS)).await;
            }
        }
        warn!("webhook {} delivery gave up after retries", self.url);
    }
}
