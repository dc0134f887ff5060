// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, IntCounter, IntCounterVec, IntGaugeVec, Registry,
};

#[derive(Clone, Debug)]
pub struct MonitorMetrics {
    /// Lifecycle notifications emitted, by type.
    pub notifications_total: IntCounterVec,
    /// Sent/received pairs joined.
    pub matched_total: IntCounter,
    /// Sent halves that expired unmatched.
    pub timeouts_total: IntCounter,
    /// Observations suppressed as duplicates or post-terminal.
    pub duplicates_total: IntCounter,
    /// Pending half-matches, by namespace.
    pub pending_entries: IntGaugeVec,
    /// Live subscriptions, by kind.
    pub active_subscriptions: IntGaugeVec,
    /// Observer leg failures, by chain.
    pub subscription_errors_total: IntCounterVec,
    /// Notifier listener failures.
    pub notify_errors_total: IntCounter,
    /// Observations dropped by extractor decode failures, by chain.
    pub extractor_errors_total: IntCounterVec,
    /// Finalized blocks fanned out, by chain.
    pub blocks_observed_total: IntCounterVec,
}

impl MonitorMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            notifications_total: register_int_counter_vec_with_registry!(
                "xcmon_notifications_total",
                "Total lifecycle notifications emitted by type",
                &["type"],
                registry,
            )
            .unwrap(),
            matched_total: register_int_counter_with_registry!(
                "xcmon_matched_total",
                "Total sent/received pairs joined",
                registry,
            )
            .unwrap(),
            timeouts_total: register_int_counter_with_registry!(
                "xcmon_timeouts_total",
                "Total sent halves that expired unmatched",
                registry,
            )
            .unwrap(),
            duplicates_total: register_int_counter_with_registry!(
                "xcmon_duplicates_total",
                "Total observations suppressed as duplicates",
                registry,
            )
            .unwrap(),
            pending_entries: register_int_gauge_vec_with_registry!(
                "xcmon_pending_entries",
                "Current pending half-matches by namespace",
                &["namespace"],
                registry,
            )
            .unwrap(),
            active_subscriptions: register_int_gauge_vec_with_registry!(
                "xcmon_active_subscriptions",
                "Current live subscriptions by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            subscription_errors_total: register_int_counter_vec_with_registry!(
                "xcmon_subscription_errors_total",
                "Total observer leg failures by chain",
                &["chain"],
                registry,
            )
            .unwrap(),
            notify_errors_total: register_int_counter_with_registry!(
                "xcmon_notify_errors_total",
                "Total notifier listener failures",
                registry,
            )
            .unwrap(),
            extractor_errors_total: register_int_counter_vec_with_registry!(
                "xcmon_extractor_errors_total",
                "Total observations dropped by extractor decode failures",
                &["chain"],
                registry,
            )
            .unwrap(),
            blocks_observed_total: register_int_counter_vec_with_registry!(
                "xcmon_blocks_observed_total",
                "Total finalized blocks fanned out by chain",
                &["chain"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new();
        let metrics = MonitorMetrics::new(&registry);
        metrics.notifications_total.with_label_values(&["sent"]).inc();
        metrics.matched_total.inc();
        metrics
            .pending_entries
            .with_label_values(&["outbound"])
            .set(3);

        let families = registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "xcmon_matched_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "xcmon_notifications_total"));
    }
}
