// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{MonitorError, MonitorResult};
use crate::types::{NetworkId, NetworkInfo, NetworkKind, NetworkRegistry};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_listen_port() -> u16 {
    3000
}

fn default_max_subscriptions() -> u32 {
    10_000
}

fn default_scheduler_frequency_ms() -> u32 {
    30_000
}

fn default_sweep_expiry_ms() -> u32 {
    3_600_000
}

fn default_sub_error_retry_ms() -> u32 {
    5_000
}

/// One chain in the monitored consensus network.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkConfig {
    // URN of the chain, e.g. urn:ocn:polkadot:0
    pub id: String,
    // Whether this network is a relay chain
    #[serde(default)]
    pub relay: bool,
    // URN of the relay chain this parachain is bound to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_of: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MonitorConfig {
    // Path of the backing key-value database (pending state + subscriptions)
    pub db_path: PathBuf,
    // The port the management server listens on
    #[serde(default = "default_listen_port")]
    pub server_listen_port: u16,
    // Networks this monitor observes
    pub networks: Vec<NetworkConfig>,
    #[serde(default = "default_max_subscriptions")]
    pub subscription_max_ephemeral: u32,
    #[serde(default = "default_max_subscriptions")]
    pub subscription_max_persistent: u32,
    // Cadence of the pending-state sweep scheduler
    #[serde(default = "default_scheduler_frequency_ms")]
    pub scheduler_frequency_ms: u32,
    // Retention of counterpart-less inbound/relay half entries
    #[serde(default = "default_sweep_expiry_ms")]
    pub sweep_expiry_ms: u32,
    // Backoff before re-attaching a failed observer leg
    #[serde(default = "default_sub_error_retry_ms")]
    pub sub_error_retry_ms: u32,
    // Optional webhook endpoint notifications are POSTed to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl MonitorConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
        let config: MonitorConfig = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Bounds and cross-field checks. Called at load time and again by the
    /// node before wiring services.
    pub fn validate(&self) -> MonitorResult<()> {
        if self.scheduler_frequency_ms < 1_000 {
            return Err(MonitorError::Config(format!(
                "scheduler-frequency-ms must be >= 1000, got {}",
                self.scheduler_frequency_ms
            )));
        }
        if self.sweep_expiry_ms < 20_000 {
            return Err(MonitorError::Config(format!(
                "sweep-expiry-ms must be >= 20000, got {}",
                self.sweep_expiry_ms
            )));
        }
        if self.networks.is_empty() {
            return Err(MonitorError::Config(
                "at least one network must be configured".to_string(),
            ));
        }
        self.network_registry()?;
        Ok(())
    }

    /// Build the network table, checking relay references resolve.
    pub fn network_registry(&self) -> MonitorResult<NetworkRegistry> {
        let relays: Vec<&str> = self
            .networks
            .iter()
            .filter(|n| n.relay)
            .map(|n| n.id.as_str())
            .collect();

        let mut infos = Vec::with_capacity(self.networks.len());
        for net in &self.networks {
            let kind = if net.relay {
                if net.relay_of.is_some() {
                    return Err(MonitorError::Config(format!(
                        "network {} is a relay and cannot declare relay-of",
                        net.id
                    )));
                }
                NetworkKind::Relay
            } else {
                let relay = match &net.relay_of {
                    Some(r) => r.clone(),
                    // A single-relay network table needs no explicit binding
                    None if relays.len() == 1 => relays[0].to_string(),
                    None => {
                        return Err(MonitorError::Config(format!(
                            "parachain {} must declare relay-of",
                            net.id
                        )))
                    }
                };
                if !relays.contains(&relay.as_str()) {
                    return Err(MonitorError::Config(format!(
                        "parachain {} references unknown relay {relay}",
                        net.id
                    )));
                }
                NetworkKind::Parachain {
                    relay: NetworkId::new(relay),
                }
            };
            infos.push(NetworkInfo {
                id: NetworkId::new(net.id.clone()),
                kind,
            });
        }
        Ok(NetworkRegistry::new(infos))
    }

    pub fn scheduler_frequency(&self) -> Duration {
        Duration::from_millis(self.scheduler_frequency_ms as u64)
    }

    pub fn sweep_expiry(&self) -> Duration {
        Duration::from_millis(self.sweep_expiry_ms as u64)
    }

    pub fn sub_error_retry(&self) -> Duration {
        Duration::from_millis(self.sub_error_retry_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> MonitorConfig {
        serde_json::from_str(
            r#"{
                "db-path": "/tmp/xcmon-test-db",
                "networks": [
                    { "id": "urn:ocn:polkadot:0", "relay": true },
                    { "id": "urn:ocn:polkadot:1000" },
                    { "id": "urn:ocn:polkadot:2004" }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = base_config();
        assert_eq!(config.server_listen_port, 3000);
        assert_eq!(config.subscription_max_ephemeral, 10_000);
        assert_eq!(config.subscription_max_persistent, 10_000);
        assert_eq!(config.scheduler_frequency_ms, 30_000);
        assert_eq!(config.sub_error_retry_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scheduler_frequency_floor() {
        let mut config = base_config();
        config.scheduler_frequency_ms = 999;
        assert!(config.validate().is_err());
        config.scheduler_frequency_ms = 1_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sweep_expiry_floor() {
        let mut config = base_config();
        config.sweep_expiry_ms = 19_999;
        assert!(config.validate().is_err());
        config.sweep_expiry_ms = 20_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_relay_binds_parachains_implicitly() {
        let config = base_config();
        let registry = config.network_registry().unwrap();
        assert_eq!(
            registry.relay_of(&NetworkId::new("urn:ocn:polkadot:2004")),
            Some(NetworkId::new("urn:ocn:polkadot:0"))
        );
    }

    #[test]
    fn test_parachain_with_unknown_relay_rejected() {
        let mut config = base_config();
        config.networks[1].relay_of = Some("urn:ocn:kusama:0".to_string());
        assert!(config.network_registry().is_err());
    }

    #[test]
    fn test_multi_relay_requires_explicit_binding() {
        let mut config = base_config();
        config.networks.push(NetworkConfig {
            id: "urn:ocn:kusama:0".to_string(),
            relay: true,
            relay_of: None,
        });
        // Two relays, parachains no longer bind implicitly
        assert!(config.network_registry().is_err());

        config.networks[1].relay_of = Some("urn:ocn:polkadot:0".to_string());
        config.networks[2].relay_of = Some("urn:ocn:polkadot:0".to_string());
        assert!(config.network_registry().is_ok());
    }
}
