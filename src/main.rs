// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use xcmon::config::MonitorConfig;
use xcmon::ingress::ChannelBlockSource;
use xcmon::node::run_monitor_node;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version)]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = MonitorConfig::load(&args.config_path)?;
    let registry = prometheus::Registry::new();

    // Chain connectivity is an external collaborator: embedders plug an
    // RPC-backed BlockSource in via the library API. The standalone binary
    // runs with the in-process source and serves the management plane.
    let source = Arc::new(ChannelBlockSource::new());
    info!(
        "starting xcmon with {} configured networks",
        config.networks.len()
    );

    let handle = run_monitor_node(config, source, registry).await?;
    handle.wait().await
}
