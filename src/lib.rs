// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! XCM monitoring node.
//!
//! Watches finalized blocks from a set of chains in one consensus network,
//! extracts Cross-Consensus Message (XCM) activity, correlates the sent,
//! received and relayed legs of each message by its hash, and notifies
//! subscribers whose criteria match.
//!
//! The two load-bearing pieces are:
//! - [`matching::MatchingEngine`], which joins the legs of one message
//!   across independent block streams, with durable pending state and TTLs.
//! - [`switchboard::Switchboard`], which owns subscriptions, wires the
//!   observer legs over shared chain streams, recovers failing legs and
//!   fans matched notifications out to the notifier.

#![allow(clippy::too_many_arguments, clippy::new_without_default)]

pub mod config;
pub mod control_query;
pub mod error;
pub mod extractor;
pub mod ingress;
pub mod matching;
pub mod metrics;
pub mod node;
pub mod notifier;
pub mod server;
pub mod stream_hub;
pub mod subscription_store;
pub mod switchboard;
pub mod types;
