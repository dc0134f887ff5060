// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Errors surfaced by the monitor core.
///
/// Most of these are recovered locally (logged, retried or dropped); only
/// subscription-surface errors propagate to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    // The backing key-value store failed; retried at the next observation
    StoreUnavailable(String),
    // An extractor could not decode an observation; the observation is dropped
    ExtractorDecode(String),
    // A shared block stream ended or failed; the leg is retried after backoff
    ObserverStream(String),
    // A notifier listener failed; caught per listener
    NotifierListener(String),
    // Subscription cap reached for the given kind ("ephemeral"/"persistent")
    TooManySubscribers { kind: &'static str, limit: u32 },
    // Descriptor failed structural validation
    InvalidSubscription(String),
    // A subscription with this id already exists
    DuplicateSubscription(String),
    // Update addressed to an id nobody holds; warn-only
    UnknownSubscription(String),
    // Configuration rejected at load/validate time
    Config(String),
    // Uncategorized error
    Generic(String),
}

impl MonitorError {
    /// Short stable string identifying the error type for metrics labels.
    pub fn error_type(&self) -> &'static str {
        match self {
            MonitorError::StoreUnavailable(_) => "store_unavailable",
            MonitorError::ExtractorDecode(_) => "extractor_decode",
            MonitorError::ObserverStream(_) => "observer_stream",
            MonitorError::NotifierListener(_) => "notifier_listener",
            MonitorError::TooManySubscribers { .. } => "too_many_subscribers",
            MonitorError::InvalidSubscription(_) => "invalid_subscription",
            MonitorError::DuplicateSubscription(_) => "duplicate_subscription",
            MonitorError::UnknownSubscription(_) => "unknown_subscription",
            MonitorError::Config(_) => "config",
            MonitorError::Generic(_) => "generic",
        }
    }
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::StoreUnavailable(msg) => write!(f, "store unavailable: {msg}"),
            MonitorError::ExtractorDecode(msg) => write!(f, "extractor decode error: {msg}"),
            MonitorError::ObserverStream(msg) => write!(f, "observer stream error: {msg}"),
            MonitorError::NotifierListener(msg) => write!(f, "notifier listener error: {msg}"),
            MonitorError::TooManySubscribers { kind, limit } => {
                write!(f, "too many {kind} subscribers (limit {limit})")
            }
            MonitorError::InvalidSubscription(msg) => write!(f, "invalid subscription: {msg}"),
            MonitorError::DuplicateSubscription(id) => {
                write!(f, "subscription {id} already exists")
            }
            MonitorError::UnknownSubscription(id) => write!(f, "unknown subscription {id}"),
            MonitorError::Config(msg) => write!(f, "config error: {msg}"),
            MonitorError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for MonitorError {}

impl From<sled::Error> for MonitorError {
    fn from(e: sled::Error) -> Self {
        MonitorError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(e: serde_json::Error) -> Self {
        MonitorError::StoreUnavailable(format!("codec: {e}"))
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;
