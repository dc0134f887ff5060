// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Management API.
//!
//! Subscription CRUD plus health and metrics, served by axum. The heavy
//! lifting happens in the switchboard; handlers translate between HTTP and
//! the monitor error taxonomy.

use crate::error::MonitorError;
use crate::switchboard::Switchboard;
use crate::types::Subscription;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use prometheus::{Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub const HEALTH_PATH: &str = "/health";
pub const METRICS_PATH: &str = "/metrics";
pub const SUBS_PATH: &str = "/subs";

type ServerState = (Switchboard, Arc<Registry>);

pub fn run_server(
    socket_address: &SocketAddr,
    switchboard: Switchboard,
    registry: Arc<Registry>,
) -> tokio::task::JoinHandle<()> {
    let socket_address = *socket_address;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(socket_address).await.unwrap();
        info!(
            "management server listening on {}",
            listener.local_addr().unwrap()
        );
        axum::serve(listener, make_router(switchboard, registry).into_make_service())
            .await
            .unwrap();
    })
}

pub(crate) fn make_router(switchboard: Switchboard, registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route(HEALTH_PATH, get(health_check))
        .route(METRICS_PATH, get(metrics))
        .route(SUBS_PATH, post(create_subscription))
        .route(SUBS_PATH, get(list_subscriptions))
        .route("/subs/:id", get(get_subscription))
        .route("/subs/:id", put(update_subscription))
        .route("/subs/:id", delete(delete_subscription))
        .with_state((switchboard, registry))
}

impl axum::response::IntoResponse for MonitorError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            MonitorError::TooManySubscribers { .. } => StatusCode::TOO_MANY_REQUESTS,
            MonitorError::InvalidSubscription(_) | MonitorError::DuplicateSubscription(_) => {
                StatusCode::BAD_REQUEST
            }
            MonitorError::UnknownSubscription(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State((_, registry)): State<ServerState>) -> Result<String, MonitorError> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .map_err(|e| MonitorError::Generic(format!("metrics encoding failed: {e}")))
}

async fn create_subscription(
    State((switchboard, _)): State<ServerState>,
    Json(descriptor): Json<Subscription>,
) -> Result<StatusCode, MonitorError> {
    switchboard.subscribe(descriptor).await?;
    Ok(StatusCode::CREATED)
}

async fn list_subscriptions(
    State((switchboard, _)): State<ServerState>,
) -> Json<Vec<Subscription>> {
    Json(switchboard.list().await)
}

async fn get_subscription(
    State((switchboard, _)): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<Subscription>, MonitorError> {
    switchboard
        .get(&id)
        .await
        .map(Json)
        .ok_or(MonitorError::UnknownSubscription(id))
}

async fn update_subscription(
    State((switchboard, _)): State<ServerState>,
    Path(id): Path<String>,
    Json(descriptor): Json<Subscription>,
) -> Result<StatusCode, MonitorError> {
    if descriptor.id != id {
        return Err(MonitorError::InvalidSubscription(format!(
            "descriptor id {} does not match path id {id}",
            descriptor.id
        )));
    }
    switchboard.update_subscription(descriptor).await?;
    Ok(StatusCode::OK)
}

async fn delete_subscription(
    State((switchboard, _)): State<ServerState>,
    Path(id): Path<String>,
) -> StatusCode {
    switchboard.unsubscribe(&id).await;
    StatusCode::OK
}
