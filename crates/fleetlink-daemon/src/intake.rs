//! Grant/revoke webhook intake.
//!
//! The cloud posts a [`DeviceCallback`] whenever an end user grants or
//! revokes device access through the consent page. Grants open a channel to
//! the device's relay host if none is live; a revoke that leaves a host with
//! no granted devices closes its channel.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use fleetlink_core::index::{CallbackAction, DeviceCallback};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::fleet::FleetOrchestrator;

/// Route the cloud's callback URL must point at.
pub const CALLBACK_PATH: &str = "/integrator/callback";

pub fn routes(fleet: Arc<FleetOrchestrator>) -> Router {
    Router::new()
        .route(CALLBACK_PATH, post(device_callback))
        .with_state(fleet)
}

/// Serve the intake until `shutdown` flips.
pub async fn serve(
    listener: TcpListener,
    fleet: Arc<FleetOrchestrator>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, path = CALLBACK_PATH, "Callback intake listening");
    }
    axum::serve(listener, routes(fleet))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

async fn device_callback(
    State(fleet): State<Arc<FleetOrchestrator>>,
    Json(callback): Json<DeviceCallback>,
) -> Response {
    let previous_host = fleet.index().device(&callback.device_id).map(|d| d.host);

    let action = match fleet.index().handle_callback(&callback) {
        Ok(action) => action,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
                .into_response();
        }
    };
    info!(
        user_id = %callback.user_id,
        device_id = %callback.device_id,
        action = %action,
        "Device callback applied"
    );

    match action {
        CallbackAction::Add => {
            let host = callback.host.clone();
            if !host.is_empty() && !fleet.is_connected(&host) {
                let fleet = Arc::clone(&fleet);
                tokio::spawn(async move {
                    if let Err(e) = fleet.connect(&host).await {
                        warn!(host = %host, error = %e, "Connect after grant failed");
                    }
                });
            }
        }
        CallbackAction::Remove => {
            if let Some(host) = previous_host
                && !fleet.index().hosts().contains(&host)
            {
                let fleet = Arc::clone(&fleet);
                tokio::spawn(async move {
                    if let Err(e) = fleet.disconnect(&host).await {
                        warn!(host = %host, error = %e, "Disconnect after revoke failed");
                    }
                });
            }
        }
    }

    Json(json!({ "action": action.as_str() })).into_response()
}
