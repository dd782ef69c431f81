//! A minimal HTTP health-check surface reporting pairing/hub/cloud
//! connectivity for an orchestrator to poll.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::cloud::CloudSession;
use crate::credential::CredentialStore;

#[derive(Clone)]
struct HealthState {
    credentials: Arc<CredentialStore>,
    cloud: Arc<CloudSession>,
}

fn router(credentials: Arc<CredentialStore>, cloud: Arc<CloudSession>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(HealthState { credentials, cloud })
}

async fn healthz(State(state): State<HealthState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "paired": state.credentials.is_paired().await,
        "hubConnected": state.cloud.is_hub_connected(),
        "cloudConnected": state.cloud.is_authenticated(),
    }))
}

pub async fn serve(port: u16, credentials: Arc<CredentialStore>, cloud: Arc<CloudSession>) -> anyhow::Result<()> {
    let app = router(credentials, cloud);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health: listening");
    axum::serve(listener, app).await?;
    Ok(())
}
