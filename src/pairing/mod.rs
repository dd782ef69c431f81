//! Pairing coordinator — the one-time HTTP flow that exchanges an
//! operator-entered pairing code for a persisted bridge credential.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::credential::{CredentialStore, StoredCredential};
use crate::error::PairingError;

const POLL_INTERVAL: Duration = Duration::from_millis(5_000);
const MAX_POLL_ATTEMPTS: u32 = 120;

pub struct PairingCoordinator {
    client: reqwest::Client,
    cloud_url: String,
    bridge_id: String,
    credentials: Arc<CredentialStore>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairingCodeResponse {
    code: String,
    #[allow(dead_code)]
    #[serde(default)]
    expires_at: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    expires_in_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairingStatusResponse {
    status: String,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    bridge_credential: Option<String>,
    #[serde(default)]
    bridge_id: Option<String>,
}

#[derive(Debug, PartialEq)]
enum PollOutcome {
    Pending,
    Expired,
    Paired(StoredCredential),
    /// `status:"paired"` but the server didn't (or couldn't) include the
    /// credential material — it was already claimed by another poller.
    PairedWithoutCredential,
}

impl PairingCoordinator {
    pub fn new(config: &BridgeConfig, credentials: Arc<CredentialStore>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cloud_url: config.cloud_url.clone(),
            bridge_id: config.bridge_id.clone(),
            credentials,
        }
    }

    /// No-op if already paired. Otherwise requests a pairing code, prints
    /// it for the operator, and polls every 5s for up to 120 attempts.
    pub async fn ensure_paired(&self, ha_version: Option<&str>) -> Result<(), PairingError> {
        if self.credentials.is_paired().await {
            info!("pairing: already paired, skipping");
            return Ok(());
        }

        let code = self.request_pairing_code(ha_version).await?;
        info!(code = %code.code, "pairing: enter this code in the Helm app to finish pairing");

        for attempt in 1..=MAX_POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;

            // Another path (a concurrent poller, a manual redeem) may have
            // completed pairing already; checking the local store first
            // lets us exit the loop without waiting on the network.
            if self.credentials.is_paired().await {
                info!("pairing: local credential store populated by another path, proceeding");
                return Ok(());
            }

            match self.poll_status(&code.code).await {
                Ok(PollOutcome::Pending) => {
                    if attempt % 6 == 0 {
                        info!(attempt, "pairing: still waiting for the code to be claimed");
                    }
                }
                Ok(PollOutcome::Expired) => {
                    warn!("pairing: code expired before pairing completed");
                    return Err(PairingError::Expired);
                }
                Ok(PollOutcome::Paired(credential)) => {
                    self.credentials
                        .save(credential)
                        .await
                        .map_err(|e| PairingError::Store(e.to_string()))?;
                    info!("pairing: complete");
                    return Ok(());
                }
                Ok(PollOutcome::PairedWithoutCredential) => {
                    if self.credentials.is_paired().await {
                        return Ok(());
                    }
                    warn!("pairing: code was redeemed but the credential was already claimed elsewhere; restart the bridge to retry pairing");
                    return Err(PairingError::AlreadyClaimed);
                }
                Err(PairingError::NotFound) => {
                    // Race with a just-redeemed code whose record has not
                    // propagated yet; keep polling unless we're already paired.
                    if self.credentials.is_paired().await {
                        return Ok(());
                    }
                }
                Err(e) => {
                    // Transport error or non-JSON response: transient, log
                    // and keep polling until the attempt cap is reached.
                    warn!(error = %e, attempt, "pairing: status poll failed, retrying");
                }
            }
        }

        warn!(attempts = MAX_POLL_ATTEMPTS, "pairing: poll attempts exhausted without completion");
        Err(PairingError::Exhausted)
    }

    async fn request_pairing_code(&self, ha_version: Option<&str>) -> Result<PairingCodeResponse, PairingError> {
        let url = format!("{}/api/bridge/pairing-codes", self.cloud_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "bridgeId": self.bridge_id,
                "bridgeVersion": env!("CARGO_PKG_VERSION"),
                "haVersion": ha_version,
            }))
            .send()
            .await?;
        response.json::<PairingCodeResponse>().await.map_err(|_| PairingError::NotJson)
    }

    async fn poll_status(&self, code: &str) -> Result<PollOutcome, PairingError> {
        let url = format!(
            "{}/api/bridge/pairing-codes/{}/status",
            self.cloud_url.trim_end_matches('/'),
            code
        );
        let response = self.client.get(&url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(PairingError::NotFound);
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("json"))
            .unwrap_or(false);
        if !is_json {
            return Err(PairingError::NotJson);
        }

        let body: PairingStatusResponse = response.json().await.map_err(|_| PairingError::NotJson)?;
        parse_poll_outcome(body, &self.bridge_id, &self.cloud_url)
    }
}

fn parse_poll_outcome(
    body: PairingStatusResponse,
    bridge_id: &str,
    cloud_url: &str,
) -> Result<PollOutcome, PairingError> {
    match body.status.as_str() {
        "pending" => Ok(PollOutcome::Pending),
        "expired" => Ok(PollOutcome::Expired),
        "paired" => match (body.bridge_credential, body.tenant_id) {
            (Some(bridge_credential), Some(tenant_id)) => Ok(PollOutcome::Paired(StoredCredential {
                bridge_id: body.bridge_id.unwrap_or_else(|| bridge_id.to_string()),
                bridge_credential,
                tenant_id,
                paired_at: Some(Utc::now()),
                cloud_url: Some(cloud_url.to_string()),
            })),
            _ => Ok(PollOutcome::PairedWithoutCredential),
        },
        _ => Ok(PollOutcome::Pending),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(status: &str, tenant_id: Option<&str>, bridge_credential: Option<&str>, bridge_id: Option<&str>) -> PairingStatusResponse {
        PairingStatusResponse {
            status: status.into(),
            tenant_id: tenant_id.map(String::from),
            bridge_credential: bridge_credential.map(String::from),
            bridge_id: bridge_id.map(String::from),
        }
    }

    #[test]
    fn pending_status_is_pending() {
        let b = body("pending", None, None, None);
        assert_eq!(parse_poll_outcome(b, "helm-bridge-abcd1234", "https://helm.replit.app").unwrap(), PollOutcome::Pending);
    }

    #[test]
    fn expired_status_is_expired() {
        let b = body("expired", None, None, None);
        assert_eq!(parse_poll_outcome(b, "helm-bridge-abcd1234", "https://helm.replit.app").unwrap(), PollOutcome::Expired);
    }

    #[test]
    fn paired_status_without_credential_fields_is_paired_without_credential() {
        let b = body("paired", None, None, None);
        assert_eq!(
            parse_poll_outcome(b, "helm-bridge-abcd1234", "https://helm.replit.app").unwrap(),
            PollOutcome::PairedWithoutCredential
        );
    }

    #[test]
    fn paired_status_with_credential_yields_a_storable_credential() {
        let b = body("paired", Some("42"), Some("bc_deadbeef"), Some("helm-bridge-abcd1234"));
        match parse_poll_outcome(b, "helm-bridge-abcd1234", "https://helm.replit.app").unwrap() {
            PollOutcome::Paired(cred) => {
                assert_eq!(cred.bridge_id, "helm-bridge-abcd1234");
                assert_eq!(cred.tenant_id, "42");
                assert_eq!(cred.bridge_credential, "bc_deadbeef");
                assert_eq!(cred.cloud_url.as_deref(), Some("https://helm.replit.app"));
            }
            other => panic!("expected Paired, got {other:?}"),
        }
    }

    #[test]
    fn paired_status_falls_back_to_local_bridge_id_if_server_omits_it() {
        let b = body("paired", Some("42"), Some("bc_deadbeef"), None);
        match parse_poll_outcome(b, "helm-bridge-abcd1234", "https://helm.replit.app").unwrap() {
            PollOutcome::Paired(cred) => assert_eq!(cred.bridge_id, "helm-bridge-abcd1234"),
            other => panic!("expected Paired, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_status_is_treated_as_pending() {
        let b = body("something_new", None, None, None);
        assert_eq!(parse_poll_outcome(b, "helm-bridge-abcd1234", "https://helm.replit.app").unwrap(), PollOutcome::Pending);
    }
}
