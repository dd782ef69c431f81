//! Integration-level check of the credential lifecycle pairing drives:
//! unpaired at startup, a `StoredCredential` written once pairing
//! completes, and a clean reset back to unpaired on revocation — after
//! the credential store is cleared, `is_paired()` must return false
//! until the next successful `save()`.

use helm_bridge::config::{Args, BridgeConfig};
use helm_bridge::credential::{CredentialStore, StoredCredential};

fn test_args(credential_path: std::path::PathBuf) -> Args {
    Args {
        ha_url: None,
        supervisor_url: Some("http://supervisor/core".into()),
        ha_token: None,
        supervisor_token: Some("test-token".into()),
        cloud_url: None,
        bridge_id: Some("helm-bridge-abcd1234".into()),
        credential_path: Some(credential_path),
        health_port: None,
    }
}

#[tokio::test]
async fn bridge_starts_unpaired_then_becomes_paired_after_the_pairing_flow_writes_a_credential() {
    let dir = tempfile::tempdir().unwrap();
    let credential_path = dir.path().join("credentials.json");
    let config = BridgeConfig::from_args(test_args(credential_path.clone())).unwrap();

    let store = CredentialStore::open(&config.credential_path).await;
    assert!(!store.is_paired().await, "a fresh bridge must start unpaired");

    // Mirrors what the pairing coordinator does once the cloud reports
    // `status: "paired"` with the credential material attached.
    let credential = StoredCredential {
        bridge_id: config.bridge_id.clone(),
        bridge_credential: "bc_deadbeef".into(),
        tenant_id: "42".into(),
        paired_at: Some(chrono::Utc::now()),
        cloud_url: Some(config.cloud_url.clone()),
    };
    store.save(credential.clone()).await.unwrap();
    assert!(store.is_paired().await);

    // A second store opened against the same path (simulating a restart)
    // must observe the persisted credential without re-pairing.
    let reopened = CredentialStore::open(&credential_path).await;
    assert!(reopened.is_paired().await);
    assert_eq!(reopened.load().await, Some(credential));
}

#[tokio::test]
async fn revocation_clears_the_store_back_to_unpaired() {
    let dir = tempfile::tempdir().unwrap();
    let credential_path = dir.path().join("credentials.json");
    let config = BridgeConfig::from_args(test_args(credential_path)).unwrap();
    let store = CredentialStore::open(&config.credential_path).await;

    store
        .save(StoredCredential {
            bridge_id: config.bridge_id.clone(),
            bridge_credential: "bc_deadbeef".into(),
            tenant_id: "42".into(),
            paired_at: Some(chrono::Utc::now()),
            cloud_url: Some(config.cloud_url.clone()),
        })
        .await
        .unwrap();
    assert!(store.is_paired().await);

    // What the cloud session manager does on a "revoked"/"invalid" auth
    // failure.
    store.clear().await.unwrap();
    assert!(!store.is_paired().await);
    assert!(store.load().await.is_none());
}
