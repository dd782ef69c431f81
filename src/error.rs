//! Typed leaf errors that callers need to match on, layered under `anyhow`
//! for everything else: `anyhow` pervasively, `thiserror` for a handful of
//! structured error enums.

use thiserror::Error;

/// Outcome of a hub RPC call issued through [`crate::hub::session::HubSession`].
#[derive(Debug, Clone, Error)]
pub enum HubRpcError {
    #[error("command timeout")]
    Timeout,
    #[error("hub disconnected")]
    Disconnected,
    #[error("hub error: {0}")]
    Remote(String),
}

/// Fatal configuration problems — these abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("HA_TOKEN / SUPERVISOR_TOKEN is required but was not set")]
    MissingHubToken,
    #[error("invalid hub URL {0:?}: {1}")]
    InvalidHubUrl(String, String),
}

/// Outcome of one pairing-code status poll.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("pairing HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("pairing status response was not JSON, or was missing required fields")]
    NotJson,
    #[error("pairing code not yet known to the server")]
    NotFound,
    #[error("pairing code expired before the operator completed pairing")]
    Expired,
    #[error("pairing code was redeemed but the credential was already claimed by another bridge instance")]
    AlreadyClaimed,
    #[error("pairing poll attempts exhausted without the code being claimed")]
    Exhausted,
    #[error("failed to persist the paired credential: {0}")]
    Store(String),
}
