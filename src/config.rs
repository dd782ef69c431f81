//! Bridge configuration — environment-variable driven, immutable for the
//! process lifetime. CLI/env wins, falls back to a built-in default; there
//! is no TOML layer here since the bridge has exactly one operator-facing
//! knob set and it all fits in environment variables.

use clap::Parser;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::PathBuf;

const DEFAULT_HUB_URL: &str = "http://supervisor/core";
const DEFAULT_CLOUD_URL: &str = "https://helm.replit.app";
const DEFAULT_CREDENTIAL_PATH: &str = "/data/credentials.json";
const DEFAULT_HEALTH_PORT: u16 = 8099;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 60_000;
const PROTOCOL_VERSION: u32 = 1;

/// CLI/env surface. Every field has an environment variable wired through
/// clap's `env` derive.
#[derive(Parser, Debug, Clone)]
#[command(name = "helm-bridge", about = "Helm home-automation bridge daemon")]
pub struct Args {
    /// Local hub base URL.
    #[arg(long, env = "HA_URL")]
    pub ha_url: Option<String>,

    /// Supervisor-style hub base URL (takes priority over `HA_URL` if set).
    #[arg(long, env = "SUPERVISOR_URL")]
    pub supervisor_url: Option<String>,

    /// Hub bearer token. Required — fatal configuration error if absent.
    #[arg(long, env = "HA_TOKEN")]
    pub ha_token: Option<String>,

    /// Supervisor-style hub token (takes priority over `HA_TOKEN` if set).
    #[arg(long, env = "SUPERVISOR_TOKEN")]
    pub supervisor_token: Option<String>,

    /// Cloud base URL.
    #[arg(long, env = "CLOUD_URL")]
    pub cloud_url: Option<String>,

    /// Stable bridge identifier. Auto-generated and not persisted across
    /// restarts unless the operator pins it via this variable.
    #[arg(long, env = "BRIDGE_ID")]
    pub bridge_id: Option<String>,

    /// Credential file path.
    #[arg(long, env = "CREDENTIAL_PATH")]
    pub credential_path: Option<PathBuf>,

    /// External health-check HTTP port.
    #[arg(long, env = "HEALTH_PORT")]
    pub health_port: Option<u16>,
}

/// Resolved, immutable bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub hub_url: String,
    pub hub_token: String,
    pub cloud_url: String,
    pub bridge_id: String,
    pub credential_path: PathBuf,
    pub health_port: u16,
    pub heartbeat_interval_ms: u64,
    pub protocol_version: u32,
}

impl BridgeConfig {
    /// Build configuration from CLI args / environment variables.
    ///
    /// Returns [`crate::error::ConfigError::MissingHubToken`] if no hub
    /// token is configured — the hub token is mandatory, and its absence is
    /// a fatal configuration error.
    pub fn from_args(args: Args) -> Result<Self, crate::error::ConfigError> {
        let hub_url = args
            .supervisor_url
            .or(args.ha_url)
            .unwrap_or_else(|| DEFAULT_HUB_URL.to_string());

        let hub_token = args
            .supervisor_token
            .or(args.ha_token)
            .ok_or(crate::error::ConfigError::MissingHubToken)?;

        let cloud_url = args.cloud_url.unwrap_or_else(|| DEFAULT_CLOUD_URL.to_string());
        let bridge_id = args.bridge_id.unwrap_or_else(generate_bridge_id);
        let credential_path = args
            .credential_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CREDENTIAL_PATH));
        let health_port = args.health_port.unwrap_or(DEFAULT_HEALTH_PORT);

        Ok(Self {
            hub_url,
            hub_token,
            cloud_url,
            bridge_id,
            credential_path,
            health_port,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            protocol_version: PROTOCOL_VERSION,
        })
    }

    /// Convenience for tests and for the `serve` entrypoint.
    pub fn from_env() -> Result<Self, crate::error::ConfigError> {
        Self::from_args(Args::parse())
    }
}

/// Generates a default bridge id of the form `helm-bridge-<8 lowercase alnum>`.
fn generate_bridge_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("helm-bridge-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_hub_token_is_fatal() {
        let args = Args {
            ha_url: None,
            supervisor_url: None,
            ha_token: None,
            supervisor_token: None,
            cloud_url: None,
            bridge_id: None,
            credential_path: None,
            health_port: None,
        };
        let err = BridgeConfig::from_args(args).unwrap_err();
        assert!(matches!(err, crate::error::ConfigError::MissingHubToken));
    }

    #[test]
    fn supervisor_variables_take_priority() {
        let args = Args {
            ha_url: Some("http://example.invalid".into()),
            supervisor_url: Some("http://supervisor/core".into()),
            ha_token: Some("ha-token".into()),
            supervisor_token: Some("super-token".into()),
            cloud_url: None,
            bridge_id: Some("helm-bridge-testtest".into()),
            credential_path: None,
            health_port: None,
        };
        let cfg = BridgeConfig::from_args(args).unwrap();
        assert_eq!(cfg.hub_url, "http://supervisor/core");
        assert_eq!(cfg.hub_token, "super-token");
    }

    #[test]
    fn bridge_id_is_generated_with_expected_shape() {
        let id = generate_bridge_id();
        assert!(id.starts_with("helm-bridge-"));
        assert_eq!(id.len(), "helm-bridge-".len() + 8);
    }
}
