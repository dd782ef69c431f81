//! Credential store — single-file persistence for the bridge's pairing
//! secret.
//!
//! Writes are atomic: we write a pretty-printed JSON snapshot to a temp
//! file in the same directory and `rename` over the destination, since a
//! single `tokio::fs::write` call does not fully guarantee against a
//! partial write being observable on crash.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredCredential {
    pub bridge_id: String,
    pub bridge_credential: String,
    pub tenant_id: String,
    #[serde(default)]
    pub paired_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub cloud_url: Option<String>,
}

impl StoredCredential {
    /// A redacted view safe to put in a log line — never log
    /// `bridge_credential` in full.
    pub fn masked(&self) -> String {
        let tail: String = self
            .bridge_credential
            .chars()
            .rev()
            .take(4)
            .collect::<String>()
            .chars()
            .rev()
            .collect();
        format!(
            "StoredCredential {{ bridge_id: {}, tenant_id: {}, bridge_credential: ...{} }}",
            self.bridge_id, self.tenant_id, tail
        )
    }
}

/// Process-wide credential state, handed to the pairing coordinator, the
/// cloud session manager, and the orchestrator as an owned component
/// rather than a global.
pub struct CredentialStore {
    path: PathBuf,
    cached: RwLock<Option<StoredCredential>>,
}

impl CredentialStore {
    /// Construct the store and eagerly load whatever is on disk.
    /// `load()` failures are non-fatal — the bridge degrades to unpaired.
    pub async fn open(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let initial = load_from_disk(&path).await.unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "credential store: load failed, starting unpaired");
            None
        });
        Arc::new(Self {
            path,
            cached: RwLock::new(initial),
        })
    }

    pub async fn load(&self) -> Option<StoredCredential> {
        self.cached.read().await.clone()
    }

    pub async fn is_paired(&self) -> bool {
        self.cached
            .read()
            .await
            .as_ref()
            .map(|c| !c.bridge_credential.is_empty())
            .unwrap_or(false)
    }

    /// Persist a credential, replacing whatever was there. Atomic: writes a
    /// temp file in the destination's directory, then renames over it.
    pub async fn save(&self, credential: StoredCredential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating credential directory {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(&credential).context("serializing credential")?;
        write_atomic(&self.path, &json).await?;

        info!(bridge_id = %credential.bridge_id, "credential store: saved");
        *self.cached.write().await = Some(credential);
        Ok(())
    }

    /// Remove the credential file and clear the in-memory copy. Called on
    /// explicit user-initiated disconnect or on revocation/invalidity.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("removing credential file"),
        }
        *self.cached.write().await = None;
        info!("credential store: cleared");
        Ok(())
    }
}

async fn load_from_disk(path: &Path) -> Result<Option<StoredCredential>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("reading credential file"),
    };
    let credential: StoredCredential =
        serde_json::from_str(&contents).context("parsing credential file")?;
    if credential.bridge_credential.is_empty() {
        return Ok(None);
    }
    Ok(Some(credential))
}

async fn write_atomic(dest: &Path, contents: &str) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let dir = dir.to_path_buf();
    let contents = contents.to_string();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).context("creating temp credential file")?;
        tmp.write_all(contents.as_bytes())
            .context("writing temp credential file")?;
        tmp.flush().context("flushing temp credential file")?;
        tmp.persist(&dest).context("renaming temp credential file into place")?;
        Ok(())
    })
    .await
    .context("temp-file write task panicked")??;
    Ok(())
}
