use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::auth::session::StoredSession;
use crate::error::CorpregError;

/// Structure for storing sessions with integrity checks
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionStoragePayload {
    /// The persisted session and its credentials
    session: StoredSession,
    /// When this storage entry was created
    created_at: chrono::DateTime<Utc>,
    /// Hash to verify session integrity
    integrity_hash: String,
}

/// File-backed store for durable-local sessions.
///
/// Entries live in one JSON object keyed by namespace, so several apps can
/// share a file without clobbering each other.
pub struct SessionStore {
    path: PathBuf,
    namespace: String,
    /// Serialises read-modify-write cycles on the file
    io: Mutex<()>,
}

impl SessionStore {
    /// Create a new session store
    pub fn new(path: impl Into<PathBuf>, namespace: &str) -> Self {
        Self {
            path: path.into(),
            namespace: namespace.to_string(),
            io: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a session
    pub async fn store(&self, stored: &StoredSession) -> Result<()> {
        let _io = self.io.lock().await;
        let mut entries = self.read_entries().await?;

        let payload = SessionStoragePayload {
            session: stored.clone(),
            created_at: Utc::now(),
            integrity_hash: self.calculate_integrity_hash(stored),
        };

        entries.insert(self.make_storage_key(), serde_json::to_value(payload)?);
        self.write_entries(&entries).await?;

        info!(namespace = %self.namespace, uid = %stored.session.uid, "Session stored");
        Ok(())
    }

    /// Retrieve the persisted session, if any
    pub async fn retrieve(&self) -> Result<Option<StoredSession>> {
        let _io = self.io.lock().await;
        let entries = self.read_entries().await?;
        let key = self.make_storage_key();

        let payload = match entries.get(&key) {
            Some(value) => serde_json::from_value::<SessionStoragePayload>(value.clone())
                .map_err(|e| anyhow!("Failed to deserialize session payload: {}", e))?,
            None => {
                debug!(namespace = %self.namespace, "No session found in store");
                return Ok(None);
            }
        };

        let expected_hash = self.calculate_integrity_hash(&payload.session);
        if expected_hash != payload.integrity_hash {
            error!(
                namespace = %self.namespace,
                "Session integrity check failed, possible tampering"
            );
            return Err(CorpregError::StoreIntegrity { key }.into());
        }

        debug!(namespace = %self.namespace, "Session retrieved from store");
        Ok(Some(payload.session))
    }

    /// Remove the persisted session
    pub async fn clear(&self) -> Result<()> {
        let _io = self.io.lock().await;
        let mut entries = self.read_entries().await?;

        if entries.remove(&self.make_storage_key()).is_some() {
            self.write_entries(&entries).await?;
            info!(namespace = %self.namespace, "Session removed from store");
        } else {
            debug!(namespace = %self.namespace, "No session to remove from store");
        }

        Ok(())
    }

    /// Generate the storage key for this namespace
    fn make_storage_key(&self) -> String {
        format!("auth_session_{}", self.namespace)
    }

    /// Calculate an integrity hash over the critical session fields
    fn calculate_integrity_hash(&self, stored: &StoredSession) -> String {
        let session_string = format!(
            "{}:{}:{}:{}:{}:{}",
            stored.session.uid,
            stored.session.email,
            stored.session.email_verified,
            stored.credentials.id_token,
            stored.credentials.refresh_token,
            stored.credentials.expires_at.to_rfc3339()
        );

        let mut hasher = Sha256::new();
        hasher.update(session_string.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    async fn read_entries(&self) -> Result<HashMap<String, serde_json::Value>> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(HashMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents).map_err(CorpregError::from)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(CorpregError::from(e).into()),
        }
    }

    async fn write_entries(&self, entries: &HashMap<String, serde_json::Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(CorpregError::from)?;
            }
        }

        let contents = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, contents).await.map_err(CorpregError::from)?;
        Ok(())
    }
}
