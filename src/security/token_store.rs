use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const STATE_FILE: &str = "token_state.json";

/// Current belief about access- and refresh-credential expiry.
///
/// Both timestamps already include the safety margin; validity is a plain
/// comparison against the clock. `access <= refresh` is expected but not
/// enforced here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenExpiry {
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

impl TokenExpiry {
    pub fn is_access_valid(&self) -> bool {
        self.access_expires_at > Utc::now()
    }

    pub fn is_refresh_valid(&self) -> bool {
        self.refresh_expires_at > Utc::now()
    }
}

/// Durable token-expiry store shared by every process of the same session,
/// with a per-process in-memory cache.
///
/// The state file lives in the session directory; writes go through a temp
/// file plus rename so a concurrent reader never observes a torn record.
/// Expiry timestamps are written with the safety margin already applied:
/// `expires_at = now + (server_expiration - now) * margin`.
#[derive(Debug, Clone)]
pub struct TokenStateStore {
    path: PathBuf,
    margin: f64,
    cached: Arc<RwLock<Option<TokenExpiry>>>,
}

impl TokenStateStore {
    pub fn new(session_dir: &Path, margin: f64) -> Self {
        Self {
            path: session_dir.join(STATE_FILE),
            margin,
            cached: Arc::new(RwLock::new(None)),
        }
    }

    /// The last expiry record this process loaded or wrote.
    pub async fn cached(&self) -> Option<TokenExpiry> {
        *self.cached.read().await
    }

    /// Re-read the state file into the cache. Another process may have
    /// rotated since we last looked.
    pub async fn reload(&self) -> std::io::Result<Option<TokenExpiry>> {
        let loaded = self.read_file().await?;
        let mut cached = self.cached.write().await;
        *cached = loaded;
        Ok(loaded)
    }

    async fn read_file(&self) -> std::io::Result<Option<TokenExpiry>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        match serde_json::from_slice::<TokenExpiry>(&raw) {
            Ok(expiry) => Ok(Some(expiry)),
            Err(err) => {
                // Tolerate a corrupt record: treat as no session rather than
                // wedging every caller.
                warn!(path = %self.path.display(), error = %err, "discarding unreadable token state");
                Ok(None)
            }
        }
    }

    /// Persist new expirations as reported by the gateway, margin applied.
    ///
    /// Expiry never moves backwards: if a concurrent writer already stored a
    /// later timestamp, the later one wins per field.
    pub async fn write(
        &self,
        access_expiration: DateTime<Utc>,
        refresh_expiration: DateTime<Utc>,
    ) -> std::io::Result<TokenExpiry> {
        self.store(access_expiration, refresh_expiration, true).await
    }

    /// Like [`write`](Self::write), but without the monotonic clamp. Used
    /// when the gateway has refuted the stored belief: the old timestamps
    /// were wrong and must not win over the fresh grant.
    pub async fn replace(
        &self,
        access_expiration: DateTime<Utc>,
        refresh_expiration: DateTime<Utc>,
    ) -> std::io::Result<TokenExpiry> {
        self.store(access_expiration, refresh_expiration, false).await
    }

    async fn store(
        &self,
        access_expiration: DateTime<Utc>,
        refresh_expiration: DateTime<Utc>,
        clamp: bool,
    ) -> std::io::Result<TokenExpiry> {
        let now = Utc::now();
        let mut expiry = TokenExpiry {
            access_expires_at: apply_margin(now, access_expiration, self.margin),
            refresh_expires_at: apply_margin(now, refresh_expiration, self.margin),
        };

        if clamp {
            if let Some(existing) = self.read_file().await? {
                expiry.access_expires_at = expiry.access_expires_at.max(existing.access_expires_at);
                expiry.refresh_expires_at =
                    expiry.refresh_expires_at.max(existing.refresh_expires_at);
            }
        }

        self.persist(&expiry).await?;

        let mut cached = self.cached.write().await;
        *cached = Some(expiry);
        debug!(
            access_expires_at = %expiry.access_expires_at,
            refresh_expires_at = %expiry.refresh_expires_at,
            "token state written"
        );
        Ok(expiry)
    }

    async fn persist(&self, expiry: &TokenExpiry) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(expiry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }

    /// Drop the session record. Called on logout.
    pub async fn clear(&self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let mut cached = self.cached.write().await;
        *cached = None;
        debug!("token state cleared");
        Ok(())
    }
}

/// `now + (expiration - now) * margin`, so a credential is treated as
/// expired slightly before its true expiry. A server expiration already in
/// the past collapses to `now`.
fn apply_margin(now: DateTime<Utc>, expiration: DateTime<Utc>, margin: f64) -> DateTime<Utc> {
    let ttl_ms = (expiration - now).num_milliseconds().max(0);
    now + ChronoDuration::milliseconds((ttl_ms as f64 * margin) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir, margin: f64) -> TokenStateStore {
        TokenStateStore::new(dir.path(), margin)
    }

    #[tokio::test]
    async fn test_missing_state_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 0.8);
        assert!(store.reload().await.unwrap().is_none());
        assert!(store.cached().await.is_none());
    }

    #[tokio::test]
    async fn test_write_applies_safety_margin() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 0.8);
        let now = Utc::now();

        // Server grants 100s; with margin 0.8 we should believe ~80s.
        let expiry = store
            .write(
                now + ChronoDuration::seconds(100),
                now + ChronoDuration::seconds(1000),
            )
            .await
            .unwrap();

        let access_ttl = (expiry.access_expires_at - now).num_seconds();
        assert!((78..=82).contains(&access_ttl), "got {access_ttl}s");
        let refresh_ttl = (expiry.refresh_expires_at - now).num_seconds();
        assert!((798..=802).contains(&refresh_ttl), "got {refresh_ttl}s");
        assert!(expiry.is_access_valid());
        assert!(expiry.is_refresh_valid());
    }

    #[tokio::test]
    async fn test_expiry_never_moves_backwards() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 1.0);
        let now = Utc::now();

        let first = store
            .write(
                now + ChronoDuration::seconds(300),
                now + ChronoDuration::seconds(600),
            )
            .await
            .unwrap();
        // A second writer arrives with an older grant.
        let second = store
            .write(
                now + ChronoDuration::seconds(100),
                now + ChronoDuration::seconds(200),
            )
            .await
            .unwrap();

        assert_eq!(second.access_expires_at, first.access_expires_at);
        assert_eq!(second.refresh_expires_at, first.refresh_expires_at);
    }

    #[tokio::test]
    async fn test_replace_overrides_a_refuted_record() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 1.0);
        let now = Utc::now();

        store
            .write(
                now + ChronoDuration::seconds(300),
                now + ChronoDuration::seconds(600),
            )
            .await
            .unwrap();
        // Gateway refuted the 300s belief; the replacement grant is shorter
        // and must still win.
        let replaced = store
            .replace(
                now + ChronoDuration::seconds(100),
                now + ChronoDuration::seconds(200),
            )
            .await
            .unwrap();

        let access_ttl = (replaced.access_expires_at - now).num_seconds();
        assert!((98..=102).contains(&access_ttl), "got {access_ttl}s");
        let on_disk = store.reload().await.unwrap().unwrap();
        assert_eq!(on_disk, replaced);
    }

    #[tokio::test]
    async fn test_reload_observes_other_process_write() {
        let dir = TempDir::new().unwrap();
        let writer = store(&dir, 1.0);
        let reader = store(&dir, 1.0);
        let now = Utc::now();

        writer
            .write(
                now + ChronoDuration::seconds(50),
                now + ChronoDuration::seconds(500),
            )
            .await
            .unwrap();

        assert!(reader.cached().await.is_none());
        let seen = reader.reload().await.unwrap().unwrap();
        assert!(seen.is_access_valid());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_discarded() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 0.8);
        tokio::fs::write(dir.path().join(STATE_FILE), b"{not json")
            .await
            .unwrap();
        assert!(store.reload().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_state() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 0.8);
        let now = Utc::now();
        store
            .write(
                now + ChronoDuration::seconds(10),
                now + ChronoDuration::seconds(20),
            )
            .await
            .unwrap();

        store.clear().await.unwrap();
        assert!(store.cached().await.is_none());
        assert!(store.reload().await.unwrap().is_none());
        // Clearing an already-clear store is fine.
        store.clear().await.unwrap();
    }

    #[test]
    fn test_past_expiration_collapses_to_now() {
        let now = Utc::now();
        let capped = apply_margin(now, now - ChronoDuration::seconds(30), 0.8);
        assert_eq!(capped, now);
    }
}
