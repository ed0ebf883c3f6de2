//! Tenant-scoped persistence for OAuth artifacts and upstream-server metadata.
//!
//! Every artifact is keyed `(tenant, serverId)` and stored as one JSON
//! document under `data_dir/tenants/<tenant>/`. Token writes go through a
//! temp-file rename so a reader never observes a half-written replacement.
//!
//! A pre-tenant layout (artifact files directly in the data dir) is migrated
//! under a synthetic `legacy-<instant>` tenant before the store serves its
//! first request.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// PKCE verifiers older than this are discarded on read.
pub const VERIFIER_TTL: Duration = Duration::from_secs(600);

/// Dynamic client registration result for `(tenant, serverId)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientInfo {
    /// Registered client id
    pub client_id: String,
    /// Client secret, when the server issued one
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Redirect URIs registered for the client
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// RFC 7592 registration access token
    #[serde(default)]
    pub registration_access_token: Option<String>,
    /// Registration instant (Unix seconds)
    #[serde(default)]
    pub issued_at: u64,
}

/// OAuth tokens for `(tenant, serverId)`.
///
/// Either both access and refresh tokens are present (refreshable) or only
/// the access token (short-lived).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// Access token
    pub access_token: String,
    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Expiry (Unix seconds)
    #[serde(default)]
    pub expires_at: Option<u64>,
    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthTokens {
    /// Build from a token endpoint response.
    #[must_use]
    pub fn from_response(
        access_token: String,
        token_type: Option<String>,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
        scope: Option<String>,
    ) -> Self {
        Self {
            access_token,
            token_type: token_type.unwrap_or_else(default_token_type),
            refresh_token,
            expires_at: expires_in.map(|secs| unix_now() + secs),
            scope,
        }
    }

    /// Expired check with a 60-second buffer.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| unix_now() + 60 >= expires_at)
    }
}

/// Short-lived PKCE verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthVerifier {
    /// Code verifier
    pub verifier: String,
    /// Creation instant (Unix seconds)
    pub created_at: u64,
}

impl OAuthVerifier {
    fn is_expired(&self) -> bool {
        unix_now().saturating_sub(self.created_at) > VERIFIER_TTL.as_secs()
    }
}

/// Last-known upstream server configuration, used to reopen sessions
/// transparently in stateless deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Canonical URL
    pub url: String,
    /// `"http"` or `"sse"`
    pub transport: String,
    /// Last-known display name
    #[serde(default)]
    pub name: Option<String>,
    /// Last-known version
    #[serde(default)]
    pub version: Option<String>,
    /// Serialized auth configuration (tagged variant)
    pub auth: serde_json::Value,
}

/// Which artifacts [`TenantStore::invalidate`] removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateScope {
    /// Everything for `(tenant, serverId)`
    All,
    /// Client registration (and dependent tokens)
    Client,
    /// Tokens only
    Tokens,
    /// PKCE verifier only
    Verifier,
}

/// Artifact classes, one file suffix each.
#[derive(Debug, Clone, Copy)]
enum Artifact {
    Client,
    Tokens,
    Verifier,
    Server,
}

impl Artifact {
    fn suffix(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Tokens => "tokens",
            Self::Verifier => "verifier",
            Self::Server => "server",
        }
    }
}

/// File-backed tenant store.
pub struct TenantStore {
    base_dir: PathBuf,
}

impl TenantStore {
    /// Open (and if needed create) the store, migrating any legacy layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the legacy
    /// migration fails.
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let tenants_dir = base_dir.join("tenants");
        fs::create_dir_all(&tenants_dir)
            .map_err(|e| Error::Internal(format!("Failed to create store dir: {e}")))?;

        let store = Self { base_dir };
        store.migrate_legacy()?;
        Ok(store)
    }

    /// Move a pre-tenant layout under a synthetic `legacy-<instant>` tenant.
    fn migrate_legacy(&self) -> Result<()> {
        let mut legacy_files = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_file() && name.ends_with(".json") {
                legacy_files.push(entry.path());
            }
        }

        if legacy_files.is_empty() {
            return Ok(());
        }

        let tenant = format!("legacy-{}", chrono::Utc::now().timestamp());
        let target = self.base_dir.join("tenants").join(&tenant);
        fs::create_dir_all(&target)?;

        for path in &legacy_files {
            if let Some(file_name) = path.file_name() {
                fs::rename(path, target.join(file_name))?;
            }
        }

        info!(
            tenant = %tenant,
            files = legacy_files.len(),
            "Migrated legacy single-tenant layout"
        );
        Ok(())
    }

    fn check_tenant(tenant: &str) -> Result<()> {
        if tenant.is_empty() {
            return Err(Error::Validation("tenant must not be empty".to_string()));
        }
        Ok(())
    }

    /// Storage key for a server id: first 16 hex chars of SHA-256.
    fn storage_key(server_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(server_id.as_bytes());
        let hash = hasher.finalize();
        hex::encode(hash)[..16].to_string()
    }

    fn artifact_path(&self, tenant: &str, server_id: &str, artifact: Artifact) -> PathBuf {
        self.base_dir.join("tenants").join(tenant).join(format!(
            "{}.{}.json",
            Self::storage_key(server_id),
            artifact.suffix()
        ))
    }

    fn read<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Option<T> {
        if !path.exists() {
            return None;
        }
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding unreadable artifact");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read artifact");
                None
            }
        }
    }

    /// Atomic write: temp file in the same directory, then rename.
    fn write<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(value)?;
        fs::write(&tmp, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
        }

        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn remove(path: &Path) {
        if path.exists() {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to delete artifact");
            }
        }
    }

    // -- client info ---------------------------------------------------------

    /// Load the dynamic registration for `(tenant, serverId)`.
    pub fn get_client_info(&self, tenant: &str, server_id: &str) -> Result<Option<OAuthClientInfo>> {
        Self::check_tenant(tenant)?;
        Ok(self.read(&self.artifact_path(tenant, server_id, Artifact::Client)))
    }

    /// Persist a dynamic registration.
    pub fn put_client_info(
        &self,
        tenant: &str,
        server_id: &str,
        info: &OAuthClientInfo,
    ) -> Result<()> {
        Self::check_tenant(tenant)?;
        self.write(&self.artifact_path(tenant, server_id, Artifact::Client), info)
    }

    // -- tokens --------------------------------------------------------------

    /// Load tokens for `(tenant, serverId)`.
    pub fn get_tokens(&self, tenant: &str, server_id: &str) -> Result<Option<OAuthTokens>> {
        Self::check_tenant(tenant)?;
        Ok(self.read(&self.artifact_path(tenant, server_id, Artifact::Tokens)))
    }

    /// Replace tokens atomically.
    pub fn put_tokens(&self, tenant: &str, server_id: &str, tokens: &OAuthTokens) -> Result<()> {
        Self::check_tenant(tenant)?;
        self.write(&self.artifact_path(tenant, server_id, Artifact::Tokens), tokens)?;
        debug!(tenant = %tenant, server = %server_id, "Saved OAuth tokens");
        Ok(())
    }

    // -- verifier ------------------------------------------------------------

    /// Store a PKCE verifier with the current instant.
    pub fn put_verifier(&self, tenant: &str, server_id: &str, verifier: &str) -> Result<()> {
        Self::check_tenant(tenant)?;
        let record = OAuthVerifier {
            verifier: verifier.to_string(),
            created_at: unix_now(),
        };
        self.write(
            &self.artifact_path(tenant, server_id, Artifact::Verifier),
            &record,
        )
    }

    /// Retrieve and delete the verifier in one step.
    ///
    /// # Errors
    ///
    /// `VerifierMissing` when none was stored, `VerifierExpired` when the
    /// stored one outlived [`VERIFIER_TTL`] (it is deleted either way).
    pub fn take_verifier(&self, tenant: &str, server_id: &str) -> Result<OAuthVerifier> {
        Self::check_tenant(tenant)?;
        let path = self.artifact_path(tenant, server_id, Artifact::Verifier);
        let record: Option<OAuthVerifier> = self.read(&path);
        Self::remove(&path);

        match record {
            None => Err(Error::VerifierMissing),
            Some(v) if v.is_expired() => Err(Error::VerifierExpired),
            Some(v) => Ok(v),
        }
    }

    /// Write back a verifier taken by [`Self::take_verifier`], preserving its
    /// original creation instant. Used to roll back a failed code exchange.
    pub fn restore_verifier(
        &self,
        tenant: &str,
        server_id: &str,
        record: &OAuthVerifier,
    ) -> Result<()> {
        Self::check_tenant(tenant)?;
        self.write(
            &self.artifact_path(tenant, server_id, Artifact::Verifier),
            record,
        )
    }

    /// Peek the verifier without consuming it; expired entries are deleted
    /// and reported as absent.
    pub fn get_verifier(&self, tenant: &str, server_id: &str) -> Result<Option<String>> {
        Self::check_tenant(tenant)?;
        let path = self.artifact_path(tenant, server_id, Artifact::Verifier);
        match self.read::<OAuthVerifier>(&path) {
            None => Ok(None),
            Some(v) if v.is_expired() => {
                Self::remove(&path);
                Ok(None)
            }
            Some(v) => Ok(Some(v.verifier)),
        }
    }

    /// Delete the verifier if present.
    pub fn delete_verifier(&self, tenant: &str, server_id: &str) -> Result<()> {
        Self::check_tenant(tenant)?;
        Self::remove(&self.artifact_path(tenant, server_id, Artifact::Verifier));
        Ok(())
    }

    // -- server record -------------------------------------------------------

    /// Load the last-known configuration for `(tenant, serverId)`.
    pub fn get_server(&self, tenant: &str, server_id: &str) -> Result<Option<ServerRecord>> {
        Self::check_tenant(tenant)?;
        Ok(self.read(&self.artifact_path(tenant, server_id, Artifact::Server)))
    }

    /// Persist the last-known configuration.
    pub fn put_server(&self, tenant: &str, server_id: &str, record: &ServerRecord) -> Result<()> {
        Self::check_tenant(tenant)?;
        self.write(&self.artifact_path(tenant, server_id, Artifact::Server), record)
    }

    // -- invalidation --------------------------------------------------------

    /// Remove stored artifacts for `(tenant, serverId)` per `scope`.
    pub fn invalidate(&self, tenant: &str, server_id: &str, scope: InvalidateScope) -> Result<()> {
        Self::check_tenant(tenant)?;

        let remove = |artifact| Self::remove(&self.artifact_path(tenant, server_id, artifact));

        match scope {
            InvalidateScope::All => {
                remove(Artifact::Client);
                remove(Artifact::Tokens);
                remove(Artifact::Verifier);
            }
            InvalidateScope::Client => {
                // Tokens are owned by the registration; they go with it.
                remove(Artifact::Client);
                remove(Artifact::Tokens);
            }
            InvalidateScope::Tokens => remove(Artifact::Tokens),
            InvalidateScope::Verifier => remove(Artifact::Verifier),
        }

        debug!(tenant = %tenant, server = %server_id, scope = ?scope, "Invalidated OAuth artifacts");
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TenantStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TenantStore::new(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    fn tokens(access: &str) -> OAuthTokens {
        OAuthTokens::from_response(access.to_string(), None, None, Some(3600), None)
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    #[test]
    fn tokens_round_trip() {
        let (_dir, store) = store();
        store.put_tokens("t1", "srv", &tokens("abc")).unwrap();
        let loaded = store.get_tokens("t1", "srv").unwrap().unwrap();
        assert_eq!(loaded.access_token, "abc");
        assert_eq!(loaded.token_type, "Bearer");
    }

    #[test]
    fn put_tokens_replaces() {
        let (_dir, store) = store();
        store.put_tokens("t1", "srv", &tokens("v1")).unwrap();
        store.put_tokens("t1", "srv", &tokens("v2")).unwrap();
        let loaded = store.get_tokens("t1", "srv").unwrap().unwrap();
        assert_eq!(loaded.access_token, "v2");
    }

    #[test]
    fn tenants_are_isolated() {
        let (_dir, store) = store();
        store.put_tokens("tenant-a", "srv", &tokens("secret-a")).unwrap();

        assert!(store.get_tokens("tenant-b", "srv").unwrap().is_none());
        let a = store.get_tokens("tenant-a", "srv").unwrap().unwrap();
        assert_eq!(a.access_token, "secret-a");
    }

    #[test]
    fn empty_tenant_is_rejected() {
        let (_dir, store) = store();
        assert!(store.put_tokens("", "srv", &tokens("x")).is_err());
        assert!(store.get_tokens("", "srv").is_err());
        assert!(store.take_verifier("", "srv").is_err());
    }

    // =========================================================================
    // Verifier TTL
    // =========================================================================

    #[test]
    fn verifier_round_trip_consumes() {
        let (_dir, store) = store();
        store.put_verifier("t1", "srv", "pkce-verifier").unwrap();
        assert_eq!(
            store.take_verifier("t1", "srv").unwrap().verifier,
            "pkce-verifier"
        );
        // Consumed on first take
        assert!(matches!(
            store.take_verifier("t1", "srv"),
            Err(Error::VerifierMissing)
        ));
    }

    #[test]
    fn stale_verifier_is_expired() {
        let (dir, store) = store();
        store.put_verifier("t1", "srv", "old").unwrap();

        // Rewrite the record with an ancient created_at
        let path = dir
            .path()
            .join("tenants")
            .join("t1")
            .join(format!("{}.verifier.json", TenantStore::storage_key("srv")));
        let record = OAuthVerifier {
            verifier: "old".to_string(),
            created_at: 0,
        };
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

        assert!(matches!(
            store.take_verifier("t1", "srv"),
            Err(Error::VerifierExpired)
        ));
        // Deleted on expiry
        assert!(matches!(
            store.take_verifier("t1", "srv"),
            Err(Error::VerifierMissing)
        ));
    }

    #[test]
    fn restored_verifier_keeps_created_at() {
        let (_dir, store) = store();
        store.put_verifier("t1", "srv", "v").unwrap();
        let taken = store.take_verifier("t1", "srv").unwrap();

        store.restore_verifier("t1", "srv", &taken).unwrap();
        let again = store.take_verifier("t1", "srv").unwrap();
        assert_eq!(again.created_at, taken.created_at);
        assert_eq!(again.verifier, "v");
    }

    #[test]
    fn get_verifier_hides_expired() {
        let (dir, store) = store();
        store.put_verifier("t1", "srv", "old").unwrap();
        let path = dir
            .path()
            .join("tenants")
            .join("t1")
            .join(format!("{}.verifier.json", TenantStore::storage_key("srv")));
        let record = OAuthVerifier {
            verifier: "old".to_string(),
            created_at: 0,
        };
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

        assert!(store.get_verifier("t1", "srv").unwrap().is_none());
    }

    // =========================================================================
    // Invalidation scopes
    // =========================================================================

    #[test]
    fn invalidate_tokens_keeps_client() {
        let (_dir, store) = store();
        let info = OAuthClientInfo {
            client_id: "cid".to_string(),
            client_secret: None,
            redirect_uris: vec![],
            registration_access_token: None,
            issued_at: 0,
        };
        store.put_client_info("t1", "srv", &info).unwrap();
        store.put_tokens("t1", "srv", &tokens("x")).unwrap();

        store
            .invalidate("t1", "srv", InvalidateScope::Tokens)
            .unwrap();

        assert!(store.get_tokens("t1", "srv").unwrap().is_none());
        assert!(store.get_client_info("t1", "srv").unwrap().is_some());
    }

    #[test]
    fn invalidate_client_removes_tokens_too() {
        let (_dir, store) = store();
        let info = OAuthClientInfo {
            client_id: "cid".to_string(),
            client_secret: None,
            redirect_uris: vec![],
            registration_access_token: None,
            issued_at: 0,
        };
        store.put_client_info("t1", "srv", &info).unwrap();
        store.put_tokens("t1", "srv", &tokens("x")).unwrap();

        store
            .invalidate("t1", "srv", InvalidateScope::Client)
            .unwrap();

        assert!(store.get_client_info("t1", "srv").unwrap().is_none());
        assert!(store.get_tokens("t1", "srv").unwrap().is_none());
    }

    #[test]
    fn invalidate_all_clears_everything() {
        let (_dir, store) = store();
        store.put_tokens("t1", "srv", &tokens("x")).unwrap();
        store.put_verifier("t1", "srv", "v").unwrap();

        store.invalidate("t1", "srv", InvalidateScope::All).unwrap();

        assert!(store.get_tokens("t1", "srv").unwrap().is_none());
        assert!(store.get_verifier("t1", "srv").unwrap().is_none());
    }

    // =========================================================================
    // Legacy migration
    // =========================================================================

    #[test]
    fn legacy_layout_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("abcd1234_tokens.json"),
            serde_json::to_string(&tokens("legacy-token")).unwrap(),
        )
        .unwrap();

        let _store = TenantStore::new(dir.path().to_path_buf()).unwrap();

        // File moved out of the root...
        assert!(!dir.path().join("abcd1234_tokens.json").exists());
        // ...into a legacy-<instant> tenant dir
        let tenants: Vec<_> = std::fs::read_dir(dir.path().join("tenants"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(tenants.len(), 1);
        assert!(tenants[0].starts_with("legacy-"));
    }

    #[test]
    fn fresh_layout_needs_no_migration() {
        let (dir, store) = store();
        store.put_tokens("t1", "srv", &tokens("x")).unwrap();
        drop(store);

        // Re-open: nothing at the root to migrate, data still readable
        let store = TenantStore::new(dir.path().to_path_buf()).unwrap();
        assert!(store.get_tokens("t1", "srv").unwrap().is_some());
    }

    // =========================================================================
    // Server records
    // =========================================================================

    #[test]
    fn server_record_round_trip() {
        let (_dir, store) = store();
        let record = ServerRecord {
            url: "https://mcp.example.com/mcp".to_string(),
            transport: "http".to_string(),
            name: Some("Example".to_string()),
            version: Some("1.0.0".to_string()),
            auth: serde_json::json!({"kind": "none"}),
        };
        store.put_server("t1", "srv", &record).unwrap();
        let loaded = store.get_server("t1", "srv").unwrap().unwrap();
        assert_eq!(loaded.url, record.url);
        assert_eq!(loaded.name.as_deref(), Some("Example"));
    }

    #[test]
    fn expiry_buffer_matches_upstream_convention() {
        let now = unix_now();
        let soon = OAuthTokens {
            access_token: "x".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: None,
            expires_at: Some(now + 30),
            scope: None,
        };
        assert!(soon.is_expired());

        let later = OAuthTokens {
            expires_at: Some(now + 300),
            ..soon.clone()
        };
        assert!(!later.is_expired());
    }
}
