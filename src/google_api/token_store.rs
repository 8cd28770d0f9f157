//! Per-user OAuth token storage.
//!
//! Tokens live at `<token_dir>/<user_id>.json`. The consent flow that writes
//! them is outside this crate; a missing or expired token surfaces as
//! [`ProviderError::AuthExpired`] so the user is asked to reconnect.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::calendar::GoogleCalendarClient;
use super::{CalendarProvider, ProviderError, ProviderFactory, RetryPolicy, GOOGLE_PROVIDER};

/// Token payload. Both `token` and `access_token` are accepted on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// RFC 3339 expiry. Absent means the token doesn't expire locally.
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default, alias = "email")]
    pub account: Option<String>,
}

impl StoredToken {
    /// Expired, or within 60 seconds of expiring. Unparseable expiry counts
    /// as expired.
    pub fn is_expired(&self) -> bool {
        match &self.expiry {
            None => false,
            Some(expiry) => match chrono::DateTime::parse_from_rfc3339(expiry) {
                Ok(expiry) => expiry <= chrono::Utc::now() + chrono::Duration::seconds(60),
                Err(_) => true,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.dealsync/tokens`
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".dealsync").join("tokens"))
    }

    pub fn path_for(&self, user_id: &str) -> PathBuf {
        // User IDs are opaque; keep them from escaping the token directory.
        let safe: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    /// Load a usable token for the user.
    pub fn load(&self, user_id: &str) -> Result<StoredToken, ProviderError> {
        let path = self.path_for(user_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("TokenStore: no token for user {} at {}", user_id, path.display());
                return Err(ProviderError::AuthExpired);
            }
            Err(e) => return Err(ProviderError::Transient(format!("{}: {}", path.display(), e))),
        };
        let token: StoredToken = serde_json::from_str(&content)
            .map_err(|e| ProviderError::Decode(format!("{}: {}", path.display(), e)))?;
        if token.is_expired() {
            return Err(ProviderError::AuthExpired);
        }
        Ok(token)
    }

    /// Write a token atomically (temp file + rename), owner-only on unix.
    pub fn save(&self, user_id: &str, token: &StoredToken) -> std::io::Result<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
            restrict_permissions(&self.dir, 0o700)?;
        }
        let path = self.path_for(user_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(token)?;
        std::fs::write(&tmp, content)?;
        restrict_permissions(&tmp, 0o600)?;
        std::fs::rename(&tmp, &path)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Builds Google Calendar clients from the file token store.
pub struct TokenProviderFactory {
    store: FileTokenStore,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl TokenProviderFactory {
    pub fn new(store: FileTokenStore, retry: RetryPolicy) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            retry,
        }
    }
}

#[async_trait]
impl ProviderFactory for TokenProviderFactory {
    fn name(&self) -> &str {
        GOOGLE_PROVIDER
    }

    async fn for_user(&self, user_id: &str) -> Result<Arc<dyn CalendarProvider>, ProviderError> {
        let token = self.store.load(user_id)?;
        Ok(Arc::new(GoogleCalendarClient::new(
            self.client.clone(),
            token.access_token,
            self.retry.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_token_is_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        assert!(matches!(store.load("u1"), Err(ProviderError::AuthExpired)));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("tokens"));
        let token = StoredToken {
            access_token: "ya29.abc".to_string(),
            refresh_token: None,
            expiry: Some((chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339()),
            account: Some("me@seller.io".to_string()),
        };
        store.save("u1", &token).unwrap();
        assert_eq!(store.load("u1").unwrap().access_token, "ya29.abc");
    }

    #[test]
    fn test_expired_token_is_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        std::fs::write(
            store.path_for("u1"),
            r#"{"token": "old", "expiry": "2020-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(store.load("u1"), Err(ProviderError::AuthExpired)));
    }

    #[test]
    fn test_path_for_sanitizes_user_id() {
        let store = FileTokenStore::new("/tmp/tokens");
        assert_eq!(
            store.path_for("../etc/passwd"),
            PathBuf::from("/tmp/tokens/___etc_passwd.json")
        );
    }
}
