//! Storage engine configuration
//!
//! Stored as JSON (`gitcms.json` by default). Missing files yield the
//! defaults; `GITHUB_ACCESS_TOKEN` and `GITCMS_*` environment variables
//! override file values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::mutex::{LockStore, MemoryLockStore, SiteMutex, SqliteLockStore};

pub const DEFAULT_CONFIG_FILE: &str = "gitcms.json";
pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";
pub const DEFAULT_BRANCH: &str = "staging";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root of the GitHub REST API
    pub api_base_url: String,
    /// Organisation owning one repository per site
    pub org: String,
    /// Access token; usually supplied through `GITHUB_ACCESS_TOKEN`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub default_branch: String,
    pub request_timeout_secs: u64,
    /// Upper bound for a whole locked operation
    pub operation_timeout_secs: Option<u64>,
    /// Lock expiry. Unset means locks never expire on their own.
    pub lock_ttl_secs: Option<u64>,
    /// SQLite lock database shared by all processes on this host.
    /// Unset means an in-process lock store.
    pub lock_db_path: Option<PathBuf>,
    pub user_agent: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            org: String::new(),
            token: None,
            default_branch: DEFAULT_BRANCH.to_string(),
            request_timeout_secs: 30,
            operation_timeout_secs: None,
            lock_ttl_secs: None,
            lock_db_path: None,
            user_agent: format!("gitcms/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl StoreConfig {
    /// Load from `path`, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("failed to read {:?}: {}", path, e)))?;
        serde_json::from_str(&data)
            .map_err(|e| StoreError::Config(format!("failed to parse {:?}: {}", path, e)))
    }

    /// Load from `path`, then apply environment overrides
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Write to `path` atomically. The token is never written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let stored = Self {
            token: None,
            ..self.clone()
        };
        let data = serde_json::to_string_pretty(&stored)
            .map_err(|e| StoreError::Config(format!("failed to encode config: {}", e)))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, data)
            .and_then(|_| fs::rename(&tmp_path, path))
            .map_err(|e| StoreError::Config(format!("failed to write {:?}: {}", path, e)))
    }

    /// Override fields from variables resolved by `var`
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(token) = var("GITHUB_ACCESS_TOKEN") {
            self.token = Some(token);
        }
        if let Some(url) = var("GITCMS_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(org) = var("GITCMS_ORG") {
            self.org = org;
        }
        if let Some(branch) = var("GITCMS_DEFAULT_BRANCH") {
            self.default_branch = branch;
        }
        if let Some(secs) = var("GITCMS_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_secs("GITCMS_REQUEST_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = var("GITCMS_OPERATION_TIMEOUT_SECS") {
            self.operation_timeout_secs = Some(parse_secs("GITCMS_OPERATION_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = var("GITCMS_LOCK_TTL_SECS") {
            self.lock_ttl_secs = Some(parse_secs("GITCMS_LOCK_TTL_SECS", &secs)?);
        }
        if let Some(path) = var("GITCMS_LOCK_DB_PATH") {
            self.lock_db_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Check the values needed to talk to the remote
    pub fn validate(&self) -> Result<()> {
        if self.org.is_empty() {
            return Err(StoreError::Config("org is not set".to_string()));
        }
        if self.token.as_deref().is_none_or(str::is_empty) {
            return Err(StoreError::Config(
                "no access token (set GITHUB_ACCESS_TOKEN)".to_string(),
            ));
        }
        if self.default_branch.is_empty() {
            return Err(StoreError::Config("default_branch is empty".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(StoreError::Config("request_timeout_secs must be positive".to_string()));
        }
        if self.lock_ttl_secs == Some(0) || self.operation_timeout_secs == Some(0) {
            return Err(StoreError::Config("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }

    pub fn lock_ttl(&self) -> Option<Duration> {
        self.lock_ttl_secs.map(Duration::from_secs)
    }

    /// Open the configured lock store
    pub fn open_lock_store(&self) -> Result<Arc<dyn LockStore>> {
        match &self.lock_db_path {
            Some(path) => {
                tracing::info!("Using SQLite lock store at {:?}", path);
                Ok(Arc::new(SqliteLockStore::open(path)?))
            }
            None => {
                tracing::debug!("Using in-process lock store");
                Ok(Arc::new(MemoryLockStore::new()))
            }
        }
    }

    /// Site mutex over the configured lock store and TTL
    pub fn site_mutex(&self) -> Result<SiteMutex> {
        let mutex = SiteMutex::new(self.open_lock_store()?);
        Ok(match self.lock_ttl() {
            Some(ttl) => mutex.with_ttl(ttl),
            None => mutex,
        })
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| StoreError::Config(format!("{} must be a number of seconds, got {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::load(&dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.default_branch, "staging");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_save_load_drops_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        let config = StoreConfig {
            org: "isomer-sites".to_string(),
            token: Some("secret".to_string()),
            lock_ttl_secs: Some(300),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = StoreConfig::load(&path).unwrap();
        assert_eq!(loaded.org, "isomer-sites");
        assert_eq!(loaded.lock_ttl(), Some(Duration::from_secs(300)));
        assert!(loaded.token.is_none());
        assert!(!std::fs::read_to_string(&path).unwrap().contains("secret"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, r#"{"org": "acme-org", "default_branch": "main"}"#).unwrap();
        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.org, "acme-org");
        assert_eq!(config.default_branch, "main");
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(StoreConfig::load(&path), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("GITHUB_ACCESS_TOKEN", "ghp_test"),
            ("GITCMS_ORG", "env-org"),
            ("GITCMS_LOCK_TTL_SECS", "120"),
            ("GITCMS_LOCK_DB_PATH", "/tmp/locks.sqlite"),
        ]);
        let mut config = StoreConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.token.as_deref(), Some("ghp_test"));
        assert_eq!(config.org, "env-org");
        assert_eq!(config.lock_ttl_secs, Some(120));
        assert_eq!(config.lock_db_path, Some(PathBuf::from("/tmp/locks.sqlite")));
        config.validate().unwrap();

        let err = config
            .apply_env(|key| (key == "GITCMS_REQUEST_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_validate_requires_org_and_token() {
        let mut config = StoreConfig::default();
        assert!(config.validate().is_err());
        config.org = "acme-org".to_string();
        assert!(config.validate().is_err());
        config.token = Some("t".to_string());
        config.validate().unwrap();
        config.lock_ttl_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_lock_store_selection() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            lock_db_path: Some(dir.path().join("locks").join("site_locks.sqlite")),
            ..Default::default()
        };
        let mutex = config.site_mutex().unwrap();
        let guard = mutex.lock("acme").await.unwrap();
        assert!(dir.path().join("locks").join("site_locks.sqlite").exists());
        guard.release().await.unwrap();
    }
}
