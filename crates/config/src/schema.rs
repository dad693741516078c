/// Config schema types (lock backend, named caches, ledger, jobs).
use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::loader::data_dir;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub lock: LockConfig,
    /// Named caches, referenced by `lock.cache`.
    pub caches: BTreeMap<String, CacheConfig>,
    pub ledger: LedgerConfig,
    /// Raw job entries. Shape is checked by the job registry, not by serde,
    /// so every bad entry can be reported at once.
    pub jobs: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// Lock files in `lockfile_dir`. Single host only.
    #[default]
    File,
    /// A key in the cache named by `cache`.
    Cache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub backend: LockBackend,
    /// Lock lifetime; a crashed holder blocks its job for at most this long.
    pub ttl_secs: u64,
    pub cache: String,
    pub lockfile_dir: PathBuf,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::File,
            ttl_secs: 24 * 60 * 60,
            cache: "default".into(),
            lockfile_dir: std::env::temp_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub url: String,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Redis,
            url: "redis://127.0.0.1/".into(),
            key_prefix: "cadence".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Sqlite,
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    pub database_url: String,
    /// Directory of per-job JSONL files for the `file` backend.
    pub runs_dir: PathBuf,
    /// Outcome messages keep their trailing this-many characters.
    pub message_max_length: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let dir = data_dir();
        Self {
            backend: LedgerBackend::Sqlite,
            database_url: format!("sqlite:{}?mode=rwc", dir.join("cadence.db").display()),
            runs_dir: dir.join("runs"),
            message_max_length: 1000,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: CadenceConfig = toml::from_str("").unwrap();
        assert_eq!(config.lock.backend, LockBackend::File);
        assert_eq!(config.lock.ttl_secs, 86_400);
        assert_eq!(config.lock.cache, "default");
        assert_eq!(config.ledger.backend, LedgerBackend::Sqlite);
        assert_eq!(config.ledger.message_max_length, 1000);
        assert!(config.ledger.database_url.starts_with("sqlite:"));
        assert!(config.caches.is_empty());
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn full_document_parses() {
        let raw = r#"
            [lock]
            backend = "cache"
            ttl_secs = 600
            cache = "shared"

            [caches.shared]
            url = "redis://cache.internal:6380/2"
            key_prefix = "jobs"

            [caches.local]
            backend = "memory"

            [ledger]
            backend = "file"
            runs_dir = "/var/lib/cadence/runs"

            [[jobs]]
            code = "reports.daily"
            command = "echo hi"
            schedule = { run_at_times = ["06:00"], days_of_week = [0, 1, 2, 3, 4] }
        "#;
        let config: CadenceConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.lock.backend, LockBackend::Cache);
        assert_eq!(config.lock.ttl_secs, 600);
        assert_eq!(config.caches["shared"].backend, CacheBackend::Redis);
        assert_eq!(config.caches["shared"].key_prefix, "jobs");
        assert_eq!(config.caches["local"].backend, CacheBackend::Memory);
        assert_eq!(config.ledger.backend, LedgerBackend::File);
        assert_eq!(config.ledger.runs_dir, PathBuf::from("/var/lib/cadence/runs"));
        assert_eq!(config.jobs.len(), 1);
        assert_eq!(config.jobs[0]["code"], "reports.daily");
        assert_eq!(config.jobs[0]["schedule"]["days_of_week"][4], 4);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = toml::from_str::<CadenceConfig>("[lock]\nbackend = \"etcd\"").unwrap_err();
        assert!(err.to_string().contains("etcd"));
    }
}
