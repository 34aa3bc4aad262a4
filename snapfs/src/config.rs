use anyhow::{Context, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bytes moved per protocol call when streaming file contents.
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    // ip:port the authority listens on
    pub addr: String,
    // directory holding the files of record
    pub root_dir: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    // ip:port of the authority
    pub server_addr: String,
    pub cache: CacheConfig,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl ProxyConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    pub capacity_bytes: u64,
    /// How long a reservation may wait for in-use versions to be released
    /// before it fails with `NoSpace`.
    #[serde(default = "default_eviction_wait_ms")]
    pub eviction_wait_ms: u64,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            capacity_bytes,
            eviction_wait_ms: default_eviction_wait_ms(),
        }
    }

    pub fn eviction_wait(&self) -> Duration {
        Duration::from_millis(self.eviction_wait_ms)
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

fn default_max_open_files() -> usize {
    10_240
}

fn default_eviction_wait_ms() -> u64 {
    30_000
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("snapfs")
}

pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: T = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_config_defaults() {
        let yaml = "server_addr: 127.0.0.1:15440\ncache:\n  dir: /tmp/c\n  capacity_bytes: 4096\n";
        let cfg: ProxyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.cache.capacity_bytes, 4096);
        assert_eq!(cfg.cache.dir, PathBuf::from("/tmp/c"));
        assert_eq!(cfg.rpc_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.max_open_files, 10_240);
        assert_eq!(cfg.cache.eviction_wait(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_server_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.yaml");
        fs::write(&path, "addr: 0.0.0.0:15440\nroot_dir: /srv/files\nchunk_size: 4096\n").unwrap();
        let cfg: ServerConfig = load_config(&path).unwrap();
        assert_eq!(cfg.addr, "0.0.0.0:15440");
        assert_eq!(cfg.chunk_size, 4096);
        assert_eq!(cfg.log_level, "info");
        assert!(load_config::<ServerConfig>(&tmp.path().join("missing.yaml")).is_err());
    }
}
