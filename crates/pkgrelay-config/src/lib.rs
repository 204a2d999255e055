//! Configuration file handling for pkgrelay.
//!
//! The daemon reads one TOML file: top-level paths and servers, then one
//! table per mirror instance, keyed by the mirror code:
//!
//! ```toml
//! DataDir = "/var/lib/pkgrelay/data"
//! CacheDir = "/var/lib/pkgrelay/cache"
//! PublicServer = "https://mirrors.example.net"
//! InternalServer = "127.0.0.1:8000"
//! LogLevel = "info"
//!
//! [Composer.packagist]
//! Server = "https://packagist.org"
//!
//! [Npm.npm]
//! Server = "https://registry.npmjs.org"
//! Fallbacks = [{ Server = "https://registry.yarnpkg.com" }]
//!
//! [Git.github]
//! Server = "github.com"
//! Clone = "https://{path}"
//!
//! [Static.assets]
//! Server = "http://minio.example.net/assets"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

fn default_enabled() -> bool {
    true
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_git_sync_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One composer-compatible upstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComposerConfig {
    #[serde(rename = "Server")]
    pub server: String,
    #[serde(rename = "Enabled", default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "Icon", default)]
    pub icon: String,
    #[serde(
        rename = "SyncInterval",
        default = "default_sync_interval",
        with = "humantime_serde"
    )]
    pub sync_interval: Duration,
}

/// One npm-compatible upstream, with optional fallbacks tried in order
/// when the primary fails.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NpmConfig {
    #[serde(rename = "Server")]
    pub server: String,
    #[serde(rename = "Enabled", default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "Icon", default)]
    pub icon: String,
    #[serde(rename = "Fallbacks", default)]
    pub fallbacks: Vec<FallbackConfig>,
    #[serde(
        rename = "SyncInterval",
        default = "default_sync_interval",
        with = "humantime_serde"
    )]
    pub sync_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackConfig {
    #[serde(rename = "Server")]
    pub server: String,
}

/// One mirrored git host. `server` is the upstream host name as it appears
/// in rewritten URLs; `clone` is the on-demand clone template where
/// `{path}` stands for the repository path.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitConfig {
    #[serde(rename = "Server")]
    pub server: String,
    #[serde(rename = "Enabled", default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "Icon", default)]
    pub icon: String,
    #[serde(rename = "Clone", default)]
    pub clone: Option<String>,
    #[serde(
        rename = "SyncInterval",
        default = "default_git_sync_interval",
        with = "humantime_serde"
    )]
    pub sync_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BowerConfig {
    #[serde(rename = "Server")]
    pub server: String,
    #[serde(rename = "Enabled", default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "Icon", default)]
    pub icon: String,
    #[serde(
        rename = "SyncInterval",
        default = "default_sync_interval",
        with = "humantime_serde"
    )]
    pub sync_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticConfig {
    #[serde(rename = "Server")]
    pub server: String,
    #[serde(rename = "Enabled", default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "Icon", default)]
    pub icon: String,
}

/// The whole daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "DataDir")]
    pub data_dir: PathBuf,
    #[serde(rename = "CacheDir")]
    pub cache_dir: PathBuf,
    #[serde(rename = "PublicServer")]
    pub public_server: String,
    #[serde(rename = "InternalServer")]
    pub internal_server: String,
    #[serde(rename = "LogLevel", default = "default_log_level")]
    pub log_level: String,
    #[serde(rename = "Composer", default)]
    pub composer: BTreeMap<String, ComposerConfig>,
    #[serde(rename = "Npm", default)]
    pub npm: BTreeMap<String, NpmConfig>,
    #[serde(rename = "Git", default)]
    pub git: BTreeMap<String, GitConfig>,
    #[serde(rename = "Bower", default)]
    pub bower: BTreeMap<String, BowerConfig>,
    #[serde(rename = "Static", default)]
    pub statics: BTreeMap<String, StaticConfig>,
}

impl Config {
    pub fn from_str(raw: &str) -> Result<Config> {
        let config: Config = toml::from_str(raw).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::from_str(&raw)
            .with_context(|| format!("invalid configuration file {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            bail!("please configure DataDir");
        }
        if self.cache_dir.as_os_str().is_empty() {
            bail!("please configure CacheDir");
        }
        if self.public_server.is_empty() {
            bail!("please configure PublicServer");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
DataDir = "/var/lib/pkgrelay/data"
CacheDir = "/var/lib/pkgrelay/cache"
PublicServer = "https://mirrors.example.net"
InternalServer = "127.0.0.1:8000"

[Composer.packagist]
Server = "https://packagist.org"
Icon = "composer.png"

[Npm.npm]
Server = "https://registry.npmjs.org"
Fallbacks = [{ Server = "https://registry.yarnpkg.com" }]
SyncInterval = "30m"

[Git.github]
Server = "github.com"
Clone = "https://{path}"

[Bower.bower]
Server = "https://registry.bower.io"
Enabled = false

[Static.assets]
Server = "http://minio.example.net/assets"
"#;

    #[test]
    fn sample_config_parses() {
        let config = Config::from_str(SAMPLE).expect("parse");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/pkgrelay/data"));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.composer["packagist"].server, "https://packagist.org");
        assert!(config.composer["packagist"].enabled);
        assert_eq!(
            config.composer["packagist"].sync_interval,
            Duration::from_secs(15 * 60)
        );
        assert_eq!(config.npm["npm"].fallbacks.len(), 1);
        assert_eq!(config.npm["npm"].sync_interval, Duration::from_secs(30 * 60));
        assert_eq!(config.git["github"].clone.as_deref(), Some("https://{path}"));
        assert_eq!(config.git["github"].sync_interval, Duration::from_secs(60));
        assert!(!config.bower["bower"].enabled);
        assert_eq!(config.statics["assets"].server, "http://minio.example.net/assets");
    }

    #[test]
    fn missing_data_dir_is_rejected() {
        let raw = r#"
DataDir = ""
CacheDir = "/cache"
PublicServer = "https://mirrors.example.net"
InternalServer = "127.0.0.1:8000"
"#;
        let err = Config::from_str(raw).expect_err("must fail");
        assert!(err.to_string().contains("DataDir"));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pkgrelay.toml");
        std::fs::write(&path, SAMPLE).expect("write");

        let config = Config::load(&path).expect("load");
        assert_eq!(config.internal_server, "127.0.0.1:8000");
    }

    #[test]
    fn unknown_mirror_field_is_rejected() {
        let raw = r#"
DataDir = "/data"
CacheDir = "/cache"
PublicServer = "https://mirrors.example.net"
InternalServer = "127.0.0.1:8000"

[Composer.packagist]
Server = "https://packagist.org"
Typo = true
"#;
        assert!(Config::from_str(raw).is_err());
    }
}
