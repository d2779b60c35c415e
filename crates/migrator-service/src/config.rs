use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use migrator_engine::MigratorConfig;
use serde::{Deserialize, Serialize};

use crate::logging::LogFormat;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    pub src_db: PathBuf,
    pub dst_db: PathBuf,
    pub outbox_db: PathBuf,
    pub log_format: LogFormat,
    pub migrator: MigratorConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 4020)),
            src_db: PathBuf::from("./interactive_src.sqlite3"),
            dst_db: PathBuf::from("./interactive_dst.sqlite3"),
            outbox_db: PathBuf::from("./migrator_outbox.sqlite3"),
            log_format: LogFormat::default(),
            migrator: MigratorConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// # Errors
    /// Returns an error when the document does not parse or the migrator section is invalid.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("failed to parse service config")?;
        config.migrator.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }
}
