//! ClubMerge Configuration Module
//! Handles loading and validating clubmerge.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::merge::DEFAULT_MAX_WRITE_RETRIES;

pub const CONFIG_FILE: &str = "clubmerge.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub project: ProjectConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Attempts per operation before a concurrent write surfaces as a conflict
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_write_retries: default_max_write_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    /// Directory holding audit.jsonl, relative to the project
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            path: default_audit_path(),
        }
    }
}

fn default_port() -> u16 {
    54321
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_write_retries() -> u32 {
    DEFAULT_MAX_WRITE_RETRIES
}

fn default_audit_enabled() -> bool {
    true
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("./audit")
}

impl Config {
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn default_for_project(name: &str) -> Self {
        Self {
            version: "0.1.0".to_string(),
            project: ProjectConfig {
                name: name.to_string(),
                id: format!("clubmerge-{}", name),
            },
            database: DatabaseConfig {
                path: PathBuf::from("./data/clubmerge.db"),
            },
            api: ApiConfig {
                port: default_port(),
                host: default_host(),
            },
            merge: MergeConfig::default(),
            audit: AuditConfig::default(),
        }
    }

    pub fn database_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.database.path)
    }

    /// Audit directory, or `None` when auditing is off
    pub fn audit_dir(&self, project_dir: &Path) -> Option<PathBuf> {
        self.audit.enabled.then(|| project_dir.join(&self.audit.path))
    }
}
