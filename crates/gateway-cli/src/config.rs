//! Configuration file management for the gateway binary.
//!
//! Provides a TOML-based config file at `~/.config/agent-gateway/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use gateway_core::config::MemoryConfig;
use gateway_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub memory: MemorySection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemorySection {
    pub enabled: Option<bool>,
    pub auto_capture: Option<bool>,
    pub auto_recall: Option<bool>,
    pub search_mode: Option<String>,
    pub pipeline_mode: Option<String>,
    pub max_entries: Option<usize>,
}

impl MemorySection {
    fn apply(&self, mut config: MemoryConfig) -> MemoryConfig {
        if let Some(v) = self.enabled {
            config.enabled = v;
        }
        if let Some(v) = self.auto_capture {
            config.auto_capture = v;
        }
        if let Some(v) = self.auto_recall {
            config.auto_recall = v;
        }
        if let Some(v) = &self.search_mode {
            config.search_mode = v.clone();
        }
        if let Some(v) = &self.pipeline_mode {
            config.pipeline_mode = v.clone();
        }
        if let Some(v) = self.max_entries {
            config.max_entries = v;
        }
        config
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the gateway config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/agent-gateway` or
/// `~/.config/agent-gateway`. We intentionally ignore the
/// platform-specific `dirs::config_dir()` (which returns
/// `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("agent-gateway");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("agent-gateway")
}

/// Return the path to the gateway config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct GatewayConfig {
    pub db_config: DbConfig,
    pub workspace: PathBuf,
    pub memory_config: MemoryConfig,
}

impl GatewayConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `GATEWAY_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Workspace: `cli_workspace` > `GATEWAY_WORKSPACE` env > `config_file.workspace` > current directory
    /// - Memory config: defaults overlaid by the config file's `[memory]` section
    pub fn resolve(cli_db_url: Option<&str>, cli_workspace: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("GATEWAY_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let workspace = if let Some(w) = cli_workspace {
            PathBuf::from(w)
        } else if let Ok(w) = std::env::var("GATEWAY_WORKSPACE") {
            PathBuf::from(w)
        } else if let Some(w) = file_config.as_ref().and_then(|c| c.workspace.clone()) {
            PathBuf::from(w)
        } else {
            std::env::current_dir().context("failed to determine current directory for workspace default")?
        };

        let memory_config = match &file_config {
            Some(cfg) => cfg.memory.apply(MemoryConfig::default()),
            None => MemoryConfig::default(),
        };

        Ok(Self {
            db_config,
            workspace,
            memory_config,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
