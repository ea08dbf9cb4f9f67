//! Configuration system for the Inkboard display server
//!
//! Loads configuration from TOML file at `~/.config/inkboard/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub screen: ScreenConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub panel: PanelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            screen: ScreenConfig::default(),
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
            panel: PanelConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("inkboard");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &PathBuf) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let default_config = Self::default();
        let toml_string = toml::to_string_pretty(&default_config)
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string)
            .context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Screen geometry and colors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenConfig {
    /// Native panel width in pixels
    pub width: u32,
    /// Native panel height in pixels
    pub height: u32,
    /// Rotation applied at export: 0, 90, 180 or 270
    pub rotation: u16,
    /// Background color (hex: #RRGGBB or #AARRGGBB)
    pub background: String,
    /// Default drawing color (hex: #RRGGBB or #AARRGGBB)
    pub foreground: String,
    /// Image shown when there is no persisted state to restore
    pub splash: Option<String>,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 480,
            rotation: 0,
            background: "#FFFFFF".to_string(),
            foreground: "#000000".to_string(),
            splash: None,
        }
    }
}

/// Persistent state storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the snapshot, journal and clock files.
    /// Defaults to `~/.local/share/inkboard`.
    pub state_dir: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { state_dir: None }
    }
}

impl StorageConfig {
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => Ok(dirs::data_dir()
                .context("Failed to get data directory")?
                .join("inkboard")),
        }
    }
}

/// Update-distribution socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for update clients
    pub listen: String,
    /// Include originating commands in change notifications, for
    /// command-mode clients
    pub include_commands: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:11000".to_string(),
            include_commands: true,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("Invalid listen address {}", self.listen))
    }
}

/// Attached e-paper panel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Panel driver: "none" runs without hardware
    pub driver: String,
    /// Daily ghosting-refresh time as "HH:MM:SS", empty to disable
    pub refresh_time: Option<String>,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            driver: "none".to_string(),
            refresh_time: None,
        }
    }
}

impl PanelConfig {
    pub fn refresh_time(&self) -> Result<Option<NaiveTime>> {
        match self.refresh_time.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(t) => {
                let parsed = NaiveTime::parse_from_str(t, "%H:%M:%S")
                    .with_context(|| format!("Invalid refresh_time {t}"))?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let toml_string = toml::to_string_pretty(&Config::default()).unwrap();
        let back: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(back.screen.width, 800);
        assert_eq!(back.screen.height, 480);
        assert_eq!(back.screen.rotation, 0);
        assert_eq!(back.server.listen, "127.0.0.1:11000");
    }

    #[test]
    fn refresh_time_parsing() {
        let mut panel = PanelConfig::default();
        assert!(panel.refresh_time().unwrap().is_none());
        panel.refresh_time = Some("03:30:00".to_string());
        assert_eq!(
            panel.refresh_time().unwrap(),
            NaiveTime::from_hms_opt(3, 30, 0)
        );
        panel.refresh_time = Some("not a time".to_string());
        assert!(panel.refresh_time().is_err());
    }
}
