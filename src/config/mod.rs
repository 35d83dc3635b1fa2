//! Configuration and push credential storage

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::push::PushCredentialStore;
use crate::session::ControllerSettings;

/// Application configuration
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client identity used when registering for pushes and placing calls
    pub identity: Option<String>,
    /// Last device token successfully registered for VoIP pushes (hex)
    pub device_token: Option<String>,
    /// When that registration was made (unix seconds)
    pub binding_date: Option<i64>,
    #[serde(default)]
    pub calls: CallSettings,
    #[serde(default)]
    pub push: PushSettings,
}

/// Call handling settings (`[calls]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    /// Concurrent call groups (1 or 2)
    pub line_groups: u8,
    /// Play a local ringback while the remote side rings
    pub play_custom_ringback: bool,
    /// Route audio to the speaker when a call connects
    pub speaker_on_connect: bool,
    /// Seconds to wait for the SDK to confirm a hangup
    pub disconnect_timeout_secs: u64,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            line_groups: 1,
            play_custom_ringback: false,
            speaker_on_connect: true,
            disconnect_timeout_secs: 10,
        }
    }
}

/// Push registration settings (`[push]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    /// Lifetime of a push registration on the server side
    pub registration_ttl_days: i64,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            registration_ttl_days: 365,
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "voice-cli", "voice-cli")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Device token identifies this install to the push service
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Settings for the session controller.
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            line_groups: self.calls.line_groups.max(1),
            play_custom_ringback: self.calls.play_custom_ringback,
            speaker_on_connect: self.calls.speaker_on_connect,
            disconnect_timeout: Duration::from_secs(self.calls.disconnect_timeout_secs),
            identity: self.identity.clone(),
        }
    }
}

impl PushCredentialStore for Config {
    fn cached_device_token(&self) -> Option<&str> {
        self.device_token.as_deref()
    }

    fn binding_date(&self) -> Option<i64> {
        self.binding_date
    }

    fn store_binding(&mut self, device_token: String, bound_at: i64) {
        self.device_token = Some(device_token);
        self.binding_date = Some(bound_at);
    }

    fn clear_binding(&mut self) {
        self.device_token = None;
        self.binding_date = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tables_use_defaults() {
        let config: Config = toml::from_str("identity = \"alice\"\n").unwrap();
        assert_eq!(config.identity.as_deref(), Some("alice"));
        assert_eq!(config.calls.line_groups, 1);
        assert!(config.calls.speaker_on_connect);
        assert_eq!(config.push.registration_ttl_days, 365);
    }

    #[test]
    fn test_partial_calls_table() {
        let config: Config =
            toml::from_str("[calls]\nline_groups = 2\nplay_custom_ringback = true\n").unwrap();
        let settings = config.controller_settings();
        assert_eq!(settings.line_groups, 2);
        assert!(settings.play_custom_ringback);
        assert_eq!(settings.disconnect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_line_groups_clamped() {
        let config: Config = toml::from_str("[calls]\nline_groups = 0\n").unwrap();
        assert_eq!(config.controller_settings().line_groups, 1);
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir()
            .join(format!("voice-cli-test-{}", uuid::Uuid::new_v4()))
            .join("config.toml");

        let mut config = Config::default();
        config.store_binding("abcd".to_string(), 1_700_000_000);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.cached_device_token(), Some("abcd"));
        assert_eq!(loaded.binding_date(), Some(1_700_000_000));

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let path = std::env::temp_dir().join("voice-cli-does-not-exist.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(config.device_token.is_none());
    }
}
