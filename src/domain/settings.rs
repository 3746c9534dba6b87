use crate::domain::models::RegisterValue;
use crate::domain::security::{SecurityConfig, ACCESS_CODE_REGISTER, CHALLENGE_REGISTER};
use crate::infrastructure::bluetooth::connection::ConnectionConfig;
use crate::infrastructure::bluetooth::correlator::{
    LinkConfig, DEFAULT_BUSY_RETRY_ATTEMPTS, DEFAULT_BUSY_RETRY_DELAY, DEFAULT_OPERATION_TIMEOUT,
};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::session::{DeviceConfig, SessionConfig};
use crate::infrastructure::bluetooth::transport::GATT_BUSY;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log file rotation period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Minutely,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleLogSettings {
    pub enabled: bool,
    pub ansi_colors: bool,
}

impl Default for ConsoleLogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ansi_colors: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLogSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub file_name_prefix: String,
    pub rotation: LogRotation,
}

impl Default for FileLogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("logs"),
            file_name_prefix: "rangefinder_link".to_string(),
            rotation: LogRotation::Daily,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Filter directives, e.g. `"info"` or `"rangefinder_link=debug"`.
    /// `RUST_LOG` takes precedence.
    pub level: String,
    /// Log every frame on the link at trace level
    pub trace_frames: bool,
    pub console: ConsoleLogSettings,
    pub file: FileLogSettings,
    pub show_file_line: bool,
    pub show_thread_ids: bool,
    pub show_target: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            trace_frames: false,
            console: ConsoleLogSettings::default(),
            file: FileLogSettings::default(),
            show_file_line: true,
            show_thread_ids: false,
            show_target: true,
        }
    }
}

/// GATT layout of the rangefinder service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_read_uuid")]
    pub read_char_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub write_char_uuid: String,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            read_char_uuid: default_read_uuid(),
            write_char_uuid: default_write_uuid(),
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_read_uuid() -> String {
    protocol::READ_CHAR_UUID.to_string()
}
fn default_write_uuid() -> String {
    protocol::WRITE_CHAR_UUID.to_string()
}

/// Deadline and busy-retry policy, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSettings {
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_busy_retry_attempts")]
    pub busy_retry_attempts: u32,
    #[serde(default = "default_busy_retry_delay_ms")]
    pub busy_retry_delay_ms: u64,
    #[serde(default = "default_busy_status")]
    pub busy_status: i32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
            busy_retry_attempts: default_busy_retry_attempts(),
            busy_retry_delay_ms: default_busy_retry_delay_ms(),
            busy_status: default_busy_status(),
        }
    }
}

fn default_operation_timeout_ms() -> u64 {
    DEFAULT_OPERATION_TIMEOUT.as_millis() as u64
}
fn default_busy_retry_attempts() -> u32 {
    DEFAULT_BUSY_RETRY_ATTEMPTS
}
fn default_busy_retry_delay_ms() -> u64 {
    DEFAULT_BUSY_RETRY_DELAY.as_millis() as u64
}
fn default_busy_status() -> i32 {
    GATT_BUSY
}

/// Handshake registers. `None` disables that half of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default = "default_access_code_register")]
    pub access_code_register: Option<u16>,
    #[serde(default = "default_challenge_register")]
    pub challenge_register: Option<u16>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            access_code_register: default_access_code_register(),
            challenge_register: default_challenge_register(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_access_code_register() -> Option<u16> {
    Some(ACCESS_CODE_REGISTER)
}
fn default_challenge_register() -> Option<u16> {
    Some(CHALLENGE_REGISTER)
}
fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default)]
    pub disconnect: Option<RegisterValue>,
    #[serde(default)]
    pub keep_alive: Option<RegisterValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub link: LinkSettings,

    // Device Settings
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub device: DeviceSettings,

    // Known Devices
    #[serde(default)]
    pub known_addresses: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,
}

impl Settings {
    pub fn connection_config(&self) -> anyhow::Result<ConnectionConfig> {
        ConnectionConfig::parse(
            &self.ble.service_uuid,
            &self.ble.read_char_uuid,
            &self.ble.write_char_uuid,
        )
        .context("Invalid BLE UUID in settings")
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            operation_timeout: Duration::from_millis(self.link.operation_timeout_ms),
            busy_retry_attempts: self.link.busy_retry_attempts,
            busy_retry_delay: Duration::from_millis(self.link.busy_retry_delay_ms),
            busy_status: self.link.busy_status,
        }
    }

    pub fn security_config(&self) -> SecurityConfig {
        SecurityConfig {
            access_code_register: self.security.access_code_register,
            challenge_register: self.security.challenge_register,
            max_attempts: self.security.max_attempts,
        }
    }

    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        Ok(SessionConfig {
            connection: self.connection_config()?,
            link: self.link_config(),
            security: self.security_config(),
            device: DeviceConfig {
                disconnect: self.device.disconnect,
                keep_alive: self.device.keep_alive,
            },
        })
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults if it is missing
    /// or unreadable
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {:#}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("RangefinderLink");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Remember a device and make it the one to reconnect to
    pub fn remember_address(&mut self, address: &str) -> anyhow::Result<()> {
        if !self.settings.known_addresses.iter().any(|a| a == address) {
            self.settings.known_addresses.push(address.to_string());
        }
        self.settings.last_connected_address = Some(address.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_session_defaults() {
        let config = Settings::default().session_config().unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{ "link": { "operation_timeout_ms": 1500 }, "security": { "challenge_register": null } }"#,
        )
        .unwrap();
        assert_eq!(settings.link.operation_timeout_ms, 1500);
        assert_eq!(settings.link.busy_retry_attempts, 5);
        assert_eq!(settings.security.challenge_register, None);
        assert_eq!(settings.security.access_code_register, Some(1000));
        assert_eq!(
            settings.link_config().operation_timeout,
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_invalid_uuid_is_reported() {
        let mut settings = Settings::default();
        settings.ble.read_char_uuid = "not-a-uuid".to_string();
        assert!(settings.session_config().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::with_path(path.clone());
        service.get_mut().device.keep_alive = Some(RegisterValue::new(1010, 1));
        service.remember_address("AA:BB:CC:DD:EE:FF").unwrap();
        service.remember_address("AA:BB:CC:DD:EE:FF").unwrap();

        let reloaded = SettingsService::with_path(path);
        let settings = reloaded.get();
        assert_eq!(settings.known_addresses, vec!["AA:BB:CC:DD:EE:FF"]);
        assert_eq!(
            settings.last_connected_address.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(
            settings.device.keep_alive,
            Some(RegisterValue::new(1010, 1))
        );
    }

    #[test]
    fn test_log_settings_sections() {
        let settings: Settings = serde_json::from_str(
            r#"{ "log_settings": { "trace_frames": true, "file": { "rotation": "hourly" } } }"#,
        )
        .unwrap();
        let log = &settings.log_settings;
        assert!(log.trace_frames);
        assert_eq!(log.file.rotation, LogRotation::Hourly);
        assert_eq!(log.file.file_name_prefix, "rangefinder_link");
        assert!(log.console.enabled);
        assert_eq!(log.level, "info");

        assert!(serde_json::from_str::<LogRotation>(r#""weekly""#).is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::with_path(dir.path().join("absent.json"));
        assert_eq!(service.get().security.max_attempts, 3);
    }
}
