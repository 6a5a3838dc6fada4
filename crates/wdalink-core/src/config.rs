//! Device connection configuration.
//!
//! Stored in `~/.wdalink/config.json`. Every field has a default, so a
//! missing or partial file is fine. Ports can additionally be overridden
//! from the environment with `WDA_PORT` and `WDA_MJPEG_PORT`; invalid values
//! are logged and ignored.
//!
//! # Example
//!
//! ```no_run
//! use wdalink_core::config::DeviceConfig;
//!
//! // Load (returns defaults if file doesn't exist), then apply env overrides.
//! let config = DeviceConfig::load().with_env_overrides();
//! println!("command port {}, stream port {}", config.port, config.mjpeg_port);
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::transport::TransportKind;

const CONFIG_DIR: &str = ".wdalink";
const CONFIG_FILENAME: &str = "config.json";

/// Default port of the automation server's command endpoint.
pub const DEFAULT_WDA_PORT: u16 = 8100;

/// Default port of the automation server's MJPEG screen stream.
pub const DEFAULT_MJPEG_PORT: u16 = 9100;

/// Environment variable overriding [`DeviceConfig::port`].
pub const WDA_PORT_ENV: &str = "WDA_PORT";

/// Environment variable overriding [`DeviceConfig::mjpeg_port`].
pub const WDA_MJPEG_PORT_ENV: &str = "WDA_MJPEG_PORT";

/// Returns the wdalink configuration directory (`~/.wdalink/`).
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR)
}

/// How to find and reach the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// UDID of the device to use; the first attached device when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,
    /// Command port on the device (or forwarded locally for TCP).
    pub port: u16,
    /// Screen-stream port on the device (or forwarded locally for TCP).
    pub mjpeg_port: u16,
    /// Start server-side log capture when the session opens.
    pub log_on: bool,
    /// How the ports are reached.
    pub transport: TransportKind,
    /// Go to the home screen before the session is created, so a busy
    /// foreground app cannot stall session setup.
    pub reset_to_home: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            udid: None,
            port: DEFAULT_WDA_PORT,
            mjpeg_port: DEFAULT_MJPEG_PORT,
            log_on: false,
            transport: TransportKind::Usb,
            reset_to_home: false,
        }
    }
}

impl DeviceConfig {
    /// Load config from `~/.wdalink/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        let path = config_dir().join(CONFIG_FILENAME);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.wdalink/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        let dir = config_dir();
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(dir.join(CONFIG_FILENAME), json)
    }

    /// Applies `WDA_PORT` / `WDA_MJPEG_PORT` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Applies port overrides read through `lookup`.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(port) = port_override(WDA_PORT_ENV, lookup(WDA_PORT_ENV)) {
            self.port = port;
        }
        if let Some(port) = port_override(WDA_MJPEG_PORT_ENV, lookup(WDA_MJPEG_PORT_ENV)) {
            self.mjpeg_port = port;
        }
        self
    }
}

fn port_override(name: &str, raw: Option<String>) -> Option<u16> {
    let raw = raw.filter(|v| !v.trim().is_empty())?;
    match raw.trim().parse::<u16>() {
        Ok(port) if port != 0 => {
            info!(var = name, port, "override with environment variable");
            Some(port)
        }
        Ok(_) => {
            error!(var = name, value = %raw, "port 0 is not usable, ignored");
            None
        }
        Err(e) => {
            error!(var = name, value = %raw, error = %e, "invalid port, ignored");
            None
        }
    }
}
