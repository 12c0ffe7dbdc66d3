//! Configuration management for the bridge daemon.
//!
//! This module handles loading and saving configuration from disk: which
//! earbuds to talk to, how to reach them, and how the GATT side presents
//! itself.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Main configuration structure for the daemon.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Bluetooth address of the earbuds. Recognised among paired devices when
   /// unset.
   #[serde(default)]
   pub device_address: Option<String>,

   #[serde(default = "default_name_patterns")]
   pub device_name_patterns: Vec<String>,

   /// Fixed RFCOMM channel. Resolved through the SPP profile when unset.
   #[serde(default)]
   pub spp_channel: Option<u8>,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_secs: u64,

   #[serde(default = "default_advertised_name")]
   pub advertised_name: String,

   #[serde(default = "default_request_status")]
   pub request_status_on_connect: bool,

   /// Parked commands older than this are dropped instead of flushed.
   #[serde(default)]
   pub pending_ttl_secs: Option<u64>,
}

fn default_name_patterns() -> Vec<String> {
   vec!["galaxy buds".to_string(), "buds3".to_string()]
}

const fn default_connect_timeout() -> u64 {
   10
}

fn default_advertised_name() -> String {
   "GalaxyBuds-Bridge".to_string()
}

const fn default_request_status() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         device_address: None,
         device_name_patterns: default_name_patterns(),
         spp_channel: None,
         connect_timeout_secs: default_connect_timeout(),
         advertised_name: default_advertised_name(),
         request_status_on_connect: default_request_status(),
         pending_ttl_secs: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the configuration to `path`.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(bridge_home) = env::var("BUDS_BRIDGE_HOME") {
         PathBuf::from(bridge_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home).join("budsbridged")
      } else if let Some(config_home) = dirs::config_dir() {
         config_home.join("budsbridged")
      } else {
         return Err(BridgeError::ConfigDirNotFound);
      };

      Ok(config_dir.join("config.toml"))
   }

   pub fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_secs)
   }

   pub fn pending_ttl(&self) -> Option<Duration> {
      self.pending_ttl_secs.map(Duration::from_secs)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_defaults_from_empty_file() {
      let config: Config = toml::from_str("").unwrap();
      assert_eq!(config, Config::default());
      assert_eq!(config.device_name_patterns, ["galaxy buds", "buds3"]);
      assert_eq!(config.connect_timeout(), Duration::from_secs(10));
      assert_eq!(config.advertised_name, "GalaxyBuds-Bridge");
      assert!(config.request_status_on_connect);
      assert_eq!(config.pending_ttl(), None);
   }

   #[test]
   fn test_partial_file() {
      let config: Config = toml::from_str(
         r#"
         device_address = "AA:BB:CC:DD:EE:FF"
         spp_channel = 3
         pending_ttl_secs = 30
         "#,
      )
      .unwrap();
      assert_eq!(config.device_address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
      assert_eq!(config.spp_channel, Some(3));
      assert_eq!(config.pending_ttl(), Some(Duration::from_secs(30)));
      assert_eq!(config.connect_timeout_secs, 10);
   }

   #[test]
   fn test_load_creates_default() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("nested").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());
   }

   #[test]
   fn test_save_and_reload() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");

      let config = Config {
         device_address: Some("11:22:33:44:55:66".to_string()),
         device_name_patterns: vec!["buds2".to_string(), "buds pro".to_string()],
         request_status_on_connect: false,
         ..Default::default()
      };
      config.save_to(&path).unwrap();

      assert_eq!(Config::load_from(&path).unwrap(), config);
   }

   #[test]
   fn test_invalid_file() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "connect_timeout_secs = \"soon\"").unwrap();

      assert!(matches!(Config::load_from(&path), Err(BridgeError::TomlParse(_))));
   }
}
