//! Configuration management for the BLE tap.
//!
//! This module handles loading and saving configuration from disk: the
//! default adapter, scan presentation and staleness policy, session
//! timeouts, and capture queue sizing.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   discovery::registry::StalenessPolicy,
   error::{BleError, Result},
};

/// Main configuration structure.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
   /// Adapter to use (`hci0`, ...). The first powered adapter when unset.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<String>,

   #[serde(default)]
   pub scan: ScanConfig,

   #[serde(default)]
   pub session: SessionConfig,

   #[serde(default)]
   pub capture: CaptureConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
   #[default]
   Le,
   Bredr,
   Auto,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScanConfig {
   #[serde(default = "default_refresh_interval")]
   pub refresh_interval_ms: u64,

   /// Records not seen for this many seconds are hidden; 0 disables pruning.
   #[serde(default)]
   pub stale_after_secs: u64,

   #[serde(default)]
   pub transport: Transport,

   #[serde(default = "default_true")]
   pub duplicate_data: bool,

   /// How long to scan for a device that has not been seen yet before
   /// reporting it as not found.
   #[serde(default = "default_find_timeout")]
   pub find_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConfig {
   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_ms: u64,

   #[serde(default = "default_operation_timeout")]
   pub operation_timeout_ms: u64,

   #[serde(default = "default_discovery_timeout")]
   pub discovery_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
   /// HCI advertising reports synthesised from BlueZ device updates.
   #[default]
   Advertisements,
   /// Raw HCI monitor channel (needs `CAP_NET_RAW`).
   Monitor,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaptureConfig {
   #[serde(default = "default_queue_capacity")]
   pub queue_capacity: usize,

   #[serde(default)]
   pub source: CaptureSource,
}

const fn default_refresh_interval() -> u64 {
   1000
}

const fn default_true() -> bool {
   true
}

const fn default_find_timeout() -> u64 {
   5_000
}

const fn default_connect_timeout() -> u64 {
   10_000
}

const fn default_operation_timeout() -> u64 {
   5_000
}

const fn default_discovery_timeout() -> u64 {
   30_000
}

const fn default_queue_capacity() -> usize {
   1024
}

impl Default for ScanConfig {
   fn default() -> Self {
      Self {
         refresh_interval_ms: default_refresh_interval(),
         stale_after_secs: 0,
         transport: Transport::default(),
         duplicate_data: default_true(),
         find_timeout_ms: default_find_timeout(),
      }
   }
}

impl Default for SessionConfig {
   fn default() -> Self {
      Self {
         connect_timeout_ms: default_connect_timeout(),
         operation_timeout_ms: default_operation_timeout(),
         discovery_timeout_ms: default_discovery_timeout(),
      }
   }
}

impl Default for CaptureConfig {
   fn default() -> Self {
      Self {
         queue_capacity: default_queue_capacity(),
         source: CaptureSource::default(),
      }
   }
}

impl ScanConfig {
   pub const fn refresh_interval(&self) -> Duration {
      Duration::from_millis(self.refresh_interval_ms)
   }

   pub const fn find_timeout(&self) -> Duration {
      Duration::from_millis(self.find_timeout_ms)
   }

   pub const fn staleness(&self) -> StalenessPolicy {
      if self.stale_after_secs == 0 {
         StalenessPolicy::Never
      } else {
         StalenessPolicy::After(Duration::from_secs(self.stale_after_secs))
      }
   }
}

impl SessionConfig {
   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }

   pub const fn operation_timeout(&self) -> Duration {
      Duration::from_millis(self.operation_timeout_ms)
   }

   pub const fn discovery_timeout(&self) -> Duration {
      Duration::from_millis(self.discovery_timeout_ms)
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from an explicit path, writing defaults there if
   /// the file does not exist yet.
   pub fn load_from(config_path: &Path) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(config_path)?;
         Ok(config)
      }
   }

   /// Saves the configuration to the given path.
   pub fn save_to(&self, config_path: &Path) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BLETAP_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home).join("bletap")
      } else if let Some(config_home) = dirs::config_dir() {
         config_home.join("bletap")
      } else {
         return Err(BleError::ConfigDirNotFound);
      };

      Ok(config_dir.join("config.toml"))
   }
}
