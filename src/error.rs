//! Error types for the BLE tap.
//!
//! This module defines the error taxonomy surfaced by scanning, GATT
//! sessions and capture, together with the ambient I/O and configuration
//! errors of the command-line front end.

use bluer::Address;
use smol_str::SmolStr;
use thiserror::Error;
use uuid::Uuid;

use crate::gatt::SessionState;

/// Main error type for the BLE tap.
#[derive(Error, Debug)]
pub enum BleError {
   #[error("Adapter unavailable: {0}")]
   AdapterUnavailable(SmolStr),

   #[error("Device not found: {0}")]
   NotFound(Address),

   #[error("Connection to {0} timed out")]
   ConnectTimeout(Address),

   #[error("Connection to {0} refused: {1}")]
   ConnectRefused(Address, String),

   #[error("Another GATT operation is already pending on this session")]
   SessionBusy,

   #[error("Unsupported operation: {0}")]
   UnsupportedOperation(String),

   #[error("Cannot {op} while session is {state}")]
   InvalidState {
      op: &'static str,
      state: SessionState,
   },

   #[error("Unknown characteristic: {0}")]
   UnknownCharacteristic(Uuid),

   #[error("Characteristic discovery failed: {0}")]
   DiscoveryFailed(String),

   #[error("GATT operation timed out")]
   OperationTimeout,

   #[error("Transport failure: {0}")]
   TransportFailure(String),

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("JSON serialization error: {0}")]
   Json(#[from] serde_json::Error),

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),
}

impl BleError {
   /// True for errors that mean the peer exists but the link could not be
   /// used, as opposed to the peer never having been seen.
   pub const fn is_connect_failure(&self) -> bool {
      matches!(
         self,
         Self::ConnectTimeout(_) | Self::ConnectRefused(..) | Self::TransportFailure(_)
      )
   }
}

/// Convenience type alias for Results with `BleError`.
pub type Result<T> = std::result::Result<T, BleError>;
