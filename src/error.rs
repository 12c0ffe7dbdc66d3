//! Error types for the bridge daemon.
//!
//! The command bridge itself never fails; these errors belong to the
//! collaborators around it: the Bluetooth session, the RFCOMM link, the GATT
//! server and configuration handling.

use bluer::Address;
use thiserror::Error;

/// Main error type for the bridge daemon.
#[derive(Error, Debug)]
pub enum BridgeError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("No paired Galaxy Buds found")]
   NoPairedDevice,

   #[error("Invalid Bluetooth address: {0}")]
   InvalidAddress(String),

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;
