//! Galaxy Buds recognition among paired devices.
//!
//! A device is treated as Galaxy Buds if it advertises the Buds SPP service
//! UUID, or if its name or alias contains one of the configured patterns.

use bluer::{Adapter, Address};
use log::debug;

use crate::{
   bluetooth::rfcomm::SPP_UUID,
   error::{BridgeError, Result},
};

/// Case-insensitive substring match against the configured patterns.
pub fn matches_name(name: &str, patterns: &[String]) -> Option<usize> {
   let name = name.to_ascii_lowercase();
   patterns
      .iter()
      .position(|pattern| !pattern.is_empty() && name.contains(&pattern.to_ascii_lowercase()))
}

pub async fn is_device_buds(dev: &bluer::Device, patterns: &[String]) -> bool {
   if let Ok(Some(uuids)) = dev.uuids().await
      && uuids.contains(&SPP_UUID)
   {
      debug!("Galaxy Buds detected via SPP UUID: {}", dev.address());
      return true;
   }

   if let Ok(Some(name)) = dev.name().await
      && let Some(i) = matches_name(&name, patterns)
   {
      debug!("Galaxy Buds detected via name pattern: {name} => {}", patterns[i]);
      return true;
   }
   if let Ok(alias) = dev.alias().await
      && let Some(i) = matches_name(&alias, patterns)
   {
      debug!("Galaxy Buds detected via alias pattern: {alias} => {}", patterns[i]);
      return true;
   }
   false
}

/// First paired device that looks like Galaxy Buds.
pub async fn find_paired_buds(adapter: &Adapter, patterns: &[String]) -> Result<Address> {
   for address in adapter.device_addresses().await? {
      let dev = adapter.device(address)?;
      if !dev.is_paired().await.unwrap_or(false) {
         continue;
      }
      if is_device_buds(&dev, patterns).await {
         return Ok(address);
      }
   }
   Err(BridgeError::NoPairedDevice)
}
