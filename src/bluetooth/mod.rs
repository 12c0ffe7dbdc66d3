//! Bluetooth communication layer for the earbuds side.
//!
//! This module provides the RFCOMM link and the actor that owns the bridge
//! and drives the link lifecycle.

pub mod manager;
pub mod rfcomm;
