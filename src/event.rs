//! Event handling for bridge notifications.
//!
//! The bridge actor emits events when earbud telemetry changes or when a
//! connection test finishes; the GATT server turns them into notifications.

use std::sync::Arc;

use crate::{bridge::ConnectionTestResult, buds::telemetry::Telemetry};

/// Events that can be emitted by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
   BatteryUpdated(Telemetry),
   StatusUpdated(Telemetry),
   ConnectionTest(ConnectionTestResult),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: BridgeEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
