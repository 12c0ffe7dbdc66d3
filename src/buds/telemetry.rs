//! Last-known earbud state.
//!
//! The mirror is populated from inbound packets only. Every field starts out
//! unknown and stays that way until the earbuds report it.

use log::debug;
use serde_json::json;

use crate::buds::{
   parser::{Ack, ExtendedStatus, Inbound},
   protocol::NoiseControlMode,
};

/// Byte used on the GATT side for values the earbuds have not reported yet.
pub const UNKNOWN: u8 = 0xFF;

/// Represents the result of an update operation on a telemetry field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A new value was inserted (None -> Some)
   Inserted,
   /// An existing value was updated, holding the previous value
   Updated(T),
}

impl<T: PartialEq + Copy> UpdateOp<T> {
   fn apply(dst: &mut Option<T>, new: Option<T>) -> Self {
      let Some(new) = new else {
         return Self::Noop;
      };
      match dst.replace(new) {
         Some(prev) if prev == new => Self::Noop,
         Some(prev) => Self::Updated(prev),
         None => Self::Inserted,
      }
   }

   pub const fn is_updated(&self) -> bool {
      matches!(self, Self::Inserted | Self::Updated(_))
   }
}

/// Which characteristic groups changed after applying a packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Changes {
   pub battery: bool,
   pub status: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Telemetry {
   pub battery_left: Option<u8>,
   pub battery_right: Option<u8>,
   pub wearing: Option<bool>,
   pub noise_control: Option<u8>,
   pub anc_level: Option<u8>,
   pub ambient_level: Option<u8>,
}

impl Telemetry {
   pub const fn new() -> Self {
      Self {
         battery_left: None,
         battery_right: None,
         wearing: None,
         noise_control: None,
         anc_level: None,
         ambient_level: None,
      }
   }

   /// Folds an inbound message into the mirror.
   pub fn apply(&mut self, msg: &Inbound) -> Changes {
      match *msg {
         Inbound::ExtendedStatus(status) => self.apply_status(status),
         Inbound::Ack(ack) => self.apply_ack(ack),
         Inbound::NoiseControlsUpdate(mode) => Changes {
            battery: false,
            status: UpdateOp::apply(&mut self.noise_control, Some(mode)).is_updated(),
         },
         Inbound::Unknown { .. } => Changes::default(),
      }
   }

   fn apply_status(&mut self, status: ExtendedStatus) -> Changes {
      let left = UpdateOp::apply(&mut self.battery_left, Some(status.battery_left));
      let right = UpdateOp::apply(&mut self.battery_right, Some(status.battery_right));
      let wearing = UpdateOp::apply(&mut self.wearing, Some(status.wearing));
      let noise = UpdateOp::apply(&mut self.noise_control, Some(status.noise_control));
      if let UpdateOp::Updated(prev) = noise {
         debug!("Noise control changed from {prev} to {}", status.noise_control);
      }
      Changes {
         battery: left.is_updated() || right.is_updated(),
         status: wearing.is_updated() || noise.is_updated(),
      }
   }

   fn apply_ack(&mut self, ack: Ack) -> Changes {
      let op: UpdateOp<u8> = match ack {
         Ack::NoiseControl(mode) => UpdateOp::apply(&mut self.noise_control, Some(mode)),
         Ack::NoiseReductionLevel(level) => UpdateOp::apply(&mut self.anc_level, Some(level)),
         Ack::AmbientSoundLevel(level) => UpdateOp::apply(&mut self.ambient_level, Some(level)),
         Ack::Other { .. } => UpdateOp::Noop,
      };
      if let UpdateOp::Updated(prev) = op {
         debug!("{ack:?} replaces previous value {prev}");
      }
      Changes {
         battery: false,
         status: op.is_updated(),
      }
   }

   pub fn noise_mode(&self) -> Option<NoiseControlMode> {
      self.noise_control.and_then(NoiseControlMode::from_repr)
   }

   /// Level that goes with the active mode, if the mode has one.
   pub fn active_level(&self) -> Option<u8> {
      match self.noise_mode()? {
         NoiseControlMode::Anc => self.anc_level,
         NoiseControlMode::Ambient => self.ambient_level,
         NoiseControlMode::Off | NoiseControlMode::Adaptive => None,
      }
   }

   /// Battery characteristic value: `[left, right]`.
   pub fn battery_bytes(&self) -> [u8; 2] {
      [
         self.battery_left.unwrap_or(UNKNOWN),
         self.battery_right.unwrap_or(UNKNOWN),
      ]
   }

   /// Status characteristic value: `[wearing, mode, level]`.
   pub fn status_bytes(&self) -> [u8; 3] {
      [
         self.wearing.map_or(UNKNOWN, u8::from),
         self.noise_control.unwrap_or(UNKNOWN),
         self.active_level().unwrap_or(UNKNOWN),
      ]
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "battery_left": self.battery_left,
          "battery_right": self.battery_right,
          "wearing": self.wearing,
          "noise_mode": self.noise_mode().map(NoiseControlMode::to_str),
          "anc_level": self.anc_level,
          "ambient_level": self.ambient_level,
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn full_status(left: u8, right: u8, wearing: bool, mode: u8) -> Inbound {
      Inbound::ExtendedStatus(ExtendedStatus {
         battery_left: left,
         battery_right: right,
         wearing,
         noise_control: mode,
      })
   }

   #[test]
   fn test_unknown_encodings() {
      let t = Telemetry::new();
      assert_eq!(t.battery_bytes(), [0xFF, 0xFF]);
      assert_eq!(t.status_bytes(), [0xFF, 0xFF, 0xFF]);
   }

   #[test]
   fn test_extended_status_changes() {
      let mut t = Telemetry::new();
      let changes = t.apply(&full_status(80, 75, true, 1));
      assert_eq!(
         changes,
         Changes {
            battery: true,
            status: true
         }
      );
      assert_eq!(t.battery_bytes(), [80, 75]);

      // Same report again changes nothing.
      assert_eq!(t.apply(&full_status(80, 75, true, 1)), Changes::default());

      let changes = t.apply(&full_status(79, 75, true, 1));
      assert!(changes.battery);
      assert!(!changes.status);
   }

   #[test]
   fn test_status_level_follows_mode() {
      let mut t = Telemetry::new();
      t.apply(&full_status(50, 50, false, 1));
      t.apply(&Inbound::Ack(Ack::NoiseReductionLevel(3)));
      t.apply(&Inbound::Ack(Ack::AmbientSoundLevel(0x50)));
      assert_eq!(t.status_bytes(), [0, 1, 3]);

      let changes = t.apply(&Inbound::Ack(Ack::NoiseControl(2)));
      assert!(changes.status);
      assert_eq!(t.status_bytes(), [0, 2, 0x50]);

      t.apply(&Inbound::NoiseControlsUpdate(0));
      assert_eq!(t.noise_mode(), Some(NoiseControlMode::Off));
      assert_eq!(t.status_bytes(), [0, 0, 0xFF]);
   }

   #[test]
   fn test_unrelated_messages_are_ignored() {
      let mut t = Telemetry::new();
      let before = t;
      assert_eq!(
         t.apply(&Inbound::Ack(Ack::Other {
            msg_id: 0x10,
            value: 1
         })),
         Changes::default()
      );
      assert_eq!(t.apply(&Inbound::Unknown { msg_id: 0x99 }), Changes::default());
      assert_eq!(t, before);
   }

   #[test]
   fn test_update_op() {
      let mut slot = None;
      assert_eq!(UpdateOp::apply(&mut slot, Some(1u8)), UpdateOp::Inserted);
      assert_eq!(UpdateOp::apply(&mut slot, Some(1u8)), UpdateOp::Noop);
      assert_eq!(UpdateOp::apply(&mut slot, Some(2u8)), UpdateOp::Updated(1));
      assert_eq!(UpdateOp::apply(&mut slot, None), UpdateOp::Noop);
      assert_eq!(slot, Some(2));
   }

   #[test]
   fn test_json_snapshot() {
      let mut t = Telemetry::new();
      t.apply(&full_status(60, 61, true, 3));
      let json = t.to_json();
      assert_eq!(json["battery_left"], 60);
      assert_eq!(json["noise_mode"], "adaptive");
      assert!(json["anc_level"].is_null());
   }
}
