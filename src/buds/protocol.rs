//! Galaxy Buds SPP protocol definitions.
//!
//! Every message exchanged with the earbuds is wrapped in the same frame:
//!
//! ```text
//! [SOM 0xFD] [len lo] [len hi] [msg id] [payload ...] [crc lo] [crc hi] [EOM 0xDD]
//! ```
//!
//! `len` counts the message id, the payload and the two CRC bytes. The CRC is
//! CRC-16/XMODEM over the message id and payload.

use crc::{CRC_16_XMODEM, Crc};
use serde::{Deserialize, Serialize};

use crate::{bluetooth::rfcomm::Packet, bridge::PacketEncoder};

/// Start-of-message marker.
pub const SOM: u8 = 0xFD;
/// End-of-message marker.
pub const EOM: u8 = 0xDD;
/// Largest payload the bridge will ever frame.
pub const MAX_PAYLOAD: usize = 16;
/// SOM + two length bytes + msg id + two CRC bytes + EOM.
pub const FRAME_OVERHEAD: usize = 7;

pub const MSG_ACK: u8 = 0x42;
pub const MSG_EXTENDED_STATUS: u8 = 0x61;
pub const MSG_NOISE_CONTROLS_UPDATE: u8 = 0x77;
pub const MSG_NOISE_CONTROLS: u8 = 0x78;
pub const MSG_NOISE_REDUCTION_LEVEL: u8 = 0x83;
pub const MSG_AMBIENT_SOUND_LEVEL: u8 = 0x84;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Noise control modes understood by the earbuds.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum NoiseControlMode {
   #[strum(serialize = "off")]
   Off = 0,
   #[strum(serialize = "anc")]
   Anc = 1,
   #[strum(serialize = "ambient")]
   Ambient = 2,
   #[strum(serialize = "adaptive")]
   Adaptive = 3,
}

impl NoiseControlMode {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// CRC-16/XMODEM over `msg_id` followed by `payload`.
pub fn crc16(msg_id: u8, payload: &[u8]) -> u16 {
   let mut digest = CRC16.digest();
   digest.update(&[msg_id]);
   digest.update(payload);
   digest.finalize()
}

/// Frames a message for transmission.
pub fn build_packet(msg_id: u8, payload: &[u8]) -> Packet {
   let len = (1 + payload.len() + 2) as u16;
   let crc = crc16(msg_id, payload);

   let mut pkt = Packet::with_capacity(payload.len() + FRAME_OVERHEAD);
   pkt.push(SOM);
   pkt.extend_from_slice(&len.to_le_bytes());
   pkt.push(msg_id);
   pkt.extend_from_slice(payload);
   pkt.extend_from_slice(&crc.to_le_bytes());
   pkt.push(EOM);
   pkt
}

/// Asks the earbuds for a full extended status report.
pub fn status_request() -> Packet {
   build_packet(MSG_EXTENDED_STATUS, &[])
}

/// The frame encoder handed to the command bridge.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameEncoder;

impl PacketEncoder for FrameEncoder {
   fn encode(&self, msg_id: u8, payload: &[u8]) -> Packet {
      debug_assert!(payload.len() <= MAX_PAYLOAD);
      build_packet(msg_id, payload)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_crc_check_value() {
      // Standard CRC-16/XMODEM check value for "123456789".
      assert_eq!(crc16(b'1', b"23456789"), 0x31C3);
   }

   #[test]
   fn test_noise_controls_packet() {
      let pkt = build_packet(MSG_NOISE_CONTROLS, &[0x02]);
      assert_eq!(pkt.as_slice(), &[0xFD, 0x04, 0x00, 0x78, 0x02, 0xB2, 0xA1, 0xDD]);
   }

   #[test]
   fn test_ambient_level_packet() {
      let pkt = FrameEncoder.encode(MSG_AMBIENT_SOUND_LEVEL, &[0x50]);
      assert_eq!(pkt.as_slice(), &[0xFD, 0x04, 0x00, 0x84, 0x50, 0xA9, 0x8D, 0xDD]);
   }

   #[test]
   fn test_status_request() {
      let pkt = status_request();
      assert_eq!(pkt.as_slice(), &[0xFD, 0x03, 0x00, 0x61, 0x87, 0x7C, 0xDD]);
      assert_eq!(pkt.len(), FRAME_OVERHEAD);
   }

   #[test]
   fn test_max_payload_fits_inline() {
      let pkt = build_packet(MSG_NOISE_CONTROLS, &[0u8; MAX_PAYLOAD]);
      assert_eq!(pkt.len(), MAX_PAYLOAD + FRAME_OVERHEAD);
      assert!(!pkt.spilled());
   }

   #[test]
   fn test_noise_mode_names() {
      assert_eq!(NoiseControlMode::from_repr(2), Some(NoiseControlMode::Ambient));
      assert_eq!(NoiseControlMode::Anc.to_str(), "anc");
      assert_eq!("adaptive".parse::<NoiseControlMode>().ok(), Some(NoiseControlMode::Adaptive));
      assert!(NoiseControlMode::from_repr(4).is_none());
   }
}
