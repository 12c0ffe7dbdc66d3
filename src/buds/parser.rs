//! Frame decoding and message parsing for the Galaxy Buds protocol.
//!
//! RFCOMM is a byte stream, so frames can arrive split across reads or
//! several to a read. [`FrameDecoder`] reassembles them; [`parse_frame`] turns
//! a validated frame into an [`Inbound`] message.

use log::debug;
use thiserror::Error;

use crate::{
   bluetooth::rfcomm::Packet,
   buds::protocol::{
      EOM, MSG_ACK, MSG_AMBIENT_SOUND_LEVEL, MSG_EXTENDED_STATUS, MSG_NOISE_CONTROLS,
      MSG_NOISE_CONTROLS_UPDATE, MSG_NOISE_REDUCTION_LEVEL, SOM, crc16,
   },
};

/// Error type for protocol parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
   /// Packet is too short for the expected format
   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },

   /// Length field cannot describe a valid frame
   #[error("Invalid frame length: {len}")]
   InvalidLength { len: usize },

   /// Frame does not end with the EOM marker
   #[error("Missing end-of-message marker, found 0x{found:02x}")]
   MissingEom { found: u8 },

   /// Checksum does not match the frame contents
   #[error("CRC mismatch: expected 0x{expected:04x}, got 0x{actual:04x}")]
   CrcMismatch { expected: u16, actual: u16 },
}

/// A validated frame with the envelope stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
   pub msg_id: u8,
   pub payload: Packet,
}

/// Streaming frame reassembler.
#[derive(Debug, Default)]
pub struct FrameDecoder {
   buf: Vec<u8>,
}

impl FrameDecoder {
   pub const fn new() -> Self {
      Self { buf: Vec::new() }
   }

   /// Appends freshly received bytes.
   pub fn push(&mut self, bytes: &[u8]) {
      self.buf.extend_from_slice(bytes);
   }

   /// Number of bytes waiting for the rest of a frame.
   #[cfg(test)]
   pub fn buffered(&self) -> usize {
      self.buf.len()
   }

   /// Pops the next frame out of the buffer.
   ///
   /// Returns `None` when more bytes are needed. A malformed frame yields an
   /// error and is skipped, so calling again resynchronises on the next SOM.
   pub fn decode(&mut self) -> Option<Result<Frame, ProtoError>> {
      let start = self.buf.iter().position(|&b| b == SOM);
      match start {
         Some(0) => {},
         Some(n) => {
            debug!("Skipping {n} bytes before SOM");
            self.buf.drain(..n);
         },
         None => {
            self.buf.clear();
            return None;
         },
      }

      if self.buf.len() < 4 {
         return None;
      }

      // Upper nibble of the high length byte carries flags.
      let len = self.buf[1] as usize | ((self.buf[2] as usize & 0x0F) << 8);
      if len < 3 {
         self.buf.drain(..1);
         return Some(Err(ProtoError::InvalidLength { len }));
      }

      let total = len + 4;
      if self.buf.len() < total {
         return None;
      }

      let found = self.buf[total - 1];
      if found != EOM {
         self.buf.drain(..1);
         return Some(Err(ProtoError::MissingEom { found }));
      }

      let frame: Vec<u8> = self.buf.drain(..total).collect();
      let msg_id = frame[3];
      let payload = &frame[4..total - 3];
      let actual = u16::from_le_bytes([frame[total - 3], frame[total - 2]]);
      let expected = crc16(msg_id, payload);
      if expected != actual {
         return Some(Err(ProtoError::CrcMismatch { expected, actual }));
      }

      Some(Ok(Frame {
         msg_id,
         payload: Packet::from_slice(payload),
      }))
   }
}

/// Fields carried by an extended status response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedStatus {
   pub battery_left: u8,
   pub battery_right: u8,
   pub wearing: bool,
   pub noise_control: u8,
}

/// Acknowledgement of a setting change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
   NoiseControl(u8),
   NoiseReductionLevel(u8),
   AmbientSoundLevel(u8),
   Other { msg_id: u8, value: u8 },
}

/// A message received from the earbuds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
   ExtendedStatus(ExtendedStatus),
   Ack(Ack),
   NoiseControlsUpdate(u8),
   Unknown { msg_id: u8 },
}

const NOISE_CONTROL_OFFSET: usize = 31;

/// Truncated reports are rejected as a whole.
pub fn parse_extended_status(payload: &[u8]) -> Result<ExtendedStatus, ProtoError> {
   if payload.len() <= NOISE_CONTROL_OFFSET {
      return Err(ProtoError::PacketTooShort {
         expected: NOISE_CONTROL_OFFSET + 1,
         actual: payload.len(),
      });
   }
   Ok(ExtendedStatus {
      battery_left: payload[2],
      battery_right: payload[3],
      wearing: payload[4] & 0x01 != 0,
      noise_control: payload[NOISE_CONTROL_OFFSET],
   })
}

pub fn parse_ack(payload: &[u8]) -> Result<Ack, ProtoError> {
   let &[msg_id, value, ..] = payload else {
      return Err(ProtoError::PacketTooShort {
         expected: 2,
         actual: payload.len(),
      });
   };
   Ok(match msg_id {
      MSG_NOISE_CONTROLS => Ack::NoiseControl(value),
      MSG_NOISE_REDUCTION_LEVEL => Ack::NoiseReductionLevel(value),
      MSG_AMBIENT_SOUND_LEVEL => Ack::AmbientSoundLevel(value),
      _ => Ack::Other { msg_id, value },
   })
}

/// Interprets a validated frame.
pub fn parse_frame(frame: &Frame) -> Result<Inbound, ProtoError> {
   match frame.msg_id {
      MSG_EXTENDED_STATUS => parse_extended_status(&frame.payload).map(Inbound::ExtendedStatus),
      MSG_ACK => parse_ack(&frame.payload).map(Inbound::Ack),
      MSG_NOISE_CONTROLS_UPDATE => {
         let Some(&mode) = frame.payload.first() else {
            return Err(ProtoError::PacketTooShort {
               expected: 1,
               actual: 0,
            });
         };
         Ok(Inbound::NoiseControlsUpdate(mode))
      },
      msg_id => Ok(Inbound::Unknown { msg_id }),
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::buds::protocol::build_packet;

   #[test]
   fn test_decode_single_frame() {
      let mut dec = FrameDecoder::new();
      dec.push(&[0xFD, 0x05, 0x00, 0x42, 0x78, 0x01, 0x1C, 0xE2, 0xDD]);

      let frame = dec.decode().unwrap().unwrap();
      assert_eq!(frame.msg_id, MSG_ACK);
      assert_eq!(frame.payload.as_slice(), &[0x78, 0x01]);
      assert!(dec.decode().is_none());
      assert_eq!(dec.buffered(), 0);
   }

   #[test]
   fn test_decode_split_and_batched() {
      let a = build_packet(MSG_NOISE_CONTROLS_UPDATE, &[0x01]);
      let b = build_packet(MSG_ACK, &[MSG_AMBIENT_SOUND_LEVEL, 0x03]);
      let mut stream = a.to_vec();
      stream.extend_from_slice(&b);

      let mut dec = FrameDecoder::new();
      dec.push(&stream[..5]);
      assert!(dec.decode().is_none());
      dec.push(&stream[5..]);

      let first = dec.decode().unwrap().unwrap();
      assert_eq!(first.msg_id, MSG_NOISE_CONTROLS_UPDATE);
      let second = dec.decode().unwrap().unwrap();
      assert_eq!(second.payload.as_slice(), &[MSG_AMBIENT_SOUND_LEVEL, 0x03]);
      assert!(dec.decode().is_none());
   }

   #[test]
   fn test_decode_skips_garbage() {
      let mut dec = FrameDecoder::new();
      dec.push(&[0x00, 0x13, 0x37]);
      dec.push(&build_packet(MSG_NOISE_CONTROLS_UPDATE, &[0x02]));

      let frame = dec.decode().unwrap().unwrap();
      assert_eq!(frame.payload.as_slice(), &[0x02]);
   }

   #[test]
   fn test_decode_masks_length_flags() {
      let mut pkt = build_packet(MSG_NOISE_CONTROLS_UPDATE, &[0x03]).to_vec();
      pkt[2] |= 0x30;

      let mut dec = FrameDecoder::new();
      dec.push(&pkt);
      let frame = dec.decode().unwrap().unwrap();
      assert_eq!(frame.payload.as_slice(), &[0x03]);
   }

   #[test]
   fn test_decode_rejects_bad_crc_and_recovers() {
      let mut bad = build_packet(MSG_NOISE_CONTROLS_UPDATE, &[0x01]).to_vec();
      bad[5] ^= 0xFF;

      let mut dec = FrameDecoder::new();
      dec.push(&bad);
      dec.push(&build_packet(MSG_NOISE_CONTROLS_UPDATE, &[0x02]));

      assert!(matches!(dec.decode(), Some(Err(ProtoError::CrcMismatch { .. }))));
      let frame = dec.decode().unwrap().unwrap();
      assert_eq!(frame.payload.as_slice(), &[0x02]);
   }

   #[test]
   fn test_decode_rejects_missing_eom() {
      let mut bad = build_packet(MSG_NOISE_CONTROLS_UPDATE, &[0x01]).to_vec();
      *bad.last_mut().unwrap() = 0x00;

      let mut dec = FrameDecoder::new();
      dec.push(&bad);
      assert_eq!(dec.decode(), Some(Err(ProtoError::MissingEom { found: 0x00 })));
   }

   #[test]
   fn test_parse_extended_status() {
      let mut payload = vec![0u8; 32];
      payload[2] = 85;
      payload[3] = 90;
      payload[4] = 0x01;
      payload[31] = 2;

      let frame = Frame {
         msg_id: MSG_EXTENDED_STATUS,
         payload: Packet::from_slice(&payload),
      };
      let Inbound::ExtendedStatus(status) = parse_frame(&frame).unwrap() else {
         panic!("not an extended status");
      };
      assert_eq!(status.battery_left, 85);
      assert_eq!(status.battery_right, 90);
      assert!(status.wearing);
      assert_eq!(status.noise_control, 2);
   }

   #[test]
   fn test_parse_short_extended_status() {
      assert_eq!(
         parse_extended_status(&[0x00, 0x00, 40, 41]),
         Err(ProtoError::PacketTooShort {
            expected: 32,
            actual: 4
         })
      );

      let frame = Frame {
         msg_id: MSG_EXTENDED_STATUS,
         payload: Packet::from_slice(&[0u8; 31]),
      };
      assert!(matches!(parse_frame(&frame), Err(ProtoError::PacketTooShort { .. })));
   }

   #[test]
   fn test_parse_acks() {
      assert_eq!(parse_ack(&[0x78, 0x01]), Ok(Ack::NoiseControl(1)));
      assert_eq!(parse_ack(&[0x83, 0x02]), Ok(Ack::NoiseReductionLevel(2)));
      assert_eq!(parse_ack(&[0x84, 0x50]), Ok(Ack::AmbientSoundLevel(0x50)));
      assert_eq!(
         parse_ack(&[0x10, 0x07]),
         Ok(Ack::Other {
            msg_id: 0x10,
            value: 0x07
         })
      );
      assert!(matches!(parse_ack(&[0x78]), Err(ProtoError::PacketTooShort { .. })));
   }
}
