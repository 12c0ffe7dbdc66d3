//! The command bridge.
//!
//! Control writes arrive from the GATT side whenever the user touches a
//! setting, but the earbuds link comes and goes on its own schedule. The
//! bridge hides that: a write while the link is down is parked in a single
//! pending slot and a connection is requested; once the transport reports the
//! link up, the parked command is flushed exactly once.
//!
//! The bridge never blocks and never fails. It owns no I/O of its own and
//! talks to the outside world through [`Transport`], [`PacketEncoder`] and the
//! event bus, which keeps it testable without a radio.

use std::{
   fmt,
   time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
   bluetooth::rfcomm::Packet,
   buds::protocol::{MAX_PAYLOAD, MSG_NOISE_CONTROLS},
   event::{BridgeEvent, EventSender},
};

/// Identifies one established transport link.
///
/// Handles are never reused, so events for a link that has since been
/// replaced can be told apart from events for the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u32);

impl fmt::Display for LinkHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
   #[default]
   Disconnected,
   ConnectRequested,
   Connected {
      handle: LinkHandle,
   },
}

/// A decoded control write.
///
/// One byte selects a noise control mode, two bytes are `[msg_id, level]`.
/// Values are forwarded unchanged; the earbuds decide what they accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPayload {
   NoiseMode(u8),
   Level { msg_id: u8, level: u8 },
}

impl CommandPayload {
   pub fn from_write(bytes: &[u8]) -> Option<Self> {
      match *bytes {
         [mode] => Some(Self::NoiseMode(mode)),
         [msg_id, level] => Some(Self::Level { msg_id, level }),
         _ => None,
      }
   }

   /// Message id and single-byte payload to frame.
   pub const fn message(self) -> (u8, u8) {
      match self {
         Self::NoiseMode(mode) => (MSG_NOISE_CONTROLS, mode),
         Self::Level { msg_id, level } => (msg_id, level),
      }
   }
}

/// A control write waiting for the link to come up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
   bytes: heapless::Vec<u8, MAX_PAYLOAD>,
   queued_at: Instant,
}

impl PendingCommand {
   fn new(bytes: &[u8]) -> Option<Self> {
      Some(Self {
         bytes: heapless::Vec::from_slice(bytes).ok()?,
         queued_at: Instant::now(),
      })
   }

   pub fn bytes(&self) -> &[u8] {
      &self.bytes
   }

   #[cfg(test)]
   pub fn len(&self) -> usize {
      self.bytes.len()
   }

   pub fn age(&self) -> Duration {
      self.queued_at.elapsed()
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTestResult {
   Succeeded,
   Failed,
}

impl ConnectionTestResult {
   /// Value exposed on the command characteristic.
   pub const fn as_byte(self) -> u8 {
      match self {
         Self::Succeeded => 0x01,
         Self::Failed => 0x00,
      }
   }
}

/// Frames a message for the wire.
pub trait PacketEncoder {
   fn encode(&self, msg_id: u8, payload: &[u8]) -> Packet;
}

/// The link to the earbuds.
///
/// Both calls must return without waiting on the radio. The outcome of a
/// connection request comes back later as a connected or connect-failed
/// event.
pub trait Transport {
   fn request_connection(&mut self);
   fn send(&mut self, handle: LinkHandle, packet: &[u8]);
}

pub struct CommandBridge<T, E> {
   transport: T,
   encoder: E,
   events: EventSender,
   state: ConnectionState,
   pending: Option<PendingCommand>,
   test_requested: bool,
   pending_ttl: Option<Duration>,
}

impl<T: Transport, E: PacketEncoder> CommandBridge<T, E> {
   pub fn new(transport: T, encoder: E, events: EventSender) -> Self {
      Self {
         transport,
         encoder,
         events,
         state: ConnectionState::Disconnected,
         pending: None,
         test_requested: false,
         pending_ttl: None,
      }
   }

   /// Drops parked commands older than `ttl` instead of flushing them.
   pub fn with_pending_ttl(mut self, ttl: Option<Duration>) -> Self {
      self.pending_ttl = ttl;
      self
   }

   #[cfg(test)]
   pub fn state(&self) -> ConnectionState {
      self.state
   }

   #[cfg(test)]
   pub fn pending(&self) -> Option<&PendingCommand> {
      self.pending.as_ref()
   }

   pub fn transport(&self) -> &T {
      &self.transport
   }

   pub fn transport_mut(&mut self) -> &mut T {
      &mut self.transport
   }

   /// Handles a write to the noise control characteristic.
   pub fn ingest_control_write(&mut self, bytes: &[u8]) {
      let Some(cmd) = CommandPayload::from_write(bytes) else {
         debug!("Discarding control write of {} bytes", bytes.len());
         return;
      };

      match self.state {
         ConnectionState::Connected { handle } => {
            self.pending = None;
            self.dispatch(handle, cmd);
         },
         ConnectionState::ConnectRequested => {
            self.park(bytes);
            debug!("Connection already requested, command parked");
         },
         ConnectionState::Disconnected => {
            self.park(bytes);
            self.request_connection();
         },
      }
   }

   /// The transport established a link.
   pub fn on_transport_connected(&mut self, handle: LinkHandle) {
      info!("Link {handle} connected");
      self.state = ConnectionState::Connected { handle };
      self.finish_test(ConnectionTestResult::Succeeded);

      let Some(pending) = self.pending.take() else {
         return;
      };
      if let Some(ttl) = self.pending_ttl
         && pending.age() > ttl
      {
         warn!(
            "Dropping stale command {} (queued {:?} ago)",
            hex::encode(pending.bytes()),
            pending.age()
         );
         return;
      }
      if let Some(cmd) = CommandPayload::from_write(pending.bytes()) {
         self.dispatch(handle, cmd);
      }
   }

   /// The established link went away. A parked command survives.
   pub fn on_transport_disconnected(&mut self) {
      info!("Link disconnected");
      self.state = ConnectionState::Disconnected;
      self.finish_test(ConnectionTestResult::Failed);
   }

   /// The outstanding connection request did not succeed. No retry is made.
   pub fn on_transport_connect_failed(&mut self) {
      if self.state != ConnectionState::ConnectRequested {
         debug!("Ignoring connect failure in state {:?}", self.state);
         return;
      }
      warn!("Connection request failed");
      self.state = ConnectionState::Disconnected;
      self.finish_test(ConnectionTestResult::Failed);
   }

   /// Handles a connection test from the command characteristic.
   pub fn request_connection_test(&mut self) {
      match self.state {
         ConnectionState::Connected { .. } => {
            self.emit_test(ConnectionTestResult::Succeeded);
         },
         ConnectionState::ConnectRequested => {
            self.test_requested = true;
         },
         ConnectionState::Disconnected => {
            self.test_requested = true;
            self.request_connection();
         },
      }
   }

   fn park(&mut self, bytes: &[u8]) {
      if let Some(prev) = &self.pending {
         debug!("Overwriting parked command {}", hex::encode(prev.bytes()));
      }
      self.pending = PendingCommand::new(bytes);
   }

   fn request_connection(&mut self) {
      info!("Requesting connection");
      self.state = ConnectionState::ConnectRequested;
      self.transport.request_connection();
   }

   fn dispatch(&mut self, handle: LinkHandle, cmd: CommandPayload) {
      let (msg_id, value) = cmd.message();
      let packet = self.encoder.encode(msg_id, &[value]);
      debug!("Sending 0x{msg_id:02x} [{value:#04x}] over {handle}");
      self.transport.send(handle, &packet);
   }

   fn finish_test(&mut self, result: ConnectionTestResult) {
      if std::mem::take(&mut self.test_requested) {
         self.emit_test(result);
      }
   }

   fn emit_test(&self, result: ConnectionTestResult) {
      info!("Connection test: {result:?}");
      self.events.emit(BridgeEvent::ConnectionTest(result));
   }
}
