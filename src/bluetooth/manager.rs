//! Bridge manager.
//!
//! A single actor task owns the command bridge, the earbuds link and the
//! telemetry mirror. GATT callbacks and link tasks never touch that state
//! directly; they post [`ManagerCommand`]s and the actor applies them one at
//! a time.

use std::{sync::Arc, time::Duration};

use bluer::{Address, Session};
use log::{debug, info, warn};
use tokio::{
   select,
   sync::mpsc,
   task::JoinSet,
};

use crate::{
   bluetooth::rfcomm::{self, Packet, SppSender},
   bridge::{CommandBridge, LinkHandle, Transport},
   buds::{
      parser::{self, Frame},
      protocol::{FrameEncoder, status_request},
      recognition,
      telemetry::Telemetry,
   },
   config::Config,
   error::{BridgeError, Result},
   event::{BridgeEvent, EventSender},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Live SPP link. Dropping it tears down the reader and writer tasks.
#[derive(Debug)]
struct SppLink {
   sender: SppSender,
   jset: JoinSet<()>,
}

impl Drop for SppLink {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

enum ManagerCommand {
   // GATT requests
   ControlWrite(Packet),
   ConnectionTest,

   // Link events
   LinkEstablished(LinkHandle, SppLink),
   LinkFailed(LinkHandle),
   LinkClosed(LinkHandle),
   Inbound(LinkHandle, Frame),
}

/// Where and how to reach the earbuds.
#[derive(Debug, Clone)]
struct LinkTarget {
   address: Option<Address>,
   patterns: Vec<String>,
   channel: Option<u8>,
   timeout: Duration,
}

impl LinkTarget {
   fn from_config(config: &Config) -> Result<Self> {
      let address = config
         .device_address
         .as_deref()
         .map(|s| {
            s.parse::<Address>()
               .map_err(|_| BridgeError::InvalidAddress(s.to_string()))
         })
         .transpose()?;
      Ok(Self {
         address,
         patterns: config.device_name_patterns.clone(),
         channel: config.spp_channel,
         timeout: config.connect_timeout(),
      })
   }

   async fn resolve(&self, session: &Session) -> Result<Address> {
      let adapter = session.default_adapter().await?;
      match self.address {
         Some(address) if adapter.device_addresses().await?.contains(&address) => Ok(address),
         Some(address) => Err(BridgeError::DeviceNotFound(address)),
         None => recognition::find_paired_buds(&adapter, &self.patterns).await,
      }
   }
}

// === Link tracking ===

/// Tracks the in-flight connection attempt and the established link.
///
/// Every attempt gets a fresh handle. An establish or failure report counts
/// only for the current attempt, a close or inbound frame only for the active
/// link; anything else belongs to a superseded link and is ignored.
#[derive(Debug)]
struct LinkTracker<L> {
   next_handle: u32,
   attempt: Option<LinkHandle>,
   active: Option<(LinkHandle, L)>,
}

impl<L> LinkTracker<L> {
   const fn new() -> Self {
      Self {
         next_handle: 0,
         attempt: None,
         active: None,
      }
   }

   fn begin_attempt(&mut self) -> LinkHandle {
      self.next_handle = self.next_handle.wrapping_add(1);
      let handle = LinkHandle(self.next_handle);
      self.attempt = Some(handle);
      handle
   }

   /// Promotes the current attempt to the active link. A stale link is
   /// handed back so the caller decides when it is dropped.
   fn establish(&mut self, handle: LinkHandle, link: L) -> std::result::Result<(), L> {
      if self.attempt != Some(handle) {
         return Err(link);
      }
      self.attempt = None;
      self.active = Some((handle, link));
      Ok(())
   }

   fn fail(&mut self, handle: LinkHandle) -> bool {
      if self.attempt != Some(handle) {
         return false;
      }
      self.attempt = None;
      true
   }

   fn close(&mut self, handle: LinkHandle) -> bool {
      if !self.is_active(handle) {
         return false;
      }
      self.active = None;
      true
   }

   fn is_active(&self, handle: LinkHandle) -> bool {
      self.active.as_ref().is_some_and(|(h, _)| *h == handle)
   }

   fn link(&self, handle: LinkHandle) -> Option<&L> {
      match &self.active {
         Some((h, link)) if *h == handle => Some(link),
         _ => None,
      }
   }

   fn clear(&mut self) {
      self.attempt = None;
      self.active = None;
   }
}

// === Manager ===

/// Handle to the bridge actor.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct BridgeManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl BridgeManager {
   pub fn new(session: Session, events: EventSender, config: &Config) -> Result<Self> {
      let target = Arc::new(LinkTarget::from_config(config)?);
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

      let transport = SppTransport {
         session,
         target,
         loopback: loopback_tx,
         links: LinkTracker::new(),
      };
      let bridge = CommandBridge::new(transport, FrameEncoder, events.clone())
         .with_pending_ttl(config.pending_ttl());

      tokio::spawn(
         BridgeActor {
            bridge,
            telemetry: Telemetry::new(),
            events,
            request_status: config.request_status_on_connect,
            command_rx,
            loopback_rx,
         }
         .run(),
      );
      Ok(Self { inbox: command_tx })
   }

   /// Forwards a write on the noise control characteristic.
   pub async fn control_write(&self, data: &[u8]) -> Result<()> {
      self
         .inbox
         .send(ManagerCommand::ControlWrite(Packet::from_slice(data)))
         .await
         .map_err(|_| BridgeError::ManagerShutdown)
   }

   /// Starts a connection test; the result arrives as a [`BridgeEvent`].
   pub async fn connection_test(&self) -> Result<()> {
      self
         .inbox
         .send(ManagerCommand::ConnectionTest)
         .await
         .map_err(|_| BridgeError::ManagerShutdown)
   }
}

// === Transport ===

/// [`Transport`] over RFCOMM.
///
/// Connection attempts run on their own task and report back through the
/// actor's loopback channel.
struct SppTransport {
   session: Session,
   target: Arc<LinkTarget>,
   loopback: mpsc::Sender<ManagerCommand>,
   links: LinkTracker<SppLink>,
}

impl Transport for SppTransport {
   fn request_connection(&mut self) {
      let handle = self.links.begin_attempt();

      let session = self.session.clone();
      let target = self.target.clone();
      let loopback = self.loopback.clone();

      tokio::spawn(async move {
         let connect = async {
            let address = target.resolve(&session).await?;
            let mut jset = JoinSet::new();
            let (rx, sender) =
               rfcomm::connect(&mut jset, &session, address, target.channel, target.timeout)
                  .await?;
            Ok::<_, BridgeError>((address, rx, SppLink { sender, jset }))
         };

         let (address, mut rx, link) = match connect.await {
            Ok(x) => x,
            Err(e) => {
               warn!("Failed to establish SPP link {handle}: {e}");
               if let Err(e) = loopback.send(ManagerCommand::LinkFailed(handle)).await {
                  warn!("Channel overflow sending link failure: {e}");
               }
               return;
            },
         };

         info!("SPP link {handle} to {address} established");
         if let Err(e) = loopback
            .send(ManagerCommand::LinkEstablished(handle, link))
            .await
         {
            warn!("Channel overflow sending link established: {e}");
            return;
         }

         while let Ok(frame) = rx.recv().await {
            if loopback
               .send(ManagerCommand::Inbound(handle, frame))
               .await
               .is_err()
            {
               return;
            }
         }

         info!("SPP link {handle} to {address} closed");
         let _ = loopback.send(ManagerCommand::LinkClosed(handle)).await;
      });
   }

   fn send(&mut self, handle: LinkHandle, packet: &[u8]) {
      match self.links.link(handle) {
         Some(link) => {
            if let Err(e) = link.sender.post(packet) {
               warn!("Failed to queue packet on link {handle}: {e}");
            }
         },
         None => warn!("Dropping packet for inactive link {handle}"),
      }
   }
}

// === Actor ===

struct BridgeActor {
   bridge: CommandBridge<SppTransport, FrameEncoder>,
   telemetry: Telemetry,
   events: EventSender,
   request_status: bool,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
}

impl BridgeActor {
   async fn run(mut self) {
      info!("Bridge manager starting up");

      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Bridge manager shutting down");
                  break;
               };
               self.handle_command(cmd);
            },
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd);
            },
         }
      }

      // Drop the link before the transport goes away.
      self.bridge.transport_mut().links.clear();
   }

   fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::ControlWrite(data) => {
            self.bridge.ingest_control_write(&data);
         },
         ManagerCommand::ConnectionTest => {
            self.bridge.request_connection_test();
         },
         ManagerCommand::LinkEstablished(handle, link) => {
            if self.bridge.transport_mut().links.establish(handle, link).is_err() {
               debug!("Discarding stale link {handle}");
               return;
            }
            self.bridge.on_transport_connected(handle);
            if self.request_status {
               self.bridge.transport_mut().send(handle, &status_request());
            }
         },
         ManagerCommand::LinkFailed(handle) => {
            if !self.bridge.transport_mut().links.fail(handle) {
               debug!("Ignoring failure of stale link {handle}");
               return;
            }
            self.bridge.on_transport_connect_failed();
         },
         ManagerCommand::LinkClosed(handle) => {
            if !self.bridge.transport_mut().links.close(handle) {
               debug!("Ignoring close of stale link {handle}");
               return;
            }
            self.bridge.on_transport_disconnected();
         },
         ManagerCommand::Inbound(handle, frame) => {
            if !self.bridge.transport().links.is_active(handle) {
               return;
            }
            self.handle_frame(&frame);
         },
      }
   }

   fn handle_frame(&mut self, frame: &Frame) {
      let msg = match parser::parse_frame(frame) {
         Ok(msg) => msg,
         Err(e) => {
            warn!("Failed to parse 0x{:02x} message: {e}", frame.msg_id);
            return;
         },
      };
      debug!("Received {msg:?}");

      let changes = self.telemetry.apply(&msg);
      if changes.battery {
         let [left, right] = self.telemetry.battery_bytes();
         info!("Battery: L={left} R={right}");
         self.events.emit(BridgeEvent::BatteryUpdated(self.telemetry));
      }
      if changes.status {
         debug!("Status: {}", self.telemetry.to_json());
         self.events.emit(BridgeEvent::StatusUpdated(self.telemetry));
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_target_from_default_config() {
      let target = LinkTarget::from_config(&Config::default()).unwrap();
      assert!(target.address.is_none());
      assert_eq!(target.patterns, ["galaxy buds", "buds3"]);
      assert_eq!(target.channel, None);
      assert_eq!(target.timeout, Duration::from_secs(10));
   }

   #[test]
   fn test_target_with_address() {
      let config = Config {
         device_address: Some("AA:BB:CC:DD:EE:FF".to_string()),
         spp_channel: Some(2),
         ..Default::default()
      };
      let target = LinkTarget::from_config(&config).unwrap();
      assert_eq!(
         target.address,
         Some(Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]))
      );
      assert_eq!(target.channel, Some(2));
   }

   #[test]
   fn test_links_ignore_stale_establish() {
      let mut links = LinkTracker::new();
      let first = links.begin_attempt();
      let second = links.begin_attempt();
      assert_ne!(first, second);

      assert_eq!(links.establish(first, "first"), Err("first"));
      assert!(!links.is_active(first));
      assert!(!links.fail(first));

      assert_eq!(links.establish(second, "second"), Ok(()));
      assert_eq!(links.link(second), Some(&"second"));
      assert!(links.attempt.is_none());
   }

   #[test]
   fn test_links_ignore_stale_close() {
      let mut links = LinkTracker::new();
      let handle = links.begin_attempt();

      // Nothing is active while the attempt is in flight.
      assert!(!links.close(handle));
      assert!(!links.close(LinkHandle(42)));

      links.establish(handle, ()).unwrap();
      assert!(!links.close(LinkHandle(42)));
      assert!(links.is_active(handle));

      assert!(links.close(handle));
      assert!(!links.close(handle));
      assert!(links.link(handle).is_none());
   }

   #[test]
   fn test_links_close_after_replacement() {
      let mut links = LinkTracker::new();
      let old = links.begin_attempt();
      links.establish(old, "old").unwrap();

      let new = links.begin_attempt();
      links.establish(new, "new").unwrap();

      assert!(!links.close(old));
      assert!(!links.is_active(old));
      assert_eq!(links.link(new), Some(&"new"));

      assert!(links.close(new));
      assert!(links.link(new).is_none());
   }

   #[test]
   fn test_links_failure_only_for_current_attempt() {
      let mut links = LinkTracker::<()>::new();
      let first = links.begin_attempt();
      let second = links.begin_attempt();

      assert!(!links.fail(first));
      assert!(links.fail(second));
      assert!(!links.fail(second));
      assert_eq!(links.establish(second, ()), Err(()));
   }

   #[test]
   fn test_target_rejects_bad_address() {
      let config = Config {
         device_address: Some("not-an-address".to_string()),
         ..Default::default()
      };
      assert!(matches!(
         LinkTarget::from_config(&config),
         Err(BridgeError::InvalidAddress(s)) if s == "not-an-address"
      ));
   }
}
