//! RFCOMM (SPP) link to the earbuds.
//!
//! The socket is split into a reader task that reassembles protocol frames
//! and a writer task fed through a bounded queue, so callers can post packets
//! without waiting on the radio.

use std::time::Duration;

use bluer::{
   Address, Session,
   rfcomm::{Profile, ProfileHandle, Role, SocketAddr, Stream},
};
use futures::StreamExt;
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
   sync::mpsc,
   task::JoinSet,
   time,
};
use uuid::Uuid;

use crate::{
   buds::parser::{Frame, FrameDecoder},
   error::{BridgeError, Result},
};

pub type Packet = SmallVec<[u8; 32]>;

/// Serial port service exposed by Galaxy Buds.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x2e73a4ad_332d_41fc_90e2_16bef06523f2);

const READ_BUF: usize = 1024;
const QUEUE_DEPTH: usize = 32;

/// Receiver half of an SPP link. Yields validated frames.
#[derive(Debug)]
pub struct SppReceiver {
   rx: mpsc::Receiver<Frame>,
}

impl SppReceiver {
   pub async fn recv(&mut self) -> Result<Frame> {
      self.rx.recv().await.ok_or(BridgeError::ConnectionClosed)
   }
}

/// Sender half of an SPP link.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct SppSender {
   tx: mpsc::Sender<Packet>,
}

impl SppSender {
   /// Queues a packet for the writer task without waiting.
   pub fn post(&self, data: &[u8]) -> Result<()> {
      self.tx.try_send(Packet::from_slice(data)).map_err(|e| match e {
         mpsc::error::TrySendError::Full(_) => BridgeError::RequestTimeout,
         mpsc::error::TrySendError::Closed(_) => BridgeError::ConnectionClosed,
      })
   }
}

/// Opens an SPP link to `address`.
///
/// With a known `channel` the socket connects directly. Otherwise a client
/// profile for [`SPP_UUID`] is registered and BlueZ resolves the channel
/// through SDP.
pub async fn connect(
   jset: &mut JoinSet<()>,
   session: &Session,
   address: Address,
   channel: Option<u8>,
   timeout: Duration,
) -> Result<(SppReceiver, SppSender)> {
   let (stream, profile) = match channel {
      Some(channel) => {
         debug!("Connecting to {address} on RFCOMM channel {channel}");
         let stream = time::timeout(timeout, Stream::connect(SocketAddr::new(address, channel)))
            .await
            .map_err(|_| BridgeError::RequestTimeout)??;
         (stream, None)
      },
      None => {
         debug!("Connecting to {address} via SPP profile");
         let (stream, profile) = time::timeout(timeout, connect_profile(session, address))
            .await
            .map_err(|_| BridgeError::RequestTimeout)??;
         (stream, Some(profile))
      },
   };

   let (reader, writer) = tokio::io::split(stream);
   let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
   let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);

   jset.spawn(recv_thread(address, in_tx, reader));
   jset.spawn(send_thread(address, out_rx, writer, profile));

   Ok((SppReceiver { rx: in_rx }, SppSender { tx: out_tx }))
}

async fn connect_profile(session: &Session, address: Address) -> Result<(Stream, ProfileHandle)> {
   let mut profile = session
      .register_profile(Profile {
         uuid: SPP_UUID,
         role: Some(Role::Client),
         require_authentication: Some(false),
         require_authorization: Some(false),
         auto_connect: Some(false),
         ..Default::default()
      })
      .await?;

   let device = session.default_adapter().await?.device(address)?;
   let connect = device.connect_profile(&SPP_UUID);
   tokio::pin!(connect);
   let mut connected = false;

   loop {
      tokio::select! {
         res = &mut connect, if !connected => {
            res?;
            connected = true;
         },
         req = profile.next() => {
            let Some(req) = req else {
               return Err(BridgeError::ConnectionClosed);
            };
            if req.device() != address {
               debug!("Rejecting SPP connection from {}", req.device());
               continue;
            }
            let stream = req.accept()?;
            return Ok((stream, profile));
         },
      }
   }
}

async fn recv_thread(adr: Address, tx: mpsc::Sender<Frame>, mut reader: ReadHalf<Stream>) {
   let mut decoder = FrameDecoder::new();
   let mut stack = [0u8; READ_BUF];
   loop {
      let n = match reader.read(&mut stack).await {
         Ok(0) => {
            warn!("Connection lost");
            return;
         },
         Ok(n) => n,
         Err(e) => {
            warn!("Read failed: {e}");
            return;
         },
      };
      let recvd = &stack[..n];
      debug!("← {adr}: {}", hex::encode(recvd));
      decoder.push(recvd);

      while let Some(frame) = decoder.decode() {
         match frame {
            Ok(frame) => {
               if let Err(e) = tx.send(frame).await {
                  warn!("Failed to forward frame: {e:?}");
                  return;
               }
            },
            Err(e) => warn!("Dropping malformed frame: {e}"),
         }
      }
   }
}

async fn send_thread(
   adr: Address,
   mut rx: mpsc::Receiver<Packet>,
   mut writer: WriteHalf<Stream>,
   _profile: Option<ProfileHandle>,
) {
   while let Some(data) = rx.recv().await {
      debug!("→ {adr}: {}", hex::encode(&data));
      if let Err(e) = writer.write_all(&data).await {
         warn!("Failed to send data: {e}");
         return;
      }
   }
   let _ = writer.shutdown().await;
   debug!("Writer for {adr} shut down");
}
