//! Galaxy Buds bridge daemon.
//!
//! Exposes a BLE GATT control service and forwards its writes to Galaxy Buds
//! over RFCOMM/SPP, bringing the earbuds link up on demand.

use std::{sync::Arc, time::Duration};

use bluer::Session;
use crossbeam::queue::SegQueue;
use log::info;
use tokio::{signal, sync::Notify, time};

use bluetooth::manager::BridgeManager;
use event::{BridgeEvent, EventBus};
use gatt::GattServer;

mod bluetooth;
mod bridge;
mod buds;
mod config;
mod error;
mod event;
mod gatt;

use crate::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting Galaxy Buds bridge...");

   // Load configuration
   let config = config::Config::load()?;
   match &config.device_address {
      Some(address) => info!("Loaded configuration for {address}"),
      None => info!(
         "Loaded configuration, matching paired devices by {:?}",
         config.device_name_patterns
      ),
   }

   let session = Session::new().await?;
   let adapter = session.default_adapter().await?;
   info!("Using Bluetooth adapter: {}", adapter.name());

   // Create event channel
   let event_bus = EventProcessor::new();

   // Create the bridge actor with event sender and config
   let manager = BridgeManager::new(session.clone(), event_bus.clone(), &config)?;

   // Expose it over GATT
   let server = GattServer::start(&adapter, manager, &config).await?;
   info!("Bridge service started");

   // Start event processor
   event_bus.spawn_dispatcher(Arc::new(server));

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down bridge...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<BridgeEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<BridgeEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   fn spawn_dispatcher(self: Arc<Self>, server: Arc<GattServer>) {
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            server.publish(&event);
         }
      });
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: BridgeEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
