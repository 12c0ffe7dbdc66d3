//! BLE GATT control service.
//!
//! Exposes the bridge to BLE centrals: writes go to the [`BridgeManager`],
//! bridge events come back as characteristic values and notifications.

use bluer::{
   Adapter,
   adv::{Advertisement, AdvertisementHandle},
   gatt::local::{
      Application, ApplicationHandle, Characteristic, CharacteristicNotifier,
      CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead,
      CharacteristicReadRequest, CharacteristicWrite, CharacteristicWriteMethod,
      CharacteristicWriteRequest, ReqError, Service,
   },
};
use log::{debug, info, warn};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
   bluetooth::manager::BridgeManager,
   bridge::ConnectionTestResult,
   buds::telemetry::Telemetry,
   config::Config,
   error::Result,
   event::BridgeEvent,
};

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef0);
pub const NOISE_CONTROL_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef1);
pub const BATTERY_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef2);
pub const STATUS_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef3);
pub const COMMAND_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef4);

/// Command characteristic opcode requesting a connection test.
pub const CMD_TEST_CONNECTION: u8 = 0x01;

/// Characteristic a bridge event updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
   Battery,
   Status,
   Command,
}

fn route(event: &BridgeEvent) -> (Slot, Vec<u8>) {
   match event {
      BridgeEvent::BatteryUpdated(t) => (Slot::Battery, t.battery_bytes().to_vec()),
      BridgeEvent::StatusUpdated(t) => (Slot::Status, t.status_bytes().to_vec()),
      BridgeEvent::ConnectionTest(r) => (Slot::Command, vec![r.as_byte()]),
   }
}

/// A running GATT application and its advertisement.
pub struct GattServer {
   battery: watch::Sender<Vec<u8>>,
   status: watch::Sender<Vec<u8>>,
   command: watch::Sender<Vec<u8>>,
   _app: ApplicationHandle,
   _adv: AdvertisementHandle,
}

impl GattServer {
   /// Registers the control service on `adapter` and starts advertising.
   pub async fn start(adapter: &Adapter, manager: BridgeManager, config: &Config) -> Result<Self> {
      if !adapter.is_powered().await? {
         info!("Powering on adapter {}", adapter.name());
         adapter.set_powered(true).await?;
      }

      let initial = Telemetry::new();
      let (battery, battery_rx) = watch::channel(initial.battery_bytes().to_vec());
      let (status, status_rx) = watch::channel(initial.status_bytes().to_vec());
      let (command, command_rx) = watch::channel(vec![ConnectionTestResult::Failed.as_byte()]);

      let noise_char = {
         let manager = manager.clone();
         Characteristic {
            uuid: NOISE_CONTROL_UUID,
            write: Some(CharacteristicWrite {
               write: true,
               write_without_response: true,
               method: CharacteristicWriteMethod::Fun(Box::new(
                  move |data: Vec<u8>, _req: CharacteristicWriteRequest| {
                     let manager = manager.clone();
                     Box::pin(async move {
                        debug!("Noise control write: {}", hex::encode(&data));
                        manager.control_write(&data).await.map_err(|e| {
                           warn!("Failed to forward control write: {e}");
                           ReqError::Failed
                        })
                     })
                  },
               )),
               ..Default::default()
            }),
            ..Default::default()
         }
      };

      let command_char = {
         let mut c = value_characteristic(COMMAND_UUID, command_rx);
         c.write = Some(CharacteristicWrite {
            write: true,
            write_without_response: true,
            method: CharacteristicWriteMethod::Fun(Box::new(
               move |data: Vec<u8>, _req: CharacteristicWriteRequest| {
                  let manager = manager.clone();
                  Box::pin(async move {
                     match data.first() {
                        Some(&CMD_TEST_CONNECTION) => {
                           manager.connection_test().await.map_err(|e| {
                              warn!("Failed to start connection test: {e}");
                              ReqError::Failed
                           })
                        },
                        Some(op) => {
                           debug!("Ignoring unknown command 0x{op:02x}");
                           Ok(())
                        },
                        None => {
                           debug!("Ignoring empty command write");
                           Ok(())
                        },
                     }
                  })
               },
            )),
            ..Default::default()
         });
         c
      };

      let app = Application {
         services: vec![Service {
            uuid: SERVICE_UUID,
            primary: true,
            characteristics: vec![
               noise_char,
               value_characteristic(BATTERY_UUID, battery_rx),
               value_characteristic(STATUS_UUID, status_rx),
               command_char,
            ],
            ..Default::default()
         }],
         ..Default::default()
      };
      let app = adapter.serve_gatt_application(app).await?;
      info!("GATT service {SERVICE_UUID} registered");

      let adv = adapter
         .advertise(Advertisement {
            service_uuids: [SERVICE_UUID].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(config.advertised_name.clone()),
            ..Default::default()
         })
         .await?;
      info!("Advertising as {}", config.advertised_name);

      Ok(Self {
         battery,
         status,
         command,
         _app: app,
         _adv: adv,
      })
   }

   /// Updates the characteristic an event maps to and notifies subscribers.
   pub fn publish(&self, event: &BridgeEvent) {
      let (slot, value) = route(event);
      debug!("{slot:?} ← {}", hex::encode(&value));
      let tx = match slot {
         Slot::Battery => &self.battery,
         Slot::Status => &self.status,
         Slot::Command => &self.command,
      };
      tx.send_replace(value);
   }
}

/// Read + notify characteristic backed by a watch channel.
fn value_characteristic(uuid: Uuid, rx: watch::Receiver<Vec<u8>>) -> Characteristic {
   let read_rx = rx.clone();
   Characteristic {
      uuid,
      read: Some(CharacteristicRead {
         read: true,
         fun: Box::new(move |_req: CharacteristicReadRequest| {
            let value = read_rx.borrow().clone();
            Box::pin(async move { Ok(value) })
         }),
         ..Default::default()
      }),
      notify: Some(CharacteristicNotify {
         notify: true,
         method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
            Box::pin(notify_loop(uuid, rx.clone(), notifier))
         })),
         ..Default::default()
      }),
      ..Default::default()
   }
}

async fn notify_loop(
   uuid: Uuid,
   mut rx: watch::Receiver<Vec<u8>>,
   mut notifier: CharacteristicNotifier,
) {
   debug!("Notifications for {uuid} started");
   rx.borrow_and_update();
   while rx.changed().await.is_ok() {
      let value = rx.borrow_and_update().clone();
      if let Err(e) = notifier.notify(value).await {
         debug!("Notifications for {uuid} stopped: {e}");
         return;
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::buds::parser::{ExtendedStatus, Inbound};

   #[test]
   fn test_route_telemetry() {
      let mut t = Telemetry::new();
      t.apply(&Inbound::ExtendedStatus(ExtendedStatus {
         battery_left: 90,
         battery_right: 80,
         wearing: true,
         noise_control: 0,
      }));

      assert_eq!(route(&BridgeEvent::BatteryUpdated(t)), (Slot::Battery, vec![90, 80]));
      assert_eq!(route(&BridgeEvent::StatusUpdated(t)), (Slot::Status, vec![1, 0, 0xFF]));
   }

   #[test]
   fn test_route_connection_test() {
      assert_eq!(
         route(&BridgeEvent::ConnectionTest(ConnectionTestResult::Succeeded)),
         (Slot::Command, vec![0x01])
      );
      assert_eq!(
         route(&BridgeEvent::ConnectionTest(ConnectionTestResult::Failed)),
         (Slot::Command, vec![0x00])
      );
   }

   #[test]
   fn test_uuids() {
      assert_eq!(SERVICE_UUID.to_string(), "12345678-1234-5678-1234-56789abcdef0");
      assert_eq!(COMMAND_UUID.to_string(), "12345678-1234-5678-1234-56789abcdef4");
   }
}
