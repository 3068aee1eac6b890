use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, Service};
use bluer::{Address, Device, DeviceEvent, DeviceProperty, Uuid};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Transport, TransportError, TransportEvent};

/// How long to wait for BlueZ to finish GATT service discovery.
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// GATT layout of the earbuds' control service.
#[derive(Debug, Clone, Copy)]
pub struct GattUuids {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

/// BLE GATT transport over BlueZ.
pub struct GattTransport {
    uuids: GattUuids,
    session: Option<bluer::Session>,
    device: Option<Device>,
    write_char: Option<Characteristic>,
    notify_char: Option<Characteristic>,
    event_task: Option<JoinHandle<()>>,
}

impl GattTransport {
    pub fn new(uuids: GattUuids) -> Self {
        Self {
            uuids,
            session: None,
            device: None,
            write_char: None,
            notify_char: None,
            event_task: None,
        }
    }

    async fn find_service(&self, device: &Device) -> Result<Service, TransportError> {
        let deadline = tokio::time::Instant::now() + SERVICES_RESOLVE_TIMEOUT;
        while !device.is_services_resolved().await? {
            if tokio::time::Instant::now() >= deadline {
                warn!("GATT services not resolved after {:?}", SERVICES_RESOLVE_TIMEOUT);
                break;
            }
            tokio::time::sleep(SERVICES_POLL_INTERVAL).await;
        }

        for service in device.services().await? {
            let uuid = service.uuid().await?;
            debug!("Service: {}", uuid);
            if uuid == self.uuids.service {
                return Ok(service);
            }
        }
        Err(TransportError::MissingService(self.uuids.service))
    }

    async fn find_characteristic(
        service: &Service,
        uuid: Uuid,
    ) -> Result<Characteristic, TransportError> {
        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == uuid {
                return Ok(characteristic);
            }
        }
        Err(TransportError::MissingCharacteristic(uuid))
    }

    fn stop_event_task(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for GattTransport {
    async fn connect(&mut self, address: Address) -> Result<(), TransportError> {
        info!("Connecting to {} via BLE", address);

        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        let device = adapter.device(address)?;
        if !device.is_connected().await? {
            device.connect().await?;
        }

        let service = self.find_service(&device).await?;
        let write_char = Self::find_characteristic(&service, self.uuids.write).await?;
        let notify_char = Self::find_characteristic(&service, self.uuids.notify).await?;

        info!(
            "Found service {} (write {}, notify {})",
            self.uuids.service, self.uuids.write, self.uuids.notify
        );

        self.session = Some(session);
        self.device = Some(device);
        self.write_char = Some(write_char);
        self.notify_char = Some(notify_char);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let device = self.device.clone().ok_or(TransportError::NotConnected)?;
        let notify_char = self
            .notify_char
            .clone()
            .ok_or(TransportError::MissingCharacteristic(self.uuids.notify))?;

        let notifications = notify_char.notify().await?;
        let device_events = device.events().await?;

        let (tx, rx) = mpsc::channel(32);
        self.stop_event_task();
        self.event_task = Some(tokio::spawn(forward_events(notifications, device_events, tx)));

        info!("Subscribed to notifications");
        Ok(rx)
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        // Dropping the notify stream stops notifications in BlueZ.
        self.stop_event_task();
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let write_char = self.write_char.as_ref().ok_or(TransportError::NotConnected)?;
        write_char.write(data).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_event_task();
        self.write_char = None;
        self.notify_char = None;
        self.session = None;
        if let Some(device) = self.device.take() {
            if device.is_connected().await.unwrap_or(false) {
                device.disconnect().await?;
            }
        }
        Ok(())
    }
}

/// Merge notify data and device property changes into one event stream.
/// Ends after the first `LinkLost` or when the receiver is dropped.
async fn forward_events(
    notifications: impl Stream<Item = Vec<u8>>,
    device_events: impl Stream<Item = DeviceEvent>,
    tx: mpsc::Sender<TransportEvent>,
) {
    tokio::pin!(notifications);
    tokio::pin!(device_events);

    loop {
        let event = tokio::select! {
            data = notifications.next() => match data {
                Some(data) => TransportEvent::Notification(data),
                None => {
                    warn!("Notification stream ended");
                    TransportEvent::LinkLost
                }
            },
            event = device_events.next() => match event {
                Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) => {
                    warn!("Device reported disconnect");
                    TransportEvent::LinkLost
                }
                Some(_) => continue,
                None => {
                    warn!("Device event stream ended");
                    TransportEvent::LinkLost
                }
            },
        };

        let lost = event == TransportEvent::LinkLost;
        if tx.send(event).await.is_err() || lost {
            return;
        }
    }
}
