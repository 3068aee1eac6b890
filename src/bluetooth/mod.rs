pub mod gatt;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use bluer::{Address, Uuid};
use thiserror::Error;
use tokio::sync::mpsc;

/// Something the link layer tells the session, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw bytes from the notify characteristic.
    Notification(Vec<u8>),
    /// The link went away. Nothing follows it.
    LinkLost,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Bluetooth error: {source}")]
    Bluetooth {
        #[from]
        source: bluer::Error,
    },

    #[error("Service {0} not found on device")]
    MissingService(Uuid),

    #[error("Characteristic {0} not found")]
    MissingCharacteristic(Uuid),

    #[error("Not connected")]
    NotConnected,
}

/// Link-layer operations the session needs.
///
/// `write` is fire-and-forget: success means the bytes left, not that the
/// device acted on them. Link loss is reported through the receiver handed
/// out by `subscribe`.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, address: Address) -> Result<(), TransportError>;

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    async fn unsubscribe(&mut self) -> Result<(), TransportError>;

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
