//! One logical connection to the earbuds.
//!
//! The protocol has no request/response correlation, so the session keeps at
//! most one command in flight and treats whatever notification arrives next
//! as its reply. Notifications land in a single-slot mailbox that is cleared
//! on every send; the settling delay after each command gives late replies
//! time to arrive and be discarded before the next one goes out.

use std::time::Duration;

use bluer::Address;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bluetooth::{Transport, TransportError, TransportEvent};
use crate::device::DeviceState;
use crate::protocol::codec::{decode, DecodedMessage};
use crate::protocol::{hex, Frame};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("A command is still waiting for its reply")]
    Busy,

    #[error("Link lost; reconnect to continue")]
    Disconnected,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Timing knobs. Defaults match the device's observed behavior.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    /// How long to wait for a reply before giving up softly.
    pub response_timeout: Duration,
    /// Pause after each command for the DSP to apply it.
    pub settle_delay: Duration,
    /// Pause between unsubscribing and closing the link.
    pub unsubscribe_grace: Duration,
    /// Pause after closing the link.
    pub close_grace: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(300),
            unsubscribe_grace: Duration::from_millis(300),
            close_grace: Duration::from_millis(500),
        }
    }
}

/// Connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Ready,
    AwaitingAck { sent: Frame, deadline: Instant },
    /// Terminal; build a new session to continue.
    Disconnected,
}

/// How a sent command resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Acknowledged(DecodedMessage),
    /// The deadline passed without a notification. The device often skips
    /// replies, so this is not a failure.
    NoResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectIntent {
    /// End in `Disconnected`.
    Close,
    /// End in `Idle` so `connect` can be called again.
    Reconnect,
}

/// Aborts the notification pump when dropped.
struct PumpTask(JoinHandle<()>);

impl Drop for PumpTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum WaitOutcome {
    Notification(Vec<u8>),
    Timeout,
    LinkLost,
}

pub struct Session<T: Transport> {
    transport: T,
    address: Address,
    timing: SessionTiming,
    state: SessionState,
    device: DeviceState,
    mailbox: watch::Receiver<Option<Vec<u8>>>,
    link_lost: watch::Receiver<bool>,
    pump: Option<PumpTask>,
    settled_at: Option<Instant>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, address: Address, timing: SessionTiming) -> Self {
        Self {
            transport,
            address,
            timing,
            state: SessionState::Idle,
            device: DeviceState::new(),
            mailbox: watch::channel(None).1,
            link_lost: watch::channel(false).1,
            pump: None,
            settled_at: None,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn device(&self) -> &DeviceState {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut DeviceState {
        &mut self.device
    }

    /// Current state, with link loss reflected even if no command has run
    /// since it happened.
    pub fn state(&self) -> SessionState {
        match self.state {
            SessionState::Ready | SessionState::AwaitingAck { .. } if self.link_is_lost() => {
                SessionState::Disconnected
            }
            ref state => state.clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// A receiver that flips to `true` when the link is lost.
    pub fn link_monitor(&self) -> watch::Receiver<bool> {
        self.link_lost.clone()
    }

    /// Give back the transport so a fresh session can be built on it.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// `Idle -> Ready`. On failure the session stays `Idle`.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Disconnected => return Err(SessionError::Disconnected),
            _ => return Err(SessionError::AlreadyConnected),
        }

        self.transport.connect(self.address).await?;

        let (mailbox_tx, mailbox_rx) = watch::channel(None);
        let (lost_tx, lost_rx) = watch::channel(false);
        match self.transport.subscribe().await {
            Ok(events) => {
                let task = tokio::spawn(pump_events(events, mailbox_tx, lost_tx));
                self.pump = Some(PumpTask(task));
            }
            Err(e) => warn!("Failed to subscribe to notifications, replies will time out: {}", e),
        }

        self.mailbox = mailbox_rx;
        self.link_lost = lost_rx;
        self.settled_at = None;
        self.state = SessionState::Ready;
        info!("Connected to {}", self.address);
        Ok(())
    }

    /// Write a frame and wait for its reply (or the deadline), then settle.
    pub async fn send(&mut self, frame: &Frame) -> Result<Reply, SessionError> {
        self.check_ready()?;
        self.settle().await?;

        // Anything already in the slot belongs to an earlier command.
        self.mailbox.borrow_and_update();

        let bytes = frame.to_bytes();
        let deadline = Instant::now() + self.timing.response_timeout;
        self.state = SessionState::AwaitingAck {
            sent: frame.clone(),
            deadline,
        };

        debug!("TX: {}", hex(&bytes));
        if let Err(e) = self.transport.write(&bytes).await {
            self.state = SessionState::Ready;
            return Err(e.into());
        }

        let outcome = tokio::select! {
            biased;
            _ = wait_link_lost(&mut self.link_lost) => WaitOutcome::LinkLost,
            data = next_notification(&mut self.mailbox) => WaitOutcome::Notification(data),
            _ = tokio::time::sleep_until(deadline) => WaitOutcome::Timeout,
        };

        let reply = match outcome {
            WaitOutcome::Notification(data) => Reply::Acknowledged(decode(&data)),
            WaitOutcome::Timeout => {
                warn!("No response within {:?}", self.timing.response_timeout);
                Reply::NoResponse
            }
            WaitOutcome::LinkLost => {
                self.state = SessionState::Disconnected;
                return Err(SessionError::Disconnected);
            }
        };

        self.state = SessionState::Ready;
        self.settled_at = Some(Instant::now() + self.timing.settle_delay);
        self.settle().await?;
        Ok(reply)
    }

    /// Stop notifications, close the link, and leave the session in the
    /// state `intent` asks for. Teardown errors are logged only.
    pub async fn disconnect(&mut self, intent: DisconnectIntent) {
        if self.state == SessionState::Idle {
            return;
        }

        info!("Closing link to {}", self.address);
        self.pump = None;

        if let Err(e) = self.transport.unsubscribe().await {
            warn!("Stop notify failed: {}", e);
        }
        tokio::time::sleep(self.timing.unsubscribe_grace).await;

        if let Err(e) = self.transport.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
        tokio::time::sleep(self.timing.close_grace).await;

        self.mailbox = watch::channel(None).1;
        self.link_lost = watch::channel(false).1;
        self.settled_at = None;
        self.state = match intent {
            DisconnectIntent::Close => SessionState::Disconnected,
            DisconnectIntent::Reconnect => SessionState::Idle,
        };
        info!("Disconnected");
    }

    fn link_is_lost(&self) -> bool {
        *self.link_lost.borrow()
    }

    fn check_ready(&mut self) -> Result<(), SessionError> {
        if self.link_is_lost() && self.state != SessionState::Idle {
            self.state = SessionState::Disconnected;
        }

        if let SessionState::AwaitingAck { deadline, .. } = self.state {
            if Instant::now() < deadline {
                return Err(SessionError::Busy);
            }
            warn!("Abandoned command passed its deadline without a reply");
            self.state = SessionState::Ready;
            self.settled_at = Some(deadline + self.timing.settle_delay);
        }

        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Idle => Err(SessionError::NotConnected),
            SessionState::Disconnected => Err(SessionError::Disconnected),
            SessionState::AwaitingAck { .. } => Err(SessionError::Busy),
        }
    }

    /// Sleep out the remaining settling delay, cut short by link loss.
    /// The deadline is only cleared once it has passed, so a dropped
    /// `send` leaves it for the next one.
    async fn settle(&mut self) -> Result<(), SessionError> {
        let Some(until) = self.settled_at else {
            return Ok(());
        };

        let lost = tokio::select! {
            biased;
            _ = wait_link_lost(&mut self.link_lost) => true,
            _ = tokio::time::sleep_until(until) => false,
        };

        if lost {
            self.state = SessionState::Disconnected;
            return Err(SessionError::Disconnected);
        }
        self.settled_at = None;
        Ok(())
    }
}

/// Move transport events into the mailbox and link-lost flag.
async fn pump_events(
    mut events: mpsc::Receiver<TransportEvent>,
    mailbox: watch::Sender<Option<Vec<u8>>>,
    link_lost: watch::Sender<bool>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Notification(data) => {
                log_notification(&data);
                mailbox.send_replace(Some(data));
            }
            TransportEvent::LinkLost => break,
        }
    }
    warn!("BLE link lost");
    link_lost.send_replace(true);
}

fn log_notification(data: &[u8]) {
    match decode(data) {
        DecodedMessage::PresetAck { preset } => debug!("RX preset ack {:?}", preset),
        DecodedMessage::CustomEqAck => debug!("RX custom EQ ack"),
        DecodedMessage::DeviceInfoNotify(_) => debug!("RX device info: {}", hex(data)),
        DecodedMessage::UnknownCommand(cmd, _) => {
            debug!("RX unknown command 0x{:02X}: {}", cmd, hex(data))
        }
        DecodedMessage::Unrecognized(_) => debug!("RX non-QXW data: {}", hex(data)),
    }
}

/// Resolve with the next notification put in the slot. Never resolves once
/// the pump is gone.
async fn next_notification(mailbox: &mut watch::Receiver<Option<Vec<u8>>>) -> Vec<u8> {
    loop {
        if mailbox.changed().await.is_err() {
            return std::future::pending().await;
        }
        if let Some(data) = mailbox.borrow_and_update().clone() {
            return data;
        }
    }
}

/// Resolve once the link-lost flag is set. Never resolves if it can't be.
async fn wait_link_lost(link_lost: &mut watch::Receiver<bool>) {
    if link_lost.wait_for(|lost| *lost).await.is_err() {
        std::future::pending::<()>().await;
    }
}
