use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bluetooth::Transport;
use crate::device::equalizer::{EqBand, Preset, BAND_COUNT};
use crate::device::{DeviceState, StateError};
use crate::protocol::codec::{self, CodecError, DecodedMessage};
use crate::protocol::Frame;
use crate::session::{Reply, Session, SessionError};

/// Pause between the two halves of the named-preset procedure.
const PRESET_STEP_PAUSE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Whether the device answered. Both count as applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Acknowledged,
    NoResponse,
}

impl From<&Reply> for Delivery {
    fn from(reply: &Reply) -> Self {
        match reply {
            Reply::Acknowledged(_) => Delivery::Acknowledged,
            Reply::NoResponse => Delivery::NoResponse,
        }
    }
}

/// Domain commands the dispatcher knows how to run.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Switch the DSP preset only.
    SelectPreset(Preset),
    /// Full preset switch including the custom-EQ reset.
    ApplyPreset(Preset),
    SetCustomEq(Vec<EqBand>),
    SetAllGains([f32; BAND_COUNT]),
    SetBandGain { band: u8, gain_db: f32 },
    SetBandQ { band: u8, q: u8 },
    SetAllQ(u8),
    RequestDeviceInfo,
    /// Operator-supplied frame, sent as-is.
    Raw(Frame),
}

/// Runs domain commands through a session and records their effect.
///
/// Every operation validates first, then encodes, sends and settles, and
/// only then touches the device state. A failed operation leaves the state
/// as it was.
pub struct CommandDispatcher<'a, T: Transport> {
    session: &'a mut Session<T>,
}

impl<'a, T: Transport> CommandDispatcher<'a, T> {
    pub fn new(session: &'a mut Session<T>) -> Self {
        Self { session }
    }

    pub fn state(&self) -> &DeviceState {
        self.session.device()
    }

    pub async fn dispatch(&mut self, command: Command) -> Result<Delivery, DispatchError> {
        match command {
            Command::SelectPreset(preset) => self.set_preset(preset).await,
            Command::ApplyPreset(preset) => self.apply_named_preset(preset).await,
            Command::SetCustomEq(bands) => self.set_custom_eq(&bands).await,
            Command::SetAllGains(gains) => self.set_all_gains(&gains).await,
            Command::SetBandGain { band, gain_db } => self.set_band_gain(band, gain_db).await,
            Command::SetBandQ { band, q } => self.set_band_q(band, q).await,
            Command::SetAllQ(q) => self.set_all_q(q).await,
            Command::RequestDeviceInfo => self.request_device_info().await,
            Command::Raw(frame) => self.send_raw(&frame).await,
        }
    }

    pub async fn set_preset(&mut self, preset: Preset) -> Result<Delivery, DispatchError> {
        let reply = self.send_preset(preset).await?;
        self.session.device_mut().apply_preset(preset);
        info!("Preset {} selected", preset);
        Ok(Delivery::from(&reply))
    }

    /// Send a full 8-band set.
    pub async fn set_custom_eq(&mut self, bands: &[EqBand]) -> Result<Delivery, DispatchError> {
        let reply = self.send_custom_eq(bands).await?;
        self.session.device_mut().apply_custom_eq(bands)?;
        debug!("Custom EQ applied");
        Ok(Delivery::from(&reply))
    }

    async fn send_preset(&mut self, preset: Preset) -> Result<Reply, DispatchError> {
        let frame = codec::encode_select_preset(preset.id())?;
        Ok(self.session.send(&frame).await?)
    }

    /// Validate and send without touching the device state.
    async fn send_custom_eq(&mut self, bands: &[EqBand]) -> Result<Reply, DispatchError> {
        DeviceState::validate_bands(bands)?;
        for band in bands.iter().filter(|b| !b.is_nominal()) {
            warn!(
                "Band {} gain {:+.1} dB is outside the nominal range, sending clamped",
                band.index, band.gain_db
            );
        }

        let frame = codec::encode_custom_eq(bands)?;
        Ok(self.session.send(&frame).await?)
    }

    pub async fn set_all_gains(
        &mut self,
        gains: &[f32; BAND_COUNT],
    ) -> Result<Delivery, DispatchError> {
        let bands = self.state().with_gains(gains);
        self.set_custom_eq(&bands).await
    }

    pub async fn set_band_gain(&mut self, band: u8, gain_db: f32) -> Result<Delivery, DispatchError> {
        let bands = self.state().with_gain(band, gain_db)?;
        self.set_custom_eq(&bands).await
    }

    pub async fn set_band_q(&mut self, band: u8, q: u8) -> Result<Delivery, DispatchError> {
        let bands = self.state().with_q(band, q)?;
        self.set_custom_eq(&bands).await
    }

    pub async fn set_all_q(&mut self, q: u8) -> Result<Delivery, DispatchError> {
        let bands = self.state().with_all_q(q);
        self.set_custom_eq(&bands).await
    }

    /// Switch to a preset the way the device expects: studio is selected
    /// first and then given a zeroed custom EQ; every other preset needs the
    /// custom EQ cleared before the switch. The state changes only once
    /// both steps went out.
    pub async fn apply_named_preset(&mut self, preset: Preset) -> Result<Delivery, DispatchError> {
        let zeroed = self.state().zeroed();
        let (first, second) = if preset == Preset::Studio {
            let first = self.send_preset(preset).await?;
            tokio::time::sleep(PRESET_STEP_PAUSE).await;
            (first, self.send_custom_eq(&zeroed).await?)
        } else {
            let first = self.send_custom_eq(&zeroed).await?;
            tokio::time::sleep(PRESET_STEP_PAUSE).await;
            (first, self.send_preset(preset).await?)
        };

        let device = self.session.device_mut();
        device.apply_custom_eq(&zeroed)?;
        device.apply_preset(preset);
        info!("Preset {} applied", preset);

        Ok(match (Delivery::from(&first), Delivery::from(&second)) {
            (Delivery::Acknowledged, Delivery::Acknowledged) => Delivery::Acknowledged,
            _ => Delivery::NoResponse,
        })
    }

    /// Ask for battery and name. The stored info only changes when a
    /// device-info reply comes back.
    pub async fn request_device_info(&mut self) -> Result<Delivery, DispatchError> {
        let frame = codec::encode_device_info_request();
        let reply = self.session.send(&frame).await?;

        match &reply {
            Reply::Acknowledged(DecodedMessage::DeviceInfoNotify(body)) => {
                match codec::decode_device_info(body) {
                    Ok(info) => {
                        info!("Device: {}", info);
                        self.session.device_mut().apply_device_info(info);
                    }
                    Err(e) => warn!("Couldn't parse device info: {}", e),
                }
            }
            Reply::Acknowledged(other) => debug!("Device info request answered with {:?}", other),
            Reply::NoResponse => {}
        }
        Ok(Delivery::from(&reply))
    }

    /// Send a frame without interpreting it or touching device state.
    pub async fn send_raw(&mut self, frame: &Frame) -> Result<Delivery, DispatchError> {
        let reply = self.session.send(frame).await?;
        if let Reply::Acknowledged(message) = &reply {
            info!("Raw command reply: {:?}", message);
        }
        Ok(Delivery::from(&reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::{MockHandle, MockTransport, Reply as MockReply};
    use crate::device::EqMode;
    use crate::protocol::commands::{CMD_CUSTOM_EQ, CMD_SELECT_EQ};
    use crate::session::SessionTiming;
    use bluer::Address;

    async fn connected() -> (Session<MockTransport>, MockHandle) {
        let (transport, handle) = MockTransport::new();
        let mut session = Session::new(
            transport,
            Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
            SessionTiming::default(),
        );
        session.connect().await.unwrap();
        (session, handle)
    }

    fn written_commands(handle: &MockHandle) -> Vec<u8> {
        handle.written().iter().map(|bytes| bytes[3]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_preset_updates_mode() {
        let (mut session, handle) = connected().await;
        let mut dispatcher = CommandDispatcher::new(&mut session);

        let delivery = dispatcher.set_preset(Preset::Bass).await.unwrap();
        assert_eq!(delivery, Delivery::Acknowledged);
        assert_eq!(dispatcher.state().mode(), EqMode::Preset(Preset::Bass));
        assert_eq!(handle.written(), vec![b"QXW\x10\x01\x02\x01\x02".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_band_gain_sends_full_set() {
        let (mut session, handle) = connected().await;
        let mut dispatcher = CommandDispatcher::new(&mut session);

        dispatcher.set_band_gain(2, 3.0).await.unwrap();

        let written = handle.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0][5], 24);
        assert_eq!(&written[0][6 + 6..6 + 9], &[2, 150, 7]);
        assert_eq!(dispatcher.state().band(2).unwrap().gain_db, 3.0);
        assert_eq!(dispatcher.state().mode(), EqMode::Custom);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_gain_sent_clamped() {
        let (mut session, handle) = connected().await;
        let mut dispatcher = CommandDispatcher::new(&mut session);

        dispatcher.set_band_gain(0, 20.0).await.unwrap();
        assert_eq!(handle.written()[0][7], 255);
        assert_eq!(dispatcher.state().band(0).unwrap().gain_db, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_band_rejected_before_write() {
        let (mut session, handle) = connected().await;
        let mut dispatcher = CommandDispatcher::new(&mut session);

        assert!(matches!(
            dispatcher.set_band_gain(8, 1.0).await,
            Err(DispatchError::State(StateError::BandIndex(8)))
        ));
        assert!(matches!(
            dispatcher.set_band_q(9, 10).await,
            Err(DispatchError::State(StateError::BandIndex(9)))
        ));
        assert!(matches!(
            dispatcher.set_custom_eq(&[EqBand::new(0, 1.0, 7)]).await,
            Err(DispatchError::State(StateError::BandCount(1)))
        ));
        assert!(handle.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_leaves_state_untouched() {
        let (mut session, handle) = connected().await;
        handle.fail_write(true);
        let mut dispatcher = CommandDispatcher::new(&mut session);

        assert!(dispatcher.set_all_gains(&[5.0; BAND_COUNT]).await.is_err());
        assert_eq!(dispatcher.state().mode(), EqMode::Unknown);
        assert!(dispatcher.state().bands().iter().all(|b| b.gain_db == 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_response_still_applies() {
        let (mut session, handle) = connected().await;
        handle.push_reply(MockReply::Silent);
        let mut dispatcher = CommandDispatcher::new(&mut session);

        let delivery = dispatcher.set_all_q(30).await.unwrap();
        assert_eq!(delivery, Delivery::NoResponse);
        assert!(dispatcher.state().bands().iter().all(|b| b.q == 30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_studio_switches_then_zeroes() {
        let (mut session, handle) = connected().await;
        let mut dispatcher = CommandDispatcher::new(&mut session);
        dispatcher.set_all_gains(&[2.0; BAND_COUNT]).await.unwrap();

        dispatcher.apply_named_preset(Preset::Studio).await.unwrap();

        assert_eq!(
            written_commands(&handle),
            vec![CMD_CUSTOM_EQ, CMD_SELECT_EQ, CMD_CUSTOM_EQ]
        );
        assert_eq!(handle.written()[1][7], 4);
        assert_eq!(dispatcher.state().mode(), EqMode::Preset(Preset::Studio));
        assert!(dispatcher.state().bands().iter().all(|b| b.gain_db == 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_presets_clear_then_switch() {
        let (mut session, handle) = connected().await;
        let mut dispatcher = CommandDispatcher::new(&mut session);

        dispatcher
            .dispatch(Command::ApplyPreset(Preset::Main))
            .await
            .unwrap();

        assert_eq!(written_commands(&handle), vec![CMD_CUSTOM_EQ, CMD_SELECT_EQ]);
        let zeroed = &handle.written()[0];
        assert!(zeroed[6..].chunks(3).all(|band| band[1] == 120));
        assert_eq!(dispatcher.state().mode(), EqMode::Preset(Preset::Main));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_second_step_keeps_state() {
        let (mut session, handle) = connected().await;
        let mut dispatcher = CommandDispatcher::new(&mut session);
        dispatcher.set_band_gain(2, 3.0).await.unwrap();

        handle.fail_writes_after(2);
        assert!(dispatcher.apply_named_preset(Preset::Bass).await.is_err());

        assert_eq!(written_commands(&handle), vec![CMD_CUSTOM_EQ, CMD_CUSTOM_EQ]);
        assert_eq!(dispatcher.state().mode(), EqMode::Custom);
        assert_eq!(dispatcher.state().band(2).unwrap().gain_db, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_studio_zeroing_keeps_state() {
        let (mut session, handle) = connected().await;
        let mut dispatcher = CommandDispatcher::new(&mut session);
        dispatcher.set_all_gains(&[2.0; BAND_COUNT]).await.unwrap();
        dispatcher.set_preset(Preset::Main).await.unwrap();

        handle.fail_writes_after(3);
        assert!(dispatcher.apply_named_preset(Preset::Studio).await.is_err());

        assert_eq!(handle.written().len(), 3);
        assert_eq!(dispatcher.state().mode(), EqMode::Preset(Preset::Main));
        assert!(dispatcher.state().bands().iter().all(|b| b.gain_db == 2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_gain_sent_clamped() {
        let (mut session, handle) = connected().await;
        let mut dispatcher = CommandDispatcher::new(&mut session);

        dispatcher.set_band_gain(0, 1e9).await.unwrap();
        dispatcher.set_band_gain(1, f32::INFINITY).await.unwrap();
        dispatcher.set_band_gain(2, -1e9).await.unwrap();

        let last = handle.written().pop().unwrap();
        assert_eq!(&last[6..15], &[0, 255, 7, 1, 255, 7, 2, 0, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_info_reply_is_stored() {
        let (mut session, handle) = connected().await;
        let mut reply = b"QXW\x27\x02".to_vec();
        reply.extend_from_slice(&[0x01, 0x03, 0x64, 0x64, 0x00, 0x04]);
        reply.extend_from_slice(b"Buds");
        handle.push_reply(MockReply::Bytes(reply));

        let mut dispatcher = CommandDispatcher::new(&mut session);
        let delivery = dispatcher.dispatch(Command::RequestDeviceInfo).await.unwrap();

        assert_eq!(delivery, Delivery::Acknowledged);
        let info = dispatcher.state().info().unwrap();
        assert_eq!(info.battery_left, 100);
        assert_eq!(info.battery_right, 100);
        assert_eq!(info.name, "Buds");
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_info_without_reply_keeps_previous() {
        let (mut session, handle) = connected().await;
        handle.push_reply(MockReply::Silent);
        let mut dispatcher = CommandDispatcher::new(&mut session);

        let delivery = dispatcher.request_device_info().await.unwrap();
        assert_eq!(delivery, Delivery::NoResponse);
        assert!(dispatcher.state().info().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_frame_sent_verbatim() {
        let (mut session, handle) = connected().await;
        let frame = Frame::from_bytes(b"QXW\x30\x01\x01\x05").unwrap();
        let mut dispatcher = CommandDispatcher::new(&mut session);

        dispatcher.dispatch(Command::Raw(frame)).await.unwrap();
        assert_eq!(handle.written(), vec![b"QXW\x30\x01\x01\x05".to_vec()]);
        assert_eq!(dispatcher.state().mode(), EqMode::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_surfaces_as_session_error() {
        let (mut session, handle) = connected().await;
        let mut monitor = session.link_monitor();
        handle.lose_link();
        monitor.wait_for(|lost| *lost).await.unwrap();

        let mut dispatcher = CommandDispatcher::new(&mut session);
        assert!(matches!(
            dispatcher.set_preset(Preset::Flat).await,
            Err(DispatchError::Session(SessionError::Disconnected))
        ));
        assert!(handle.written().is_empty());
    }
}
