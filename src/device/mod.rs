pub mod equalizer;
pub mod info;

use thiserror::Error;

use equalizer::{EqBand, Preset, BAND_COUNT, DEFAULT_Q};
use info::DeviceInfo;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Expected 8 bands, got {0}")]
    BandCount(usize),

    #[error("Invalid band {0} (must be 0-7)")]
    BandIndex(u8),

    #[error("Band {0} given more than once")]
    DuplicateBand(u8),
}

/// Which DSP mode the device was last put in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqMode {
    /// Nothing sent yet this session.
    Unknown,
    Preset(Preset),
    Custom,
}

/// Last-known EQ configuration and status of the connected device.
#[derive(Debug, Clone)]
pub struct DeviceState {
    bands: [EqBand; BAND_COUNT],
    mode: EqMode,
    info: Option<DeviceInfo>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceState {
    pub fn new() -> Self {
        Self {
            bands: std::array::from_fn(|i| EqBand::new(i as u8, 0.0, DEFAULT_Q)),
            mode: EqMode::Unknown,
            info: None,
        }
    }

    pub fn bands(&self) -> &[EqBand; BAND_COUNT] {
        &self.bands
    }

    pub fn band(&self, index: u8) -> Option<&EqBand> {
        self.bands.get(index as usize)
    }

    pub fn mode(&self) -> EqMode {
        self.mode
    }

    pub fn info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    /// Record a preset switch. Presets and custom EQ are mutually exclusive
    /// on the device, so this leaves custom mode; the band values are kept
    /// as the base for later single-band edits.
    pub fn apply_preset(&mut self, preset: Preset) {
        self.mode = EqMode::Preset(preset);
    }

    /// Overwrite the band array. Nothing changes if the set is invalid.
    pub fn apply_custom_eq(&mut self, bands: &[EqBand]) -> Result<(), StateError> {
        Self::validate_bands(bands)?;
        for band in bands {
            self.bands[band.index as usize] = *band;
        }
        self.mode = EqMode::Custom;
        Ok(())
    }

    pub fn apply_device_info(&mut self, info: DeviceInfo) {
        self.info = Some(info);
    }

    /// A full band set has exactly one entry for each index 0-7.
    pub fn validate_bands(bands: &[EqBand]) -> Result<(), StateError> {
        if bands.len() != BAND_COUNT {
            return Err(StateError::BandCount(bands.len()));
        }
        let mut seen = [false; BAND_COUNT];
        for band in bands {
            let slot = seen
                .get_mut(band.index as usize)
                .ok_or(StateError::BandIndex(band.index))?;
            if *slot {
                return Err(StateError::DuplicateBand(band.index));
            }
            *slot = true;
        }
        Ok(())
    }

    pub fn check_index(index: u8) -> Result<(), StateError> {
        if (index as usize) < BAND_COUNT {
            Ok(())
        } else {
            Err(StateError::BandIndex(index))
        }
    }

    // --- Candidate band sets (current state with one change applied) ---

    pub fn with_gain(&self, index: u8, gain_db: f32) -> Result<[EqBand; BAND_COUNT], StateError> {
        Self::check_index(index)?;
        let mut bands = self.bands;
        bands[index as usize].gain_db = gain_db;
        Ok(bands)
    }

    pub fn with_gains(&self, gains: &[f32; BAND_COUNT]) -> [EqBand; BAND_COUNT] {
        let mut bands = self.bands;
        for (band, &gain) in bands.iter_mut().zip(gains) {
            band.gain_db = gain;
        }
        bands
    }

    pub fn with_q(&self, index: u8, q: u8) -> Result<[EqBand; BAND_COUNT], StateError> {
        Self::check_index(index)?;
        let mut bands = self.bands;
        bands[index as usize].q = q;
        Ok(bands)
    }

    pub fn with_all_q(&self, q: u8) -> [EqBand; BAND_COUNT] {
        let mut bands = self.bands;
        for band in &mut bands {
            band.q = q;
        }
        bands
    }

    /// All gains at 0 dB, Q values kept.
    pub fn zeroed(&self) -> [EqBand; BAND_COUNT] {
        self.with_gains(&[0.0; BAND_COUNT])
    }
}
