use std::fmt;
use std::str::FromStr;

/// Number of bands in the parametric equalizer.
pub const BAND_COUNT: usize = 8;

/// Fixed center frequency (Hz) of each band, by index.
pub const BAND_FREQUENCIES: [u32; BAND_COUNT] = [60, 100, 230, 500, 1100, 2400, 5400, 12000];

/// Nominal gain range in dB. Values outside are sent clamped.
pub const GAIN_MIN_DB: f32 = -12.0;
pub const GAIN_MAX_DB: f32 = 13.5;

/// Raw Q byte used when nothing else is known (Q = 0.7).
pub const DEFAULT_Q: u8 = 7;

/// One band of a custom EQ command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EqBand {
    pub index: u8,
    pub gain_db: f32,
    /// Raw Q byte; real Q is `q / 10`.
    pub q: u8,
}

impl EqBand {
    pub fn new(index: u8, gain_db: f32, q: u8) -> Self {
        Self { index, gain_db, q }
    }

    /// Center frequency for this band, if the index is valid.
    pub fn frequency(&self) -> Option<u32> {
        BAND_FREQUENCIES.get(self.index as usize).copied()
    }

    /// Whether the gain lies in the nominal device range.
    pub fn is_nominal(&self) -> bool {
        is_nominal_gain(self.gain_db)
    }
}

pub fn is_nominal_gain(gain_db: f32) -> bool {
    (GAIN_MIN_DB..=GAIN_MAX_DB).contains(&gain_db)
}

/// Built-in device DSP presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Main,
    Bass,
    Flat,
    /// Selected together with a zeroed custom EQ.
    Studio,
}

impl Preset {
    pub fn all() -> &'static [Preset] {
        &[Preset::Main, Preset::Bass, Preset::Flat, Preset::Studio]
    }

    /// Wire value (1-4).
    pub fn id(self) -> u8 {
        match self {
            Preset::Main => 1,
            Preset::Bass => 2,
            Preset::Flat => 3,
            Preset::Studio => 4,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::all().iter().copied().find(|p| p.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            Preset::Main => "main",
            Preset::Bass => "bass",
            Preset::Flat => "flat",
            Preset::Studio => "studio",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::all()
            .iter()
            .copied()
            .find(|p| p.name() == lower)
            .ok_or_else(|| format!("unknown preset '{}'", s))
    }
}
