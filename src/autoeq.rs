//! AutoEQ `ParametricEQ.txt` support.
//!
//! ```text
//! Preamp: -6.4 dB
//! Filter 1: ON LSC Fc 105 Hz Gain 5.8 dB Q 0.70
//! Filter 2: ON PK Fc 180 Hz Gain -2.1 dB Q 0.52
//! ```
//!
//! The device's band centers are fixed, so enabled filters are mapped onto
//! bands 0-7 in file order; only gain and Q carry over.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::device::equalizer::{EqBand, BAND_COUNT, BAND_FREQUENCIES, DEFAULT_Q};

#[derive(Error, Debug)]
pub enum AutoEqError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("No enabled filters found")]
    NoFilters,
}

/// One enabled filter line.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Filter {
    frequency: f32,
    gain_db: f32,
    q: f32,
}

pub fn load_file(path: &Path) -> Result<Vec<EqBand>, AutoEqError> {
    let text = std::fs::read_to_string(path).map_err(|source| AutoEqError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_parametric_eq(&text)
}

pub fn parse_parametric_eq(text: &str) -> Result<Vec<EqBand>, AutoEqError> {
    let mut filters = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if let Some(filter) = parse_filter_line(line.trim(), idx + 1)? {
            filters.push(filter);
        }
    }

    if filters.is_empty() {
        return Err(AutoEqError::NoFilters);
    }
    if filters.len() > BAND_COUNT {
        warn!(
            "{} filters in file, only the first {} are used",
            filters.len(),
            BAND_COUNT
        );
    }

    let bands = (0..BAND_COUNT)
        .map(|i| match filters.get(i) {
            Some(f) => {
                let center = BAND_FREQUENCIES[i] as f32;
                if (f.frequency / center).log2().abs() > 1.0 {
                    warn!(
                        "Filter at {} Hz lands on band {} ({} Hz)",
                        f.frequency, i, BAND_FREQUENCIES[i]
                    );
                }
                EqBand::new(i as u8, f.gain_db, q_byte(f.q))
            }
            None => EqBand::new(i as u8, 0.0, DEFAULT_Q),
        })
        .collect();
    Ok(bands)
}

/// Raw Q byte for a real Q value.
fn q_byte(q: f32) -> u8 {
    (q * 10.0).round().clamp(1.0, 255.0) as u8
}

/// `None` for lines that aren't enabled filters.
fn parse_filter_line(line: &str, line_no: usize) -> Result<Option<Filter>, AutoEqError> {
    if !line.starts_with("Filter") {
        return Ok(None);
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if !tokens.contains(&"ON") {
        return Ok(None);
    }

    let value_after = |key: &str| -> Result<f32, AutoEqError> {
        let pos = tokens
            .iter()
            .position(|t| *t == key)
            .ok_or_else(|| AutoEqError::Parse {
                line: line_no,
                message: format!("missing {}", key),
            })?;
        let raw = tokens.get(pos + 1).ok_or_else(|| AutoEqError::Parse {
            line: line_no,
            message: format!("no value after {}", key),
        })?;
        raw.parse().map_err(|_| AutoEqError::Parse {
            line: line_no,
            message: format!("bad {} value '{}'", key, raw),
        })
    };

    Ok(Some(Filter {
        frequency: value_after("Fc")?,
        gain_db: value_after("Gain")?,
        q: value_after("Q")?,
    }))
}

/// Sorted names (without `.txt`) of the preset files in `dir`.
pub fn list_presets(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    names
}

/// Turn a preset name or path into a file path.
///
/// Tries the name (with `.txt` added if missing) as given, then the bare
/// name, then inside `presets_dir`. Falls back to the `.txt` name so the
/// read error mentions what was looked for.
pub fn resolve_preset_path(name: &str, presets_dir: &Path) -> PathBuf {
    let with_ext = if name.ends_with(".txt") {
        name.to_string()
    } else {
        format!("{}.txt", name)
    };

    for candidate in [PathBuf::from(&with_ext), PathBuf::from(name)] {
        if candidate.is_file() {
            return candidate;
        }
    }

    let in_dir = presets_dir.join(&with_ext);
    if in_dir.is_file() {
        return in_dir;
    }
    PathBuf::from(with_ext)
}
