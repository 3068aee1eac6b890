//! Mapping between domain commands and QXW wire bytes.
//!
//! Encoding is strict about framing but lenient about values: gains outside
//! the nominal range are clamped rather than rejected. Decoding never fails;
//! anything it can't make sense of comes back as `Unrecognized` or
//! `UnknownCommand`, since the notify characteristic may carry unrelated
//! traffic.

use thiserror::Error;

use super::commands::*;
use super::frame::{Frame, FrameError, HEADER_LEN};
use crate::device::equalizer::EqBand;
use crate::device::info::DeviceInfo;

/// Gain byte that corresponds to 0 dB.
pub const GAIN_OFFSET: i32 = 120;
/// Gain steps per dB.
pub const GAIN_SCALE: f32 = 10.0;

/// Name reported when the device-info payload carries none we can find.
pub const UNKNOWN_NAME: &str = "Unknown";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid preset {0} (must be 1-4)")]
    InvalidPreset(u8),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Device info payload too short: {0} bytes (need 5)")]
    TooShort(usize),
}

/// Result of decoding one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedMessage {
    /// Preset change echo. `preset` is present when the payload has the
    /// `[0x01, preset]` request shape.
    PresetAck { preset: Option<u8> },
    CustomEqAck,
    /// Device-info reply. Holds every byte after the command and kind
    /// bytes, so offsets are counted from the length byte.
    DeviceInfoNotify(Vec<u8>),
    UnknownCommand(u8, Vec<u8>),
    Unrecognized(Vec<u8>),
}

/// Encode a gain in dB to its wire byte, clamping to the byte range.
/// NaN encodes as 0 dB.
pub fn encode_gain(gain_db: f32) -> u8 {
    if gain_db.is_nan() {
        return GAIN_OFFSET as u8;
    }
    let raw = (gain_db * GAIN_SCALE).round() + GAIN_OFFSET as f32;
    raw.clamp(0.0, u8::MAX as f32) as u8
}

pub fn decode_gain(byte: u8) -> f32 {
    (byte as i32 - GAIN_OFFSET) as f32 / GAIN_SCALE
}

/// Real Q-factor of a raw Q byte.
pub fn q_factor(byte: u8) -> f32 {
    byte as f32 / 10.0
}

/// QXW 10 01 02 01 <preset>
pub fn encode_select_preset(preset: u8) -> Result<Frame, CodecError> {
    if !(1..=4).contains(&preset) {
        return Err(CodecError::InvalidPreset(preset));
    }
    Ok(Frame::new(
        CMD_SELECT_EQ,
        KIND_REQUEST,
        vec![SELECT_EQ_PREFIX, preset],
    )?)
}

/// QXW 20 03 <len> (<index> <gain> <q>)...
pub fn encode_custom_eq(bands: &[EqBand]) -> Result<Frame, CodecError> {
    let payload = bands
        .iter()
        .flat_map(|b| [b.index, encode_gain(b.gain_db), b.q])
        .collect();
    Ok(Frame::new(CMD_CUSTOM_EQ, KIND_NOTIFY, payload)?)
}

/// QXW 27 01 01 00
pub fn encode_device_info_request() -> Frame {
    Frame {
        command: CMD_DEVICE_INFO,
        kind: KIND_REQUEST,
        payload: vec![0x00],
    }
}

/// Classify a raw notification.
pub fn decode(raw: &[u8]) -> DecodedMessage {
    if raw.len() < HEADER_LEN || raw[..MAGIC.len()] != MAGIC {
        return DecodedMessage::Unrecognized(raw.to_vec());
    }

    let command = raw[3];
    let kind = raw[4];
    let payload = &raw[HEADER_LEN..];

    match command {
        CMD_SELECT_EQ => {
            let preset = match payload {
                [SELECT_EQ_PREFIX, p, ..] => Some(*p),
                _ => None,
            };
            DecodedMessage::PresetAck { preset }
        }
        CMD_CUSTOM_EQ => DecodedMessage::CustomEqAck,
        CMD_DEVICE_INFO if kind == KIND_RESPONSE => {
            DecodedMessage::DeviceInfoNotify(raw[HEADER_LEN - 1..].to_vec())
        }
        other => DecodedMessage::UnknownCommand(other, raw.to_vec()),
    }
}

/// Parse a device-info body: batteries at offsets 2 and 3, name found by
/// [`find_length_prefixed_name`].
pub fn decode_device_info(payload: &[u8]) -> Result<DeviceInfo, DecodeError> {
    if payload.len() < 5 {
        return Err(DecodeError::TooShort(payload.len()));
    }

    let name = find_length_prefixed_name(payload)
        .unwrap_or(UNKNOWN_NAME)
        .to_string();

    Ok(DeviceInfo {
        battery_left: payload[2],
        battery_right: payload[3],
        name,
    })
}

/// Find a length-prefixed ASCII name by scanning backward from the tail.
///
/// A byte `n` at position `i` (never position 0) qualifies when
/// `0 < n < 32` and the `n` bytes after it exist and are all printable
/// ASCII. The match closest to the tail wins.
///
/// This is a heuristic that mirrors what the device sends. A payload whose
/// trailing bytes happen to look like a short printable string behind a
/// small length byte will be misread; callers should treat the name as a
/// display hint only.
pub fn find_length_prefixed_name(payload: &[u8]) -> Option<&str> {
    (1..payload.len()).rev().find_map(|i| {
        let n = payload[i] as usize;
        if n == 0 || n >= 32 || i + 1 + n > payload.len() {
            return None;
        }
        let candidate = &payload[i + 1..i + 1 + n];
        if candidate.iter().all(|b| (0x20..=0x7E).contains(b)) {
            std::str::from_utf8(candidate).ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_roundtrip() {
        for p in 1..=4 {
            let bytes = encode_select_preset(p).unwrap().to_bytes();
            assert_eq!(decode(&bytes), DecodedMessage::PresetAck { preset: Some(p) });
        }
    }

    #[test]
    fn test_preset_out_of_range_rejected() {
        assert_eq!(encode_select_preset(0), Err(CodecError::InvalidPreset(0)));
        assert_eq!(encode_select_preset(5), Err(CodecError::InvalidPreset(5)));
    }

    #[test]
    fn test_preset_wire_bytes() {
        let bytes = encode_select_preset(2).unwrap().to_bytes();
        assert_eq!(bytes, b"QXW\x10\x01\x02\x01\x02");
    }

    #[test]
    fn test_gain_inverse_within_one_step() {
        for step in -120..=135 {
            let db = step as f32 / 10.0;
            let back = decode_gain(encode_gain(db));
            assert!((back - db).abs() <= 0.05, "{} -> {}", db, back);
        }
    }

    #[test]
    fn test_gain_nominal_endpoints() {
        assert_eq!(encode_gain(-12.0), 0);
        assert_eq!(encode_gain(0.0), 120);
        assert_eq!(encode_gain(13.5), 255);
    }

    #[test]
    fn test_gain_clamps_instead_of_failing() {
        assert_eq!(encode_gain(20.0), 255);
        assert_eq!(encode_gain(-50.0), 0);
    }

    #[test]
    fn test_gain_extreme_values_clamp() {
        assert_eq!(encode_gain(1e9), 255);
        assert_eq!(encode_gain(-1e9), 0);
        assert_eq!(encode_gain(f32::INFINITY), 255);
        assert_eq!(encode_gain(f32::NEG_INFINITY), 0);
        assert_eq!(encode_gain(f32::MAX), 255);
        assert_eq!(encode_gain(f32::NAN), 120);
    }

    #[test]
    fn test_q_factor() {
        assert!((q_factor(7) - 0.7).abs() < f32::EPSILON);
        assert!((q_factor(30) - 3.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_custom_eq_uses_notify_kind() {
        let bands = vec![
            EqBand::new(0, 1.5, 7),
            EqBand::new(3, -2.0, 10),
        ];
        let frame = encode_custom_eq(&bands).unwrap();
        assert_eq!(frame.command, CMD_CUSTOM_EQ);
        assert_eq!(frame.kind, KIND_NOTIFY);
        assert_eq!(frame.length(), 6);
        assert_eq!(frame.payload(), &[0, 135, 7, 3, 100, 10]);
    }

    #[test]
    fn test_custom_eq_clamps_out_of_range_gain() {
        let frame = encode_custom_eq(&[EqBand::new(7, 40.0, 7)]).unwrap();
        assert_eq!(frame.payload(), &[7, 255, 7]);
    }

    #[test]
    fn test_device_info_request_bytes() {
        let bytes = encode_device_info_request().to_bytes();
        assert_eq!(bytes, b"QXW\x27\x01\x01\x00");
    }

    #[test]
    fn test_decode_short_and_foreign_input() {
        for raw in [
            &b""[..],
            b"Q",
            b"QXW",
            b"QXW\x10\x01",
            b"ABC\x10\x01\x02\x01\x02",
            &[0xFF; 40],
        ] {
            assert_eq!(decode(raw), DecodedMessage::Unrecognized(raw.to_vec()));
        }
    }

    #[test]
    fn test_decode_unknown_command() {
        let raw = b"QXW\x42\x02\x00";
        assert_eq!(
            decode(raw),
            DecodedMessage::UnknownCommand(0x42, raw.to_vec())
        );
    }

    #[test]
    fn test_decode_custom_eq_ack_with_garbage_length() {
        assert_eq!(decode(b"QXW\x20\x03\x99"), DecodedMessage::CustomEqAck);
    }

    #[test]
    fn test_device_info_request_echo_is_not_info() {
        let raw = encode_device_info_request().to_bytes();
        assert!(matches!(
            decode(&raw),
            DecodedMessage::UnknownCommand(CMD_DEVICE_INFO, _)
        ));
    }

    #[test]
    fn test_decode_device_info_notification() {
        let mut raw = b"QXW\x27\x02".to_vec();
        raw.extend_from_slice(&[0x01, 0x03, 0x64, 0x5A, 0x00, 0x04]);
        raw.extend_from_slice(b"Buds");

        let DecodedMessage::DeviceInfoNotify(body) = decode(&raw) else {
            panic!("expected device info");
        };
        let info = decode_device_info(&body).unwrap();
        assert_eq!(info.battery_left, 0x64);
        assert_eq!(info.battery_right, 0x5A);
        assert_eq!(info.name, "Buds");
    }

    #[test]
    fn test_device_info_parse() {
        let payload = [0x01, 0x03, 0x64, 0x64, 0x00, 0x04, b'B', b'u', b'd', b's'];
        let info = decode_device_info(&payload).unwrap();
        assert_eq!(
            info,
            DeviceInfo {
                battery_left: 100,
                battery_right: 100,
                name: "Buds".into(),
            }
        );
    }

    #[test]
    fn test_device_info_without_name() {
        let info = decode_device_info(&[0x01, 0x03, 0x50, 0x4E, 0x00]).unwrap();
        assert_eq!(info.battery_left, 80);
        assert_eq!(info.battery_right, 78);
        assert_eq!(info.name, UNKNOWN_NAME);
    }

    #[test]
    fn test_device_info_too_short() {
        assert_eq!(
            decode_device_info(&[0x01, 0x03, 0x64, 0x64]),
            Err(DecodeError::TooShort(4))
        );
    }

    #[test]
    fn test_name_scan_prefers_tail_match() {
        // A short printable run near the tail shadows the real name.
        let payload = [0x00, 0x04, b'B', b'u', b'd', b's', 0x01, b'x'];
        assert_eq!(find_length_prefixed_name(&payload), Some("x"));
    }

    #[test]
    fn test_name_scan_ignores_position_zero() {
        assert_eq!(find_length_prefixed_name(&[0x02, b'o', b'k']), None);
    }

    #[test]
    fn test_name_scan_rejects_non_printable() {
        assert_eq!(
            find_length_prefixed_name(&[0x00, 0x00, 0x02, b'o', 0x07]),
            None
        );
    }
}
