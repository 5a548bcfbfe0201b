//! Measurement decoders
//!
//! A decoder turns the payload of one frame into one typed record. Decoders
//! are pure: the same bytes always produce the same record or the same error,
//! so a failure only ever costs the frame that caused it.

use crate::frame::read_varint;
use std::fmt;

/// Nested field tag for temperature in thermometer packets
pub const TEMPERATURE_TAG: u8 = 0x11;
/// Nested field tag for humidity in thermometer packets
pub const HUMIDITY_TAG: u8 = 0x12;

const FLOAT32_LEN: usize = 4;

/// A decoded measurement that can be rendered as one line-protocol point
pub trait Measurement: Send + fmt::Debug + 'static {
    /// Line-protocol measurement name
    const NAME: &'static str;

    /// Named numeric fields, in output order
    fn fields(&self) -> Vec<(&'static str, f64)>;
}

/// Pluggable payload decoder, one per measurement kind
pub trait RecordDecoder: Send + Sync + 'static {
    type Record: Measurement;

    fn decode(&self, payload: &[u8]) -> Result<Self::Record, DecodeError>;
}

/// Error type for a frame that could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Payload shorter than the value it should contain
    Truncated { expected: usize, actual: usize },
    /// A required nested field was absent
    MissingField(u8),
    /// Bytes were present but not a usable value
    InvalidValue(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { expected, actual } => {
                write!(f, "truncated payload: expected {} bytes, got {}", expected, actual)
            }
            DecodeError::MissingField(tag) => write!(f, "missing field 0x{:02x}", tag),
            DecodeError::InvalidValue(msg) => write!(f, "invalid value: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode a big-endian IEEE-754 float32 occupying the whole of `bytes`.
///
/// Line protocol has no representation for NaN or infinity, so those are
/// rejected here rather than at write time.
pub fn decode_f32(bytes: &[u8]) -> Result<f32, DecodeError> {
    if bytes.len() < FLOAT32_LEN {
        return Err(DecodeError::Truncated {
            expected: FLOAT32_LEN,
            actual: bytes.len(),
        });
    }
    if bytes.len() > FLOAT32_LEN {
        return Err(DecodeError::InvalidValue(format!(
            "{} trailing bytes after float32",
            bytes.len() - FLOAT32_LEN
        )));
    }
    let value = f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if !value.is_finite() {
        return Err(DecodeError::InvalidValue(format!("non-finite float {}", value)));
    }
    Ok(value)
}

// ============================================================================
// Noise sensors
// ============================================================================

/// Sound level reported by a noise sensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Noise {
    pub value: f32,
}

impl Measurement for Noise {
    const NAME: &'static str = "noise_sensor";

    fn fields(&self) -> Vec<(&'static str, f64)> {
        vec![("val", self.value as f64)]
    }
}

/// Payload is a single float32
#[derive(Debug, Clone, Copy, Default)]
pub struct NoiseDecoder;

impl RecordDecoder for NoiseDecoder {
    type Record = Noise;

    fn decode(&self, payload: &[u8]) -> Result<Noise, DecodeError> {
        decode_f32(payload).map(|value| Noise { value })
    }
}

// ============================================================================
// Thermometer sensors
// ============================================================================

/// Temperature and relative humidity pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thermometer {
    pub temperature: f32,
    pub humidity: f32,
}

impl Measurement for Thermometer {
    const NAME: &'static str = "thermometer_sensor";

    fn fields(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("tem", self.temperature as f64),
            ("hum", self.humidity as f64),
        ]
    }
}

/// Payload is a run of nested TLV fields (0x11 temperature, 0x12 humidity).
/// Unknown nested tags are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThermometerDecoder;

impl RecordDecoder for ThermometerDecoder {
    type Record = Thermometer;

    fn decode(&self, payload: &[u8]) -> Result<Thermometer, DecodeError> {
        let mut temperature = None;
        let mut humidity = None;
        let mut pos = 0;

        while pos < payload.len() {
            let tag = payload[pos];
            let rest = &payload[pos + 1..];
            let (len, len_bytes) = match read_varint(rest) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => {
                    return Err(DecodeError::Truncated {
                        expected: pos + 2,
                        actual: payload.len(),
                    })
                }
                Err(e) => return Err(DecodeError::InvalidValue(e.to_string())),
            };

            let start = pos + 1 + len_bytes;
            let end = start + len;
            if end > payload.len() {
                return Err(DecodeError::Truncated {
                    expected: end,
                    actual: payload.len(),
                });
            }

            let value = &payload[start..end];
            match tag {
                TEMPERATURE_TAG => temperature = Some(decode_f32(value)?),
                HUMIDITY_TAG => humidity = Some(decode_f32(value)?),
                _ => {}
            }
            pos = end;
        }

        Ok(Thermometer {
            temperature: temperature.ok_or(DecodeError::MissingField(TEMPERATURE_TAG))?,
            humidity: humidity.ok_or(DecodeError::MissingField(HUMIDITY_TAG))?,
        })
    }
}
