//! ==============================================================================
//! miflora.rs - byte level codec for xiaomi flower care sensors
//! ==============================================================================
//!
//! purpose:
//!     decodes the gatt characteristic payloads a miflora device returns.
//!     no i/o happens here; transports hand us raw bytes.
//!
//! gatt layout:
//!
//!     handle 0x33  mode change   write A0 1F to switch on real-time data
//!     handle 0x35  sensor data   16 bytes, see `decode_sensor_data`
//!     handle 0x38  firmware      battery byte + ascii version
//!
//! relationships:
//!     - used by: gatttool.rs (decodes characteristic reads)
//!
//! ==============================================================================

use thiserror::Error;

pub const HANDLE_MODE_CHANGE: u16 = 0x33;
pub const HANDLE_SENSOR_DATA: u16 = 0x35;
pub const HANDLE_FIRMWARE: u16 = 0x38;

/// written to the mode handle before every sensor data read
pub const MODE_CHANGE_REALTIME: [u8; 2] = [0xA0, 0x1F];

/// devices on this firmware or newer need the mode change
pub const MODE_CHANGE_MIN_VERSION: &str = "2.6.6";

/// returned by the data handle when real-time mode was not enabled
const LEGACY_MODE_PAYLOAD: [u8; 10] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x99, 0x88, 0x77, 0x66];

const FIRMWARE_MIN_LEN: usize = 2;
const SENSOR_DATA_MIN_LEN: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("device is not in real-time data mode")]
    LegacyMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    pub battery_percent: u8,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurements {
    pub temperature_celsius: f64,
    pub light_lux: u32,
    pub moisture_percent: u8,
    /// microsiemens per centimetre
    pub conductivity: u16,
}

pub fn decode_firmware(payload: &[u8]) -> Result<Firmware, DecodeError> {
    if payload.len() < FIRMWARE_MIN_LEN {
        return Err(DecodeError::TooShort {
            expected: FIRMWARE_MIN_LEN,
            actual: payload.len(),
        });
    }

    let version = String::from_utf8_lossy(&payload[2..])
        .trim_end_matches('\0')
        .trim()
        .to_string();

    Ok(Firmware {
        battery_percent: payload[0],
        version,
    })
}

/// decode the real-time data characteristic
///
/// layout (little endian):
///     0..2   temperature, signed tenths of a degree
///     2      unused
///     3..7   light in lux
///     7      moisture percent
///     8..10  conductivity in uS/cm
pub fn decode_sensor_data(payload: &[u8]) -> Result<Measurements, DecodeError> {
    if payload.len() < SENSOR_DATA_MIN_LEN {
        return Err(DecodeError::TooShort {
            expected: SENSOR_DATA_MIN_LEN,
            actual: payload.len(),
        });
    }
    if payload.starts_with(&LEGACY_MODE_PAYLOAD) {
        return Err(DecodeError::LegacyMode);
    }

    let temperature = i16::from_le_bytes([payload[0], payload[1]]);
    let light = u32::from_le_bytes([payload[3], payload[4], payload[5], payload[6]]);
    let conductivity = u16::from_le_bytes([payload[8], payload[9]]);

    Ok(Measurements {
        temperature_celsius: f64::from(temperature) / 10.0,
        light_lux: light,
        moisture_percent: payload[7],
        conductivity,
    })
}

/// whether a device on `version` must be switched to real-time mode first
///
/// unparseable versions get the mode change; writing it is harmless.
pub fn needs_mode_change(version: &str) -> bool {
    match (parse_version(version), parse_version(MODE_CHANGE_MIN_VERSION)) {
        (Some(v), Some(min)) => v >= min,
        _ => true,
    }
}

fn parse_version(version: &str) -> Option<Vec<u32>> {
    version
        .split('.')
        .map(|part| part.trim().parse::<u32>().ok())
        .collect()
}
