//! Codec for the 8-byte configuration image (DAC trim as u16 LE, then
//! TIACN, REFCN and MODECN per AFE) and the values characteristic.

use crate::error::{Error, Result};
use crate::firmware::{
    BIAS_MAGNITUDE_MAX, CHANNEL_COUNT, CONFIG_LEN, DAC_FULL_SCALE, GAIN_MAX, INT_ZERO_MAX,
    LOAD_MAX, MODE_MAX, VALUES_LEN,
};
use crate::sensor::{AfeConfig, DeviceConfig, ReferenceSource};

const REGISTERS_OFFSET: usize = 2;
const REGISTERS_PER_CHANNEL: usize = 3;

pub fn encode(config: &DeviceConfig) -> Result<[u8; CONFIG_LEN]> {
    let mut buffer = [0u8; CONFIG_LEN];
    buffer[..2].copy_from_slice(&dac_raw(config.dac_percent).to_le_bytes());

    for (i, afe) in config.channels.iter().enumerate() {
        let offset = REGISTERS_OFFSET + REGISTERS_PER_CHANNEL * i;
        buffer[offset..offset + REGISTERS_PER_CHANNEL].copy_from_slice(&encode_afe(afe)?);
    }
    Ok(buffer)
}

pub fn decode(buffer: &[u8]) -> Result<DeviceConfig> {
    if buffer.len() < CONFIG_LEN {
        return Err(Error::Truncated {
            expected: CONFIG_LEN,
            actual: buffer.len(),
        });
    }

    let raw = u16::from_le_bytes([buffer[0], buffer[1]]);
    let mut channels = [AfeConfig::zeroed(); CHANNEL_COUNT];
    for (i, afe) in channels.iter_mut().enumerate() {
        let offset = REGISTERS_OFFSET + REGISTERS_PER_CHANNEL * i;
        *afe = decode_afe(buffer[offset], buffer[offset + 1], buffer[offset + 2]);
    }

    Ok(DeviceConfig {
        channels,
        dac_percent: raw as f64 * 100.0 / DAC_FULL_SCALE,
    })
}

/// DAC percentage to raw register value. NaN maps to zero.
pub fn dac_raw(percent: f64) -> u16 {
    (percent * DAC_FULL_SCALE / 100.0)
        .round()
        .clamp(0.0, u16::MAX as f64) as u16
}

fn check(field: &'static str, value: u8, max: u8) -> Result<u8> {
    if value > max {
        Err(Error::Encoding {
            field,
            value: value as i64,
            max: max as i64,
        })
    } else {
        Ok(value)
    }
}

fn encode_afe(afe: &AfeConfig) -> Result<[u8; REGISTERS_PER_CHANNEL]> {
    let gain = check("gain", afe.gain, GAIN_MAX)?;
    let load = check("load_resistance", afe.load_resistance, LOAD_MAX)?;
    let int_zero = check("internal_zero", afe.internal_zero, INT_ZERO_MAX)?;
    let mode = check("operating_mode", afe.operating_mode, MODE_MAX)?;
    let magnitude = afe.bias.unsigned_abs();
    if magnitude > BIAS_MAGNITUDE_MAX {
        return Err(Error::Encoding {
            field: "bias",
            value: afe.bias as i64,
            max: BIAS_MAGNITUDE_MAX as i64,
        });
    }

    let external = (afe.reference == ReferenceSource::External) as u8;
    let sign = (afe.bias >= 0) as u8;

    let tiacn = gain << 2 | load;
    let refcn = external << 7 | int_zero << 5 | sign << 4 | magnitude;
    let modecn = (afe.shorting_fet as u8) << 7 | mode;
    Ok([tiacn, refcn, modecn])
}

fn decode_afe(tiacn: u8, refcn: u8, modecn: u8) -> AfeConfig {
    let magnitude = (refcn & BIAS_MAGNITUDE_MAX) as i8;
    let bias = if refcn & 0x10 != 0 { magnitude } else { -magnitude };
    AfeConfig {
        reference: if refcn & 0x80 != 0 {
            ReferenceSource::External
        } else {
            ReferenceSource::Internal
        },
        bias,
        internal_zero: (refcn >> 5) & INT_ZERO_MAX,
        load_resistance: tiacn & LOAD_MAX,
        gain: (tiacn >> 2) & GAIN_MAX,
        shorting_fet: modecn & 0x80 != 0,
        operating_mode: modecn & MODE_MAX,
    }
}

/// Renders an encoded configuration as comma separated decimal bytes.
pub fn config_as_csv(buffer: &[u8; CONFIG_LEN]) -> String {
    buffer
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<String>>()
        .join(",")
}

/// One telemetry reading of both channels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub timestamp: i64,
    pub channel0: f64,
    pub channel1: f64,
}

impl Sample {
    /// Decodes the values characteristic: two little-endian u32, one per
    /// channel. The timestamp is attached by the reader.
    pub fn decode(buffer: &[u8], timestamp: i64) -> Result<Sample> {
        if buffer.len() < VALUES_LEN {
            return Err(Error::Truncated {
                expected: VALUES_LEN,
                actual: buffer.len(),
            });
        }
        let channel0 = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        let channel1 = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
        Ok(Sample {
            timestamp,
            channel0: channel0 as f64,
            channel1: channel1 as f64,
        })
    }
}
