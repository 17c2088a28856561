use crate::error::{Error, Result};
use crate::firmware;
use std::collections::VecDeque;
use std::fmt;

/// Transport-assigned identifier of a peripheral.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One of the two analog front ends of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Channel {
    #[default]
    Afe0,
    Afe1,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Afe0, Channel::Afe1];

    pub fn index(self) -> usize {
        match self {
            Channel::Afe0 => 0,
            Channel::Afe1 => 1,
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Channel::Afe0),
            1 => Ok(Channel::Afe1),
            n => Err(Error::Validation(format!("channel {n} does not exist"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReferenceSource {
    Internal,
    #[default]
    External,
}

/// Register settings of a single AFE channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AfeConfig {
    pub reference: ReferenceSource,
    pub bias: i8,
    pub internal_zero: u8,
    pub load_resistance: u8,
    pub gain: u8,
    pub shorting_fet: bool,
    pub operating_mode: u8,
}

impl Default for AfeConfig {
    fn default() -> Self {
        Self {
            reference: ReferenceSource::External,
            bias: 0,
            internal_zero: 1,
            load_resistance: 3,
            gain: 0,
            shorting_fet: false,
            operating_mode: 0,
        }
    }
}

impl AfeConfig {
    /// All-zero register image: internal reference, no bias, deep sleep.
    pub fn zeroed() -> Self {
        Self {
            reference: ReferenceSource::Internal,
            bias: 0,
            internal_zero: 0,
            load_resistance: 0,
            gain: 0,
            shorting_fet: false,
            operating_mode: 0,
        }
    }

    pub fn bias_label(&self) -> String {
        // Codes 0..=2 step by one percent, everything above by two.
        let magnitude = self.bias.unsigned_abs() as i32;
        let percent = if magnitude <= 2 {
            magnitude
        } else {
            (magnitude - 1) * 2
        };
        if self.bias < 0 {
            format!("-{percent}%")
        } else {
            format!("{percent}%")
        }
    }

    pub fn internal_zero_label(&self) -> &'static str {
        match self.internal_zero {
            0 => "20%",
            1 => "50%",
            2 => "67%",
            3 => "Bypass",
            _ => "?",
        }
    }

    pub fn gain_label(&self) -> &'static str {
        match self.gain {
            0 => "External",
            1 => "2.75 kOhm",
            2 => "3.5 kOhm",
            3 => "7 kOhm",
            4 => "14 kOhm",
            5 => "35 kOhm",
            6 => "120 kOhm",
            7 => "350 kOhm",
            _ => "?",
        }
    }

    pub fn load_label(&self) -> &'static str {
        match self.load_resistance {
            0 => "10 Ohm",
            1 => "33 Ohm",
            2 => "50 Ohm",
            3 => "100 Ohm",
            _ => "?",
        }
    }

    pub fn operating_mode_label(&self) -> &'static str {
        match self.operating_mode {
            0 => "Deep Sleep",
            1 => "2-Lead",
            2 => "Stand By",
            3 => "3-Lead",
            6 => "TIA Off",
            7 => "TIA On",
            _ => "Reserved",
        }
    }
}

/// Full configuration image of a device: both channels plus the DAC trim.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeviceConfig {
    pub channels: [AfeConfig; firmware::CHANNEL_COUNT],
    pub dac_percent: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            channels: [AfeConfig::default(); firmware::CHANNEL_COUNT],
            dac_percent: 50.0,
        }
    }
}

impl DeviceConfig {
    pub fn channel(&self, channel: Channel) -> &AfeConfig {
        &self.channels[channel.index()]
    }

    pub fn with_channel(mut self, channel: Channel, afe: AfeConfig) -> Self {
        self.channels[channel.index()] = afe;
        self
    }

    pub fn with_dac_percent(mut self, percent: f64) -> Self {
        self.dac_percent = percent;
        self
    }
}

/// Rolling telemetry window. The three sequences are always index-aligned.
#[derive(Clone, Debug, PartialEq)]
pub struct Telemetry {
    capacity: usize,
    timestamps: VecDeque<i64>,
    channel0: VecDeque<f64>,
    channel1: VecDeque<f64>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::with_capacity(firmware::TELEMETRY_CAPACITY)
    }
}

impl Telemetry {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            timestamps: VecDeque::with_capacity(capacity),
            channel0: VecDeque::with_capacity(capacity),
            channel1: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, timestamp: i64, channel0: f64, channel1: f64) {
        if self.timestamps.len() >= self.capacity {
            self.timestamps.pop_front();
            self.channel0.pop_front();
            self.channel1.pop_front();
        }
        self.timestamps.push_back(timestamp);
        self.channel0.push_back(channel0);
        self.channel1.push_back(channel1);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn timestamps(&self) -> &VecDeque<i64> {
        &self.timestamps
    }

    pub fn samples(&self, channel: Channel) -> &VecDeque<f64> {
        match channel {
            Channel::Afe0 => &self.channel0,
            Channel::Afe1 => &self.channel1,
        }
    }

    /// Rows of (timestamp, channel0, channel1) in arrival order.
    pub fn rows(&self) -> impl Iterator<Item = (i64, f64, f64)> + '_ {
        self.timestamps
            .iter()
            .zip(self.channel0.iter())
            .zip(self.channel1.iter())
            .map(|((t, a), b)| (*t, *a, *b))
    }
}

/// Snapshot of one physical device. Records are never mutated once
/// published; the `with_*` methods build the replacement.
#[derive(Clone, Debug, PartialEq)]
pub struct SensorRecord {
    device_id: DeviceId,
    display_name: String,
    pub enabled: bool,
    pub is_simulated: bool,
    pub active_channel: Channel,
    pub config: DeviceConfig,
    pub telemetry: Telemetry,
}

impl SensorRecord {
    pub fn new(device_id: DeviceId, display_name: impl Into<String>) -> Result<Self> {
        let display_name = validate_name(display_name.into())?;
        Ok(Self {
            device_id,
            display_name,
            enabled: false,
            is_simulated: false,
            active_channel: Channel::Afe0,
            config: DeviceConfig::default(),
            telemetry: Telemetry::default(),
        })
    }

    /// A record without transport backing, fed with synthesized telemetry.
    pub fn simulated(device_id: DeviceId, display_name: impl Into<String>) -> Result<Self> {
        let mut record = Self::new(device_id, display_name)?;
        record.is_simulated = true;
        Ok(record)
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn with_display_name(&self, name: impl Into<String>) -> Result<Self> {
        let display_name = validate_name(name.into())?;
        Ok(Self {
            display_name,
            ..self.clone()
        })
    }

    pub fn with_enabled(&self, enabled: bool) -> Self {
        Self {
            enabled,
            ..self.clone()
        }
    }

    pub fn with_active_channel(&self, channel: Channel) -> Self {
        Self {
            active_channel: channel,
            ..self.clone()
        }
    }

    pub fn with_config(&self, config: DeviceConfig) -> Self {
        Self {
            config,
            ..self.clone()
        }
    }

    pub fn with_channel_config(&self, channel: Channel, afe: AfeConfig) -> Self {
        self.with_config(self.config.with_channel(channel, afe))
    }

    pub fn with_telemetry_capacity(&self, capacity: usize) -> Self {
        let mut telemetry = Telemetry::with_capacity(capacity);
        for (t, a, b) in self.telemetry.rows() {
            telemetry.push(t, a, b);
        }
        Self {
            telemetry,
            ..self.clone()
        }
    }

    pub fn with_sample(&self, timestamp: i64, channel0: f64, channel1: f64) -> Self {
        let mut next = self.clone();
        next.telemetry.push(timestamp, channel0, channel1);
        next
    }

    pub fn channel_config(&self, channel: Channel) -> &AfeConfig {
        self.config.channel(channel)
    }
}

fn validate_name(name: String) -> Result<String> {
    if name.trim().is_empty() {
        Err(Error::Validation("display name must not be empty".into()))
    } else {
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name_rejected() {
        assert!(matches!(
            SensorRecord::new("a".into(), ""),
            Err(Error::Validation(_))
        ));
        let record = SensorRecord::new("a".into(), "Sensor A").unwrap();
        assert!(record.with_display_name("   ").is_err());
        assert_eq!(
            record.with_display_name("Renamed").unwrap().display_name(),
            "Renamed"
        );
    }

    #[test]
    fn test_telemetry_evicts_in_lockstep() {
        let mut telemetry = Telemetry::with_capacity(3);
        for i in 0..5 {
            telemetry.push(i, i as f64, -(i as f64));
        }
        assert_eq!(telemetry.len(), 3);
        assert_eq!(telemetry.samples(Channel::Afe0).len(), 3);
        assert_eq!(telemetry.samples(Channel::Afe1).len(), 3);
        let rows: Vec<_> = telemetry.rows().collect();
        assert_eq!(rows, vec![(2, 2.0, -2.0), (3, 3.0, -3.0), (4, 4.0, -4.0)]);
    }

    #[test]
    fn test_channel_config_is_explicit() {
        let record = SensorRecord::new("a".into(), "Sensor A").unwrap();
        let afe = AfeConfig {
            gain: 5,
            ..AfeConfig::default()
        };
        let next = record
            .with_active_channel(Channel::Afe0)
            .with_channel_config(Channel::Afe1, afe);
        assert_eq!(next.channel_config(Channel::Afe1).gain, 5);
        assert_eq!(next.channel_config(Channel::Afe0).gain, 0);
        // the original record is untouched
        assert_eq!(record.channel_config(Channel::Afe1).gain, 0);
    }

    #[test]
    fn test_channel_from_index() {
        assert_eq!(Channel::try_from(1).unwrap(), Channel::Afe1);
        assert!(Channel::try_from(2).is_err());
    }

    #[test]
    fn test_labels() {
        let afe = AfeConfig {
            bias: -3,
            ..AfeConfig::default()
        };
        assert_eq!(afe.bias_label(), "-4%");
        assert_eq!(AfeConfig { bias: 13, ..afe }.bias_label(), "24%");
        assert_eq!(AfeConfig { bias: 2, ..afe }.bias_label(), "2%");
        assert_eq!(afe.load_label(), "100 Ohm");
        assert_eq!(afe.operating_mode_label(), "Deep Sleep");
    }
}
