//! Delimited text export of a single sensor record.
//!
//! ```text
//! timestamp,channel0,channel1
//! 1700000000000,12.5,3
//! ...
//! 0,128,3,176,0,3,176,0
//! ```
//!
//! The last line is the encoded configuration register image.

use crate::error::Result;
use crate::protocol;
use crate::sensor::SensorRecord;
use chrono::{DateTime, TimeZone};
use std::fmt::Display;

pub const HEADER: &str = "timestamp,channel0,channel1";

pub fn render(record: &SensorRecord) -> Result<String> {
    let config = protocol::encode(&record.config)?;
    let mut out = String::with_capacity(32 * (record.telemetry.len() + 2));
    out.push_str(HEADER);
    out.push('\n');
    for (timestamp, channel0, channel1) in record.telemetry.rows() {
        out.push_str(&format!("{timestamp},{channel0},{channel1}\n"));
    }
    out.push_str(&protocol::config_as_csv(&config));
    out.push('\n');
    Ok(out)
}

/// `<display name>_<YYYYMMDD_HHMMSS>.csv`, with path separators in the
/// name replaced.
pub fn file_name<Tz>(record: &SensorRecord, at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let name: String = record
        .display_name()
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    format!("{name}_{}.csv", at.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::sensor::{Channel, DeviceId};
    use chrono::Utc;

    fn record() -> SensorRecord {
        SensorRecord::new(DeviceId::new("a"), "Clarkson 1").unwrap()
    }

    #[test]
    fn test_render_rows_and_config() {
        let record = record()
            .with_sample(1000, 1.5, 2.0)
            .with_sample(1200, 3.0, 4.25);
        assert_eq!(
            render(&record).unwrap(),
            "timestamp,channel0,channel1\n\
             1000,1.5,2\n\
             1200,3,4.25\n\
             0,128,3,176,0,3,176,0\n"
        );
    }

    #[test]
    fn test_render_empty_record() {
        let text = render(&record()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert_eq!(text.lines().next(), Some(HEADER));
    }

    #[test]
    fn test_render_follows_the_codec() {
        let mut afe = *record().channel_config(Channel::Afe1);
        afe.gain = 5;
        let record = record().with_channel_config(Channel::Afe1, afe);
        let bytes = protocol::encode(&record.config).unwrap();
        let text = render(&record).unwrap();
        assert_eq!(text.lines().last(), Some(protocol::config_as_csv(&bytes).as_str()));
    }

    #[test]
    fn test_render_rejects_unencodable_config() {
        let mut afe = *record().channel_config(Channel::Afe0);
        afe.operating_mode = 9;
        let record = record().with_channel_config(Channel::Afe0, afe);
        assert!(matches!(
            render(&record),
            Err(Error::Encoding {
                field: "operating_mode",
                ..
            })
        ));
    }

    #[test]
    fn test_file_name() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(file_name(&record(), &at), "Clarkson 1_20240309_140507.csv");
        let record = record().with_display_name("lab/bench").unwrap();
        assert_eq!(file_name(&record, &at), "lab_bench_20240309_140507.csv");
    }
}
