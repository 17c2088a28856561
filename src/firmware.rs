// GATT layout and register limits of the TinyBLEStat firmware.

use std::time::Duration;
use uuid::Uuid;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x88189766_42ed_4e52_8e9f_47c7decd82a9);
pub const VALUES_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xf8898af6_786e_4058_b910_4244cecd3008);
pub const CONFIG_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xf8898af6_786e_4058_b910_4244cecd3009);

/// Advertised name prefixes of managed sensors.
pub const NAME_PREFIXES: [&str; 2] = ["Clarkson", "CU"];

pub const CONFIG_LEN: usize = 8;
pub const VALUES_LEN: usize = 8;
pub const CHANNEL_COUNT: usize = 2;

// Register field widths, as maximum raw values.
pub const GAIN_MAX: u8 = 0b111;
pub const LOAD_MAX: u8 = 0b11;
pub const INT_ZERO_MAX: u8 = 0b11;
pub const BIAS_MAGNITUDE_MAX: u8 = 0b1111;
pub const MODE_MAX: u8 = 0b111;

pub const DAC_FULL_SCALE: f64 = 65536.0;

pub const POLL_PERIOD: Duration = Duration::from_millis(200);
pub const READ_TIMEOUT: Duration = Duration::from_millis(1000);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const TELEMETRY_CAPACITY: usize = 25;

pub fn matches_prefix<S: AsRef<str>>(name: &str, prefixes: &[S]) -> bool {
    prefixes.iter().any(|p| name.starts_with(p.as_ref()))
}

#[test]
fn test_prefix_match() {
    assert!(matches_prefix("Clarkson Insole 3", &NAME_PREFIXES));
    assert!(matches_prefix("CU-FAB", &NAME_PREFIXES));
    assert!(!matches_prefix("PsyLink", &NAME_PREFIXES));
    assert!(!matches_prefix("clarkson", &NAME_PREFIXES));
}
