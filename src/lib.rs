//! Fleet manager for TinyBLEStat dual-AFE electrochemical sensors.
//!
//! The crate discovers sensors over BLE, keeps one connection lifecycle per
//! device, translates the 8-byte configuration register image and polls
//! telemetry into a shared, copy-on-write [`registry::DeviceRegistry`].

pub mod bluetooth;
pub mod config_worker;
pub mod error;
pub mod export;
pub mod firmware;
pub mod lifecycle;
pub mod poller;
pub mod protocol;
pub mod registry;
pub mod sensor;
pub mod simulator;
pub mod supervisor;

pub mod prelude {
    pub use crate::bluetooth::{BtleTransport, RadioState, Transport, TransportEvent};
    pub use crate::error::{Error, Result};
    pub use crate::lifecycle::{LinkState, Lifecycle};
    pub use crate::registry::DeviceRegistry;
    pub use crate::sensor::{
        AfeConfig, Channel, DeviceConfig, DeviceId, ReferenceSource, SensorRecord,
    };
    pub use crate::simulator::SimTransport;
    pub use crate::supervisor::{Supervisor, SupervisorHandle};
    pub use crate::{bluetooth, export, firmware, protocol};

    use std::time::Duration;

    /// Runtime settings shared by the command line tool and the library.
    #[derive(Clone, Debug)]
    pub struct App {
        pub verbose: u8,
        pub scantime: f32,
        pub name_prefixes: Vec<String>,
        pub poll_period: Duration,
        pub read_timeout: Duration,
        pub connect_timeout: Duration,
        pub telemetry_capacity: usize,
        /// `None` retries failed connections forever.
        pub max_retries: Option<u32>,
    }

    impl Default for App {
        fn default() -> Self {
            Self {
                verbose: 0,
                scantime: 3.0,
                name_prefixes: firmware::NAME_PREFIXES
                    .iter()
                    .map(|p| p.to_string())
                    .collect(),
                poll_period: firmware::POLL_PERIOD,
                read_timeout: firmware::READ_TIMEOUT,
                connect_timeout: firmware::CONNECT_TIMEOUT,
                telemetry_capacity: firmware::TELEMETRY_CAPACITY,
                max_retries: None,
            }
        }
    }
}
