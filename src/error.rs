use crate::sensor::DeviceId;
use std::time::Duration;

/// Errors reported by the codec, the registry and the transport layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("transport failure [{code}]: {reason}")]
    Transport { code: i32, reason: String },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("{field} = {value} does not fit its register field (max {max})")]
    Encoding {
        field: &'static str,
        value: i64,
        max: i64,
    },
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("invalid value: {0}")]
    Validation(String),
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("device {0} is not ready")]
    NotReady(DeviceId),
    #[error("supervisor is no longer running")]
    Closed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn transport(code: i32, reason: impl Into<String>) -> Self {
        Error::Transport {
            code,
            reason: reason.into(),
        }
    }

    /// Transport and timeout failures are retried by the lifecycle and
    /// the poller, everything else goes back to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Timeout(_))
    }
}

impl From<btleplug::Error> for Error {
    fn from(err: btleplug::Error) -> Self {
        use btleplug::Error as Ble;
        let code = match &err {
            Ble::PermissionDenied => 1,
            Ble::DeviceNotFound => 2,
            Ble::NotConnected => 3,
            Ble::NotSupported(_) => 4,
            Ble::TimedOut(duration) => return Error::Timeout(*duration),
            Ble::Uuid(_) => 5,
            Ble::InvalidBDAddr(_) => 6,
            _ => 99,
        };
        Error::transport(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::transport(3, "link lost").is_recoverable());
        assert!(Error::Timeout(Duration::from_millis(200)).is_recoverable());
        assert!(!Error::Validation("empty name".into()).is_recoverable());
        assert!(!Error::Encoding {
            field: "gain",
            value: 8,
            max: 7
        }
        .is_recoverable());
    }

    #[test]
    fn test_btleplug_timeout_maps_to_timeout() {
        let err: Error = btleplug::Error::TimedOut(Duration::from_secs(1)).into();
        assert_eq!(err, Error::Timeout(Duration::from_secs(1)));
    }
}
