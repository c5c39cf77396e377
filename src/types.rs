use btleplug::api::BDAddr;
use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

/// Last known state of a connected desk
///
/// Height is stored in inches, converted once at decode time from the raw
/// hardware units carried by the notification frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeskState {
    /// Current desk height in inches
    pub height: f64,
    /// Whether the desk reports that it is currently in motion
    pub moving: bool,
}

impl fmt::Display for DeskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1}\" ({})",
            self.height,
            if self.moving { "moving" } else { "stationary" }
        )
    }
}

/// A desk controller seen during a discovery scan
///
/// Immutable once produced; consumed to open a [`crate::ble::DeskSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDesk {
    /// Link-layer address of the desk controller
    pub address: BDAddr,
    /// Advertised display name
    pub name: String,
    /// When the advertisement was first seen during the scan
    pub first_seen: SystemTime,
}

impl fmt::Display for DiscoveredDesk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.name, self.address)
    }
}

/// Direction of a hold-to-move command currently in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    /// Desk is being driven upwards
    Raise,
    /// Desk is being driven downwards
    Lower,
}

impl fmt::Display for MoveDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raise => write!(f, "raise"),
            Self::Lower => write!(f, "lower"),
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Scan timeout in milliseconds
    pub scan_timeout_ms: u64,
    /// Connection establishment timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-operation (read/write/subscribe) timeout in milliseconds
    pub op_timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
            op_timeout_ms: 3_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desk_state_default() {
        let state = DeskState::default();
        assert!((state.height - 0.0).abs() < f64::EPSILON);
        assert!(!state.moving);
    }

    #[test]
    fn test_desk_state_display() {
        let state = DeskState {
            height: 34.5,
            moving: true,
        };
        assert_eq!(format!("{state}"), "34.5\" (moving)");
    }

    #[test]
    fn test_discovered_desk_display() {
        let desk = DiscoveredDesk {
            address: BDAddr::from([0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]),
            name: "Uplift Desk".to_string(),
            first_seen: SystemTime::UNIX_EPOCH,
        };
        let shown = format!("{desk}");
        assert!(shown.starts_with("Uplift Desk - "));
    }

    #[test]
    fn test_connection_params_default() {
        let params = ConnectionParams::default();
        assert_eq!(params.scan_timeout_ms, 10_000);
        assert_eq!(params.connect_timeout_ms, 15_000);
        assert_eq!(params.op_timeout_ms, 3_000);
    }
}
