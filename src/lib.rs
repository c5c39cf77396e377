#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Uplifters 🪜
//!
//! A Rust library for controlling Uplift standing desks via Bluetooth Low Energy.
//!
//! Uplift desks with the BLE adapter dongle expose a small vendor-specific
//! GATT service. This library turns that raw attribute interface into a typed,
//! stateful desk object: it discovers nearby desks, connects, issues movement
//! commands (raise/lower, drive to the stored sitting or standing preset), and
//! tracks the live height and motion state the control box pushes while the
//! desk moves.
//!
//! ## Reverse Engineering Details
//!
//! The protocol was captured from the BLE traffic of the official Uplift Desk
//! app against a JCP35N-BLT control box:
//!
//! - **Service layout**: one vendor service (`0xFE60`) with a command-write
//!   characteristic (`0xFE61`) and a height-notify characteristic (`0xFE62`)
//! - **Command frames**: fixed 6-byte frames with sync bytes, opcode, and
//!   checksum; the board must be woken before it accepts movement commands
//! - **Height frames**: the notification layout (sync bytes, 16-bit height
//!   field, motion flag) varies between control box revisions, so it is
//!   carried as a configurable [`NotificationProfile`] rather than hard-coded
//!
//! ## Quick Start
//!
//! ```no_run
//! use uplifters::UpliftDesk;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Discover and connect to the first desk found
//!     let desk = UpliftDesk::connect_first().await?;
//!
//!     // Watch height updates as the desk moves
//!     desk.register_callback(|state| {
//!         println!("height update: {state}");
//!     })
//!     .await;
//!
//!     // Drive to the stored standing preset; the desk stops on its own
//!     desk.move_to_standing().await?;
//!
//!     println!("last known height: {:.1}\"", desk.height().await);
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy scanning, connection, and session management
pub mod ble;
/// Main desk control interface
pub mod device;
/// Error types and handling
pub mod error;
/// Command and notification frame codec
pub mod protocol;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::{DeskScanner, DeskSession, DeskTransport, Subscription, SubscriptionHandle};
pub use device::{ObserverHandle, UpliftDesk};
pub use error::{CodecError, ConnectError, DeskError, IoError, Result, ScanError};
pub use protocol::{Command, HeightEndian, NotificationProfile};
pub use types::{ConnectionParams, DeskState, DiscoveredDesk, MoveDirection};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Desk BLE service UUID advertised by the Uplift adapter dongle
///
/// 16-bit assigned number `0xFE60` on the Bluetooth base UUID. Used as the
/// scan filter during discovery.
pub const DESK_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_FE60_0000_1000_8000_0080_5F9B_34FB);

/// Command-write characteristic UUID (`0xFE61`)
///
/// All outbound command frames are written here, without response when the
/// characteristic advertises it.
pub const DESK_CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_FE61_0000_1000_8000_0080_5F9B_34FB);

/// Height-notify characteristic UUID (`0xFE62`)
///
/// The control box pushes height/motion frames through this characteristic
/// while the desk moves; it can also be point-read after a status request.
pub const DESK_HEIGHT_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_FE62_0000_1000_8000_0080_5F9B_34FB);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuids_share_the_bluetooth_base() {
        for uuid in [
            DESK_SERVICE_UUID,
            DESK_CONTROL_CHAR_UUID,
            DESK_HEIGHT_CHAR_UUID,
        ] {
            let text = uuid.to_string();
            assert!(text.starts_with("0000fe6"));
            assert!(text.ends_with("-0000-1000-8000-00805f9b34fb"));
        }
    }
}
