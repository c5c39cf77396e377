use thiserror::Error;

/// Errors raised while establishing a connection to a desk controller
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The desk, or its expected GATT service/characteristics, could not be found
    #[error("desk service or characteristics not found")]
    NotFound,

    /// The link did not establish within the configured timeout
    #[error("connection timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The Bluetooth stack rejected the connection attempt
    #[error("link refused: {0}")]
    LinkRefused(#[from] btleplug::Error),
}

/// Errors raised by read/write/subscribe operations on a live session
#[derive(Error, Debug)]
pub enum IoError {
    /// The session has been disconnected (explicitly or by link loss)
    #[error("session disconnected")]
    Disconnected,

    /// The operation did not complete within the configured timeout
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The Bluetooth stack rejected the operation
    #[error("operation rejected: {0}")]
    Rejected(String),
}

/// Errors raised while decoding desk protocol payloads
#[derive(Error, Debug)]
pub enum CodecError {
    /// Payload length or sync markers do not match the frame profile
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Decoded height falls outside the desk's documented travel range
    #[error("height {height:.1}\" outside travel range ({min:.1}\" - {max:.1}\")")]
    OutOfRange {
        /// Decoded height in inches
        height: f64,
        /// Minimum travel height in inches
        min: f64,
        /// Maximum travel height in inches
        max: f64,
    },
}

/// Errors raised while scanning for desks
#[derive(Error, Debug)]
pub enum ScanError {
    /// No usable Bluetooth adapter exists on this host
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,

    /// The Bluetooth stack failed during the scan
    #[error("scan failed: {0}")]
    Radio(#[from] btleplug::Error),
}

/// Umbrella error for desk operations
#[derive(Error, Debug)]
pub enum DeskError {
    /// Connection establishment failed
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Session I/O failed
    #[error(transparent)]
    Io(#[from] IoError),

    /// Payload decoding failed
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Device scanning failed
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// No desk was found during discovery
    #[error("no desk found")]
    NoDeskFound,
}

/// Result type for desk operations
pub type Result<T, E = DeskError> = std::result::Result<T, E>;

impl DeskError {
    /// Check if this error indicates the link to the desk is gone
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Io(IoError::Disconnected) | Self::NoDeskFound
        )
    }

    /// Check if this error is recoverable by retrying the operation
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io(IoError::Timeout { .. }) | Self::Connect(ConnectError::Timeout { .. })
        )
    }
}
