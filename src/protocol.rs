use crate::{error::CodecError, types::DeskState};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Command frame size in bytes
pub const COMMAND_FRAME_SIZE: usize = 6;

/// Sync bytes opening every command frame
pub const COMMAND_FRAME_HEADER: [u8; 2] = [0xF1, 0xF1];

/// Trailer byte closing every command frame
pub const COMMAND_FRAME_TRAILER: u8 = 0x7E;

/// Movement and status commands understood by the desk controller board
///
/// Opcodes were captured from the BLE traffic of the official Uplift Desk app
/// against a JCP35N-BLT control box. Every command is carried in a fixed
/// 6-byte frame; none of them take parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Wake the controller board; the desk ignores movement commands while
    /// its inactivity timeout has expired, so a wake frame precedes every
    /// other command. The board only cares that a valid frame arrived.
    Wake = 0x00,
    /// Start raising the desk (hold-to-move start edge)
    RaiseStart = 0x01,
    /// Start lowering the desk (hold-to-move start edge)
    LowerStart = 0x02,
    /// Drive autonomously to the stored sitting preset
    GotoSitting = 0x05,
    /// Drive autonomously to the stored standing preset
    GotoStanding = 0x06,
    /// Ask the board to refresh the height characteristic for a point read
    StatusRequest = 0x07,
    /// Stop a raise in progress (hold-to-move release edge)
    RaiseStop = 0x0A,
    /// Stop a lower in progress (hold-to-move release edge)
    LowerStop = 0x0B,
}

impl Command {
    /// Opcode carried in byte 2 of the command frame
    #[must_use]
    pub const fn opcode(self) -> u8 {
        self as u8
    }

    /// Convert from an opcode byte
    #[must_use]
    pub const fn from_opcode(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Wake),
            0x01 => Some(Self::RaiseStart),
            0x02 => Some(Self::LowerStart),
            0x05 => Some(Self::GotoSitting),
            0x06 => Some(Self::GotoStanding),
            0x07 => Some(Self::StatusRequest),
            0x0A => Some(Self::RaiseStop),
            0x0B => Some(Self::LowerStop),
            _ => None,
        }
    }
}

/// Encode a command into its outbound write payload
///
/// Frame layout: `[0xF1, 0xF1, opcode, param_len, checksum, 0x7E]` where
/// `param_len` is always zero for the commands above and the checksum is
/// `opcode + param_len` (mod 256). Pure and total; no I/O.
#[must_use]
pub fn encode_command(cmd: Command) -> Bytes {
    let mut buf = BytesMut::with_capacity(COMMAND_FRAME_SIZE);

    let param_len = 0u8;
    buf.put_slice(&COMMAND_FRAME_HEADER);
    buf.put_u8(cmd.opcode());
    buf.put_u8(param_len);
    buf.put_u8(cmd.opcode().wrapping_add(param_len));
    buf.put_u8(COMMAND_FRAME_TRAILER);

    buf.freeze()
}

/// Decode a command frame back into its [`Command`]
///
/// Reference inverse of [`encode_command`]; validates sync bytes, trailer,
/// checksum, and opcode.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the frame does not match the layout.
pub fn decode_command(data: &[u8]) -> Result<Command, CodecError> {
    if data.len() != COMMAND_FRAME_SIZE {
        return Err(CodecError::Malformed(format!(
            "command frame is {} bytes, expected {COMMAND_FRAME_SIZE}",
            data.len()
        )));
    }

    if data[0..2] != COMMAND_FRAME_HEADER {
        return Err(CodecError::Malformed(format!(
            "bad frame header {:02X?}",
            &data[0..2]
        )));
    }

    if data[COMMAND_FRAME_SIZE - 1] != COMMAND_FRAME_TRAILER {
        return Err(CodecError::Malformed(format!(
            "bad frame trailer {:02X}",
            data[COMMAND_FRAME_SIZE - 1]
        )));
    }

    let opcode = data[2];
    let param_len = data[3];
    if data[4] != opcode.wrapping_add(param_len) {
        return Err(CodecError::Malformed(format!(
            "checksum {:02X} does not match opcode {opcode:02X}",
            data[4]
        )));
    }

    Command::from_opcode(opcode)
        .ok_or_else(|| CodecError::Malformed(format!("unknown opcode {opcode:02X}")))
}

/// Byte order of the height field inside a notification frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeightEndian {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

/// Layout of the height/motion notification frame
///
/// The exact framing varies between desk models and control box revisions, so
/// it is carried as configuration rather than hard-coded in the decoder. Bytes
/// not named by a profile field are ignored on decode and zeroed on encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationProfile {
    /// Sync bytes expected at the start of the frame
    pub sync: [u8; 2],
    /// Total frame length in bytes
    pub frame_len: usize,
    /// Offset of the 16-bit raw height field
    pub height_offset: usize,
    /// Byte order of the raw height field
    pub height_endian: HeightEndian,
    /// Offset of the motion flag byte (non-zero means moving)
    pub moving_offset: usize,
    /// Raw height units per inch; division converts to the canonical unit
    pub raw_units_per_inch: f64,
    /// Lowest height the desk can physically travel to, in inches
    pub min_height_in: f64,
    /// Highest height the desk can physically travel to, in inches
    pub max_height_in: f64,
}

impl NotificationProfile {
    /// Reference profile for the Uplift V2 frame (JCP35N-BLT control box)
    ///
    /// Height is reported as a little-endian `u16` in tenths of an inch at
    /// offset 4, with the motion flag at offset 6. Travel range matches the
    /// V2 frame's published 25.2" - 50.8" limits.
    #[must_use]
    pub const fn uplift_v2() -> Self {
        Self {
            sync: [0xF2, 0xF2],
            frame_len: 8,
            height_offset: 4,
            height_endian: HeightEndian::Little,
            moving_offset: 6,
            raw_units_per_inch: 10.0,
            min_height_in: 25.2,
            max_height_in: 50.8,
        }
    }

    /// Check that the frame layout is internally consistent
    ///
    /// Profiles typically arrive from configuration, so the codec refuses a
    /// layout whose named fields fall outside the frame instead of trusting
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if `frame_len` cannot hold the sync
    /// bytes, the height field, or the motion flag.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.frame_len < 2 {
            return Err(CodecError::Malformed(format!(
                "frame length {} cannot hold the sync bytes",
                self.frame_len
            )));
        }

        if self.height_offset + 2 > self.frame_len || self.moving_offset >= self.frame_len {
            return Err(CodecError::Malformed(format!(
                "profile field offsets exceed frame length {}",
                self.frame_len
            )));
        }

        Ok(())
    }
}

impl Default for NotificationProfile {
    fn default() -> Self {
        Self::uplift_v2()
    }
}

/// Decode an inbound height notification payload into a [`DeskState`]
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the profile layout is inconsistent or
/// the payload length or sync bytes do not match it, or
/// [`CodecError::OutOfRange`] if the decoded height falls outside the
/// profile's travel range. Callers must leave their existing state untouched
/// on error.
pub fn decode_height_notification(
    profile: &NotificationProfile,
    data: &[u8],
) -> Result<DeskState, CodecError> {
    profile.validate()?;

    if data.len() != profile.frame_len {
        return Err(CodecError::Malformed(format!(
            "notification frame is {} bytes, expected {}",
            data.len(),
            profile.frame_len
        )));
    }

    if data[0..2] != profile.sync {
        return Err(CodecError::Malformed(format!(
            "bad sync bytes {:02X?}",
            &data[0..2]
        )));
    }

    let raw_bytes = [data[profile.height_offset], data[profile.height_offset + 1]];
    let raw = match profile.height_endian {
        HeightEndian::Little => u16::from_le_bytes(raw_bytes),
        HeightEndian::Big => u16::from_be_bytes(raw_bytes),
    };

    let height = f64::from(raw) / profile.raw_units_per_inch;
    if height < profile.min_height_in || height > profile.max_height_in {
        return Err(CodecError::OutOfRange {
            height,
            min: profile.min_height_in,
            max: profile.max_height_in,
        });
    }

    let moving = data[profile.moving_offset] != 0;

    Ok(DeskState { height, moving })
}

/// Encode a height/motion pair into a notification frame
///
/// Deterministic inverse of [`decode_height_notification`] for heights on the
/// profile's raw grid. Exists for tests and desk simulators; the library never
/// sends one of these frames itself.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the profile layout is inconsistent.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn encode_height_notification(
    profile: &NotificationProfile,
    height: f64,
    moving: bool,
) -> Result<Vec<u8>, CodecError> {
    profile.validate()?;

    let mut frame = vec![0u8; profile.frame_len];
    frame[0..2].copy_from_slice(&profile.sync);

    let raw = (height * profile.raw_units_per_inch).round().max(0.0) as u16;
    let raw_bytes = match profile.height_endian {
        HeightEndian::Little => raw.to_le_bytes(),
        HeightEndian::Big => raw.to_be_bytes(),
    };
    frame[profile.height_offset..profile.height_offset + 2].copy_from_slice(&raw_bytes);
    frame[profile.moving_offset] = u8::from(moving);

    Ok(frame)
}
