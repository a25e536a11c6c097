//! Wire frame layout: a metadata byte, a message key and a payload, framed with a trailing
//! length field.
//!
//! Layout, in order: one metadata byte (bits 6-7 = message type, bits 0-5 preserved verbatim
//! and round-tripped untouched), a 16-bit little-endian message key, the payload bytes, and a
//! trailing 32-bit little-endian total frame length. All multi-byte integers are little-endian.

use crate::error::FrameError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// The two type bits packed into the metadata byte's bits 6-7.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    Default,
    VarTracking,
    Event,
    Control,
}

impl MessageType {
    #[inline]
    fn from_bits(bits: u8) -> MessageType {
        match bits {
            0b00 => MessageType::Default,
            0b01 => MessageType::VarTracking,
            0b10 => MessageType::Event,
            0b11 => MessageType::Control,
            _ => unreachable!("bits masked to 2 bits"),
        }
    }

    #[inline]
    fn to_bits(self) -> u8 {
        match self {
            MessageType::Default => 0b00,
            MessageType::VarTracking => 0b01,
            MessageType::Event => 0b10,
            MessageType::Control => 0b11,
        }
    }
}

/// The metadata byte: message type in the top two bits, six reserved bits preserved verbatim
/// so callers that don't understand them can still round-trip a frame untouched.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Metadata(u8);

impl Metadata {
    pub fn new(message_type: MessageType, reserved_bits: u8) -> Metadata {
        Metadata((message_type.to_bits() << 6) | (reserved_bits & 0x3F))
    }

    #[inline]
    pub fn message_type(self) -> MessageType {
        MessageType::from_bits((self.0 >> 6) & 0b11)
    }

    #[inline]
    pub fn reserved_bits(self) -> u8 {
        self.0 & 0x3F
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn from_byte(byte: u8) -> Metadata {
        Metadata(byte)
    }
}

/// A decoded frame header: metadata plus the 16-bit message key. The payload is left in the
/// caller's buffer rather than copied here.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub metadata: Metadata,
    pub key: u16,
}

/// Size in bytes of the metadata byte plus the message key, i.e. the minimum a buffer must hold
/// before a frame can be decoded at all.
pub const HEADER_SIZE: usize = 3;

/// Size in bytes of the trailing total-length field.
pub const TRAILER_SIZE: usize = 4;

impl FrameHeader {
    /// Reads a header from `reader`. Returns `FrameError::Incomplete` (never partially consuming
    /// the stream) when fewer than `HEADER_SIZE` bytes are available — the caller is expected to
    /// have already checked this via a peek/buffered length, since `Read` itself has no "how much
    /// is left" notion.
    pub fn read<R: Read>(reader: &mut R) -> Result<FrameHeader, FrameError> {
        let metadata = Metadata::from_byte(reader.read_u8()?);
        let key = reader.read_u16::<LittleEndian>()?;
        Ok(FrameHeader { metadata, key })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), FrameError> {
        writer.write_u8(self.metadata.as_byte())?;
        writer.write_u16::<LittleEndian>(self.key)?;
        Ok(())
    }
}

/// Writes a complete frame: header, payload, and the trailing total-length field. `total_length`
/// is `HEADER_SIZE + payload.len() + TRAILER_SIZE`, written verbatim so a downstream reader can
/// validate the frame's own account of its length against what it actually received.
pub fn write_frame<W: Write>(writer: &mut W, header: FrameHeader, payload: &[u8]) -> Result<(), FrameError> {
    let total_length = HEADER_SIZE
        .checked_add(payload.len())
        .and_then(|n| n.checked_add(TRAILER_SIZE))
        .ok_or(FrameError::SizeOverflow)?;
    if total_length > u32::MAX as usize {
        return Err(FrameError::SizeOverflow);
    }

    header.write(writer)?;
    writer.write_all(payload)?;
    writer.write_u32::<LittleEndian>(total_length as u32)?;
    Ok(())
}
