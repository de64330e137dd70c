// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire framing for the DTU protocol.
//!
//! Every message is `header ‖ body`, a fixed 10-byte header followed by a
//! body whose shape is owned by [`crate::protocol::message`]:
//!
//! ```text
//!  0   1   2   3   4   5   6   7   8   9
//! +---+---+---+---+---+---+---+---+---+---+
//! | magic | cmd   | fix   |  crc  |  len  |
//! +---+---+---+---+---+---+---+---+---+---+
//! ```
//!
//! * **magic** – fixed `48 4D`.
//! * **cmd** – command pair: `A3` (or `23` for restart-device) followed by
//!   the opcode byte.
//! * **fix** – fixed `00 01`.
//! * **crc** – CRC-16/MODBUS over the body, big-endian.
//! * **len** – total frame length (header + body), big-endian.

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use zerocopy::{BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, U16};

use crate::error::ProtocolError;

/// First byte of the command pair for every request except restart-device.
pub const CMD_PREFIX_NORMAL: u8 = 0xA3;
/// First byte of the command pair for the restart-device request.
pub const CMD_PREFIX_RESTART: u8 = 0x23;

/// Opcode byte (second byte of the command pair).
pub mod opcode {
    pub const GET_CONFIG: u8 = 0x09;
    pub const REAL_DATA_NEW: u8 = 0x11;
    pub const APP_GET_HIST_POWER: u8 = 0x15;
    pub const COMMAND: u8 = 0x05;
}

pub const HEADER_LEN: usize = 10;
/// Header + body must never exceed this; matches the tightest body the
/// schema ever produces plus slack, per the source device's buffer sizing.
pub const MAX_FRAME_LEN: usize = 210;
pub const MAX_BODY_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

const MAGIC: [u8; 2] = [0x48, 0x4D];
const FIXED_SUBFIELD: [u8; 2] = [0x00, 0x01];

fn crc16_modbus() -> Crc<u16> {
    Crc::<u16>::new(&CRC_16_MODBUS)
}

/// Zero-copy view over the 10-byte wire header.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    pub magic: [u8; 2],
    pub cmd_prefix: u8,
    pub opcode: u8,
    pub fixed: [u8; 2],
    pub crc: U16<BigEndian>,
    pub total_len: U16<BigEndian>,
}

impl FrameHeader {
    pub fn opcode_pair(&self) -> (u8, u8) {
        (self.cmd_prefix, self.opcode)
    }
}

/// Encodes a complete frame for `opcode` (using [`CMD_PREFIX_NORMAL`] unless
/// `restart` is set) wrapping `body`.
pub fn encode_frame(opcode: u8, restart: bool, body: &[u8]) -> Result<Bytes, ProtocolError> {
    if body.len() > MAX_BODY_LEN {
        return Err(ProtocolError::FrameTooLarge {
            body_len: body.len(),
            max: MAX_BODY_LEN,
        });
    }

    let crc = crc16_modbus().checksum(body);
    let total_len = (HEADER_LEN + body.len()) as u16;

    let header = FrameHeader {
        magic: MAGIC,
        cmd_prefix: if restart { CMD_PREFIX_RESTART } else { CMD_PREFIX_NORMAL },
        opcode,
        fixed: FIXED_SUBFIELD,
        crc: U16::new(crc),
        total_len: U16::new(total_len),
    };

    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    out.put_slice(header.as_bytes());
    out.put_slice(body);
    Ok(out.freeze())
}

/// A decoded frame: the opcode pair from the header and the body slice
/// (the header's own 10 bytes are not re-exposed, matching the source
/// device's `onDataReceived`, which never looks at them past dispatch).
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub cmd_prefix: u8,
    pub opcode: u8,
    pub body: Bytes,
}

/// Parses one complete frame out of `buf`. `buf` must contain exactly one
/// frame (`total_len` bytes); the connection manager is responsible for
/// slicing the byte stream on the length field before calling this.
///
/// CRC is accepted but not enforced by default, matching the source device,
/// which never validates the CRC of inbound frames; call
/// [`decode_frame_checked`] where verification is wanted.
pub fn decode_frame(buf: &Bytes) -> Result<DecodedFrame, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::FrameInvalid {
            reason: format!("frame shorter than header: {} bytes", buf.len()),
        });
    }
    let header = FrameHeader::ref_from_bytes(&buf[..HEADER_LEN]).map_err(|e| {
        ProtocolError::FrameInvalid {
            reason: format!("malformed header: {e}"),
        }
    })?;
    if header.magic != MAGIC {
        return Err(ProtocolError::FrameInvalid {
            reason: format!("bad magic: {:02x?}", header.magic),
        });
    }
    let total_len = header.total_len.get() as usize;
    if total_len != buf.len() {
        return Err(ProtocolError::FrameInvalid {
            reason: format!("length mismatch: header says {total_len}, got {}", buf.len()),
        });
    }

    Ok(DecodedFrame {
        cmd_prefix: header.cmd_prefix,
        opcode: header.opcode,
        body: buf.slice(HEADER_LEN..total_len),
    })
}

/// Same as [`decode_frame`] but also validates the CRC-16/MODBUS over the
/// body, returning [`ProtocolError::CrcMismatch`] on a mismatch.
pub fn decode_frame_checked(buf: &Bytes) -> Result<DecodedFrame, ProtocolError> {
    let decoded = decode_frame(buf)?;
    let header = FrameHeader::ref_from_bytes(&buf[..HEADER_LEN]).map_err(|e| {
        ProtocolError::FrameInvalid {
            reason: format!("malformed header: {e}"),
        }
    })?;
    let expected = header.crc.get();
    let actual = crc16_modbus().checksum(&decoded.body);
    if expected != actual {
        return Err(ProtocolError::CrcMismatch { expected, actual });
    }
    Ok(decoded)
}

/// Reads the `total_len` field out of a (potentially partial) header prefix,
/// so a stream reader knows how many more bytes to buffer before calling
/// [`decode_frame`]. Returns `None` if fewer than [`HEADER_LEN`] bytes are
/// available yet.
pub fn peek_total_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let header = FrameHeader::ref_from_bytes(&buf[..HEADER_LEN]).ok()?;
    Some(header.total_len.get() as usize)
}
