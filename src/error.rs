// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Failures raised by the pure frame/message codec layer.
///
/// These never carry I/O state; they describe why a buffer could not be
/// turned into (or out of) the wire format.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame body too large: {body_len} bytes (max {max})")]
    FrameTooLarge { body_len: usize, max: usize },

    #[error("frame invalid: {reason}")]
    FrameInvalid { reason: String },

    #[error("frame crc mismatch: expected 0x{expected:04x}, got 0x{actual:04x}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("message decode failed: {reason}")]
    MessageDecode { reason: String },

    #[error("message encode failed: {reason}")]
    MessageEncode { reason: String },
}
