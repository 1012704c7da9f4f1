// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! XMODEM protocol constants and frame codec

use std::time::Duration;
use thiserror::Error;

/// Start of header - begins a 128-byte data frame
pub const SOH: u8 = 0x01;

/// End of transmission - sender has no more blocks
pub const EOT: u8 = 0x04;

/// Acknowledge - receiver accepted the last frame (or EOT)
pub const ACK: u8 = 0x06;

/// Not acknowledge - receiver rejected the last frame, or requests checksum mode
pub const NAK: u8 = 0x15;

/// Cancel - defined by the protocol, logged but never acted on
pub const CAN: u8 = 0x18;

/// 'C' - receiver requests CRC-16 mode
pub const CRC_REQUEST: u8 = b'C';

/// Payload bytes carried by every frame
pub const BLOCK_SIZE: usize = 128;

/// Filler for the tail of a short final block (CP/M end of file)
pub const PAD_BYTE: u8 = 0x1A;

/// SOH + block number + complement
pub const HEADER_SIZE: usize = 3;

// ============================================================================
// Verification
// ============================================================================

/// 8-bit additive checksum.
pub fn checksum(block: &[u8]) -> u8 {
    block.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// CRC-16/XMODEM: polynomial 0x1021, initial value 0, MSB first, no final XOR.
pub fn crc16(block: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in block {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Block verification mode, fixed for a whole session by negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Checksum,
    Crc16,
}

impl Verification {
    pub fn from_use_crc(use_crc: bool) -> Self {
        if use_crc { Verification::Crc16 } else { Verification::Checksum }
    }

    /// Byte the receiver repeats while negotiating, and the one the sender waits for.
    pub fn init_byte(self) -> u8 {
        match self {
            Verification::Checksum => NAK,
            Verification::Crc16 => CRC_REQUEST,
        }
    }

    /// Length of the verification field that trails the payload.
    pub fn field_len(self) -> usize {
        match self {
            Verification::Checksum => 1,
            Verification::Crc16 => 2,
        }
    }

    pub fn compute(self, block: &[u8]) -> Vec<u8> {
        match self {
            Verification::Checksum => vec![checksum(block)],
            Verification::Crc16 => crc16(block).to_be_bytes().to_vec(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Verification::Checksum => "checksum",
            Verification::Crc16 => "CRC-16",
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

pub fn complement(block_number: u8) -> u8 {
    !block_number
}

pub fn complement_ok(block_number: u8, complement: u8) -> bool {
    block_number.wrapping_add(complement) == 0xFF
}

/// Copy a chunk of at most `BLOCK_SIZE` bytes into a full block, filling the rest with `PAD_BYTE`.
pub fn pad_block(chunk: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut block = [PAD_BYTE; BLOCK_SIZE];
    let n = chunk.len().min(BLOCK_SIZE);
    block[..n].copy_from_slice(&chunk[..n]);
    block
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame does not start with SOH")]
    MissingHeader,

    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("block number 0x{block:02X} does not match complement 0x{complement:02X}")]
    BadComplement { block: u8, complement: u8 },

    #[error("verification mismatch")]
    VerificationMismatch,
}

/// One data block as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub block_number: u8,
    pub payload: [u8; BLOCK_SIZE],
}

impl Frame {
    pub fn new(block_number: u8, chunk: &[u8]) -> Self {
        Frame {
            block_number,
            payload: pad_block(chunk),
        }
    }

    pub fn wire_len(verification: Verification) -> usize {
        HEADER_SIZE + BLOCK_SIZE + verification.field_len()
    }

    pub fn encode(&self, verification: Verification) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::wire_len(verification));
        out.push(SOH);
        out.push(self.block_number);
        out.push(complement(self.block_number));
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&verification.compute(&self.payload));
        out
    }

    pub fn decode(bytes: &[u8], verification: Verification) -> Result<Frame, FrameError> {
        if bytes.first() != Some(&SOH) {
            return Err(FrameError::MissingHeader);
        }

        let expected = Self::wire_len(verification);
        if bytes.len() >= HEADER_SIZE && !complement_ok(bytes[1], bytes[2]) {
            return Err(FrameError::BadComplement { block: bytes[1], complement: bytes[2] });
        }
        if bytes.len() < expected {
            return Err(FrameError::Truncated { expected, actual: bytes.len() });
        }

        let mut payload = [0u8; BLOCK_SIZE];
        payload.copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + BLOCK_SIZE]);

        let received = &bytes[HEADER_SIZE + BLOCK_SIZE..expected];
        if verification.compute(&payload) != received {
            return Err(FrameError::VerificationMismatch);
        }

        Ok(Frame {
            block_number: bytes[1],
            payload,
        })
    }
}

// ============================================================================
// Timing
// ============================================================================

/// Protocol timers. The defaults are the classic XMODEM values.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// How often the receiver repeats its negotiation byte
    pub init_interval: Duration,
    /// How long the receiver waits for the first SOH or EOT before giving up
    pub negotiation_timeout: Duration,
    /// Timeout applied to every channel read
    pub read_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            init_interval: Duration::from_secs(3),
            negotiation_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
