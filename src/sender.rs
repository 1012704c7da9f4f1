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

use std::marker::PhantomData;
use std::io::{ErrorKind, Read};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use crate::serial::SerialPort;
use crate::protocol::*;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gave up on block {block} after {attempts} retries")]
    RetriesExhausted { block: u8, attempts: u32 },

    #[error("EOT not acknowledged after {attempts} retries")]
    EotRetriesExhausted { attempts: u32 },

    #[error("Transfer complete")]
    TransferComplete,
}

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct SenderOptions {
    pub verification: Verification,
    pub timing: Timing,
    /// Delay in milliseconds between bytes of a frame
    pub byte_delay: u8,
    /// Resends allowed per frame (and for EOT) before giving up; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        SenderOptions {
            verification: Verification::Crc16,
            timing: Timing::default(),
            byte_delay: 0,
            max_retries: None,
        }
    }
}

// ============================================================================
// States
// ============================================================================

pub struct WaitForInit;
pub struct PrepareBlock;
pub struct TransmitFrame;
pub struct AwaitResponse;
pub struct SendEot;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    source: Box<dyn Read + Send>,
    options: SenderOptions,
    block_number: u8,
    frame: Vec<u8>,
    retries: u32,
    blocks_sent: usize,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            serial: self.serial,
            source: self.source,
            options: self.options,
            block_number: self.block_number,
            frame: self.frame,
            retries: self.retries,
            blocks_sent: self.blocks_sent,
        })
    }

    fn io_error(&self, e: std::io::Error) -> SenderError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        SenderError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }

    fn read_response(&mut self) -> Result<Option<u8>, SenderError> {
        self.serial.read_byte(self.options.timing.read_timeout).map_err(|e| self.io_error(e))
    }

    /// Count one resend, true once the configured limit is passed.
    fn retries_exhausted(&mut self) -> bool {
        self.retries += 1;
        self.options.max_retries.is_some_and(|max| self.retries > max)
    }

    fn count_block_retry(&mut self) -> Result<(), SenderError> {
        if self.retries_exhausted() {
            warn!("Giving up on block {} after {} retries", self.block_number, self.retries);
            return Err(SenderError::RetriesExhausted {
                block: self.block_number,
                attempts: self.retries,
            });
        }
        Ok(())
    }

    fn count_eot_retry(&mut self) -> Result<(), SenderError> {
        if self.retries_exhausted() {
            warn!("Giving up on EOT after {} retries", self.retries);
            return Err(SenderError::EotRetriesExhausted { attempts: self.retries });
        }
        Ok(())
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<WaitForInit> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;
        let init = fsm.options.verification.init_byte();

        match fsm.read_response()? {
            Some(byte) if byte == init => {
                info!("Receiver ready, sending with {}", fsm.options.verification.name());

                // Repeated init bytes queued behind this one would read as NAKs of block 1
                let stale = fsm.serial.purge(fsm.options.timing.read_timeout)
                    .map_err(|e| fsm.io_error(e))?;
                if stale > 0 {
                    debug!("Discarded {} queued init bytes", stale);
                }

                let next = fsm.transition::<PrepareBlock>();
                Ok(next as Box<dyn SenderState>)
            }
            Some(byte) => {
                debug!("Ignoring 0x{:02X}, waiting for init 0x{:02X}", byte, init);
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            None => {
                debug!("Receiver not ready");
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
        }
    }
}

impl SenderState for SenderFsm<PrepareBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;
        fsm.retries = 0;

        let mut chunk = [0u8; BLOCK_SIZE];
        let bytes_read = read_chunk(&mut *fsm.source, &mut chunk)?;

        if bytes_read == 0 {
            info!(blocks = fsm.blocks_sent, "No more data, sending EOT");
            let next = fsm.transition::<SendEot>();
            return Ok(next as Box<dyn SenderState>);
        }

        fsm.frame = Frame::new(fsm.block_number, &chunk[..bytes_read])
            .encode(fsm.options.verification);
        debug!("Prepared block {} ({} bytes)", fsm.block_number, bytes_read);

        let next = fsm.transition::<TransmitFrame>();
        Ok(next as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<TransmitFrame> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        if fsm.options.byte_delay > 0 {
            // Byte by byte so slow receivers don't overrun
            let delay = Duration::from_millis(fsm.options.byte_delay as u64);
            for &byte in &fsm.frame {
                fsm.serial.write_all(&[byte]).map_err(|e| fsm.io_error(e))?;
                std::thread::sleep(delay);
            }
        } else {
            fsm.serial.write_all(&fsm.frame).map_err(|e| fsm.io_error(e))?;
        }
        debug!("Sent: block {}", fsm.block_number);

        let next = fsm.transition::<AwaitResponse>();
        Ok(next as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<AwaitResponse> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        match fsm.read_response()? {
            Some(ACK) => {
                debug!("Received: ACK for block {}", fsm.block_number);
                fsm.blocks_sent += 1;
                fsm.block_number = fsm.block_number.wrapping_add(1);
                let next = fsm.transition::<PrepareBlock>();
                Ok(next as Box<dyn SenderState>)
            }
            Some(NAK) => {
                warn!("Block {} rejected, resending", fsm.block_number);
                fsm.count_block_retry()?;
                let next = fsm.transition::<TransmitFrame>();
                Ok(next as Box<dyn SenderState>)
            }
            None => {
                warn!("No response to block {}, resending", fsm.block_number);
                fsm.count_block_retry()?;
                let next = fsm.transition::<TransmitFrame>();
                Ok(next as Box<dyn SenderState>)
            }
            Some(CAN) => {
                warn!("Received CAN, cancel is not supported; ignoring");
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            Some(byte) => {
                warn!("Unexpected 0x{:02X}, waiting for ACK or NAK", byte);
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
        }
    }
}

impl SenderState for SenderFsm<SendEot> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        fsm.serial.write_all(&[EOT]).map_err(|e| fsm.io_error(e))?;
        debug!("Sent: EOT");

        match fsm.read_response()? {
            Some(ACK) => {
                info!(blocks = fsm.blocks_sent, "EOT acknowledged, transfer complete");
                Err(SenderError::TransferComplete)
            }
            Some(byte) => {
                debug!("Expected ACK for EOT, got 0x{:02X}", byte);
                fsm.count_eot_retry()?;
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            None => {
                debug!("No response to EOT");
                fsm.count_eot_retry()?;
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
        }
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl SenderFsm<WaitForInit> {
    pub fn new(serial: Box<dyn SerialPort>, source: Box<dyn Read + Send>, options: SenderOptions) -> Box<dyn SenderState> {
        Box::new(SenderFsm {
            state: PhantomData::<WaitForInit>,
            serial,
            source,
            options,
            block_number: 1,
            frame: Vec::with_capacity(Frame::wire_len(options.verification)),
            retries: 0,
            blocks_sent: 0,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Read until `buf` is full or the source is exhausted.
fn read_chunk(source: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ============================================================================
// Tests
// ============================================================================
