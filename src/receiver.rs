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
use std::io::Write;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use crate::serial::SerialPort;
use crate::protocol::*;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no transmission from sender within {0:?}")]
    NegotiationTimeout(Duration),

    #[error("Transfer complete")]
    TransferComplete,
}

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ReceiverOptions {
    pub verification: Verification,
    pub timing: Timing,
    /// Re-acknowledge a repeat of the last accepted block instead of writing it twice
    pub strict_sequence: bool,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        ReceiverOptions {
            verification: Verification::Crc16,
            timing: Timing::default(),
            strict_sequence: false,
        }
    }
}

// ============================================================================
// States
// ============================================================================

pub struct Negotiating;
pub struct WaitBlockOrEot;
pub struct ReceiveBlockNumber;
pub struct ReceiveBlock;
pub struct VerifyBlock;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    sink: Box<dyn Write + Send>,
    options: ReceiverOptions,
    frame: Vec<u8>,
    expected_block: u8,
    last_accepted: Option<u8>,
    blocks_written: usize,
    next_init: Instant,
    negotiation_deadline: Instant,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            serial: self.serial,
            sink: self.sink,
            options: self.options,
            frame: self.frame,
            expected_block: self.expected_block,
            last_accepted: self.last_accepted,
            blocks_written: self.blocks_written,
            next_init: self.next_init,
            negotiation_deadline: self.negotiation_deadline,
        })
    }

    fn io_error(&self, e: std::io::Error) -> ReceiverError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        ReceiverError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }

    /// Reject the frame in progress and go back to waiting for a header.
    fn reject(mut self) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        self.frame.clear();
        self.serial.write_all(&[NAK]).map_err(|e| self.io_error(e))?;
        debug!("Sent: NAK");
        let next = self.transition::<WaitBlockOrEot>();
        Ok(next as Box<dyn ReceiverState>)
    }

    /// Start assembling a frame whose SOH has just been read.
    fn begin_frame(mut self) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        self.frame.clear();
        self.frame.push(SOH);
        let next = self.transition::<ReceiveBlockNumber>();
        Ok(next as Box<dyn ReceiverState>)
    }

    /// EOT received: flush the sink, acknowledge and stop.
    fn finish(mut self) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        self.sink.flush().map_err(|e| self.io_error(e))?;
        self.serial.write_all(&[ACK]).map_err(|e| self.io_error(e))?;
        debug!("Sent: ACK (EOT)");
        info!(blocks = self.blocks_written, "Received EOT, transfer complete");
        Err(ReceiverError::TransferComplete)
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<Negotiating> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;
        let timing = fsm.options.timing;

        let now = Instant::now();
        if now >= fsm.next_init {
            let init = fsm.options.verification.init_byte();
            fsm.serial.write_all(&[init]).map_err(|e| fsm.io_error(e))?;
            debug!("Sent: init 0x{:02X}", init);
            fsm.next_init = now + timing.init_interval;
        }

        match fsm.serial.read_byte(timing.read_timeout).map_err(|e| fsm.io_error(e))? {
            Some(SOH) => {
                info!("Sender started, receiving with {}", fsm.options.verification.name());
                return fsm.begin_frame();
            }
            Some(EOT) => {
                info!("Sender has nothing to send");
                return fsm.finish();
            }
            Some(byte) => debug!("Ignoring 0x{:02X} while negotiating", byte),
            None => {}
        }

        if Instant::now() >= fsm.negotiation_deadline {
            warn!("Timed out waiting for sender");
            return Err(ReceiverError::NegotiationTimeout(timing.negotiation_timeout));
        }

        Ok(Box::new(fsm) as Box<dyn ReceiverState>)
    }
}

impl ReceiverState for ReceiverFsm<WaitBlockOrEot> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        match fsm.serial.read_byte(fsm.options.timing.read_timeout).map_err(|e| fsm.io_error(e))? {
            Some(SOH) => {
                debug!("Received: SOH, expecting block {}", fsm.expected_block);
                fsm.begin_frame()
            }
            Some(EOT) => fsm.finish(),
            Some(CAN) => {
                warn!("Received CAN, cancel is not supported; ignoring");
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Some(byte) => {
                warn!("Unexpected byte 0x{:02X}, waiting for SOH or EOT", byte);
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            None => {
                debug!("Timeout waiting for SOH or EOT");
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
        }
    }
}

impl ReceiverState for ReceiverFsm<ReceiveBlockNumber> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;
        let read_timeout = fsm.options.timing.read_timeout;

        let mut header = [0u8; 2];
        let n = fsm.serial.read_up_to(&mut header, read_timeout).map_err(|e| fsm.io_error(e))?;
        if n < header.len() {
            warn!("Truncated block header");
            return fsm.reject();
        }

        let [block, comp] = header;
        if !complement_ok(block, comp) {
            warn!("Block number 0x{:02X} does not match complement 0x{:02X}", block, comp);
            let discarded = fsm.serial.purge(read_timeout).map_err(|e| fsm.io_error(e))?;
            debug!("Discarded {} bytes of the damaged frame", discarded);
            return fsm.reject();
        }

        fsm.frame.extend_from_slice(&header);
        let next = fsm.transition::<ReceiveBlock>();
        Ok(next as Box<dyn ReceiverState>)
    }
}

impl ReceiverState for ReceiverFsm<ReceiveBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        let mut payload = [0u8; BLOCK_SIZE];
        let n = fsm.serial.read_up_to(&mut payload, fsm.options.timing.read_timeout)
            .map_err(|e| fsm.io_error(e))?;
        if n < BLOCK_SIZE {
            warn!("Truncated block: {} of {} bytes", n, BLOCK_SIZE);
            return fsm.reject();
        }

        fsm.frame.extend_from_slice(&payload);
        let next = fsm.transition::<VerifyBlock>();
        Ok(next as Box<dyn ReceiverState>)
    }
}

impl ReceiverState for ReceiverFsm<VerifyBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;
        let verification = fsm.options.verification;

        let mut field = vec![0u8; verification.field_len()];
        let n = fsm.serial.read_up_to(&mut field, fsm.options.timing.read_timeout)
            .map_err(|e| fsm.io_error(e))?;
        if n < field.len() {
            warn!("Truncated {} field", verification.name());
            return fsm.reject();
        }
        fsm.frame.extend_from_slice(&field);

        let frame = match Frame::decode(&fsm.frame, verification) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Rejecting block: {}", e);
                return fsm.reject();
            }
        };

        if fsm.options.strict_sequence && fsm.last_accepted == Some(frame.block_number) {
            info!("Block {} repeated, acknowledging without writing", frame.block_number);
        } else {
            if frame.block_number != fsm.expected_block {
                debug!("Block {} arrived while expecting {}", frame.block_number, fsm.expected_block);
            }
            fsm.sink.write_all(&frame.payload).map_err(|e| fsm.io_error(e))?;
            fsm.blocks_written += 1;
            fsm.last_accepted = Some(frame.block_number);
            fsm.expected_block = fsm.expected_block.wrapping_add(1);
        }

        fsm.frame.clear();
        fsm.serial.write_all(&[ACK]).map_err(|e| fsm.io_error(e))?;
        debug!("Block {} OK, sent: ACK", frame.block_number);

        let next = fsm.transition::<WaitBlockOrEot>();
        Ok(next as Box<dyn ReceiverState>)
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl ReceiverFsm<Negotiating> {
    pub fn new(serial: Box<dyn SerialPort>, sink: Box<dyn Write + Send>, options: ReceiverOptions) -> Box<dyn ReceiverState> {
        let now = Instant::now();
        Box::new(ReceiverFsm {
            state: PhantomData::<Negotiating>,
            serial,
            sink,
            options,
            frame: Vec::with_capacity(Frame::wire_len(options.verification)),
            expected_block: 1,
            last_accepted: None,
            blocks_written: 0,
            next_init: now,
            negotiation_deadline: now + options.timing.negotiation_timeout,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::path::PathBuf;
    use crate::serial::MockSerialPort;

    fn run_receiver(mut fsm: Box<dyn ReceiverState>) -> Result<(), ReceiverError> {
        loop {
            match fsm.step() {
                Ok(next) => fsm = next,
                Err(ReceiverError::TransferComplete) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn test_options(verification: Verification) -> ReceiverOptions {
        ReceiverOptions {
            verification,
            timing: Timing {
                init_interval: Duration::from_secs(3),
                negotiation_timeout: Duration::from_secs(60),
                read_timeout: Duration::from_millis(10),
            },
            strict_sequence: false,
        }
    }

    fn push_frame(responses: &mut Vec<Option<u8>>, block: u8, data: &[u8], mode: Verification) {
        for byte in Frame::new(block, data).encode(mode) {
            responses.push(Some(byte));
        }
    }

    fn receive_to_temp(
        name: &str,
        responses: Vec<Option<u8>>,
        expected_writes: Vec<u8>,
        options: ReceiverOptions,
    ) -> (Result<(), ReceiverError>, Vec<u8>) {
        let path: PathBuf = std::env::temp_dir().join(name);
        let sink = File::create(&path).expect("Should create temp file");

        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let result = run_receiver(ReceiverFsm::new(mock_serial, Box::new(sink), options));

        let content = std::fs::read(&path).expect("Should read file");
        std::fs::remove_file(&path).ok();
        (result, content)
    }

    #[test]
    fn test_receiver_checksum_transfer() {
        let mode = Verification::Checksum;
        let mut responses = Vec::new();
        push_frame(&mut responses, 1, b"Test data", mode);
        responses.push(Some(EOT));

        let expected_writes = vec![NAK, ACK, ACK];

        let (result, content) = receive_to_temp("xmodem_rx_checksum.bin", responses, expected_writes, test_options(mode));
        result.expect("Transfer failed");

        assert_eq!(content.len(), BLOCK_SIZE, "Padding is kept");
        assert_eq!(&content[..9], b"Test data");
        assert!(content[9..].iter().all(|&b| b == PAD_BYTE));
    }

    #[test]
    fn test_receiver_crc_multiple_blocks() {
        let mode = Verification::Crc16;
        let mut responses = Vec::new();
        for block_num in 0..3usize {
            let block: Vec<u8> = (0..BLOCK_SIZE).map(|i| ((block_num * BLOCK_SIZE + i) % 256) as u8).collect();
            push_frame(&mut responses, block_num as u8 + 1, &block, mode);
        }
        responses.push(Some(EOT));

        let expected_writes = vec![CRC_REQUEST, ACK, ACK, ACK, ACK];

        let (result, content) = receive_to_temp("xmodem_rx_multi.bin", responses, expected_writes, test_options(mode));
        result.expect("Transfer failed");

        assert_eq!(content.len(), 384, "File should be 3 blocks (384 bytes)");
        for (i, &byte) in content.iter().enumerate() {
            assert_eq!(byte, (i % 256) as u8, "Byte at position {} should match", i);
        }
    }

    #[test]
    fn test_receiver_empty_transfer() {
        let responses = vec![Some(EOT)];
        let expected_writes = vec![NAK, ACK];

        let (result, content) = receive_to_temp("xmodem_rx_empty.bin", responses, expected_writes, test_options(Verification::Checksum));
        result.expect("Transfer failed");
        assert!(content.is_empty());
    }

    #[test]
    fn test_receiver_negotiation_repeats_init() {
        let mode = Verification::Crc16;
        let mut options = test_options(mode);
        options.timing.init_interval = Duration::ZERO;

        let mut responses = vec![None, None];
        push_frame(&mut responses, 1, b"abc", mode);
        responses.push(Some(EOT));

        let expected_writes = vec![CRC_REQUEST, CRC_REQUEST, CRC_REQUEST, ACK, ACK];

        let (result, content) = receive_to_temp("xmodem_rx_init_retry.bin", responses, expected_writes, options);
        result.expect("Transfer failed");
        assert_eq!(&content[..3], b"abc");
    }

    #[test]
    fn test_receiver_negotiation_waits_for_interval() {
        let mode = Verification::Crc16;

        // Silence and noise inside one init interval do not trigger another 'C'
        let mut responses = vec![None, Some(0x55), None];
        push_frame(&mut responses, 1, b"abc", mode);
        responses.push(Some(EOT));

        let expected_writes = vec![CRC_REQUEST, ACK, ACK];

        let (result, _) = receive_to_temp("xmodem_rx_init_interval.bin", responses, expected_writes, test_options(mode));
        result.expect("Transfer failed");
    }

    #[test]
    fn test_receiver_negotiation_timeout() {
        let mut options = test_options(Verification::Crc16);
        options.timing.negotiation_timeout = Duration::ZERO;

        let responses = vec![None];
        let expected_writes = vec![CRC_REQUEST];

        let (result, content) = receive_to_temp("xmodem_rx_timeout.bin", responses, expected_writes, options);
        match result {
            Err(ReceiverError::NegotiationTimeout(d)) => assert_eq!(d, Duration::ZERO),
            other => panic!("Expected negotiation timeout, got {:?}", other),
        }
        assert!(content.is_empty(), "Nothing written on timeout");
    }

    #[test]
    fn test_receiver_bad_checksum_retry() {
        let mode = Verification::Checksum;
        let mut responses = Vec::new();

        let mut bad = Frame::new(1, b"Bad cs").encode(mode);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        responses.extend(bad.into_iter().map(Some));

        push_frame(&mut responses, 1, b"Bad cs", mode);
        responses.push(Some(EOT));

        let expected_writes = vec![NAK, NAK, ACK, ACK];

        let (result, content) = receive_to_temp("xmodem_rx_badcs.bin", responses, expected_writes, test_options(mode));
        result.expect("Transfer failed");
        assert_eq!(content.len(), BLOCK_SIZE, "Block written exactly once");
        assert_eq!(&content[..6], b"Bad cs");
    }

    #[test]
    fn test_receiver_bad_crc_retry() {
        let mode = Verification::Crc16;
        let mut responses = Vec::new();

        let mut bad = Frame::new(1, b"payload").encode(mode);
        bad[20] ^= 0x01;
        responses.extend(bad.into_iter().map(Some));

        push_frame(&mut responses, 1, b"payload", mode);
        responses.push(Some(EOT));

        let expected_writes = vec![CRC_REQUEST, NAK, ACK, ACK];

        let (result, content) = receive_to_temp("xmodem_rx_badcrc.bin", responses, expected_writes, test_options(mode));
        result.expect("Transfer failed");
        assert_eq!(&content[..7], b"payload");
        assert_eq!(content.len(), BLOCK_SIZE);
    }

    #[test]
    fn test_receiver_bad_complement_purges_frame() {
        let mode = Verification::Crc16;
        let mut responses = Vec::new();

        let mut bad = Frame::new(1, b"data").encode(mode);
        bad[2] = 0x00;
        responses.extend(bad.into_iter().map(Some));
        responses.push(None);

        push_frame(&mut responses, 1, b"data", mode);
        responses.push(Some(EOT));

        let expected_writes = vec![CRC_REQUEST, NAK, ACK, ACK];

        let (result, content) = receive_to_temp("xmodem_rx_complement.bin", responses, expected_writes, test_options(mode));
        result.expect("Transfer failed");
        assert_eq!(content.len(), BLOCK_SIZE);
        assert_eq!(&content[..4], b"data");
    }

    #[test]
    fn test_receiver_truncated_block() {
        let mode = Verification::Checksum;
        let mut responses = vec![Some(SOH), Some(1), Some(0xFE)];
        responses.extend(std::iter::repeat(Some(b'x')).take(50));
        responses.push(None);

        push_frame(&mut responses, 1, b"complete", mode);
        responses.push(Some(EOT));

        let expected_writes = vec![NAK, NAK, ACK, ACK];

        let (result, content) = receive_to_temp("xmodem_rx_truncated.bin", responses, expected_writes, test_options(mode));
        result.expect("Transfer failed");
        assert_eq!(&content[..8], b"complete");
        assert_eq!(content.len(), BLOCK_SIZE);
    }

    #[test]
    fn test_receiver_ignores_noise_and_silence() {
        let mode = Verification::Crc16;
        let mut responses = Vec::new();
        push_frame(&mut responses, 1, b"first", mode);
        responses.push(Some(0x55));
        responses.push(None);
        responses.push(Some(CAN));
        push_frame(&mut responses, 2, b"second", mode);
        responses.push(Some(EOT));

        let expected_writes = vec![CRC_REQUEST, ACK, ACK, ACK];

        let (result, content) = receive_to_temp("xmodem_rx_noise.bin", responses, expected_writes, test_options(mode));
        result.expect("Transfer failed");
        assert_eq!(content.len(), 2 * BLOCK_SIZE);
        assert_eq!(&content[..5], b"first");
        assert_eq!(&content[BLOCK_SIZE..BLOCK_SIZE + 6], b"second");
    }

    #[test]
    fn test_receiver_accepts_wrapped_block_numbers() {
        let mode = Verification::Checksum;
        let mut responses = Vec::new();
        push_frame(&mut responses, 255, b"before wrap", mode);
        push_frame(&mut responses, 0, b"after wrap", mode);
        responses.push(Some(EOT));

        let expected_writes = vec![NAK, ACK, ACK, ACK];

        let (result, content) = receive_to_temp("xmodem_rx_wrap.bin", responses, expected_writes, test_options(mode));
        result.expect("Transfer failed");
        assert_eq!(&content[BLOCK_SIZE..BLOCK_SIZE + 10], b"after wrap");
    }

    #[test]
    fn test_receiver_repeated_block_lenient() {
        let mode = Verification::Crc16;
        let mut responses = Vec::new();
        push_frame(&mut responses, 1, b"again", mode);
        push_frame(&mut responses, 1, b"again", mode);
        responses.push(Some(EOT));

        let expected_writes = vec![CRC_REQUEST, ACK, ACK, ACK];

        let (result, content) = receive_to_temp("xmodem_rx_dup_lenient.bin", responses, expected_writes, test_options(mode));
        result.expect("Transfer failed");
        assert_eq!(content.len(), 2 * BLOCK_SIZE, "Repeat is written again");
    }

    #[test]
    fn test_receiver_repeated_block_strict() {
        let mode = Verification::Crc16;
        let mut options = test_options(mode);
        options.strict_sequence = true;

        let mut responses = Vec::new();
        push_frame(&mut responses, 1, b"again", mode);
        push_frame(&mut responses, 1, b"again", mode);
        push_frame(&mut responses, 2, b"next", mode);
        responses.push(Some(EOT));

        let expected_writes = vec![CRC_REQUEST, ACK, ACK, ACK, ACK];

        let (result, content) = receive_to_temp("xmodem_rx_dup_strict.bin", responses, expected_writes, options);
        result.expect("Transfer failed");
        assert_eq!(content.len(), 2 * BLOCK_SIZE, "Repeat is acknowledged but not written");
        assert_eq!(&content[..5], b"again");
        assert_eq!(&content[BLOCK_SIZE..BLOCK_SIZE + 4], b"next");
    }

    /// Sink on a full disk.
    struct FullSink;

    impl Write for FullSink {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::StorageFull, "no space left"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_receiver_sink_error_names_state() {
        let mode = Verification::Crc16;
        let mut responses = Vec::new();
        push_frame(&mut responses, 1, b"lost", mode);

        // The block is never acknowledged
        let mock_serial = Box::new(MockSerialPort::new(responses, vec![CRC_REQUEST]));
        let result = run_receiver(ReceiverFsm::new(mock_serial, Box::new(FullSink), test_options(mode)));

        match result {
            Err(ReceiverError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::StorageFull);
                assert!(e.to_string().contains("VerifyBlock"), "got {}", e);
            }
            other => panic!("Expected I/O error, got {:?}", other),
        }
    }
}
