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

use std::io::ErrorKind;
use std::time::{Duration, Instant};
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Byte channel used by both protocol engines.
///
/// `read_timeout` blocks for at most `timeout` and reports silence either as
/// an `ErrorKind::TimedOut` error or as a zero-length read.
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    /// Read a single byte, `None` on timeout.
    fn read_byte(&mut self, timeout: Duration) -> std::io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.read_timeout(&mut buf, timeout) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fill `buf` with whatever arrives before `timeout` runs out.
    /// A count below `buf.len()` means the peer went quiet mid-way.
    fn read_up_to(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;

        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.read_timeout(&mut buf[filled..], remaining.max(Duration::from_millis(1))) {
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e),
            }
            if filled < buf.len() && Instant::now() >= deadline {
                break;
            }
        }

        Ok(filled)
    }

    /// Discard incoming bytes until the line stays quiet for `timeout`.
    /// Returns the number of bytes thrown away.
    fn purge(&mut self, timeout: Duration) -> std::io::Result<usize> {
        let mut buf = [0u8; 256];
        let mut discarded = 0;

        loop {
            match self.read_timeout(&mut buf, timeout) {
                Ok(0) => return Ok(discarded),
                Ok(n) => discarded += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(discarded),
                Err(e) => return Err(e),
            }
        }
    }
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_secs(1))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port.set_timeout(timeout)
            .map_err(std::io::Error::other)?;
        self.port.read(buf)
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // Data to return on reads (None = timeout)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
        }
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        // Out of responses = timeout
        if self.read_pos >= self.read_buffer.len() {
            return Err(std::io::Error::new(ErrorKind::TimedOut, "Mock timeout"));
        }

        // If current response is None = timeout
        if self.read_buffer[self.read_pos].is_none() {
            self.read_pos += 1;
            return Err(std::io::Error::new(ErrorKind::TimedOut, "Mock timeout"));
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() && self.read_pos < self.read_buffer.len() {
            match self.read_buffer[self.read_pos] {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                    self.read_pos += 1;
                }
                None => break,  // Stop at timeout marker
            }
        }

        Ok(bytes_read)
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}

// ============================================================================
// Loopback Ports for Testing
// ============================================================================

/// One end of an in-memory null-modem cable.
#[cfg(test)]
pub struct LoopbackPort {
    tx: std::sync::mpsc::Sender<u8>,
    rx: std::sync::mpsc::Receiver<u8>,
}

/// Two ports wired back to back: bytes written on one are read from the other.
#[cfg(test)]
pub fn loopback_pair() -> (LoopbackPort, LoopbackPort) {
    let (a_tx, b_rx) = std::sync::mpsc::channel();
    let (b_tx, a_rx) = std::sync::mpsc::channel();
    (
        LoopbackPort { tx: a_tx, rx: a_rx },
        LoopbackPort { tx: b_tx, rx: b_rx },
    )
}

#[cfg(test)]
impl SerialPort for LoopbackPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        for &byte in buf {
            self.tx.send(byte)
                .map_err(|_| std::io::Error::new(ErrorKind::BrokenPipe, "Loopback peer closed"))?;
        }
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        use std::sync::mpsc::RecvTimeoutError;

        if buf.is_empty() {
            return Ok(0);
        }

        match self.rx.recv_timeout(timeout) {
            Ok(byte) => buf[0] = byte,
            Err(RecvTimeoutError::Timeout) => {
                return Err(std::io::Error::new(ErrorKind::TimedOut, "Loopback timeout"));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(std::io::Error::new(ErrorKind::BrokenPipe, "Loopback peer closed"));
            }
        }

        let mut bytes_read = 1;
        while bytes_read < buf.len() {
            match self.rx.try_recv() {
                Ok(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                }
                Err(_) => break,
            }
        }

        Ok(bytes_read)
    }
}

/// Flips every bit of one outgoing byte, once, to simulate line noise.
#[cfg(test)]
pub struct CorruptingPort<P: SerialPort> {
    inner: P,
    corrupt_at: Option<usize>,
    written: usize,
}

#[cfg(test)]
impl<P: SerialPort> CorruptingPort<P> {
    pub fn new(inner: P, corrupt_at: usize) -> Self {
        CorruptingPort {
            inner,
            corrupt_at: Some(corrupt_at),
            written: 0,
        }
    }
}

#[cfg(test)]
impl<P: SerialPort> SerialPort for CorruptingPort<P> {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let mut out = buf.to_vec();
        if let Some(offset) = self.corrupt_at {
            if offset >= self.written && offset < self.written + buf.len() {
                out[offset - self.written] ^= 0xFF;
                self.corrupt_at = None;
            }
        }
        self.written += buf.len();
        self.inner.write_all(&out)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.inner.read_timeout(buf, timeout)
    }
}

// ============================================================================
// Tests
// ============================================================================
