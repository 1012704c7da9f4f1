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

// XMODEM protocol implementation
mod protocol;
mod sender;
mod receiver;
mod serial;

use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use protocol::{Timing, Verification};
use receiver::{ReceiverError, ReceiverOptions};
use sender::{SenderError, SenderOptions};
use serial::{RealSerialPort, SerialPort};

/// Head start given to the receiver in `pair` mode
const STARTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "xmodem")]
#[command(about = "XMODEM file transfer over RS-232 (checksum and CRC-16)", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "9600")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// Use the 8-bit additive checksum instead of CRC-16 (both peers must agree)
    #[arg(long)]
    checksum: bool,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file using XMODEM
    Send {
        /// File to send
        file: PathBuf,

        /// Delay in milliseconds between sending each byte of a frame
        #[arg(long, default_value = "0", value_name = "MS")]
        byte_delay: u8,

        /// Give up after this many resends of one block (default: retry forever)
        #[arg(long, value_name = "N")]
        max_retries: Option<u32>,
    },
    /// Receive a file using XMODEM
    Receive {
        /// Where to write the received data
        file: PathBuf,

        /// Acknowledge a repeated block without writing it again
        #[arg(long)]
        strict: bool,
    },
    /// Run a receiver on --port and a sender on --sender-port at the same time
    Pair {
        /// File to send
        file: PathBuf,

        /// Where to write the received data
        output: PathBuf,

        /// Serial port the sender uses
        #[arg(long)]
        sender_port: String,

        /// Acknowledge a repeated block without writing it again
        #[arg(long)]
        strict: bool,

        /// Delay in milliseconds between sending each byte of a frame
        #[arg(long, default_value = "0", value_name = "MS")]
        byte_delay: u8,

        /// Give up after this many resends of one block (default: retry forever)
        #[arg(long, value_name = "N")]
        max_retries: Option<u32>,
    },
}

struct PortSettings {
    baud: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_port(name: &str, settings: &PortSettings) -> Box<dyn SerialPort> {
    println!("Opening serial port: {}", name);
    match RealSerialPort::open(name, settings.baud, settings.data_bits, settings.parity, settings.stop_bits) {
        Ok(port) => Box::new(port),
        Err(e) => {
            eprintln!("Failed to open serial port {}: {}", name, e);
            std::process::exit(1);
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let settings = match (
        parse_data_bits(cli.data_bits),
        parse_parity(&cli.parity),
        parse_stop_bits(cli.stop_bits),
    ) {
        (Ok(data_bits), Ok(parity), Ok(stop_bits)) => PortSettings {
            baud: cli.baud,
            data_bits,
            parity,
            stop_bits,
        },
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let verification = Verification::from_use_crc(!cli.checksum);
    println!(
        "Settings: {} baud, {:?}, {:?}, {:?}, {}",
        settings.baud, settings.data_bits, settings.parity, settings.stop_bits, verification.name()
    );

    match cli.command {
        Commands::Send { file, byte_delay, max_retries } => {
            let serial_port = open_port(&cli.port, &settings);
            let options = SenderOptions { verification, timing: Timing::default(), byte_delay, max_retries };

            println!("\nSending file: {}", file.display());
            if let Err(e) = send_file(serial_port, &file, options) {
                eprintln!("Send failed: {}", e);
                std::process::exit(1);
            }
            println!("\nFile sent successfully!");
        }
        Commands::Receive { file, strict } => {
            let serial_port = open_port(&cli.port, &settings);
            let options = ReceiverOptions { verification, timing: Timing::default(), strict_sequence: strict };

            println!("\nReceiving to: {}", file.display());
            if let Err(e) = receive_file(serial_port, &file, options) {
                eprintln!("Receive failed: {}", e);
                std::process::exit(1);
            }
            println!("\nFile received successfully!");
        }
        Commands::Pair { file, output, sender_port, strict, byte_delay, max_retries } => {
            let receiver_port = open_port(&cli.port, &settings);
            let sender_port = open_port(&sender_port, &settings);

            println!("\nSending {} -> {}", file.display(), output.display());
            let (received, sent) = run_pair(
                receiver_port,
                &output,
                ReceiverOptions { verification, timing: Timing::default(), strict_sequence: strict },
                sender_port,
                &file,
                SenderOptions { verification, timing: Timing::default(), byte_delay, max_retries },
                STARTLE_DELAY,
            );

            let mut failed = false;
            if let Err(e) = received {
                eprintln!("Receive failed: {}", e);
                failed = true;
            }
            if let Err(e) = sent {
                eprintln!("Send failed: {}", e);
                failed = true;
            }
            if failed {
                std::process::exit(1);
            }
            println!("\nTransfer completed successfully!");
        }
    }
}

fn send_file(serial_port: Box<dyn SerialPort>, file: &Path, options: SenderOptions) -> Result<(), SenderError> {
    use sender::SenderFsm;

    if !file.exists() {
        return Err(SenderError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("File not found: {}", file.display()),
        )));
    }

    let source = File::open(file)?;
    let mut state = SenderFsm::new(serial_port, Box::new(source), options);

    loop {
        match state.step() {
            Ok(next_state) => {
                state = next_state;
            }
            Err(SenderError::TransferComplete) => {
                return Ok(());
            }
            Err(e) => {
                return Err(e);
            }
        }
    }
}

fn receive_file(serial_port: Box<dyn SerialPort>, file: &Path, options: ReceiverOptions) -> Result<(), ReceiverError> {
    use receiver::ReceiverFsm;

    let sink = BufWriter::new(File::create(file)?);
    let mut state = ReceiverFsm::new(serial_port, Box::new(sink), options);

    loop {
        match state.step() {
            Ok(next_state) => {
                state = next_state;
            }
            Err(ReceiverError::TransferComplete) => {
                return Ok(());
            }
            Err(e) => {
                if matches!(e, ReceiverError::NegotiationTimeout(_)) {
                    // Nothing was received, don't leave an empty file behind
                    std::fs::remove_file(file).ok();
                }
                return Err(e);
            }
        }
    }
}

/// Run a receiver and a sender side by side, each on its own thread.
fn run_pair(
    receiver_port: Box<dyn SerialPort>,
    output: &Path,
    receiver_options: ReceiverOptions,
    sender_port: Box<dyn SerialPort>,
    file: &Path,
    sender_options: SenderOptions,
    startle_delay: Duration,
) -> (Result<(), ReceiverError>, Result<(), SenderError>) {
    let output = output.to_path_buf();
    let file = file.to_path_buf();

    let receiver = std::thread::spawn(move || receive_file(receiver_port, &output, receiver_options));
    std::thread::sleep(startle_delay);
    let sender = std::thread::spawn(move || send_file(sender_port, &file, sender_options));

    let sent = sender.join().unwrap_or_else(|_| {
        Err(SenderError::Io(std::io::Error::other("sender thread panicked")))
    });
    let received = receiver.join().unwrap_or_else(|_| {
        Err(ReceiverError::Io(std::io::Error::other("receiver thread panicked")))
    });

    (received, sent)
}

// ============================================================================
// Tests
// ============================================================================
