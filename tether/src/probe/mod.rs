//! Debug probe access.
//!
//! The RTT engine only needs a handful of operations from a probe: bring the session up, and read
//! and write target memory. [`ProbeDriver`] captures exactly that, so the engine can run against
//! the vendor library ([`jlink::JLink`]) or, in tests, against a scripted fake.

#[cfg(any(test, feature = "test"))]
mod fake_probe;
pub mod jlink;

#[cfg(any(test, feature = "test"))]
pub use fake_probe::{Access, FakeProbe};

use std::fmt;

use crate::config::WireProtocol;
use jlink::library::LoadError;

/// Errors reported by a debug probe.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ProbeError {
    /// {0}
    Library(#[from] LoadError),

    /// The probe library is incomplete, missing required functions: {display_symbols(_0)}.
    DriverIncomplete(Vec<&'static str>),

    /// Opening the probe failed: {0}
    OpenFailed(String),

    /// '{0}' cannot be passed to the probe library.
    InvalidCommand(String),

    /// Probe command '{command}' failed: {message}
    CommandFailed { command: String, message: String },

    /// Connecting to the target failed (code {0}).
    ConnectFailed(i32),

    /// Reading {len} bytes at {address:#010x} failed (code {code}).
    ReadFailed { address: u32, len: usize, code: i32 },

    /// Writing {len} bytes at {address:#010x} failed (code {code}).
    WriteFailed { address: u32, len: usize, code: i32 },

    /// A transfer of {0} bytes exceeds what the probe library can express.
    TransferTooLarge(usize),
}

fn display_symbols(symbols: &[&'static str]) -> String {
    symbols.join(", ")
}

/// Raw access to target memory.
pub trait MemoryInterface {
    /// Reads `data.len()` bytes starting at `address`.
    fn read(&mut self, address: u32, data: &mut [u8]) -> Result<(), ProbeError>;

    /// Writes `data` starting at `address`.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), ProbeError>;

    /// Reads a little-endian 32 bit word at `address`.
    fn read_word_32(&mut self, address: u32) -> Result<u32, ProbeError> {
        let mut word = [0u8; 4];
        self.read(address, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Writes a little-endian 32 bit word at `address`.
    fn write_word_32(&mut self, address: u32, value: u32) -> Result<(), ProbeError> {
        self.write(address, &value.to_le_bytes())
    }
}

/// RTT transfer implemented inside the probe library.
///
/// The return codes are passed through untouched: negative values are errors, everything else is a
/// byte count (or success for [`NativeRtt::start`]).
pub trait NativeRtt {
    fn start(&mut self) -> i32;
    fn read(&mut self, channel: u32, buffer: &mut [u8]) -> i32;
    fn write(&mut self, channel: u32, data: &[u8]) -> i32;
}

/// A debug probe session.
pub trait ProbeDriver: MemoryInterface + Send + fmt::Debug {
    /// Opens the connection to the probe itself.
    fn open(&mut self) -> Result<(), ProbeError>;

    /// Selects the wire protocol used towards the target.
    fn select_interface(&mut self, protocol: WireProtocol) -> Result<(), ProbeError>;

    /// Passes a configuration command (`"Speed = 4000"`, `"Device = STM32F407VG"`) to the probe.
    fn execute_command(&mut self, command: &str) -> Result<(), ProbeError>;

    /// Attaches to the target.
    fn connect(&mut self) -> Result<(), ProbeError>;

    fn is_connected(&mut self) -> bool;

    /// Returns the native RTT implementation, if the probe library has one.
    fn native_rtt(&mut self) -> Option<&mut dyn NativeRtt>;

    /// Ends the probe session. Must be safe to call more than once.
    fn close(&mut self);
}

/// Creates probe sessions.
pub trait ProbeFactory: Send + Sync + fmt::Debug {
    fn open(&self) -> Result<Box<dyn ProbeDriver>, ProbeError>;
}
