//! Real-Time Transfer through a debug probe.
//!
//! [`RttEngine`] owns one probe session. After attaching it either hands the up channel over to
//! the probe library's own RTT implementation, or falls back to [`soft::SoftRtt`], which decodes
//! the target's ring buffer with plain memory reads.
//!
//! ```text
//! Idle -> Opening -> Connecting -> NativeActive | SoftActive -> Closed
//!            \            \
//!             `-----------`--> Failed
//! ```

mod descriptor;
pub mod soft;

use std::fmt;
use std::thread;

pub use crate::config::ScanWindow;
pub use descriptor::{BufferDescriptor, RTT_SIGNATURE};

use crate::config::{RttConfig, RttParams};
use crate::probe::{ProbeDriver, ProbeError, ProbeFactory};
use soft::SoftRtt;

/// Error type for RTT operations.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum Error {
    /// Error communicating with the probe: {0}
    Probe(#[from] ProbeError),

    /// RTT control block not found in {start:#010x}..{end:#010x}. Make sure RTT is initialized on the target.
    ControlBlockNotFound { start: u32, end: u64 },

    /// The control block at {control_block:#010x} has no initialized up channel yet.
    ChannelNotInitialized { control_block: u32 },

    /// The control block has been corrupted: {0}
    ControlBlockCorrupted(String),

    /// The ring buffer offsets are out of bounds (write {write}, read {read}, size {size}).
    OffsetsOutOfBounds { write: u32, read: u32, size: u32 },

    /// Software RTT has not been initialized.
    NotInitialized,

    /// The operation is not possible while the RTT engine is {0}.
    InvalidState(EngineState),

    /// The probe is no longer connected (native RTT read returned {0}).
    ProbeLost(i32),

    /// The native RTT write failed with code {0}.
    NativeWriteFailed(i32),

    /// RTT could not be recovered after {attempts} attempts: {last}
    RecoveryFailed { attempts: usize, last: Box<Error> },
}

/// Lifecycle of an [`RttEngine`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Opening,
    Connecting,
    NativeActive,
    SoftActive,
    Closed,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineState::Idle => "idle",
            EngineState::Opening => "opening",
            EngineState::Connecting => "connecting",
            EngineState::NativeActive => "active (native)",
            EngineState::SoftActive => "active (software)",
            EngineState::Closed => "closed",
            EngineState::Failed => "failed",
        })
    }
}

/// How the up channel is served once connected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RttMode {
    /// The probe library implements RTT itself.
    Native,
    /// The ring buffer is decoded by [`SoftRtt`].
    Software,
}

/// Up channel used for the byte stream.
const CHANNEL: u32 = 0;

/// A probe session producing the target's RTT byte stream.
#[derive(Debug)]
pub struct RttEngine {
    driver: Option<Box<dyn ProbeDriver>>,
    config: RttConfig,
    state: EngineState,
    soft: SoftRtt,
    failed_polls: usize,
    failed_reinits: usize,
}

impl RttEngine {
    pub fn new(config: RttConfig) -> Self {
        let soft = SoftRtt::new(config.scan, config.max_read_per_poll);
        Self {
            driver: None,
            config,
            state: EngineState::Idle,
            soft,
            failed_polls: 0,
            failed_reinits: 0,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The active transfer mode, if connected.
    pub fn mode(&self) -> Option<RttMode> {
        match self.state {
            EngineState::NativeActive => Some(RttMode::Native),
            EngineState::SoftActive => Some(RttMode::Software),
            _ => None,
        }
    }

    /// Loads the probe driver.
    pub fn open(&mut self, factory: &dyn ProbeFactory) -> Result<(), Error> {
        if !matches!(self.state, EngineState::Idle | EngineState::Closed) {
            return Err(Error::InvalidState(self.state));
        }

        self.state = EngineState::Opening;
        match factory.open() {
            Ok(driver) => {
                tracing::debug!("Probe driver loaded: {driver:?}");
                self.driver = Some(driver);
                Ok(())
            }
            Err(error) => {
                self.state = EngineState::Failed;
                Err(error.into())
            }
        }
    }

    /// Attaches to the target and decides between native and software RTT.
    ///
    /// On failure the probe session is closed again and the engine is [`EngineState::Failed`].
    pub fn connect(&mut self, params: &RttParams) -> Result<RttMode, Error> {
        if self.state != EngineState::Opening {
            return Err(Error::InvalidState(self.state));
        }

        self.state = EngineState::Connecting;
        match self.attach(params) {
            Ok(mode) => {
                self.state = match mode {
                    RttMode::Native => EngineState::NativeActive,
                    RttMode::Software => EngineState::SoftActive,
                };
                self.failed_polls = 0;
                self.failed_reinits = 0;
                Ok(mode)
            }
            Err(error) => {
                tracing::debug!("RTT connect failed: {error}");
                if let Some(mut driver) = self.driver.take() {
                    driver.close();
                }
                self.state = EngineState::Failed;
                Err(error)
            }
        }
    }

    fn attach(&mut self, params: &RttParams) -> Result<RttMode, Error> {
        let Some(driver) = self.driver.as_deref_mut() else {
            return Err(Error::InvalidState(self.state));
        };

        driver.open()?;
        driver.select_interface(params.interface)?;
        driver.execute_command(&format!("Speed = {}", params.speed_khz))?;
        driver.execute_command(&format!("Device = {}", params.chip_name))?;
        driver.connect()?;
        tracing::debug!(
            "Attached to {} over {} at {} kHz",
            params.chip_name,
            params.interface,
            params.speed_khz
        );

        // The firmware sets up its control block after reset; looking too early finds zeroed RAM.
        thread::sleep(self.config.settle_delay);

        if let Some(native) = driver.native_rtt() {
            let code = native.start();
            if code >= 0 {
                tracing::info!("Using native RTT");
                return Ok(RttMode::Native);
            }
            tracing::debug!("Native RTT start returned {code}, falling back to software RTT");
        }

        let attempts = self.config.init_attempts.max(1);
        let mut attempt = 1;
        loop {
            tracing::debug!("Initializing software RTT (attempt {attempt})...");
            match self.soft.initialize(driver) {
                Ok(()) => {
                    tracing::info!("Using software RTT");
                    return Ok(RttMode::Software);
                }
                Err(error) if attempt < attempts => {
                    tracing::debug!("Failed to initialize RTT: {error}. Retrying.");
                    attempt += 1;
                    thread::sleep(self.config.init_retry_delay);
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Takes the next chunk of the up channel. `None` means nothing is pending right now.
    ///
    /// In software mode a failing poll is retried on the next call. After
    /// `corruption_threshold` failures in a row the control block is searched again, and once
    /// `max_reinit_attempts` searches have failed the engine gives up with
    /// [`Error::RecoveryFailed`].
    pub fn read(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let state = self.state;
        let Some(driver) = self.driver.as_deref_mut() else {
            return Err(Error::InvalidState(state));
        };

        match state {
            EngineState::NativeActive => {
                let Some(native) = driver.native_rtt() else {
                    return Err(Error::InvalidState(state));
                };
                let mut buffer = vec![0u8; self.config.native_read_size.max(1)];
                let count = native.read(CHANNEL, &mut buffer);
                if count < 0 {
                    if !driver.is_connected() {
                        tracing::warn!("Probe lost, native RTT read returned {count}");
                        self.state = EngineState::Failed;
                        return Err(Error::ProbeLost(count));
                    }
                    tracing::trace!("Native RTT read returned {count}");
                    return Ok(None);
                }
                if count == 0 {
                    return Ok(None);
                }
                buffer.truncate(count as usize);
                Ok(Some(buffer))
            }
            EngineState::SoftActive => match self.soft.poll(driver) {
                Ok(data) => {
                    self.failed_polls = 0;
                    self.failed_reinits = 0;
                    Ok(data)
                }
                Err(error) => self.recover(error),
            },
            _ => Err(Error::InvalidState(state)),
        }
    }

    fn recover(&mut self, error: Error) -> Result<Option<Vec<u8>>, Error> {
        self.failed_polls += 1;
        tracing::debug!(
            "RTT poll failed ({} in a row): {error}",
            self.failed_polls
        );

        if self.failed_polls < self.config.corruption_threshold.max(1) {
            return Ok(None);
        }
        self.failed_polls = 0;

        let Some(driver) = self.driver.as_deref_mut() else {
            return Err(Error::InvalidState(self.state));
        };
        match self.soft.reinitialize(driver) {
            Ok(()) => {
                tracing::info!("Software RTT recovered");
                self.failed_reinits = 0;
                Ok(None)
            }
            Err(reinit_error) => {
                self.failed_reinits += 1;
                tracing::warn!(
                    "Re-initializing software RTT failed ({}/{}): {reinit_error}",
                    self.failed_reinits,
                    self.config.max_reinit_attempts
                );
                if self.failed_reinits >= self.config.max_reinit_attempts.max(1) {
                    self.state = EngineState::Failed;
                    return Err(Error::RecoveryFailed {
                        attempts: self.failed_reinits,
                        last: Box::new(reinit_error),
                    });
                }
                Ok(None)
            }
        }
    }

    /// Sends `data` to the target. Software RTT has no down channel and accepts nothing.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let state = self.state;
        let Some(driver) = self.driver.as_deref_mut() else {
            return Err(Error::InvalidState(state));
        };

        match state {
            EngineState::NativeActive => {
                let Some(native) = driver.native_rtt() else {
                    return Err(Error::InvalidState(state));
                };
                let count = native.write(CHANNEL, data);
                if count < 0 {
                    return Err(Error::NativeWriteFailed(count));
                }
                Ok(count as usize)
            }
            EngineState::SoftActive => {
                tracing::trace!("Dropping {} bytes, software RTT is read only", data.len());
                Ok(0)
            }
            _ => Err(Error::InvalidState(state)),
        }
    }

    /// Ends the probe session. Safe to call in any state.
    pub fn close(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            tracing::debug!("Closing probe session");
            driver.close();
        }
        self.soft.invalidate();
        self.state = EngineState::Closed;
    }
}

impl Drop for RttEngine {
    fn drop(&mut self) {
        if self.driver.is_some() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::WireProtocol;
    use super::descriptor::HEADER_SIZE;
    use crate::probe::{Access, FakeProbe};
    use pretty_assertions::assert_eq;

    const RAM: u32 = 0x2000_0000;
    const CB: u32 = 0x2000_0400;
    const BUFFER: u32 = 0x2000_0800;

    fn config() -> RttConfig {
        RttConfig {
            settle_delay: Duration::ZERO,
            init_retry_delay: Duration::ZERO,
            ..RttConfig::default()
        }
    }

    fn params() -> RttParams {
        RttParams {
            chip_name: "STM32F407VG".to_string(),
            speed_khz: 4000,
            interface: WireProtocol::Jtag,
        }
    }

    fn control_block(size: u32, write: u32, read: u32) -> Vec<u8> {
        let mut mem = vec![0u8; HEADER_SIZE];
        mem[..RTT_SIGNATURE.len()].copy_from_slice(RTT_SIGNATURE);
        mem[16..20].copy_from_slice(&1u32.to_le_bytes());
        mem[20..24].copy_from_slice(&1u32.to_le_bytes());
        for word in [0, BUFFER, size, write, read, 0] {
            mem.extend_from_slice(&word.to_le_bytes());
        }
        mem
    }

    fn connected(probe: &FakeProbe) -> RttEngine {
        let mut engine = RttEngine::new(config());
        engine.open(probe).unwrap();
        engine.connect(&params()).unwrap();
        engine
    }

    #[test]
    fn command_sequence() {
        let probe = FakeProbe::new().with_native_rtt(0);
        let engine = connected(&probe);

        assert_eq!(engine.mode(), Some(RttMode::Native));
        assert_eq!(probe.interface(), Some(WireProtocol::Jtag));
        assert_eq!(
            probe.commands(),
            vec!["Speed = 4000".to_string(), "Device = STM32F407VG".to_string()]
        );
    }

    #[test]
    fn native_read_and_write() {
        let probe = FakeProbe::new().with_native_rtt(0);
        let mut engine = connected(&probe);

        assert_eq!(engine.read().unwrap(), None);
        probe.push_native(b"boot ok\n");
        assert_eq!(engine.read().unwrap().unwrap(), b"boot ok\n");

        assert_eq!(engine.write(b"reset").unwrap(), 5);
        assert_eq!(probe.native_written(), b"reset");
    }

    #[test]
    fn native_read_error_with_probe_still_connected() {
        let probe = FakeProbe::new().with_native_rtt(0);
        probe.set_native_idle_code(-1);
        let mut engine = connected(&probe);

        assert_eq!(engine.read().unwrap(), None);
        assert_eq!(engine.state(), EngineState::NativeActive);
    }

    #[test]
    fn unplugged_probe_fails_native_read() {
        let probe = FakeProbe::new().with_native_rtt(0);
        let mut engine = connected(&probe);
        probe.push_native(b"last words");
        assert_eq!(engine.read().unwrap().unwrap(), b"last words");

        probe.set_native_idle_code(-1);
        probe.unplug();

        assert!(matches!(engine.read(), Err(Error::ProbeLost(-1))));
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[test]
    fn native_without_write_entry_point() {
        let probe = FakeProbe::new().with_native_rtt(0).without_native_write();
        let mut engine = connected(&probe);

        assert_eq!(engine.write(b"reset").unwrap(), 0);
    }

    #[test]
    fn failed_native_start_falls_back_to_software() {
        let probe = FakeProbe::new().with_native_rtt(-1).with_ram(RAM, 0x1_0000);
        probe.load(CB, &control_block(128, 3, 0));
        probe.load(BUFFER, b"abc");

        let mut engine = connected(&probe);

        assert_eq!(engine.state(), EngineState::SoftActive);
        assert_eq!(engine.read().unwrap().unwrap(), b"abc");
        assert_eq!(engine.write(b"ignored").unwrap(), 0);
    }

    #[test]
    fn software_init_is_retried() {
        let probe = FakeProbe::new().with_ram(RAM, 0x1_0000);
        // The first scan reads 32 chunks and finds nothing.
        probe.defer_load(33, CB, &control_block(128, 0, 0));

        let engine = connected(&probe);

        assert_eq!(engine.mode(), Some(RttMode::Software));
    }

    #[test]
    fn software_init_gives_up() {
        let probe = FakeProbe::new().with_ram(RAM, 0x1_0000);
        let mut engine = RttEngine::new(config());
        engine.open(&probe).unwrap();

        let error = engine.connect(&params()).unwrap_err();

        assert!(matches!(error, Error::ControlBlockNotFound { .. }));
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(probe.is_closed());
    }

    #[test]
    fn incomplete_driver() {
        let probe = FakeProbe::new().with_missing_symbols(vec!["JLINK_ReadMem"]);
        let mut engine = RttEngine::new(config());

        let error = engine.open(&probe).unwrap_err();

        assert!(matches!(
            error,
            Error::Probe(ProbeError::DriverIncomplete(ref missing)) if missing == &["JLINK_ReadMem"]
        ));
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[test]
    fn probe_open_error() {
        let probe = FakeProbe::new().with_native_rtt(0);
        probe.set_open_error("Cannot connect to J-Link via USB.");
        let mut engine = RttEngine::new(config());
        engine.open(&probe).unwrap();

        let error = engine.connect(&params()).unwrap_err();

        assert!(matches!(
            error,
            Error::Probe(ProbeError::OpenFailed(ref message)) if message == "Cannot connect to J-Link via USB."
        ));
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(probe.is_closed());
        assert!(probe.commands().is_empty());
    }

    #[test]
    fn negative_connect_code() {
        let probe = FakeProbe::new().with_native_rtt(0);
        probe.set_connect_code(-257);
        let mut engine = RttEngine::new(config());
        engine.open(&probe).unwrap();

        assert!(matches!(
            engine.connect(&params()),
            Err(Error::Probe(ProbeError::ConnectFailed(-257)))
        ));
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(probe.is_closed());
    }

    #[test]
    fn corruption_triggers_reinitialization() {
        let probe = FakeProbe::new().with_ram(RAM, 0x1_0000);
        probe.load(CB, &control_block(128, 0, 0));
        let mut engine = connected(&probe);

        // Offsets go bad, then the target comes back with a fresh control block in front of the
        // stale one.
        probe.load(CB + HEADER_SIZE as u32 + 12, &500u32.to_le_bytes());
        assert_eq!(engine.read().unwrap(), None);
        assert_eq!(engine.read().unwrap(), None);

        probe.load(RAM + 0x100, &control_block(128, 2, 0));
        probe.load(BUFFER, b"hi");
        assert_eq!(engine.read().unwrap(), None);

        assert_eq!(engine.read().unwrap().unwrap(), b"hi");
        assert_eq!(engine.state(), EngineState::SoftActive);
    }

    #[test]
    fn transient_poll_failures_keep_the_control_block() {
        let probe = FakeProbe::new().with_ram(RAM, 0x1_0000);
        probe.load(CB, &control_block(128, 0, 0));
        let mut engine = connected(&probe);
        probe.clear_accesses();

        // One failed poll short of the threshold, then the target answers again.
        probe.fail_next_reads(2);
        assert_eq!(engine.read().unwrap(), None);
        assert_eq!(engine.read().unwrap(), None);

        probe.load(CB + HEADER_SIZE as u32 + 12, &3u32.to_le_bytes());
        probe.load(BUFFER, b"ok!");
        assert_eq!(engine.read().unwrap().unwrap(), b"ok!");

        // No rescan happened: every access went to the offsets or the ring buffer.
        assert!(probe.accesses().iter().all(|access| match access {
            Access::Read { address, .. } | Access::Write { address, .. } =>
                *address >= CB + HEADER_SIZE as u32,
        }));
        assert_eq!(engine.state(), EngineState::SoftActive);
    }

    #[test]
    fn lost_target_fails_after_bounded_recovery() {
        let probe = FakeProbe::new().with_ram(RAM, 0x1_0000);
        probe.load(CB, &control_block(128, 0, 0));
        let mut engine = connected(&probe);

        probe.set_reads_failing(true);
        let polls_before_failure = 3 * 3;
        for _ in 1..polls_before_failure {
            assert_eq!(engine.read().unwrap(), None);
        }

        assert!(matches!(
            engine.read(),
            Err(Error::RecoveryFailed { attempts: 3, .. })
        ));
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[test]
    fn operations_require_a_session() {
        let mut engine = RttEngine::new(config());

        assert!(matches!(
            engine.read(),
            Err(Error::InvalidState(EngineState::Idle))
        ));
        assert!(matches!(
            engine.connect(&params()),
            Err(Error::InvalidState(EngineState::Idle))
        ));

        engine.close();
        assert_eq!(engine.state(), EngineState::Closed);
    }
}
