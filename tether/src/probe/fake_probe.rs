#![allow(missing_docs)] // Don't require docs for test code
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{MemoryInterface, NativeRtt, ProbeDriver, ProbeError, ProbeFactory};
use crate::config::WireProtocol;

/// A memory access seen by the fake probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Read { address: u32, len: usize },
    Write { address: u32, data: Vec<u8> },
}

struct Region {
    base: u32,
    data: Vec<u8>,
}

impl Region {
    fn range(&self, address: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(address.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }
}

struct DeferredLoad {
    after_reads: usize,
    address: u32,
    data: Vec<u8>,
}

struct NativeState {
    start_code: i32,
    inbound: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    write_supported: bool,
    idle_read_code: i32,
}

#[derive(Default)]
struct FakeState {
    regions: Vec<Region>,
    accesses: Vec<Access>,
    reads: usize,
    deferred: Vec<DeferredLoad>,
    commands: Vec<String>,
    interface: Option<WireProtocol>,
    open_error: Option<String>,
    connect_code: i32,
    opened: bool,
    closed: bool,
    unplugged: bool,
    fail_reads: bool,
    fail_next_reads: usize,
    fail_writes: bool,
    native: Option<NativeState>,
    missing_symbols: Option<Vec<&'static str>>,
}

impl FakeState {
    fn region_mut(&mut self, address: u32, len: usize) -> Option<(&mut Region, std::ops::Range<usize>)> {
        self.regions
            .iter_mut()
            .find_map(|region| region.range(address, len).map(|range| (region, range)))
    }

    fn apply_deferred(&mut self) {
        let reads = self.reads;
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|load| load.after_reads <= reads);
        self.deferred = pending;

        for load in due {
            store(self, load.address, &load.data);
        }
    }
}

fn store(state: &mut FakeState, address: u32, data: &[u8]) {
    let (region, range) = state
        .region_mut(address, data.len())
        .unwrap_or_else(|| panic!("{address:#010x}+{} is outside the fake RAM", data.len()));
    region.data[range].copy_from_slice(data);
}

/// A scriptable probe with a sparse memory image.
///
/// Clones share their state, so a test can keep one handle for inspection while the engine owns
/// another one.
#[derive(Clone, Default)]
pub struct FakeProbe {
    state: Arc<Mutex<FakeState>>,
}

impl fmt::Debug for FakeProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FakeProbe")
            .field("regions", &state.regions.len())
            .field("native", &state.native.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a zero-filled RAM region.
    pub fn with_ram(self, base: u32, size: usize) -> Self {
        self.state.lock().regions.push(Region {
            base,
            data: vec![0; size],
        });
        self
    }

    /// Makes the probe library offer native RTT, with `start` returning `start_code`.
    pub fn with_native_rtt(self, start_code: i32) -> Self {
        self.state.lock().native = Some(NativeState {
            start_code,
            inbound: VecDeque::new(),
            written: Vec::new(),
            write_supported: true,
            idle_read_code: 0,
        });
        self
    }

    /// Makes opening through the factory fail as if the library lacked `symbols`.
    pub fn with_missing_symbols(self, symbols: Vec<&'static str>) -> Self {
        self.state.lock().missing_symbols = Some(symbols);
        self
    }

    /// Copies `data` into the memory image.
    pub fn load(&self, address: u32, data: &[u8]) {
        store(&mut self.state.lock(), address, data);
    }

    /// Copies `data` into the memory image once `after_reads` memory reads have happened.
    pub fn defer_load(&self, after_reads: usize, address: u32, data: &[u8]) {
        self.state.lock().deferred.push(DeferredLoad {
            after_reads,
            address,
            data: data.to_vec(),
        });
    }

    pub fn memory(&self, address: u32, len: usize) -> Vec<u8> {
        let mut state = self.state.lock();
        let (region, range) = state
            .region_mut(address, len)
            .unwrap_or_else(|| panic!("{address:#010x}+{len} is outside the fake RAM"));
        region.data[range].to_vec()
    }

    pub fn accesses(&self) -> Vec<Access> {
        self.state.lock().accesses.clone()
    }

    pub fn clear_accesses(&self) {
        self.state.lock().accesses.clear();
    }

    pub fn set_open_error(&self, message: impl Into<String>) {
        self.state.lock().open_error = Some(message.into());
    }

    pub fn set_connect_code(&self, code: i32) {
        self.state.lock().connect_code = code;
    }

    /// Makes every memory read fail until reset, like a probe that lost the target.
    pub fn set_reads_failing(&self, failing: bool) {
        self.state.lock().fail_reads = failing;
    }

    /// Makes the next `count` memory reads fail.
    pub fn fail_next_reads(&self, count: usize) {
        self.state.lock().fail_next_reads = count;
    }

    pub fn set_writes_failing(&self, failing: bool) {
        self.state.lock().fail_writes = failing;
    }

    /// Queues bytes for the native RTT read call.
    pub fn push_native(&self, data: &[u8]) {
        if let Some(native) = self.state.lock().native.as_mut() {
            native.inbound.push_back(data.to_vec());
        }
    }

    /// Sets what the native read call returns while nothing is queued.
    pub fn set_native_idle_code(&self, code: i32) {
        if let Some(native) = self.state.lock().native.as_mut() {
            native.idle_read_code = code;
        }
    }

    /// Makes the probe report that it lost the connection.
    pub fn unplug(&self) {
        self.state.lock().unplugged = true;
    }

    /// Removes the optional native write entry point.
    pub fn without_native_write(self) -> Self {
        if let Some(native) = self.state.lock().native.as_mut() {
            native.write_supported = false;
        }
        self
    }

    pub fn native_written(&self) -> Vec<u8> {
        self.state
            .lock()
            .native
            .as_ref()
            .map(|native| native.written.clone())
            .unwrap_or_default()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn interface(&self) -> Option<WireProtocol> {
        self.state.lock().interface
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl MemoryInterface for FakeProbe {
    fn read(&mut self, address: u32, data: &mut [u8]) -> Result<(), ProbeError> {
        let mut state = self.state.lock();
        state.accesses.push(Access::Read {
            address,
            len: data.len(),
        });
        state.reads += 1;
        state.apply_deferred();

        let failed = ProbeError::ReadFailed {
            address,
            len: data.len(),
            code: -1,
        };
        if state.fail_reads {
            return Err(failed);
        }
        if state.fail_next_reads > 0 {
            state.fail_next_reads -= 1;
            return Err(failed);
        }

        let (region, range) = state.region_mut(address, data.len()).ok_or(failed)?;
        data.copy_from_slice(&region.data[range]);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), ProbeError> {
        let mut state = self.state.lock();
        state.accesses.push(Access::Write {
            address,
            data: data.to_vec(),
        });

        let failed = ProbeError::WriteFailed {
            address,
            len: data.len(),
            code: -1,
        };
        if state.fail_writes {
            return Err(failed);
        }

        let (region, range) = state.region_mut(address, data.len()).ok_or(failed)?;
        region.data[range].copy_from_slice(data);
        Ok(())
    }
}

impl ProbeDriver for FakeProbe {
    fn open(&mut self) -> Result<(), ProbeError> {
        let mut state = self.state.lock();
        if let Some(message) = state.open_error.clone() {
            return Err(ProbeError::OpenFailed(message));
        }
        state.opened = true;
        Ok(())
    }

    fn select_interface(&mut self, protocol: WireProtocol) -> Result<(), ProbeError> {
        self.state.lock().interface = Some(protocol);
        Ok(())
    }

    fn execute_command(&mut self, command: &str) -> Result<(), ProbeError> {
        self.state.lock().commands.push(command.to_string());
        Ok(())
    }

    fn connect(&mut self) -> Result<(), ProbeError> {
        let code = self.state.lock().connect_code;
        if code < 0 {
            return Err(ProbeError::ConnectFailed(code));
        }
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        let state = self.state.lock();
        state.opened && !state.closed && !state.unplugged
    }

    fn native_rtt(&mut self) -> Option<&mut dyn NativeRtt> {
        if self.state.lock().native.is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn close(&mut self) {
        self.state.lock().closed = true;
    }
}

impl NativeRtt for FakeProbe {
    fn start(&mut self) -> i32 {
        self.state
            .lock()
            .native
            .as_ref()
            .map_or(-1, |native| native.start_code)
    }

    fn read(&mut self, _channel: u32, buffer: &mut [u8]) -> i32 {
        let mut state = self.state.lock();
        let Some(native) = state.native.as_mut() else {
            return -1;
        };
        let Some(mut chunk) = native.inbound.pop_front() else {
            return native.idle_read_code;
        };

        if chunk.len() > buffer.len() {
            let rest = chunk.split_off(buffer.len());
            native.inbound.push_front(rest);
        }
        buffer[..chunk.len()].copy_from_slice(&chunk);
        chunk.len() as i32
    }

    fn write(&mut self, _channel: u32, data: &[u8]) -> i32 {
        let mut state = self.state.lock();
        match state.native.as_mut() {
            Some(native) if native.write_supported => {
                native.written.extend_from_slice(data);
                data.len() as i32
            }
            _ => 0,
        }
    }
}

impl ProbeFactory for FakeProbe {
    fn open(&self) -> Result<Box<dyn ProbeDriver>, ProbeError> {
        if let Some(missing) = self.state.lock().missing_symbols.clone() {
            return Err(ProbeError::DriverIncomplete(missing));
        }
        Ok(Box::new(self.clone()))
    }
}
