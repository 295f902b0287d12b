//! Probe driver on top of SEGGER's J-Link shared library.
//!
//! The core entry points are mandatory; without them no session can be opened. The RTTERMINAL
//! entry points are optional and only decide whether RTT can be served by the library itself.

pub mod library;

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::fmt;
use std::path::PathBuf;

use self::library::NativeLibrary;
use super::{MemoryInterface, NativeRtt, ProbeDriver, ProbeError, ProbeFactory};
use crate::config::WireProtocol;

const OPEN: &str = "JLINK_Open";
const CLOSE: &str = "JLINK_Close";
const CONNECT: &str = "JLINK_Connect";
const TIF_SELECT: &str = "JLINK_TIF_Select";
const EXEC_COMMAND: &str = "JLINK_ExecCommand";
const IS_CONNECTED: &str = "JLINK_IsConnected";
const READ_MEM: &str = "JLINK_ReadMem";
const WRITE_MEM: &str = "JLINK_WriteMem";
const RTT_CONTROL: &str = "JLINK_RTTERMINAL_Control";
const RTT_READ: &str = "JLINK_RTTERMINAL_Read";
const RTT_WRITE: &str = "JLINK_RTTERMINAL_Write";

const TIF_JTAG: c_int = 0;
const TIF_SWD: c_int = 1;

const RTT_CMD_START: u32 = 0;

/// Size of the buffer handed to `ExecCommand` for error messages.
const COMMAND_ERROR_LEN: usize = 256;

type OpenFn = unsafe extern "C" fn() -> *const c_char;
type CloseFn = unsafe extern "C" fn();
type ConnectFn = unsafe extern "C" fn() -> c_int;
type TifSelectFn = unsafe extern "C" fn(c_int) -> c_int;
type ExecCommandFn = unsafe extern "C" fn(*const c_char, *mut c_char, c_int) -> c_int;
type IsConnectedFn = unsafe extern "C" fn() -> c_char;
type ReadMemFn = unsafe extern "C" fn(u32, u32, *mut c_void) -> c_int;
type WriteMemFn = unsafe extern "C" fn(u32, u32, *const c_void) -> c_int;
type RttControlFn = unsafe extern "C" fn(u32, *mut c_void) -> c_int;
type RttReadFn = unsafe extern "C" fn(u32, *mut c_char, u32) -> c_int;
type RttWriteFn = unsafe extern "C" fn(u32, *const c_char, u32) -> c_int;

/// Argument of the RTTERMINAL start command. An address of zero lets the library search for the
/// control block itself.
#[repr(C)]
#[derive(Default)]
struct RttStartConfig {
    config_block_address: u32,
    reserved: [u32; 3],
}

struct CoreApi {
    open: OpenFn,
    close: CloseFn,
    connect: ConnectFn,
    tif_select: TifSelectFn,
    exec_command: ExecCommandFn,
    is_connected: IsConnectedFn,
    read_mem: ReadMemFn,
    write_mem: WriteMemFn,
}

struct RttApi {
    control: RttControlFn,
    read: RttReadFn,
    write: Option<RttWriteFn>,
}

/// A J-Link probe session driven through the vendor library.
pub struct JLink {
    api: CoreApi,
    rtt: Option<RttApi>,
    session_open: bool,
    // The function pointers above are only valid while the library is loaded. Taken on drop.
    library: Option<NativeLibrary>,
}

impl fmt::Debug for JLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JLink")
            .field("library", &self.library.as_ref().map(NativeLibrary::path))
            .field("native_rtt", &self.rtt.is_some())
            .field("session_open", &self.session_open)
            .finish()
    }
}

impl JLink {
    /// Loads the library from the first working candidate path and binds its entry points.
    pub fn load(candidates: &[PathBuf]) -> Result<Self, ProbeError> {
        let library = NativeLibrary::load(candidates)?;
        Self::bind(library)
    }

    fn bind(library: NativeLibrary) -> Result<Self, ProbeError> {
        let mut missing = Vec::new();

        fn required<T: Copy>(
            library: &NativeLibrary,
            symbol: &'static str,
            missing: &mut Vec<&'static str>,
        ) -> Option<T> {
            // SAFETY: every call site names the type matching the vendor's prototype.
            let function = unsafe { library.resolve::<T>(symbol) };
            if function.is_none() {
                missing.push(symbol);
            }
            function
        }

        let open = required::<OpenFn>(&library, OPEN, &mut missing);
        let close = required::<CloseFn>(&library, CLOSE, &mut missing);
        let connect = required::<ConnectFn>(&library, CONNECT, &mut missing);
        let tif_select = required::<TifSelectFn>(&library, TIF_SELECT, &mut missing);
        let exec_command = required::<ExecCommandFn>(&library, EXEC_COMMAND, &mut missing);
        let is_connected = required::<IsConnectedFn>(&library, IS_CONNECTED, &mut missing);
        let read_mem = required::<ReadMemFn>(&library, READ_MEM, &mut missing);
        let write_mem = required::<WriteMemFn>(&library, WRITE_MEM, &mut missing);

        let (
            Some(open),
            Some(close),
            Some(connect),
            Some(tif_select),
            Some(exec_command),
            Some(is_connected),
            Some(read_mem),
            Some(write_mem),
        ) = (
            open,
            close,
            connect,
            tif_select,
            exec_command,
            is_connected,
            read_mem,
            write_mem,
        )
        else {
            tracing::warn!(
                "{} lacks required functions: {:?}",
                library.path().display(),
                missing
            );
            return Err(ProbeError::DriverIncomplete(missing));
        };

        // SAFETY: the types match the RTTERMINAL prototypes.
        let rtt = unsafe {
            (
                library.resolve::<RttControlFn>(RTT_CONTROL),
                library.resolve::<RttReadFn>(RTT_READ),
                library.resolve::<RttWriteFn>(RTT_WRITE),
            )
        };
        let rtt = match rtt {
            (Some(control), Some(read), write) => Some(RttApi {
                control,
                read,
                write,
            }),
            _ => {
                tracing::debug!("Probe library has no native RTT support");
                None
            }
        };

        Ok(Self {
            api: CoreApi {
                open,
                close,
                connect,
                tif_select,
                exec_command,
                is_connected,
                read_mem,
                write_mem,
            },
            rtt,
            session_open: false,
            library: Some(library),
        })
    }
}

impl MemoryInterface for JLink {
    fn read(&mut self, address: u32, data: &mut [u8]) -> Result<(), ProbeError> {
        if data.is_empty() {
            return Ok(());
        }
        let len = u32::try_from(data.len()).map_err(|_| ProbeError::TransferTooLarge(data.len()))?;

        // SAFETY: `data` is valid for `len` bytes of writes.
        let code = unsafe { (self.api.read_mem)(address, len, data.as_mut_ptr().cast()) };
        if code != 0 {
            return Err(ProbeError::ReadFailed {
                address,
                len: data.len(),
                code,
            });
        }
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), ProbeError> {
        if data.is_empty() {
            return Ok(());
        }
        let len = u32::try_from(data.len()).map_err(|_| ProbeError::TransferTooLarge(data.len()))?;

        // SAFETY: `data` is valid for `len` bytes of reads.
        let code = unsafe { (self.api.write_mem)(address, len, data.as_ptr().cast()) };
        if code < 0 {
            return Err(ProbeError::WriteFailed {
                address,
                len: data.len(),
                code,
            });
        }
        Ok(())
    }
}

impl ProbeDriver for JLink {
    fn open(&mut self) -> Result<(), ProbeError> {
        // SAFETY: no arguments; the result is either null or a static error string.
        let error = unsafe { (self.api.open)() };
        if !error.is_null() {
            // SAFETY: non-null results point to a NUL terminated string owned by the library.
            let message = unsafe { CStr::from_ptr(error) }
                .to_string_lossy()
                .into_owned();
            return Err(ProbeError::OpenFailed(message));
        }
        self.session_open = true;
        Ok(())
    }

    fn select_interface(&mut self, protocol: WireProtocol) -> Result<(), ProbeError> {
        let interface = match protocol {
            WireProtocol::Jtag => TIF_JTAG,
            WireProtocol::Swd => TIF_SWD,
        };

        // SAFETY: plain integer argument.
        let code = unsafe { (self.api.tif_select)(interface) };
        if code != 0 {
            tracing::warn!("Selecting {protocol} returned {code}");
        }
        Ok(())
    }

    fn execute_command(&mut self, command: &str) -> Result<(), ProbeError> {
        let c_command =
            CString::new(command).map_err(|_| ProbeError::InvalidCommand(command.to_string()))?;
        let mut error = [0 as c_char; COMMAND_ERROR_LEN];

        tracing::debug!("Probe command: {command}");
        // SAFETY: the command is NUL terminated and the error buffer length is passed along.
        unsafe {
            (self.api.exec_command)(
                c_command.as_ptr(),
                error.as_mut_ptr(),
                COMMAND_ERROR_LEN as c_int,
            )
        };

        if error[0] != 0 {
            // SAFETY: the library NUL terminates within the buffer length it was given.
            let message = unsafe { CStr::from_ptr(error.as_ptr()) }
                .to_string_lossy()
                .into_owned();
            return Err(ProbeError::CommandFailed {
                command: command.to_string(),
                message,
            });
        }
        Ok(())
    }

    fn connect(&mut self) -> Result<(), ProbeError> {
        // SAFETY: no arguments.
        let code = unsafe { (self.api.connect)() };
        if code < 0 {
            return Err(ProbeError::ConnectFailed(code));
        }
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        // SAFETY: no arguments.
        unsafe { (self.api.is_connected)() != 0 }
    }

    fn native_rtt(&mut self) -> Option<&mut dyn NativeRtt> {
        if self.rtt.is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn close(&mut self) {
        if self.session_open {
            // SAFETY: only called for a session that was opened.
            unsafe { (self.api.close)() };
            self.session_open = false;
        }
    }
}

impl NativeRtt for JLink {
    fn start(&mut self) -> i32 {
        let Some(rtt) = &self.rtt else {
            return -1;
        };
        let mut config = RttStartConfig::default();

        // SAFETY: `config` lives across the call and has the layout the library expects.
        unsafe { (rtt.control)(RTT_CMD_START, (&mut config as *mut RttStartConfig).cast()) }
    }

    fn read(&mut self, channel: u32, buffer: &mut [u8]) -> i32 {
        let Some(rtt) = &self.rtt else {
            return -1;
        };
        let len = u32::try_from(buffer.len()).unwrap_or(u32::MAX);

        // SAFETY: `buffer` is valid for `len` bytes of writes.
        unsafe { (rtt.read)(channel, buffer.as_mut_ptr().cast(), len) }
    }

    fn write(&mut self, channel: u32, data: &[u8]) -> i32 {
        let Some(write) = self.rtt.as_ref().and_then(|rtt| rtt.write) else {
            return 0;
        };
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);

        // SAFETY: `data` is valid for `len` bytes of reads.
        unsafe { write(channel, data.as_ptr().cast(), len) }
    }
}

impl Drop for JLink {
    fn drop(&mut self) {
        ProbeDriver::close(self);

        if let Some(library) = self.library.take() {
            let path = library.path().to_path_buf();
            if let Err(error) = library.unload() {
                tracing::warn!("Unloading {} failed: {error}", path.display());
            }
        }
    }
}

/// Opens J-Link sessions by loading the vendor library from a list of candidate paths.
#[derive(Debug, Clone)]
pub struct JLinkFactory {
    candidates: Vec<PathBuf>,
}

impl JLinkFactory {
    pub fn new(candidates: Vec<PathBuf>) -> Self {
        Self { candidates }
    }
}

impl Default for JLinkFactory {
    fn default() -> Self {
        Self::new(NativeLibrary::default_candidates())
    }
}

impl ProbeFactory for JLinkFactory {
    fn open(&self) -> Result<Box<dyn ProbeDriver>, ProbeError> {
        Ok(Box::new(JLink::load(&self.candidates)?))
    }
}
