//! # Byte-stream host for embedded targets
//!
//! tether holds exactly one connection to a target at a time, over a serial port, a TCP client
//! or server socket, a UDP socket, or RTT through a J-Link debug probe. Whatever the transport,
//! inbound bytes and link failures arrive as [`Event`]s on an [`EventSink`], and data goes out
//! through [`TransportManager::send`].
//!
//! When the probe library has no RTT support of its own, RTT is decoded in software: the control
//! block is located by scanning target RAM for its signature and the up buffer is drained with
//! plain memory reads.
//!
//! # Examples
//!
//! ## Watching a serial port
//!
//! ```no_run
//! use std::sync::mpsc;
//! use tether::{Event, ManagerConfig, SerialParams, TransportManager};
//!
//! let (events, received) = mpsc::channel();
//! let manager = TransportManager::new(events, ManagerConfig::default());
//!
//! manager.open_serial(SerialParams::new("/dev/ttyUSB0", 115200))?;
//! manager.send(b"help\r\n")?;
//!
//! for event in received {
//!     match event {
//!         Event::DataReceived(data) => print!("{}", String::from_utf8_lossy(&data)),
//!         Event::LinkError(reason) => {
//!             eprintln!("link lost: {reason}");
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## RTT through a J-Link
//!
//! ```no_run
//! use std::sync::mpsc;
//! use tether::{ManagerConfig, RttParams, TransportManager, WireProtocol};
//!
//! let (events, _received) = mpsc::channel();
//! let manager = TransportManager::new(events, ManagerConfig::default());
//!
//! manager.open_rtt(RttParams {
//!     chip_name: "STM32F407VG".to_string(),
//!     speed_khz: 4000,
//!     interface: WireProtocol::Swd,
//! })?;
//! # Ok::<(), tether::ConnectError>(())
//! ```

pub mod config;
mod error;
pub mod event;
mod manager;
pub mod probe;
pub mod rtt;
pub mod transport;

pub use config::{
    ConnectionKind, DataBits, ManagerConfig, NetworkEndpoint, OpenParams, Parity, RttConfig,
    RttParams, SerialParams, StopBits, WireProtocol,
};
pub use error::{CloseError, ConfigError, ConnectError, LinkError, SendError, TransportError};
pub use event::{Event, EventSink};
pub use manager::{ConnectionState, TransportManager};
pub use transport::serial::available_ports;
