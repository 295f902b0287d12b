//! The transports a [`TransportManager`](crate::TransportManager) can hold.
//!
//! Every transport is split in two halves once connected: the [`Transport`] itself stays with the
//! manager and serves writes and teardown, and a [`ReadLoop`] runs on the read thread and turns
//! inbound bytes into [`Event`]s.

pub mod rtt;
pub mod serial;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{ConnectionKind, ManagerConfig, OpenParams};
use crate::error::{ConnectError, LinkError, SendError, TransportError};
use crate::event::{Event, EventSink};
use crate::probe::ProbeFactory;

/// A connected link.
pub trait Transport: Send + fmt::Debug {
    fn kind(&self) -> ConnectionKind;

    /// Creates the read half. Called once, directly after connecting.
    fn read_loop(&mut self) -> Result<Box<dyn ReadLoop>, ConnectError>;

    /// Writes all of `data` and returns the number of bytes accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, SendError>;

    /// Releases the underlying handles. The read half notices at its next wake up.
    fn close(&mut self) -> Result<(), TransportError>;

    /// The locally bound address, for transports that listen.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// The read half of a [`Transport`], run on its own thread.
pub trait ReadLoop: Send {
    /// Runs until a stop is requested (`Ok`) or the link fails (`Err`).
    fn run(self: Box<Self>, ctx: ReadContext) -> Result<(), LinkError>;
}

/// Cooperative cancellation flag shared between the manager and a read thread.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a read loop needs from its owner.
#[derive(Clone)]
pub struct ReadContext {
    pub stop: StopSignal,
    pub sink: Arc<dyn EventSink>,
}

impl ReadContext {
    pub fn emit(&self, event: Event) {
        self.sink.emit(event);
    }

    /// Maps a failure of the underlying handle to the loop result. Errors after a stop request are
    /// the expected fallout of tearing the handle down.
    pub fn finish(&self, error: LinkError) -> Result<(), LinkError> {
        if self.stop.is_requested() {
            tracing::trace!("Read loop ended after stop request: {error}");
            Ok(())
        } else {
            Err(error)
        }
    }
}

/// Errors that only mean "nothing arrived within the timeout".
pub(crate) fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Forwards everything read from a byte stream until it ends, fails or a stop is requested.
pub(crate) fn pump<R: Read>(
    mut reader: R,
    ctx: &ReadContext,
    buffer_size: usize,
) -> Result<(), LinkError> {
    let mut buffer = vec![0u8; buffer_size.max(1)];

    while !ctx.stop.is_requested() {
        match reader.read(&mut buffer) {
            Ok(0) => return ctx.finish(LinkError::Closed),
            Ok(count) => {
                tracing::trace!("Received {count} bytes");
                ctx.emit(Event::DataReceived(buffer[..count].to_vec()));
            }
            Err(error) if is_transient(&error) => continue,
            Err(error) => return ctx.finish(error.into()),
        }
    }

    Ok(())
}

/// Validates `params` and connects the matching transport.
pub fn connect(
    params: &OpenParams,
    config: &ManagerConfig,
    probes: &dyn ProbeFactory,
) -> Result<Box<dyn Transport>, ConnectError> {
    params.validate()?;

    let transport: Box<dyn Transport> = match params {
        OpenParams::Serial(params) => Box::new(serial::SerialTransport::connect(params, config)?),
        OpenParams::TcpClient(endpoint) => {
            Box::new(tcp::TcpClientTransport::connect(endpoint, config)?)
        }
        OpenParams::TcpServer { local_port } => {
            Box::new(tcp::TcpServerTransport::bind(*local_port, config)?)
        }
        OpenParams::Udp { local_port, remote } => {
            Box::new(udp::UdpTransport::bind(*local_port, remote.as_ref(), config)?)
        }
        OpenParams::Rtt(params) => Box::new(rtt::RttTransport::connect(params, config, probes)?),
    };

    Ok(transport)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use pretty_assertions::assert_eq;

    struct Script(Vec<io::Result<Vec<u8>>>);

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Ok(0);
            }
            let data = self.0.remove(0)?;
            buf[..data.len()].copy_from_slice(&data);
            Ok(data.len())
        }
    }

    fn context() -> (ReadContext, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel();
        let ctx = ReadContext {
            stop: StopSignal::new(),
            sink: Arc::new(sender),
        };
        (ctx, receiver)
    }

    #[test]
    fn pump_forwards_in_order_and_reports_eof() {
        let (ctx, events) = context();
        let script = Script(vec![
            Ok(b"ab".to_vec()),
            Err(io::ErrorKind::TimedOut.into()),
            Ok(b"c".to_vec()),
        ]);

        let result = pump(script, &ctx, 16);

        assert!(matches!(result, Err(LinkError::Closed)));
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![
                Event::DataReceived(b"ab".to_vec()),
                Event::DataReceived(b"c".to_vec())
            ]
        );
    }

    #[test]
    fn errors_after_stop_are_quiet() {
        let (ctx, _events) = context();
        ctx.stop.request();

        assert!(ctx.finish(LinkError::Closed).is_ok());
        assert!(pump(Script(vec![]), &ctx, 16).is_ok());
    }

    #[test]
    fn hard_errors_end_the_pump() {
        let (ctx, _events) = context();
        let script = Script(vec![Err(io::ErrorKind::BrokenPipe.into())]);

        assert!(matches!(pump(script, &ctx, 16), Err(LinkError::Io(_))));
    }
}
