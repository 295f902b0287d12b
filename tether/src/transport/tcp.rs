//! TCP client and server transports.
//!
//! The server accepts in the background and keeps at most one peer. A new peer supersedes the
//! previous one, and a peer that goes away just leaves the slot empty until the next one connects.

use std::io::{self, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::{is_transient, pump, ReadContext, ReadLoop, Transport};
use crate::config::{ConnectionKind, ManagerConfig, NetworkEndpoint};
use crate::error::{ConfigError, ConnectError, LinkError, SendError, TransportError};
use crate::event::Event;

/// An outgoing TCP connection.
#[derive(Debug)]
pub struct TcpClientTransport {
    stream: TcpStream,
    peer: SocketAddr,
    buffer_size: usize,
}

impl TcpClientTransport {
    /// Connects to the first address of `endpoint` that accepts within the configured timeout.
    pub fn connect(endpoint: &NetworkEndpoint, config: &ManagerConfig) -> Result<Self, ConnectError> {
        let connect_error = |source| ConnectError::Connect {
            endpoint: endpoint.to_string(),
            source,
        };

        let addresses = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|source| ConfigError::Unresolvable {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let mut last_error = None;
        for address in addresses {
            tracing::debug!("Connecting to {address}");
            match TcpStream::connect_timeout(&address, config.tcp_connect_timeout) {
                Ok(stream) => {
                    if let Err(error) = stream.set_nodelay(true) {
                        tracing::debug!("Could not disable Nagle's algorithm: {error}");
                    }
                    tracing::debug!("Connected to {address}");
                    return Ok(Self {
                        stream,
                        peer: address,
                        buffer_size: config.read_buffer_size,
                    });
                }
                Err(error) => last_error = Some(error),
            }
        }

        Err(connect_error(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no addresses to connect to")
        })))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpClientTransport {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::TcpClient
    }

    fn read_loop(&mut self) -> Result<Box<dyn ReadLoop>, ConnectError> {
        let stream = self.stream.try_clone().map_err(|source| ConnectError::Connect {
            endpoint: self.peer.to_string(),
            source,
        })?;
        Ok(Box::new(StreamReader {
            stream,
            buffer_size: self.buffer_size,
        }))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SendError> {
        self.stream.write_all(data)?;
        Ok(data.len())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        shutdown(&self.stream)?;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }
}

/// Shuts a stream down, ignoring streams the remote end already closed.
fn shutdown(stream: &TcpStream) -> io::Result<()> {
    match stream.shutdown(Shutdown::Both) {
        Err(error) if error.kind() != io::ErrorKind::NotConnected => Err(error),
        _ => Ok(()),
    }
}

struct StreamReader {
    stream: TcpStream,
    buffer_size: usize,
}

impl ReadLoop for StreamReader {
    fn run(self: Box<Self>, ctx: ReadContext) -> Result<(), LinkError> {
        pump(&self.stream, &ctx, self.buffer_size)
    }
}

#[derive(Debug)]
struct Peer {
    id: u64,
    address: SocketAddr,
    stream: TcpStream,
}

type PeerSlot = Arc<Mutex<Option<Peer>>>;

/// A listening TCP socket with at most one current peer.
#[derive(Debug)]
pub struct TcpServerTransport {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    peer: PeerSlot,
    accept_poll_interval: Duration,
    buffer_size: usize,
}

impl TcpServerTransport {
    /// Listens on all IPv4 interfaces. Port 0 picks a free port.
    pub fn bind(local_port: u16, config: &ManagerConfig) -> Result<Self, ConnectError> {
        let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port));
        let bind_error = |source| ConnectError::Bind {
            address: address.to_string(),
            source,
        };

        let listener = TcpListener::bind(address).map_err(bind_error)?;
        // The acceptor polls so it can observe stop requests.
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        tracing::debug!("Listening on {local_addr}");

        Ok(Self {
            listener: Some(listener),
            local_addr,
            peer: Arc::new(Mutex::new(None)),
            accept_poll_interval: config.accept_poll_interval,
            buffer_size: config.read_buffer_size,
        })
    }

    /// Address of the current peer, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.lock().as_ref().map(|peer| peer.address)
    }
}

impl Transport for TcpServerTransport {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::TcpServer
    }

    fn read_loop(&mut self) -> Result<Box<dyn ReadLoop>, ConnectError> {
        let listener = self.listener.take().ok_or_else(|| ConnectError::Bind {
            address: self.local_addr.to_string(),
            source: io::Error::new(io::ErrorKind::Other, "the acceptor is already running"),
        })?;

        Ok(Box::new(Acceptor {
            listener,
            peer: self.peer.clone(),
            poll_interval: self.accept_poll_interval,
            buffer_size: self.buffer_size,
            next_id: 0,
            readers: Vec::new(),
        }))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SendError> {
        let mut slot = self.peer.lock();
        let peer = slot.as_mut().ok_or(SendError::NoPeer)?;
        peer.stream.write_all(data)?;
        Ok(data.len())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(peer) = self.peer.lock().take() {
            tracing::debug!("Disconnecting {}", peer.address);
            shutdown(&peer.stream)?;
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

/// Accept loop of the server. Owns the listener and the per-peer reader threads.
struct Acceptor {
    listener: TcpListener,
    peer: PeerSlot,
    poll_interval: Duration,
    buffer_size: usize,
    next_id: u64,
    readers: Vec<JoinHandle<()>>,
}

impl Acceptor {
    fn adopt(&mut self, stream: TcpStream, address: SocketAddr, ctx: &ReadContext) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        let reader = stream.try_clone()?;

        self.next_id += 1;
        let id = self.next_id;

        let previous = self.peer.lock().replace(Peer {
            id,
            address,
            stream,
        });
        if let Some(previous) = previous {
            tracing::debug!("{address} supersedes {}", previous.address);
            if let Err(error) = shutdown(&previous.stream) {
                tracing::debug!("Shutting down {} failed: {error}", previous.address);
            }
        }

        tracing::debug!("Client connected: {address}");
        ctx.emit(Event::PeerConnected(address));

        let peer = self.peer.clone();
        let peer_ctx = ctx.clone();
        let buffer_size = self.buffer_size;
        let handle = thread::Builder::new()
            .name(format!("tcp-peer-{id}"))
            .spawn(move || {
                let result = pump(&reader, &peer_ctx, buffer_size);

                // Only clear the slot if this peer is still the current one.
                let mut slot = peer.lock();
                if slot.as_ref().is_some_and(|current| current.id == id) {
                    *slot = None;
                }
                drop(slot);

                match result {
                    Ok(()) => tracing::debug!("Reader for {address} stopped"),
                    Err(error) => tracing::debug!("Client {address} disconnected: {error}"),
                }
            })?;

        self.readers.retain(|reader| !reader.is_finished());
        self.readers.push(handle);
        Ok(())
    }

    /// Disconnects the current peer.
    ///
    /// Peer readers finish on their own once their stream is shut down and are not joined here:
    /// the thread closing the connection may be one of them, calling in from its event sink.
    fn stop_peers(self) {
        if let Some(peer) = self.peer.lock().take() {
            if let Err(error) = shutdown(&peer.stream) {
                tracing::debug!("Shutting down {} failed: {error}", peer.address);
            }
        }

        let running = self
            .readers
            .iter()
            .filter(|reader| !reader.is_finished())
            .count();
        if running > 0 {
            tracing::trace!("{running} TCP peer readers still winding down");
        }
    }
}

impl ReadLoop for Acceptor {
    fn run(mut self: Box<Self>, ctx: ReadContext) -> Result<(), LinkError> {
        let result = loop {
            if ctx.stop.is_requested() {
                break Ok(());
            }

            match self.listener.accept() {
                Ok((stream, address)) => {
                    if let Err(error) = self.adopt(stream, address, &ctx) {
                        tracing::warn!("Could not take over connection from {address}: {error}");
                    }
                }
                Err(error) if is_transient(&error) => thread::sleep(self.poll_interval),
                Err(error) if error.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(error) => break ctx.finish(error.into()),
            }
        };

        self.stop_peers();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn unreachable_endpoint() {
        // Port 1 on localhost is closed on any sane test machine.
        let config = ManagerConfig {
            tcp_connect_timeout: Duration::from_millis(500),
            ..ManagerConfig::default()
        };

        let error =
            TcpClientTransport::connect(&NetworkEndpoint::new("127.0.0.1", 1), &config).unwrap_err();

        assert!(matches!(error, ConnectError::Connect { .. }));
        assert!(error.to_string().starts_with("Could not connect to 127.0.0.1:1"));
    }

    #[test]
    fn client_writes_reach_the_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client =
            TcpClientTransport::connect(&NetworkEndpoint::new("127.0.0.1", port), &ManagerConfig::default())
                .unwrap();
        let (mut remote, _) = listener.accept().unwrap();

        assert_eq!(client.write(b"ping").unwrap(), 4);
        let mut received = [0u8; 4];
        remote.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"ping");

        client.close().unwrap();
    }

    #[test]
    fn server_without_peer_refuses_writes() {
        let mut server = TcpServerTransport::bind(0, &ManagerConfig::default()).unwrap();

        assert!(matches!(server.write(b"x"), Err(SendError::NoPeer)));
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(server.peer_addr().is_none());
    }
}
