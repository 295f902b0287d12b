use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{is_transient, ReadContext, ReadLoop, Transport};
use crate::config::{ConnectionKind, ManagerConfig, NetworkEndpoint};
use crate::error::{ConnectError, LinkError, SendError, TransportError};
use crate::event::Event;

/// Largest payload of a UDP datagram over IPv4.
const MAX_DATAGRAM: usize = 65_507;

/// A bound UDP socket.
///
/// Without a configured remote, the sender of the first inbound datagram becomes the remote.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    remote: Arc<Mutex<Option<SocketAddr>>>,
}

impl UdpTransport {
    pub fn bind(
        local_port: u16,
        remote: Option<&NetworkEndpoint>,
        config: &ManagerConfig,
    ) -> Result<Self, ConnectError> {
        // Resolve first, so a bad remote never leaves a bound socket behind.
        let remote = remote.map(NetworkEndpoint::resolve).transpose()?;

        let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port));
        let bind_error = |source| ConnectError::Bind {
            address: address.to_string(),
            source,
        };

        let socket = UdpSocket::bind(address).map_err(bind_error)?;
        socket
            .set_read_timeout(Some(config.udp_poll_timeout))
            .map_err(bind_error)?;

        match remote {
            Some(remote) => tracing::debug!("UDP bound to {address}, sending to {remote}"),
            None => tracing::debug!("UDP bound to {address}, waiting for a remote"),
        }

        Ok(Self {
            socket,
            remote: Arc::new(Mutex::new(remote)),
        })
    }

    /// The address datagrams are sent to.
    pub fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Udp
    }

    fn read_loop(&mut self) -> Result<Box<dyn ReadLoop>, ConnectError> {
        let socket = self.socket.try_clone().map_err(ConnectError::Spawn)?;
        Ok(Box::new(DatagramReader {
            socket,
            remote: self.remote.clone(),
        }))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SendError> {
        let remote = (*self.remote.lock()).ok_or(SendError::NoRemoteAddress)?;
        Ok(self.socket.send_to(data, remote)?)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        // The socket is released when both halves are dropped; the reader times out on its own.
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

struct DatagramReader {
    socket: UdpSocket,
    remote: Arc<Mutex<Option<SocketAddr>>>,
}

impl ReadLoop for DatagramReader {
    fn run(self: Box<Self>, ctx: ReadContext) -> Result<(), LinkError> {
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        while !ctx.stop.is_requested() {
            match self.socket.recv_from(&mut buffer) {
                Ok((count, sender)) => {
                    let adopted = {
                        let mut remote = self.remote.lock();
                        if remote.is_none() {
                            *remote = Some(sender);
                            true
                        } else {
                            false
                        }
                    };
                    if adopted {
                        tracing::debug!("Remote set to {sender}");
                        ctx.emit(Event::RemoteAdopted(sender));
                    }

                    tracing::trace!("Received {count} bytes from {sender}");
                    ctx.emit(Event::DataReceived(buffer[..count].to_vec()));
                }
                Err(error) if is_transient(&error) => continue,
                // ICMP port unreachable for an earlier send; the socket itself is fine.
                Err(error) if error.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(error) => return ctx.finish(error.into()),
            }
        }

        Ok(())
    }
}
