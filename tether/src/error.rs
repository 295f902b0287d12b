use std::io;

use crate::config::{ConnectionKind, Parity};
use crate::rtt;

/// A connection request was malformed and was rejected before any resource was touched.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ConfigError {
    /// No serial port name was given.
    EmptyPortName,

    /// Baud rate {0} is not valid.
    InvalidBaudRate(u32),

    /// {0} data bits are not supported, choose 5, 6, 7 or 8.
    InvalidDataBits(u8),

    /// '{0}' is not a parity mode. Choose from [None, Odd, Even, Mark, Space].
    InvalidParity(String),

    /// Parity {0:?} is not supported by the serial driver on this platform.
    UnsupportedParity(Parity),

    /// '{0}' is not a stop bit setting. Choose from [1, 1.5, 2].
    InvalidStopBits(String),

    /// 1.5 stop bits are not supported by the serial driver on this platform.
    UnsupportedStopBits,

    /// No host was given.
    EmptyHost,

    /// Port {0} is not a valid remote port.
    InvalidPort(u16),

    /// '{0}' is not a valid endpoint, expected HOST:PORT.
    InvalidEndpoint(String),

    /// Could not resolve {endpoint}.
    Unresolvable {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// No chip name was given.
    EmptyChipName,

    /// Probe speed {0} kHz is not valid.
    InvalidSpeed(u32),
}

/// Opening a connection failed. No partial state remains.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ConnectError {
    /// Already connected ({0}). Close the current connection first.
    AlreadyConnected(ConnectionKind),

    /// Invalid parameters: {0}
    Config(#[from] ConfigError),

    /// Could not open serial port {port}: {source}
    Serial {
        port: String,
        #[source]
        source: serialport::Error,
    },

    /// Could not connect to {endpoint}: {source}
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Could not bind {address}: {source}
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// RTT connection failed: {0}
    Rtt(#[from] rtt::Error),

    /// Could not start the read task: {0}
    Spawn(#[source] io::Error),
}

/// Closing the connection failed.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum CloseError {
    /// Not connected.
    NotConnected,

    /// The connection was closed, but releasing the {kind} handle reported an error: {source}
    Teardown {
        kind: ConnectionKind,
        #[source]
        source: TransportError,
    },
}

/// Sending data failed.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum SendError {
    /// Not connected.
    NotConnected,

    /// No client is connected to the server.
    NoPeer,

    /// No remote address is set. Configure one or wait for the first packet.
    NoRemoteAddress,

    /// Send failed: {0}
    Io(#[from] io::Error),

    /// RTT write failed: {0}
    Rtt(#[from] rtt::Error),
}

/// An established link went away without being asked to.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum LinkError {
    /// Read error: {0}
    Io(#[from] io::Error),

    /// The remote end closed the connection.
    Closed,

    /// RTT error: {0}
    Rtt(#[from] rtt::Error),
}

/// Errors raised while releasing a transport's handles.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum TransportError {
    /// {0}
    Io(#[from] io::Error),

    /// {0}
    Rtt(#[from] rtt::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_human_readable() {
        assert_eq!(
            ConnectError::AlreadyConnected(ConnectionKind::Udp).to_string(),
            "Already connected (UDP). Close the current connection first."
        );
        assert_eq!(
            ConnectError::Config(ConfigError::InvalidDataBits(9)).to_string(),
            "Invalid parameters: 9 data bits are not supported, choose 5, 6, 7 or 8."
        );
        assert_eq!(SendError::NoPeer.to_string(), "No client is connected to the server.");
        assert_eq!(CloseError::NotConnected.to_string(), "Not connected.");
    }
}
