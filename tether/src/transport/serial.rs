use std::fmt;
use std::io::Write;

use serialport::SerialPort;

use super::{pump, ReadContext, ReadLoop, Transport};
use crate::config::{ConnectionKind, DataBits, ManagerConfig, Parity, SerialParams, StopBits};
use crate::error::{ConnectError, LinkError, SendError, TransportError};

/// Names of the serial ports the OS knows about. An enumeration failure yields an empty list.
pub fn available_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|port| port.port_name).collect(),
        Err(error) => {
            tracing::debug!("Listing serial ports failed: {error}");
            Vec::new()
        }
    }
}

fn data_bits(bits: DataBits) -> serialport::DataBits {
    match bits {
        DataBits::Five => serialport::DataBits::Five,
        DataBits::Six => serialport::DataBits::Six,
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    }
}

// Mark, Space and 1.5 stop bits are rejected during validation.
fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
        Parity::None | Parity::Mark | Parity::Space => serialport::Parity::None,
    }
}

fn stop_bits(bits: StopBits) -> serialport::StopBits {
    match bits {
        StopBits::Two => serialport::StopBits::Two,
        StopBits::One | StopBits::OnePointFive => serialport::StopBits::One,
    }
}

/// A serial port.
pub struct SerialTransport {
    port_name: String,
    port: Box<dyn SerialPort>,
    buffer_size: usize,
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.port_name)
            .field("baud_rate", &self.port.baud_rate().ok())
            .finish()
    }
}

impl SerialTransport {
    pub fn connect(params: &SerialParams, config: &ManagerConfig) -> Result<Self, ConnectError> {
        let open_error = |source| ConnectError::Serial {
            port: params.port_name.clone(),
            source,
        };

        let mut port = serialport::new(&params.port_name, params.baud_rate)
            .data_bits(data_bits(params.data_bits))
            .parity(parity(params.parity))
            .stop_bits(stop_bits(params.stop_bits))
            .timeout(config.serial_read_timeout)
            .open()
            .map_err(open_error)?;

        // Many USB serial adapters only enable their UART once DTR and RTS are asserted. Ports
        // without modem lines refuse, which is fine.
        if let Err(error) = port.write_data_terminal_ready(true) {
            tracing::debug!("Could not assert DTR on {}: {error}", params.port_name);
        }
        if let Err(error) = port.write_request_to_send(true) {
            tracing::debug!("Could not assert RTS on {}: {error}", params.port_name);
        }

        tracing::debug!(
            "Opened {} at {} baud ({:?}, {:?}, {:?})",
            params.port_name,
            params.baud_rate,
            params.data_bits,
            params.parity,
            params.stop_bits
        );

        Ok(Self {
            port_name: params.port_name.clone(),
            port,
            buffer_size: config.read_buffer_size,
        })
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Serial
    }

    fn read_loop(&mut self) -> Result<Box<dyn ReadLoop>, ConnectError> {
        let reader = self.port.try_clone().map_err(|source| ConnectError::Serial {
            port: self.port_name.clone(),
            source,
        })?;

        Ok(Box::new(SerialReader {
            port: reader,
            buffer_size: self.buffer_size,
        }))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SendError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(data.len())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        // The handle is released on drop; pending output is flushed first.
        self.port.flush()?;
        tracing::debug!("Closed {}", self.port_name);
        Ok(())
    }
}

struct SerialReader {
    port: Box<dyn SerialPort>,
    buffer_size: usize,
}

impl ReadLoop for SerialReader {
    fn run(self: Box<Self>, ctx: ReadContext) -> Result<(), LinkError> {
        let SerialReader { port, buffer_size } = *self;
        pump(port, &ctx, buffer_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_port_reports_os_reason() {
        let params = SerialParams::new("COM7-does-not-exist", 115200);

        let error = SerialTransport::connect(&params, &ManagerConfig::default()).unwrap_err();

        match error {
            ConnectError::Serial { port, source } => {
                assert_eq!(port, "COM7-does-not-exist");
                assert!(!source.description.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn port_listing_does_not_fail() {
        let _ = available_ports();
    }
}
