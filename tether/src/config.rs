//! Connection parameters and tuning knobs.
//!
//! Every `Open*` request carries one of the parameter types in this module. They are validated by
//! [`OpenParams::validate`] before any port, socket or probe is touched, so a malformed request
//! never leaves a half-opened resource behind.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The kind of link a [`TransportManager`](crate::TransportManager) can hold.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionKind {
    Serial,
    TcpClient,
    TcpServer,
    Udp,
    Rtt,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionKind::Serial => "serial",
            ConnectionKind::TcpClient => "TCP client",
            ConnectionKind::TcpServer => "TCP server",
            ConnectionKind::Udp => "UDP",
            ConnectionKind::Rtt => "RTT",
        })
    }
}

/// Number of data bits per serial character.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(ConfigError::InvalidDataBits(other)),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(value: DataBits) -> Self {
        match value {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

/// Serial parity mode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl FromStr for Parity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_ascii_lowercase()[..] {
            "none" => Ok(Parity::None),
            "odd" => Ok(Parity::Odd),
            "even" => Ok(Parity::Even),
            "mark" => Ok(Parity::Mark),
            "space" => Ok(Parity::Space),
            _ => Err(ConfigError::InvalidParity(s.to_string())),
        }
    }
}

/// Number of serial stop bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

impl FromStr for StopBits {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "15" is how older front ends encoded one and a half stop bits.
        match s.trim() {
            "1" => Ok(StopBits::One),
            "1.5" | "15" => Ok(StopBits::OnePointFive),
            "2" => Ok(StopBits::Two),
            _ => Err(ConfigError::InvalidStopBits(s.to_string())),
        }
    }
}

/// Settings used to open a serial port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParams {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub stop_bits: StopBits,
}

impl SerialParams {
    /// 8N1 at the given baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port_name.trim().is_empty() {
            return Err(ConfigError::EmptyPortName);
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::InvalidBaudRate(self.baud_rate));
        }
        if matches!(self.parity, Parity::Mark | Parity::Space) {
            return Err(ConfigError::UnsupportedParity(self.parity));
        }
        if self.stop_bits == StopBits::OnePointFive {
            return Err(ConfigError::UnsupportedStopBits);
        }
        Ok(())
    }
}

/// A host and port pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    pub host: String,
    pub port: u16,
}

impl NetworkEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolves the endpoint to the first socket address the resolver returns.
    pub fn resolve(&self) -> Result<SocketAddr, ConfigError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| ConfigError::Unresolvable {
                endpoint: self.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| ConfigError::Unresolvable {
                endpoint: self.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no addresses returned by the resolver",
                ),
            })
    }

    fn validate_remote(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }
        Ok(())
    }
}

impl fmt::Display for NetworkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NetworkEndpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidEndpoint(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| ConfigError::InvalidEndpoint(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(host, port))
    }
}

/// The debug interface used between the probe and the target.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireProtocol {
    #[default]
    Swd,
    Jtag,
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireProtocol::Swd => write!(f, "SWD"),
            WireProtocol::Jtag => write!(f, "JTAG"),
        }
    }
}

impl FromStr for WireProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_ascii_lowercase()[..] {
            "swd" => Ok(WireProtocol::Swd),
            "jtag" => Ok(WireProtocol::Jtag),
            _ => Err(format!(
                "'{s}' is not a valid protocol. Choose from [swd, jtag]."
            )),
        }
    }
}

/// Settings used to attach to a target through a debug probe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RttParams {
    pub chip_name: String,
    pub speed_khz: u32,
    #[serde(default)]
    pub interface: WireProtocol,
}

impl RttParams {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.chip_name.trim().is_empty() {
            return Err(ConfigError::EmptyChipName);
        }
        if self.speed_khz == 0 {
            return Err(ConfigError::InvalidSpeed(self.speed_khz));
        }
        Ok(())
    }
}

/// A complete open request, one variant per [`ConnectionKind`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpenParams {
    Serial(SerialParams),
    TcpClient(NetworkEndpoint),
    TcpServer { local_port: u16 },
    Udp {
        local_port: u16,
        remote: Option<NetworkEndpoint>,
    },
    Rtt(RttParams),
}

impl OpenParams {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            OpenParams::Serial(_) => ConnectionKind::Serial,
            OpenParams::TcpClient(_) => ConnectionKind::TcpClient,
            OpenParams::TcpServer { .. } => ConnectionKind::TcpServer,
            OpenParams::Udp { .. } => ConnectionKind::Udp,
            OpenParams::Rtt(_) => ConnectionKind::Rtt,
        }
    }

    /// Rejects malformed parameters. Local ports may be 0 (let the OS pick).
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            OpenParams::Serial(params) => params.validate(),
            OpenParams::TcpClient(endpoint) => endpoint.validate_remote(),
            OpenParams::TcpServer { .. } => Ok(()),
            OpenParams::Udp { remote, .. } => remote
                .as_ref()
                .map_or(Ok(()), NetworkEndpoint::validate_remote),
            OpenParams::Rtt(params) => params.validate(),
        }
    }
}

/// Tuning for the [`TransportManager`](crate::TransportManager) and the transports it creates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Upper bound for establishing a TCP client connection.
    #[serde(with = "millis")]
    pub tcp_connect_timeout: Duration,
    /// How long a UDP read blocks before checking for a stop request.
    #[serde(with = "millis")]
    pub udp_poll_timeout: Duration,
    /// How long a serial read blocks before checking for a stop request.
    #[serde(with = "millis")]
    pub serial_read_timeout: Duration,
    /// Sleep between non-blocking accept attempts of the TCP server.
    #[serde(with = "millis")]
    pub accept_poll_interval: Duration,
    /// Interval of the RTT poll loop.
    #[serde(with = "millis")]
    pub rtt_poll_interval: Duration,
    /// Size of the scratch buffer used by byte-stream reads.
    pub read_buffer_size: usize,
    pub rtt: RttConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tcp_connect_timeout: Duration::from_secs(3),
            udp_poll_timeout: Duration::from_millis(500),
            serial_read_timeout: Duration::from_millis(100),
            accept_poll_interval: Duration::from_millis(50),
            rtt_poll_interval: Duration::from_millis(10),
            read_buffer_size: 4096,
            rtt: RttConfig::default(),
        }
    }
}

/// Tuning for the [`RttEngine`](crate::rtt::RttEngine).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RttConfig {
    /// Time given to the target firmware to set up its control block after attach.
    #[serde(with = "millis")]
    pub settle_delay: Duration,
    /// Number of software RTT discovery attempts before giving up.
    pub init_attempts: usize,
    #[serde(with = "millis")]
    pub init_retry_delay: Duration,
    pub scan: ScanWindow,
    /// Upper bound of bytes taken out of the ring buffer in a single poll.
    pub max_read_per_poll: usize,
    /// Scratch buffer size for native RTT reads.
    pub native_read_size: usize,
    /// Consecutive failed polls that trigger a re-discovery of the control block.
    pub corruption_threshold: usize,
    /// Failed re-discoveries after which the link is considered lost.
    pub max_reinit_attempts: usize,
    /// Overrides the platform search list for the native probe library.
    pub library_paths: Option<Vec<PathBuf>>,
}

impl Default for RttConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            init_attempts: 3,
            init_retry_delay: Duration::from_millis(500),
            scan: ScanWindow::default(),
            max_read_per_poll: 32 * 1024,
            native_read_size: 4096,
            corruption_threshold: 3,
            max_reinit_attempts: 3,
            library_paths: None,
        }
    }
}

/// The RAM window that is searched for the RTT control block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWindow {
    pub base: u32,
    pub size: u32,
    /// Bytes fetched from the probe per memory read.
    pub chunk_size: u32,
}

impl Default for ScanWindow {
    fn default() -> Self {
        Self {
            base: 0x2000_0000,
            size: 0x1_0000,
            chunk_size: 0x800,
        }
    }
}

impl ScanWindow {
    /// One past the last scanned address.
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn serial_defaults_to_8n1() {
        let params = SerialParams::new("COM7", 115200);
        assert_eq!(params.data_bits, DataBits::Eight);
        assert_eq!(params.parity, Parity::None);
        assert_eq!(params.stop_bits, StopBits::One);
        assert!(OpenParams::Serial(params).validate().is_ok());
    }

    #[test_case("1", StopBits::One)]
    #[test_case("1.5", StopBits::OnePointFive)]
    #[test_case("15", StopBits::OnePointFive; "legacy encoding")]
    #[test_case("2", StopBits::Two)]
    fn parse_stop_bits(input: &str, expected: StopBits) {
        assert_eq!(input.parse::<StopBits>().unwrap(), expected);
    }

    #[test]
    fn parity_names_are_case_insensitive() {
        assert_eq!("None".parse::<Parity>().unwrap(), Parity::None);
        assert_eq!("EVEN".parse::<Parity>().unwrap(), Parity::Even);
        assert!("sometimes".parse::<Parity>().is_err());
    }

    #[test]
    fn data_bits_out_of_range() {
        assert!(matches!(
            DataBits::try_from(9),
            Err(ConfigError::InvalidDataBits(9))
        ));
        assert_eq!(DataBits::try_from(5).unwrap(), DataBits::Five);
    }

    #[test]
    fn malformed_parameters_are_rejected() {
        let mut params = SerialParams::new("", 9600);
        assert!(matches!(
            OpenParams::Serial(params.clone()).validate(),
            Err(ConfigError::EmptyPortName)
        ));

        params.port_name = "/dev/ttyUSB0".into();
        params.baud_rate = 0;
        assert!(matches!(
            OpenParams::Serial(params.clone()).validate(),
            Err(ConfigError::InvalidBaudRate(0))
        ));

        params.baud_rate = 9600;
        params.parity = Parity::Mark;
        assert!(matches!(
            OpenParams::Serial(params).validate(),
            Err(ConfigError::UnsupportedParity(Parity::Mark))
        ));

        assert!(matches!(
            OpenParams::TcpClient(NetworkEndpoint::new("", 80)).validate(),
            Err(ConfigError::EmptyHost)
        ));
        assert!(matches!(
            OpenParams::Rtt(RttParams {
                chip_name: "STM32F407VG".into(),
                speed_khz: 0,
                interface: WireProtocol::Swd,
            })
            .validate(),
            Err(ConfigError::InvalidSpeed(0))
        ));
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            "192.168.1.10:5000".parse::<NetworkEndpoint>().unwrap(),
            NetworkEndpoint::new("192.168.1.10", 5000)
        );
        assert_eq!(
            "[::1]:23".parse::<NetworkEndpoint>().unwrap(),
            NetworkEndpoint::new("::1", 23)
        );
        assert_eq!(NetworkEndpoint::new("::1", 23).to_string(), "[::1]:23");
        assert!("localhost".parse::<NetworkEndpoint>().is_err());
    }

    #[test]
    fn wire_protocol_parsing() {
        assert_eq!("swd".parse::<WireProtocol>().unwrap(), WireProtocol::Swd);
        assert_eq!("JTAG".parse::<WireProtocol>().unwrap(), WireProtocol::Jtag);
        assert!("spi".parse::<WireProtocol>().is_err());
    }
}
