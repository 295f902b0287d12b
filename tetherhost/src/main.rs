mod config;
mod logging;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use tether::{
    DataBits, Event, EventSink, ManagerConfig, NetworkEndpoint, OpenParams, Parity, RttParams,
    SerialParams, StopBits, TransportManager, WireProtocol,
};

use crate::logging::LevelFilter;

#[derive(Debug, clap::Parser)]
#[clap(
    name = "tetherhost",
    version,
    about = "Prints the byte stream of an embedded target and forwards stdin lines to it."
)]
struct Cli {
    /// Log level for stderr. Overrides the configuration files and RUST_LOG.
    #[clap(long, global = true, value_enum)]
    log_level: Option<LevelFilter>,

    /// Also write a JSON log to this file.
    #[clap(long, global = true)]
    log_file: Option<PathBuf>,

    /// Configuration file applied on top of the ones found in the current and home directory.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// List the serial ports known to the operating system.
    Ports,
    /// Open a serial port.
    Serial {
        port: String,
        #[clap(short, long, default_value_t = 115_200)]
        baud: u32,
        #[clap(long, default_value = "8", value_parser = parse_data_bits)]
        data_bits: DataBits,
        #[clap(long, default_value = "None")]
        parity: Parity,
        #[clap(long, default_value = "1")]
        stop_bits: StopBits,
    },
    /// Connect to a TCP server at `host:port`.
    TcpClient { endpoint: NetworkEndpoint },
    /// Listen for TCP clients. The most recent client is the current peer.
    TcpServer {
        /// Local port, 0 lets the operating system pick one.
        #[clap(default_value_t = 0)]
        port: u16,
    },
    /// Exchange UDP datagrams.
    Udp {
        #[clap(long, default_value_t = 0)]
        local_port: u16,
        /// Where to send to. Without it, the first sender becomes the remote.
        #[clap(long)]
        remote: Option<NetworkEndpoint>,
    },
    /// Read RTT through a J-Link probe.
    Rtt {
        #[clap(long)]
        chip: String,
        /// Interface speed in kHz.
        #[clap(long, default_value_t = 4000)]
        speed: u32,
        #[clap(long, default_value = "swd")]
        interface: WireProtocol,
        /// Native probe library to try, may be repeated. Replaces the default search list.
        #[clap(long = "library")]
        libraries: Vec<PathBuf>,
    },
}

fn parse_data_bits(s: &str) -> anyhow::Result<DataBits> {
    let bits: u8 = s.parse().with_context(|| format!("'{s}' is not a number"))?;
    Ok(DataBits::try_from(bits)?)
}

impl Command {
    /// Turns the command into open parameters, applying command specific overrides to `config`.
    fn into_params(self, config: &mut ManagerConfig) -> Option<OpenParams> {
        let params = match self {
            Command::Ports => return None,
            Command::Serial {
                port,
                baud,
                data_bits,
                parity,
                stop_bits,
            } => OpenParams::Serial(SerialParams {
                port_name: port,
                baud_rate: baud,
                data_bits,
                parity,
                stop_bits,
            }),
            Command::TcpClient { endpoint } => OpenParams::TcpClient(endpoint),
            Command::TcpServer { port } => OpenParams::TcpServer { local_port: port },
            Command::Udp { local_port, remote } => OpenParams::Udp { local_port, remote },
            Command::Rtt {
                chip,
                speed,
                interface,
                libraries,
            } => {
                if !libraries.is_empty() {
                    config.rtt.library_paths = Some(libraries);
                }
                OpenParams::Rtt(RttParams {
                    chip_name: chip,
                    speed_khz: speed,
                    interface,
                })
            }
        };
        Some(params)
    }
}

/// Everything the main loop reacts to.
enum HostMessage {
    Link(Event),
    Input(String),
    InputClosed,
}

struct Forward(mpsc::Sender<HostMessage>);

impl EventSink for Forward {
    fn emit(&self, event: Event) {
        if self.0.send(HostMessage::Link(event)).is_err() {
            tracing::trace!("Main loop gone, dropping event");
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = config::load(cli.config.as_deref())?;
    let log_file = cli.log_file.or(config.log_file);
    let _logger = logging::setup_logging(log_file.as_deref(), cli.log_level.or(config.log_level))?;

    let mut manager_config = config.manager;
    let Some(params) = cli.command.into_params(&mut manager_config) else {
        for port in tether::available_ports() {
            println!("{port}");
        }
        return Ok(ExitCode::SUCCESS);
    };

    run(params, manager_config)
}

fn run(params: OpenParams, config: ManagerConfig) -> anyhow::Result<ExitCode> {
    let (sender, messages) = mpsc::channel();
    let manager = TransportManager::new(Forward(sender.clone()), config);

    let kind = params.kind();
    manager
        .open(params)
        .with_context(|| format!("Opening the {kind} connection failed"))?;
    if let Some(address) = manager.local_addr() {
        eprintln!("Listening on {address}");
    }

    spawn_stdin_reader(sender)?;

    let mut stdout = io::stdout().lock();
    for message in messages {
        match message {
            HostMessage::Link(Event::DataReceived(data)) => {
                stdout.write_all(&data)?;
                stdout.flush()?;
            }
            HostMessage::Link(Event::PeerConnected(address)) => {
                eprintln!("Client connected: {address}");
            }
            HostMessage::Link(Event::RemoteAdopted(address)) => {
                eprintln!("Remote set to {address}");
            }
            HostMessage::Link(Event::LinkError(reason)) => {
                eprintln!("Connection lost: {reason}");
                return Ok(ExitCode::FAILURE);
            }
            HostMessage::Input(line) => match manager.send(line.as_bytes()) {
                Ok(_) => tracing::debug!("Sent {} bytes", line.len()),
                Err(error) => eprintln!("Error: {error}"),
            },
            HostMessage::InputClosed => break,
        }
    }

    if let Err(error) = manager.close() {
        eprintln!("Error: {error}");
    }
    Ok(ExitCode::SUCCESS)
}

/// Forwards stdin line by line, keeping the line terminator.
fn spawn_stdin_reader(sender: mpsc::Sender<HostMessage>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("tetherhost-stdin".into())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            loop {
                let mut line = String::new();
                let message = match stdin.read_line(&mut line) {
                    Ok(0) => HostMessage::InputClosed,
                    Ok(_) => HostMessage::Input(line),
                    Err(error) => {
                        tracing::warn!("Reading stdin failed: {error}");
                        HostMessage::InputClosed
                    }
                };
                let closed = matches!(message, HostMessage::InputClosed);
                if sender.send(message).is_err() || closed {
                    break;
                }
            }
        })
        .context("Could not start the stdin reader")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(args: &[&str]) -> (Option<OpenParams>, ManagerConfig) {
        let cli = Cli::try_parse_from(args.iter().copied()).unwrap();
        let mut config = ManagerConfig::default();
        (cli.command.into_params(&mut config), config)
    }

    #[test]
    fn cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn serial_defaults_to_8n1() {
        let (params, _) = params(&["tetherhost", "serial", "/dev/ttyUSB0"]);

        assert_eq!(
            params,
            Some(OpenParams::Serial(SerialParams::new("/dev/ttyUSB0", 115_200)))
        );
    }

    #[test]
    fn serial_framing_flags() {
        let (params, _) = params(&[
            "tetherhost",
            "serial",
            "COM7",
            "--baud",
            "9600",
            "--data-bits",
            "7",
            "--parity",
            "even",
            "--stop-bits",
            "2",
        ]);

        assert_eq!(
            params,
            Some(OpenParams::Serial(SerialParams {
                port_name: "COM7".into(),
                baud_rate: 9600,
                data_bits: DataBits::Seven,
                parity: Parity::Even,
                stop_bits: StopBits::Two,
            }))
        );
    }

    #[test]
    fn invalid_data_bits_are_a_usage_error() {
        assert!(Cli::try_parse_from(["tetherhost", "serial", "COM7", "--data-bits", "9"]).is_err());
    }

    #[test]
    fn udp_without_remote() {
        let (params, _) = params(&["tetherhost", "udp", "--local-port", "7000"]);

        assert_eq!(
            params,
            Some(OpenParams::Udp {
                local_port: 7000,
                remote: None
            })
        );
    }

    #[test]
    fn tcp_client_endpoint() {
        let (params, _) = params(&["tetherhost", "tcp-client", "localhost:9000"]);

        assert_eq!(
            params,
            Some(OpenParams::TcpClient(NetworkEndpoint::new("localhost", 9000)))
        );
    }

    #[test]
    fn rtt_libraries_replace_the_search_list() {
        let (params, config) = params(&[
            "tetherhost",
            "rtt",
            "--chip",
            "nRF52840_xxAA",
            "--interface",
            "jtag",
            "--library",
            "/opt/jlink/libjlinkarm.so",
        ]);

        assert_eq!(
            params,
            Some(OpenParams::Rtt(RttParams {
                chip_name: "nRF52840_xxAA".into(),
                speed_khz: 4000,
                interface: WireProtocol::Jtag,
            }))
        );
        assert_eq!(
            config.rtt.library_paths,
            Some(vec![PathBuf::from("/opt/jlink/libjlinkarm.so")])
        );
    }

    #[test]
    fn ports_opens_nothing() {
        let (params, config) = params(&["tetherhost", "ports"]);

        assert_eq!(params, None);
        assert_eq!(config, ManagerConfig::default());
    }

    #[test]
    fn global_flags_after_the_subcommand() {
        let cli =
            Cli::try_parse_from(["tetherhost", "tcp-server", "4000", "--log-level", "DEBUG"])
                .unwrap();

        assert_eq!(cli.log_level, Some(LevelFilter::Debug));
    }
}
