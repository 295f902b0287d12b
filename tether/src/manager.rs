//! The single owner of the current connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::config::{ConnectionKind, ManagerConfig, NetworkEndpoint, OpenParams, RttParams, SerialParams};
use crate::error::{CloseError, ConnectError, LinkError, SendError};
use crate::event::{Event, EventSink};
use crate::probe::jlink::library::NativeLibrary;
use crate::probe::jlink::JLinkFactory;
use crate::probe::ProbeFactory;
use crate::transport::{self, ReadContext, StopSignal, Transport};

/// Snapshot of the manager's connection.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub kind: Option<ConnectionKind>,
    pub connected: bool,
}

struct Active {
    kind: ConnectionKind,
    transport: Box<dyn Transport>,
    stop: StopSignal,
    generation: u64,
    reader: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    active: Option<Active>,
    next_generation: u64,
}

struct Shared {
    state: Mutex<State>,
    sink: Arc<dyn EventSink>,
}

/// Holds at most one connection and runs its read thread.
///
/// Inbound data and link failures are delivered to the [`EventSink`] given at construction. When
/// the link fails on its own, the connection is torn down before [`Event::LinkError`] is emitted,
/// so the manager is idle again by the time the sink hears about it.
pub struct TransportManager {
    shared: Arc<Shared>,
    // Serializes open and close as a whole, including joining the read thread. The read thread
    // never takes this lock.
    transition: Mutex<()>,
    config: ManagerConfig,
    probes: Arc<dyn ProbeFactory>,
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("state", &self.state())
            .field("probes", &self.probes)
            .finish()
    }
}

impl TransportManager {
    /// Creates a manager that opens RTT sessions through the J-Link library.
    pub fn new(sink: impl EventSink + 'static, config: ManagerConfig) -> Self {
        let candidates = config
            .rtt
            .library_paths
            .clone()
            .unwrap_or_else(NativeLibrary::default_candidates);
        Self::with_probe_factory(sink, config, JLinkFactory::new(candidates))
    }

    /// Creates a manager that opens RTT sessions through `probes`.
    pub fn with_probe_factory(
        sink: impl EventSink + 'static,
        config: ManagerConfig,
        probes: impl ProbeFactory + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                sink: Arc::new(sink),
            }),
            transition: Mutex::new(()),
            config,
            probes: Arc::new(probes),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        let state = self.shared.state.lock();
        ConnectionState {
            kind: state.active.as_ref().map(|active| active.kind),
            connected: state.active.is_some(),
        }
    }

    /// The locally bound address of a listening connection (TCP server, UDP).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let state = self.shared.state.lock();
        state
            .active
            .as_ref()
            .and_then(|active| active.transport.local_addr())
    }

    /// Connects `params` and starts its read thread.
    ///
    /// Fails with [`ConnectError::AlreadyConnected`] while another connection is open. On any
    /// failure the manager stays idle.
    pub fn open(&self, params: OpenParams) -> Result<(), ConnectError> {
        let _transition = self.transition.lock();

        if let Some(active) = &self.shared.state.lock().active {
            return Err(ConnectError::AlreadyConnected(active.kind));
        }

        // Connecting may take seconds; only the transition lock is held meanwhile.
        let kind = params.kind();
        tracing::debug!("Opening {kind} connection");
        let mut transport = transport::connect(&params, &self.config, self.probes.as_ref())?;

        let reader = match transport.read_loop() {
            Ok(reader) => reader,
            Err(error) => {
                discard(kind, transport.as_mut());
                return Err(error);
            }
        };

        // Held until `Active` is installed, so a reader that fails at once finds it in place.
        let mut state = self.shared.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;

        let stop = StopSignal::new();
        let ctx = ReadContext {
            stop: stop.clone(),
            sink: self.shared.sink.clone(),
        };
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("tether-reader-{generation}"))
            .spawn(move || {
                if let Err(error) = reader.run(ctx) {
                    link_lost(&shared, generation, error);
                }
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(error) => {
                discard(kind, transport.as_mut());
                return Err(ConnectError::Spawn(error));
            }
        };

        tracing::info!("{kind} connection open");
        state.active = Some(Active {
            kind,
            transport,
            stop,
            generation,
            reader: Some(handle),
        });
        Ok(())
    }

    pub fn open_serial(&self, params: SerialParams) -> Result<(), ConnectError> {
        self.open(OpenParams::Serial(params))
    }

    pub fn open_tcp_client(&self, endpoint: NetworkEndpoint) -> Result<(), ConnectError> {
        self.open(OpenParams::TcpClient(endpoint))
    }

    pub fn open_tcp_server(&self, local_port: u16) -> Result<(), ConnectError> {
        self.open(OpenParams::TcpServer { local_port })
    }

    pub fn open_udp(
        &self,
        local_port: u16,
        remote: Option<NetworkEndpoint>,
    ) -> Result<(), ConnectError> {
        self.open(OpenParams::Udp { local_port, remote })
    }

    pub fn open_rtt(&self, params: RttParams) -> Result<(), ConnectError> {
        self.open(OpenParams::Rtt(params))
    }

    /// Stops the read thread and releases the connection.
    ///
    /// The stop request is raised before the handle is torn down, so the read thread treats the
    /// resulting I/O error as the end of a voluntary close and no [`Event::LinkError`] is emitted.
    /// Returns once the read thread has finished, unless called from the read thread itself.
    ///
    /// An [`EventSink`] may call this from inside `emit`.
    pub fn close(&self) -> Result<(), CloseError> {
        let _transition = self.transition.lock();

        let (kind, result, reader) = {
            let mut state = self.shared.state.lock();
            let Some(mut active) = state.active.take() else {
                return Err(CloseError::NotConnected);
            };

            active.stop.request();
            let result = active.transport.close();
            (active.kind, result, active.reader.take())
        };

        if let Some(reader) = reader {
            if reader.thread().id() == thread::current().id() {
                tracing::debug!("Close requested from the read thread, not waiting for it");
            } else if reader.join().is_err() {
                tracing::warn!("The {kind} read thread panicked");
            }
        }

        tracing::info!("{kind} connection closed");
        result.map_err(|source| {
            tracing::warn!("Releasing the {kind} connection failed: {source}");
            CloseError::Teardown { kind, source }
        })
    }

    /// Writes `data` to the current connection.
    pub fn send(&self, data: &[u8]) -> Result<usize, SendError> {
        let mut state = self.shared.state.lock();
        let active = state.active.as_mut().ok_or(SendError::NotConnected)?;
        let written = active.transport.write(data)?;
        tracing::trace!("Sent {written} bytes over {}", active.kind);
        Ok(written)
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        if self.shared.state.lock().active.is_some() {
            if let Err(error) = self.close() {
                tracing::debug!("Close on drop: {error}");
            }
        }
    }
}

/// Releases a transport that never became active.
fn discard(kind: ConnectionKind, transport: &mut dyn Transport) {
    if let Err(error) = transport.close() {
        tracing::debug!("Releasing the half-opened {kind} connection failed: {error}");
    }
}

/// Tears down the connection after its read loop failed, unless it was closed or replaced already.
fn link_lost(shared: &Shared, generation: u64, error: LinkError) {
    let lost = {
        let mut state = shared.state.lock();
        let current = state
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation && !active.stop.is_requested());
        if current {
            state.active.take()
        } else {
            None
        }
    };

    let Some(mut active) = lost else {
        tracing::debug!("Read loop {generation} ended after close: {error}");
        return;
    };

    active.stop.request();
    if let Err(teardown) = active.transport.close() {
        tracing::warn!("Releasing the {} connection failed: {teardown}", active.kind);
    }
    // This is the read thread itself; dropping the handle detaches it.
    drop(active.reader.take());

    tracing::warn!("{} link lost: {error}", active.kind);
    shared.sink.emit(Event::LinkError(error.to_string()));
}
