use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::{ReadContext, ReadLoop, Transport};
use crate::config::{ConnectionKind, ManagerConfig, RttParams};
use crate::error::{ConnectError, LinkError, SendError, TransportError};
use crate::event::Event;
use crate::probe::ProbeFactory;
use crate::rtt::{RttEngine, RttMode};

/// RTT through a debug probe, served by a fixed-interval poll loop.
#[derive(Debug)]
pub struct RttTransport {
    engine: Arc<Mutex<RttEngine>>,
    mode: RttMode,
    poll_interval: Duration,
}

impl RttTransport {
    pub fn connect(
        params: &RttParams,
        config: &ManagerConfig,
        probes: &dyn ProbeFactory,
    ) -> Result<Self, ConnectError> {
        let mut engine = RttEngine::new(config.rtt.clone());
        engine.open(probes)?;
        let mode = engine.connect(params)?;

        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
            mode,
            poll_interval: config.rtt_poll_interval,
        })
    }

    pub fn mode(&self) -> RttMode {
        self.mode
    }
}

impl Transport for RttTransport {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Rtt
    }

    fn read_loop(&mut self) -> Result<Box<dyn ReadLoop>, ConnectError> {
        Ok(Box::new(RttPoller {
            engine: self.engine.clone(),
            poll_interval: self.poll_interval,
        }))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SendError> {
        Ok(self.engine.lock().write(data)?)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.engine.lock().close();
        Ok(())
    }
}

struct RttPoller {
    engine: Arc<Mutex<RttEngine>>,
    poll_interval: Duration,
}

impl ReadLoop for RttPoller {
    fn run(self: Box<Self>, ctx: ReadContext) -> Result<(), LinkError> {
        while !ctx.stop.is_requested() {
            // The lock is only held for one poll, so writes and close get in between.
            let result = self.engine.lock().read();
            match result {
                Ok(Some(data)) => ctx.emit(Event::DataReceived(data)),
                Ok(None) => {}
                Err(error) => return ctx.finish(error.into()),
            }
            thread::sleep(self.poll_interval);
        }

        Ok(())
    }
}
