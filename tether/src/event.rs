//! Notifications pushed from the read tasks to whoever displays the stream.

use std::net::SocketAddr;
use std::sync::mpsc;

/// Something happened on the current connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A chunk of inbound bytes, in the order it was read.
    DataReceived(Vec<u8>),
    /// The link went away without a `close` request. Sent exactly once per loss.
    LinkError(String),
    /// A client connected to the TCP server and is now the current peer.
    PeerConnected(SocketAddr),
    /// The UDP transport learned its remote endpoint from an inbound packet.
    RemoteAdopted(SocketAddr),
}

/// Receiver of [`Event`]s. Called from background threads.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl EventSink for mpsc::Sender<Event> {
    fn emit(&self, event: Event) {
        // A dropped receiver just means nobody is listening anymore.
        if self.send(event).is_err() {
            tracing::trace!("Event receiver dropped, discarding event");
        }
    }
}

impl EventSink for mpsc::SyncSender<Event> {
    fn emit(&self, event: Event) {
        if self.send(event).is_err() {
            tracing::trace!("Event receiver dropped, discarding event");
        }
    }
}
