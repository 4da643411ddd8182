//! C2 — Transport Adapter.
//!
//! Thin wrapper over the `mavlink` crate's codec. The real implementation
//! ([`MavlinkTransport`]) opens a `MavConnection` at source system 255,
//! component `MAV_COMP_ID_MISSIONPLANNER`, configured for MAVLink v2. Tests
//! substitute [`crate::transport`]'s trait object with an in-memory double
//! (`ChannelTransport` in `tests/link_integration.rs`) since the toolchain
//! cannot exercise a real serial port or socket here.

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use mavlink::ardupilotmega::MavMessage;
use mavlink::{MavHeader, MavlinkVersion};

use crate::error::LinkError;

pub const SOURCE_SYSTEM_ID: u8 = 255;
pub const SOURCE_COMPONENT_ID: u8 =
    mavlink::ardupilotmega::MavComponent::MAV_COMP_ID_MISSIONPLANNER as u8;

/// Outcome of a single `recv` attempt, classified per spec.md §4.2.
pub enum RecvOutcome {
    /// A frame was decoded.
    Frame(MavHeader, MavMessage),
    /// No frame arrived before the inner timeout; not an error.
    Timeout,
    /// Decode failure or short read: log and retry.
    Transient,
    /// The read loop should terminate gracefully (e.g. the active flag
    /// flipped while `recv` was blocked).
    Interrupted,
    /// The link is gone; the caller must break out of its loop.
    Fatal,
}

/// Dependency-injection seam for C2, so C3–C5 never talk to `mavlink`
/// directly. Implementors must serialize all sends on one lock — see
/// spec.md §5's `sending_command_lock` requirement.
pub trait MavTransport: Send + Sync {
    fn recv_with_timeout(&self, timeout: Duration) -> RecvOutcome;
    fn send(&self, header: &MavHeader, message: &MavMessage) -> Result<(), LinkError>;
    fn close(&self);
}

/// What the background reader thread (see below) hands back for a single
/// `connection.recv()` call, before the timeout is applied.
enum ReaderEvent {
    Frame(MavHeader, MavMessage),
    Transient,
    Interrupted,
    Fatal,
}

/// Real implementation, backed by `mavlink::connect`. `MavConnection::recv`
/// has no timeout of its own (see `examples/mavlink-rust-mavlink/src/connection/mod.rs`),
/// so a dedicated reader thread drains it and feeds a channel; `recv_with_timeout`
/// applies the actual timeout with `Receiver::recv_timeout`, the same pattern
/// `reservation.rs`'s `wait()` uses for its own inner poll.
pub struct MavlinkTransport {
    connection: Arc<dyn mavlink::MavConnection<MavMessage> + Send + Sync>,
    send_lock: Mutex<()>,
    reader_rx: Mutex<Receiver<ReaderEvent>>,
}

impl MavlinkTransport {
    /// Opens `url` (e.g. `serial:/dev/ttyUSB0:115200` or `udpout:127.0.0.1:14550`)
    /// configured for MAVLink v2, per spec.md §6.
    pub fn open(url: &str) -> Result<Self, LinkError> {
        let mut connection =
            mavlink::connect::<MavMessage>(url).map_err(|err| LinkError::OpenFailure {
                url: url.to_string(),
                source: anyhow::Error::new(err),
            })?;
        connection.set_protocol_version(MavlinkVersion::V2);
        let connection: Arc<dyn mavlink::MavConnection<MavMessage> + Send + Sync> =
            Arc::from(connection);

        let (tx, rx) = mpsc::channel::<ReaderEvent>();
        {
            let connection = connection.clone();
            thread::spawn(move || loop {
                let event = match connection.recv() {
                    Ok((header, message)) => ReaderEvent::Frame(header, message),
                    Err(mavlink::error::MessageReadError::Io(err)) => match err.kind() {
                        io::ErrorKind::Interrupted => ReaderEvent::Interrupted,
                        _ => ReaderEvent::Fatal,
                    },
                    Err(_) => ReaderEvent::Transient,
                };
                let stop = matches!(event, ReaderEvent::Fatal | ReaderEvent::Interrupted);
                if tx.send(event).is_err() || stop {
                    break;
                }
            });
        }

        Ok(Self {
            connection,
            send_lock: Mutex::new(()),
            reader_rx: Mutex::new(rx),
        })
    }
}

impl MavTransport for MavlinkTransport {
    fn recv_with_timeout(&self, timeout: Duration) -> RecvOutcome {
        let rx = self.reader_rx.lock().unwrap();
        match rx.recv_timeout(timeout) {
            Ok(ReaderEvent::Frame(header, message)) => RecvOutcome::Frame(header, message),
            Ok(ReaderEvent::Transient) => RecvOutcome::Transient,
            Ok(ReaderEvent::Interrupted) => RecvOutcome::Interrupted,
            Ok(ReaderEvent::Fatal) => RecvOutcome::Fatal,
            Err(RecvTimeoutError::Timeout) => RecvOutcome::Timeout,
            // The reader thread exited (fatal I/O or dropped sender); treat
            // the transport as gone so the caller breaks out of its loop.
            Err(RecvTimeoutError::Disconnected) => RecvOutcome::Fatal,
        }
    }

    fn send(&self, header: &MavHeader, message: &MavMessage) -> Result<(), LinkError> {
        let _guard = self.send_lock.lock().unwrap();
        self.connection
            .send(header, message)
            .map_err(|err| LinkError::OpenFailure {
                url: "<send>".to_string(),
                source: anyhow::Error::new(err),
            })
    }

    fn close(&self) {
        // `mavlink::MavConnection` has no explicit close; dropping the
        // connection handle at link teardown releases the underlying fd.
        // The background reader thread may outlive this call if it is
        // blocked inside the untimed `connection.recv()` — it is not part
        // of `RadioLink`'s joined worker set for exactly that reason.
    }
}

pub fn header() -> MavHeader {
    MavHeader {
        system_id: SOURCE_SYSTEM_ID,
        component_id: SOURCE_COMPONENT_ID,
        sequence: 0,
    }
}
