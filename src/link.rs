//! The serial link: device enumeration, the reader thread, and automatic
//! reconnection.
//!
//! A [`SerialLink`] owns one reader thread at a time. The thread pulls bytes
//! off the port through a [`FrameDecoder`] and sends the resulting samples
//! down a dedicated channel; read faults and watchdog stall verdicts send it
//! into a backoff-and-retry loop against the same device until someone calls
//! [`SerialLink::disconnect`]. Hardware access sits behind [`PortOpener`] so
//! the simulator and the tests can stand in for real devices.

use crate::events::{EventBus, PipelineEvent};
use crate::frame::{FrameDecoder, Sample};

use log::{debug, info, warn};
use serial2::SerialPort;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often the reconnect backoff re-checks the shutdown flag.
const BACKOFF_STEP: Duration = Duration::from_millis(50);

/// Where the link currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No device, and nobody trying to reach one.
    Disconnected,
    /// An open attempt is in flight.
    Connecting,
    /// A device is open and expected to stream.
    Connected,
    /// The device is open but has gone quiet past the watchdog's patience.
    Stalled,
    /// The link dropped and is waiting out the backoff before retrying.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Stalled => write!(f, "Stalled"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Why the link could not do what was asked of it.
#[derive(Debug)]
pub enum LinkError {
    /// The device could not be opened.
    Unavailable {
        /// The device that was asked for.
        port: PathBuf,
        /// What the open attempt said.
        source: io::Error,
    },
    /// The candidate devices could not be listed.
    Enumeration(io::Error),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkError::Unavailable { port, source } => {
                write!(f, "could not open {}: {}", port.display(), source)
            }
            LinkError::Enumeration(e) => write!(f, "could not list serial ports: {}", e),
        }
    }
}

impl std::error::Error for LinkError {}

/// One open byte stream from a device. A `TimedOut` or `WouldBlock` read
/// just means no data arrived yet and is not a fault.
pub trait DataPort: Send {
    /// Read whatever bytes are available into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Enumerates and opens [`DataPort`]s, so the simulator and the tests can
/// stand in for the real serial backend.
pub trait PortOpener: Send + Sync {
    /// Paths of the candidate devices.
    fn list_ports(&self) -> io::Result<Vec<PathBuf>>;

    /// Open one device at the given baud rate with the given read timeout.
    fn open(
        &self,
        path: &Path,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> io::Result<Box<dyn DataPort>>;
}

/// The real serial backend, backed by [`serial2`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn list_ports(&self) -> io::Result<Vec<PathBuf>> {
        let mut ports = SerialPort::available_ports()?;
        ports.sort();
        Ok(ports)
    }

    fn open(
        &self,
        path: &Path,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> io::Result<Box<dyn DataPort>> {
        let mut port = SerialPort::open(path, baud_rate)?;
        port.set_read_timeout(read_timeout)?;
        Ok(Box::new(port))
    }
}

impl DataPort for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SerialPort::read(self, buf)
    }
}

/// Data liveness of the current connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkHealth {
    /// When the current connection came up.
    pub connected_at: Option<Instant>,
    /// When the last good sample arrived.
    pub last_sample_at: Option<Instant>,
}

/// State shared between the link, its reader thread, and the watchdog.
#[derive(Debug)]
pub struct LinkShared {
    state: Mutex<ConnectionState>,
    health: Mutex<LinkHealth>,
    shutdown: AtomicBool,
}

impl LinkShared {
    fn new() -> Self {
        LinkShared {
            state: Mutex::new(ConnectionState::Disconnected),
            health: Mutex::new(LinkHealth::default()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// A copy of the liveness bookkeeping.
    pub fn health(&self) -> LinkHealth {
        *self.health.lock().unwrap()
    }

    /// Watchdog verdict: flip `Connected` to `Stalled`. Taken under the
    /// state lock so it cannot race a concurrent disconnect. Returns whether
    /// the verdict actually landed.
    pub(crate) fn mark_stalled(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Connected {
            *state = ConnectionState::Stalled;
            true
        } else {
            false
        }
    }

    fn set_state(&self, new: ConnectionState, events: &EventBus) {
        let mut state = self.state.lock().unwrap();
        if *state != new {
            info!("link: {} -> {}", *state, new);
            *state = new;
            drop(state);
            events.publish(PipelineEvent::ConnectionStateChanged(new));
        }
    }

    fn note_connected(&self) {
        *self.health.lock().unwrap() = LinkHealth {
            connected_at: Some(Instant::now()),
            last_sample_at: None,
        };
    }

    fn note_sample(&self) {
        self.health.lock().unwrap().last_sample_at = Some(Instant::now());
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
impl LinkShared {
    /// A shared block that looks like a connection `since` ago with no
    /// samples yet, for exercising the watchdog without a real link.
    pub(crate) fn connected_for_test(since: Duration) -> Arc<Self> {
        let shared = LinkShared::new();
        *shared.state.lock().unwrap() = ConnectionState::Connected;
        *shared.health.lock().unwrap() = LinkHealth {
            connected_at: Some(Instant::now() - since),
            last_sample_at: None,
        };
        Arc::new(shared)
    }

    pub(crate) fn force_state_for_test(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    pub(crate) fn note_sample_for_test(&self) {
        self.note_sample();
    }
}

/// Tuning for the link and its reconnect loop.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Read timeout on the port; bounds how quickly the reader notices
    /// shutdown and stall verdicts.
    pub read_timeout: Duration,
    /// How long to wait between reconnect attempts.
    pub reconnect_backoff: Duration,
}

/// The serial link and its reader thread.
pub struct SerialLink {
    opener: Arc<dyn PortOpener>,
    events: Arc<EventBus>,
    samples: Sender<Sample>,
    config: LinkConfig,
    shared: Arc<LinkShared>,
    reader: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// A link that is not connected to anything yet. Decoded samples go out
    /// through `samples`.
    pub fn new(
        opener: Arc<dyn PortOpener>,
        events: Arc<EventBus>,
        samples: Sender<Sample>,
        config: LinkConfig,
    ) -> Self {
        SerialLink {
            opener,
            events,
            samples,
            config,
            shared: Arc::new(LinkShared::new()),
            reader: None,
        }
    }

    /// The state block the watchdog supervises.
    pub fn shared(&self) -> Arc<LinkShared> {
        Arc::clone(&self.shared)
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Paths of the candidate devices.
    pub fn list_ports(&self) -> Result<Vec<PathBuf>, LinkError> {
        self.opener.list_ports().map_err(LinkError::Enumeration)
    }

    /// Open `port` and start reading from it. An already connected link
    /// disconnects first, so this doubles as switching devices.
    pub fn connect(&mut self, port: &Path) -> Result<(), LinkError> {
        if self.reader.is_some() {
            info!("link is already up, switching to {}", port.display());
            self.disconnect();
        }

        self.shared.shutdown.store(false, Ordering::Relaxed);
        self.shared.set_state(ConnectionState::Connecting, &self.events);

        let handle = match self
            .opener
            .open(port, self.config.baud_rate, self.config.read_timeout)
        {
            Ok(handle) => handle,
            Err(source) => {
                self.shared
                    .set_state(ConnectionState::Disconnected, &self.events);
                return Err(LinkError::Unavailable {
                    port: port.to_path_buf(),
                    source,
                });
            }
        };

        self.shared.note_connected();
        self.shared.set_state(ConnectionState::Connected, &self.events);

        let path = port.to_path_buf();
        let opener = Arc::clone(&self.opener);
        let shared = Arc::clone(&self.shared);
        let events = Arc::clone(&self.events);
        let samples = self.samples.clone();
        let config = self.config;
        self.reader = Some(thread::spawn(move || {
            reader_main(handle, path, opener, shared, events, samples, config);
        }));
        Ok(())
    }

    /// Stop the reader thread and close the device. Idempotent.
    pub fn disconnect(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        self.shared
            .set_state(ConnectionState::Disconnected, &self.events);
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

enum ReadExit {
    Shutdown,
    Stalled,
    Fault(String),
}

fn reader_main(
    mut port: Box<dyn DataPort>,
    path: PathBuf,
    opener: Arc<dyn PortOpener>,
    shared: Arc<LinkShared>,
    events: Arc<EventBus>,
    samples: Sender<Sample>,
    config: LinkConfig,
) {
    let mut decoder = FrameDecoder::new();
    loop {
        match read_phase(port.as_mut(), &mut decoder, &shared, &events, &samples) {
            ReadExit::Shutdown => break,
            ReadExit::Stalled => {
                warn!("{} went quiet, reconnecting", path.display());
            }
            ReadExit::Fault(detail) => {
                warn!("fault on {}: {}, reconnecting", path.display(), detail);
            }
        }
        // Whatever was half-received before the fault is garbage now.
        decoder.reset();
        match reconnect_phase(&path, opener.as_ref(), &shared, &events, config) {
            Some(reopened) => port = reopened,
            None => break,
        }
    }
    debug!("reader for {} exiting", path.display());
}

fn read_phase(
    port: &mut dyn DataPort,
    decoder: &mut FrameDecoder,
    shared: &LinkShared,
    events: &EventBus,
    samples: &Sender<Sample>,
) -> ReadExit {
    let mut scratch = [0u8; 256];
    loop {
        if shared.shutdown_requested() {
            return ReadExit::Shutdown;
        }
        if shared.state() == ConnectionState::Stalled {
            return ReadExit::Stalled;
        }

        match port.read(&mut scratch) {
            Ok(0) => return ReadExit::Fault("device closed the stream".to_string()),
            Ok(n) => {
                let decoded = decoder.push_bytes(&scratch[..n]);
                for reject in decoded.rejects {
                    warn!(
                        "dropped a bad frame: {} ({} more suppressed)",
                        reject.detail, reject.suppressed
                    );
                    events.publish(PipelineEvent::ParseError {
                        detail: reject.detail,
                        suppressed: reject.suppressed,
                    });
                }
                for sample in decoded.samples {
                    shared.note_sample();
                    if samples.send(sample).is_err() {
                        // Nobody is listening anymore; the pipeline is gone.
                        return ReadExit::Shutdown;
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return ReadExit::Fault(e.to_string()),
        }
    }
}

fn reconnect_phase(
    path: &Path,
    opener: &dyn PortOpener,
    shared: &LinkShared,
    events: &EventBus,
    config: LinkConfig,
) -> Option<Box<dyn DataPort>> {
    shared.set_state(ConnectionState::Reconnecting, events);
    loop {
        // Sit out the backoff in small steps so shutdown stays prompt.
        let mut waited = Duration::ZERO;
        while waited < config.reconnect_backoff {
            if shared.shutdown_requested() {
                return None;
            }
            let step = BACKOFF_STEP.min(config.reconnect_backoff - waited);
            thread::sleep(step);
            waited += step;
        }
        if shared.shutdown_requested() {
            return None;
        }

        shared.set_state(ConnectionState::Connecting, events);
        match opener.open(path, config.baud_rate, config.read_timeout) {
            Ok(port) => {
                shared.note_connected();
                shared.set_state(ConnectionState::Connected, events);
                info!("reconnected to {}", path.display());
                return Some(port);
            }
            Err(e) => {
                debug!("reconnect attempt on {} failed: {}", path.display(), e);
                shared.set_state(ConnectionState::Reconnecting, events);
            }
        }
    }
}
