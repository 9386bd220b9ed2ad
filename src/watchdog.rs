//! Liveness supervision for the serial link.
//!
//! The watchdog polls the link's shared health block. A connected link that
//! has delivered nothing for longer than the stall timeout (or, before its
//! first sample, the startup grace) gets marked [`ConnectionState::Stalled`],
//! which the reader thread answers by dropping the port and reconnecting.
//! While the link is down the watchdog also rescans the candidate device
//! list so a UI can keep its port picker fresh.

use crate::events::{EventBus, PipelineEvent};
use crate::link::{ConnectionState, LinkShared, PortOpener};

use log::{debug, warn};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Tuning for the watchdog's patience.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// How often health is checked.
    pub poll_interval: Duration,
    /// Quiet time allowed once samples have been flowing.
    pub stall_timeout: Duration,
    /// Quiet time allowed between connecting and the first sample.
    pub startup_grace: Duration,
    /// How often to rescan devices while disconnected.
    pub port_scan_interval: Duration,
}

enum Signal {
    Stop,
}

/// The supervision thread and its stop signal.
pub struct Watchdog {
    signal: Sender<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start supervising `shared`, publishing verdicts and device-list
    /// changes on `events`.
    pub fn spawn(
        shared: Arc<LinkShared>,
        opener: Arc<dyn PortOpener>,
        events: Arc<EventBus>,
        config: WatchdogConfig,
    ) -> Self {
        let (signal, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let mut known_ports: Option<Vec<PathBuf>> = None;
            let mut last_scan: Option<Instant> = None;
            loop {
                match rx.recv_timeout(config.poll_interval) {
                    Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                check_liveness(&shared, &events, &config);

                let due = match last_scan {
                    Some(at) => at.elapsed() >= config.port_scan_interval,
                    None => true,
                };
                if due {
                    scan_ports(&shared, opener.as_ref(), &events, &mut known_ports);
                    last_scan = Some(Instant::now());
                }
            }
            debug!("watchdog exiting");
        });
        Watchdog {
            signal,
            handle: Some(handle),
        }
    }

    /// Stop the supervision thread and wait for it.
    pub fn stop(&mut self) {
        let _ = self.signal.send(Signal::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn check_liveness(shared: &LinkShared, events: &EventBus, config: &WatchdogConfig) {
    if shared.state() != ConnectionState::Connected {
        return;
    }
    let health = shared.health();
    let connected_at = match health.connected_at {
        Some(at) => at,
        None => return,
    };

    let (quiet, allowed) = match health.last_sample_at {
        Some(last) => (last.elapsed(), config.stall_timeout),
        None => (connected_at.elapsed(), config.startup_grace),
    };
    if quiet > allowed && shared.mark_stalled() {
        warn!(
            "no samples for {}ms, marking the link stalled",
            quiet.as_millis()
        );
        events.publish(PipelineEvent::ConnectionStateChanged(
            ConnectionState::Stalled,
        ));
    }
}

fn scan_ports(
    shared: &LinkShared,
    opener: &dyn PortOpener,
    events: &EventBus,
    known: &mut Option<Vec<PathBuf>>,
) {
    // Only rescan while nothing is open; probing devices mid-capture can
    // upset some serial adapters.
    if shared.state() != ConnectionState::Disconnected {
        return;
    }
    match opener.list_ports() {
        Ok(mut ports) => {
            ports.sort();
            if known.as_ref() != Some(&ports) {
                debug!("candidate ports now {:?}", ports);
                events.publish(PipelineEvent::PortsChanged(ports.clone()));
                *known = Some(ports);
            }
        }
        Err(e) => debug!("port scan failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::DataPort;
    use std::io;
    use std::path::Path;
    use std::sync::Mutex;

    struct StaticPorts {
        ports: Mutex<Vec<PathBuf>>,
    }

    impl StaticPorts {
        fn new(ports: &[&str]) -> Arc<Self> {
            Arc::new(StaticPorts {
                ports: Mutex::new(ports.iter().map(PathBuf::from).collect()),
            })
        }

        fn set(&self, ports: &[&str]) {
            *self.ports.lock().unwrap() = ports.iter().map(PathBuf::from).collect();
        }
    }

    impl PortOpener for StaticPorts {
        fn list_ports(&self) -> io::Result<Vec<PathBuf>> {
            Ok(self.ports.lock().unwrap().clone())
        }

        fn open(
            &self,
            _path: &Path,
            _baud_rate: u32,
            _read_timeout: Duration,
        ) -> io::Result<Box<dyn DataPort>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "not openable"))
        }
    }

    fn test_config() -> WatchdogConfig {
        WatchdogConfig {
            poll_interval: Duration::from_millis(10),
            stall_timeout: Duration::from_millis(50),
            startup_grace: Duration::from_millis(100),
            port_scan_interval: Duration::from_millis(20),
        }
    }

    fn expect_stalled(rx: &mpsc::Receiver<PipelineEvent>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(PipelineEvent::ConnectionStateChanged(ConnectionState::Stalled)) =
                rx.recv_timeout(Duration::from_millis(100))
            {
                return;
            }
        }
        panic!("watchdog never called the stall");
    }

    #[test]
    fn a_silent_connection_stalls_after_the_grace() {
        let shared = LinkShared::connected_for_test(Duration::from_secs(3));
        let events = Arc::new(EventBus::new(64));
        let rx = events.subscribe();
        let mut dog = Watchdog::spawn(
            Arc::clone(&shared),
            StaticPorts::new(&[]),
            events,
            test_config(),
        );

        expect_stalled(&rx);
        assert_eq!(shared.state(), ConnectionState::Stalled);
        dog.stop();
    }

    #[test]
    fn a_fresh_connection_gets_its_grace_period() {
        let shared = LinkShared::connected_for_test(Duration::ZERO);
        let events = Arc::new(EventBus::new(64));
        let rx = events.subscribe();
        let mut config = test_config();
        config.startup_grace = Duration::from_secs(30);
        let mut dog = Watchdog::spawn(
            Arc::clone(&shared),
            StaticPorts::new(&[]),
            events,
            config,
        );

        thread::sleep(Duration::from_millis(100));
        assert_eq!(shared.state(), ConnectionState::Connected);
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(
                event,
                PipelineEvent::ConnectionStateChanged(ConnectionState::Stalled)
            ));
        }
        dog.stop();
    }

    #[test]
    fn recent_samples_keep_the_link_alive() {
        let shared = LinkShared::connected_for_test(Duration::from_secs(3));
        shared.note_sample_for_test();
        let events = Arc::new(EventBus::new(64));
        let mut config = test_config();
        config.stall_timeout = Duration::from_secs(30);
        let mut dog = Watchdog::spawn(
            Arc::clone(&shared),
            StaticPorts::new(&[]),
            events,
            config,
        );

        for _ in 0..10 {
            shared.note_sample_for_test();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(shared.state(), ConnectionState::Connected);
        dog.stop();
    }

    #[test]
    fn port_changes_are_announced_while_disconnected() {
        let shared = LinkShared::connected_for_test(Duration::ZERO);
        shared.force_state_for_test(ConnectionState::Disconnected);
        let opener = StaticPorts::new(&["/dev/ttyUSB0"]);
        let events = Arc::new(EventBus::new(64));
        let rx = events.subscribe();
        let mut dog = Watchdog::spawn(
            Arc::clone(&shared),
            Arc::clone(&opener) as Arc<dyn PortOpener>,
            events,
            test_config(),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut lists = Vec::new();
        while Instant::now() < deadline && lists.len() < 2 {
            if let Ok(PipelineEvent::PortsChanged(ports)) =
                rx.recv_timeout(Duration::from_millis(100))
            {
                lists.push(ports);
            }
            if lists.len() == 1 {
                opener.set(&["/dev/ttyUSB0", "/dev/ttyUSB1"]);
            }
        }
        assert_eq!(lists.len(), 2);
        assert_eq!(lists[0], vec![PathBuf::from("/dev/ttyUSB0")]);
        assert_eq!(
            lists[1],
            vec![PathBuf::from("/dev/ttyUSB0"), PathBuf::from("/dev/ttyUSB1")]
        );
        dog.stop();
    }
}
