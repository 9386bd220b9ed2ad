//! The assembled capture pipeline.
//!
//! [`Pipeline`] wires the serial link, the watchdog, the session recorder,
//! the record buffer, the storage writer, and the backup manager into one
//! object with a small command surface. Four threads run under it:
//!
//! - the link's reader, decoding frames off the port,
//! - the watchdog, calling stalls and rescanning devices,
//! - the dispatch thread, fanning samples out to subscribers and the
//!   recorder,
//! - the storage writer, draining the buffer to disk.
//!
//! Samples travel from the reader to the dispatch thread over a dedicated
//! channel, so a slow UI subscriber can never cost the recording path data.

use crate::backup::BackupManager;
use crate::buffer::RecordBuffer;
use crate::config::CaptureConfig;
use crate::events::{EventBus, PipelineEvent};
use crate::frame::Sample;
use crate::link::{ConnectionState, LinkError, PortOpener, SerialLink, SystemPorts};
use crate::session::{EndedSession, RecorderState, SessionError, SessionRecorder};
use crate::storage::{Store, StorageError, StorageWriter, WriterAlert, WriterHandle};
use crate::watchdog::Watchdog;

use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the dispatch thread checks its stop flag and alert queue.
const DISPATCH_POLL: Duration = Duration::from_millis(50);

/// The whole capture stack behind one handle.
pub struct Pipeline {
    config: CaptureConfig,
    events: Arc<EventBus>,
    store: Arc<Mutex<Store>>,
    recorder: Arc<Mutex<SessionRecorder>>,
    link: SerialLink,
    watchdog: Watchdog,
    writer: StorageWriter,
    writer_handle: WriterHandle,
    backups: BackupManager,
    dispatch: Option<JoinHandle<()>>,
    dispatch_stop: Arc<AtomicBool>,
}

impl Pipeline {
    /// Bring the pipeline up against whatever `opener` hands out. Opens the
    /// data directory (recovering any session a crash left open) and starts
    /// the watchdog, writer, and dispatch threads. Nothing is connected yet.
    pub fn new(config: CaptureConfig, opener: Arc<dyn PortOpener>) -> Result<Self, StorageError> {
        let events = Arc::new(EventBus::new(config.event_queue_depth));
        let store = Arc::new(Mutex::new(Store::open(&config.data_dir)?));
        let buffer = RecordBuffer::new();
        let recorder = Arc::new(Mutex::new(SessionRecorder::new(
            Arc::clone(&store),
            buffer.clone(),
            Arc::clone(&events),
        )));

        let (alert_tx, alert_rx) = mpsc::channel();
        let writer = StorageWriter::spawn(
            Arc::clone(&store),
            buffer.clone(),
            Arc::clone(&events),
            alert_tx,
            config.writer(),
        );
        let writer_handle = writer.handle();

        let (sample_tx, sample_rx) = mpsc::channel();
        let link = SerialLink::new(
            Arc::clone(&opener),
            Arc::clone(&events),
            sample_tx,
            config.link(),
        );
        let watchdog = Watchdog::spawn(
            link.shared(),
            opener,
            Arc::clone(&events),
            config.watchdog(),
        );

        let backups = BackupManager::new(&config.backup_dir);

        let dispatch_stop = Arc::new(AtomicBool::new(false));
        let dispatch = {
            let recorder = Arc::clone(&recorder);
            let events = Arc::clone(&events);
            let writer_handle = writer_handle.clone();
            let stop = Arc::clone(&dispatch_stop);
            let flush_batch = config.flush_batch;
            let end_flush_timeout = config.end_flush_timeout();
            thread::spawn(move || {
                dispatch_main(
                    sample_rx,
                    alert_rx,
                    recorder,
                    buffer,
                    writer_handle,
                    events,
                    flush_batch,
                    end_flush_timeout,
                    stop,
                );
            })
        };

        info!("pipeline up, data in {}", config.data_dir.display());
        Ok(Pipeline {
            config,
            events,
            store,
            recorder,
            link,
            watchdog,
            writer,
            writer_handle,
            backups,
            dispatch: Some(dispatch),
            dispatch_stop,
        })
    }

    /// [`Pipeline::new`] against the real serial backend.
    pub fn with_system_ports(config: CaptureConfig) -> Result<Self, StorageError> {
        Pipeline::new(config, Arc::new(SystemPorts))
    }

    /// The settings this pipeline runs with.
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// A fresh event subscription. Slow subscribers lose events, never data.
    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Where the link currently stands.
    pub fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Where the recorder currently stands.
    pub fn recorder_state(&self) -> RecorderState {
        self.recorder.lock().unwrap().state()
    }

    /// The registered participant, if any.
    pub fn participant(&self) -> Option<String> {
        self.recorder
            .lock()
            .unwrap()
            .participant()
            .map(str::to_string)
    }

    /// Paths of the candidate devices.
    pub fn list_ports(&self) -> Result<Vec<PathBuf>, LinkError> {
        self.link.list_ports()
    }

    /// Open `port` and start streaming from it.
    pub fn connect(&mut self, port: &Path) -> Result<(), LinkError> {
        self.link.connect(port)
    }

    /// Close the port, if one is open.
    pub fn disconnect(&mut self) {
        self.link.disconnect();
    }

    /// Register (or reselect) the participant new sessions belong to, then
    /// refresh the registry backup.
    pub fn register_participant(&mut self, participant_id: &str) -> Result<(), SessionError> {
        self.recorder
            .lock()
            .unwrap()
            .register_participant(participant_id)?;
        let registries = vec![self.store.lock().unwrap().participants_path()];
        self.backup_registries(&registries);
        Ok(())
    }

    /// Start a recording session for the registered participant.
    pub fn start_session(&mut self) -> Result<u64, SessionError> {
        let session_id = self.recorder.lock().unwrap().start_session()?;
        let registries = {
            let store = self.store.lock().unwrap();
            vec![store.participants_path(), store.sessions_path()]
        };
        self.backup_registries(&registries);
        Ok(session_id)
    }

    /// Stop accepting samples without ending the session.
    pub fn pause(&mut self) -> Result<(), SessionError> {
        self.recorder.lock().unwrap().pause()
    }

    /// Resume a paused session.
    pub fn resume(&mut self) -> Result<(), SessionError> {
        self.recorder.lock().unwrap().resume()
    }

    /// End the session: flush everything buffered, finalize the registry
    /// row, and back up the finished data file.
    pub fn end_session(&mut self) -> Result<EndedSession, SessionError> {
        let handle = self.writer_handle.clone();
        let timeout = self.config.end_flush_timeout();
        let ended = self
            .recorder
            .lock()
            .unwrap()
            .end_session(move || handle.flush(timeout))?;

        match self.backups.backup_file(&ended.data_path) {
            Ok(dest) => self.events.publish(PipelineEvent::BackupCompleted(dest)),
            Err(e) => {
                error!(
                    "could not back up {}: {}",
                    ended.data_path.display(),
                    e
                );
                self.events
                    .publish(PipelineEvent::BackupFailed(e.to_string()));
            }
        }
        let registries = vec![self.store.lock().unwrap().sessions_path()];
        self.backup_registries(&registries);
        Ok(ended)
    }

    fn backup_registries(&self, registries: &[PathBuf]) {
        for failure in self.backups.backup_registries(registries) {
            self.events
                .publish(PipelineEvent::BackupFailed(failure.to_string()));
        }
    }

    /// Wind everything down: end a live session, drop the link, stop the
    /// watchdog, dispatch, and writer threads. Safe to call twice.
    pub fn shutdown(&mut self) {
        if matches!(
            self.recorder_state(),
            RecorderState::Active | RecorderState::Paused
        ) {
            info!("session still live at shutdown, ending it");
            if let Err(e) = self.end_session() {
                error!("could not end the session during shutdown: {}", e);
            }
        }
        self.link.disconnect();
        self.watchdog.stop();
        self.dispatch_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.dispatch.take() {
            let _ = handle.join();
        }
        self.writer.stop();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch_main(
    sample_rx: Receiver<Sample>,
    alert_rx: Receiver<WriterAlert>,
    recorder: Arc<Mutex<SessionRecorder>>,
    buffer: RecordBuffer,
    writer: WriterHandle,
    events: Arc<EventBus>,
    flush_batch: usize,
    end_flush_timeout: Duration,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match sample_rx.recv_timeout(DISPATCH_POLL) {
            Ok(sample) => {
                events.publish(PipelineEvent::SampleReceived(sample));
                let recorded = recorder.lock().unwrap().on_sample(sample);
                if recorded && buffer.len() >= flush_batch {
                    writer.kick();
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        while let Ok(WriterAlert::RetriesExhausted(detail)) = alert_rx.try_recv() {
            force_end(&recorder, &writer, end_flush_timeout, &detail);
        }
    }
    debug!("dispatch exiting");
}

/// Storage has given up on a batch. Leaving the session open would keep
/// shoveling records into a buffer nothing drains, so close it here.
fn force_end(
    recorder: &Arc<Mutex<SessionRecorder>>,
    writer: &WriterHandle,
    end_flush_timeout: Duration,
    detail: &str,
) {
    let mut recorder = recorder.lock().unwrap();
    if !matches!(
        recorder.state(),
        RecorderState::Active | RecorderState::Paused
    ) {
        return;
    }
    error!("storage gave up ({}), force-ending the session", detail);
    match recorder.end_session(|| writer.flush(end_flush_timeout)) {
        Ok(ended) => warn!(
            "session {} closed after storage failure, data file may be incomplete",
            ended.session_id
        ),
        Err(e) => error!("could not close the session: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedPorts, SIM_PORT_NAME};
    use crate::storage::SessionStatus;
    use std::time::Instant;

    fn test_config(root: &Path) -> CaptureConfig {
        CaptureConfig {
            data_dir: root.join("data"),
            backup_dir: root.join("backup"),
            flush_interval_ms: 20,
            port_scan_interval_ms: 50,
            end_flush_timeout_ms: 5_000,
            // Roomy enough that an undrained test subscriber loses nothing.
            event_queue_depth: 4_096,
            ..CaptureConfig::default()
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn a_full_capture_run_lands_on_disk_and_in_backup() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let data_dir = config.data_dir.clone();
        let backup_dir = config.backup_dir.clone();
        let mut pipeline =
            Pipeline::new(config, Arc::new(SimulatedPorts::new(500.0))).unwrap();
        let events = pipeline.subscribe();

        pipeline.connect(Path::new(SIM_PORT_NAME)).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            pipeline.connection_state() == ConnectionState::Connected
        }));

        pipeline.register_participant("P1").unwrap();
        let session_id = pipeline.start_session().unwrap();
        assert_eq!(pipeline.recorder_state(), RecorderState::Active);

        // Let some samples flow.
        thread::sleep(Duration::from_millis(400));

        let ended = pipeline.end_session().unwrap();
        assert_eq!(ended.session_id, session_id);
        assert!(ended.clean);
        assert_eq!(pipeline.recorder_state(), RecorderState::Registered);

        let data = std::fs::read_to_string(&ended.data_path).unwrap();
        let rows = data.lines().count();
        assert!(rows > 10, "expected a header and many records, got {}", rows);
        assert!(data.starts_with("timestamp,elapsed_time,"));

        // The finished file got a timestamped backup.
        let backed_up = std::fs::read_dir(&backup_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with(&format!("session_{}", session_id))
            });
        assert!(backed_up);

        // And subscribers saw the lifecycle happen.
        let mut saw_backup = false;
        let mut saw_samples = false;
        while let Ok(event) = events.try_recv() {
            match event {
                PipelineEvent::BackupCompleted(_) => saw_backup = true,
                PipelineEvent::SampleReceived(_) => saw_samples = true,
                _ => {}
            }
        }
        assert!(saw_backup);
        assert!(saw_samples);

        pipeline.shutdown();
        drop(pipeline);

        let store = Store::open(&data_dir).unwrap();
        assert_eq!(store.session_status(session_id), Some(SessionStatus::Ended));
    }

    #[test]
    fn a_stalled_link_reconnects_without_losing_flushed_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.watchdog_poll_ms = 10;
        config.watchdog_timeout_ms = 60;
        config.startup_grace_ms = 2_000;
        config.reconnect_backoff_ms = 40;
        let data_dir = config.data_dir.clone();
        let sim = SimulatedPorts::new(500.0).stall_after(40);
        let mut pipeline = Pipeline::new(config, Arc::new(sim)).unwrap();
        let events = pipeline.subscribe();

        pipeline.connect(Path::new(SIM_PORT_NAME)).unwrap();
        pipeline.register_participant("P1").unwrap();
        let session_id = pipeline.start_session().unwrap();
        let data_path = data_dir.join(format!("session_{}.csv", session_id));

        // The simulator streams 40 frames and goes quiet; wait until some
        // of them are on disk before the watchdog calls the stall.
        assert!(wait_until(Duration::from_secs(5), || {
            std::fs::read_to_string(&data_path)
                .map(|text| text.lines().count() > 5)
                .unwrap_or(false)
        }));

        let wanted = [
            ConnectionState::Stalled,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ];
        let mut states = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline && !states.ends_with(&wanted) {
            if let Ok(PipelineEvent::ConnectionStateChanged(state)) =
                events.recv_timeout(Duration::from_millis(100))
            {
                states.push(state);
            }
        }
        assert!(states.ends_with(&wanted), "saw {:?}", states);
        let rows_before_reconnect =
            std::fs::read_to_string(&data_path).unwrap().lines().count();

        // The fresh port streams again; the file keeps growing past what
        // the first connection flushed.
        assert!(wait_until(Duration::from_secs(5), || {
            std::fs::read_to_string(&data_path)
                .map(|text| text.lines().count() > rows_before_reconnect + 5)
                .unwrap_or(false)
        }));

        let ended = pipeline.end_session().unwrap();
        assert!(ended.clean);
        assert!(
            std::fs::read_to_string(&ended.data_path)
                .unwrap()
                .lines()
                .count()
                > rows_before_reconnect
        );
        pipeline.shutdown();
    }

    #[test]
    fn session_commands_respect_the_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new(
            test_config(dir.path()),
            Arc::new(SimulatedPorts::new(500.0)),
        )
        .unwrap();

        assert!(matches!(
            pipeline.start_session(),
            Err(SessionError::NoParticipantRegistered)
        ));
        pipeline.register_participant("P1").unwrap();
        assert!(matches!(
            pipeline.pause(),
            Err(SessionError::InvalidTransition { .. })
        ));
        assert!(matches!(
            pipeline.end_session(),
            Err(SessionError::InvalidTransition { .. })
        ));
        pipeline.shutdown();
    }

    #[test]
    fn shutdown_closes_a_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let data_dir = config.data_dir.clone();
        let mut pipeline =
            Pipeline::new(config, Arc::new(SimulatedPorts::new(500.0))).unwrap();

        pipeline.connect(Path::new(SIM_PORT_NAME)).unwrap();
        pipeline.register_participant("P2").unwrap();
        let session_id = pipeline.start_session().unwrap();
        thread::sleep(Duration::from_millis(100));

        pipeline.shutdown();
        drop(pipeline);

        let store = Store::open(&data_dir).unwrap();
        assert_eq!(store.session_status(session_id), Some(SessionStatus::Ended));
        assert_eq!(store.open_session(), None);
    }

    #[test]
    fn registering_refreshes_the_registry_backup() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let backup_dir = config.backup_dir.clone();
        let mut pipeline =
            Pipeline::new(config, Arc::new(SimulatedPorts::new(500.0))).unwrap();

        pipeline.register_participant("P3").unwrap();
        let found = std::fs::read_dir(&backup_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("participants_"));
        assert!(found);
        pipeline.shutdown();
    }

    #[test]
    fn a_backup_failure_is_reported_but_never_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        // Occupy the backup path with a file so every copy attempt fails.
        std::fs::write(&config.backup_dir, "in the way").unwrap();
        let mut pipeline =
            Pipeline::new(config, Arc::new(SimulatedPorts::new(500.0))).unwrap();
        let events = pipeline.subscribe();

        pipeline.register_participant("P1").unwrap();
        let session_id = pipeline.start_session().unwrap();
        let ended = pipeline.end_session().unwrap();
        assert_eq!(ended.session_id, session_id);
        assert!(ended.clean);

        let mut saw_backup_failure = false;
        let mut saw_persistence_error = false;
        while let Ok(event) = events.try_recv() {
            match event {
                PipelineEvent::BackupFailed(_) => saw_backup_failure = true,
                PipelineEvent::PersistenceError(_) => saw_persistence_error = true,
                _ => {}
            }
        }
        assert!(saw_backup_failure);
        assert!(!saw_persistence_error);
        pipeline.shutdown();
    }
}
