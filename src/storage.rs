//! Persistence of records and the participant and session registries.
//!
//! Everything lives under one data directory:
//!
//! - `participants.csv` holds `participant_id,registered_at` rows, one per
//!   registered participant.
//! - `sessions.csv` holds `session_id,participant_id,started_at,ended_at,status`
//!   rows. The registry is append-only: starting a session appends an
//!   `Active` row, ending it appends an `Ended` row for the same id, and the
//!   last row per id is authoritative. That way the session row always exists
//!   on disk before the first data record, and a crash mid-session leaves an
//!   `Active` row that the next startup closes out.
//! - `session_<id>.csv` holds the data records of one session as
//!   `timestamp,elapsed_time,vertical_value,horizontal_value` rows, values
//!   written with six decimal places.
//!
//! [`Store`] owns the files and the in-memory indices rebuilt from them at
//! startup. [`StorageWriter`] runs the background thread that drains the
//! [`RecordBuffer`] in batches.

use crate::buffer::RecordBuffer;
use crate::events::{EventBus, PipelineEvent};

use chrono::Local;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// File name of the participant registry inside the data directory.
pub const PARTICIPANTS_FILE: &str = "participants.csv";

/// File name of the session registry inside the data directory.
pub const SESSIONS_FILE: &str = "sessions.csv";

const PARTICIPANTS_HEADER: [&str; 2] = ["participant_id", "registered_at"];
const SESSIONS_HEADER: [&str; 5] = [
    "session_id",
    "participant_id",
    "started_at",
    "ended_at",
    "status",
];
const DATA_HEADER: &str = "timestamp,elapsed_time,vertical_value,horizontal_value";

/// Human readable local time, the format used in every registry column.
const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// One persisted observation, the unit the recorder hands to the writer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    /// Wall-clock capture time in Unix seconds.
    pub timestamp: f64,
    /// Seconds since session start, excluding paused intervals.
    pub elapsed_seconds: f64,
    /// Vertical channel in volts.
    pub vertical_volts: f64,
    /// Horizontal channel in volts.
    pub horizontal_volts: f64,
}

impl Record {
    /// The CSV row for this record, six decimal places throughout.
    fn to_row(self) -> String {
        format!(
            "{:.6},{:.6},{:.6},{:.6}",
            self.timestamp, self.elapsed_seconds, self.vertical_volts, self.horizontal_volts
        )
    }
}

/// Lifecycle of a session as recorded in the session registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The session is (or was, if the process died) recording.
    Active,
    /// The session finished and its data file is complete.
    Ended,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "Active"),
            SessionStatus::Ended => write!(f, "Ended"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active" => Ok(SessionStatus::Active),
            "Ended" => Ok(SessionStatus::Ended),
            _ => Err(()),
        }
    }
}

/// The error type for everything that can go wrong below the recorder.
#[derive(Debug)]
pub enum StorageError {
    /// Registering a participant id that is already in the registry.
    DuplicateParticipant(String),
    /// A record or flush arrived while no session data file was open.
    NoOpenSession,
    /// Starting a session while another one still has its file open.
    SessionAlreadyOpen(u64),
    /// The background writer is gone, so a flush could not be requested.
    WriterStopped,
    /// The background writer did not acknowledge a flush in time.
    FlushTimeout,
    /// Plain io failure underneath any of the files.
    Io(std::io::Error),
    /// A registry row could not be written or read back.
    Csv(csv::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageError::DuplicateParticipant(id) => {
                write!(f, "participant {:?} is already registered", id)
            }
            StorageError::NoOpenSession => write!(f, "no session data file is open"),
            StorageError::SessionAlreadyOpen(id) => {
                write!(f, "session {} still has its data file open", id)
            }
            StorageError::WriterStopped => write!(f, "storage writer is not running"),
            StorageError::FlushTimeout => write!(f, "storage writer did not finish flushing"),
            StorageError::Io(e) => write!(f, "io error: {}", e),
            StorageError::Csv(e) => write!(f, "csv error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        StorageError::Io(value)
    }
}

impl From<csv::Error> for StorageError {
    fn from(value: csv::Error) -> Self {
        StorageError::Csv(value)
    }
}

#[derive(Debug, Clone)]
struct SessionRow {
    participant_id: String,
    started_at: String,
    ended_at: String,
    status: SessionStatus,
}

#[derive(Debug)]
struct SessionFile {
    id: u64,
    writer: BufWriter<File>,
}

/// The data directory, its registries, and the currently open session file.
#[derive(Debug)]
pub struct Store {
    data_dir: PathBuf,
    participants: BTreeSet<String>,
    sessions: BTreeMap<u64, SessionRow>,
    session_file: Option<SessionFile>,
}

impl Store {
    /// Open (creating if necessary) the data directory and registries, then
    /// rebuild the in-memory indices from what is on disk. Sessions whose
    /// last registry row is still `Active` are relics of a crash and get an
    /// `Ended` row appended on the spot.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let mut store = Store {
            data_dir,
            participants: BTreeSet::new(),
            sessions: BTreeMap::new(),
            session_file: None,
        };

        store.ensure_registry(&store.participants_path(), &PARTICIPANTS_HEADER)?;
        store.ensure_registry(&store.sessions_path(), &SESSIONS_HEADER)?;
        store.load_participants()?;
        store.load_sessions()?;
        store.recover_stale_sessions()?;

        info!(
            "opened data directory {} ({} participants, {} sessions on record)",
            store.data_dir.display(),
            store.participants.len(),
            store.sessions.len()
        );
        Ok(store)
    }

    /// Path of the participant registry.
    pub fn participants_path(&self) -> PathBuf {
        self.data_dir.join(PARTICIPANTS_FILE)
    }

    /// Path of the session registry.
    pub fn sessions_path(&self) -> PathBuf {
        self.data_dir.join(SESSIONS_FILE)
    }

    /// Path of the data file for a session id.
    pub fn session_data_path(&self, session_id: u64) -> PathBuf {
        self.data_dir.join(format!("session_{}.csv", session_id))
    }

    /// Whether a participant id is already in the registry.
    pub fn is_registered(&self, participant_id: &str) -> bool {
        self.participants.contains(participant_id)
    }

    /// The id the next session will get: one past the largest on record.
    pub fn next_session_id(&self) -> u64 {
        self.sessions.keys().next_back().map_or(1, |max| max + 1)
    }

    /// The id of the session whose data file is currently open, if any.
    pub fn open_session(&self) -> Option<u64> {
        self.session_file.as_ref().map(|f| f.id)
    }

    /// The registry status of a session id.
    pub fn session_status(&self, session_id: u64) -> Option<SessionStatus> {
        self.sessions.get(&session_id).map(|row| row.status)
    }

    /// Append a participant to the registry. Errs with
    /// [`StorageError::DuplicateParticipant`] if the id is already present;
    /// the registry is never double-appended.
    pub fn register_participant(&mut self, participant_id: &str) -> Result<(), StorageError> {
        if self.participants.contains(participant_id) {
            return Err(StorageError::DuplicateParticipant(
                participant_id.to_string(),
            ));
        }

        let registered_at = Local::now().format(TIMESTAMP_FMT).to_string();
        append_registry_row(
            &self.participants_path(),
            &[participant_id, &registered_at],
        )?;
        self.participants.insert(participant_id.to_string());
        info!("registered participant {:?}", participant_id);
        Ok(())
    }

    /// Allocate the next session id, create its data file with the header
    /// row, and append the `Active` registry row. The registry row is on disk
    /// before this returns, so no data record can ever precede it.
    pub fn begin_session(&mut self, participant_id: &str) -> Result<u64, StorageError> {
        if let Some(open) = self.open_session() {
            return Err(StorageError::SessionAlreadyOpen(open));
        }

        let id = self.next_session_id();
        let path = self.session_data_path(id);
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", DATA_HEADER)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        let started_at = Local::now().format(TIMESTAMP_FMT).to_string();
        let row = SessionRow {
            participant_id: participant_id.to_string(),
            started_at,
            ended_at: String::new(),
            status: SessionStatus::Active,
        };
        if let Err(e) = self.append_session_row(id, &row) {
            // Leave the registry consistent; the empty data file goes too.
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        self.sessions.insert(id, row);
        self.session_file = Some(SessionFile { id, writer });
        info!(
            "began session {} for participant {:?} ({})",
            id,
            participant_id,
            path.display()
        );
        Ok(id)
    }

    /// Append a batch of records to the open session file, then flush and
    /// fsync so they survive a crash.
    pub fn append_records(&mut self, batch: &[Record]) -> Result<(), StorageError> {
        let file = self.session_file.as_mut().ok_or(StorageError::NoOpenSession)?;
        for record in batch {
            writeln!(file.writer, "{}", record.to_row())?;
        }
        file.writer.flush()?;
        file.writer.get_ref().sync_all()?;
        debug!("persisted {} records to session {}", batch.len(), file.id);
        Ok(())
    }

    /// Close the open session: sync the data file, append the `Ended`
    /// registry row, and return the session id. The registry row is appended
    /// even if the final data sync failed, so the registry never shows a
    /// phantom live session.
    pub fn finish_session(&mut self) -> Result<u64, StorageError> {
        let mut file = self.session_file.take().ok_or(StorageError::NoOpenSession)?;
        let id = file.id;
        let sync_result = file
            .writer
            .flush()
            .and_then(|_| file.writer.get_ref().sync_all())
            .map_err(StorageError::Io);
        drop(file);

        let ended_at = Local::now().format(TIMESTAMP_FMT).to_string();
        let mut row = match self.sessions.get(&id) {
            Some(row) => row.clone(),
            None => SessionRow {
                participant_id: String::new(),
                started_at: ended_at.clone(),
                ended_at: String::new(),
                status: SessionStatus::Active,
            },
        };
        row.ended_at = ended_at;
        row.status = SessionStatus::Ended;
        self.append_session_row(id, &row)?;
        self.sessions.insert(id, row);

        info!("finished session {}", id);
        sync_result?;
        Ok(id)
    }

    fn ensure_registry(&self, path: &Path, header: &[&str]) -> Result<(), StorageError> {
        if !path.exists() {
            append_registry_row(path, header)?;
            info!("created registry {}", path.display());
        }
        Ok(())
    }

    fn append_session_row(&self, id: u64, row: &SessionRow) -> Result<(), StorageError> {
        append_registry_row(
            &self.sessions_path(),
            &[
                &id.to_string(),
                &row.participant_id,
                &row.started_at,
                &row.ended_at,
                &row.status.to_string(),
            ],
        )
    }

    fn load_participants(&mut self) -> Result<(), StorageError> {
        let mut reader = csv::Reader::from_path(self.participants_path())?;
        for result in reader.records() {
            let record = result?;
            match record.get(0) {
                Some(id) if !id.is_empty() => {
                    self.participants.insert(id.to_string());
                }
                _ => warn!("skipping malformed participant registry row"),
            }
        }
        Ok(())
    }

    fn load_sessions(&mut self) -> Result<(), StorageError> {
        let mut reader = csv::Reader::from_path(self.sessions_path())?;
        for result in reader.records() {
            let record = result?;
            let id = record.get(0).and_then(|s| s.parse::<u64>().ok());
            let status = record
                .get(4)
                .and_then(|s| SessionStatus::from_str(s).ok());
            match (id, status) {
                (Some(id), Some(status)) => {
                    self.sessions.insert(
                        id,
                        SessionRow {
                            participant_id: record.get(1).unwrap_or_default().to_string(),
                            started_at: record.get(2).unwrap_or_default().to_string(),
                            ended_at: record.get(3).unwrap_or_default().to_string(),
                            status,
                        },
                    );
                }
                _ => warn!("skipping malformed session registry row"),
            }
        }
        Ok(())
    }

    fn recover_stale_sessions(&mut self) -> Result<(), StorageError> {
        let stale: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, row)| row.status == SessionStatus::Active)
            .map(|(id, _)| *id)
            .collect();

        for id in stale {
            warn!("session {} was still marked Active on disk, closing it", id);
            let mut row = self.sessions[&id].clone();
            row.ended_at = Local::now().format(TIMESTAMP_FMT).to_string();
            row.status = SessionStatus::Ended;
            self.append_session_row(id, &row)?;
            self.sessions.insert(id, row);
        }
        Ok(())
    }
}

/// Append one CSV row, flushed and fsynced before returning.
fn append_registry_row(path: &Path, fields: &[&str]) -> Result<(), StorageError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::Writer::from_writer(&file);
    writer.write_record(fields)?;
    writer.flush()?;
    drop(writer);
    file.sync_all()?;
    Ok(())
}

/// Raised by the writer thread when it has given up on a batch, so the
/// pipeline can force the session closed.
#[derive(Debug)]
pub enum WriterAlert {
    /// Persisting kept failing past the retry budget; carries the last error.
    RetriesExhausted(String),
}

enum WriterCommand {
    Kick,
    Flush(Sender<Result<(), StorageError>>),
    Shutdown,
}

/// Tuning for the background writer thread.
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    /// Longest a record waits before a time-based flush.
    pub flush_interval: Duration,
    /// Records per write batch.
    pub flush_batch: usize,
    /// Consecutive failed batches tolerated before giving up.
    pub max_retries: usize,
}

/// A cheap, cloneable way to talk to the writer thread.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: Sender<WriterCommand>,
}

impl WriterHandle {
    /// Nudge the writer to drain now, without waiting for the timer.
    pub fn kick(&self) {
        let _ = self.tx.send(WriterCommand::Kick);
    }

    /// Drain everything queued and wait for the writer to acknowledge, up to
    /// `timeout`.
    pub fn flush(&self, timeout: Duration) -> Result<(), StorageError> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.tx
            .send(WriterCommand::Flush(ack_tx))
            .map_err(|_| StorageError::WriterStopped)?;
        match ack_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(StorageError::FlushTimeout),
        }
    }
}

/// The background thread that moves records from the [`RecordBuffer`] into
/// the [`Store`]. Drains on a timer, on an explicit kick once a full batch is
/// waiting, and on demand for synchronous flushes.
pub struct StorageWriter {
    handle: Option<JoinHandle<()>>,
    tx: Sender<WriterCommand>,
}

impl StorageWriter {
    /// Spawn the writer thread.
    pub fn spawn(
        store: Arc<Mutex<Store>>,
        buffer: RecordBuffer,
        events: Arc<EventBus>,
        alerts: Sender<WriterAlert>,
        config: WriterConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let mut consecutive_failures = 0usize;
            loop {
                let drain = match rx.recv_timeout(config.flush_interval) {
                    Ok(WriterCommand::Kick) => true,
                    Ok(WriterCommand::Flush(ack)) => {
                        let result = drain_all(&store, &buffer, config.flush_batch);
                        if result.is_ok() {
                            consecutive_failures = 0;
                        }
                        let _ = ack.send(result);
                        false
                    }
                    Ok(WriterCommand::Shutdown) => {
                        if let Err(e) = drain_all(&store, &buffer, config.flush_batch) {
                            error!("final drain on shutdown failed: {}", e);
                            events.publish(PipelineEvent::PersistenceError(e.to_string()));
                        }
                        info!("storage writer stopped");
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => true,
                    Err(RecvTimeoutError::Disconnected) => break,
                };

                if !drain || buffer.is_empty() {
                    continue;
                }

                match drain_all(&store, &buffer, config.flush_batch) {
                    Ok(()) => consecutive_failures = 0,
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            "failed to persist batch ({} in a row): {}",
                            consecutive_failures, e
                        );
                        if consecutive_failures >= config.max_retries {
                            error!(
                                "giving up after {} failed persist attempts",
                                consecutive_failures
                            );
                            events.publish(PipelineEvent::PersistenceError(e.to_string()));
                            let _ = alerts.send(WriterAlert::RetriesExhausted(e.to_string()));
                            consecutive_failures = 0;
                        }
                    }
                }
            }
        });

        StorageWriter {
            handle: Some(handle),
            tx,
        }
    }

    /// A handle for kicking and flushing from other threads.
    pub fn handle(&self) -> WriterHandle {
        WriterHandle {
            tx: self.tx.clone(),
        }
    }

    /// Drain whatever is left and stop the thread.
    pub fn stop(&mut self) {
        let _ = self.tx.send(WriterCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StorageWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drain the buffer completely in batches. A failed batch goes back to the
/// front of the buffer untouched so arrival order survives the retry.
fn drain_all(
    store: &Arc<Mutex<Store>>,
    buffer: &RecordBuffer,
    batch_size: usize,
) -> Result<(), StorageError> {
    loop {
        let batch = buffer.drain_batch(batch_size);
        if batch.is_empty() {
            return Ok(());
        }
        let mut store = store.lock().unwrap();
        if let Err(e) = store.append_records(&batch) {
            // Requeue while still holding the store lock; a session
            // transition must not slip in between.
            buffer.requeue_front(batch);
            return Err(e);
        }
    }
}
