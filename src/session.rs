//! The session recorder: participant selection, the recording state machine,
//! and pause-aware elapsed time accounting.
//!
//! The recorder moves through `Idle -> Registered -> Active <-> Paused`, and
//! ending a session returns it to `Registered` with the same participant
//! still selected. Samples only become [`Record`]s while `Active`; while
//! `Paused` they keep flowing to subscribers but are not recorded, and the
//! paused time is excluded from the elapsed column.

use crate::buffer::RecordBuffer;
use crate::events::{EventBus, PipelineEvent};
use crate::frame::Sample;
use crate::storage::{Record, StorageError, Store};

use log::{error, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};

/// Where the recorder is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// No participant selected yet; nothing can be recorded.
    Idle,
    /// A participant is selected and a session can start.
    Registered,
    /// A session is running and samples are being recorded.
    Active,
    /// A session is running but recording is suspended.
    Paused,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecorderState::Idle => write!(f, "Idle"),
            RecorderState::Registered => write!(f, "Registered"),
            RecorderState::Active => write!(f, "Active"),
            RecorderState::Paused => write!(f, "Paused"),
        }
    }
}

/// Refusals and failures of the recorder operations.
#[derive(Debug)]
pub enum SessionError {
    /// A session was started with no participant selected.
    NoParticipantRegistered,
    /// The participant id was empty after trimming.
    InvalidParticipant,
    /// The operation is not legal in the current state.
    InvalidTransition {
        /// What was attempted.
        operation: &'static str,
        /// The state the recorder was in at the time.
        state: RecorderState,
    },
    /// The registry or data file underneath refused.
    Storage(StorageError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::NoParticipantRegistered => {
                write!(f, "no participant is registered")
            }
            SessionError::InvalidParticipant => {
                write!(f, "participant id must not be empty")
            }
            SessionError::InvalidTransition { operation, state } => {
                write!(f, "cannot {} while {}", operation, state)
            }
            SessionError::Storage(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StorageError> for SessionError {
    fn from(value: StorageError) -> Self {
        SessionError::Storage(value)
    }
}

#[derive(Debug)]
struct ActiveSession {
    session_id: u64,
    started_at: Instant,
    paused_total: Duration,
    pause_began: Option<Instant>,
    last_elapsed: f64,
}

/// What [`SessionRecorder::end_session`] hands back for backup and reporting.
#[derive(Debug)]
pub struct EndedSession {
    /// Id of the session that just ended.
    pub session_id: u64,
    /// Path of the finished data file.
    pub data_path: PathBuf,
    /// False if the final flush or the registry finalization reported errors.
    pub clean: bool,
}

/// The state machine between the sample stream and storage.
pub struct SessionRecorder {
    store: Arc<Mutex<Store>>,
    buffer: RecordBuffer,
    events: Arc<EventBus>,
    participant: Option<String>,
    state: RecorderState,
    session: Option<ActiveSession>,
}

impl SessionRecorder {
    /// A recorder in `Idle`, attached to the store and record buffer.
    pub fn new(store: Arc<Mutex<Store>>, buffer: RecordBuffer, events: Arc<EventBus>) -> Self {
        SessionRecorder {
            store,
            buffer,
            events,
            participant: None,
            state: RecorderState::Idle,
            session: None,
        }
    }

    /// The current state.
    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// The selected participant, if any.
    pub fn participant(&self) -> Option<&str> {
        self.participant.as_deref()
    }

    /// Select a participant, registering the id if it is new. Re-registering
    /// a known id is not an error; it just selects that participant again.
    /// Only legal while `Idle` or `Registered`.
    pub fn register_participant(&mut self, participant_id: &str) -> Result<(), SessionError> {
        let participant_id = participant_id.trim();
        if participant_id.is_empty() {
            return Err(SessionError::InvalidParticipant);
        }
        match self.state {
            RecorderState::Idle | RecorderState::Registered => {}
            state => {
                return Err(SessionError::InvalidTransition {
                    operation: "register a participant",
                    state,
                })
            }
        }

        match self.store.lock().unwrap().register_participant(participant_id) {
            Ok(()) => {}
            Err(StorageError::DuplicateParticipant(_)) => {
                info!(
                    "participant {:?} already registered, selecting them again",
                    participant_id
                );
            }
            Err(e) => return Err(SessionError::Storage(e)),
        }

        self.participant = Some(participant_id.to_string());
        self.set_state(RecorderState::Registered);
        Ok(())
    }

    /// Start a new session for the selected participant. Returns its id.
    pub fn start_session(&mut self) -> Result<u64, SessionError> {
        match self.state {
            RecorderState::Registered => {}
            RecorderState::Idle => return Err(SessionError::NoParticipantRegistered),
            state => {
                return Err(SessionError::InvalidTransition {
                    operation: "start a session",
                    state,
                })
            }
        }
        let participant = self
            .participant
            .clone()
            .ok_or(SessionError::NoParticipantRegistered)?;

        let session_id = {
            let mut store = self.store.lock().unwrap();
            // A timed-out end-of-session flush can requeue its batch after
            // the stranded-record sweep. The store lock serializes against
            // that requeue, and anything still buffered belongs to an ended
            // session.
            let stale = self.buffer.len();
            if stale > 0 {
                warn!("discarding {} stale records from an earlier session", stale);
                self.buffer.clear();
            }
            store.begin_session(&participant)?
        };
        self.session = Some(ActiveSession {
            session_id,
            started_at: Instant::now(),
            paused_total: Duration::ZERO,
            pause_began: None,
            last_elapsed: 0.0,
        });
        self.set_state(RecorderState::Active);
        Ok(session_id)
    }

    /// Suspend recording. Samples arriving while paused are not recorded and
    /// the paused time will not show up in the elapsed column.
    pub fn pause(&mut self) -> Result<(), SessionError> {
        if self.state != RecorderState::Active {
            return Err(SessionError::InvalidTransition {
                operation: "pause",
                state: self.state,
            });
        }
        if let Some(session) = &mut self.session {
            session.pause_began = Some(Instant::now());
        }
        self.set_state(RecorderState::Paused);
        Ok(())
    }

    /// Resume recording; elapsed time continues from where pause stopped it.
    pub fn resume(&mut self) -> Result<(), SessionError> {
        if self.state != RecorderState::Paused {
            return Err(SessionError::InvalidTransition {
                operation: "resume",
                state: self.state,
            });
        }
        if let Some(session) = &mut self.session {
            if let Some(began) = session.pause_began.take() {
                session.paused_total += began.elapsed();
            }
        }
        self.set_state(RecorderState::Active);
        Ok(())
    }

    /// Route one sample. While `Active` it becomes a [`Record`] in the
    /// buffer; in every other state it is dropped from recording. Returns
    /// whether a record was queued.
    pub fn on_sample(&mut self, sample: Sample) -> bool {
        if self.state != RecorderState::Active {
            return false;
        }
        let session = match &mut self.session {
            Some(session) => session,
            None => return false,
        };

        let since_start = sample
            .taken_at
            .checked_duration_since(session.started_at)
            .unwrap_or_default();
        let mut elapsed = since_start
            .saturating_sub(session.paused_total)
            .as_secs_f64();
        // Elapsed time never runs backwards within a session.
        if elapsed < session.last_elapsed {
            elapsed = session.last_elapsed;
        }
        session.last_elapsed = elapsed;

        let timestamp = sample
            .wall_clock
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        self.buffer.push(Record {
            timestamp,
            elapsed_seconds: elapsed,
            vertical_volts: sample.vertical_volts.clamp(0.0, 5.0),
            horizontal_volts: sample.horizontal_volts.clamp(0.0, 5.0),
        });
        true
    }

    /// End the running session: flush the buffer through the writer (the
    /// caller supplies the bounded flush), finalize the registry row, close
    /// the data file, and return to `Registered`. Persistence trouble on the
    /// way out is reported through events and logs but never leaves the
    /// recorder stuck in `Active`.
    pub fn end_session<F>(&mut self, flush: F) -> Result<EndedSession, SessionError>
    where
        F: FnOnce() -> Result<(), StorageError>,
    {
        match self.state {
            RecorderState::Active | RecorderState::Paused => {}
            state => {
                return Err(SessionError::InvalidTransition {
                    operation: "end a session",
                    state,
                })
            }
        }
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                return Err(SessionError::InvalidTransition {
                    operation: "end a session",
                    state: self.state,
                })
            }
        };

        let mut clean = true;
        if let Err(e) = flush() {
            clean = false;
            error!("end-of-session flush failed: {}", e);
            self.events
                .publish(PipelineEvent::PersistenceError(e.to_string()));
        }

        let mut store = self.store.lock().unwrap();
        let session_id = match store.finish_session() {
            Ok(id) => id,
            Err(e) => {
                clean = false;
                error!("failed to finalize session {}: {}", session.session_id, e);
                self.events
                    .publish(PipelineEvent::PersistenceError(e.to_string()));
                session.session_id
            }
        };
        let data_path = store.session_data_path(session_id);
        drop(store);

        let stranded = self.buffer.len();
        if stranded > 0 {
            warn!(
                "dropping {} records that could not be flushed for session {}",
                stranded, session_id
            );
            self.buffer.clear();
        }

        self.set_state(RecorderState::Registered);
        Ok(EndedSession {
            session_id,
            data_path,
            clean,
        })
    }

    fn set_state(&mut self, state: RecorderState) {
        if self.state != state {
            self.state = state;
            info!("recorder is now {}", state);
            self.events
                .publish(PipelineEvent::RecordingStateChanged(state));
        }
    }
}
