//! Broadcast of pipeline events to any number of subscribers.
//!
//! Display front-ends, loggers, and tests all watch the pipeline through the
//! same [`EventBus`]. Delivery is intentionally lossy: every subscriber gets
//! a bounded queue, and a subscriber that falls behind loses events rather
//! than stalling acquisition. The recording path does not ride this bus at
//! all; records travel over their own channel so a dead display can never
//! drop data.

use crate::frame::Sample;
use crate::link::ConnectionState;
use crate::session::RecorderState;

use log::debug;
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

/// Everything observable about the pipeline from the outside.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// The serial link moved to a new connection state.
    ConnectionStateChanged(ConnectionState),
    /// A well-formed sample came off the wire.
    SampleReceived(Sample),
    /// The session recorder moved to a new state.
    RecordingStateChanged(RecorderState),
    /// A malformed frame was dropped. `suppressed` counts rejects swallowed
    /// by rate limiting since the previous report.
    ParseError {
        /// What was wrong with the frame.
        detail: String,
        /// Rejects not individually reported since the last one.
        suppressed: u64,
    },
    /// Records could not be persisted.
    PersistenceError(String),
    /// A post-session backup finished; carries the backup file path.
    BackupCompleted(PathBuf),
    /// A backup copy failed. The primary files under the data directory are
    /// intact; only the spare copy is missing.
    BackupFailed(String),
    /// The set of candidate serial devices changed while disconnected.
    PortsChanged(Vec<PathBuf>),
}

/// Fan-out point for [`PipelineEvent`]s.
///
/// Subscribers come and go at any time; senders never block. A full queue
/// drops the event for that subscriber only, and a dropped receiver is pruned
/// on the next publish.
pub struct EventBus {
    subscribers: Mutex<Vec<SyncSender<PipelineEvent>>>,
    depth: usize,
}

impl EventBus {
    /// A bus whose subscriber queues hold `depth` events each.
    pub fn new(depth: usize) -> Self {
        EventBus {
            subscribers: Mutex::new(Vec::new()),
            depth,
        }
    }

    /// Attach a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        let (tx, rx) = sync_channel(self.depth);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber, dropping it for any whose
    /// queue is full and forgetting any that have hung up.
    pub fn publish(&self, event: PipelineEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("subscriber queue full, dropping event");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// How many subscribers are currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_to_every_subscriber() {
        let bus = EventBus::new(8);
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(PipelineEvent::PersistenceError("disk on fire".to_string()));

        for rx in [a, b] {
            match rx.try_recv() {
                Ok(PipelineEvent::PersistenceError(detail)) => {
                    assert_eq!(detail, "disk on fire")
                }
                other => panic!("expected a persistence error, got {:?}", other),
            }
        }
    }

    #[test]
    fn a_full_subscriber_loses_events_without_blocking() {
        let bus = EventBus::new(1);
        let rx = bus.subscribe();

        bus.publish(PipelineEvent::PersistenceError("first".to_string()));
        // Queue is full now; this one must be dropped, not block the caller.
        bus.publish(PipelineEvent::PersistenceError("second".to_string()));

        assert!(matches!(
            rx.try_recv(),
            Ok(PipelineEvent::PersistenceError(d)) if d == "first"
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new(4);
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(PipelineEvent::PortsChanged(Vec::new()));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }
}
