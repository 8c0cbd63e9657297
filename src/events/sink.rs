//! Output targets for drained outbox events.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use super::EventRecord;

/// Failure surfaced by a sink. The pump logs and retries later; events stay
/// pending until `mark_events_emitted` confirms delivery.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("sink disconnected")]
    Disconnected,
}

/// Abstraction over an output target that consumes full event records.
///
/// Implementations may block; the outbox pump runs on its own task and calls
/// sinks away from the scheduler's hot path.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EventRecord) -> Result<(), SinkError>;

    /// Emit a batch; the default forwards one by one and stops at the first
    /// failure.
    fn emit_batch(&self, events: &[EventRecord]) -> Result<(), SinkError> {
        for event in events {
            self.emit(event)?;
        }
        Ok(())
    }

    /// Flush any buffered output. Default is a no-op.
    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Line-per-event stdout sink.
#[derive(Default)]
pub struct StdOutSink;

impl EventSink for StdOutSink {
    fn emit(&self, event: &EventRecord) -> Result<(), SinkError> {
        let mut out = io::stdout().lock();
        writeln!(out, "{}", event.render_line())?;
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        io::stdout().lock().flush()?;
        Ok(())
    }
}

/// In-memory sink for tests and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<EventRecord>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone out everything captured so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.entries.lock().expect("sink lock").clone()
    }

    pub fn clear(&self) {
        self.entries.lock().expect("sink lock").clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &EventRecord) -> Result<(), SinkError> {
        self.entries.lock().expect("sink lock").push(event.clone());
        Ok(())
    }
}

/// Sink that forwards events over a flume channel, for streaming consumers.
pub struct ChannelSink {
    tx: flume::Sender<EventRecord>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: flume::Sender<EventRecord>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &EventRecord) -> Result<(), SinkError> {
        self.tx
            .send(event.clone())
            .map_err(|_| SinkError::Disconnected)
    }
}
