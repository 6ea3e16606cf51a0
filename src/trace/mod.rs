//! Lifecycle of one server-side execution trace.
//!
//! A [`TraceSession`] is an owned handle: the engine keeps it between
//! `start` and `stop`, nothing about it lives in process-wide state.

pub mod xevent;

pub use xevent::XEventTrace;

use crate::diagnostics::{Diagnostic, Outcome, Stage};
use crate::error::SessionError;
use crate::types::{RawEvent, TraceEvent};

use log::{debug, warn};
use std::thread;
use std::time::Duration;

/// The server side of a trace. Implementations talk to the database; the
/// session wrapper takes care of ordering and idempotence.
pub trait TraceSource: Send {
    fn name(&self) -> &str;

    /// Creates and starts capturing. Must not wait for workload activity.
    fn start(&mut self) -> Result<(), SessionError>;

    /// Everything captured and dispatched so far.
    fn read_raw(&mut self) -> Result<Vec<RawEvent>, SessionError>;

    /// What the capture buffer lost before or during the last read. Sources
    /// without a bounded buffer lose nothing.
    fn read_loss(&mut self) -> Result<BufferLoss, SessionError> {
        Ok(BufferLoss::default())
    }

    fn stop(&mut self) -> Result<(), SessionError>;

    /// Removes the session from the server. Safe on a session that is gone.
    fn drop_session(&mut self) -> Result<(), SessionError>;
}

/// Events a trace captured but could not hand back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferLoss {
    /// The read output was cut short
    pub truncated: bool,
    /// Events evicted from a full buffer
    pub dropped: u64,
}

impl BufferLoss {
    pub fn is_lossy(&self) -> bool {
        self.truncated || self.dropped > 0
    }
}

/// Hands out a fresh [`TraceSource`] for every session.
pub trait TraceFactory: Send + Sync {
    fn create(&self) -> Box<dyn TraceSource>;
}

impl<F> TraceFactory for F
where
    F: Fn() -> Box<dyn TraceSource> + Send + Sync,
{
    fn create(&self) -> Box<dyn TraceSource> {
        self()
    }
}

/// Bridges the asynchronous event dispatch on the server: called once after
/// the workload finished and before events are read.
pub trait WaitPolicy: Send + Sync {
    fn wait(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

impl WaitPolicy for FixedDelay {
    fn wait(&self) {
        debug!("Waiting {}ms for trace dispatch", self.0.as_millis());
        thread::sleep(self.0);
    }
}

/// For sources that deliver synchronously (tests, replay).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWait;

impl WaitPolicy for NoWait {
    fn wait(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Stopped,
    Dropped,
}

pub struct TraceSession {
    source: Box<dyn TraceSource>,
    state: SessionState,
}

impl TraceSession {
    /// Starts `source`. A failing start is fatal; whatever it left behind on
    /// the server is dropped before the error is returned.
    pub fn start(mut source: Box<dyn TraceSource>) -> Result<Self, SessionError> {
        if let Err(e) = source.start() {
            if let Err(cleanup) = source.drop_session() {
                warn!("Cleanup after failed start of '{}': {}", source.name(), cleanup);
            }
            return Err(e);
        }
        debug!("Trace session '{}' running", source.name());
        Ok(TraceSession {
            source,
            state: SessionState::Running,
        })
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Events captured so far, ordered by timestamp. Rows that fail to convert
    /// are dropped with a single warning; a failed read yields no events. Lost
    /// events can't be recovered, but they are reported since coverage is
    /// then under-counted.
    pub fn read_events(&mut self) -> Outcome<Vec<TraceEvent>> {
        if self.state == SessionState::Dropped {
            return Outcome::with(
                vec![],
                vec![Diagnostic::error(
                    Stage::Session,
                    format!("trace session '{}' was already dropped", self.name()),
                )],
            );
        }
        let raw = match self.source.read_raw() {
            Ok(raw) => raw,
            Err(e) => {
                return Outcome::with(vec![], vec![Diagnostic::error(Stage::Session, e.to_string())])
            }
        };

        let mut diagnostics = vec![];
        let mut bad = 0usize;
        let mut events: Vec<TraceEvent> = raw
            .iter()
            .filter_map(|r| match TraceEvent::from_raw(r) {
                Ok(event) => Some(event),
                Err(_) => {
                    bad += 1;
                    None
                }
            })
            .collect();
        if bad > 0 {
            diagnostics.push(Diagnostic::warning(
                Stage::Session,
                format!("{} trace events had an unreadable timestamp and were ignored", bad),
            ));
        }
        match self.source.read_loss() {
            Ok(loss) if loss.is_lossy() => diagnostics.push(Diagnostic::warning(
                Stage::Session,
                format!(
                    "trace buffer lost events (output truncated: {}, dropped: {}); coverage is under-reported",
                    loss.truncated, loss.dropped
                ),
            )),
            Ok(_) => {}
            Err(e) => diagnostics.push(Diagnostic::warning(
                Stage::Session,
                format!("could not check the trace buffer for lost events: {}", e),
            )),
        }
        // stable, so events sharing a timestamp keep the server's order
        events.sort_by_key(|e| e.timestamp);
        debug!("Read {} events from '{}'", events.len(), self.name());
        Outcome::with(events, diagnostics)
    }

    pub fn stop(&mut self) -> Option<Diagnostic> {
        if self.state != SessionState::Running {
            return None;
        }
        self.state = SessionState::Stopped;
        self.source
            .stop()
            .err()
            .map(|e| Diagnostic::warning(Stage::Session, e.to_string()))
    }

    /// Idempotent; only the first call reaches the server.
    pub fn drop_session(&mut self) -> Option<Diagnostic> {
        if self.state == SessionState::Dropped {
            return None;
        }
        self.state = SessionState::Dropped;
        self.source
            .drop_session()
            .err()
            .map(|e| Diagnostic::warning(Stage::Session, e.to_string()))
    }

    /// Stops and drops, collecting whatever failed.
    pub fn finish(mut self) -> Vec<Diagnostic> {
        self.stop().into_iter().chain(self.drop_session()).collect()
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        if let Some(d) = self.drop_session() {
            warn!("{}", d);
        }
    }
}
