//! Trace emission back-end interface
//!
//! Section labels and start/stop events can be forwarded to a post-mortem
//! trace writer (the original tool chain used Open Trace Format files). The
//! writer is a collaborator behind [`TraceBackend`]; the library only decides
//! when to emit and which metric value accompanies a stop event.

use parking_lot::Mutex;

pub trait TraceBackend: Send + Sync {
    /// Called once before any event, with the gathered group geometry and
    /// the base timestamp events are relative to.
    fn initialize(&self, num_process: usize, my_rank: usize, basename: &str, base_time: f64);

    /// Announce a section. Called once per section at registration.
    fn define_label(&self, id: usize, label: &str, exclusive: bool);

    fn event_start(&self, my_rank: usize, time: f64, id: usize);

    /// `value` carries the headline metric at FULL trace level, zero at ON.
    fn event_stop(&self, my_rank: usize, time: f64, id: usize, value: f64);

    /// Close the trace output. Called at most once, by `post_trace`.
    fn finalize(&self, basename: &str, unit: &str);
}

/// Discards every event.
pub struct NullTrace;

impl TraceBackend for NullTrace {
    fn initialize(&self, _num_process: usize, _my_rank: usize, _basename: &str, _base_time: f64) {}
    fn define_label(&self, _id: usize, _label: &str, _exclusive: bool) {}
    fn event_start(&self, _my_rank: usize, _time: f64, _id: usize) {}
    fn event_stop(&self, _my_rank: usize, _time: f64, _id: usize, _value: f64) {}
    fn finalize(&self, _basename: &str, _unit: &str) {}
}

/// One recorded trace event, for assertions in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    Initialize {
        num_process: usize,
        basename: String,
    },
    Label {
        id: usize,
        label: String,
        exclusive: bool,
    },
    Start {
        id: usize,
    },
    Stop {
        id: usize,
        value: f64,
    },
    Finalize {
        unit: String,
    },
}

/// Keeps every event in memory; the test double for [`TraceBackend`].
#[derive(Default)]
pub struct RecordingTrace {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }
}

impl TraceBackend for RecordingTrace {
    fn initialize(&self, num_process: usize, _my_rank: usize, basename: &str, _base_time: f64) {
        self.events.lock().push(TraceEvent::Initialize {
            num_process,
            basename: basename.to_string(),
        });
    }

    fn define_label(&self, id: usize, label: &str, exclusive: bool) {
        self.events.lock().push(TraceEvent::Label {
            id,
            label: label.to_string(),
            exclusive,
        });
    }

    fn event_start(&self, _my_rank: usize, _time: f64, id: usize) {
        self.events.lock().push(TraceEvent::Start { id });
    }

    fn event_stop(&self, _my_rank: usize, _time: f64, id: usize, value: f64) {
        self.events.lock().push(TraceEvent::Stop { id, value });
    }

    fn finalize(&self, _basename: &str, unit: &str) {
        self.events.lock().push(TraceEvent::Finalize {
            unit: unit.to_string(),
        });
    }
}
