//! Permon - section-based performance monitoring for parallel applications
//!
//! This library instruments applications with named measurement sections
//! bracketed by `start`/`stop` calls, and records per-section wall-clock time,
//! user-declared arithmetic or data-movement volume, hardware performance
//! counters and node power draw. At report time the per-thread records are
//! merged into the master thread, gathered across the process group, and
//! rendered as a layered statistics report.

pub mod collective;
pub mod config;
pub mod counters;
pub mod hwpc;
pub mod json_output;
pub mod monitor;
pub mod otf;
pub mod persist;
pub mod power;
pub mod registry;
pub mod report;
pub mod stats;
pub mod timer;
pub mod watch;

pub use collective::{Collective, CollectiveError, ProcessGroup, SingleProcess};
pub use config::{HwpcChooser, PowerLevel, ReportLevel, RuntimeEnv, TraceLevel};
pub use counters::{CounterBackend, CounterError, FakeCounters, NullCounters};
pub use monitor::{Monitor, MonitorBuilder};
pub use otf::{NullTrace, RecordingTrace, TraceBackend};
pub use power::{FakePower, NullPower, PowerBackend, PowerError, PowerKnob};
pub use watch::SectionKind;

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
