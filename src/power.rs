//! Node power telemetry and control back-end interface
//!
//! Power draw is read per measured part (node, NUMA domain or finer) as
//! accumulated joules; the watch records the delta over each start/stop
//! pair. The knobs control node power features; each knob accepts a fixed
//! value menu and anything else is rejected before reaching the back-end.

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PowerError {
    #[error("power telemetry is not available on this system")]
    Unsupported,
    #[error("invalid value {value} for power knob {knob:?}")]
    BadValue { knob: PowerKnob, value: i32 },
    #[error("power back-end failure: {0}")]
    Backend(String),
}

/// Node power control knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerKnob {
    /// CPU frequency in MHz.
    CpuFreq,
    /// Memory access throttling percentage.
    MemoryThrottle,
    /// Instruction issue rate per cycle.
    Issue,
    /// Number of concurrent execution pipelines.
    Pipe,
    /// Eco mode state.
    Eco,
}

impl PowerKnob {
    /// The accepted value menu for this knob.
    pub fn valid_value(&self, value: i32) -> bool {
        match self {
            PowerKnob::CpuFreq => matches!(value, 2000 | 2200),
            PowerKnob::MemoryThrottle => (10..=100).contains(&value) && value % 10 == 0,
            PowerKnob::Issue => matches!(value, 2 | 4),
            PowerKnob::Pipe => matches!(value, 1 | 2),
            PowerKnob::Eco => matches!(value, 0 | 1 | 2),
        }
    }
}

pub trait PowerBackend: Send + Sync {
    /// Number of measured parts; zero disables power accounting.
    fn num_parts(&self) -> usize;

    /// Accumulated joules per part since an arbitrary origin.
    fn read_joules(&self, out: &mut [f64]) -> Result<(), PowerError>;

    fn read_knob(&self, knob: PowerKnob) -> Result<i32, PowerError>;

    fn write_knob(&self, knob: PowerKnob, value: i32) -> Result<(), PowerError>;
}

/// Back-end used when no power library is linked; disables the sub-feature.
pub struct NullPower;

impl PowerBackend for NullPower {
    fn num_parts(&self) -> usize {
        0
    }

    fn read_joules(&self, _out: &mut [f64]) -> Result<(), PowerError> {
        Err(PowerError::Unsupported)
    }

    fn read_knob(&self, _knob: PowerKnob) -> Result<i32, PowerError> {
        Err(PowerError::Unsupported)
    }

    fn write_knob(&self, _knob: PowerKnob, _value: i32) -> Result<(), PowerError> {
        Err(PowerError::Unsupported)
    }
}

/// In-memory power meter for tests: joule counters advanced by the test,
/// knob values stored as written.
pub struct FakePower {
    joules: Mutex<Vec<f64>>,
    cpu_freq: Mutex<i32>,
}

impl FakePower {
    pub fn new(num_parts: usize) -> Self {
        FakePower {
            joules: Mutex::new(vec![0.0; num_parts]),
            cpu_freq: Mutex::new(2200),
        }
    }

    /// Feed `joules` of consumption into every part.
    pub fn consume(&self, joules: f64) {
        for part in self.joules.lock().iter_mut() {
            *part += joules;
        }
    }
}

impl PowerBackend for FakePower {
    fn num_parts(&self) -> usize {
        self.joules.lock().len()
    }

    fn read_joules(&self, out: &mut [f64]) -> Result<(), PowerError> {
        let joules = self.joules.lock();
        for (slot, value) in out.iter_mut().zip(joules.iter()) {
            *slot = *value;
        }
        Ok(())
    }

    fn read_knob(&self, knob: PowerKnob) -> Result<i32, PowerError> {
        match knob {
            PowerKnob::CpuFreq => Ok(*self.cpu_freq.lock()),
            _ => Err(PowerError::Unsupported),
        }
    }

    fn write_knob(&self, knob: PowerKnob, value: i32) -> Result<(), PowerError> {
        if !knob.valid_value(value) {
            return Err(PowerError::BadValue { knob, value });
        }
        match knob {
            PowerKnob::CpuFreq => {
                *self.cpu_freq.lock() = value;
                Ok(())
            }
            _ => Err(PowerError::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_knob_value_menus() {
        assert!(PowerKnob::CpuFreq.valid_value(2200));
        assert!(!PowerKnob::CpuFreq.valid_value(1500));
        assert!(PowerKnob::MemoryThrottle.valid_value(70));
        assert!(!PowerKnob::MemoryThrottle.valid_value(75));
        assert!(!PowerKnob::MemoryThrottle.valid_value(0));
        assert!(PowerKnob::Issue.valid_value(4));
        assert!(!PowerKnob::Issue.valid_value(3));
        assert!(PowerKnob::Pipe.valid_value(1));
        assert!(PowerKnob::Eco.valid_value(2));
        assert!(!PowerKnob::Eco.valid_value(3));
    }

    #[test]
    fn test_null_power_is_disabled() {
        let backend = NullPower;
        assert_eq!(backend.num_parts(), 0);
        assert!(backend.read_knob(PowerKnob::CpuFreq).is_err());
    }

    #[test]
    fn test_fake_power_accumulates() {
        let backend = FakePower::new(2);
        backend.consume(5.0);
        backend.consume(2.5);
        let mut out = [0.0; 2];
        backend.read_joules(&mut out).unwrap();
        assert_eq!(out, [7.5, 7.5]);
    }

    #[test]
    fn test_fake_power_knob_round_trip() {
        let backend = FakePower::new(1);
        assert_eq!(backend.read_knob(PowerKnob::CpuFreq).unwrap(), 2200);
        backend.write_knob(PowerKnob::CpuFreq, 2000).unwrap();
        assert_eq!(backend.read_knob(PowerKnob::CpuFreq).unwrap(), 2000);
        assert!(backend.write_knob(PowerKnob::CpuFreq, 1234).is_err());
    }
}
