//! Raw hardware counter back-end interface
//!
//! The actual counter plumbing (PAPI, perf_event, or a vendor library) lives
//! behind [`CounterBackend`]. Reads are non-destructive snapshots taken on the
//! calling thread; `start`/`stop` exist for back-end quirks and must leave the
//! counters running.

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CounterError {
    /// The back-end rejected the event set (e.g. counter space exhausted).
    #[error("counter back-end rejected the event set: {0}")]
    Rejected(String),
    #[error("counter read failed: {0}")]
    ReadFailed(String),
}

/// Per-thread access to the raw counters.
///
/// `bind_events` binds the event set to the calling thread's counter context
/// and must be invoked once on every measurement thread before the first
/// read. All other calls refer to the calling thread's context.
pub trait CounterBackend: Send + Sync {
    fn bind_events(&self, names: &[&'static str]) -> Result<(), CounterError>;

    /// Snapshot current values into `out`, one slot per bound event.
    /// Never clears or stops the counters.
    fn read(&self, out: &mut [i64]) -> Result<(), CounterError>;

    /// Read and keep counting.
    fn start(&self, out: &mut [i64]) -> Result<(), CounterError> {
        self.read(out)
    }

    /// Read and keep counting.
    fn stop(&self, out: &mut [i64]) -> Result<(), CounterError> {
        self.read(out)
    }
}

/// Back-end used when no counter library is linked. Binding fails, which
/// downgrades the monitor to time-only measurement.
pub struct NullCounters;

impl CounterBackend for NullCounters {
    fn bind_events(&self, _names: &[&'static str]) -> Result<(), CounterError> {
        Err(CounterError::Rejected(
            "no hardware counter back-end linked".to_string(),
        ))
    }

    fn read(&self, out: &mut [i64]) -> Result<(), CounterError> {
        out.fill(0);
        Ok(())
    }
}

/// Deterministic in-memory counter grid for tests and examples.
///
/// Holds one monotonically increasing value per (thread, event). Tests drive
/// the counters forward with [`FakeCounters::bump`]; reads snapshot the grid
/// row of the calling thread (rayon worker index, or the master row outside
/// the pool).
pub struct FakeCounters {
    grid: Mutex<Vec<Vec<i64>>>,
    num_events: usize,
}

impl FakeCounters {
    pub fn new(num_threads: usize, num_events: usize) -> Self {
        FakeCounters {
            grid: Mutex::new(vec![vec![0; num_events]; num_threads.max(1)]),
            num_events,
        }
    }

    /// Advance one counter of one thread row.
    pub fn bump(&self, thread: usize, event: usize, amount: i64) {
        let mut grid = self.grid.lock();
        if thread < grid.len() && event < self.num_events {
            grid[thread][event] += amount;
        }
    }

    /// Advance one counter on every thread row.
    pub fn bump_all(&self, event: usize, amount: i64) {
        let mut grid = self.grid.lock();
        for row in grid.iter_mut() {
            if event < self.num_events {
                row[event] += amount;
            }
        }
    }

    fn thread_slot(&self) -> usize {
        rayon::current_thread_index().unwrap_or(0)
    }
}

impl CounterBackend for FakeCounters {
    fn bind_events(&self, names: &[&'static str]) -> Result<(), CounterError> {
        if names.len() > self.num_events {
            return Err(CounterError::Rejected(format!(
                "{} events requested, {} slots available",
                names.len(),
                self.num_events
            )));
        }
        Ok(())
    }

    fn read(&self, out: &mut [i64]) -> Result<(), CounterError> {
        let grid = self.grid.lock();
        let row = grid
            .get(self.thread_slot())
            .ok_or_else(|| CounterError::ReadFailed("thread row out of range".to_string()))?;
        for (slot, value) in out.iter_mut().zip(row.iter()) {
            *slot = *value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_counters_reject_binding() {
        let backend = NullCounters;
        assert!(backend.bind_events(&["SP_OPS"]).is_err());
        let mut out = [7i64; 2];
        backend.read(&mut out).unwrap();
        assert_eq!(out, [0, 0]);
    }

    #[test]
    fn test_fake_counters_bump_and_read() {
        let backend = FakeCounters::new(2, 2);
        backend.bind_events(&["SP_OPS", "DP_OPS"]).unwrap();
        backend.bump(0, 0, 100);
        backend.bump(0, 1, 5);
        let mut out = [0i64; 2];
        backend.read(&mut out).unwrap();
        assert_eq!(out, [100, 5]);
    }

    #[test]
    fn test_fake_counters_read_is_non_destructive() {
        let backend = FakeCounters::new(1, 1);
        backend.bump(0, 0, 42);
        let mut out = [0i64; 1];
        backend.read(&mut out).unwrap();
        backend.read(&mut out).unwrap();
        assert_eq!(out, [42]);
    }

    #[test]
    fn test_fake_counters_bump_all() {
        let backend = FakeCounters::new(3, 1);
        backend.bump_all(0, 10);
        backend.bump(1, 0, 5);
        let grid = backend.grid.lock();
        assert_eq!(grid[0][0], 10);
        assert_eq!(grid[1][0], 15);
        assert_eq!(grid[2][0], 10);
    }

    #[test]
    fn test_fake_counters_reject_oversized_event_set() {
        let backend = FakeCounters::new(1, 1);
        assert!(backend.bind_events(&["A", "B"]).is_err());
    }
}
