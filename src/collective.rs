//! Message-passing substrate for cross-process aggregation
//!
//! The report phase needs all-gather, sum reduction and a barrier over the
//! process group. The transport is a collaborator behind the [`Collective`]
//! trait: a real deployment binds it to its message-passing runtime, a plain
//! run uses [`SingleProcess`], and tests use [`ProcessGroup`] which connects
//! N in-process "ranks" through shared memory.
//!
//! A failed collective is fatal to the whole group; there is no partial
//! recovery from a rank that stops participating.

use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("all-gather failed across the process group: {0}")]
    Gather(String),
    #[error("reduction failed across the process group: {0}")]
    Reduce(String),
    #[error("barrier failed across the process group: {0}")]
    Barrier(String),
}

pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Gather `local` from every rank; every rank receives the concatenation
    /// in rank order. All ranks must pass slices of equal length.
    fn all_gather_f64(&self, local: &[f64]) -> Result<Vec<f64>, CollectiveError>;

    fn all_gather_u64(&self, local: u64) -> Result<Vec<u64>, CollectiveError>;

    fn reduce_sum_u64(&self, local: u64) -> Result<u64, CollectiveError> {
        Ok(self.all_gather_u64(local)?.iter().sum())
    }

    fn barrier(&self) -> Result<(), CollectiveError>;

    /// Tear down the whole process group after an unrecoverable failure.
    fn abort(&self) -> ! {
        std::process::abort();
    }
}

/// The degenerate single-rank group: every collective is a local copy.
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather_f64(&self, local: &[f64]) -> Result<Vec<f64>, CollectiveError> {
        Ok(local.to_vec())
    }

    fn all_gather_u64(&self, local: u64) -> Result<Vec<u64>, CollectiveError> {
        Ok(vec![local])
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        Ok(())
    }
}

struct GroupState {
    barrier: Barrier,
    f64_slots: Mutex<Vec<Vec<f64>>>,
    u64_slots: Mutex<Vec<u64>>,
}

/// An in-memory N-rank group. `split(n)` returns one handle per rank; each
/// handle is moved onto the thread playing that rank. Collectives rendezvous
/// on a shared barrier, so every rank must take part in every operation in
/// the same order.
pub struct ProcessGroup {
    rank: usize,
    size: usize,
    state: Arc<GroupState>,
}

impl ProcessGroup {
    pub fn split(size: usize) -> Vec<ProcessGroup> {
        assert!(size > 0);
        let state = Arc::new(GroupState {
            barrier: Barrier::new(size),
            f64_slots: Mutex::new(vec![Vec::new(); size]),
            u64_slots: Mutex::new(vec![0; size]),
        });
        (0..size)
            .map(|rank| ProcessGroup {
                rank,
                size,
                state: Arc::clone(&state),
            })
            .collect()
    }
}

impl Collective for ProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather_f64(&self, local: &[f64]) -> Result<Vec<f64>, CollectiveError> {
        self.state.f64_slots.lock()[self.rank] = local.to_vec();
        self.state.barrier.wait();
        let gathered = {
            let slots = self.state.f64_slots.lock();
            if slots.iter().any(|s| s.len() != local.len()) {
                return Err(CollectiveError::Gather(
                    "ranks passed slices of different lengths".to_string(),
                ));
            }
            slots.concat()
        };
        // Hold every rank until all have read their copy.
        self.state.barrier.wait();
        Ok(gathered)
    }

    fn all_gather_u64(&self, local: u64) -> Result<Vec<u64>, CollectiveError> {
        self.state.u64_slots.lock()[self.rank] = local;
        self.state.barrier.wait();
        let gathered = self.state.u64_slots.lock().clone();
        self.state.barrier.wait();
        Ok(gathered)
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        self.state.barrier.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_identity() {
        let c = SingleProcess;
        assert_eq!(c.rank(), 0);
        assert_eq!(c.size(), 1);
        assert_eq!(c.all_gather_f64(&[1.5, 2.5]).unwrap(), vec![1.5, 2.5]);
        assert_eq!(c.all_gather_u64(7).unwrap(), vec![7]);
        assert_eq!(c.reduce_sum_u64(7).unwrap(), 7);
        c.barrier().unwrap();
    }

    #[test]
    fn test_process_group_all_gather_rank_order() {
        let ranks = ProcessGroup::split(3);
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|g| {
                std::thread::spawn(move || {
                    let mine = g.rank() as f64;
                    let out = g.all_gather_f64(&[mine, mine * 10.0]).unwrap();
                    (g.rank(), out)
                })
            })
            .collect();
        for h in handles {
            let (_, out) = h.join().unwrap();
            assert_eq!(out, vec![0.0, 0.0, 1.0, 10.0, 2.0, 20.0]);
        }
    }

    #[test]
    fn test_process_group_reduce_sum() {
        let ranks = ProcessGroup::split(4);
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|g| std::thread::spawn(move || g.reduce_sum_u64(g.rank() as u64 + 1).unwrap()))
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 10);
        }
    }

    #[test]
    fn test_process_group_back_to_back_collectives() {
        // Two gathers in a row must not bleed into each other.
        let ranks = ProcessGroup::split(2);
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|g| {
                std::thread::spawn(move || {
                    let a = g.all_gather_u64(g.rank() as u64).unwrap();
                    let b = g.all_gather_u64(g.rank() as u64 + 100).unwrap();
                    (a, b)
                })
            })
            .collect();
        for h in handles {
            let (a, b) = h.join().unwrap();
            assert_eq!(a, vec![0, 1]);
            assert_eq!(b, vec![100, 101]);
        }
    }
}
