//! Process-level statistics over gathered per-rank arrays

use crate::watch::SectionKind;
use serde::Serialize;

/// Statistics of one section across the process group.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SectionStats {
    pub time_av: f64,
    pub time_sd: f64,
    pub flop_av: f64,
    pub flop_sd: f64,
    /// Total calls summed over all processes.
    pub count_sum: u64,
    /// Mean call count, rounded to nearest.
    pub count_av: u64,
    /// Straggler: the slowest process, tracked for communication sections.
    pub time_comm: f64,
}

impl SectionStats {
    /// Compute mean, sample standard deviation (N>1) and the communication
    /// straggler from the all-gathered per-process arrays.
    pub fn compute(
        time_array: &[f64],
        flop_array: &[f64],
        count_array: &[u64],
        kind: SectionKind,
    ) -> Self {
        let n = time_array.len();
        if n == 0 {
            return SectionStats::default();
        }
        let nf = n as f64;

        let time_av = time_array.iter().sum::<f64>() / nf;
        let flop_av = flop_array.iter().sum::<f64>() / nf;
        let count_sum: u64 = count_array.iter().sum();
        let count_av = (count_sum as f64 / nf).round() as u64;

        let (mut time_sd, mut flop_sd) = (0.0, 0.0);
        if n > 1 {
            for i in 0..n {
                let dt = time_array[i] - time_av;
                let df = flop_array[i] - flop_av;
                time_sd += dt * dt;
                flop_sd += df * df;
            }
            time_sd = (time_sd / (nf - 1.0)).sqrt();
            flop_sd = (flop_sd / (nf - 1.0)).sqrt();
        }

        let time_comm = if kind == SectionKind::Communication {
            time_array.iter().copied().fold(0.0, f64::max)
        } else {
            0.0
        };

        SectionStats {
            time_av,
            time_sd,
            flop_av,
            flop_sd,
            count_sum,
            count_av,
            time_comm,
        }
    }

    /// Mean time per call, falling back to the job-wide ratio when the
    /// rounded mean count is zero.
    pub fn time_per_call(&self, num_process: usize) -> f64 {
        if self.count_av != 0 {
            self.time_av / self.count_av as f64
        } else if self.count_sum != 0 {
            num_process as f64 * self.time_av / self.count_sum as f64
        } else {
            0.0
        }
    }
}

/// Render order for the report: descending mean time, never-executed
/// sections weighted zero, ties stable on registration order.
pub fn sort_by_mean_time(stats: &[SectionStats]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..stats.len()).collect();
    let cost = |i: usize| {
        if stats[i].count_sum > 0 {
            stats[i].time_av
        } else {
            0.0
        }
    };
    order.sort_by(|&a, &b| cost(b).partial_cmp(&cost(a)).unwrap_or(std::cmp::Ordering::Equal));
    order
}
