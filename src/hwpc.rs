//! Hardware counter presets and derived-metric computation
//!
//! The chooser selects a fixed event set, the shape of the sorted metric
//! vector derived from the raw counts, and the unit of the headline rate.
//! Events carry a sharing policy: per-core events are summed across threads,
//! while events counted once per core-memory group (CMG) are prorated between
//! the processes sharing the group.

use crate::config::{HwpcChooser, Topology};
use crate::watch::SectionKind;
use tracing::warn;

/// Upper bound on raw events programmed per chooser.
pub const MAX_EVENTS: usize = 12;

/// Counting scope of one raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    /// Counted inside each compute core; thread values accumulate.
    PerCore,
    /// Counted once per core-memory group; thread values are replicas.
    PerCmg,
}

/// One raw counter event of a chooser's event set.
#[derive(Debug, Clone, Copy)]
pub struct EventDef {
    pub name: &'static str,
    pub sharing: Sharing,
}

const fn core(name: &'static str) -> EventDef {
    EventDef {
        name,
        sharing: Sharing::PerCore,
    }
}

const fn cmg(name: &'static str) -> EventDef {
    EventDef {
        name,
        sharing: Sharing::PerCmg,
    }
}

const FLOPS_EVENTS: &[EventDef] = &[core("SP_OPS"), core("DP_OPS")];
const BANDWIDTH_EVENTS: &[EventDef] = &[cmg("MEM_RD_CL"), cmg("MEM_WR_CL")];
const VECTOR_EVENTS: &[EventDef] = &[core("FP_SCALAR_OPS"), core("FP_VECTOR_OPS")];
const CACHE_EVENTS: &[EventDef] = &[
    core("LD_INS"),
    core("SR_INS"),
    core("L1_HIT"),
    core("L2_HIT"),
    core("L1_MISS"),
    core("L2_MISS"),
];
const CYCLE_EVENTS: &[EventDef] = &[core("TOT_CYC"), core("TOT_INS")];
const LOADSTORE_EVENTS: &[EventDef] = &[
    core("LD_INS"),
    core("SR_INS"),
    core("VEC_LD_INS"),
    core("VEC_SR_INS"),
];

/// The raw event set programmed for a chooser. Empty for USER mode.
pub fn event_table(chooser: HwpcChooser) -> &'static [EventDef] {
    match chooser {
        HwpcChooser::Flops => FLOPS_EVENTS,
        HwpcChooser::Bandwidth => BANDWIDTH_EVENTS,
        HwpcChooser::Vector => VECTOR_EVENTS,
        HwpcChooser::Cache => CACHE_EVENTS,
        HwpcChooser::Cycle => CYCLE_EVENTS,
        HwpcChooser::LoadStore => LOADSTORE_EVENTS,
        HwpcChooser::User => &[],
    }
}

/// Number of slots in the sorted metric vector for a chooser.
pub fn sorted_len(chooser: HwpcChooser) -> usize {
    match chooser {
        HwpcChooser::Flops => FLOPS_EVENTS.len() + 3,
        HwpcChooser::Bandwidth => BANDWIDTH_EVENTS.len() + 4,
        HwpcChooser::Vector => VECTOR_EVENTS.len() + 3,
        HwpcChooser::Cache => CACHE_EVENTS.len() + 3,
        HwpcChooser::Cycle => CYCLE_EVENTS.len() + 1,
        HwpcChooser::LoadStore => LOADSTORE_EVENTS.len() + 2,
        HwpcChooser::User => 1,
    }
}

/// Hardware constants probed once per process.
#[derive(Debug, Clone)]
pub struct Platform {
    pub core_ghz: f64,
    /// Peak floating-point rate of one core, flop/s.
    pub core_peak_flops: f64,
    /// Cores per core-memory group (packed affinity assumed).
    pub cmg_cores: usize,
    /// Core-memory groups per node.
    pub cmgs_per_node: usize,
    /// Bytes moved per counted cache-line transfer.
    pub cache_line_bytes: f64,
}

/// Flop per cycle per core assumed when deriving the peak rate.
const FLOP_PER_CYCLE: f64 = 16.0;

impl Platform {
    pub fn detect() -> Self {
        let ghz = match crate::timer::cpu_clock_hz() {
            Ok(hz) => hz * 1.0e-9,
            Err(_) => {
                warn!("could not probe the CPU frequency, assuming 2.0 GHz");
                2.0
            }
        };
        Platform {
            core_ghz: ghz,
            core_peak_flops: ghz * 1.0e9 * FLOP_PER_CYCLE,
            cmg_cores: 12,
            cmgs_per_node: 4,
            cache_line_bytes: 64.0,
        }
    }
}

/// Derived metric vector: slot names and values, headline in the last slot.
#[derive(Debug, Clone, Default)]
pub struct SortedMetrics {
    pub names: Vec<&'static str>,
    pub values: Vec<f64>,
}

impl SortedMetrics {
    fn push(&mut self, name: &'static str, value: f64) {
        self.names.push(name);
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The headline slot.
    pub fn last(&self) -> f64 {
        self.values.last().copied().unwrap_or(0.0)
    }
}

/// Derive the sorted metric vector from accumulated raw counts.
///
/// `accumu` must have one slot per event of the chooser's table; `elapsed`
/// is the measured time backing the rate slots. USER mode is handled by
/// [`user_metrics`] instead, since it has no raw events.
pub fn sort_counter_list(
    chooser: HwpcChooser,
    accumu: &[f64],
    elapsed: f64,
    platform: &Platform,
) -> SortedMetrics {
    let rate = if elapsed > 0.0 { 1.0 / elapsed } else { 0.0 };
    let mut sm = SortedMetrics::default();
    let events = event_table(chooser);
    debug_assert_eq!(accumu.len(), events.len());

    match chooser {
        HwpcChooser::Flops => {
            let mut total = 0.0;
            for (e, ev) in events.iter().enumerate() {
                sm.push(ev.name, accumu[e]);
                total += accumu[e];
            }
            let flops = total * rate;
            sm.push("Total_FP", total);
            sm.push("[Flops]", flops);
            sm.push("[%Peak]", flops / platform.core_peak_flops * 100.0);
        }
        HwpcChooser::Bandwidth => {
            for (e, ev) in events.iter().enumerate() {
                sm.push(ev.name, accumu[e]);
            }
            let rd_bytes = accumu[0] * platform.cache_line_bytes;
            let wr_bytes = accumu[1] * platform.cache_line_bytes;
            sm.push("RD [Bytes]", rd_bytes);
            sm.push("WR [Bytes]", wr_bytes);
            sm.push("[Bytes]", rd_bytes + wr_bytes);
            sm.push("Mem [B/s]", (rd_bytes + wr_bytes) * rate);
        }
        HwpcChooser::Vector => {
            for (e, ev) in events.iter().enumerate() {
                sm.push(ev.name, accumu[e]);
            }
            let scalar = accumu[0];
            let vector = accumu[1];
            let total = scalar + vector;
            let percent = if total > 0.0 { vector / total * 100.0 } else { 0.0 };
            sm.push("Total_FP", total);
            sm.push("Vector_FP", vector);
            sm.push("[Vector %]", percent);
        }
        HwpcChooser::Cache => {
            for (e, ev) in events.iter().enumerate() {
                sm.push(ev.name, accumu[e]);
            }
            let accesses = accumu[0] + accumu[1];
            let (l1, l2) = if accesses > 0.0 {
                (accumu[2] / accesses, accumu[3] / accesses)
            } else {
                (0.0, 0.0)
            };
            sm.push("[L1$ hit%]", l1 * 100.0);
            sm.push("[L2$ hit%]", l2 * 100.0);
            sm.push("[L*$ hit%]", (l1 + l2) * 100.0);
        }
        HwpcChooser::Cycle => {
            for (e, ev) in events.iter().enumerate() {
                sm.push(ev.name, accumu[e]);
            }
            let ipc = if accumu[0] > 0.0 {
                accumu[1] / accumu[0]
            } else {
                0.0
            };
            sm.push("[Ins/cyc]", ipc);
        }
        HwpcChooser::LoadStore => {
            for (e, ev) in events.iter().enumerate() {
                sm.push(ev.name, accumu[e]);
            }
            let ldst = accumu[0] + accumu[1];
            let vec_ldst = accumu[2] + accumu[3];
            let percent = if ldst > 0.0 { vec_ldst / ldst * 100.0 } else { 0.0 };
            sm.push("Total_LDST", ldst);
            sm.push("[Vector %]", percent);
        }
        HwpcChooser::User => {
            // USER mode derives from the declared volume, not raw events.
        }
    }
    sm
}

/// USER-mode metric vector: the declared volume turned into a rate.
pub fn user_metrics(flop: f64, elapsed: f64, kind: SectionKind) -> SortedMetrics {
    let rate = if elapsed > 0.0 { flop / elapsed } else { 0.0 };
    let mut sm = SortedMetrics::default();
    let name = match kind {
        SectionKind::Communication => "[B/s]",
        SectionKind::Computation => "[Flops]",
    };
    sm.push(name, rate);
    sm
}

/// The process-level volume column for the report (the `m_flop` analogue).
pub fn process_volume(chooser: HwpcChooser, sm: &SortedMetrics) -> f64 {
    match chooser {
        HwpcChooser::Flops | HwpcChooser::Vector => sm.values[2],
        HwpcChooser::Bandwidth => sm.values[4],
        HwpcChooser::Cache | HwpcChooser::LoadStore => sm.values[0] + sm.values[1],
        HwpcChooser::Cycle => sm.values[1],
        HwpcChooser::User => 0.0,
    }
}

/// The percentage column for choosers whose headline is a ratio.
pub fn process_percentage(chooser: HwpcChooser, sm: &SortedMetrics) -> f64 {
    match chooser {
        HwpcChooser::Vector | HwpcChooser::Cache | HwpcChooser::LoadStore => sm.last(),
        _ => 0.0,
    }
}

/// Accumulate per-thread counter rows into process-level values, applying
/// the per-event sharing policy.
///
/// Per-core events sum across threads. Per-CMG events are read once per
/// group (the first thread of each group under packed affinity) and prorated
/// between the processes sharing the group.
pub fn process_accumulate(
    events: &[EventDef],
    rows: &[Vec<i64>],
    num_threads: usize,
    topology: &Topology,
    platform: &Platform,
) -> Vec<f64> {
    events
        .iter()
        .enumerate()
        .map(|(e, ev)| match ev.sharing {
            Sharing::PerCore => rows.iter().take(num_threads).map(|r| r[e] as f64).sum(),
            Sharing::PerCmg => apportion_cmg(rows, e, num_threads, topology, platform),
        })
        .collect()
}

/// Prorate one per-CMG event between the processes of a node.
///
/// With 1..=4 processes per node each process owns an integer number of
/// groups; the counters of the owned groups are summed, plus a 1/3 share of
/// the group straddled in the 3-process layout. With 5 or more processes
/// every process shares a single group with ceil or floor of
/// `procs_per_node / groups` peers.
fn apportion_cmg(
    rows: &[Vec<i64>],
    event: usize,
    num_threads: usize,
    topology: &Topology,
    platform: &Platform,
) -> f64 {
    let np = topology.procs_per_node;
    let width = platform.cmg_cores;
    if np <= platform.cmgs_per_node {
        let owned_groups = (num_threads.max(1) - 1) / width + 1;
        let mut value = 0.0;
        for k in 0..owned_groups {
            let row = k * width;
            if row < num_threads {
                value += rows[row][event] as f64;
            }
        }
        if np == 3 && num_threads > width {
            value += rows[num_threads - 1][event] as f64 / 3.0;
        }
        value
    } else {
        let groups = platform.cmgs_per_node;
        let sharers_hi = (np - 1) / groups + 1;
        let ratio = if (topology.rank_on_node % groups) <= ((np - 1) % groups) {
            1.0 / sharers_hi as f64
        } else {
            1.0 / (sharers_hi - 1) as f64
        };
        rows[0][event] as f64 * ratio
    }
}

/// Scale a headline rate into a human-readable unit.
pub fn scaled_unit(rate: f64, chooser: HwpcChooser, kind: SectionKind) -> (f64, &'static str) {
    const K: f64 = 1000.0;
    const M: f64 = K * K;
    const G: f64 = K * M;
    const T: f64 = K * G;
    const P: f64 = K * T;

    let bytes = matches!(chooser, HwpcChooser::Bandwidth)
        || (chooser == HwpcChooser::User && kind == SectionKind::Communication);
    let percent = matches!(
        chooser,
        HwpcChooser::Vector | HwpcChooser::Cache | HwpcChooser::LoadStore
    );

    if percent {
        (rate, "(%)")
    } else if bytes {
        if rate > P {
            (rate / P, "PB/sec")
        } else if rate > T {
            (rate / T, "TB/sec")
        } else if rate > G {
            (rate / G, "GB/sec")
        } else {
            (rate / M, "MB/sec")
        }
    } else if chooser == HwpcChooser::Cycle {
        if rate > P {
            (rate / P, "P.ips")
        } else if rate > T {
            (rate / T, "T.ips")
        } else if rate > G {
            (rate / G, "G.ips")
        } else {
            (rate / M, "M.ips")
        }
    } else {
        if rate > P {
            (rate / P, "Pflops")
        } else if rate > T {
            (rate / T, "Tflops")
        } else if rate > G {
            (rate / G, "Gflops")
        } else {
            (rate / M, "Mflops")
        }
    }
}

/// Legend lines for the report tail: symbol and meaning per chooser.
pub fn legend_lines(chooser: HwpcChooser) -> Vec<(&'static str, &'static str)> {
    match chooser {
        HwpcChooser::Flops => vec![
            ("SP_OPS", "single precision floating point operations"),
            ("DP_OPS", "double precision floating point operations"),
            ("Total_FP", "total floating point operations"),
            ("[Flops]", "floating point operations per second"),
            ("[%Peak]", "percentage of the theoretical peak rate"),
        ],
        HwpcChooser::Bandwidth => vec![
            ("MEM_RD_CL", "cache lines read from memory (per CMG)"),
            ("MEM_WR_CL", "cache lines written to memory (per CMG)"),
            ("[Bytes]", "bytes moved to and from memory"),
            ("Mem [B/s]", "memory bandwidth in bytes per second"),
        ],
        HwpcChooser::Vector => vec![
            ("FP_SCALAR_OPS", "scalar floating point operations"),
            ("FP_VECTOR_OPS", "vectorized floating point operations"),
            ("[Vector %]", "vectorized fraction of all operations"),
        ],
        HwpcChooser::Cache => vec![
            ("LD_INS / SR_INS", "load and store instructions"),
            ("L1_HIT / L2_HIT", "level 1 and level 2 cache hits"),
            ("[L*$ hit%]", "combined L1+L2 hit percentage"),
        ],
        HwpcChooser::Cycle => vec![
            ("TOT_CYC", "processor cycles (average per thread)"),
            ("TOT_INS", "retired instructions"),
            ("[Ins/cyc]", "instructions per cycle"),
        ],
        HwpcChooser::LoadStore => vec![
            ("LD_INS / SR_INS", "load and store instructions"),
            ("VEC_LD_INS / VEC_SR_INS", "vectorized loads and stores"),
            ("[Vector %]", "vectorized fraction of loads and stores"),
        ],
        HwpcChooser::User => vec![],
    }
}
