//! Per-section measurement record and state machine
//!
//! A `Watch` owns one row per thread. Serial-region calls keep their scalar
//! bookkeeping in the master row and fan a counter read out to every worker
//! thread, so a section wrapping an uninstrumented parallel region still
//! captures whole-process counter deltas. Parallel-region calls touch only
//! the calling thread's row. Illegal transitions warn and self-correct; the
//! run always continues.

use crate::collective::{Collective, CollectiveError};
use crate::config::{HwpcChooser, PowerLevel, Topology, TraceLevel};
use crate::counters::CounterBackend;
use crate::hwpc::{self, EventDef, Platform, SortedMetrics};
use crate::otf::TraceBackend;
use crate::power::PowerBackend;
use crate::stats::SectionStats;
use crate::timer::Clock;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// What a section measures: data movement or arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Communication,
    Computation,
}

impl SectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKind::Communication => "COMM",
            SectionKind::Computation => "CALC",
        }
    }
}

/// Process-wide measurement context, created once by the monitor and handed
/// to every watch by construction.
pub(crate) struct Instruments {
    pub clock: Clock,
    pub platform: Platform,
    pub chooser: HwpcChooser,
    pub events: &'static [EventDef],
    /// Cleared when the counter back-end rejects the event set.
    pub hwpc_active: AtomicBool,
    pub power_level: PowerLevel,
    pub trace_level: TraceLevel,
    pub counters: Arc<dyn CounterBackend>,
    pub power: Arc<dyn PowerBackend>,
    pub trace: Arc<dyn TraceBackend>,
    pub topology: Topology,
    pub num_threads: usize,
    pub num_process: usize,
    pub my_rank: usize,
}

impl Instruments {
    /// Number of live raw events; zero in USER mode or after a back-end failure.
    pub fn hwpc_events(&self) -> usize {
        if self.hwpc_active.load(Ordering::Relaxed) {
            self.events.len()
        } else {
            0
        }
    }

    /// Width of the per-thread derived vector rows. The first three slots
    /// always carry call count, time and declared volume for the merge.
    pub fn sorted_width(&self) -> usize {
        hwpc::sorted_len(self.chooser).max(3)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ThreadRow {
    pub started: bool,
    pub start_time: f64,
    pub accum_time: f64,
    pub call_count: u64,
    pub user_flop: f64,
    /// Counter snapshot at the last start, one slot per event.
    pub values: Vec<i64>,
    /// Accumulated counter deltas over completed pairs.
    pub accumu: Vec<i64>,
    /// Derived metric slots; [0..3] hold count/time/volume for the merge.
    pub v_sorted: Vec<f64>,
}

impl ThreadRow {
    fn new(num_events: usize, sorted_width: usize) -> Self {
        ThreadRow {
            started: false,
            start_time: 0.0,
            accum_time: 0.0,
            call_count: 0,
            user_flop: 0.0,
            values: vec![0; num_events],
            accumu: vec![0; num_events],
            v_sorted: vec![0.0; sorted_width],
        }
    }

    fn reset(&mut self) {
        self.accum_time = 0.0;
        self.call_count = 0;
        self.user_flop = 0.0;
        self.accumu.fill(0);
        self.v_sorted.fill(0.0);
    }
}

/// Master-side aggregates, valid after the three-phase merge and gather.
#[derive(Debug, Default)]
pub(crate) struct MasterState {
    /// Process-level per-event accumulation (sharing policy applied).
    pub accumu: Vec<f64>,
    pub sorted: SortedMetrics,
    pub time: f64,
    pub flop: f64,
    pub count: u64,
    pub percentage: f64,
    pub time_array: Vec<f64>,
    pub flop_array: Vec<f64>,
    pub count_array: Vec<u64>,
    /// All-gathered sorted vectors, `size × sorted_len`, rank-major.
    pub sorted_matrix: Vec<f64>,
    pub stats: SectionStats,
    pub power_u_joule: Vec<f64>,
    pub power_accum: Vec<f64>,
    pub watt_max: Vec<f64>,
    pub power_av: f64,
}

/// The cross-thread channel of the three-phase merge. Zeroed after phase 3.
pub(crate) struct Scratch {
    pub th_accumu: Vec<Vec<i64>>,
    pub th_v_sorted: Vec<Vec<f64>>,
}

impl Scratch {
    pub fn new(num_threads: usize, num_events: usize, sorted_width: usize) -> Self {
        Scratch {
            th_accumu: vec![vec![0; num_events]; num_threads],
            th_v_sorted: vec![vec![0.0; sorted_width]; num_threads],
        }
    }

    pub fn zero(&mut self) {
        for row in &mut self.th_accumu {
            row.fill(0);
        }
        for row in &mut self.th_v_sorted {
            row.fill(0.0);
        }
    }
}

pub struct Watch {
    label: String,
    shared_id: usize,
    kind: SectionKind,
    exclusive: AtomicBool,
    in_parallel: AtomicBool,
    healthy: AtomicBool,
    threads_merged: AtomicBool,
    rows: Vec<Mutex<ThreadRow>>,
    master: Mutex<MasterState>,
    ctx: Arc<Instruments>,
}

impl Watch {
    pub(crate) fn new(
        label: &str,
        shared_id: usize,
        kind: SectionKind,
        exclusive: bool,
        in_parallel: bool,
        ctx: Arc<Instruments>,
    ) -> Self {
        let num_events = ctx.events.len();
        let width = ctx.sorted_width();
        let rows = (0..ctx.num_threads)
            .map(|_| Mutex::new(ThreadRow::new(num_events, width)))
            .collect();
        Watch {
            label: label.to_string(),
            shared_id,
            kind,
            exclusive: AtomicBool::new(exclusive),
            in_parallel: AtomicBool::new(in_parallel),
            healthy: AtomicBool::new(true),
            threads_merged: AtomicBool::new(false),
            rows,
            master: Mutex::new(MasterState::default()),
            ctx,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn shared_id(&self) -> usize {
        self.shared_id
    }

    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive.load(Ordering::Relaxed)
    }

    pub fn is_in_parallel(&self) -> bool {
        self.in_parallel.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Total completed start/stop pairs over all threads.
    pub fn call_count(&self) -> u64 {
        self.rows.iter().map(|r| r.lock().call_count).sum()
    }

    /// Accumulated time summed over all threads.
    pub fn accumulated_time(&self) -> f64 {
        self.rows.iter().map(|r| r.lock().accum_time).sum()
    }

    /// Declared volume summed over all threads (USER mode).
    pub fn user_volume(&self) -> f64 {
        self.rows.iter().map(|r| r.lock().user_flop).sum()
    }

    /// Accumulated counter deltas of one thread row.
    pub fn thread_accumulated(&self, thread: usize) -> Option<Vec<i64>> {
        self.rows.get(thread).map(|r| r.lock().accumu.clone())
    }

    /// Per-thread derived scalar slots (count, time, volume, ...).
    pub fn thread_sorted(&self, thread: usize) -> Option<Vec<f64>> {
        self.rows.get(thread).map(|r| r.lock().v_sorted.clone())
    }

    pub fn any_running(&self) -> bool {
        self.rows.iter().any(|r| r.lock().started)
    }

    pub(crate) fn clear_exclusive(&self) {
        self.exclusive.store(false, Ordering::Relaxed);
    }

    pub(crate) fn mark_in_parallel(&self) {
        self.in_parallel.store(true, Ordering::Relaxed);
    }

    pub(crate) fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    fn thread_slot() -> (usize, bool) {
        match rayon::current_thread_index() {
            Some(i) => (i, true),
            None => (0, false),
        }
    }

    /// Start the measurement bracket on the calling thread.
    pub(crate) fn start(&self) {
        let (me, in_par) = Self::thread_slot();
        if in_par {
            self.in_parallel.store(true, Ordering::Relaxed);
        }
        let now = self.ctx.clock.now();
        {
            let mut row = self.rows[me].lock();
            if row.started && self.ctx.my_rank == 0 {
                warn!(
                    section = %self.label,
                    thread = me,
                    "start on a running section; restarting the interval"
                );
            }
            row.started = true;
            row.start_time = now;
        }
        self.threads_merged.store(false, Ordering::Relaxed);

        if self.ctx.hwpc_events() > 0 {
            if in_par {
                self.snapshot_counters(me);
            } else {
                rayon::broadcast(|bctx| self.snapshot_counters(bctx.index()));
            }
        }
        if !in_par {
            self.power_start();
        }
        if self.ctx.trace_level != TraceLevel::Off {
            self.ctx.trace.event_start(self.ctx.my_rank, now, self.shared_id);
        }
    }

    /// Stop the bracket, folding the interval into the calling thread's row.
    pub(crate) fn stop(&self, flop_per_task: f64, iteration_count: u32) {
        let (me, in_par) = Self::thread_slot();
        let now = self.ctx.clock.now();
        let pair_elapsed;
        {
            let mut row = self.rows[me].lock();
            if !row.started {
                if self.ctx.my_rank == 0 {
                    warn!(
                        section = %self.label,
                        thread = me,
                        "stop without a matching start; recording a zero-length interval"
                    );
                }
                row.start_time = now;
            }
            pair_elapsed = now - row.start_time;
            row.accum_time += pair_elapsed;
            row.call_count += 1;
            row.started = false;
        }

        if self.ctx.hwpc_events() > 0 {
            if in_par {
                self.accumulate_counters(me);
            } else {
                rayon::broadcast(|bctx| self.accumulate_counters(bctx.index()));
            }
        }

        let trace_value;
        {
            let mut row = self.rows[me].lock();
            if self.ctx.hwpc_events() == 0 {
                row.user_flop += flop_per_task * iteration_count as f64;
            }
            row.v_sorted[0] = row.call_count as f64;
            row.v_sorted[1] = row.accum_time;
            row.v_sorted[2] = row.user_flop;

            trace_value = if self.ctx.trace_level == TraceLevel::Full {
                if self.ctx.hwpc_events() == 0 {
                    if pair_elapsed > 0.0 {
                        flop_per_task * iteration_count as f64 / pair_elapsed
                    } else {
                        0.0
                    }
                } else {
                    let accumu: Vec<f64> = row.accumu.iter().map(|&v| v as f64).collect();
                    hwpc::sort_counter_list(
                        self.ctx.chooser,
                        &accumu,
                        row.accum_time,
                        &self.ctx.platform,
                    )
                    .last()
                }
            } else {
                0.0
            };
        }

        if !in_par {
            self.power_stop(pair_elapsed);
        }
        if self.ctx.trace_level != TraceLevel::Off {
            self.ctx
                .trace
                .event_stop(self.ctx.my_rank, now, self.shared_id, trace_value);
        }
    }

    /// Non-destructive counter snapshot into one thread row.
    fn snapshot_counters(&self, thread: usize) {
        let mut vals = vec![0i64; self.ctx.events.len()];
        if let Err(e) = self.ctx.counters.read(&mut vals) {
            if self.ctx.my_rank == 0 {
                warn!(section = %self.label, thread, error = %e, "counter read failed at start");
            }
            return;
        }
        if let Some(row) = self.rows.get(thread) {
            row.lock().values.copy_from_slice(&vals);
        }
    }

    /// Read counters and fold the delta since the last start into the row.
    fn accumulate_counters(&self, thread: usize) {
        let mut vals = vec![0i64; self.ctx.events.len()];
        if let Err(e) = self.ctx.counters.read(&mut vals) {
            if self.ctx.my_rank == 0 {
                warn!(section = %self.label, thread, error = %e, "counter read failed at stop, contributing zero");
            }
            return;
        }
        if let Some(row) = self.rows.get(thread) {
            let mut row = row.lock();
            for e in 0..vals.len() {
                row.accumu[e] += vals[e] - row.values[e];
            }
        }
    }

    fn power_start(&self) {
        if self.ctx.power_level == PowerLevel::Off {
            return;
        }
        let parts = self.ctx.power.num_parts();
        if parts == 0 {
            return;
        }
        let mut master = self.master.lock();
        if master.power_u_joule.len() != parts {
            master.power_u_joule = vec![0.0; parts];
            master.power_accum = vec![0.0; parts];
            master.watt_max = vec![0.0; parts];
        }
        let mut snapshot = vec![0.0; parts];
        if self.ctx.power.read_joules(&mut snapshot).is_ok() {
            master.power_u_joule = snapshot;
        }
    }

    fn power_stop(&self, pair_elapsed: f64) {
        if self.ctx.power_level == PowerLevel::Off {
            return;
        }
        let parts = self.ctx.power.num_parts();
        if parts == 0 {
            return;
        }
        let mut master = self.master.lock();
        if master.power_u_joule.len() != parts {
            return;
        }
        let mut now_joule = vec![0.0; parts];
        if self.ctx.power.read_joules(&mut now_joule).is_err() {
            return;
        }
        for i in 0..parts {
            let delta = now_joule[i] - master.power_u_joule[i];
            master.power_accum[i] += delta;
            if pair_elapsed > 0.0 {
                master.watt_max[i] = master.watt_max[i].max(delta / pair_elapsed);
            }
        }
    }

    /// Close every running row without reading counters. Used when Root
    /// stops while this section is still open; time and count stay valid,
    /// the interrupted counter interval is dropped.
    pub(crate) fn force_stop(&self, now: f64) {
        for row in &self.rows {
            let mut row = row.lock();
            if row.started {
                row.accum_time += now - row.start_time;
                row.call_count += 1;
                row.started = false;
                row.v_sorted[0] = row.call_count as f64;
                row.v_sorted[1] = row.accum_time;
                row.v_sorted[2] = row.user_flop;
            }
        }
    }

    /// Zero the accumulators; the registration itself survives.
    pub(crate) fn reset(&self) {
        for row in &self.rows {
            row.lock().reset();
        }
        let mut master = self.master.lock();
        master.accumu.fill(0.0);
        master.time = 0.0;
        master.flop = 0.0;
        master.count = 0;
        master.percentage = 0.0;
        master.sorted = SortedMetrics::default();
        self.threads_merged.store(false, Ordering::Relaxed);
    }

    // --- three-phase thread merge -----------------------------------------

    /// Phase 1, master only: copy the master thread's view of every row into
    /// the scratch area.
    pub(crate) fn merge_master(&self, scratch: &mut Scratch) {
        if self.threads_merged.load(Ordering::Relaxed) {
            return;
        }
        let ne = self.ctx.events.len();
        let width = self.ctx.sorted_width();
        for (t, row) in self.rows.iter().enumerate() {
            let row = row.lock();
            scratch.th_accumu[t][..ne].copy_from_slice(&row.accumu);
            scratch.th_v_sorted[t][..width].copy_from_slice(&row.v_sorted);
        }
    }

    /// Phase 2, every thread: copy the calling thread's own row into its
    /// scratch slot. Skipped for sections never executed inside a parallel
    /// region, whose rows phase 1 already covers.
    pub(crate) fn merge_parallel(&self, thread: usize, scratch: &mut Scratch) {
        if self.threads_merged.load(Ordering::Relaxed) {
            return;
        }
        if !self.in_parallel.load(Ordering::Relaxed) {
            return;
        }
        let ne = self.ctx.events.len();
        let width = self.ctx.sorted_width();
        if let Some(row) = self.rows.get(thread) {
            let row = row.lock();
            scratch.th_accumu[thread][..ne].copy_from_slice(&row.accumu);
            scratch.th_v_sorted[thread][..width].copy_from_slice(&row.v_sorted);
        }
    }

    /// Phase 3, master only: fold scratch back, compute the process-level
    /// per-event accumulation under the sharing policy and the scalar sums,
    /// then mark merged and zero the scratch area.
    pub(crate) fn merge_update(&self, scratch: &mut Scratch) {
        if self.threads_merged.load(Ordering::Relaxed) {
            return;
        }
        let nt = self.ctx.num_threads;
        let ne = self.ctx.events.len();
        let width = self.ctx.sorted_width();
        for (t, row) in self.rows.iter().enumerate() {
            let mut row = row.lock();
            row.accumu.copy_from_slice(&scratch.th_accumu[t][..ne]);
            row.v_sorted.copy_from_slice(&scratch.th_v_sorted[t][..width]);
        }

        let mut master = self.master.lock();
        if self.ctx.hwpc_events() > 0 {
            master.accumu = hwpc::process_accumulate(
                self.ctx.events,
                &scratch.th_accumu,
                nt,
                &self.ctx.topology,
                &self.ctx.platform,
            );
        }

        let (mut count, mut time, mut flop) = (0.0, 0.0, 0.0);
        for t in 0..nt {
            count += scratch.th_v_sorted[t][0];
            time += scratch.th_v_sorted[t][1];
            flop += scratch.th_v_sorted[t][2];
        }
        master.count = count.round() as u64;
        master.time = time;
        master.flop = flop;
        drop(master);

        self.threads_merged.store(true, Ordering::Relaxed);
        scratch.zero();
    }

    // --- cross-process gather ---------------------------------------------

    /// Derive the sorted metric vector and all-gather it into the
    /// rank-major `size × sorted_len` matrix.
    pub(crate) fn gather_hwpc(&self, collective: &dyn Collective) -> Result<(), CollectiveError> {
        let mut master = self.master.lock();
        if self.ctx.hwpc_events() == 0 {
            master.sorted = hwpc::user_metrics(master.flop, master.time, self.kind);
            return Ok(());
        }
        if master.accumu.len() != self.ctx.events.len() {
            master.accumu = vec![0.0; self.ctx.events.len()];
        }
        let mut sorted = hwpc::sort_counter_list(
            self.ctx.chooser,
            &master.accumu,
            master.time,
            &self.ctx.platform,
        );

        master.flop = hwpc::process_volume(self.ctx.chooser, &sorted);
        master.percentage = hwpc::process_percentage(self.ctx.chooser, &sorted);
        match self.ctx.chooser {
            HwpcChooser::Flops => {
                // Recompute the peak slot against the whole process.
                let rate = if master.time > 0.0 {
                    master.flop / master.time
                } else {
                    0.0
                };
                let peak = self.ctx.platform.core_peak_flops * self.ctx.num_threads as f64;
                let last = sorted.values.len() - 1;
                sorted.values[last] = rate / peak * 100.0;
            }
            HwpcChooser::Cycle => {
                sorted.values[0] /= self.ctx.num_threads as f64;
            }
            _ => {}
        }

        master.sorted_matrix = collective.all_gather_f64(&sorted.values)?;
        master.sorted = sorted;
        Ok(())
    }

    /// All-gather the scalar triple and compute the group statistics.
    pub(crate) fn gather(&self, collective: &dyn Collective) -> Result<(), CollectiveError> {
        let mut master = self.master.lock();
        let (time, flop, count) = (master.time, master.flop, master.count);
        master.time_array = collective.all_gather_f64(&[time])?;
        master.flop_array = collective.all_gather_f64(&[flop])?;
        master.count_array = collective.all_gather_u64(count)?;
        let count_sum = collective.reduce_sum_u64(count)?;
        master.stats = SectionStats::compute(
            &master.time_array,
            &master.flop_array,
            &master.count_array,
            self.kind,
        );
        master.stats.count_sum = count_sum;
        Ok(())
    }

    /// Sum the accumulated energy over the group; node-level average.
    pub(crate) fn gather_power(&self, collective: &dyn Collective) -> Result<(), CollectiveError> {
        if self.ctx.power_level == PowerLevel::Off {
            return Ok(());
        }
        let mut master = self.master.lock();
        let local = master.power_accum.first().copied().unwrap_or(0.0);
        let gathered = collective.all_gather_f64(&[local])?;
        master.power_av = gathered.iter().sum::<f64>() / collective.size() as f64;
        Ok(())
    }

    /// Per-thread (time, count, derived metrics) for the FULL report.
    pub(crate) fn thread_metrics(&self) -> Vec<(f64, u64, SortedMetrics)> {
        let process_time = self.master.lock().time;
        self.rows
            .iter()
            .map(|r| {
                let row = r.lock();
                let elapsed = if row.accum_time > 0.0 {
                    row.accum_time
                } else {
                    process_time
                };
                let sm = if self.ctx.hwpc_events() == 0 {
                    hwpc::user_metrics(row.user_flop, elapsed, self.kind)
                } else {
                    let accumu: Vec<f64> = row.accumu.iter().map(|&v| v as f64).collect();
                    hwpc::sort_counter_list(self.ctx.chooser, &accumu, elapsed, &self.ctx.platform)
                };
                (row.accum_time, row.call_count, sm)
            })
            .collect()
    }

    pub(crate) fn with_master<R>(&self, f: impl FnOnce(&MasterState) -> R) -> R {
        f(&self.master.lock())
    }

    // --- gathered results, valid after merge and gather --------------------

    /// Group statistics of this section.
    pub fn stats(&self) -> SectionStats {
        self.master.lock().stats.clone()
    }

    /// Per-process times from the scalar gather, rank order.
    pub fn gathered_times(&self) -> Vec<f64> {
        self.master.lock().time_array.clone()
    }

    /// Per-process volumes from the scalar gather, rank order.
    pub fn gathered_volumes(&self) -> Vec<f64> {
        self.master.lock().flop_array.clone()
    }

    /// Process-level time after the thread merge.
    pub fn process_time(&self) -> f64 {
        self.master.lock().time
    }

    /// Process-level call count after the thread merge.
    pub fn process_count(&self) -> u64 {
        self.master.lock().count
    }

    /// Process-level measured volume after the HWPC gather.
    pub fn process_volume(&self) -> f64 {
        self.master.lock().flop
    }

    /// The derived metric vector (names, values) after the HWPC gather.
    pub fn sorted_metrics(&self) -> (Vec<&'static str>, Vec<f64>) {
        let master = self.master.lock();
        (master.sorted.names.clone(), master.sorted.values.clone())
    }

    /// Restore one thread row's start snapshot (shell-mode load). Only the
    /// master row is marked in-flight; the bracket is closed by a
    /// serial-context stop whose fan-out measures every row against the
    /// restored snapshots.
    pub(crate) fn restore_snapshot(&self, thread: usize, start_time: f64, values: &[i64]) {
        if let Some(row) = self.rows.get(thread) {
            let mut row = row.lock();
            if thread == 0 {
                row.started = true;
            }
            row.start_time = start_time;
            let n = row.values.len().min(values.len());
            row.values[..n].copy_from_slice(&values[..n]);
        }
    }

    /// One thread row's (start_time, values) snapshot (shell-mode save).
    pub fn snapshot_of(&self, thread: usize) -> Option<(f64, Vec<i64>)> {
        self.rows
            .get(thread)
            .map(|r| {
                let row = r.lock();
                (row.start_time, row.values.clone())
            })
    }
}
