//! The per-process monitor: section lifecycle, merge and report driver
//!
//! One `Monitor` exists per process. Every watch holds a thread-wide array of
//! rows, so the monitor itself is shared freely between threads; the shared
//! registry takes a lock only around insertion, and start/stop touch nothing
//! but the calling thread's row.

use crate::collective::{Collective, SingleProcess};
use crate::config::{HwpcChooser, PowerLevel, ReportLevel, RuntimeEnv, TraceLevel};
use crate::counters::{CounterBackend, NullCounters};
use crate::hwpc::{self, Platform};
use crate::otf::{NullTrace, TraceBackend};
use crate::power::{NullPower, PowerBackend, PowerError, PowerKnob};
use crate::registry::{LocalRegistry, SharedRegistry};
use crate::report::{self, ReportInput};
use crate::stats;
use crate::timer::Clock;
use crate::watch::{Instruments, Scratch, SectionKind, Watch};
use parking_lot::{Mutex, RwLock};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Label of the implicit section spanning initialize to report.
pub const ROOT_LABEL: &str = "Root Section";

pub struct Monitor {
    enabled: bool,
    env: RuntimeEnv,
    ctx: Arc<Instruments>,
    collective: Arc<dyn Collective>,
    shared: SharedRegistry,
    local: Mutex<LocalRegistry>,
    watches: RwLock<Vec<Arc<Watch>>>,
    scratch: Mutex<Scratch>,
    root_active: AtomicBool,
    /// Per-thread nesting detector: slot 0 for serial-context calls, slot
    /// i+1 for pool thread i. Set by start, cleared by the stop of a nested
    /// section completing inside another section's bracket.
    exclusive_construct: Vec<AtomicBool>,
    trace_finalized: AtomicBool,
    forced_stops: Mutex<Vec<String>>,
    /// Watch array growth chunk.
    chunk: usize,
}

/// Wires the external collaborators before initialization. The defaults are
/// the null back-ends and the single-process collective.
pub struct MonitorBuilder {
    env: Option<RuntimeEnv>,
    counters: Arc<dyn CounterBackend>,
    collective: Arc<dyn Collective>,
    power: Arc<dyn PowerBackend>,
    trace: Arc<dyn TraceBackend>,
}

impl MonitorBuilder {
    pub fn env(mut self, env: RuntimeEnv) -> Self {
        self.env = Some(env);
        self
    }

    pub fn counters(mut self, counters: Arc<dyn CounterBackend>) -> Self {
        self.counters = counters;
        self
    }

    pub fn collective(mut self, collective: Arc<dyn Collective>) -> Self {
        self.collective = collective;
        self
    }

    pub fn power(mut self, power: Arc<dyn PowerBackend>) -> Self {
        self.power = power;
        self
    }

    pub fn trace(mut self, trace: Arc<dyn TraceBackend>) -> Self {
        self.trace = trace;
        self
    }

    /// Build the monitor, bind the counter events on every thread and start
    /// the Root section. `initial_sections` sizes the watch array and its
    /// growth chunk.
    pub fn initialize(self, initial_sections: usize) -> Monitor {
        // An explicitly injected environment means the process environment
        // is not consulted at all.
        let explicit_env = self.env.is_some();
        let env = self.env.unwrap_or_else(RuntimeEnv::from_env);
        let chunk = initial_sections.max(1);
        let my_rank = self.collective.rank();
        let num_process = self.collective.size();

        if env.bypass {
            let ctx = Arc::new(Instruments {
                clock: Clock::new(),
                platform: Platform::detect(),
                chooser: HwpcChooser::User,
                events: &[],
                hwpc_active: AtomicBool::new(false),
                power_level: PowerLevel::Off,
                trace_level: TraceLevel::Off,
                counters: self.counters,
                power: self.power,
                trace: self.trace,
                topology: env.topology,
                num_threads: 1,
                num_process,
                my_rank,
            });
            return Monitor {
                enabled: false,
                env,
                ctx,
                collective: self.collective,
                shared: SharedRegistry::new(),
                local: Mutex::new(LocalRegistry::new()),
                watches: RwLock::new(Vec::new()),
                scratch: Mutex::new(Scratch::new(1, 0, 3)),
                root_active: AtomicBool::new(false),
                exclusive_construct: vec![AtomicBool::new(false)],
                trace_finalized: AtomicBool::new(false),
                forced_stops: Mutex::new(Vec::new()),
                chunk,
            };
        }

        // The thread count comes from the fork-join runtime; honor
        // OMP_NUM_THREADS when the pool has not been built yet.
        if !explicit_env {
            if let Ok(raw) = std::env::var("OMP_NUM_THREADS") {
                if let Ok(n) = raw.parse::<usize>() {
                    if n > 0 {
                        let _ = rayon::ThreadPoolBuilder::new().num_threads(n).build_global();
                    }
                }
            }
        }
        let num_threads = rayon::current_num_threads();

        let clock = Clock::new();
        let platform = Platform::detect();
        let events = hwpc::event_table(env.hwpc);

        let mut hwpc_active = !events.is_empty();
        if hwpc_active {
            let names: Vec<&'static str> = events.iter().map(|e| e.name).collect();
            let results = rayon::broadcast(|_| self.counters.bind_events(&names));
            if let Some(Err(e)) = results.into_iter().find(|r| r.is_err()) {
                if my_rank == 0 {
                    warn!(error = %e, "hardware counters unavailable, sections report time only");
                }
                hwpc_active = false;
            }
        }
        if env.hwpc == HwpcChooser::Bandwidth
            && !explicit_env
            && std::env::var_os("PJM_PROC_BY_NODE").is_none()
            && my_rank == 0
        {
            warn!("PJM_PROC_BY_NODE is not set; assuming one process per node for shared counters");
        }

        let mut power_level = env.power;
        if power_level != PowerLevel::Off && self.power.num_parts() == 0 {
            if my_rank == 0 {
                warn!("power telemetry unavailable, POWER_CHOOSER is ignored");
            }
            power_level = PowerLevel::Off;
        }

        if env.trace != TraceLevel::Off {
            self.trace
                .initialize(num_process, my_rank, &env.trace_basename, clock.now());
        }

        let ctx = Arc::new(Instruments {
            clock,
            platform,
            chooser: env.hwpc,
            events,
            hwpc_active: AtomicBool::new(hwpc_active),
            power_level,
            trace_level: env.trace,
            counters: self.counters,
            power: self.power,
            trace: self.trace,
            topology: env.topology,
            num_threads,
            num_process,
            my_rank,
        });

        let monitor = Monitor {
            enabled: true,
            env,
            ctx: Arc::clone(&ctx),
            collective: self.collective,
            shared: SharedRegistry::new(),
            local: Mutex::new(LocalRegistry::new()),
            watches: RwLock::new(Vec::with_capacity(chunk)),
            scratch: Mutex::new(Scratch::new(
                num_threads,
                ctx.events.len(),
                ctx.sorted_width(),
            )),
            root_active: AtomicBool::new(false),
            exclusive_construct: (0..=num_threads).map(|_| AtomicBool::new(false)).collect(),
            trace_finalized: AtomicBool::new(false),
            forced_stops: Mutex::new(Vec::new()),
            chunk,
        };

        let root_id = monitor.create_section(ROOT_LABEL, SectionKind::Computation, false);
        let root = monitor.watch_by_id(root_id);
        root.start();
        monitor.root_active.store(true, Ordering::Relaxed);
        monitor
    }
}

impl Monitor {
    pub fn builder() -> MonitorBuilder {
        MonitorBuilder {
            env: None,
            counters: Arc::new(NullCounters),
            collective: Arc::new(SingleProcess),
            power: Arc::new(NullPower),
            trace: Arc::new(NullTrace),
        }
    }

    /// Mandatory first call: read the environment, set up the back-ends and
    /// start the Root section.
    pub fn initialize(initial_sections: usize) -> Monitor {
        Self::builder().initialize(initial_sections)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn num_threads(&self) -> usize {
        self.ctx.num_threads
    }

    pub fn num_process(&self) -> usize {
        self.ctx.num_process
    }

    pub fn my_rank(&self) -> usize {
        self.ctx.my_rank
    }

    pub(crate) fn instruments(&self) -> &Arc<Instruments> {
        &self.ctx
    }

    /// The watch registered for a label, if any.
    pub fn watch(&self, label: &str) -> Option<Arc<Watch>> {
        let id = self.local.lock().find(label)?;
        Some(self.watch_by_id(id))
    }

    /// The stable cross-thread ID of a section.
    pub fn shared_id(&self, label: &str) -> Option<usize> {
        self.shared.find(label)
    }

    /// Number of sections in the shared registry (Root included).
    pub fn section_count(&self) -> usize {
        self.shared.len()
    }

    pub(crate) fn local_count(&self) -> usize {
        self.local.lock().len()
    }

    fn watch_by_id(&self, id: usize) -> Arc<Watch> {
        Arc::clone(&self.watches.read()[id])
    }

    /// The calling thread's nesting-detector slot.
    fn exclusive_slot(&self) -> &AtomicBool {
        let slot = rayon::current_thread_index().map(|i| i + 1).unwrap_or(0);
        self.exclusive_construct
            .get(slot)
            .unwrap_or(&self.exclusive_construct[0])
    }

    /// Register a section, creating its watch when the label is new.
    /// Returns the local index.
    ///
    /// The local registry lock is held until the watch is in place, so an
    /// index handed out by `find` always resolves.
    fn create_section(&self, label: &str, kind: SectionKind, exclusive: bool) -> usize {
        let shared_id = self.shared.add(label);
        let mut local = self.local.lock();
        if let Some(id) = local.find(label) {
            return id;
        }
        let in_parallel = rayon::current_thread_index().is_some();
        let watch = Arc::new(Watch::new(
            label,
            shared_id,
            kind,
            exclusive,
            in_parallel,
            Arc::clone(&self.ctx),
        ));
        if self.ctx.trace_level != TraceLevel::Off {
            self.ctx.trace.define_label(shared_id, label, exclusive);
        }
        {
            let mut watches = self.watches.write();
            if watches.len() == watches.capacity() {
                watches.reserve(self.chunk);
            }
            watches.push(watch);
        }
        local.add(label)
    }

    pub(crate) fn ensure_section(&self, label: &str) -> Arc<Watch> {
        let id = self.create_section(label, SectionKind::Computation, true);
        self.watch_by_id(id)
    }

    /// Pre-declare a section and its properties.
    pub fn set_properties(&self, label: &str, kind: SectionKind, exclusive: bool) {
        if !self.enabled {
            return;
        }
        if label.is_empty() {
            if self.ctx.my_rank == 0 {
                warn!("set_properties with a blank label, ignored");
            }
            return;
        }
        self.create_section(label, kind, exclusive);
    }

    /// Open the measurement bracket for a section, registering the label on
    /// first use.
    pub fn start(&self, label: &str) {
        if !self.enabled {
            return;
        }
        if label.is_empty() {
            if self.ctx.my_rank == 0 {
                warn!("start with a blank label, ignored");
            }
            return;
        }
        let found = self.local.lock().find(label);
        let id = match found {
            Some(id) => id,
            None => self.create_section(label, SectionKind::Computation, true),
        };
        self.exclusive_slot().store(true, Ordering::Relaxed);
        self.watch_by_id(id).start();
    }

    /// Close the measurement bracket. `flop_per_task * iteration_count` is
    /// folded into the declared volume in USER mode.
    pub fn stop(&self, label: &str, flop_per_task: f64, iteration_count: u32) {
        if !self.enabled {
            return;
        }
        if label.is_empty() {
            if self.ctx.my_rank == 0 {
                warn!("stop with a blank label, ignored");
            }
            return;
        }
        let Some(id) = self.local.lock().find(label) else {
            if self.ctx.my_rank == 0 {
                warn!(section = label, "stop on an unknown label, ignored");
            }
            return;
        };
        let watch = self.watch_by_id(id);
        watch.stop(flop_per_task, iteration_count);
        let slot = self.exclusive_slot();
        if !slot.load(Ordering::Relaxed) {
            watch.clear_exclusive();
        }
        slot.store(false, Ordering::Relaxed);
    }

    /// Zero one section's accumulators. Root cannot be reset.
    pub fn reset(&self, label: &str) {
        if !self.enabled {
            return;
        }
        if label == ROOT_LABEL {
            if self.ctx.my_rank == 0 {
                warn!("the Root section cannot be reset");
            }
            return;
        }
        let Some(id) = self.local.lock().find(label) else {
            if self.ctx.my_rank == 0 {
                warn!(section = label, "reset on an unknown label, ignored");
            }
            return;
        };
        self.watch_by_id(id).reset();
    }

    /// Zero every section except Root.
    pub fn reset_all(&self) {
        if !self.enabled {
            return;
        }
        let watches = self.watches.read().clone();
        for watch in watches.iter().skip(1) {
            watch.reset();
        }
    }

    /// Stop the Root section, force-stopping any section still running.
    pub fn stop_root(&self) {
        if !self.enabled {
            return;
        }
        if !self.root_active.swap(false, Ordering::Relaxed) {
            return;
        }
        let now = self.ctx.clock.now();
        let watches = self.watches.read().clone();
        for watch in watches.iter().skip(1) {
            if watch.any_running() {
                if self.ctx.my_rank == 0 {
                    warn!(
                        section = %watch.label(),
                        "still running when Root stopped; forced stop, time values are best-effort"
                    );
                }
                watch.force_stop(now);
                watch.mark_unhealthy();
                self.forced_stops.lock().push(watch.label().to_string());
            }
        }
        if let Some(root) = self.watches.read().first() {
            root.stop(0.0, 1);
        }
    }

    /// Complete the master-local registry from the shared enumeration.
    /// Sections created here were registered by other threads inside
    /// parallel regions and are marked accordingly.
    pub(crate) fn count_sections(&self) -> usize {
        let labels = self.shared.snapshot();
        for label in &labels {
            if self.local.lock().find(label).is_some() {
                continue;
            }
            let id = self.create_section(label, SectionKind::Computation, true);
            self.watch_by_id(id).mark_in_parallel();
        }
        labels.len()
    }

    /// Run the three-phase thread merge for one shared section ID.
    ///
    /// Called from a serial context this drives all three phases, with the
    /// fork-join fan-out supplying phase 2. Called from inside a parallel
    /// region it contributes the calling thread's row; the report driver
    /// completes phases 1 and 3 later.
    pub fn merge_threads(&self, shared_id: usize) {
        if !self.enabled {
            return;
        }
        let Some(label) = self.shared.label_of(shared_id) else {
            if self.ctx.my_rank == 0 {
                warn!(shared_id, "merge_threads on an unknown section ID");
            }
            return;
        };
        let Some(id) = self.local.lock().find(&label) else {
            return;
        };
        let watch = self.watch_by_id(id);
        if watch.any_running() {
            if self.ctx.my_rank == 0 {
                warn!(section = %label, "merge requested while the section is running, skipped");
            }
            return;
        }

        if let Some(me) = rayon::current_thread_index() {
            let mut scratch = self.scratch.lock();
            watch.merge_parallel(me, &mut scratch);
        } else {
            {
                let mut scratch = self.scratch.lock();
                watch.merge_master(&mut scratch);
            }
            rayon::broadcast(|bctx| {
                let mut scratch = self.scratch.lock();
                watch.merge_parallel(bctx.index(), &mut scratch);
            });
            let mut scratch = self.scratch.lock();
            watch.merge_update(&mut scratch);
        }
    }

    /// Gather every section across the process group and compute statistics.
    /// Collective failure is fatal to the group.
    pub(crate) fn gather_and_stats(&self) {
        let watches = self.watches.read().clone();
        for watch in watches.iter() {
            let outcome = watch
                .gather_hwpc(self.collective.as_ref())
                .and_then(|_| watch.gather(self.collective.as_ref()));
            if let Err(e) = outcome {
                error!(section = %watch.label(), error = %e, "collective operation failed, aborting the process group");
                self.collective.abort();
            }
        }
        if let Some(root) = watches.first() {
            if let Err(e) = root.gather_power(self.collective.as_ref()) {
                error!(error = %e, "power gather failed, aborting the process group");
                self.collective.abort();
            }
        }
    }

    /// Stop Root, merge every section, gather, and render the report.
    ///
    /// Every rank must call this (the gather phase is collective); only
    /// rank 0 writes output. Calling it again re-renders the same data.
    pub fn report(&self, out: &mut dyn Write) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.stop_root();
        self.count_sections();
        debug_assert_eq!(self.section_count(), self.local_count());
        for shared_id in 0..self.shared.len() {
            self.merge_threads(shared_id);
        }
        self.gather_and_stats();

        if self.ctx.my_rank == 0 {
            let input = self.build_report_input();
            report::write_report(out, &input)?;
        }
        Ok(())
    }

    /// Snapshot everything the renderers need.
    pub(crate) fn build_report_input(&self) -> ReportInput {
        let watches = self.watches.read().clone();
        let sections: Vec<_> = watches
            .iter()
            .map(|w| report::section_report(w, &self.ctx, self.env.report == ReportLevel::Full))
            .collect();
        let section_stats: Vec<_> = sections.iter().map(|s| s.stats.clone()).collect();
        let order = stats::sort_by_mean_time(&section_stats);
        let root_time = sections.first().map(|s| s.stats.time_av).unwrap_or(0.0);

        ReportInput {
            version: crate::VERSION.to_string(),
            hostname: hostname(),
            date: chrono::Local::now().format("%Y/%m/%d %H:%M:%S").to_string(),
            parallel_mode: parallel_mode(self.ctx.num_process, self.ctx.num_threads),
            num_process: self.ctx.num_process,
            num_threads: self.ctx.num_threads,
            chooser: self.ctx.chooser,
            hwpc_active: self.ctx.hwpc_events() > 0,
            report_level: self.env.report,
            power_level: self.ctx.power_level,
            trace_level: self.ctx.trace_level,
            root_time,
            sections,
            order,
            forced_stops: self.forced_stops.lock().clone(),
        }
    }

    /// Render the machine-readable report. Rank-0 data only.
    pub fn report_json(&self, out: &mut dyn Write) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.stop_root();
        self.count_sections();
        for shared_id in 0..self.shared.len() {
            self.merge_threads(shared_id);
        }
        self.gather_and_stats();
        if self.ctx.my_rank == 0 {
            let input = self.build_report_input();
            crate::json_output::write_json(out, &input)?;
        }
        Ok(())
    }

    /// Finalize the tracing back-end. Idempotent; at most one trace is
    /// written per run.
    pub fn post_trace(&self) {
        if !self.enabled || self.ctx.trace_level == TraceLevel::Off {
            return;
        }
        if self.trace_finalized.swap(true, Ordering::Relaxed) {
            return;
        }
        let unit = match self.ctx.chooser {
            HwpcChooser::User => "B/sec or Flops",
            chooser => hwpc::legend_lines(chooser)
                .last()
                .map(|(sym, _)| *sym)
                .unwrap_or(""),
        };
        self.ctx.trace.finalize(&self.env.trace_basename, unit);
    }

    /// Read a node power knob. Requires POWER_CHOOSER to be active.
    pub fn get_power_knob(&self, knob: PowerKnob) -> Result<i32, PowerError> {
        if !self.enabled {
            return Err(PowerError::Unsupported);
        }
        if self.ctx.power_level == PowerLevel::Off {
            if self.ctx.my_rank == 0 {
                warn!("set POWER_CHOOSER to activate the power knobs");
            }
            return Err(PowerError::Unsupported);
        }
        self.ctx.power.read_knob(knob)
    }

    /// Update a node power knob after validating the value menu.
    pub fn set_power_knob(&self, knob: PowerKnob, value: i32) -> Result<(), PowerError> {
        if !self.enabled {
            return Err(PowerError::Unsupported);
        }
        if self.ctx.power_level == PowerLevel::Off {
            if self.ctx.my_rank == 0 {
                warn!("set POWER_CHOOSER to activate the power knobs");
            }
            return Err(PowerError::Unsupported);
        }
        if !knob.valid_value(value) {
            return Err(PowerError::BadValue { knob, value });
        }
        self.ctx.power.write_knob(knob, value)
    }

    /// Save the in-flight measurement state to the derived record path.
    pub fn save_state(&self) -> anyhow::Result<std::path::PathBuf> {
        crate::persist::save_state(self)
    }

    /// Serialize the in-flight measurement state.
    pub fn save_state_to(&self, out: &mut dyn Write) -> anyhow::Result<()> {
        crate::persist::save_state_to(self, out)
    }

    /// Restore measurement state saved by an earlier process.
    pub fn load_state(&self) -> anyhow::Result<()> {
        crate::persist::load_state(self)
    }

    /// Deserialize measurement state from a reader.
    pub fn load_state_from(&self, input: &mut dyn std::io::BufRead) -> anyhow::Result<()> {
        crate::persist::load_state_from(self, input)
    }

    /// Watches in local registration order (Root first).
    pub(crate) fn watches_in_order(&self) -> Vec<Arc<Watch>> {
        self.watches.read().clone()
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn parallel_mode(num_process: usize, num_threads: usize) -> String {
    match (num_process > 1, num_threads > 1) {
        (true, true) => format!("Hybrid ({} processes x {} threads)", num_process, num_threads),
        (true, false) => format!("Process-parallel ({} processes)", num_process),
        (false, true) => format!("Thread-parallel ({} threads)", num_threads),
        (false, false) => "Serial".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::FakeCounters;

    fn user_env() -> RuntimeEnv {
        RuntimeEnv {
            hwpc: HwpcChooser::User,
            ..RuntimeEnv::default()
        }
    }

    fn user_monitor() -> Monitor {
        Monitor::builder().env(user_env()).initialize(10)
    }

    #[test]
    fn test_initialize_starts_root() {
        let pm = user_monitor();
        assert!(pm.is_enabled());
        assert_eq!(pm.section_count(), 1);
        let root = pm.watch(ROOT_LABEL).unwrap();
        assert!(root.any_running());
        assert!(!root.is_exclusive());
    }

    #[test]
    fn test_bypass_disables_everything() {
        let env = RuntimeEnv {
            bypass: true,
            ..user_env()
        };
        let pm = Monitor::builder().env(env).initialize(10);
        assert!(!pm.is_enabled());
        pm.start("a");
        pm.stop("a", 0.0, 1);
        assert_eq!(pm.section_count(), 0);
        let mut out = Vec::new();
        pm.report(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_start_registers_implicitly() {
        let pm = user_monitor();
        pm.start("kernel");
        pm.stop("kernel", 0.0, 1);
        assert_eq!(pm.section_count(), 2);
        assert_eq!(pm.watch("kernel").unwrap().call_count(), 1);
    }

    #[test]
    fn test_stop_unknown_label_is_ignored() {
        let pm = user_monitor();
        pm.stop("ghost", 0.0, 1);
        assert_eq!(pm.section_count(), 1);
    }

    #[test]
    fn test_nesting_clears_exclusive() {
        let pm = user_monitor();
        pm.start("outer");
        pm.start("inner");
        pm.stop("inner", 0.0, 1);
        pm.stop("outer", 0.0, 1);
        assert!(!pm.watch("outer").unwrap().is_exclusive());
        assert!(pm.watch("inner").unwrap().is_exclusive());
    }

    #[test]
    fn test_sequential_sections_stay_exclusive() {
        let pm = user_monitor();
        pm.start("a");
        pm.stop("a", 0.0, 1);
        pm.start("b");
        pm.stop("b", 0.0, 1);
        assert!(pm.watch("a").unwrap().is_exclusive());
        assert!(pm.watch("b").unwrap().is_exclusive());
    }

    #[test]
    fn test_reset_refuses_root() {
        let pm = user_monitor();
        pm.start("a");
        pm.stop("a", 1.0, 1);
        pm.reset(ROOT_LABEL);
        assert!(pm.watch(ROOT_LABEL).unwrap().any_running());
        pm.reset("a");
        assert_eq!(pm.watch("a").unwrap().call_count(), 0);
    }

    #[test]
    fn test_reset_all_spares_root() {
        let pm = user_monitor();
        pm.start("a");
        pm.stop("a", 1.0, 1);
        pm.reset_all();
        assert_eq!(pm.watch("a").unwrap().call_count(), 0);
        assert!(pm.watch(ROOT_LABEL).unwrap().any_running());
    }

    #[test]
    fn test_stop_root_force_stops_running_sections() {
        let pm = user_monitor();
        pm.start("open");
        pm.stop_root();
        let open = pm.watch("open").unwrap();
        assert!(!open.any_running());
        assert!(!open.is_healthy());
        assert_eq!(open.call_count(), 1);
        assert!(!pm.watch(ROOT_LABEL).unwrap().any_running());
    }

    #[test]
    fn test_report_runs_and_is_idempotent() {
        let pm = user_monitor();
        pm.start("a");
        std::thread::sleep(std::time::Duration::from_millis(2));
        pm.stop("a", 100.0, 1);
        let mut first = Vec::new();
        pm.report(&mut first).unwrap();
        assert!(!first.is_empty());
        let count_after_first = pm.watch("a").unwrap().with_master(|m| m.count);
        let mut second = Vec::new();
        pm.report(&mut second).unwrap();
        let count_after_second = pm.watch("a").unwrap().with_master(|m| m.count);
        assert_eq!(count_after_first, count_after_second);
        assert_eq!(pm.section_count(), pm.local_count());
    }

    #[test]
    fn test_report_after_root_stop_shows_sections() {
        let pm = user_monitor();
        pm.start("compute");
        pm.stop("compute", 2.0e9, 1);
        let mut out = Vec::new();
        pm.report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("compute"));
        assert!(text.contains("Serial") || text.contains("Thread-parallel"));
    }

    #[test]
    fn test_power_knobs_require_power_chooser() {
        let pm = user_monitor();
        assert!(pm.get_power_knob(PowerKnob::CpuFreq).is_err());
        assert!(pm.set_power_knob(PowerKnob::CpuFreq, 2000).is_err());
    }

    #[test]
    fn test_hwpc_bind_failure_degrades_to_time_only() {
        // NullCounters rejects the event set; FLOPS sections still time.
        let env = RuntimeEnv {
            hwpc: HwpcChooser::Flops,
            ..RuntimeEnv::default()
        };
        let pm = Monitor::builder().env(env).initialize(4);
        pm.start("a");
        pm.stop("a", 5.0, 2);
        // Degraded to user accounting: declared volume is recorded.
        assert_eq!(pm.watch("a").unwrap().user_volume(), 10.0);
    }

    #[test]
    fn test_trace_backend_sees_section_events() {
        use crate::otf::{RecordingTrace, TraceEvent};
        let trace = Arc::new(RecordingTrace::new());
        let env = RuntimeEnv {
            trace: TraceLevel::Full,
            ..user_env()
        };
        let pm = Monitor::builder()
            .env(env)
            .trace(Arc::clone(&trace) as Arc<dyn TraceBackend>)
            .initialize(4);
        pm.start("traced");
        pm.stop("traced", 0.0, 1);
        pm.post_trace();
        pm.post_trace(); // second call is a no-op

        let events = trace.events();
        let finalizes = events
            .iter()
            .filter(|e| matches!(e, TraceEvent::Finalize { .. }))
            .count();
        assert_eq!(finalizes, 1);
        assert!(events.iter().any(|e| matches!(
            e,
            TraceEvent::Label { label, .. } if label == "traced"
        )));
        let id = pm.shared_id("traced").unwrap();
        assert!(events.iter().any(|e| matches!(e, TraceEvent::Start { id: i } if *i == id)));
        assert!(events.iter().any(|e| matches!(e, TraceEvent::Stop { id: i, .. } if *i == id)));
    }

    #[test]
    fn test_power_accounting_accumulates_joules() {
        use crate::power::FakePower;
        let power = Arc::new(FakePower::new(1));
        let env = RuntimeEnv {
            power: PowerLevel::Node,
            ..user_env()
        };
        let pm = Monitor::builder()
            .env(env)
            .power(Arc::clone(&power) as Arc<dyn PowerBackend>)
            .initialize(4);
        pm.start("hot");
        power.consume(25.0);
        pm.stop("hot", 0.0, 1);
        let joules = pm.watch("hot").unwrap().with_master(|m| m.power_accum[0]);
        assert_eq!(joules, 25.0);

        let mut out = Vec::new();
        pm.report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("POWER_CHOOSER=NODE"));
    }

    #[test]
    fn test_fake_counters_feed_flops_report() {
        let fake = Arc::new(FakeCounters::new(rayon::current_num_threads(), 2));
        let env = RuntimeEnv {
            hwpc: HwpcChooser::Flops,
            ..RuntimeEnv::default()
        };
        let pm = Monitor::builder()
            .env(env)
            .counters(Arc::clone(&fake) as Arc<dyn CounterBackend>)
            .initialize(4);
        pm.start("math");
        fake.bump_all(0, 1_000);
        fake.bump_all(1, 2_000);
        pm.stop("math", 0.0, 1);
        let mut out = Vec::new();
        pm.report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("math"));
        let flop = pm.watch("math").unwrap().with_master(|m| m.flop);
        assert_eq!(flop, (3_000 * pm.num_threads()) as f64);
    }
}
