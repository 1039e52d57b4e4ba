//! Shell-mode persistence of in-flight measurement state
//!
//! A shell "start timer" process saves every section's start snapshot to a
//! record file; a later "stop timer" process loads it and carries on as if
//! the bracket had stayed open. The record path is derived from the job
//! name, the job ID and the parent shell's PID, so paired invocations from
//! the same shell find each other. Derived metric vectors are not stored;
//! they are re-derived after load from the raw snapshots.
//!
//! Record format: one header line carrying the HWPC chooser, then per
//! section a label line with the start time, a geometry line, and
//! `thread_count x event_count` integer snapshots, one per line.

use crate::monitor::Monitor;
use anyhow::{bail, Context, Result};
use std::io::{BufRead, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Record directory: `$HOME/.shellpm/measured_data`, or a per-user
/// directory under /tmp when HOME is not set. Created mode 0700.
pub fn storage_dir() -> PathBuf {
    let base = match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => PathBuf::from(home),
        _ => {
            let user = std::env::var("USER").unwrap_or_else(|_| "nobody".to_string());
            PathBuf::from("/tmp").join(user)
        }
    };
    base.join(".shellpm").join("measured_data")
}

/// Record file name: `<job-name>.<job-ID>.<parent-pid>`, with `shellpm`
/// and `record` standing in for unset job variables.
pub fn record_file_name() -> String {
    let mut name = std::env::var("PJM_JOBNAME").unwrap_or_else(|_| "shellpm".to_string());
    match std::env::var("PJM_JOBID") {
        Ok(id) if !id.is_empty() => {
            name.push('.');
            name.push_str(&id);
        }
        _ => name.push_str(".record"),
    }
    name.push('.');
    name.push_str(&nix::unistd::getppid().as_raw().to_string());
    name
}

pub fn record_path() -> PathBuf {
    storage_dir().join(record_file_name())
}

pub(crate) fn save_state(monitor: &Monitor) -> Result<PathBuf> {
    let dir = storage_dir();
    if !dir.exists() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .with_context(|| format!("cannot create record directory {}", dir.display()))?;
    }
    let path = dir.join(record_file_name());
    let mut file = std::fs::File::create(&path)
        .with_context(|| format!("cannot create record file {}", path.display()))?;
    save_state_to(monitor, &mut file)?;
    debug!(path = %path.display(), "measurement state saved");
    Ok(path)
}

pub(crate) fn save_state_to(monitor: &Monitor, out: &mut dyn Write) -> Result<()> {
    let ctx = monitor.instruments();
    writeln!(out, "shellpm HWPC_CHOOSER={}", ctx.chooser.as_str())?;
    let num_threads = ctx.num_threads;
    let num_events = ctx.events.len();
    for watch in monitor.watches_in_order() {
        let (start_time, _) = watch.snapshot_of(0).unwrap_or((0.0, Vec::new()));
        writeln!(out, "section {} start_time= {:.15e}", watch.label(), start_time)?;
        writeln!(out, "num_threads= {}, num_events= {}", num_threads, num_events)?;
        for t in 0..num_threads {
            let (_, values) = watch.snapshot_of(t).unwrap_or((0.0, vec![0; num_events]));
            for e in 0..num_events {
                writeln!(out, "{}", values.get(e).copied().unwrap_or(0))?;
            }
        }
    }
    Ok(())
}

/// Load the record written by the paired "start" process, then remove it.
pub(crate) fn load_state(monitor: &Monitor) -> Result<()> {
    let path = record_path();
    let file = std::fs::File::open(&path)
        .with_context(|| format!("cannot open record file {}", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    load_state_from(monitor, &mut reader)?;

    if let Err(e) = std::fs::remove_file(&path) {
        warn!(path = %path.display(), error = %e, "failed to remove the record file");
        return Ok(());
    }
    // Prune the directory; it stays if another job still has records.
    let _ = std::fs::remove_dir(storage_dir());
    Ok(())
}

pub(crate) fn load_state_from(monitor: &Monitor, input: &mut dyn BufRead) -> Result<()> {
    let ctx = monitor.instruments();
    let mut lines = input.lines();
    let header = lines
        .next()
        .context("record file is empty")?
        .context("cannot read the record header")?;
    let chooser = header
        .rsplit("HWPC_CHOOSER=")
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    if chooser != ctx.chooser.as_str() {
        warn!(
            recorded = %chooser,
            current = ctx.chooser.as_str(),
            "record was measured under a different HWPC_CHOOSER; metrics are re-derived with the current one"
        );
    }

    while let Some(line) = lines.next() {
        let line = line.context("cannot read a section line")?;
        if line.trim().is_empty() {
            continue;
        }
        let Some(rest) = line.strip_prefix("section ") else {
            bail!("malformed section line in record file: {line:?}");
        };
        let Some(pos) = rest.rfind(" start_time= ") else {
            bail!("missing start_time in record file line: {line:?}");
        };
        let label = &rest[..pos];
        let start_time: f64 = rest[pos + " start_time= ".len()..]
            .trim()
            .parse()
            .with_context(|| format!("bad start_time for section {label:?}"))?;

        let geometry = lines
            .next()
            .context("record file truncated before the geometry line")?
            .context("cannot read the geometry line")?;
        let (num_threads, num_events) = parse_geometry(&geometry)
            .with_context(|| format!("bad geometry line {geometry:?}"))?;

        let watch = monitor.ensure_section(label);
        for t in 0..num_threads {
            let mut values = vec![0i64; num_events];
            for value in values.iter_mut() {
                let raw = lines
                    .next()
                    .context("record file truncated inside a snapshot block")?
                    .context("cannot read a counter line")?;
                *value = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("bad counter value {raw:?}"))?;
            }
            watch.restore_snapshot(t, start_time, &values);
        }
    }
    Ok(())
}

fn parse_geometry(line: &str) -> Option<(usize, usize)> {
    let rest = line.trim().strip_prefix("num_threads=")?;
    let (threads, rest) = rest.split_once(',')?;
    let events = rest.trim().strip_prefix("num_events=")?;
    Some((
        threads.trim().parse().ok()?,
        events.trim().parse().ok()?,
    ))
}
