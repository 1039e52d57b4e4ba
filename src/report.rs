//! Layered text report: BASIC, DETAIL and FULL
//!
//! BASIC prints the header, one row per measured section averaged over the
//! process group, and a tail of exclusive-section sums. DETAIL appends a
//! per-rank breakdown per section, FULL additionally the master rank's
//! per-thread breakdown. A legend closes any report that used hardware
//! counters.

use crate::config::{HwpcChooser, PowerLevel, ReportLevel, TraceLevel};
use crate::hwpc;
use crate::stats::SectionStats;
use crate::watch::{Instruments, SectionKind, Watch};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;

/// Per-thread view for the FULL report.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ThreadMetricsView {
    pub time: f64,
    pub count: u64,
    pub sorted: Vec<f64>,
}

/// Everything the renderers need about one section.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct SectionReport {
    pub label: String,
    pub kind: &'static str,
    pub exclusive: bool,
    pub in_parallel: bool,
    pub healthy: bool,
    pub stats: SectionStats,
    pub percentage: f64,
    pub time_array: Vec<f64>,
    pub flop_array: Vec<f64>,
    pub count_array: Vec<u64>,
    pub sorted_names: Vec<&'static str>,
    pub sorted_values: Vec<f64>,
    /// Rank-major `num_process × sorted_names.len()` matrix.
    pub sorted_matrix: Vec<f64>,
    pub threads: Vec<ThreadMetricsView>,
    pub power_joule_av: f64,
    /// Scaled headline rate and its unit.
    pub headline: f64,
    pub headline_unit: &'static str,
    #[serde(skip)]
    pub kind_value: SectionKind,
}

/// The gathered snapshot handed to the renderers.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ReportInput {
    pub version: String,
    pub hostname: String,
    pub date: String,
    pub parallel_mode: String,
    pub num_process: usize,
    pub num_threads: usize,
    #[serde(serialize_with = "serialize_chooser")]
    pub chooser: HwpcChooser,
    pub hwpc_active: bool,
    #[serde(skip)]
    pub report_level: ReportLevel,
    #[serde(skip)]
    pub power_level: PowerLevel,
    #[serde(skip)]
    pub trace_level: TraceLevel,
    /// Root elapsed time, the weight denominator.
    pub root_time: f64,
    /// All sections in registration order, Root at index 0.
    pub sections: Vec<SectionReport>,
    /// Render order (descending mean time).
    pub order: Vec<usize>,
    pub forced_stops: Vec<String>,
}

fn serialize_chooser<S: serde::Serializer>(c: &HwpcChooser, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(c.as_str())
}

/// Assemble the report view of one watch from its merged and gathered state.
pub(crate) fn section_report(
    watch: &Arc<Watch>,
    ctx: &Arc<Instruments>,
    include_threads: bool,
) -> SectionReport {
    let threads = if include_threads {
        watch
            .thread_metrics()
            .into_iter()
            .map(|(time, count, sm)| ThreadMetricsView {
                time,
                count,
                sorted: sm.values,
            })
            .collect()
    } else {
        Vec::new()
    };

    watch.with_master(|m| {
        let percentage_mode = matches!(
            ctx.chooser,
            HwpcChooser::Vector | HwpcChooser::Cache | HwpcChooser::LoadStore
        ) && ctx.hwpc_events() > 0;
        let raw_rate = if percentage_mode {
            m.percentage
        } else if m.stats.time_av > 0.0 {
            m.stats.flop_av / m.stats.time_av
        } else {
            0.0
        };
        let (headline, headline_unit) = hwpc::scaled_unit(raw_rate, ctx.chooser, watch.kind());

        SectionReport {
            label: watch.label().to_string(),
            kind: watch.kind().as_str(),
            exclusive: watch.is_exclusive(),
            in_parallel: watch.is_in_parallel(),
            healthy: watch.is_healthy(),
            stats: m.stats.clone(),
            percentage: m.percentage,
            time_array: m.time_array.clone(),
            flop_array: m.flop_array.clone(),
            count_array: m.count_array.clone(),
            sorted_names: m.sorted.names.clone(),
            sorted_values: m.sorted.values.clone(),
            sorted_matrix: m.sorted_matrix.clone(),
            threads,
            power_joule_av: m.power_av,
            headline,
            headline_unit,
            kind_value: watch.kind(),
        }
    })
}

fn marked_label(section: &SectionReport) -> String {
    let mut label = section.label.clone();
    if !section.exclusive {
        label.push_str(" (*)");
    }
    if section.in_parallel {
        label.push_str(" (+)");
    }
    label
}

fn volume_description(chooser: HwpcChooser, hwpc_active: bool) -> &'static str {
    if !hwpc_active {
        return "user defined numerical performance";
    }
    match chooser {
        HwpcChooser::User => "user defined numerical performance",
        HwpcChooser::Bandwidth => "hardware counted data access",
        HwpcChooser::Flops | HwpcChooser::Vector => "hardware counted floating point ops.",
        HwpcChooser::Cache => "hardware counted cache utilization",
        HwpcChooser::Cycle => "hardware counted total instructions",
        HwpcChooser::LoadStore => "memory load and store instruction type",
    }
}

/// Render the report at the level selected by `PMLIB_REPORT`.
pub(crate) fn write_report(out: &mut dyn Write, input: &ReportInput) -> std::io::Result<()> {
    write_basic(out, input)?;
    if input.report_level >= ReportLevel::Detail {
        write_detail(out, input)?;
    }
    if input.report_level >= ReportLevel::Full {
        write_threads(out, input)?;
    }
    if input.hwpc_active {
        write_legend(out, input)?;
    }
    Ok(())
}

fn write_basic(out: &mut dyn Write, input: &ReportInput) -> std::io::Result<()> {
    writeln!(
        out,
        "\n# Performance Monitor Basic Report ------------------------------------------- #\n"
    )?;
    writeln!(
        out,
        "\tPerformance statistics report from permon version {}",
        input.version
    )?;
    writeln!(out, "\tHost name : {}", input.hostname)?;
    writeln!(out, "\tDate      : {}", input.date)?;
    writeln!(out, "\tParallel mode : {}", input.parallel_mode)?;
    writeln!(
        out,
        "\tEffective environment : HWPC_CHOOSER={}, PMLIB_REPORT={}, POWER_CHOOSER={}, OTF_TRACING={}",
        input.chooser.as_str(),
        input.report_level.as_str(),
        input.power_level.as_str(),
        input.trace_level.as_str()
    )?;
    writeln!(
        out,
        "\tActive elapsed time (initialize to report) = {:9.3e} [sec]",
        input.root_time
    )?;
    writeln!(
        out,
        "\tSections marked (*) are inclusive; sections marked (+) ran inside a parallel region.\n"
    )?;

    let label_width = input
        .sections
        .iter()
        .map(|s| marked_label(s).len())
        .max()
        .unwrap_or(8)
        .max(8)
        + 1;

    writeln!(
        out,
        "{:<width$}| number of| measured | weight| time per| std.dv of | {}",
        "Section",
        volume_description(input.chooser, input.hwpc_active),
        width = label_width
    )?;
    writeln!(
        out,
        "{:<width$}|   calls  | time[sec]   [%]   call[sec]    time    | volume      std.dv  performance",
        "Label",
        width = label_width
    )?;
    write_rule(out, label_width)?;

    let mut sum_time_calc = 0.0;
    let mut sum_time_comm = 0.0;
    let mut sum_calc = 0.0;
    let mut sum_comm = 0.0;
    let mut sum_unit = "";

    for &i in &input.order {
        if i == 0 {
            continue;
        }
        let s = &input.sections[i];
        if s.stats.count_sum == 0 {
            continue;
        }
        let weight = if input.root_time > 0.0 {
            100.0 * s.stats.time_av / input.root_time
        } else {
            0.0
        };
        writeln!(
            out,
            "{:<width$}: {:8} {:10.3e} {:6.2} {:10.3e} {:9.2e}   {:10.3e} {:9.2e} {:8.2} {}",
            marked_label(s),
            s.stats.count_av,
            s.stats.time_av,
            weight,
            s.stats.time_per_call(input.num_process),
            s.stats.time_sd,
            s.stats.flop_av,
            s.stats.flop_sd,
            s.headline,
            s.headline_unit,
            width = label_width
        )?;
        if s.kind_value == SectionKind::Communication && s.stats.time_comm > 0.0 {
            writeln!(
                out,
                "{:<width$}  (max time across processes: {:10.3e} [sec])",
                "",
                s.stats.time_comm,
                width = label_width
            )?;
        }
        if s.exclusive {
            match s.kind_value {
                SectionKind::Communication => {
                    sum_time_comm += s.stats.time_av;
                    sum_comm += s.stats.flop_av;
                }
                SectionKind::Computation => {
                    sum_time_calc += s.stats.time_av;
                    sum_calc += s.stats.flop_av;
                }
            }
            sum_unit = s.headline_unit;
        }
    }
    write_rule(out, label_width)?;

    for (name, sum_time, sum_volume) in [
        ("Sum of exclusive COMM sections", sum_time_comm, sum_comm),
        ("Sum of exclusive CALC sections", sum_time_calc, sum_calc),
    ] {
        if sum_time > 0.0 {
            let weight = if input.root_time > 0.0 {
                100.0 * sum_time / input.root_time
            } else {
                0.0
            };
            writeln!(
                out,
                "{:<width$}  {:10.3e} {:6.2}  volume {:10.3e} {}",
                name,
                sum_time,
                weight,
                sum_volume,
                sum_unit,
                width = label_width + 10
            )?;
            writeln!(
                out,
                "{:<width$}  volume of all processes {:10.3e}",
                "[sum of all processes]",
                sum_volume * input.num_process as f64,
                width = label_width + 10
            )?;
        }
    }
    writeln!(
        out,
        "{:<width$}  {:10.3e} 100.00",
        "[active elapsed time]",
        input.root_time,
        width = label_width + 10
    )?;

    if !input.forced_stops.is_empty() {
        writeln!(
            out,
            "\n\tNote: still running when Root stopped, force-stopped with best-effort times: {}",
            input.forced_stops.join(", ")
        )?;
    }

    if input.power_level != PowerLevel::Off {
        if let Some(root) = input.sections.first() {
            let watts = if input.root_time > 0.0 {
                root.power_joule_av / input.root_time
            } else {
                0.0
            };
            writeln!(
                out,
                "\n\tAverage node power over the job : {:10.3e} [J] = {:10.3e} [W]",
                root.power_joule_av, watts
            )?;
        }
    }
    Ok(())
}

fn write_rule(out: &mut dyn Write, label_width: usize) -> std::io::Result<()> {
    for _ in 0..label_width {
        write!(out, "-")?;
    }
    writeln!(
        out,
        "+----------+----------------------------------------+--------------------------------"
    )
}

/// Per-rank breakdown of every measured section.
fn write_detail(out: &mut dyn Write, input: &ReportInput) -> std::io::Result<()> {
    writeln!(
        out,
        "\n# Performance Monitor Rank Report -------------------------------------------- #"
    )?;
    for &i in &input.order {
        if i == 0 {
            continue;
        }
        let s = &input.sections[i];
        if s.stats.count_sum == 0 {
            continue;
        }
        writeln!(out, "\nSection : {}", marked_label(s))?;
        write!(out, "  rank |    calls | time[sec]  | volume    ")?;
        if !s.sorted_names.is_empty() && !s.sorted_matrix.is_empty() {
            for name in &s.sorted_names {
                write!(out, "| {:>10} ", name)?;
            }
        }
        writeln!(out)?;
        let width = s.sorted_names.len();
        for rank in 0..input.num_process {
            write!(
                out,
                "  {:4} | {:8} | {:10.3e} | {:10.3e}",
                rank,
                s.count_array.get(rank).copied().unwrap_or(0),
                s.time_array.get(rank).copied().unwrap_or(0.0),
                s.flop_array.get(rank).copied().unwrap_or(0.0)
            )?;
            if width > 0 && s.sorted_matrix.len() >= (rank + 1) * width {
                for v in &s.sorted_matrix[rank * width..(rank + 1) * width] {
                    write!(out, " | {:10.3e}", v)?;
                }
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

/// Per-thread breakdown of the master rank.
fn write_threads(out: &mut dyn Write, input: &ReportInput) -> std::io::Result<()> {
    writeln!(
        out,
        "\n# Performance Monitor Thread Report (rank 0) --------------------------------- #"
    )?;
    for &i in &input.order {
        if i == 0 {
            continue;
        }
        let s = &input.sections[i];
        if s.stats.count_sum == 0 || s.threads.is_empty() {
            continue;
        }
        writeln!(out, "\nSection : {}", marked_label(s))?;
        writeln!(out, "  thread |    calls | time[sec]  | metrics")?;
        for (t, row) in s.threads.iter().enumerate() {
            write!(
                out,
                "  {:6} | {:8} | {:10.3e} |",
                t, row.count, row.time
            )?;
            for v in &row.sorted {
                write!(out, " {:10.3e}", v)?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

fn write_legend(out: &mut dyn Write, input: &ReportInput) -> std::io::Result<()> {
    writeln!(
        out,
        "\n# Performance Monitor Legend -------------------------------------------------- #\n"
    )?;
    writeln!(out, "\t(*)  inclusive section: other sections ran inside it")?;
    writeln!(out, "\t(+)  section defined inside a parallel region")?;
    for (symbol, meaning) in hwpc::legend_lines(input.chooser) {
        writeln!(out, "\t{:<24} {}", symbol, meaning)?;
    }
    Ok(())
}
