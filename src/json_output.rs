//! Machine-readable report export
//!
//! Mirrors the text report's gathered data as one JSON document, for tooling
//! that post-processes measurement results.

use crate::report::ReportInput;
use std::io::Write;

/// Serialize the gathered report snapshot as pretty-printed JSON.
pub(crate) fn write_json(out: &mut dyn Write, input: &ReportInput) -> anyhow::Result<()> {
    let doc = serde_json::json!({
        "format": "permon-report",
        "report": input,
    });
    serde_json::to_writer_pretty(&mut *out, &doc)?;
    out.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HwpcChooser, PowerLevel, ReportLevel, TraceLevel};
    use crate::report::SectionReport;
    use crate::stats::SectionStats;
    use crate::watch::SectionKind;

    fn sample_input() -> ReportInput {
        ReportInput {
            version: "test".to_string(),
            hostname: "host".to_string(),
            date: "2026/01/01 00:00:00".to_string(),
            parallel_mode: "Serial".to_string(),
            num_process: 1,
            num_threads: 2,
            chooser: HwpcChooser::Flops,
            hwpc_active: true,
            report_level: ReportLevel::Basic,
            power_level: PowerLevel::Off,
            trace_level: TraceLevel::Off,
            root_time: 1.5,
            sections: vec![SectionReport {
                label: "kernel".to_string(),
                kind: "CALC",
                exclusive: true,
                in_parallel: false,
                healthy: true,
                stats: SectionStats {
                    time_av: 1.0,
                    count_sum: 2,
                    count_av: 2,
                    ..SectionStats::default()
                },
                percentage: 0.0,
                time_array: vec![1.0],
                flop_array: vec![2.0e9],
                count_array: vec![2],
                sorted_names: vec!["SP_OPS", "DP_OPS"],
                sorted_values: vec![1.0, 2.0],
                sorted_matrix: vec![1.0, 2.0],
                threads: vec![],
                power_joule_av: 0.0,
                headline: 2.0,
                headline_unit: "Gflops",
                kind_value: SectionKind::Computation,
            }],
            order: vec![0],
            forced_stops: vec![],
        }
    }

    #[test]
    fn test_json_shape() {
        let mut out = Vec::new();
        write_json(&mut out, &sample_input()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(doc["format"], "permon-report");
        assert_eq!(doc["report"]["chooser"], "FLOPS");
        assert_eq!(doc["report"]["sections"][0]["label"], "kernel");
        assert_eq!(doc["report"]["sections"][0]["stats"]["count_sum"], 2);
    }

    #[test]
    fn test_json_skips_internal_levels() {
        let mut out = Vec::new();
        write_json(&mut out, &sample_input()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert!(doc["report"].get("report_level").is_none());
    }
}
