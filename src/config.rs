//! Runtime configuration from environment variables
//!
//! Everything is parsed exactly once, inside `Monitor::initialize`, into a
//! plain `RuntimeEnv` value that is handed to each watch by construction.
//! Unrecognized values log a warning and fall back to the documented default.

use tracing::warn;

/// Hardware counter preset selected by `HWPC_CHOOSER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwpcChooser {
    Flops,
    Bandwidth,
    Vector,
    Cache,
    Cycle,
    LoadStore,
    /// No hardware counters; volumes come from the `stop()` arguments.
    User,
}

impl HwpcChooser {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FLOPS" => Some(HwpcChooser::Flops),
            "BANDWIDTH" => Some(HwpcChooser::Bandwidth),
            "VECTOR" => Some(HwpcChooser::Vector),
            "CACHE" => Some(HwpcChooser::Cache),
            "CYCLE" => Some(HwpcChooser::Cycle),
            "LOADSTORE" => Some(HwpcChooser::LoadStore),
            "USER" => Some(HwpcChooser::User),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HwpcChooser::Flops => "FLOPS",
            HwpcChooser::Bandwidth => "BANDWIDTH",
            HwpcChooser::Vector => "VECTOR",
            HwpcChooser::Cache => "CACHE",
            HwpcChooser::Cycle => "CYCLE",
            HwpcChooser::LoadStore => "LOADSTORE",
            HwpcChooser::User => "USER",
        }
    }
}

/// Power reporting level selected by `POWER_CHOOSER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerLevel {
    Off,
    Node,
    Numa,
    Parts,
}

impl PowerLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OFF" | "NO" => Some(PowerLevel::Off),
            "NODE" => Some(PowerLevel::Node),
            "NUMA" => Some(PowerLevel::Numa),
            "PARTS" => Some(PowerLevel::Parts),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerLevel::Off => "OFF",
            PowerLevel::Node => "NODE",
            PowerLevel::Numa => "NUMA",
            PowerLevel::Parts => "PARTS",
        }
    }
}

/// Report verbosity selected by `PMLIB_REPORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportLevel {
    Basic,
    Detail,
    Full,
}

impl ReportLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BASIC" => Some(ReportLevel::Basic),
            "DETAIL" => Some(ReportLevel::Detail),
            "FULL" => Some(ReportLevel::Full),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportLevel::Basic => "BASIC",
            ReportLevel::Detail => "DETAIL",
            ReportLevel::Full => "FULL",
        }
    }
}

/// Trace emission level selected by `OTF_TRACING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Off,
    /// Time stamps only; metric values are written as zero.
    On,
    /// Time stamps plus the headline metric at each stop.
    Full,
}

impl TraceLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OFF" | "NO" | "NONE" => Some(TraceLevel::Off),
            "ON" | "YES" => Some(TraceLevel::On),
            "FULL" => Some(TraceLevel::Full),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TraceLevel::Off => "OFF",
            TraceLevel::On => "ON",
            TraceLevel::Full => "FULL",
        }
    }
}

/// Node topology hints for the per-CMG counter apportionment.
///
/// Packed thread affinity is assumed; scattered affinity is not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    /// Number of processes placed on this node.
    pub procs_per_node: usize,
    /// This process's 0-based rank among the processes on its node.
    pub rank_on_node: usize,
}

impl Default for Topology {
    fn default() -> Self {
        Topology {
            procs_per_node: 1,
            rank_on_node: 0,
        }
    }
}

/// The effective environment, parsed once per process.
#[derive(Debug, Clone)]
pub struct RuntimeEnv {
    /// `BYPASS_PMLIB` set to any value turns every API call into a no-op.
    pub bypass: bool,
    pub hwpc: HwpcChooser,
    pub power: PowerLevel,
    pub report: ReportLevel,
    pub trace: TraceLevel,
    /// Base name for trace output files (`OTF_FILENAME`).
    pub trace_basename: String,
    pub topology: Topology,
}

impl RuntimeEnv {
    pub fn from_env() -> Self {
        let bypass = std::env::var_os("BYPASS_PMLIB").is_some();
        let hwpc = parse_or_default("HWPC_CHOOSER", HwpcChooser::Flops, HwpcChooser::parse);
        let power = parse_or_default("POWER_CHOOSER", PowerLevel::Off, PowerLevel::parse);
        let report = parse_or_default("PMLIB_REPORT", ReportLevel::Basic, ReportLevel::parse);
        let trace = parse_or_default("OTF_TRACING", TraceLevel::Off, TraceLevel::parse);
        let trace_basename =
            std::env::var("OTF_FILENAME").unwrap_or_else(|_| "pmlib_otf_files".to_string());

        RuntimeEnv {
            bypass,
            hwpc,
            power,
            report,
            trace,
            trace_basename,
            topology: topology_from_env(),
        }
    }
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        RuntimeEnv {
            bypass: false,
            hwpc: HwpcChooser::Flops,
            power: PowerLevel::Off,
            report: ReportLevel::Basic,
            trace: TraceLevel::Off,
            trace_basename: "pmlib_otf_files".to_string(),
            topology: Topology::default(),
        }
    }
}

fn parse_or_default<T: Copy>(var: &str, default: T, parse: fn(&str) -> Option<T>) -> T {
    match std::env::var(var) {
        Err(_) => default,
        Ok(raw) => {
            let upper = raw.to_uppercase();
            match parse(&upper) {
                Some(v) => v,
                None => {
                    warn!(variable = var, value = %raw, "unknown value, using the default");
                    default
                }
            }
        }
    }
}

/// Read the topology hints used for shared-counter apportionment.
///
/// `PJM_PROC_BY_NODE` gives the processes per node (1..=48) and
/// `PLE_RANK_ON_NODE` this process's local rank (0..=47); absence or an
/// out-of-range value warns and falls back to a single process per node.
fn topology_from_env() -> Topology {
    let procs_per_node = match std::env::var("PJM_PROC_BY_NODE") {
        Err(_) => 1,
        Ok(raw) => match raw.parse::<usize>() {
            Ok(n) if (1..=48).contains(&n) => n,
            _ => {
                warn!(value = %raw, "PJM_PROC_BY_NODE out of range 1..=48, assuming 1 process per node");
                1
            }
        },
    };
    let rank_on_node = match std::env::var("PLE_RANK_ON_NODE") {
        Err(_) => 0,
        Ok(raw) => match raw.parse::<usize>() {
            Ok(n) if n <= 47 => n,
            _ => {
                warn!(value = %raw, "PLE_RANK_ON_NODE out of range 0..=47, assuming rank 0 on node");
                0
            }
        },
    };
    Topology {
        procs_per_node,
        rank_on_node,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_chooser_parse_round_trip() {
        for s in [
            "FLOPS",
            "BANDWIDTH",
            "VECTOR",
            "CACHE",
            "CYCLE",
            "LOADSTORE",
            "USER",
        ] {
            let c = HwpcChooser::parse(s).unwrap();
            assert_eq!(c.as_str(), s);
        }
        assert_eq!(HwpcChooser::parse("MFLOPS"), None);
    }

    #[test]
    fn test_report_level_ordering() {
        assert!(ReportLevel::Basic < ReportLevel::Detail);
        assert!(ReportLevel::Detail < ReportLevel::Full);
    }

    #[test]
    fn test_power_and_trace_aliases() {
        assert_eq!(PowerLevel::parse("NO"), Some(PowerLevel::Off));
        assert_eq!(TraceLevel::parse("YES"), Some(TraceLevel::On));
        assert_eq!(TraceLevel::parse("NONE"), Some(TraceLevel::Off));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        for var in [
            "BYPASS_PMLIB",
            "HWPC_CHOOSER",
            "POWER_CHOOSER",
            "PMLIB_REPORT",
            "OTF_TRACING",
            "OTF_FILENAME",
            "PJM_PROC_BY_NODE",
            "PLE_RANK_ON_NODE",
        ] {
            std::env::remove_var(var);
        }
        let env = RuntimeEnv::from_env();
        assert!(!env.bypass);
        assert_eq!(env.hwpc, HwpcChooser::Flops);
        assert_eq!(env.power, PowerLevel::Off);
        assert_eq!(env.report, ReportLevel::Basic);
        assert_eq!(env.trace, TraceLevel::Off);
        assert_eq!(env.trace_basename, "pmlib_otf_files");
        assert_eq!(env.topology, Topology::default());
    }

    #[test]
    #[serial]
    fn test_from_env_bad_values_fall_back() {
        std::env::set_var("HWPC_CHOOSER", "TURBO");
        std::env::set_var("PMLIB_REPORT", "EVERYTHING");
        std::env::set_var("PJM_PROC_BY_NODE", "banana");
        let env = RuntimeEnv::from_env();
        assert_eq!(env.hwpc, HwpcChooser::Flops);
        assert_eq!(env.report, ReportLevel::Basic);
        assert_eq!(env.topology.procs_per_node, 1);
        std::env::remove_var("HWPC_CHOOSER");
        std::env::remove_var("PMLIB_REPORT");
        std::env::remove_var("PJM_PROC_BY_NODE");
    }

    #[test]
    #[serial]
    fn test_from_env_lowercase_accepted() {
        std::env::set_var("HWPC_CHOOSER", "bandwidth");
        std::env::set_var("OTF_TRACING", "full");
        let env = RuntimeEnv::from_env();
        assert_eq!(env.hwpc, HwpcChooser::Bandwidth);
        assert_eq!(env.trace, TraceLevel::Full);
        std::env::remove_var("HWPC_CHOOSER");
        std::env::remove_var("OTF_TRACING");
    }

    #[test]
    #[serial]
    fn test_topology_from_env() {
        std::env::set_var("PJM_PROC_BY_NODE", "8");
        std::env::set_var("PLE_RANK_ON_NODE", "5");
        let env = RuntimeEnv::from_env();
        assert_eq!(env.topology.procs_per_node, 8);
        assert_eq!(env.topology.rank_on_node, 5);
        std::env::remove_var("PJM_PROC_BY_NODE");
        std::env::remove_var("PLE_RANK_ON_NODE");
    }
}
