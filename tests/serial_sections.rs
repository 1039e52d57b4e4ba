//! Serial measurement scenarios: single sections, nesting, mis-pairing
//! and report idempotency.

use permon::{HwpcChooser, Monitor, RuntimeEnv, SectionKind};
use std::time::Duration;

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
fn single_section_records_time_count_and_flop() {
    let pm = user_monitor();
    pm.start("A");
    std::thread::sleep(Duration::from_millis(200));
    pm.stop("A", 1.0e9, 1);

    let mut out = Vec::new();
    pm.report(&mut out).unwrap();

    let a = pm.watch("A").unwrap();
    assert_eq!(a.process_count(), 1);
    let time = a.process_time();
    assert!(
        (0.19..0.40).contains(&time),
        "expected roughly 200ms, measured {}s",
        time
    );
    assert_eq!(a.process_volume(), 1.0e9);

    // Headline rate of a user-declared gigaflop over ~0.2s lands in Gflops.
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains('A'));
    assert!(text.contains("Gflops"));
}

#[test]
fn nested_sections_mark_the_outer_inclusive() {
    let pm = user_monitor();
    pm.start("outer");
    pm.start("inner");
    pm.stop("inner", 0.0, 1);
    pm.stop("outer", 0.0, 1);

    assert!(!pm.watch("outer").unwrap().is_exclusive());
    assert!(pm.watch("inner").unwrap().is_exclusive());

    let mut out = Vec::new();
    pm.report(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("outer (*)"));
}

#[test]
fn user_flop_is_the_exact_sum_of_declared_volumes() {
    let pm = user_monitor();
    for i in 1..=5u32 {
        pm.start("V");
        pm.stop("V", 10.0, i);
    }
    // 10*(1+2+3+4+5)
    assert_eq!(pm.watch("V").unwrap().user_volume(), 150.0);
    assert_eq!(pm.watch("V").unwrap().call_count(), 5);
}

#[test]
fn report_without_stop_warns_and_force_stops() {
    let pm = user_monitor();
    pm.start("X");
    let mut out = Vec::new();
    pm.report(&mut out).unwrap();

    let x = pm.watch("X").unwrap();
    assert!(!x.any_running());
    assert!(!x.is_healthy());
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("force-stopped"));
    assert!(text.contains('X'));
}

#[test]
fn accumulated_time_is_monotone_over_stops() {
    let pm = user_monitor();
    let mut last = 0.0;
    for _ in 0..4 {
        pm.start("T");
        pm.stop("T", 0.0, 1);
        let t = pm.watch("T").unwrap().accumulated_time();
        assert!(t >= last);
        last = t;
    }
}

#[test]
fn report_twice_is_idempotent() {
    let pm = user_monitor();
    pm.start("A");
    std::thread::sleep(Duration::from_millis(5));
    pm.stop("A", 42.0, 1);

    let mut first = Vec::new();
    pm.report(&mut first).unwrap();
    let a = pm.watch("A").unwrap();
    let snapshot = (a.process_count(), a.process_time(), a.process_volume());
    let root_running = pm.watch("Root Section").unwrap().any_running();
    assert!(!root_running);

    let mut second = Vec::new();
    pm.report(&mut second).unwrap();
    assert_eq!(
        snapshot,
        (a.process_count(), a.process_time(), a.process_volume())
    );
    assert!(!pm.watch("Root Section").unwrap().any_running());
}

#[test]
fn registry_sizes_agree_after_report() {
    let pm = user_monitor();
    pm.start("one");
    pm.stop("one", 0.0, 1);
    pm.start("two");
    pm.stop("two", 0.0, 1);
    let mut out = Vec::new();
    pm.report(&mut out).unwrap();
    // Shared enumeration and master-local registry agree.
    assert_eq!(pm.section_count(), 3);
    assert!(pm.shared_id("one").is_some());
    assert!(pm.shared_id("two").is_some());
}

#[test]
fn set_properties_predeclares_kind() {
    let pm = user_monitor();
    pm.set_properties("exchange", SectionKind::Communication, true);
    pm.start("exchange");
    pm.stop("exchange", 4096.0, 1);
    let w = pm.watch("exchange").unwrap();
    assert_eq!(w.kind(), SectionKind::Communication);
    let mut out = Vec::new();
    pm.report(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    // Communication volume is reported in byte units.
    assert!(text.contains("B/sec"));
}

#[test]
fn json_report_exports_sections() {
    let pm = user_monitor();
    pm.start("A");
    pm.stop("A", 1.0e6, 1);
    let mut out = Vec::new();
    pm.report_json(&mut out).unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(doc["format"], "permon-report");
    let sections = doc["report"]["sections"].as_array().unwrap();
    assert!(sections.iter().any(|s| s["label"] == "A"));
}
