//! End-to-end runs through `SandboxedProcess`.
//!
//! Everything except the last test uses the rlimit backend so the suite
//! runs without root.

use limitbox::config::types::{EXCEPTION_SENTINEL, FORCED_EXIT_CODE};
use limitbox::{
    ExecutionStatus, LaunchRequest, OutputIntegrity, SandboxConfig, SandboxError, SandboxedProcess,
};
use nix::sys::signal::kill;
use std::time::{Duration, Instant};

fn sh(script: &str, time_limit: f64, memory_limit: u64) -> LaunchRequest {
    LaunchRequest::new("/bin/sh", "/", time_limit, memory_limit).args(["-c", script])
}

fn launch(request: &LaunchRequest) -> SandboxedProcess {
    SandboxedProcess::launch(request, &SandboxConfig::unprivileged()).unwrap()
}

#[test]
fn sleeping_child_hits_wall_limit() {
    let request = LaunchRequest::new("/bin/sleep", "/", 2.0, 262_144).arg("5");
    let mut process = launch(&request);
    let started = Instant::now();
    process.communicate(None).unwrap();
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(process.tle());
    assert!(!process.mle());
    assert_eq!(process.returncode(), Some(FORCED_EXIT_CODE));
    let report = process.report();
    assert_eq!(report.status, ExecutionStatus::TimeLimit);
    assert!(report.forced);
}

#[test]
fn busy_loop_hits_cpu_limit() {
    let mut process = launch(&sh("while :; do :; done", 1.0, 262_144));
    let started = Instant::now();
    process.communicate(None).unwrap();
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(process.tle());
    assert_eq!(process.report().status, ExecutionStatus::TimeLimit);
}

#[test]
fn growing_string_hits_memory_limit() {
    let mut process = launch(&sh("s=x; while :; do s=\"$s$s\"; done", 10.0, 16_384));
    let started = Instant::now();
    process.communicate(None).unwrap();
    assert!(started.elapsed() < Duration::from_secs(8));
    assert!(process.mle());
    assert!(!process.tle());
    assert!(process.max_memory().unwrap() > 16_384);
    assert_eq!(process.report().status, ExecutionStatus::MemoryLimit);
}

#[test]
fn input_reaches_child() {
    let request = LaunchRequest::new("/bin/cat", "/", 5.0, 262_144);
    let mut process = launch(&request);
    let (stdout, stderr) = process.communicate(Some(b"hello\nworld\n")).unwrap();
    assert_eq!(stdout, b"hello\nworld\n");
    assert!(stderr.is_empty());
    assert_eq!(process.returncode(), Some(0));
}

#[test]
fn bare_program_name_is_resolved() {
    let request = LaunchRequest::new("echo", "/", 5.0, 262_144).arg("found");
    let mut process = launch(&request);
    let (stdout, _) = process.communicate(None).unwrap();
    assert_eq!(stdout, b"found\n");
}

#[test]
fn bounded_capture_truncates_but_drains() {
    let mut process = launch(&sh("yes | head -c 100000; echo done >&2", 5.0, 262_144));
    let (stdout, stderr) = process
        .safe_communicate(None, 1000, usize::MAX)
        .unwrap();
    assert_eq!(stdout.len(), 1000);
    assert_eq!(stderr, b"done\n");
    let report = process.report();
    assert_eq!(report.stdout_integrity, OutputIntegrity::TruncatedByJudgeLimit);
    assert_eq!(report.stderr_integrity, OutputIntegrity::Complete);
    assert_eq!(report.status, ExecutionStatus::Ok);
}

#[test]
fn reported_exception_becomes_feedback() {
    let script = format!(
        "printf '%s\\nValueError: invalid literal\\n' '{}' >&2; exit 1",
        EXCEPTION_SENTINEL
    );
    let mut process = launch(&sh(&script, 5.0, 262_144));
    process.communicate(None).unwrap();
    assert_eq!(process.feedback(), Some("ValueError"));
    assert_eq!(process.returncode(), Some(1));
    assert_eq!(process.report().status, ExecutionStatus::RuntimeError);
}

#[test]
fn nonzero_exit_is_runtime_error() {
    let mut process = launch(&sh("exit 3", 5.0, 262_144));
    assert_eq!(process.wait().unwrap(), 3);
    assert_eq!(process.feedback(), None);
    let report = process.report();
    assert_eq!(report.status, ExecutionStatus::RuntimeError);
    assert!(!report.forced);
}

#[test]
fn wait_enforces_time_limit() {
    let request = LaunchRequest::new("/bin/sleep", "/", 1.0, 262_144).arg("10");
    let mut process = launch(&request);
    let started = Instant::now();
    assert_eq!(process.wait().unwrap(), FORCED_EXIT_CODE);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(process.tle());
}

#[test]
fn missing_executable_is_setup_failure() {
    let request = LaunchRequest::new("/nonexistent/limitbox-program", "/", 1.0, 65_536);
    let err = SandboxedProcess::launch(&request, &SandboxConfig::unprivileged()).unwrap_err();
    assert!(err.is_setup_failure(), "unexpected error: {}", err);
}

#[test]
fn missing_workdir_is_setup_failure() {
    let request = LaunchRequest::new("/bin/true", "/nonexistent/limitbox-dir", 1.0, 65_536);
    let err = SandboxedProcess::launch(&request, &SandboxConfig::unprivileged()).unwrap_err();
    assert!(matches!(err, SandboxError::Setup(_)));
}

#[test]
fn dropping_running_process_kills_it() {
    let request = LaunchRequest::new("/bin/sleep", "/", 60.0, 262_144).arg("30");
    let process = launch(&request);
    let pid = process.pid();
    assert!(kill(pid, None).is_ok());
    drop(process);
    assert!(kill(pid, None).is_err());
}

#[test]
fn report_serializes_verdict() {
    let mut process = launch(&sh("echo out", 5.0, 262_144));
    process.communicate(None).unwrap();
    let json = process.report().to_json().unwrap();
    assert!(json.contains("\"status\": \"OK\""));
    assert!(json.contains("\"backend\": \"rlimit\""));
    assert!(json.contains("\"stdout\": \"out\\n\""));
}

#[test]
fn background_survivor_is_bounded_by_wall_limit() {
    let mut process = launch(&sh("sleep 30 & echo hi", 1.0, 262_144));
    let started = Instant::now();
    let (stdout, _) = process.communicate(None).unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(stdout, b"hi\n");
    assert!(process.tle());
    assert_eq!(process.report().status, ExecutionStatus::TimeLimit);
}

#[test]
fn survivors_are_killed_when_leader_is_reaped() {
    let mut process = launch(&sh("sleep 30 & exit 0", 5.0, 262_144));
    assert_eq!(process.wait().unwrap(), 0);
    let started = Instant::now();
    process.communicate(None).unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!process.tle());
    assert_eq!(process.report().status, ExecutionStatus::Ok);
}

#[test]
fn cgroup_backend_runs_or_refuses_cleanly() {
    let request = sh("echo cgroup", 5.0, 262_144);
    match SandboxedProcess::launch(&request, &SandboxConfig::default()) {
        Ok(mut process) => {
            let (stdout, _) = process.communicate(None).unwrap();
            assert_eq!(stdout, b"cgroup\n");
            assert_eq!(process.report().status, ExecutionStatus::Ok);
        }
        Err(e) => {
            assert!(e.is_setup_failure(), "unexpected error: {}", e);
            eprintln!("cgroup v2 unavailable, skipping: {}", e);
        }
    }
}
