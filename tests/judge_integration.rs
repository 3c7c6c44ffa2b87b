//! Compile-and-run through the judge layer, using `/bin/sh` as the
//! "compiler" so no toolchain is required.

use limitbox::judge::{CompiledExecutor, CompilerSpec, Executor, JudgeError, Workspace};
use limitbox::{ExecutionStatus, SandboxConfig};
use std::io::Write;

const INSTALL: &str = "cp {source} {output} && chmod +x {output}";

fn script_spec(prefix: &str) -> CompilerSpec {
    CompilerSpec::new("/bin/sh", ["-c".to_string(), format!("{}{}", prefix, INSTALL)], "sh")
}

#[test]
fn compiled_artifact_runs_in_sandbox() {
    let base = tempfile::tempdir().unwrap();
    let executor = CompiledExecutor::compile_in(
        Workspace::new(base.path()).unwrap(),
        &script_spec(""),
        "aplusb",
        b"#!/bin/sh\nread a b\necho $((a + b))\n",
    )
    .unwrap();
    assert!(executor.warning().is_none());
    assert!(executor.artifact().starts_with(base.path()));

    let mut process = executor.launch(5.0, 262_144, &SandboxConfig::unprivileged()).unwrap();
    let (stdout, _) = process.communicate(Some(b"2 3\n")).unwrap();
    assert_eq!(stdout, b"5\n");
    assert_eq!(process.report().status, ExecutionStatus::Ok);
}

#[test]
fn compiler_failure_carries_output() {
    let spec = CompilerSpec::new("/bin/sh", ["-c", "echo 'main.sh:1: error: nope' >&2; exit 1"], "sh");
    let err = CompiledExecutor::compile(&spec, "broken", b"").err().unwrap();
    match err {
        JudgeError::Compile { output } => assert!(output.contains("error: nope")),
        other => panic!("expected compile error, got {}", other),
    }
}

#[test]
fn warnings_are_kept_on_success() {
    let executor = CompiledExecutor::compile(
        &script_spec("echo 'warning: unused variable' >&2; "),
        "warned",
        b"#!/bin/sh\nexit 0\n",
    )
    .unwrap();
    assert!(executor.warning().unwrap().contains("unused variable"));
}

#[test]
fn workspace_is_removed_with_executor() {
    let executor =
        CompiledExecutor::compile(&script_spec(""), "cleanup", b"#!/bin/sh\n").unwrap();
    let dir = executor.workdir().to_path_buf();
    assert!(dir.is_dir());
    drop(executor);
    assert!(!dir.exists());
}

#[test]
fn unsafe_launch_passes_arguments() {
    let executor = CompiledExecutor::compile(
        &script_spec(""),
        "checker",
        b"#!/bin/sh\nread line\necho \"$1:$line\"\n",
    )
    .unwrap();
    let mut child = executor.launch_unsafe(&["tag".to_string()]).unwrap();
    child.stdin.take().unwrap().write_all(b"value\n").unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert_eq!(output.stdout, b"tag:value\n");
}
