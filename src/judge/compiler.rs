//! Command-driven compilation into a run-scoped workspace.

use crate::config::types::SandboxConfig;
use crate::core::controller::{LaunchRequest, SandboxedProcess};
use crate::judge::workspace::Workspace;
use crate::judge::{Executor, JudgeError};
use crate::kernel::fd::cloexec_pipe;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// How a compiled artifact is started
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Launcher {
    /// Run the artifact itself
    Direct,
    /// `runtime <artifact>`, e.g. a managed runtime
    Runtime(PathBuf),
    /// `harness <workdir> <artifact>`; the harness reports uncaught
    /// exceptions with the feedback sentinel
    Harness(PathBuf),
}

/// Compiler invocation for one language
#[derive(Clone, Debug)]
pub struct CompilerSpec {
    pub program: PathBuf,
    /// Arguments; `{source}` and `{output}` are substituted
    pub args: Vec<String>,
    /// Source file extension without the dot
    pub extension: String,
    /// Appended to the problem id to name the artifact
    pub artifact_suffix: String,
    pub launcher: Launcher,
}

impl CompilerSpec {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I, extension: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            extension: extension.to_string(),
            artifact_suffix: String::new(),
            launcher: Launcher::Direct,
        }
    }

    pub fn c() -> Self {
        Self::new("gcc", ["-O2", "-std=c11", "-o", "{output}", "{source}", "-lm"], "c")
    }

    pub fn cpp() -> Self {
        Self::new("g++", ["-O2", "-std=c++17", "-o", "{output}", "{source}"], "cpp")
    }

    pub fn csharp() -> Self {
        Self::new("mcs", ["-nologo", "-optimize+", "-out:{output}", "{source}"], "cs")
            .with_artifact_suffix(".exe")
            .with_launcher(Launcher::Runtime(PathBuf::from("mono")))
    }

    pub fn with_artifact_suffix(mut self, suffix: &str) -> Self {
        self.artifact_suffix = suffix.to_string();
        self
    }

    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_harness(self, harness: impl Into<PathBuf>) -> Self {
        self.with_launcher(Launcher::Harness(harness.into()))
    }

    fn render_args(&self, source: &Path, output: &Path) -> Vec<String> {
        let source = source.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{source}", &source).replace("{output}", &output))
            .collect()
    }
}

/// Run the compiler with stderr merged into stdout; returns (success, output).
fn run_compiler(spec: &CompilerSpec, args: &[String], workdir: &Path) -> Result<(bool, String), JudgeError> {
    let (reader, writer) = cloexec_pipe()?;
    let writer_err = writer.try_clone()?;
    let mut command = Command::new(&spec.program);
    command
        .args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(writer))
        .stderr(Stdio::from(writer_err));
    let mut child = command.spawn().map_err(|e| {
        JudgeError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to start compiler {}: {}", spec.program.display(), e),
        ))
    })?;
    // The command still owns our copies of the write end.
    drop(command);

    let mut output = Vec::new();
    File::from(reader).read_to_end(&mut output)?;
    let status = child.wait()?;
    Ok((status.success(), String::from_utf8_lossy(&output).into_owned()))
}

/// A compiled submission ready to be launched
pub struct CompiledExecutor {
    workspace: Workspace,
    artifact: PathBuf,
    launcher: Launcher,
    warning: Option<String>,
}

impl CompiledExecutor {
    /// Compile `source` for `problem_id` in a fresh temp workspace.
    pub fn compile(spec: &CompilerSpec, problem_id: &str, source: &[u8]) -> Result<Self, JudgeError> {
        Self::compile_in(Workspace::in_temp_dir()?, spec, problem_id, source)
    }

    pub fn compile_in(
        workspace: Workspace,
        spec: &CompilerSpec,
        problem_id: &str,
        source: &[u8],
    ) -> Result<Self, JudgeError> {
        let source_path =
            workspace.write_file(&format!("{}.{}", problem_id, spec.extension), source)?;
        let artifact = workspace.file(&format!("{}{}", problem_id, spec.artifact_suffix));
        let args = spec.render_args(&source_path, &artifact);

        log::info!(
            "Compiling {} with {} in {}",
            source_path.display(),
            spec.program.display(),
            workspace.dir().display()
        );
        let (success, output) = run_compiler(spec, &args, workspace.dir())?;
        if !success {
            log::debug!("Compilation of {} failed", problem_id);
            return Err(JudgeError::Compile { output });
        }
        let warning = if output.trim().is_empty() {
            None
        } else {
            Some(output)
        };
        Ok(Self {
            workspace,
            artifact,
            launcher: spec.launcher.clone(),
            warning,
        })
    }

    /// Non-empty compiler output of a successful compilation.
    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn workdir(&self) -> &Path {
        self.workspace.dir()
    }

    /// Program and leading arguments used to start the artifact.
    fn command_line(&self) -> (PathBuf, Vec<String>) {
        let artifact = self.artifact.to_string_lossy().into_owned();
        match &self.launcher {
            Launcher::Direct => (self.artifact.clone(), Vec::new()),
            Launcher::Runtime(runtime) => (runtime.clone(), vec![artifact]),
            Launcher::Harness(harness) => (
                harness.clone(),
                vec![self.workdir().to_string_lossy().into_owned(), artifact],
            ),
        }
    }
}

impl Executor for CompiledExecutor {
    fn launch(
        &self,
        time_limit: f64,
        memory_limit: u64,
        config: &SandboxConfig,
    ) -> Result<SandboxedProcess, JudgeError> {
        let (program, args) = self.command_line();
        let request = LaunchRequest::new(program, self.workdir(), time_limit, memory_limit).args(args);
        Ok(SandboxedProcess::launch(&request, config)?)
    }

    fn launch_unsafe(&self, args: &[String]) -> Result<Child, JudgeError> {
        let (program, mut leading) = self.command_line();
        leading.extend(args.iter().cloned());
        let child = Command::new(program)
            .args(leading)
            .current_dir(self.workdir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(child)
    }
}
