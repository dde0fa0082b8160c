use crate::types::{MinsarError, MinsarResult};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// External program invocation (scheduler tools, download scripts, tar, ...)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// File connected to the program's stdin (`bsub < job`)
    pub stdin_file: Option<PathBuf>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin_file: None,
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin_from(mut self, path: impl AsRef<Path>) -> Self {
        self.stdin_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Shell-quoted rendering, used for run files and logging
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_quote(&self.program)];
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        let mut line = parts.join(" ");
        if let Some(stdin) = &self.stdin_file {
            line.push_str(" < ");
            line.push_str(&shell_quote(&stdin.to_string_lossy()));
        }
        line
    }
}

fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit into an error carrying stderr
    pub fn check(self, what: &str) -> MinsarResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(MinsarError::Scheduler(format!(
                "{} exited with status {}: {}",
                what,
                self.status,
                self.stderr.trim()
            )))
        }
    }
}

/// Seam for every external process the pipeline starts
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &CommandSpec) -> MinsarResult<CommandOutput>;

    /// Commands are only logged; callers must not change the file system either
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Runs commands with `std::process::Command`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> MinsarResult<CommandOutput> {
        log::debug!("Running: {}", spec.to_shell_string());

        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }
        match &spec.stdin_file {
            Some(path) => {
                command.stdin(Stdio::from(File::open(path)?));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }

        let output = command.output().map_err(|e| {
            MinsarError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to start {}: {}", spec.program, e),
            ))
        })?;

        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success() {
            log::warn!("{} exited with status {}", spec.program, result.status);
        }
        Ok(result)
    }
}

/// Logs commands instead of running them
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunner;

impl CommandRunner for DryRunner {
    fn run(&self, spec: &CommandSpec) -> MinsarResult<CommandOutput> {
        log::info!("[dry-run] {}", spec.to_shell_string());
        Ok(CommandOutput::default())
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}
