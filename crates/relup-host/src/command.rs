use std::fmt;
use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, warn};

/// Number of output lines kept for diagnostics when a command fails.
pub const DIAGNOSTIC_TAIL_LINES: usize = 20;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
        }
    }

    /// Builds a spec from an argv-style list; `None` when the list is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Non-interactive apt/dpkg environment.
    pub fn noninteractive(self) -> Self {
        self.env("DEBIAN_FRONTEND", "noninteractive")
            .env("NEEDRESTART_MODE", "a")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn tail(&self) -> String {
        output_tail(&self.stdout, &self.stderr, DIAGNOSTIC_TAIL_LINES)
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{command}: command failed to start")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command}: timed out after {}s", after.as_secs())]
    TimedOut {
        command: String,
        after: Duration,
        tail: String,
    },
    #[error("{command}: exited with status {}", code.map_or_else(|| "signal".to_string(), |code| code.to_string()))]
    Failed {
        command: String,
        code: Option<i32>,
        tail: String,
    },
}

impl CommandError {
    pub fn tail(&self) -> &str {
        match self {
            Self::Spawn { .. } => "",
            Self::TimedOut { tail, .. } | Self::Failed { tail, .. } => tail,
        }
    }
}

/// Seam through which every external program is invoked.
pub trait CommandRunner: Send + Sync {
    /// Runs `spec` to completion; a non-zero exit is still `Ok`.
    fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;

    /// Runs `spec` and requires a zero exit status.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let output = self.output(spec)?;
        if output.success() {
            return Ok(output);
        }
        Err(CommandError::Failed {
            command: spec.to_string(),
            code: output.code,
            tail: output.tail(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!(target: "relup::command", command = %spec, "running external command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            command: spec.to_string(),
            source,
        })?;

        let stdout_reader = spawn_pipe_reader(child.stdout.take());
        let stderr_reader = spawn_pipe_reader(child.stderr.take());

        let waited = wait_with_deadline(&mut child, spec.timeout);
        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        match waited {
            Ok(Some(status)) => Ok(CommandOutput {
                code: status.code(),
                stdout,
                stderr,
            }),
            Ok(None) => Err(CommandError::TimedOut {
                command: spec.to_string(),
                after: spec.timeout.unwrap_or_default(),
                tail: output_tail(&stdout, &stderr, DIAGNOSTIC_TAIL_LINES),
            }),
            Err(source) => Err(CommandError::Spawn {
                command: spec.to_string(),
                source,
            }),
        }
    }
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> thread::JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

/// `Ok(None)` means the deadline passed and the child was killed.
fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
) -> io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };

    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if started.elapsed() >= timeout {
            kill_process_group(child);
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(WAIT_POLL_INTERVAL.min(timeout));
    }
}

/// Kills the whole group so grandchildren holding the output pipes exit too.
fn kill_process_group(child: &mut Child) {
    let group = i32::try_from(child.id()).map(Pid::from_raw);
    match group.map(|pgid| killpg(pgid, Signal::SIGKILL)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(target: "relup::command", error = %err, "failed to kill process group");
            let _ = child.kill();
        }
        Err(_) => {
            let _ = child.kill();
        }
    }
}

/// Last `lines` non-empty lines of stdout followed by stderr.
pub fn output_tail(stdout: &str, stderr: &str, lines: usize) -> String {
    let collected = stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    let start = collected.len().saturating_sub(lines);
    collected[start..].join("\n")
}
