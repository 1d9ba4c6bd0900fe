use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::command::{CommandError, CommandRunner, CommandSpec};
use crate::fs_utils::{remove_file_if_exists, write_atomic};

const UNIT_FILE_MODE: u32 = 0o644;

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("failed to write boot hook unit {}", path.display())]
    WriteUnit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove boot hook unit {}", path.display())]
    RemoveUnit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// One-shot systemd unit that re-invokes the orchestrator after a reboot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootHook {
    pub description: String,
    /// Program followed by its arguments.
    pub exec_start: Vec<String>,
    pub working_directory: PathBuf,
    pub start_timeout: Duration,
}

impl BootHook {
    pub fn render_unit(&self) -> String {
        format!(
            "[Unit]\n\
             Description={}\n\
             After=network-online.target\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             Type=oneshot\n\
             ExecStart={}\n\
             RemainAfterExit=yes\n\
             TimeoutStartSec={}\n\
             WorkingDirectory={}\n\
             Restart=no\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            self.description,
            render_exec_start(&self.exec_start),
            self.start_timeout.as_secs(),
            self.working_directory.display(),
        )
    }
}

/// Joins argv into an `ExecStart=` value, quoting words systemd would split
/// and escaping its specifier and variable characters.
pub fn render_exec_start(argv: &[String]) -> String {
    argv.iter()
        .map(|word| quote_exec_word(word))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_exec_word(word: &str) -> String {
    let needs_quotes = word.is_empty()
        || word
            .chars()
            .any(|ch| ch.is_whitespace() || matches!(ch, '"' | '\'' | '\\' | ';'));
    let mut rendered = String::with_capacity(word.len() + 2);
    if needs_quotes {
        rendered.push('"');
    }
    for ch in word.chars() {
        match ch {
            '%' => rendered.push_str("%%"),
            '$' => rendered.push_str("$$"),
            '"' | '\\' => {
                rendered.push('\\');
                rendered.push(ch);
            }
            _ => rendered.push(ch),
        }
    }
    if needs_quotes {
        rendered.push('"');
    }
    rendered
}

pub trait BootScheduler {
    fn arm(&self, command: &[String]) -> Result<(), SchedulingError>;
    fn disarm(&self) -> Result<(), SchedulingError>;
    fn is_armed(&self) -> bool;
}

pub struct SystemdBootScheduler {
    unit_path: PathBuf,
    unit_name: String,
    working_directory: PathBuf,
    start_timeout: Duration,
    command_timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl SystemdBootScheduler {
    pub fn new(
        unit_path: impl Into<PathBuf>,
        working_directory: impl Into<PathBuf>,
        start_timeout: Duration,
        command_timeout: Duration,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let unit_path = unit_path.into();
        let unit_name = unit_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            unit_path,
            unit_name,
            working_directory: working_directory.into(),
            start_timeout,
            command_timeout,
            runner,
        }
    }

    pub fn unit_path(&self) -> &Path {
        &self.unit_path
    }

    fn systemctl<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> CommandSpec {
        CommandSpec::new("systemctl")
            .args(args)
            .timeout(self.command_timeout)
    }
}

impl BootScheduler for SystemdBootScheduler {
    fn arm(&self, command: &[String]) -> Result<(), SchedulingError> {
        let hook = BootHook {
            description: "Resume relup release upgrade pipeline".to_string(),
            exec_start: command.to_vec(),
            working_directory: self.working_directory.clone(),
            start_timeout: self.start_timeout,
        };

        write_atomic(&self.unit_path, hook.render_unit().as_bytes(), UNIT_FILE_MODE).map_err(
            |source| SchedulingError::WriteUnit {
                path: self.unit_path.clone(),
                source,
            },
        )?;
        self.runner.run(&self.systemctl(["daemon-reload"]))?;
        self.runner
            .run(&self.systemctl(["enable", self.unit_name.as_str()]))?;

        info!(
            target: "relup::boot",
            unit = %self.unit_path.display(),
            command = %command.join(" "),
            "armed boot hook"
        );
        Ok(())
    }

    fn disarm(&self) -> Result<(), SchedulingError> {
        if self.unit_path.exists() {
            let output = self
                .runner
                .output(&self.systemctl(["disable", self.unit_name.as_str()]))?;
            if !output.success() {
                warn!(
                    target: "relup::boot",
                    unit = %self.unit_name,
                    tail = %output.tail(),
                    "systemctl disable reported failure; removing unit file anyway"
                );
            }
        }

        let removed =
            remove_file_if_exists(&self.unit_path).map_err(|source| SchedulingError::RemoveUnit {
                path: self.unit_path.clone(),
                source,
            })?;
        self.runner.run(&self.systemctl(["daemon-reload"]))?;

        if removed {
            info!(target: "relup::boot", unit = %self.unit_path.display(), "disarmed boot hook");
        }
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.unit_path.is_file()
    }
}
