use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::Duration;

use relup_host::{CommandRunner, CommandSpec};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub const SYSTEM_LOG_TAG: &str = "relup";

const LOGGER_TIMEOUT: Duration = Duration::from_secs(10);

/// Destination for ERROR events that must reach the host's system log.
pub trait SystemLogSink: Send + Sync {
    fn error(&self, line: &str);
}

/// Hands each line to `logger(1)` at `user.err`, which lands in journald.
pub struct LoggerSink {
    runner: Arc<dyn CommandRunner>,
}

impl LoggerSink {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn command_for(line: &str) -> CommandSpec {
        CommandSpec::new("logger")
            .args(["-p", "user.err", "-t", SYSTEM_LOG_TAG, "--", line])
            .timeout(LOGGER_TIMEOUT)
    }
}

impl SystemLogSink for LoggerSink {
    fn error(&self, line: &str) {
        // failures here cannot be logged without re-entering this layer
        let _ = self.runner.run(&Self::command_for(line));
    }
}

/// Forwards ERROR events to a [`SystemLogSink`] regardless of `RUST_LOG`.
pub struct ErrorMirrorLayer {
    sink: Arc<dyn SystemLogSink>,
}

impl ErrorMirrorLayer {
    pub fn new(sink: Arc<dyn SystemLogSink>) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for ErrorMirrorLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() != Level::ERROR {
            return;
        }
        let mut line = LineVisitor::default();
        event.record(&mut line);
        self.sink.error(&line.render(metadata.target()));
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn render(self, target: &str) -> String {
        format!("{target}: {}{}", self.message, self.fields)
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}
