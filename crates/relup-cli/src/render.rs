use std::io::IsTerminal;

use anstyle::{AnsiColor, Effects, Style};
use relup_host::JournalEntry;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Badge {
    Ok,
    Warn,
    Err,
    Info,
}

impl Badge {
    fn label(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warn => "WARN",
            Self::Err => "ERR",
            Self::Info => "INFO",
        }
    }

    fn style(self) -> Style {
        let color = match self {
            Self::Ok => AnsiColor::BrightGreen,
            Self::Warn => AnsiColor::BrightYellow,
            Self::Err => AnsiColor::BrightRed,
            Self::Info => AnsiColor::BrightBlue,
        };
        Style::new()
            .fg_color(Some(color.into()))
            .effects(Effects::BOLD)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct TerminalRenderer {
    style: OutputStyle,
}

impl TerminalRenderer {
    pub fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub fn for_stdout() -> Self {
        Self::from_style(detect_style(std::io::stdout().is_terminal()))
    }

    pub fn for_stderr() -> Self {
        Self::from_style(detect_style(std::io::stderr().is_terminal()))
    }

    pub fn style(self) -> OutputStyle {
        self.style
    }

    pub fn print_status(self, badge: Badge, message: &str) {
        println!("{}", render_status_line(self.style, badge, message));
    }

    pub fn eprint_status(self, badge: Badge, message: &str) {
        eprintln!("{}", render_status_line(self.style, badge, message));
    }

    pub fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }
}

/// Plain output when not on a terminal or when `NO_COLOR` is set.
fn detect_style(is_terminal: bool) -> OutputStyle {
    if is_terminal && std::env::var_os("NO_COLOR").is_none() {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn key_style() -> Style {
    Style::new().effects(Effects::BOLD)
}

pub fn render_status_line(style: OutputStyle, badge: Badge, message: &str) -> String {
    let tag = format!("[{}]", badge.label());
    match style {
        OutputStyle::Plain => format!("{tag} {message}"),
        OutputStyle::Rich => format!("{} {message}", colorize(badge.style(), &tag)),
    }
}

pub fn render_field(style: OutputStyle, key: &str, value: &str) -> String {
    let key = format!("{key}:");
    match style {
        OutputStyle::Plain => format!("{key:<10} {value}"),
        OutputStyle::Rich => format!("{} {value}", colorize(key_style(), &format!("{key:<10}"))),
    }
}

pub fn render_journal_entry(entry: &JournalEntry) -> String {
    let event = entry.event.as_str();
    match &entry.detail {
        Some(detail) => format!("  {} {:<7} {event}: {detail}", entry.at_unix, entry.state),
        None => format!("  {} {:<7} {event}", entry.at_unix, entry.state),
    }
}
