use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::analyzer::CallSite;

/// Severity of a captured console line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
    /// An uncaught exception ended the run
    Thrown,
}

impl LogLevel {
    /// Level for a `console` method name
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "log" => Some(LogLevel::Log),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Log => "Log",
            LogLevel::Info => "Info",
            LogLevel::Warn => "Warn",
            LogLevel::Error => "Error",
            LogLevel::Thrown => "Thrown",
        }
    }
}

/// One line of script output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub text: String,
    /// Type name of the thrown value (`TypeError`, ...), only for [`LogLevel::Thrown`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl LogEntry {
    pub fn new(level: LogLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
            error_name: None,
            line: None,
            column: None,
        }
    }

    pub fn thrown(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_name: Some(name.into()),
            ..Self::new(LogLevel::Thrown, message)
        }
    }

    pub fn with_location(mut self, location: Option<(u32, Option<u32>)>) -> Self {
        if let Some((line, column)) = location {
            self.line = Some(line);
            self.column = column;
        }
        self
    }

    /// Rendering with a ` (Line: L, Column: C)` suffix when the location is known
    pub fn display_with_location(&self) -> String {
        match (self.line, self.column) {
            (Some(line), Some(column)) => format!("{} (Line: {}, Column: {})", self, line, column),
            (Some(line), None) => format!("{} (Line: {})", self, line),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.level, &self.error_name) {
            (LogLevel::Thrown, Some(name)) => write!(f, "{}: {}", name, self.text),
            (level, _) => write!(f, "{}: {}", level.as_str(), self.text),
        }
    }
}

/// Append-only log of a single run, capped at `max_entries`.
///
/// The first dropped entry is replaced by one `Warn` line; the final
/// `Thrown` entry is always kept.
#[derive(Debug, Default)]
pub struct LogCollector {
    entries: Vec<LogEntry>,
    max_entries: usize,
    truncated: bool,
}

impl LogCollector {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
            truncated: false,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if entry.level == LogLevel::Thrown || self.entries.len() < self.max_entries {
            self.entries.push(entry);
        } else if !self.truncated {
            self.truncated = true;
            self.entries.push(LogEntry::new(
                LogLevel::Warn,
                format!(
                    "Log limit of {} entries reached; further output was dropped",
                    self.max_entries
                ),
            ));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}

fn frame_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*at\s+(?:(?P<func>.*?)\s+\()?(?P<file>[^()\s]+?):(?P<line>\d+)(?::(?P<column>\d+))?\)?\s*$")
            .expect("Valid regex pattern for stack frames")
    })
}

/// Prefix shared by every function the sandbox installs itself
pub(crate) const SANDBOX_FRAME_PREFIX: &str = "$sandbox$";

/// First stack frame that belongs to the script.
///
/// Native frames and the sandbox's own helpers are skipped, so a
/// `console.log` call reports the line that called it.
pub fn script_location(stack: &str) -> Option<(u32, Option<u32>)> {
    stack.lines().find_map(|frame| {
        let caps = frame_pattern().captures(frame)?;
        if caps
            .name("func")
            .is_some_and(|func| func.as_str().starts_with(SANDBOX_FRAME_PREFIX))
        {
            return None;
        }
        let line = caps.name("line")?.as_str().parse().ok()?;
        let column = caps
            .name("column")
            .and_then(|column| column.as_str().parse().ok());
        Some((line, column))
    })
}

/// Move an engine-reported location to the start of the `console` call it
/// falls in.
///
/// The innermost enclosing call wins; otherwise the last call on the same
/// line starting at or before the position, then the first call on that line.
pub fn anchor_to_call(location: (u32, Option<u32>), sites: &[CallSite]) -> (u32, Option<u32>) {
    let (line, column) = location;
    let point = (line, column.unwrap_or(1));
    let enclosing = sites
        .iter()
        .filter(|site| site.start <= point && point <= site.end)
        .max_by_key(|site| site.start);
    let anchor = enclosing.or_else(|| {
        let same_line: Vec<&CallSite> = sites.iter().filter(|site| site.start.0 == line).collect();
        same_line
            .iter()
            .rev()
            .find(|site| site.start <= point)
            .or(same_line.first())
            .copied()
    });
    match anchor {
        Some(site) => (site.start.0, Some(site.start.1)),
        None => location,
    }
}
