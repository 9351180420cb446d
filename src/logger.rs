//! Structured event logging
//!
//! Engine lifecycle events are emitted as single-line JSON with
//! deterministic key ordering: `event` first, then `severity`, then the
//! remaining fields alphabetically. Logging is synchronous and unbuffered;
//! one line is one event.

use std::fmt;
use std::io::{self, Write};

/// Event severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Trace,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Emit one event line to stdout.
pub fn emit(severity: Severity, event: &str, fields: &[(&str, String)]) {
    let line = render(severity, event, fields);
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let _ = handle.write_all(line.as_bytes());
    let _ = handle.flush();
}

fn render(severity: Severity, event: &str, fields: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(128);
    out.push_str("{\"event\":\"");
    escape_into(&mut out, event);
    out.push_str("\",\"severity\":\"");
    out.push_str(severity.as_str());
    out.push('"');

    let mut sorted: Vec<&(&str, String)> = fields.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    for (key, value) in sorted {
        out.push_str(",\"");
        escape_into(&mut out, key);
        out.push_str("\":\"");
        escape_into(&mut out, value);
        out.push('"');
    }
    out.push_str("}\n");
    out
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_and_severity_lead() {
        let line = render(Severity::Info, "log_open", &[]);
        assert!(line.starts_with("{\"event\":\"log_open\",\"severity\":\"INFO\""));
        assert!(line.ends_with("}\n"));
    }

    #[test]
    fn test_fields_sorted_alphabetically() {
        let line = render(
            Severity::Warn,
            "test",
            &[("zebra", "1".to_string()), ("alpha", "2".to_string())],
        );
        let alpha = line.find("alpha").unwrap();
        let zebra = line.find("zebra").unwrap();
        assert!(alpha < zebra);
    }

    #[test]
    fn test_escaping() {
        let line = render(
            Severity::Error,
            "bad",
            &[("msg", "a \"quoted\"\nline".to_string())],
        );
        assert!(line.contains("\\\"quoted\\\""));
        assert!(line.contains("\\n"));
    }
}
