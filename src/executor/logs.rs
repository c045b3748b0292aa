//! Container log capture and filtering.
//!
//! Containers write lines of the form `{timestamp} {json payload}` where the
//! payload carries `log`, `level`, `source`, `internal` and `task`. Only
//! structured, non-internal lines are shown to the job's submitter. Everything
//! else is kept for operators in the raw log.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Returned by [`user_error`] when the log holds nothing to report.
pub const NO_ERRORS_REPORTED: &str = "No errors were reported in the logs.";

pub const DEFAULT_RETENTION_LINES: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    #[default]
    Stdout,
    Stderr,
}

/// One structured log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
    pub level: Option<String>,
    pub source: LogSource,
    pub internal: bool,
    pub task: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Payload {
    log: String,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    source: Option<LogSource>,
    #[serde(default)]
    internal: bool,
    #[serde(default)]
    task: Option<String>,
}

/// Split a leading RFC3339 timestamp off a line.
pub fn split_timestamp(line: &str) -> (Option<DateTime<Utc>>, &str) {
    let trimmed = line.trim_start();
    if let Some((head, rest)) = trimmed.split_once(char::is_whitespace) {
        if let Ok(ts) = DateTime::parse_from_rfc3339(head) {
            return (Some(ts.with_timezone(&Utc)), rest.trim_start());
        }
    } else if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return (Some(ts.with_timezone(&Utc)), "");
    }
    (None, trimmed)
}

/// Parse a structured line. Unstructured lines yield `None`.
pub fn parse_line(raw: &str, source: LogSource) -> Option<LogLine> {
    let (timestamp, body) = split_timestamp(raw);
    let body = body.trim();
    if !body.starts_with('{') {
        return None;
    }
    let payload: Payload = serde_json::from_str(body).ok()?;
    Some(LogLine {
        timestamp,
        message: payload.log,
        level: payload.level,
        source: payload.source.unwrap_or(source),
        internal: payload.internal,
        task: payload.task,
    })
}

/// The single line shown to a submitter as "the error".
///
/// Scans from the end for the last non-empty line, strips any timestamp
/// preamble and skips structured lines flagged internal.
pub fn user_error(text: &str) -> String {
    for line in text.lines().rev() {
        let (_, body) = split_timestamp(line);
        let body = body.trim_end();
        if body.trim().is_empty() {
            continue;
        }
        match parse_line(line, LogSource::Stderr) {
            Some(parsed) if parsed.internal => continue,
            Some(parsed) if parsed.message.trim().is_empty() => continue,
            Some(parsed) => return parsed.message.trim_end().to_string(),
            None => return body.to_string(),
        }
    }
    NO_ERRORS_REPORTED.to_string()
}

/// A captured raw line.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLine {
    pub timestamp: Option<DateTime<Utc>>,
    pub text: String,
    pub source: LogSource,
}

/// Bounded log capture. The oldest lines are evicted first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<RawLine>,
    capacity: usize,
    last_timestamp: Option<DateTime<Utc>>,
    // texts captured at `last_timestamp`, the overlap of the next resumed read
    at_last: Vec<String>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_LINES)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            last_timestamp: None,
            at_last: Vec::new(),
        }
    }

    /// Append a line unconditionally.
    pub fn push(&mut self, text: impl Into<String>, source: LogSource) {
        let text = text.into();
        let (timestamp, _) = split_timestamp(&text);
        match (timestamp, self.last_timestamp) {
            (Some(ts), Some(last)) if ts == last => self.at_last.push(text.clone()),
            (Some(ts), last) if last.map_or(true, |last| ts > last) => {
                self.last_timestamp = Some(ts);
                self.at_last = vec![text.clone()];
            }
            _ => {}
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(RawLine {
            timestamp,
            text,
            source,
        });
    }

    /// Append every non-empty line.
    pub fn extend<I>(&mut self, lines: I, source: LogSource) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut added = 0;
        for line in lines.into_iter().filter(|line| !line.is_empty()) {
            self.push(line, source);
            added += 1;
        }
        added
    }

    /// Append the result of a read resumed at [`LogBuffer::last_timestamp`].
    ///
    /// Such a read repeats what was already captured at the resume point.
    /// Lines older than it are dropped, and lines stamped exactly at it are
    /// matched one for one against those already captured there. Distinct
    /// lines sharing a timestamp are kept.
    pub fn extend_resumed<I>(&mut self, lines: I) -> usize
    where
        I: IntoIterator<Item = (String, LogSource)>,
    {
        let resume = self.last_timestamp;
        let mut overlap = self.at_last.clone();
        let mut added = 0;
        for (line, source) in lines.into_iter().filter(|(line, _)| !line.is_empty()) {
            if let (Some(ts), Some(resume)) = (split_timestamp(&line).0, resume) {
                if ts < resume {
                    continue;
                }
                if ts == resume {
                    if let Some(pos) = overlap.iter().position(|seen| *seen == line) {
                        overlap.swap_remove(pos);
                        continue;
                    }
                }
            }
            self.push(line, source);
            added += 1;
        }
        added
    }

    /// Newest timestamp seen, used to resume incremental reads.
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn raw_lines(&self) -> Vec<String> {
        self.lines.iter().map(|l| l.text.clone()).collect()
    }

    pub fn raw_text(&self) -> String {
        self.raw_lines().join("\n")
    }

    /// Messages of structured, non-internal lines.
    pub fn user_lines(&self) -> Vec<String> {
        self.parsed()
            .filter(|l| !l.internal)
            .map(|l| l.message)
            .collect()
    }

    /// Structured lines flagged internal.
    pub fn internal_lines(&self) -> Vec<LogLine> {
        self.parsed().filter(|l| l.internal).collect()
    }

    pub fn user_error(&self) -> String {
        user_error(&self.raw_text())
    }

    fn parsed(&self) -> impl Iterator<Item = LogLine> + '_ {
        self.lines
            .iter()
            .filter_map(|l| parse_line(&l.text, l.source))
    }
}
