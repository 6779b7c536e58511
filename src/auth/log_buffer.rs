//! Bounded per-provider log and the diagnostic stream.
//!
//! Every provider owns a `LogBuffer` holding its most recent lines. The same
//! lines are forwarded to the orchestrator through `Diagnostics` so the
//! consumer can show them while a long flow (device code) is still running.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use tokio::sync::mpsc;

/// Number of lines a provider log retains.
pub const LOG_CAPACITY: usize = 20;

/// A thread-safe ring buffer of log lines.
///
/// Clone shares the underlying buffer.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    /// Create an empty buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append one line, evicting the oldest lines while at capacity.
    ///
    /// A poisoned mutex is recovered; logging should not cascade failures.
    pub fn log(&self, line: impl Into<String>) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        while guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(line.into());
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.clear();
    }

    /// Retained lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders every retained line followed by a newline, oldest first.
impl fmt::Display for LogBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// One line on the diagnostic stream.
#[derive(Debug, Clone)]
pub struct DiagnosticLine {
    /// Id of the provider that produced the line.
    pub provider: &'static str,
    pub at: DateTime<Local>,
    pub message: String,
}

impl fmt::Display for DiagnosticLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.at.format("%H:%M:%S"),
            self.provider,
            self.message
        )
    }
}

/// Sender half of the append-only diagnostic stream.
///
/// A detached instance drops lines silently, which is what tests and
/// one-shot tools want.
#[derive(Clone, Default)]
pub struct Diagnostics {
    tx: Option<mpsc::UnboundedSender<DiagnosticLine>>,
}

impl Diagnostics {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DiagnosticLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, provider: &'static str, message: &str) {
        if let Some(tx) = &self.tx {
            // Receiver gone means the consumer shut down; nothing to report to.
            let _ = tx.send(DiagnosticLine {
                provider,
                at: Local::now(),
                message: message.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_buffer_basic() {
        let buf = LogBuffer::new();
        buf.log("line 1");
        buf.log("line 2");

        assert_eq!(buf.lines(), vec!["line 1", "line 2"]);
        assert_eq!(buf.to_string(), "line 1\nline 2\n");
    }

    #[test]
    fn test_log_buffer_keeps_most_recent() {
        let buf = LogBuffer::new();
        for i in 0..LOG_CAPACITY + 5 {
            buf.log(format!("line {}", i));
        }

        let lines = buf.lines();
        assert_eq!(lines.len(), LOG_CAPACITY);
        assert_eq!(lines[0], "line 5");
        assert_eq!(lines[LOG_CAPACITY - 1], format!("line {}", LOG_CAPACITY + 4));
    }

    #[test]
    fn test_log_buffer_char_count() {
        let buf = LogBuffer::with_capacity(3);
        for line in ["a", "bb", "ccc", "dddd", ""] {
            buf.log(line);
        }

        let retained = buf.lines();
        let expected: usize = retained.iter().map(|l| l.len() + 1).sum();
        assert_eq!(retained, vec!["ccc", "dddd", ""]);
        assert_eq!(buf.to_string().len(), expected);
    }

    #[test]
    fn test_log_buffer_clear() {
        let buf = LogBuffer::new();
        buf.log("before");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.to_string(), "");

        buf.log("after");
        assert_eq!(buf.lines(), vec!["after"]);
    }

    #[test]
    fn test_log_count_since_clear() {
        let buf = LogBuffer::with_capacity(4);
        for i in 0..10 {
            buf.log(format!("{}", i));
        }
        buf.clear();
        buf.log("x");
        buf.log("y");
        assert_eq!(buf.len(), 2);
    }

    #[tokio::test]
    async fn test_diagnostics_channel() {
        let (diag, mut rx) = Diagnostics::channel();
        diag.emit("MSAL", "hello");

        let line = rx.recv().await.unwrap();
        assert_eq!(line.provider, "MSAL");
        assert_eq!(line.message, "hello");
        assert!(line.to_string().ends_with("[MSAL] hello"));
    }

    #[test]
    fn test_detached_diagnostics_drop_lines() {
        Diagnostics::detached().emit("ADAL", "nobody listening");
    }
}
