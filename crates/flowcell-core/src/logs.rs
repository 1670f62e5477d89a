//! Bounded per-request log collection.

use flowcell_types::result::{LogLevel, LogLine};

/// Collects log lines for one request, keeping at most `capacity` of them.
///
/// Lines past the cap are counted and dropped; [`LogBuffer::finish`] appends
/// a single warning recording how many were lost.
#[derive(Debug)]
pub struct LogBuffer {
    lines: Vec<LogLine>,
    capacity: usize,
    dropped: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Vec::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.lines.len() < self.capacity {
            self.lines.push(LogLine::new(level, message));
        } else {
            self.dropped += 1;
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Consume the buffer, returning the lines in emission order.
    pub fn finish(mut self) -> Vec<LogLine> {
        if self.dropped > 0 {
            self.lines.push(LogLine::new(
                LogLevel::Warn,
                format!("{} log lines dropped (limit {})", self.dropped, self.capacity),
            ));
        }
        self.lines
    }
}

/// Re-emit a step log line through `tracing`.
pub(crate) fn emit(level: LogLevel, step_id: &str, text: &str) {
    match level {
        LogLevel::Error => tracing::error!(step_id, "{}", text),
        LogLevel::Warn => tracing::warn!(step_id, "{}", text),
        LogLevel::Info => tracing::info!(step_id, "{}", text),
        LogLevel::Debug => tracing::debug!(step_id, "{}", text),
        LogLevel::Trace => tracing::trace!(step_id, "{}", text),
    }
}
