use std::sync::Arc;
use tally_common::Clock;
use tracing::debug;

/// Timestamped lines stored on the complex transaction.
pub struct ExecutionLog {
    enabled: bool,
    clock: Arc<dyn Clock>,
    lines: Vec<String>,
}

impl ExecutionLog {
    pub fn new(enabled: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled,
            clock,
            lines: Vec::new(),
        }
    }

    pub fn record(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!(target: "tally::execution", "{}", message);
        if self.enabled {
            let stamp = self.clock.now().format("%Y-%m-%d %H:%M:%S");
            self.lines.push(format!("[{}] {}", stamp, message));
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn joined(&self) -> String {
        self.lines.join("\n")
    }
}
