//! User-facing status output
//!
//! The orchestrator reports budget warnings and sync progress through an
//! injected [`Reporter`] rather than a process-global writer, so tests can
//! capture output per scenario.

use std::sync::Mutex;

/// Destination for user-visible status lines
pub trait Reporter: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Reporter that writes to stdout/stderr
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn info(&self, message: &str) {
        println!("{}", message);
    }

    fn warn(&self, message: &str) {
        eprintln!("warning: {}", message);
    }

    fn error(&self, message: &str) {
        eprintln!("error: {}", message);
    }
}

/// Reporter that accumulates lines in memory (for tests)
#[derive(Debug, Default)]
pub struct CapturingReporter {
    lines: Mutex<Vec<(Level, String)>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl CapturingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured lines in emission order
    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines.lock().unwrap().clone()
    }

    /// Only the warning lines
    pub fn warnings(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(level, _)| *level == Level::Warn)
            .map(|(_, line)| line.clone())
            .collect()
    }
}

impl Reporter for CapturingReporter {
    fn info(&self, message: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((Level::Info, message.to_string()));
    }

    fn warn(&self, message: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((Level::Warn, message.to_string()));
    }

    fn error(&self, message: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((Level::Error, message.to_string()));
    }
}
