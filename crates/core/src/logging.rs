use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// A single engine log event. `node` carries the workflow node label when the
/// event was emitted while executing a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub node: Option<String>,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            node: None,
            message: message.into(),
        }
    }

    pub fn for_node(level: LogLevel, node: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            node: Some(node.into()),
            message: message.into(),
        }
    }
}

pub trait LogSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

pub type SharedSink = Arc<dyn LogSink>;

/// Discards every event.
#[derive(Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, _event: LogEvent) {}
}

/// Collects events in memory so tests can assert on them.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events()
            .iter()
            .any(|event| event.message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn emit(&self, event: LogEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}

/// Writes events to stdout, one line per event.
#[derive(Clone, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }
}

impl LogSink for ConsoleSink {
    fn emit(&self, event: LogEvent) {
        match &event.node {
            Some(node) => println!("[{}] ({}) {}", event.level, node, event.message),
            None => println!("[{}] {}", event.level, event.message),
        }
    }
}
