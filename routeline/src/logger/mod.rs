use serde::{Deserialize, Serialize};
use std::panic::Location;
use uuid::Uuid;

/// Log target for requests no handler mapping could route.
pub const PAGE_NOT_FOUND_TARGET: &str = "routeline::page_not_found";

/// Log target for registration summaries.
pub const MAPPINGS_TARGET: &str = "routeline::mappings";

/// Installs `env_logger` as the `log` backend unless a logger is already set.
///
/// The filter comes from `RUST_LOG` and defaults to `info`.
pub fn init() {
    let env = env_logger::Env::default().default_filter_or("info");
    if env_logger::Builder::from_env(env).try_init().is_err() {
        log::trace!("Logger already initialized");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    ERROR,
    WARN,
    INFO,
    DEBUG,
    TRACE,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => LogLevel::ERROR,
            log::Level::Warn => LogLevel::WARN,
            log::Level::Info => LogLevel::INFO,
            log::Level::Debug => LogLevel::DEBUG,
            log::Level::Trace => LogLevel::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    Registry,
    Resolver,
    Dispatcher,
}

/// A structured log line, rendered as JSON.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogEntry {
    timestamp: String,
    level: LogLevel,
    thread_id: Option<String>,
    file: Option<String>,
    line: Option<u32>,
    column: Option<u32>,
    exchange_id: Option<Uuid>,
    component: Component,
    message: String,
}

impl LogEntry {
    /// A `DEBUG` entry stamped with the caller's source location.
    #[track_caller]
    pub fn new(component: Component, message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: LogLevel::DEBUG,
            thread_id: std::thread::current().name().map(str::to_string),
            file: Some(location.file().to_string()),
            line: Some(location.line()),
            column: Some(location.column()),
            exchange_id: None,
            component,
            message: message.into(),
        }
    }

    pub fn with_level(mut self, level: impl Into<LogLevel>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_exchange(mut self, exchange_id: &Uuid) -> Self {
        self.exchange_id = Some(*exchange_id);
        self
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or(String::from("Error serializing log entry"))
    }
}
