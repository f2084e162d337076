//! Host event log.
//!
//! An append-only, level-filtered ring of [`LogEntry`] values with bounded
//! retention. Accepted entries are mirrored to `tracing` and, when a store
//! is attached, persisted as one JSON array under [`LOG_STORAGE_KEY`].

use crate::config::LoggingSettings;
use enclave_storage::KeyValueStore;
use enclave_types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

pub const LOG_STORAGE_KEY: &str = "enclave_logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: Timestamp,
    pub level: LogLevel,
    /// Component or plugin id that produced the entry.
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Criteria for [`Logger::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub min_level: Option<LogLevel>,
    pub source: Option<String>,
    pub since: Option<Timestamp>,
}

impl LogFilter {
    fn matches(&self, entry: &LogEntry) -> bool {
        self.min_level.is_none_or(|l| entry.level >= l)
            && self.source.as_deref().is_none_or(|s| entry.source == s)
            && self.since.is_none_or(|t| entry.timestamp >= t)
    }
}

struct LoggerInner {
    settings: LoggingSettings,
    entries: Mutex<VecDeque<LogEntry>>,
    store: Option<Arc<dyn KeyValueStore>>,
}

/// Cheap to clone; clones share the ring.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("min_level", &self.inner.settings.min_level)
            .field("entries", &self.len())
            .finish()
    }
}

impl Logger {
    /// In-memory logger.
    pub fn new(settings: LoggingSettings) -> Self {
        Self::build(settings, None, VecDeque::new())
    }

    /// Logger persisting to `store`, seeded with previously persisted entries.
    pub fn with_store(settings: LoggingSettings, store: Arc<dyn KeyValueStore>) -> Self {
        if !settings.persist {
            return Self::new(settings);
        }
        let mut entries: VecDeque<LogEntry> = match store.get_json(LOG_STORAGE_KEY) {
            Ok(Some(entries)) => entries,
            Ok(None) => VecDeque::new(),
            Err(e) => {
                warn!(error = %e, "discarding unreadable persisted log");
                VecDeque::new()
            }
        };
        while entries.len() > settings.max_entries {
            entries.pop_front();
        }
        Self::build(settings, Some(store), entries)
    }

    fn build(
        settings: LoggingSettings,
        store: Option<Arc<dyn KeyValueStore>>,
        entries: VecDeque<LogEntry>,
    ) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                settings,
                entries: Mutex::new(entries),
                store,
            }),
        }
    }

    /// Appends an entry if `level` passes the minimum. Returns whether it was kept.
    pub fn log(
        &self,
        level: LogLevel,
        source: &str,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> bool {
        if level < self.inner.settings.min_level {
            return false;
        }
        let entry = LogEntry {
            timestamp: Timestamp::now(),
            level,
            source: source.to_string(),
            message: message.into(),
            data,
        };
        mirror(&entry);

        let snapshot = {
            let mut entries = self.inner.entries.lock().unwrap();
            entries.push_back(entry);
            while entries.len() > self.inner.settings.max_entries {
                entries.pop_front();
            }
            self.inner.store.as_ref().map(|_| entries.clone())
        };
        if let (Some(store), Some(entries)) = (&self.inner.store, snapshot) {
            if let Err(e) = store.set_json(LOG_STORAGE_KEY, &entries) {
                warn!(error = %e, "failed to persist log");
            }
        }
        true
    }

    pub fn debug(&self, source: &str, message: impl Into<String>) -> bool {
        self.log(LogLevel::Debug, source, message, None)
    }

    pub fn info(&self, source: &str, message: impl Into<String>) -> bool {
        self.log(LogLevel::Info, source, message, None)
    }

    pub fn warn(&self, source: &str, message: impl Into<String>) -> bool {
        self.log(LogLevel::Warn, source, message, None)
    }

    pub fn error(&self, source: &str, message: impl Into<String>) -> bool {
        self.log(LogLevel::Error, source, message, None)
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn query(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.inner
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.entries.lock().unwrap().clear();
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.remove(LOG_STORAGE_KEY) {
                warn!(error = %e, "failed to clear persisted log");
            }
        }
    }
}

fn mirror(entry: &LogEntry) {
    let source = entry.source.as_str();
    match entry.level {
        LogLevel::Debug => debug!(source, "{}", entry.message),
        LogLevel::Info => info!(source, "{}", entry.message),
        LogLevel::Warn => warn!(source, "{}", entry.message),
        LogLevel::Error => error!(source, "{}", entry.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_storage::MemoryStore;
    use serde_json::json;

    fn settings(min_level: LogLevel, max_entries: usize) -> LoggingSettings {
        LoggingSettings {
            min_level,
            max_entries,
            persist: true,
        }
    }

    #[test]
    fn filters_below_min_level() {
        let logger = Logger::new(settings(LogLevel::Info, 10));
        assert!(!logger.debug("host", "noise"));
        assert!(logger.info("host", "started"));
        assert!(logger.error("acme.charts", "crashed"));
        assert_eq!(logger.len(), 2);
    }

    #[test]
    fn retention_is_bounded() {
        let logger = Logger::new(settings(LogLevel::Debug, 3));
        for i in 0..5 {
            logger.info("host", format!("entry {i}"));
        }
        let messages: Vec<_> = logger.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["entry 2", "entry 3", "entry 4"]);
    }

    #[test]
    fn query_by_level_and_source() {
        let logger = Logger::new(settings(LogLevel::Debug, 10));
        logger.debug("host", "a");
        logger.warn("acme.charts", "b");
        logger.log(LogLevel::Error, "acme.charts", "c", Some(json!({"code": 7})));

        let filter = LogFilter {
            min_level: Some(LogLevel::Warn),
            source: Some("acme.charts".into()),
            since: None,
        };
        let found = logger.query(&filter);
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].data, Some(json!({"code": 7})));
    }

    #[test]
    fn persists_and_reloads() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let logger = Logger::with_store(settings(LogLevel::Info, 10), store.clone());
        logger.info("host", "one");
        logger.warn("host", "two");
        assert!(store.get(LOG_STORAGE_KEY).unwrap().is_some());

        let reloaded = Logger::with_store(settings(LogLevel::Info, 1), store.clone());
        let entries = reloaded.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "two");

        reloaded.clear();
        assert!(store.get(LOG_STORAGE_KEY).unwrap().is_none());
    }
}
