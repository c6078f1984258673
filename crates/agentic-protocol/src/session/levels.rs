//! Per-session minimum log levels set through `logging/setLevel`.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::LogLevel;

/// Minimum forwarded severity, keyed by transport session.
///
/// Transports without sessions share the `None` entry. A session that never
/// set a level receives everything.
#[derive(Debug, Default)]
pub struct LogLevelRegistry {
    levels: Mutex<HashMap<Option<String>, LogLevel>>,
}

impl LogLevelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session: Option<&str>, level: LogLevel) {
        self.levels
            .lock()
            .insert(session.map(str::to_string), level);
    }

    pub fn get(&self, session: Option<&str>) -> Option<LogLevel> {
        self.levels
            .lock()
            .get(&session.map(str::to_string))
            .copied()
    }

    /// True when a record at `level` falls below the session's minimum.
    pub fn is_ignored(&self, level: LogLevel, session: Option<&str>) -> bool {
        self.get(session).is_some_and(|min| level < min)
    }
}
