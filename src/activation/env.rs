//! Access to environment markers and the current process id.

use std::collections::HashMap;
use std::sync::Mutex;

/// Read/remove access to environment variables plus the current pid.
pub trait Environment: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;

    /// Remove a marker so a re-exec of this image does not see it again.
    fn remove_var(&self, key: &str);

    fn pid(&self) -> u32;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn remove_var(&self, key: &str) {
        std::env::remove_var(key);
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }
}

/// In-memory environment with a fixed pid, for tests and embedding.
#[derive(Debug, Default)]
pub struct MapEnv {
    vars: Mutex<HashMap<String, String>>,
    pid: u32,
}

impl MapEnv {
    pub fn new(pid: u32) -> Self {
        Self {
            vars: Mutex::new(HashMap::new()),
            pid,
        }
    }

    /// Builder-style variable assignment.
    pub fn with_var(self, key: &str, value: impl Into<String>) -> Self {
        self.set_var(key, value);
        self
    }

    pub fn set_var(&self, key: &str, value: impl Into<String>) {
        self.lock().insert(key.to_string(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.vars.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Environment for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn remove_var(&self, key: &str) {
        self.lock().remove(key);
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}
