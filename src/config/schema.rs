//! Configuration schema definitions.
//!
//! All sections derive Serde traits and fall back to defaults, so an empty
//! file is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for a handoff-managed service.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct HandoffConfig {
    /// Fresh-listen fallback (host, port).
    pub listener: ListenerConfig,

    /// Inherited-descriptor handling.
    pub activation: ActivationConfig,

    /// Supervisor control channel.
    pub control: ControlConfig,

    pub shutdown: ShutdownConfig,

    /// Readiness notifications.
    pub notify: NotifyConfig,

    pub observability: ObservabilityConfig,
}

/// Listener used when no descriptor was inherited.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ActivationConfig {
    /// Skip the `LISTEN_PID` check.
    pub compat_mode: bool,

    /// First inherited descriptor.
    pub listen_fds_start: i32,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            compat_mode: true,
            listen_fds_start: 3,
        }
    }
}

/// Supervisor pipe passed down next to the listener.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// Look for the control pipe and run supervised when found.
    pub enabled: bool,

    pub read_fd: i32,
    pub write_fd: i32,

    /// Largest accepted frame payload; unlimited when unset.
    pub max_frame_bytes: Option<usize>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_fd: 4,
            write_fd: 5,
            max_frame_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Escalate a graceful drain after this many seconds; wait forever when unset.
    pub drain_timeout_secs: Option<u64>,
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Send watchdog pings when the supervisor asks for them.
    pub watchdog: bool,

    /// Also send `MAINPID=` and a `STATUS=` line per transition. Only safe
    /// on datagram sinks; a stream sink has no message boundaries.
    pub status_updates: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            watchdog: true,
            status_updates: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    /// Emit JSON log lines.
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}
