//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate descriptor layout (listeners above stdio, control pipe apart)
//! - Validate value ranges (limits and timeouts > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: HandoffConfig → Result<(), Vec<ValidationError>>

use crate::config::schema::HandoffConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_config(config: &HandoffConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.host.trim().is_empty() {
        errors.push(ValidationError::new("listener.host", "must not be empty"));
    }

    let start = config.activation.listen_fds_start;
    if start < 3 {
        errors.push(ValidationError::new(
            "activation.listen_fds_start",
            format!("{start} overlaps stdio, must be at least 3"),
        ));
    }

    let control = &config.control;
    if control.enabled {
        for (field, fd) in [("control.read_fd", control.read_fd), ("control.write_fd", control.write_fd)] {
            if fd < 0 {
                errors.push(ValidationError::new(field, format!("{fd} is not a descriptor")));
            } else if fd == start {
                errors.push(ValidationError::new(
                    field,
                    format!("{fd} is the first inherited listener"),
                ));
            }
        }
        if control.read_fd == control.write_fd {
            errors.push(ValidationError::new(
                "control.write_fd",
                "must differ from control.read_fd",
            ));
        }
    }

    if control.max_frame_bytes == Some(0) {
        errors.push(ValidationError::new("control.max_frame_bytes", "must be greater than 0"));
    }

    if config.shutdown.drain_timeout_secs == Some(0) {
        errors.push(ValidationError::new(
            "shutdown.drain_timeout_secs",
            "must be greater than 0, omit it to wait indefinitely",
        ));
    }

    if let Err(err) = tracing_subscriber::EnvFilter::try_new(&config.observability.log_level) {
        errors.push(ValidationError::new("observability.log_level", err.to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
