//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → HandoffConfig (validated, immutable)
//!     → CLI overrides applied by the binary
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - No built-in frame size limit or drain timeout; both are opt-in

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ActivationConfig, ControlConfig, HandoffConfig, ListenerConfig, NotifyConfig, ObservabilityConfig,
    ShutdownConfig,
};
pub use validation::{validate_config, ValidationError};
