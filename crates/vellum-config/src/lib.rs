//! Configuration for the Vellum daemon.
//!
//! Configuration is loaded in layers: built-in defaults, then an optional
//! TOML file, then environment variable overrides. Every section defaults
//! to production-ready values so a bare `[section]` header (or no file at
//! all) produces a working configuration; the only field without a safe
//! default is the auth credential, which [`Config::validate`] enforces at
//! startup.

pub mod error;
pub mod loader;
pub mod types;

pub use error::{ConfigError, ConfigResult};
pub use types::{
    AuthSection, BuildSection, CollabSection, Config, EngineSection, GatewaySection, LogFormat,
    LoggingSection, StorageSection, WebSocketSection,
};
