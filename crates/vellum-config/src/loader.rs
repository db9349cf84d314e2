//! Config file loading and environment overrides.
//!
//! Load order: built-in defaults, then the TOML file (when given or when
//! `vellum.toml` exists in the working directory), then `VELLUM_*`
//! environment variables. Later layers win.

use std::path::Path;

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Environment variable overriding the listener address.
const ENV_BIND: &str = "VELLUM_BIND";
/// Environment variable overriding the data directory.
const ENV_DATA_DIR: &str = "VELLUM_DATA_DIR";
/// Environment variable overriding the auth secret.
const ENV_AUTH_SECRET: &str = "VELLUM_AUTH_SECRET";
/// Environment variable overriding the log directive.
const ENV_LOG: &str = "VELLUM_LOG";

/// Default config file name probed in the working directory.
const DEFAULT_FILE: &str = "vellum.toml";

/// Load configuration from an optional file path plus environment.
///
/// When `path` is `None`, `vellum.toml` in the working directory is used
/// if present; otherwise pure defaults. The result is validated before it
/// is returned.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read or parsed, or if
/// the merged configuration fails validation.
pub fn load(path: Option<&Path>) -> ConfigResult<Config> {
    let mut config = match path {
        Some(p) => read_file(p)?,
        None => {
            let default = Path::new(DEFAULT_FILE);
            if default.exists() {
                read_file(default)?
            } else {
                debug!("no config file found, using defaults");
                Config::default()
            }
        },
    };

    apply_env(&mut config);
    config.validate()?;
    Ok(config)
}

fn read_file(path: &Path) -> ConfigResult<Config> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Apply `VELLUM_*` environment overrides in place.
fn apply_env(config: &mut Config) {
    if let Ok(bind) = std::env::var(ENV_BIND) {
        config.gateway.bind = bind;
    }
    if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
        config.storage.data_dir = dir.into();
    }
    if let Ok(secret) = std::env::var(ENV_AUTH_SECRET) {
        config.auth.secret = Some(secret);
    }
    if let Ok(level) = std::env::var(ENV_LOG) {
        config.logging.level = level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[gateway]\nbind = \"127.0.0.1:9999\"\n\n[auth]\nsecret = \"k\""
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.gateway.bind, "127.0.0.1:9999");
        assert_eq!(config.websocket.pong_window_secs, 60);
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "websocket = \"not a table\"").unwrap();

        let err = load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn invalid_merged_config_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // No auth material at all.
        writeln!(file, "[websocket]\nping_interval_secs = 5").unwrap();

        let err = load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
