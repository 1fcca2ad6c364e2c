//! Configuration errors and loading helpers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use zeroize::Zeroizing;

/// Configuration error types.
///
/// Every variant is fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),

    /// A PIN file could not be read.
    #[error("failed to read PIN file '{}': {source}", path.display())]
    PinError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parse duration string using humantime.
///
/// Supports various formats: `30s`, `1m`, `5m30s`, `1h`, `100ms`, etc.
///
/// # Examples
///
/// ```
/// use yubihsm_exporter::config::parse_duration;
///
/// assert_eq!(parse_duration("5s").unwrap().as_secs(), 5);
/// assert_eq!(parse_duration("1m").unwrap().as_secs(), 60);
/// assert_eq!(parse_duration("250ms").unwrap().as_millis(), 250);
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string is empty".to_string());
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Expand environment variables in a string.
/// Supports ${VAR} and ${VAR:-default} syntax.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}

/// Read a PIN from `path`, dropping trailing whitespace.
///
/// The returned buffer is wiped on drop.
///
/// # Errors
/// Returns `ConfigError::PinError` if the file cannot be read as UTF-8.
pub fn load_pin(path: impl AsRef<Path>) -> Result<Zeroizing<String>, ConfigError> {
    let path = path.as_ref();
    let raw = Zeroizing::new(std::fs::read_to_string(path).map_err(|source| {
        ConfigError::PinError {
            path: path.to_path_buf(),
            source,
        }
    })?);
    Ok(Zeroizing::new(raw.trim_end().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_duration_valid() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration(" 500ms ").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("30").is_err());
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("http://127.0.0.1:12345"), "http://127.0.0.1:12345");
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        let result = expand_env_vars("${NONEXISTENT_PIN_DIR_12345:-/etc/yubihsm}/audit.pin");
        assert_eq!(result, "/etc/yubihsm/audit.pin");
    }

    #[test]
    fn test_expand_env_vars_from_env() {
        // SAFETY: This test runs in isolation and only modifies a test-specific variable.
        unsafe {
            std::env::set_var("TEST_CONNECTOR_HOST", "hsm.internal");
        }
        let result = expand_env_vars("http://${TEST_CONNECTOR_HOST}:12345");
        assert_eq!(result, "http://hsm.internal:12345");
        // SAFETY: Cleanup test variable.
        unsafe {
            std::env::remove_var("TEST_CONNECTOR_HOST");
        }
    }

    #[test]
    fn test_load_pin_trims_trailing_whitespace() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "prince").unwrap();

        let pin = load_pin(file.path()).unwrap();
        assert_eq!(pin.as_str(), "prince");
    }

    #[test]
    fn test_load_pin_missing_file() {
        let result = load_pin("does/not/exist");
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::PinError { .. }));
        assert!(err.to_string().contains("does/not/exist"));
    }
}
