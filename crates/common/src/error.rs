//! Error types for webprobe

use thiserror::Error;

/// Result type alias using the harness error
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

/// Harness error types
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Element not found: '{selector}' did not appear within {timeout_ms}ms")]
    ElementNotFound { selector: String, timeout_ms: u64 },

    #[error("Element not actionable: '{selector}' {reason}")]
    NotActionable { selector: String, reason: String },

    #[error("Assertion timed out after {timeout_ms}ms: {message} (last observed: {last_observed})")]
    AssertionTimeout {
        message: String,
        last_observed: String,
        timeout_ms: u64,
    },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("No request matched alias '@{alias}' within {timeout_ms}ms")]
    InterceptTimeout { alias: String, timeout_ms: u64 },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Unknown alias: @{0}")]
    UnknownAlias(String),

    #[error("Alias already registered in this scenario: @{0}")]
    DuplicateAlias(String),

    #[error("Command already defined: {0}")]
    DuplicateCommand(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Uncaught exception in page: {0}")]
    UncaughtPageError(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Fixture '{name}': {reason}")]
    Fixture { name: String, reason: String },

    #[error("Scenario file parse error: {0}")]
    SpecParse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("App server failed to start: {0}")]
    ServerStartup(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("App server health check failed after {0} attempts")]
    ServerHealthCheck(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl HarnessError {
    /// True for the failures raised when a suspension point runs out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            HarnessError::ElementNotFound { .. }
                | HarnessError::AssertionTimeout { .. }
                | HarnessError::InterceptTimeout { .. }
        )
    }

    /// Short machine-readable name, used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            HarnessError::ElementNotFound { .. } => "ElementNotFound",
            HarnessError::NotActionable { .. } => "NotActionable",
            HarnessError::AssertionTimeout { .. } => "AssertionTimeout",
            HarnessError::AssertionFailed(_) => "AssertionFailed",
            HarnessError::InterceptTimeout { .. } => "InterceptTimeout",
            HarnessError::NetworkError(_) => "NetworkError",
            HarnessError::UnknownAlias(_) => "UnknownAlias",
            HarnessError::DuplicateAlias(_) => "DuplicateAlias",
            HarnessError::DuplicateCommand(_) => "DuplicateCommand",
            HarnessError::UnknownCommand(_) => "UnknownCommand",
            HarnessError::InvalidInput(_) => "InvalidInput",
            HarnessError::InvalidStateTransition { .. } => "InvalidStateTransition",
            HarnessError::UncaughtPageError(_) => "UncaughtPageError",
            HarnessError::Driver(_) => "Driver",
            HarnessError::Fixture { .. } => "Fixture",
            HarnessError::SpecParse(_) => "SpecParse",
            HarnessError::InvalidConfig(_) => "InvalidConfig",
            HarnessError::ServerStartup(_) => "ServerStartup",
            HarnessError::Tls(_) => "Tls",
            HarnessError::ServerHealthCheck(_) => "ServerHealthCheck",
            HarnessError::Io(_) => "Io",
            HarnessError::Json(_) => "Json",
            HarnessError::Yaml(_) => "Yaml",
            HarnessError::Toml(_) => "Toml",
            HarnessError::Http(_) => "Http",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        let err = HarnessError::InterceptTimeout {
            alias: "calcRequest".into(),
            timeout_ms: 5000,
        };
        assert!(err.is_timeout());
        assert_eq!(err.kind(), "InterceptTimeout");
        assert!(!HarnessError::UnknownCommand("x".into()).is_timeout());
    }

    #[test]
    fn test_assertion_timeout_message_carries_last_observed() {
        let err = HarnessError::AssertionTimeout {
            message: "expected '#keysResponse' to have class 'success'".into(),
            last_observed: "class=\"error\"".into(),
            timeout_ms: 4000,
        };
        let msg = err.to_string();
        assert!(msg.contains("4000ms"));
        assert!(msg.contains("class=\"error\""));
    }
}
