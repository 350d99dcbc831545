//! webprobe Common Library
//!
//! Shared error taxonomy, HTTP exchange types, configuration and fixture
//! loading for the webprobe harness and CLI.

pub mod config;
pub mod error;
pub mod fixture;
pub mod http;

pub use config::{
    AppConfig, ExceptionPolicy, HarnessConfig, OnlyPolicy, RuleOrdering, WebDriverConfig,
};
pub use error::{HarnessError, HarnessResult};
pub use fixture::FixtureStore;
pub use http::{Headers, HttpRequest, HttpResponse, Method, RecordedExchange};

/// webprobe version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file, relative to the working directory
pub fn default_config_path() -> std::path::PathBuf {
    std::path::PathBuf::from("webprobe.toml")
}
