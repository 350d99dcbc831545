//! Harness configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarnessError, HarnessResult};

/// Prefix of process environment variables copied into `env`
pub const ENV_PREFIX: &str = "WEBPROBE_ENV_";

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Origin that relative navigations resolve against
    pub base_url: String,

    pub viewport_width: u32,
    pub viewport_height: u32,

    /// Default timeout for element queries and actions
    pub default_command_timeout_ms: u64,

    /// Default timeout for awaiting an intercept alias
    pub intercept_timeout_ms: u64,

    /// Default timeout for page navigation
    pub page_load_timeout_ms: u64,

    /// Interval between assertion re-evaluations
    pub poll_interval_ms: u64,

    /// Record a frame after every step
    pub video: bool,

    /// Capture a screenshot when a scenario fails
    pub screenshot_on_failure: bool,

    /// Directory containing scenario YAML files
    pub specs_dir: PathBuf,

    /// Directory containing JSON fixtures
    pub fixtures_dir: PathBuf,

    /// Directory for results, screenshots and frames
    pub output_dir: PathBuf,

    /// Number of scenarios run concurrently
    pub parallel: usize,

    pub only_policy: OnlyPolicy,
    pub rule_ordering: RuleOrdering,
    pub uncaught_exceptions: ExceptionPolicy,

    /// Selector of the consent banner button dismissed by `acceptCookies`
    pub consent_selector: String,

    /// Collaborator endpoints and other values exposed as `{{env.KEY}}`
    pub env: BTreeMap<String, String>,

    pub webdriver: WebDriverConfig,

    /// Optional process for the application under test
    pub app: Option<AppConfig>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            viewport_width: 1280,
            viewport_height: 720,
            default_command_timeout_ms: 4_000,
            intercept_timeout_ms: 5_000,
            page_load_timeout_ms: 60_000,
            poll_interval_ms: 50,
            video: false,
            screenshot_on_failure: true,
            specs_dir: PathBuf::from("specs"),
            fixtures_dir: PathBuf::from("fixtures"),
            output_dir: PathBuf::from("webprobe-results"),
            parallel: 1,
            only_policy: OnlyPolicy::default(),
            rule_ordering: RuleOrdering::default(),
            uncaught_exceptions: ExceptionPolicy::default(),
            consent_selector: "#onetrust-reject-all-handler".to_string(),
            env: BTreeMap::new(),
            webdriver: WebDriverConfig::default(),
            app: None,
        }
    }
}

/// Resolution of conflicting `only` markers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnlyPolicy {
    /// Every scenario under an `only` marker runs
    #[default]
    AllMarked,
    /// Only the first-declared `only` marker is honoured
    FirstMarked,
    /// Only the last-declared `only` marker is honoured
    LastMarked,
}

/// Resolution of overlapping intercept rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOrdering {
    /// Earliest-registered live rule wins, every time
    #[default]
    FirstMatch,
    /// Rules sharing method and pattern serve one request each in
    /// registration order; the last of them stays live
    Sequential,
    /// Latest-registered live rule wins
    LastMatch,
}

/// What to do with uncaught exceptions raised by the driven page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionPolicy {
    #[default]
    Swallow,
    Fail,
}

/// W3C WebDriver endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDriverConfig {
    /// WebDriver server URL (chromedriver, geckodriver, selenium)
    pub url: String,
    pub browser: String,
    pub headless: bool,
    /// Listen address of the intercepting proxy (port 0 = ephemeral)
    pub proxy_listen: String,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:4444".to_string(),
            browser: "chrome".to_string(),
            headless: true,
            proxy_listen: "127.0.0.1:0".to_string(),
        }
    }
}

/// Application-under-test process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Program and arguments
    pub command: Vec<String>,
    /// URL polled until it answers with a success status
    pub health_url: String,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> HarnessResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Copy `WEBPROBE_ENV_*` variables into `env`, overriding file values
    pub fn apply_env_vars<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            if let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) {
                if !name.is_empty() {
                    self.env.insert(name.to_string(), value.into());
                }
            }
        }
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(HarnessError::InvalidConfig("poll_interval_ms must be > 0".into()));
        }
        if self.parallel == 0 {
            return Err(HarnessError::InvalidConfig("parallel must be >= 1".into()));
        }
        if self.viewport_width == 0 || self.viewport_height == 0 {
            return Err(HarnessError::InvalidConfig("viewport must be non-empty".into()));
        }
        if url::Url::parse(&self.base_url).is_err() {
            return Err(HarnessError::InvalidConfig(format!(
                "base_url is not an absolute URL: {}",
                self.base_url
            )));
        }
        if let Some(app) = &self.app {
            if app.command.is_empty() {
                return Err(HarnessError::InvalidConfig("app.command must not be empty".into()));
            }
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.default_command_timeout_ms)
    }

    pub fn intercept_timeout(&self) -> Duration {
        Duration::from_millis(self.intercept_timeout_ms)
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_millis(self.page_load_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.output_dir.join("screenshots")
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.output_dir.join("frames")
    }

    /// Resolve a possibly relative URL against `base_url`
    pub fn resolve_url(&self, target: &str) -> String {
        if url::Url::parse(target).is_ok() {
            return target.to_string();
        }
        match url::Url::parse(&self.base_url).and_then(|base| base.join(target)) {
            Ok(u) => u.to_string(),
            Err(_) => format!("{}{}", self.base_url.trim_end_matches('/'), target),
        }
    }
}
