//! Run Command

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use webprobe_common::HarnessConfig;
use webprobe_harness::page::webdriver::WebDriverFactory;
use webprobe_harness::{
    AppServer, CommandRegistry, Group, HttpUpstream, ScenarioFilter, ScenarioReport, ScenarioRunner,
    ScenarioState, SuiteReport,
};

use crate::output::{
    print_error, print_list, print_success, print_value, print_warning, OutputFormat, TableDisplay,
};

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Scenario directory (overrides `specs_dir`)
    #[arg(short, long)]
    pub specs: Option<PathBuf>,

    /// Run only scenarios whose full title contains this text
    #[arg(short, long)]
    pub grep: Option<String>,

    /// Run only scenarios carrying this tag (repeatable)
    #[arg(short, long)]
    pub tag: Vec<String>,

    /// Number of scenarios run concurrently
    #[arg(short, long)]
    pub parallel: Option<usize>,

    /// Origin relative navigations resolve against
    #[arg(long, env = "WEBPROBE_BASE_URL")]
    pub base_url: Option<String>,

    /// WebDriver server URL
    #[arg(long, env = "WEBPROBE_WEBDRIVER_URL")]
    pub webdriver_url: Option<String>,

    /// Browser name passed to the WebDriver server
    #[arg(long)]
    pub browser: Option<String>,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,

    /// Record a frame after every step
    #[arg(long)]
    pub video: bool,

    /// Do not capture screenshots of failing scenarios
    #[arg(long)]
    pub no_screenshots: bool,

    /// Results directory (overrides `output_dir`)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Do not start the configured application process
    #[arg(long)]
    pub no_app: bool,

    /// Extra `{{env.KEY}}` values as KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

impl RunArgs {
    /// Layer command-line flags over the loaded configuration
    pub fn apply(&self, config: &mut HarnessConfig) {
        if let Some(specs) = &self.specs {
            config.specs_dir = specs.clone();
        }
        if let Some(parallel) = self.parallel {
            config.parallel = parallel;
        }
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(url) = &self.webdriver_url {
            config.webdriver.url = url.clone();
        }
        if let Some(browser) = &self.browser {
            config.webdriver.browser = browser.clone();
        }
        if self.headed {
            config.webdriver.headless = false;
        }
        if self.video {
            config.video = true;
        }
        if self.no_screenshots {
            config.screenshot_on_failure = false;
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if self.no_app {
            config.app = None;
        }
        for (key, value) in &self.env {
            config.env.insert(key.clone(), value.clone());
        }
    }

    pub fn filter(&self) -> ScenarioFilter {
        ScenarioFilter {
            grep: self.grep.clone(),
            tags: self.tag.clone(),
        }
    }
}

/// Scenario result display wrapper
#[derive(Serialize)]
pub struct ScenarioRow {
    pub scenario: String,
    pub state: ScenarioState,
    pub duration_ms: u64,
    pub failure: String,
}

impl From<&ScenarioReport> for ScenarioRow {
    fn from(report: &ScenarioReport) -> Self {
        let failure = match (&report.failure, report.teardown_errors.first()) {
            (Some(f), _) => format!("[{}] {}: {}", f.kind, f.step, f.message),
            (None, Some(e)) => format!("teardown: {}", e),
            (None, None) => String::new(),
        };
        Self {
            scenario: report.title.clone(),
            state: report.state,
            duration_ms: report.duration_ms,
            failure,
        }
    }
}

impl TableDisplay for ScenarioRow {
    fn headers() -> Vec<&'static str> {
        vec!["Scenario", "State", "Duration", "Failure"]
    }

    fn row(&self) -> Vec<String> {
        let state = match self.state {
            ScenarioState::Passed => "✓ passed".green().to_string(),
            ScenarioState::Failed => "✗ failed".red().to_string(),
            ScenarioState::Skipped => "- skipped".dimmed().to_string(),
            other => other.to_string(),
        };
        vec![
            self.scenario.clone(),
            state,
            format!("{} ms", self.duration_ms),
            self.failure.clone(),
        ]
    }
}

fn print_report(report: &SuiteReport, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Yaml => print_value(report, format),
        _ if report.total == 0 => print_warning("No scenarios matched the filter"),
        _ => {
            let rows: Vec<ScenarioRow> = report.results.iter().map(ScenarioRow::from).collect();
            print_list(&rows, format);
            let summary = format!(
                "{} passed, {} failed, {} skipped ({} ms)",
                report.passed, report.failed, report.skipped, report.duration_ms
            );
            if report.success() {
                print_success(&summary);
            } else {
                print_error(&summary);
            }
        }
    }
}

/// Run the suite; `Ok(false)` when any scenario failed
pub async fn execute(args: RunArgs, mut config: HarnessConfig, format: OutputFormat) -> Result<bool> {
    args.apply(&mut config);
    config.validate()?;

    let groups = Group::load_all(&config.specs_dir)
        .with_context(|| format!("loading scenarios from {}", config.specs_dir.display()))?;
    let scenario_count: usize = groups.iter().map(Group::scenario_count).sum();
    info!("Loaded {} scenario(s) from {} file(s)", scenario_count, groups.len());

    // Kept alive until the run finishes
    let _app = match &config.app {
        Some(app) => Some(AppServer::spawn(app).await?),
        None => None,
    };

    let config = Arc::new(config);
    let registry = Arc::new(CommandRegistry::with_builtins()?);
    let factory = Arc::new(WebDriverFactory::new(config.clone(), Arc::new(HttpUpstream::new()?)));
    let runner = ScenarioRunner::new(config, registry, factory).with_filter(args.filter());

    let report = runner.run(&groups).await;
    runner.write_results(&report)?;
    print_report(&report, format);
    Ok(report.success())
}
