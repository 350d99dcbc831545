//! Scenario runner
//!
//! Flattens scenario files into a plan, resolves `skip`/`only` markers,
//! and runs each scenario through setup, body and teardown on its own
//! session. Scenarios may run concurrently; reports keep declaration order.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use webprobe_common::{
    ExceptionPolicy, HarnessConfig, HarnessError, HarnessResult, OnlyPolicy, RecordedExchange,
};

use crate::artifacts;
use crate::commands::CommandRegistry;
use crate::intercept::Interceptor;
use crate::page::PageFactory;
use crate::session::Session;
use crate::spec::{Group, ScenarioSpec, Step};

/// Lifecycle state of a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioState {
    Idle,
    SetupRunning,
    BodyRunning,
    TeardownRunning,
    Passed,
    Failed,
    Skipped,
}

impl ScenarioState {
    pub fn can_transition(self, to: ScenarioState) -> bool {
        use ScenarioState::*;
        matches!(
            (self, to),
            (Idle, SetupRunning)
                | (Idle, Skipped)
                | (SetupRunning, BodyRunning)
                | (SetupRunning, TeardownRunning)
                // Session could not be opened; nothing to tear down
                | (SetupRunning, Failed)
                | (BodyRunning, TeardownRunning)
                | (TeardownRunning, Passed)
                | (TeardownRunning, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScenarioState::Passed | ScenarioState::Failed | ScenarioState::Skipped)
    }
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioState::Idle => "idle",
            ScenarioState::SetupRunning => "setup",
            ScenarioState::BodyRunning => "body",
            ScenarioState::TeardownRunning => "teardown",
            ScenarioState::Passed => "passed",
            ScenarioState::Failed => "failed",
            ScenarioState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Body,
    Teardown,
}

/// Scenario after flattening hooks and resolving markers
#[derive(Debug, Clone)]
pub struct PlannedScenario {
    /// Enclosing group names, outermost first
    pub groups: Vec<String>,
    pub name: String,
    pub tags: Vec<String>,
    /// `before_each` hooks, outer to inner
    pub setup: Vec<Step>,
    pub body: Vec<Step>,
    /// `after_each` hooks, inner to outer
    pub teardown: Vec<Step>,
    pub skipped: bool,
}

impl PlannedScenario {
    pub fn title(&self) -> String {
        let mut parts = self.groups.clone();
        parts.push(self.name.clone());
        parts.join(" > ")
    }
}

/// Name and tag selection applied before running
#[derive(Debug, Clone, Default)]
pub struct ScenarioFilter {
    /// Case-insensitive substring of the full title
    pub grep: Option<String>,
    /// Scenario must carry at least one of these
    pub tags: Vec<String>,
}

impl ScenarioFilter {
    pub fn matches(&self, title: &str, tags: &[String]) -> bool {
        let grep_ok = self
            .grep
            .as_ref()
            .map_or(true, |g| title.to_lowercase().contains(&g.to_lowercase()));
        let tags_ok = self.tags.is_empty() || self.tags.iter().any(|t| tags.contains(t));
        grep_ok && tags_ok
    }
}

/// Decides what happens to uncaught exceptions raised by the page
///
/// Built once per runner and shared by every scenario.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionFilter {
    policy: ExceptionPolicy,
}

impl ExceptionFilter {
    pub fn new(policy: ExceptionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ExceptionPolicy {
        self.policy
    }

    /// Record page errors; under `Fail` the first one fails the step
    pub fn handle(&self, errors: Vec<String>, seen: &mut Vec<String>) -> HarnessResult<()> {
        let first = errors.first().cloned();
        for e in errors {
            match self.policy {
                ExceptionPolicy::Swallow => warn!("Swallowed page exception: {}", e),
                ExceptionPolicy::Fail => warn!("Uncaught page exception: {}", e),
            }
            seen.push(e);
        }
        match (self.policy, first) {
            (ExceptionPolicy::Fail, Some(e)) => Err(HarnessError::UncaughtPageError(e)),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub phase: Phase,
    pub step: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub kind: String,
    pub message: String,
    pub phase: Phase,
    pub step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_observed: Option<String>,
}

impl Failure {
    fn from_error(phase: Phase, step: &str, err: &HarnessError) -> Self {
        let last_observed = match err {
            HarnessError::AssertionTimeout { last_observed, .. } => Some(last_observed.clone()),
            _ => None,
        };
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            phase,
            step: step.to_string(),
            last_observed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub title: String,
    pub name: String,
    pub groups: Vec<String>,
    pub state: ScenarioState,
    /// Every state the scenario went through
    pub history: Vec<ScenarioState>,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub page_errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_log: Vec<String>,
    /// Network traffic of failed scenarios
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic: Vec<RecordedExchange>,
}

impl ScenarioReport {
    fn new(planned: &PlannedScenario) -> Self {
        Self {
            title: planned.title(),
            name: planned.name.clone(),
            groups: planned.groups.clone(),
            state: ScenarioState::Idle,
            history: vec![ScenarioState::Idle],
            duration_ms: 0,
            steps: Vec::new(),
            failure: None,
            teardown_errors: Vec::new(),
            page_errors: Vec::new(),
            screenshot: None,
            frames: Vec::new(),
            command_log: Vec::new(),
            traffic: Vec::new(),
        }
    }

    fn advance(&mut self, to: ScenarioState) -> HarnessResult<()> {
        if !self.state.can_transition(to) {
            return Err(HarnessError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        self.history.push(to);
        if to.is_terminal() {
            debug!("Scenario '{}' settled as {}", self.name, to);
        }
        Ok(())
    }

    pub fn passed(&self) -> bool {
        self.state == ScenarioState::Passed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<ScenarioReport>,
}

impl SuiteReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Group-level context carried down while flattening
#[derive(Clone, Default)]
struct Inherited {
    groups: Vec<String>,
    tags: Vec<String>,
    setup: Vec<Step>,
    teardown: Vec<Step>,
    skipped: bool,
    only_markers: Vec<usize>,
}

struct Candidate {
    planned: PlannedScenario,
    only_markers: Vec<usize>,
}

fn flatten(group: &Group, parent: &Inherited, next_marker: &mut usize, out: &mut Vec<Candidate>) {
    let mut ctx = parent.clone();
    ctx.groups.push(group.name.clone());
    ctx.tags.extend(group.tags.iter().cloned());
    ctx.setup.extend(group.before_each.iter().cloned());
    // Inner after_each hooks run before outer ones
    let mut teardown = group.after_each.clone();
    teardown.extend(parent.teardown.iter().cloned());
    ctx.teardown = teardown;
    ctx.skipped |= group.skip;
    if group.only {
        ctx.only_markers.push(*next_marker);
        *next_marker += 1;
    }

    for scenario in &group.scenarios {
        out.push(candidate(scenario, &ctx, next_marker));
    }
    for child in &group.groups {
        flatten(child, &ctx, next_marker, out);
    }
}

fn candidate(scenario: &ScenarioSpec, ctx: &Inherited, next_marker: &mut usize) -> Candidate {
    let mut only_markers = ctx.only_markers.clone();
    if scenario.only {
        only_markers.push(*next_marker);
        *next_marker += 1;
    }
    let mut tags = ctx.tags.clone();
    tags.extend(scenario.tags.iter().cloned());

    Candidate {
        planned: PlannedScenario {
            groups: ctx.groups.clone(),
            name: scenario.name.clone(),
            tags,
            setup: ctx.setup.clone(),
            body: scenario.steps.clone(),
            teardown: ctx.teardown.clone(),
            skipped: ctx.skipped || scenario.skip,
        },
        only_markers,
    }
}

/// Flatten groups into runnable scenarios, applying filters and markers
pub fn plan(groups: &[Group], filter: &ScenarioFilter, policy: OnlyPolicy) -> Vec<PlannedScenario> {
    let mut candidates = Vec::new();
    let mut next_marker = 0;
    for group in groups {
        flatten(group, &Inherited::default(), &mut next_marker, &mut candidates);
    }
    candidates.retain(|c| filter.matches(&c.planned.title(), &c.planned.tags));

    let markers: Vec<usize> = candidates.iter().flat_map(|c| c.only_markers.iter().copied()).collect();
    let chosen = match policy {
        OnlyPolicy::AllMarked => None,
        OnlyPolicy::FirstMarked => markers.iter().min().copied(),
        OnlyPolicy::LastMarked => markers.iter().max().copied(),
    };

    candidates
        .into_iter()
        .map(|c| {
            let mut planned = c.planned;
            if !markers.is_empty() {
                let selected = match chosen {
                    Some(marker) => c.only_markers.contains(&marker),
                    None => !c.only_markers.is_empty(),
                };
                planned.skipped |= !selected;
            }
            planned
        })
        .collect()
}

/// Runs planned scenarios on fresh sessions
pub struct ScenarioRunner {
    config: Arc<HarnessConfig>,
    registry: Arc<CommandRegistry>,
    factory: Arc<dyn PageFactory>,
    exceptions: ExceptionFilter,
    filter: ScenarioFilter,
}

impl ScenarioRunner {
    pub fn new(config: Arc<HarnessConfig>, registry: Arc<CommandRegistry>, factory: Arc<dyn PageFactory>) -> Self {
        let exceptions = ExceptionFilter::new(config.uncaught_exceptions);
        info!(
            "Runner ready: {} commands, uncaught page exceptions {:?}",
            registry.names().len(),
            exceptions.policy()
        );
        Self {
            config,
            registry,
            factory,
            exceptions,
            filter: ScenarioFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: ScenarioFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn plan(&self, groups: &[Group]) -> Vec<PlannedScenario> {
        plan(groups, &self.filter, self.config.only_policy)
    }

    /// Run every scenario of `groups`
    pub async fn run(&self, groups: &[Group]) -> SuiteReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let planned = self.plan(groups);
        let parallel = self.config.parallel.max(1);
        info!("Running {} scenario(s), {} at a time", planned.len(), parallel);

        let results: Vec<ScenarioReport> = stream::iter(planned.iter().map(|p| self.run_scenario(p)))
            .buffered(parallel)
            .collect()
            .await;

        let count = |state| results.iter().filter(|r| r.state == state).count();
        let report = SuiteReport {
            started_at,
            total: results.len(),
            passed: count(ScenarioState::Passed),
            failed: count(ScenarioState::Failed),
            skipped: count(ScenarioState::Skipped),
            duration_ms: start.elapsed().as_millis() as u64,
            results,
        };
        info!(
            "Results: {} passed, {} failed, {} skipped ({} ms)",
            report.passed, report.failed, report.skipped, report.duration_ms
        );
        report
    }

    /// Run one scenario; failures end up in the report, never as `Err`
    pub async fn run_scenario(&self, planned: &PlannedScenario) -> ScenarioReport {
        let start = Instant::now();
        let mut report = ScenarioReport::new(planned);

        if let Err(e) = self.execute(planned, &mut report).await {
            error!("{}: {}", report.title, e);
            report.state = ScenarioState::Failed;
            report.history.push(ScenarioState::Failed);
            if report.failure.is_none() {
                report.failure = Some(Failure::from_error(Phase::Setup, "", &e));
            }
        }
        report.duration_ms = start.elapsed().as_millis() as u64;

        match report.state {
            ScenarioState::Passed => info!("✓ {} ({} ms)", report.title, report.duration_ms),
            ScenarioState::Skipped => info!("- {} (skipped)", report.title),
            _ => error!(
                "✗ {} - {}",
                report.title,
                report.failure.as_ref().map(|f| f.message.as_str()).unwrap_or("teardown failed")
            ),
        }
        report
    }

    async fn execute(&self, planned: &PlannedScenario, report: &mut ScenarioReport) -> HarnessResult<()> {
        if planned.skipped {
            return report.advance(ScenarioState::Skipped);
        }
        report.advance(ScenarioState::SetupRunning)?;

        let interceptor = Arc::new(Interceptor::new(
            self.config.rule_ordering,
            self.config.intercept_timeout(),
        ));
        let page = match self.factory.open(interceptor.clone()).await {
            Ok(page) => page,
            Err(e) => {
                report.failure = Some(Failure::from_error(Phase::Setup, "open session", &e));
                return report.advance(ScenarioState::Failed);
            }
        };
        let mut session = Session::new(self.config.clone(), self.registry.clone(), page, interceptor);
        let slug = artifacts::slugify(&report.title);

        let mut failed = self.run_phase(&mut session, &planned.setup, Phase::Setup, &slug, report).await;
        if !failed {
            report.advance(ScenarioState::BodyRunning)?;
            failed = self.run_phase(&mut session, &planned.body, Phase::Body, &slug, report).await;
        }

        if failed && self.config.screenshot_on_failure {
            match session.dispatcher().screenshot().await {
                Ok(png) => match artifacts::write_screenshot(&self.config.screenshots_dir(), &slug, &png) {
                    Ok(path) => report.screenshot = Some(path),
                    Err(e) => warn!("Failed to save failure screenshot: {}", e),
                },
                Err(e) => warn!("Failed to capture failure screenshot: {}", e),
            }
        }

        report.advance(ScenarioState::TeardownRunning)?;
        for step in &planned.teardown {
            if let Err(e) = self.run_step(&mut session, step, Phase::Teardown, &slug, report).await {
                report.teardown_errors.push(format!("{}: {}", step.label(), e));
            }
        }
        if let Err(e) = session.dispatcher().close().await {
            report.teardown_errors.push(format!("close session: {}", e));
        }

        report.command_log = session.command_log().to_vec();
        let failed = failed || !report.teardown_errors.is_empty();
        if failed {
            report.traffic = session.interceptor().traffic();
            report.advance(ScenarioState::Failed)
        } else {
            report.advance(ScenarioState::Passed)
        }
    }

    /// Run steps in order until one fails; returns whether one failed
    async fn run_phase(
        &self,
        session: &mut Session,
        steps: &[Step],
        phase: Phase,
        slug: &str,
        report: &mut ScenarioReport,
    ) -> bool {
        for step in steps {
            if let Err(e) = self.run_step(session, step, phase, slug, report).await {
                report.failure = Some(Failure::from_error(phase, &step.label(), &e));
                return true;
            }
        }
        false
    }

    async fn run_step(
        &self,
        session: &mut Session,
        step: &Step,
        phase: Phase,
        slug: &str,
        report: &mut ScenarioReport,
    ) -> HarnessResult<()> {
        let start = Instant::now();
        let label = step.label();
        debug!("{} [{:?}] {}", report.title, phase, label);

        let mut result = session
            .run_step(&step.command, &step.args, step.bind.as_deref())
            .await
            .map(|_| ());
        match session.dispatcher().take_page_errors().await {
            Ok(errors) => {
                let handled = self.exceptions.handle(errors, &mut report.page_errors);
                if result.is_ok() {
                    result = handled;
                }
            }
            Err(e) => debug!("Could not collect page errors: {}", e),
        }

        if self.config.video {
            match session.dispatcher().screenshot().await {
                Ok(png) => {
                    match artifacts::write_frame(&self.config.frames_dir(), slug, report.frames.len(), &png) {
                        Ok(path) => report.frames.push(path),
                        Err(e) => warn!("Failed to write frame: {}", e),
                    }
                }
                Err(e) => debug!("Frame capture failed: {}", e),
            }
        }

        report.steps.push(StepResult {
            phase,
            step: label,
            success: result.is_ok(),
            duration_ms: start.elapsed().as_millis() as u64,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    /// Write `results.json` into the output directory
    pub fn write_results(&self, report: &SuiteReport) -> HarnessResult<PathBuf> {
        artifacts::write_results(&self.config.output_dir, report)
    }
}
