//! List Commands

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use webprobe_common::HarnessConfig;
use webprobe_harness::runner::plan;
use webprobe_harness::{CommandRegistry, Group, PlannedScenario, ScenarioFilter};

use crate::output::{print_list, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum ListCommands {
    /// List scenarios as they would run
    Scenarios(ScenarioArgs),

    /// List registered commands
    Commands,
}

#[derive(Args, Debug)]
pub struct ScenarioArgs {
    /// Scenario directory (overrides `specs_dir`)
    #[arg(short, long)]
    pub specs: Option<PathBuf>,

    /// Only scenarios whose full title contains this text
    #[arg(short, long)]
    pub grep: Option<String>,

    /// Only scenarios carrying this tag (repeatable)
    #[arg(short, long)]
    pub tag: Vec<String>,
}

/// Planned scenario display wrapper
#[derive(Serialize)]
pub struct PlannedRow {
    pub scenario: String,
    pub tags: Vec<String>,
    pub steps: usize,
    pub skipped: bool,
}

impl From<&PlannedScenario> for PlannedRow {
    fn from(planned: &PlannedScenario) -> Self {
        Self {
            scenario: planned.title(),
            tags: planned.tags.clone(),
            steps: planned.setup.len() + planned.body.len() + planned.teardown.len(),
            skipped: planned.skipped,
        }
    }
}

impl TableDisplay for PlannedRow {
    fn headers() -> Vec<&'static str> {
        vec!["Scenario", "Tags", "Steps", "Runs"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.scenario.clone(),
            self.tags.join(", "),
            self.steps.to_string(),
            if self.skipped { "no".into() } else { "yes".into() },
        ]
    }
}

#[derive(Serialize)]
pub struct CommandRow {
    pub name: String,
}

impl TableDisplay for CommandRow {
    fn headers() -> Vec<&'static str> {
        vec!["Command"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.name.clone()]
    }
}

pub async fn execute(cmd: ListCommands, mut config: HarnessConfig, format: OutputFormat) -> Result<()> {
    match cmd {
        ListCommands::Scenarios(args) => {
            if let Some(specs) = args.specs {
                config.specs_dir = specs;
            }
            let groups = Group::load_all(&config.specs_dir)?;
            let filter = ScenarioFilter {
                grep: args.grep,
                tags: args.tag,
            };
            let rows: Vec<PlannedRow> = plan(&groups, &filter, config.only_policy)
                .iter()
                .map(PlannedRow::from)
                .collect();
            print_list(&rows, format);
        }
        ListCommands::Commands => {
            let registry = CommandRegistry::with_builtins()?;
            let rows: Vec<CommandRow> = registry
                .names()
                .into_iter()
                .map(|name| CommandRow { name })
                .collect();
            print_list(&rows, format);
        }
    }
    Ok(())
}
