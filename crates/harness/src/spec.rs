//! Declarative YAML scenario files
//!
//! A file holds one top-level group. Groups nest, carry `before_each` /
//! `after_each` hooks, and contain scenarios; a scenario is an ordered list
//! of steps. A step is either a bare command name or a single-entry map
//! from command name to arguments, optionally with `as: <var>`:
//!
//! ```yaml
//! name: Node Cache API GUI
//! before_each:
//!   - clearAll
//!   - visitUrl: "{{env.GUI_URL}}"
//! scenarios:
//!   - name: fetch all keys from empty cache
//!     steps:
//!       - click: { selector: button, contains: Fetch All Keys }
//!       - get: "#keysResponse"
//!       - should: [[be.visible], [have.class, success]]
//! ```

use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use webprobe_common::{HarnessError, HarnessResult};

/// One command invocation
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "serde_yaml::Value")]
pub struct Step {
    pub command: String,
    pub args: Value,
    /// Variable receiving the step's subject
    pub bind: Option<String>,
}

impl Step {
    pub fn new(command: &str, args: Value) -> Self {
        Self {
            command: command.to_string(),
            args,
            bind: None,
        }
    }

    /// Short label used in logs and reports
    pub fn label(&self) -> String {
        let args = match &self.args {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let args: String = args.chars().take(60).collect();
        format!("{} {}", self.command, args).trim_end().to_string()
    }
}

impl TryFrom<serde_yaml::Value> for Step {
    type Error = String;

    fn try_from(raw: serde_yaml::Value) -> Result<Self, Self::Error> {
        match raw {
            serde_yaml::Value::String(command) => Ok(Step::new(&command, Value::Null)),
            serde_yaml::Value::Mapping(map) => {
                let mut command = None;
                let mut bind = None;
                for (key, value) in map {
                    let key = key
                        .as_str()
                        .ok_or_else(|| "step keys must be strings".to_string())?
                        .to_string();
                    if key == "as" {
                        bind = Some(
                            value
                                .as_str()
                                .ok_or_else(|| "'as' must name a variable".to_string())?
                                .to_string(),
                        );
                        continue;
                    }
                    if command.is_some() {
                        return Err(format!("step has more than one command (second: '{}')", key));
                    }
                    let args = serde_json::to_value(value).map_err(|e| e.to_string())?;
                    command = Some((key, args));
                }
                let (command, args) = command.ok_or_else(|| "step without a command".to_string())?;
                Ok(Step { command, args, bind })
            }
            other => Err(format!("a step must be a command name or a map, got {:?}", other)),
        }
    }
}

/// A single test case
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioSpec {
    pub name: String,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub only: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A `describe` block
#[derive(Debug, Clone, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub only: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub before_each: Vec<Step>,
    #[serde(default)]
    pub after_each: Vec<Step>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioSpec>,
    #[serde(default)]
    pub groups: Vec<Group>,
    /// File the group was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Group {
    /// Parse a group from a YAML string
    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        let group: Group = serde_yaml::from_str(yaml).map_err(|e| HarnessError::SpecParse(e.to_string()))?;
        group.validate()?;
        Ok(group)
    }

    /// Parse a group from a YAML file
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut group = Self::from_yaml(&content)
            .map_err(|e| HarnessError::SpecParse(format!("{}: {}", path.display(), e)))?;
        group.source = Some(path.to_path_buf());
        Ok(group)
    }

    /// Load every scenario file under a directory, in path order
    pub fn load_all(dir: &Path) -> HarnessResult<Vec<Self>> {
        if !dir.is_dir() {
            return Err(HarnessError::InvalidConfig(format!(
                "scenario directory not found: {}",
                dir.display()
            )));
        }

        let mut groups = Vec::new();
        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            groups.push(Self::from_file(entry.path())?);
        }
        Ok(groups)
    }

    fn validate(&self) -> HarnessResult<()> {
        if self.name.trim().is_empty() {
            return Err(HarnessError::SpecParse("group without a name".into()));
        }
        if self.skip && self.only {
            return Err(HarnessError::SpecParse(format!(
                "group '{}' is marked both skip and only",
                self.name
            )));
        }
        for scenario in &self.scenarios {
            if scenario.name.trim().is_empty() {
                return Err(HarnessError::SpecParse(format!("unnamed scenario in '{}'", self.name)));
            }
            if scenario.skip && scenario.only {
                return Err(HarnessError::SpecParse(format!(
                    "scenario '{}' is marked both skip and only",
                    scenario.name
                )));
            }
        }
        self.groups.iter().try_for_each(Group::validate)
    }

    /// Total number of scenarios, nested groups included
    pub fn scenario_count(&self) -> usize {
        self.scenarios.len() + self.groups.iter().map(Group::scenario_count).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CACHE_GUI: &str = r##"
name: Node Cache API GUI
tags: [gui]
before_each:
  - clearAll
  - visitUrl: "{{env.GUI_URL}}"
  - get: { selector: h1, should: [contain, Cache API Interface] }
groups:
  - name: GET operations
    scenarios:
      - name: fetch all keys from empty cache
        steps:
          - intercept: { method: GET, url: /api, alias: getAllKeys }
          - click: { selector: button, contains: Fetch All Keys }
          - wait: "@getAllKeys"
            as: keys
          - get: "#keysResponse"
          - should: [[be.visible], [have.class, success], [contain, "Cache is empty 🗑️"]]
      - name: enter key loads data
        skip: true
        steps:
          - reload
"##;

    #[test]
    fn test_parse_nested_groups() {
        let group = Group::from_yaml(CACHE_GUI).unwrap();
        assert_eq!(group.before_each.len(), 3);
        assert_eq!(group.before_each[0], Step::new("clearAll", Value::Null));
        assert_eq!(group.scenario_count(), 2);

        let scenario = &group.groups[0].scenarios[0];
        assert_eq!(scenario.steps[2].bind.as_deref(), Some("keys"));
        assert_eq!(scenario.steps[0].args["alias"], json!("getAllKeys"));
        assert!(group.groups[0].scenarios[1].skip);
    }

    #[test]
    fn test_skip_and_only_conflict() {
        let yaml = r#"
name: conflicted
scenarios:
  - name: both
    skip: true
    only: true
    steps: [reload]
"#;
        assert!(matches!(Group::from_yaml(yaml), Err(HarnessError::SpecParse(_))));
    }

    #[test]
    fn test_step_with_two_commands_rejected() {
        let yaml = r##"
name: bad
scenarios:
  - name: two
    steps:
      - visit: /
        click: "#Btn2"
"##;
        assert!(Group::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_all_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.yaml"), "name: second\nscenarios: []\n").unwrap();
        std::fs::write(dir.path().join("a.yml"), "name: first\nscenarios: []\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let groups = Group::load_all(dir.path()).unwrap();
        let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(groups[0].source.is_some());
    }
}
