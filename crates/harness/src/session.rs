//! Per-scenario session
//!
//! A session owns one page, its interceptor, a fixture cache and the
//! variables bound by earlier steps. Nothing in it is shared with other
//! scenarios except the frozen command registry.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use webprobe_common::{FixtureStore, HarnessConfig, HarnessError, HarnessResult, RecordedExchange};

use crate::assertion::lookup;
use crate::commands::CommandRegistry;
use crate::dispatcher::{Dispatcher, Target};
use crate::intercept::Interceptor;
use crate::page::{ElementState, Page};

/// Value yielded by a command to the following steps
#[derive(Debug, Clone, Default)]
pub enum Subject {
    #[default]
    None,
    /// Elements matched by `target`; assertions re-query the target
    Elements {
        target: Target,
        elements: Vec<ElementState>,
    },
    Exchange(Box<RecordedExchange>),
    Value(Value),
}

impl Subject {
    pub fn to_value(&self) -> Value {
        match self {
            Subject::None => Value::Null,
            Subject::Elements { elements, .. } => serde_json::to_value(elements).unwrap_or(Value::Null),
            Subject::Exchange(exchange) => exchange.to_value(),
            Subject::Value(value) => value.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Subject::None => "none",
            Subject::Elements { .. } => "elements",
            Subject::Exchange(_) => "exchange",
            Subject::Value(_) => "value",
        }
    }
}

/// State of one running scenario
pub struct Session {
    id: String,
    config: Arc<HarnessConfig>,
    dispatcher: Dispatcher,
    interceptor: Arc<Interceptor>,
    registry: Arc<CommandRegistry>,
    fixtures: FixtureStore,
    fixture_cache: HashMap<String, Value>,
    vars: BTreeMap<String, Value>,
    subject: Subject,
    command_log: Vec<String>,
}

impl Session {
    pub fn new(
        config: Arc<HarnessConfig>,
        registry: Arc<CommandRegistry>,
        page: Arc<dyn Page>,
        interceptor: Arc<Interceptor>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        debug!("Session {} opened", id);
        Self {
            id,
            fixtures: FixtureStore::new(config.fixtures_dir.clone()),
            dispatcher: Dispatcher::new(page, config.clone()),
            config,
            interceptor,
            registry,
            fixture_cache: HashMap::new(),
            vars: BTreeMap::new(),
            subject: Subject::None,
            command_log: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn interceptor(&self) -> &Arc<Interceptor> {
        &self.interceptor
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    /// Entries written by commands with logging enabled
    pub fn command_log(&self) -> &[String] {
        &self.command_log
    }

    pub fn log_command(&mut self, entry: String) {
        debug!("[{}] {}", &self.id[..8], entry);
        self.command_log.push(entry);
    }

    /// Load a fixture, reading the file at most once per session
    pub fn fixture(&mut self, name: &str) -> HarnessResult<Value> {
        if let Some(value) = self.fixture_cache.get(name) {
            return Ok(value.clone());
        }
        let value = self.fixtures.load(name)?;
        self.fixture_cache.insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// Invoke a registered command by name
    pub async fn invoke(&mut self, name: &str, args: Value) -> HarnessResult<Subject> {
        let registry = self.registry.clone();
        registry.invoke(self, name, args).await
    }

    /// Run one step: interpolate, invoke, make the result the subject
    pub async fn run_step(&mut self, command: &str, args: &Value, bind: Option<&str>) -> HarnessResult<Subject> {
        let args = self.interpolate(args)?;
        let subject = self.invoke(command, args).await?;
        if let Some(name) = bind {
            self.vars.insert(name.to_string(), subject.to_value());
        }
        self.subject = subject.clone();
        Ok(subject)
    }

    /// Evaluate an expression: `env.KEY`, `fixture.NAME.path`, `var.path`
    pub fn resolve(&mut self, expr: &str) -> HarnessResult<Value> {
        let expr = expr.trim();
        let (root, path) = match expr.split_once('.') {
            Some((root, path)) => (root, Some(path)),
            None => (expr, None),
        };

        let base = match root {
            "env" => {
                let key = path.ok_or_else(|| HarnessError::InvalidInput("'env' needs a key".into()))?;
                return self
                    .config
                    .env
                    .get(key)
                    .map(|v| Value::String(v.clone()))
                    .ok_or_else(|| HarnessError::InvalidInput(format!("unknown env value: {}", key)));
            }
            "fixture" => {
                let rest = path.ok_or_else(|| HarnessError::InvalidInput("'fixture' needs a name".into()))?;
                let (name, inner) = match rest.split_once('.') {
                    Some((name, inner)) => (name, Some(inner)),
                    None => (rest, None),
                };
                let value = self.fixture(name)?;
                return Self::select(&value, inner, expr);
            }
            "subject" => self.subject.to_value(),
            name => self
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| HarnessError::InvalidInput(format!("unknown variable: {}", name)))?,
        };
        Self::select(&base, path, expr)
    }

    fn select(value: &Value, path: Option<&str>, expr: &str) -> HarnessResult<Value> {
        match path {
            None => Ok(value.clone()),
            Some(p) => lookup(value, p)
                .cloned()
                .ok_or_else(|| HarnessError::InvalidInput(format!("'{}' does not resolve", expr))),
        }
    }

    /// Replace `{{expr}}` placeholders throughout a step argument
    ///
    /// A string that is exactly one placeholder takes the resolved JSON value;
    /// otherwise the value is spliced in as text.
    pub fn interpolate(&mut self, value: &Value) -> HarnessResult<Value> {
        match value {
            Value::String(s) => self.interpolate_str(s),
            Value::Array(items) => items
                .iter()
                .map(|item| self.interpolate(item))
                .collect::<HarnessResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.interpolate(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn interpolate_str(&mut self, s: &str) -> HarnessResult<Value> {
        let trimmed = s.trim();
        if let Some(inner) = trimmed.strip_prefix("{{").and_then(|t| t.strip_suffix("}}")) {
            if !inner.contains("{{") && !inner.contains("}}") {
                return self.resolve(inner);
            }
        }

        let mut out = String::new();
        let mut rest = s;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            out.push_str(&rest[..start]);
            let resolved = self.resolve(&rest[start + 2..start + 2 + len])?;
            match resolved {
                Value::String(text) => out.push_str(&text),
                other => out.push_str(&other.to_string()),
            }
            rest = &rest[start + 2 + len + 2..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::RejectUpstream;
    use crate::page::sim::{SimDocument, SimPage, StaticSite};
    use serde_json::json;
    use std::time::Duration;
    use webprobe_common::RuleOrdering;

    fn session(fixtures: &std::path::Path) -> Session {
        let mut config = HarnessConfig {
            fixtures_dir: fixtures.to_path_buf(),
            ..Default::default()
        };
        config.env.insert("API_BASE_URL".into(), "http://localhost:1312/api".into());
        let interceptor = Arc::new(Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1)));
        let page = SimPage::new(
            Arc::new(StaticSite::new(SimDocument::new())),
            interceptor.clone(),
            Arc::new(RejectUpstream),
        );
        let registry = Arc::new(CommandRegistry::with_builtins().unwrap());
        Session::new(Arc::new(config), registry, Arc::new(page), interceptor)
    }

    #[test]
    fn test_interpolation_keeps_json_types() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("credentials.json"), r#"{"user": {"email": "a@b.c"}, "pin": 42}"#).unwrap();
        let mut s = session(dir.path());
        s.set_var("created", json!({ "key": "42", "tags": [1, 2] }));

        assert_eq!(s.interpolate(&json!("{{created.tags}}")).unwrap(), json!([1, 2]));
        assert_eq!(s.interpolate(&json!("{{fixture.credentials.pin}}")).unwrap(), json!(42));
        assert_eq!(
            s.interpolate(&json!({ "url": "{{env.API_BASE_URL}}/{{created.key}}" })).unwrap(),
            json!({ "url": "http://localhost:1312/api/42" })
        );
    }

    #[test]
    fn test_literal_braces_survive() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(dir.path());
        let typed = json!("{\"invalid\": json}");
        assert_eq!(s.interpolate(&typed).unwrap(), typed);
        assert!(s.interpolate(&json!("{{missing}}")).is_err());
    }

    #[test]
    fn test_fixture_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"username": "first"}"#).unwrap();
        let mut s = session(dir.path());
        assert_eq!(s.fixture("credentials").unwrap()["username"], "first");

        std::fs::write(&path, r#"{"username": "second"}"#).unwrap();
        assert_eq!(s.fixture("credentials").unwrap()["username"], "first");
    }
}
