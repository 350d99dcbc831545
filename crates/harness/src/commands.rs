//! Command registry
//!
//! Commands are named async operations over a [`Session`]. The registry is
//! built once before the run (primitives, built-ins, user overrides) and is
//! shared read-only by every scenario afterwards.
//!
//! Overriding a command wraps the implementation registered at that moment:
//! the override receives the previous implementation and decides whether
//! and how to call it.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use webprobe_common::{HarnessError, HarnessResult};

use crate::session::{Session, Subject};

pub type CommandFuture<'a> = BoxFuture<'a, HarnessResult<Subject>>;

/// A named operation a step can invoke
pub trait Command: Send + Sync {
    fn call<'a>(&'a self, session: &'a mut Session, args: Value) -> CommandFuture<'a>;
}

pub type CommandRef = Arc<dyn Command>;

/// Command backed by a function
struct FnCommand<F>(F);

impl<F> Command for FnCommand<F>
where
    F: for<'a> Fn(&'a mut Session, Value) -> CommandFuture<'a> + Send + Sync,
{
    fn call<'a>(&'a self, session: &'a mut Session, args: Value) -> CommandFuture<'a> {
        (self.0)(session, args)
    }
}

/// Override layered on top of a previous implementation
struct Decorated<F> {
    previous: CommandRef,
    f: F,
}

impl<F> Command for Decorated<F>
where
    F: for<'a> Fn(&'a CommandRef, &'a mut Session, Value) -> CommandFuture<'a> + Send + Sync,
{
    fn call<'a>(&'a self, session: &'a mut Session, args: Value) -> CommandFuture<'a> {
        (self.f)(&self.previous, session, args)
    }
}

/// Whether a step should appear in the command log (`log: false` hides it)
pub fn log_enabled(args: &Value) -> bool {
    args.get("log").and_then(Value::as_bool).unwrap_or(true)
}

fn summarize(args: &Value) -> String {
    let text = match args {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > 80 {
        format!("{}…", text.chars().take(80).collect::<String>())
    } else {
        text
    }
}

/// Name → implementation table
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandRef>,
}

impl CommandRegistry {
    /// Empty registry, without primitives
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with primitive and built-in commands
    pub fn with_builtins() -> HarnessResult<Self> {
        let mut registry = Self::new();
        crate::builtins::register_primitives(&mut registry)?;
        crate::builtins::register_builtins(&mut registry)?;
        Ok(registry)
    }

    /// Add a new command; existing names are rejected
    pub fn define<F>(&mut self, name: &str, f: F) -> HarnessResult<()>
    where
        F: for<'a> Fn(&'a mut Session, Value) -> CommandFuture<'a> + Send + Sync + 'static,
    {
        self.define_command(name, Arc::new(FnCommand(f)))
    }

    pub fn define_command(&mut self, name: &str, command: CommandRef) -> HarnessResult<()> {
        if self.commands.contains_key(name) {
            return Err(HarnessError::DuplicateCommand(name.to_string()));
        }
        trace!("Defined command {}", name);
        self.commands.insert(name.to_string(), command);
        Ok(())
    }

    /// Wrap an existing command; `f` receives the implementation it replaces
    pub fn overwrite<F>(&mut self, name: &str, f: F) -> HarnessResult<()>
    where
        F: for<'a> Fn(&'a CommandRef, &'a mut Session, Value) -> CommandFuture<'a> + Send + Sync + 'static,
    {
        let previous = self
            .commands
            .get(name)
            .cloned()
            .ok_or_else(|| HarnessError::UnknownCommand(name.to_string()))?;
        debug!("Overwrote command {}", name);
        self.commands
            .insert(name.to_string(), Arc::new(Decorated { previous, f }));
        Ok(())
    }

    pub fn get(&self, name: &str) -> HarnessResult<CommandRef> {
        self.commands
            .get(name)
            .cloned()
            .ok_or_else(|| HarnessError::UnknownCommand(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Sorted command names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn invoke(&self, session: &mut Session, name: &str, args: Value) -> HarnessResult<Subject> {
        let command = self.get(name)?;
        if log_enabled(&args) {
            session.log_command(format!("{} {}", name, summarize(&args)).trim_end().to_string());
        }
        command.call(session, args).await
    }
}
