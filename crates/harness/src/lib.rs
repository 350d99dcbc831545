//! webprobe harness
//!
//! Drives a web application through a page driver and verifies what it
//! does, one isolated session per scenario:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ScenarioRunner                            │
//! │    plan(groups) -> [PlannedScenario]   (hooks, only/skip)   │
//! │    run_scenario -> ScenarioReport      (setup/body/teardown)│
//! ├─────────────────────────────────────────────────────────────┤
//! │  Session                                                    │
//! │    ├── CommandRegistry   primitives, built-ins, overrides   │
//! │    ├── Dispatcher        navigate / click / type / clear    │
//! │    ├── Interceptor       rules, aliases, recorded traffic   │
//! │    └── assertion         retry-until-timeout matchers       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Page                                                       │
//! │    ├── WebDriverPage  (W3C WebDriver + InterceptProxy)      │
//! │    └── SimPage        (in-process document + SimApp)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod artifacts;
pub mod assertion;
pub mod builtins;
pub mod commands;
pub mod dispatcher;
pub mod intercept;
pub mod page;
pub mod proxy;
pub mod runner;
pub mod server;
pub mod session;
pub mod spec;

pub use commands::{Command, CommandFuture, CommandRef, CommandRegistry};
pub use dispatcher::{ClickOptions, Dispatcher, Position, Target, TypeOptions};
pub use intercept::{
    HttpUpstream, InterceptRule, Interceptor, RejectUpstream, StaticResponse, Upstream, UrlPattern,
};
pub use page::{ElementState, Page, PageFactory};
pub use runner::{
    ExceptionFilter, PlannedScenario, ScenarioFilter, ScenarioReport, ScenarioRunner, ScenarioState,
    SuiteReport,
};
pub use server::AppServer;
pub use session::{Session, Subject};
pub use spec::{Group, ScenarioSpec, Step};
pub use webprobe_common::{HarnessError, HarnessResult};
