//! Page driver seam
//!
//! The dispatcher only ever talks to a [`Page`]: a DOM query/event target
//! whose outgoing HTTP traffic is routed through the session's
//! [`Interceptor`]. Drivers:
//!
//! - [`webdriver::WebDriverPage`]: a real browser over the W3C WebDriver
//!   protocol, with traffic fed through an intercepting proxy
//! - [`sim::SimPage`]: an in-process simulated document driven by a
//!   [`sim::SimApp`]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use webprobe_common::HarnessResult;

use crate::intercept::Interceptor;

pub mod selector;
pub mod sim;
pub mod webdriver;

/// Opaque, driver-assigned element reference
pub type ElementHandle = String;

/// Snapshot of one element at query time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementState {
    pub handle: ElementHandle,
    pub tag: String,
    pub id: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub text: String,
    pub value: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub visible: bool,
}

impl ElementState {
    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        match name {
            "id" => self.id.as_deref(),
            _ => self.attributes.get(name).map(String::as_str),
        }
    }

    /// Compact rendering used in failure diagnostics
    pub fn describe(&self) -> String {
        let mut out = format!("<{}", self.tag);
        if let Some(id) = &self.id {
            out.push('#');
            out.push_str(id);
        }
        for class in &self.classes {
            out.push('.');
            out.push_str(class);
        }
        if !self.visible {
            out.push_str(" hidden");
        }
        out.push('>');
        if let Some(value) = &self.value {
            out.push_str(&format!(" value={:?}", value));
        }
        if !self.text.is_empty() {
            let text: String = self.text.chars().take(80).collect();
            out.push_str(&format!(" {:?}", text));
        }
        out
    }
}

/// A single keystroke delivered to an element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Backspace,
    Delete,
    Escape,
    Tab,
    SelectAll,
}

/// Browser storage areas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    Session,
}

impl StorageKind {
    pub fn js_name(&self) -> &'static str {
        match self {
            StorageKind::Local => "localStorage",
            StorageKind::Session => "sessionStorage",
        }
    }
}

/// A live page the harness drives
///
/// Queries must be free of side effects: the assertion engine re-issues
/// them while polling.
#[async_trait]
pub trait Page: Send + Sync {
    async fn navigate(&self, url: &str) -> HarnessResult<()>;

    async fn reload(&self) -> HarnessResult<()>;

    async fn current_url(&self) -> HarnessResult<String>;

    /// All elements currently matching a CSS selector, in document order
    async fn find_all(&self, selector: &str) -> HarnessResult<Vec<ElementState>>;

    async fn click(&self, handle: &str) -> HarnessResult<()>;

    /// Empty the value of an input or textarea
    async fn clear(&self, handle: &str) -> HarnessResult<()>;

    async fn send_keys(&self, handle: &str, keys: &[Key]) -> HarnessResult<()>;

    async fn clear_cookies(&self) -> HarnessResult<()>;

    async fn clear_storage(&self, kind: StorageKind) -> HarnessResult<()>;

    /// PNG-encoded screenshot of the viewport
    async fn screenshot(&self) -> HarnessResult<Vec<u8>>;

    /// Drain uncaught exceptions raised by the page since the last call
    async fn take_page_errors(&self) -> HarnessResult<Vec<String>>;

    async fn close(&self) -> HarnessResult<()>;
}

/// Opens one exclusive page per scenario
#[async_trait]
pub trait PageFactory: Send + Sync {
    /// Open a page whose traffic flows through `interceptor`
    async fn open(&self, interceptor: Arc<Interceptor>) -> HarnessResult<Arc<dyn Page>>;
}
