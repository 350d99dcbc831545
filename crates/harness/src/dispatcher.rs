//! Action dispatcher
//!
//! Translates steps into page operations. Element lookups wait for the
//! element to appear (and, for actions, to be visible) within the command
//! timeout; queries never mutate the page, so the assertion engine may
//! re-issue them freely.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use webprobe_common::{HarnessConfig, HarnessError, HarnessResult};

use crate::assertion::{poll, Check, PollOptions};
use crate::page::{ElementState, Key, Page, StorageKind};

/// Which element of a matched set to keep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    First,
    Last,
    Nth(usize),
}

/// Element lookup: a CSS selector with optional text filter and position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub selector: String,
    /// Keep only elements whose text contains this
    pub contains: Option<String>,
    pub position: Option<Position>,
}

impl Target {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            contains: None,
            position: None,
        }
    }

    pub fn containing(mut self, text: impl Into<String>) -> Self {
        self.contains = Some(text.into());
        self
    }

    pub fn at(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    fn narrow(&self, mut elements: Vec<ElementState>) -> Vec<ElementState> {
        if let Some(text) = &self.contains {
            elements.retain(|e| e.text.contains(text.as_str()) || e.value.as_deref() == Some(text.as_str()));
        }
        let picked = match self.position {
            None => return elements,
            Some(Position::First) => elements.into_iter().next(),
            Some(Position::Last) => elements.pop(),
            Some(Position::Nth(n)) => elements.into_iter().nth(n),
        };
        picked.into_iter().collect()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.selector)?;
        if let Some(text) = &self.contains {
            write!(f, " containing {:?}", text)?;
        }
        match self.position {
            Some(Position::First) => write!(f, " (first)"),
            Some(Position::Last) => write!(f, " (last)"),
            Some(Position::Nth(n)) => write!(f, " (#{})", n),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClickOptions {
    /// Skip the visibility check
    pub force: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TypeOptions {
    /// Interpret `{enter}`-style sequences; off so literal text (JSON) is typed verbatim
    pub parse_special_chars: bool,
    pub force: bool,
    pub timeout: Option<Duration>,
}

/// Split text into keystrokes
pub fn parse_keys(text: &str, special: bool) -> HarnessResult<Vec<Key>> {
    if !special {
        return Ok(text.chars().map(Key::Char).collect());
    }

    let mut keys = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        keys.extend(rest[..start].chars().map(Key::Char));
        let after = &rest[start + 1..];
        // `{{}` types a literal brace
        if let Some(tail) = after.strip_prefix("{}") {
            keys.push(Key::Char('{'));
            rest = tail;
            continue;
        }
        let end = after
            .find('}')
            .ok_or_else(|| HarnessError::InvalidInput(format!("unterminated key sequence in {:?}", text)))?;
        let key = match after[..end].to_ascii_lowercase().as_str() {
            "enter" => Key::Enter,
            "backspace" => Key::Backspace,
            "del" => Key::Delete,
            "esc" => Key::Escape,
            "tab" => Key::Tab,
            "selectall" => Key::SelectAll,
            other => {
                return Err(HarnessError::InvalidInput(format!(
                    "unknown special character sequence: {{{}}}",
                    other
                )))
            }
        };
        keys.push(key);
        rest = &after[end + 1..];
    }
    keys.extend(rest.chars().map(Key::Char));
    Ok(keys)
}

const NOT_FOUND: &str = "not found";

/// Executes actions against one page
pub struct Dispatcher {
    page: Arc<dyn Page>,
    config: Arc<HarnessConfig>,
}

impl Dispatcher {
    pub fn new(page: Arc<dyn Page>, config: Arc<HarnessConfig>) -> Self {
        Self { page, config }
    }

    pub fn page(&self) -> &Arc<dyn Page> {
        &self.page
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn poll_options(&self, timeout: Option<Duration>) -> PollOptions {
        PollOptions::new(
            timeout.unwrap_or_else(|| self.config.command_timeout()),
            self.config.poll_interval(),
        )
    }

    /// Load a URL, relative ones against the base URL
    pub async fn navigate(&self, url: &str, timeout: Option<Duration>) -> HarnessResult<String> {
        let url = self.config.resolve_url(url);
        let timeout = timeout.unwrap_or_else(|| self.config.page_load_timeout());
        debug!("navigate {}", url);
        match tokio::time::timeout(timeout, self.page.navigate(&url)).await {
            Ok(result) => result.map(|_| url),
            Err(_) => Err(HarnessError::Driver(format!(
                "page load of {} exceeded {}ms",
                url,
                timeout.as_millis()
            ))),
        }
    }

    pub async fn reload(&self) -> HarnessResult<()> {
        let timeout = self.config.page_load_timeout();
        tokio::time::timeout(timeout, self.page.reload())
            .await
            .map_err(|_| HarnessError::Driver(format!("reload exceeded {}ms", timeout.as_millis())))?
    }

    pub async fn current_url(&self) -> HarnessResult<String> {
        self.page.current_url().await
    }

    /// Single, side-effect-free evaluation of a target
    pub async fn snapshot(&self, target: &Target) -> HarnessResult<Vec<ElementState>> {
        let elements = self.page.find_all(&target.selector).await?;
        Ok(target.narrow(elements))
    }

    /// Wait until the target matches at least one element
    pub async fn query(&self, target: &Target, timeout: Option<Duration>) -> HarnessResult<Vec<ElementState>> {
        let options = self.poll_options(timeout);
        poll(options, || async {
            let elements = self.snapshot(target).await?;
            Ok(if elements.is_empty() {
                Check::fail(NOT_FOUND, "no elements")
            } else {
                Check::Pass(elements)
            })
        })
        .await
        .map_err(|e| self.lookup_error(target, options, e))
    }

    /// Wait for the first matching element to become actionable
    async fn actionable(&self, target: &Target, force: bool, timeout: Option<Duration>) -> HarnessResult<ElementState> {
        let options = self.poll_options(timeout);
        poll(options, || async {
            let mut elements = self.snapshot(target).await?;
            if elements.is_empty() {
                return Ok(Check::fail(NOT_FOUND, "no elements"));
            }
            let first = elements.remove(0);
            Ok(if force || first.visible {
                Check::Pass(first)
            } else {
                Check::fail("is not visible", first.describe())
            })
        })
        .await
        .map_err(|e| self.lookup_error(target, options, e))
    }

    fn lookup_error(&self, target: &Target, options: PollOptions, err: HarnessError) -> HarnessError {
        match err {
            HarnessError::AssertionTimeout { message, .. } if message == NOT_FOUND => HarnessError::ElementNotFound {
                selector: target.to_string(),
                timeout_ms: options.timeout.as_millis() as u64,
            },
            HarnessError::AssertionTimeout { message, last_observed, .. } => HarnessError::NotActionable {
                selector: target.to_string(),
                reason: format!("{} after {}ms: {}", message, options.timeout.as_millis(), last_observed),
            },
            other => other,
        }
    }

    fn with_selector(target: &Target, err: HarnessError) -> HarnessError {
        match err {
            HarnessError::NotActionable { reason, .. } => HarnessError::NotActionable {
                selector: target.to_string(),
                reason,
            },
            other => other,
        }
    }

    pub async fn click(&self, target: &Target, options: ClickOptions) -> HarnessResult<ElementState> {
        let element = self.actionable(target, options.force, options.timeout).await?;
        debug!("click {}", element.describe());
        self.page
            .click(&element.handle)
            .await
            .map_err(|e| Self::with_selector(target, e))?;
        Ok(element)
    }

    pub async fn type_text(&self, target: &Target, text: &str, options: TypeOptions) -> HarnessResult<ElementState> {
        let keys = parse_keys(text, options.parse_special_chars)?;
        let element = self.actionable(target, options.force, options.timeout).await?;
        debug!("type {} chars into {}", text.chars().count(), element.describe());
        self.page
            .send_keys(&element.handle, &keys)
            .await
            .map_err(|e| Self::with_selector(target, e))?;
        Ok(element)
    }

    pub async fn clear(&self, target: &Target, timeout: Option<Duration>) -> HarnessResult<ElementState> {
        let element = self.actionable(target, false, timeout).await?;
        self.page
            .clear(&element.handle)
            .await
            .map_err(|e| Self::with_selector(target, e))?;
        Ok(element)
    }

    pub async fn clear_cookies(&self) -> HarnessResult<()> {
        self.page.clear_cookies().await
    }

    pub async fn clear_local_storage(&self) -> HarnessResult<()> {
        self.page.clear_storage(StorageKind::Local).await
    }

    pub async fn clear_session_storage(&self) -> HarnessResult<()> {
        self.page.clear_storage(StorageKind::Session).await
    }

    pub async fn screenshot(&self) -> HarnessResult<Vec<u8>> {
        self.page.screenshot().await
    }

    pub async fn take_page_errors(&self) -> HarnessResult<Vec<String>> {
        self.page.take_page_errors().await
    }

    pub async fn close(&self) -> HarnessResult<()> {
        self.page.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::{Interceptor, RejectUpstream};
    use crate::page::sim::{SimDocument, SimElement, SimPage, StaticSite};
    use test_case::test_case;
    use webprobe_common::RuleOrdering;

    fn dispatcher(doc: SimDocument) -> Dispatcher {
        let config = HarnessConfig {
            default_command_timeout_ms: 200,
            poll_interval_ms: 10,
            ..Default::default()
        };
        let interceptor = Arc::new(Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1)));
        let page = SimPage::new(Arc::new(StaticSite::new(doc)), interceptor, Arc::new(RejectUpstream));
        Dispatcher::new(Arc::new(page), Arc::new(config))
    }

    fn todo_doc() -> SimDocument {
        SimDocument::new()
            .with(SimElement::new("input").id("createInput").input(""))
            .with(SimElement::new("button").id("hiddenBtn").text("Hidden").hidden())
            .with(SimElement::new("li").class("item").text("Learn Rust"))
            .with(SimElement::new("li").class("item").text("Write tests"))
    }

    #[test_case("hello", false, 5 ; "literal")]
    #[test_case("{enter}", false, 7 ; "braces kept literal")]
    #[test_case("a{enter}", true, 2 ; "enter")]
    #[test_case("{selectall}{backspace}", true, 2 ; "select all then delete")]
    #[test_case("{{}\"x\"}", true, 5 ; "escaped brace")]
    fn test_parse_keys(text: &str, special: bool, count: usize) {
        assert_eq!(parse_keys(text, special).unwrap().len(), count);
    }

    #[test]
    fn test_unknown_sequence_rejected() {
        let err = parse_keys("{invalid}", true).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_literal_json_typed_verbatim() {
        let d = dispatcher(todo_doc());
        d.navigate("/", None).await.unwrap();
        let target = Target::new("#createInput");
        d.type_text(&target, "{\"invalid\": json}", TypeOptions::default()).await.unwrap();
        let el = d.query(&target, None).await.unwrap();
        assert_eq!(el[0].value.as_deref(), Some("{\"invalid\": json}"));
    }

    #[tokio::test]
    async fn test_query_missing_element_times_out() {
        let d = dispatcher(todo_doc());
        d.navigate("/", None).await.unwrap();
        let err = d.query(&Target::new("#nope"), None).await.unwrap_err();
        assert!(matches!(err, HarnessError::ElementNotFound { timeout_ms: 200, .. }));
    }

    #[tokio::test]
    async fn test_click_hidden_needs_force() {
        let d = dispatcher(todo_doc());
        d.navigate("/", None).await.unwrap();
        let target = Target::new("#hiddenBtn");
        let err = d.click(&target, ClickOptions::default()).await.unwrap_err();
        assert!(matches!(err, HarnessError::NotActionable { .. }));

        let forced = ClickOptions { force: true, ..Default::default() };
        assert!(d.click(&target, forced).await.is_ok());
    }

    #[tokio::test]
    async fn test_contains_and_position() {
        let d = dispatcher(todo_doc());
        d.navigate("/", None).await.unwrap();

        let last = d.query(&Target::new("li.item").at(Position::Last), None).await.unwrap();
        assert_eq!(last[0].text, "Write tests");

        let found = d.query(&Target::new("li").containing("Learn"), None).await.unwrap();
        assert_eq!(found.len(), 1);
    }
}
