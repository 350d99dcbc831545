//! In-process simulated page
//!
//! A [`SimPage`] holds a flat element tree ([`SimDocument`]) and delegates
//! behavior to a [`SimApp`]. Event handlers run on spawned tasks, so DOM
//! updates land asynchronously just as they do in a browser, and every
//! request the app issues goes through the session's interceptor.

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use webprobe_common::{HarnessError, HarnessResult, HttpRequest, HttpResponse};

use super::selector::{Selector, SelectorTarget};
use super::{ElementState, Key, Page, PageFactory, StorageKind};
use crate::intercept::{Interceptor, Upstream};

/// 1x1 transparent PNG returned as the simulated viewport capture
const PLACEHOLDER_PNG: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

/// One element of a simulated document
#[derive(Debug, Clone, Default)]
pub struct SimElement {
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub text: String,
    /// `Some` for editable elements (inputs, textareas)
    pub value: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub visible: bool,
    parent: Option<usize>,
    handle: String,
    select_all: bool,
}

impl SimElement {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            visible: true,
            ..Default::default()
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    /// Make the element editable with an initial value
    pub fn input(mut self, value: &str) -> Self {
        self.value = Some(value.to_string());
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn set_classes(&mut self, classes: &[&str]) {
        self.classes = classes.iter().map(|c| c.to_string()).collect();
    }

    fn snapshot(&self) -> ElementState {
        ElementState {
            handle: self.handle.clone(),
            tag: self.tag.clone(),
            id: self.id.clone(),
            classes: self.classes.clone(),
            text: self.text.clone(),
            value: self.value.clone(),
            attributes: self.attributes.clone(),
            visible: self.visible,
        }
    }
}

/// Flat element tree with parent links
///
/// Handles embed the page load that produced the element, so a handle kept
/// across a navigation no longer resolves.
#[derive(Debug, Clone, Default)]
pub struct SimDocument {
    elements: Vec<SimElement>,
    load: u64,
}

impl SimDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a root-level element, returning its index
    pub fn push(&mut self, el: SimElement) -> usize {
        self.insert(None, el)
    }

    /// Append a child of `parent`, returning its index
    pub fn push_child(&mut self, parent: usize, el: SimElement) -> usize {
        self.insert(Some(parent), el)
    }

    fn insert(&mut self, parent: Option<usize>, mut el: SimElement) -> usize {
        let idx = self.elements.len();
        el.parent = parent;
        el.handle = format!("sim-{}-{}", self.load, idx);
        self.elements.push(el);
        idx
    }

    fn stamp(&mut self, load: u64) {
        self.load = load;
        for (idx, el) in self.elements.iter_mut().enumerate() {
            el.handle = format!("sim-{}-{}", load, idx);
        }
    }

    pub fn with(mut self, el: SimElement) -> Self {
        self.push(el);
        self
    }

    pub fn by_id(&mut self, id: &str) -> Option<&mut SimElement> {
        self.elements.iter_mut().find(|e| e.id.as_deref() == Some(id))
    }

    pub fn value_of(&self, id: &str) -> Option<String> {
        self.elements
            .iter()
            .find(|e| e.id.as_deref() == Some(id))
            .and_then(|e| e.value.clone())
    }

    pub fn find(&self, selector: &Selector) -> Vec<usize> {
        (0..self.elements.len())
            .filter(|&idx| selector.matches(self, idx))
            .collect()
    }

    fn by_handle(&mut self, handle: &str) -> Option<&mut SimElement> {
        self.elements.iter_mut().find(|e| e.handle == handle)
    }
}

impl SelectorTarget for SimDocument {
    fn parent(&self, idx: usize) -> Option<usize> {
        self.elements[idx].parent
    }

    fn tag(&self, idx: usize) -> &str {
        &self.elements[idx].tag
    }

    fn id(&self, idx: usize) -> Option<&str> {
        self.elements[idx].id.as_deref()
    }

    fn has_class(&self, idx: usize, class: &str) -> bool {
        self.elements[idx].classes.iter().any(|c| c == class)
    }

    fn attr(&self, idx: usize, name: &str) -> Option<&str> {
        self.elements[idx].attributes.get(name).map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct SimStorage {
    cookies: BTreeMap<String, String>,
    local: BTreeMap<String, String>,
    session: BTreeMap<String, String>,
}

struct SimShared {
    app: Arc<dyn SimApp>,
    interceptor: Arc<Interceptor>,
    upstream: Arc<dyn Upstream>,
    url: Mutex<String>,
    doc: Mutex<SimDocument>,
    storage: Mutex<SimStorage>,
    errors: Mutex<Vec<String>>,
    loads: AtomicU64,
}

/// Handle given to app callbacks
#[derive(Clone)]
pub struct SimContext {
    shared: Arc<SimShared>,
}

impl SimContext {
    pub fn url(&self) -> String {
        self.shared.url.lock().clone()
    }

    pub fn with_doc<R>(&self, f: impl FnOnce(&mut SimDocument) -> R) -> R {
        f(&mut self.shared.doc.lock())
    }

    pub fn value_of(&self, id: &str) -> Option<String> {
        self.shared.doc.lock().value_of(id)
    }

    /// Issue a request from the page; goes through the interceptor
    pub async fn fetch(&self, request: HttpRequest) -> HarnessResult<HttpResponse> {
        self.shared
            .interceptor
            .fetch(request, self.shared.upstream.as_ref())
            .await
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.shared.storage.lock().cookies.get(name).cloned()
    }

    pub fn set_cookie(&self, name: &str, value: &str) {
        self.shared.storage.lock().cookies.insert(name.into(), value.into());
    }

    pub fn storage_item(&self, kind: StorageKind, key: &str) -> Option<String> {
        let storage = self.shared.storage.lock();
        match kind {
            StorageKind::Local => storage.local.get(key).cloned(),
            StorageKind::Session => storage.session.get(key).cloned(),
        }
    }

    pub fn set_storage_item(&self, kind: StorageKind, key: &str, value: &str) {
        let mut storage = self.shared.storage.lock();
        let area = match kind {
            StorageKind::Local => &mut storage.local,
            StorageKind::Session => &mut storage.session,
        };
        area.insert(key.into(), value.into());
    }

    /// Record an uncaught exception raised by page code
    pub fn raise(&self, message: impl Into<String>) {
        self.shared.errors.lock().push(message.into());
    }

    /// Run page code in the background; an `Err` becomes an uncaught exception
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        let ctx = self.clone();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                ctx.raise(e);
            }
        });
    }
}

/// Behavior of a simulated site
#[async_trait]
pub trait SimApp: Send + Sync + 'static {
    /// Build the initial document for `url`
    fn render(&self, url: &str) -> SimDocument;

    async fn on_load(&self, _ctx: SimContext) -> Result<(), String> {
        Ok(())
    }

    async fn on_click(&self, ctx: SimContext, element: ElementState) -> Result<(), String>;

    /// Keys that are not plain text input (Enter, Escape, Tab)
    async fn on_key(&self, _ctx: SimContext, _element: ElementState, _key: Key) -> Result<(), String> {
        Ok(())
    }
}

/// A site with a fixed document and no behavior
pub struct StaticSite {
    doc: SimDocument,
}

impl StaticSite {
    pub fn new(doc: SimDocument) -> Self {
        Self { doc }
    }
}

#[async_trait]
impl SimApp for StaticSite {
    fn render(&self, _url: &str) -> SimDocument {
        self.doc.clone()
    }

    async fn on_click(&self, _ctx: SimContext, _element: ElementState) -> Result<(), String> {
        Ok(())
    }
}

/// Simulated page driven by a [`SimApp`]
pub struct SimPage {
    shared: Arc<SimShared>,
}

impl SimPage {
    pub fn new(app: Arc<dyn SimApp>, interceptor: Arc<Interceptor>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            shared: Arc::new(SimShared {
                app,
                interceptor,
                upstream,
                url: Mutex::new("about:blank".into()),
                doc: Mutex::new(SimDocument::new()),
                storage: Mutex::new(SimStorage::default()),
                errors: Mutex::new(Vec::new()),
                loads: AtomicU64::new(0),
            }),
        }
    }

    pub fn context(&self) -> SimContext {
        SimContext {
            shared: self.shared.clone(),
        }
    }

    fn load(&self, url: &str) {
        *self.shared.url.lock() = url.to_string();
        let load = self.shared.loads.fetch_add(1, Ordering::Relaxed) + 1;
        let mut doc = self.shared.app.render(url);
        doc.stamp(load);
        *self.shared.doc.lock() = doc;

        let ctx = self.context();
        let app = self.shared.app.clone();
        ctx.clone().spawn(async move { app.on_load(ctx).await });
    }

    fn stale(handle: &str) -> HarnessError {
        HarnessError::Driver(format!("stale element reference: {}", handle))
    }
}

#[async_trait]
impl Page for SimPage {
    async fn navigate(&self, url: &str) -> HarnessResult<()> {
        debug!("sim: navigate {}", url);
        self.load(url);
        Ok(())
    }

    async fn reload(&self) -> HarnessResult<()> {
        let url = self.shared.url.lock().clone();
        self.load(&url);
        Ok(())
    }

    async fn current_url(&self) -> HarnessResult<String> {
        Ok(self.shared.url.lock().clone())
    }

    async fn find_all(&self, selector: &str) -> HarnessResult<Vec<ElementState>> {
        let selector = Selector::parse(selector)?;
        let doc = self.shared.doc.lock();
        Ok(doc
            .find(&selector)
            .into_iter()
            .map(|idx| doc.elements[idx].snapshot())
            .collect())
    }

    async fn click(&self, handle: &str) -> HarnessResult<()> {
        let element = self
            .shared
            .doc
            .lock()
            .by_handle(handle)
            .map(|e| e.snapshot())
            .ok_or_else(|| Self::stale(handle))?;

        let ctx = self.context();
        let app = self.shared.app.clone();
        ctx.clone().spawn(async move { app.on_click(ctx, element).await });
        Ok(())
    }

    async fn clear(&self, handle: &str) -> HarnessResult<()> {
        let mut doc = self.shared.doc.lock();
        let el = doc.by_handle(handle).ok_or_else(|| Self::stale(handle))?;
        match el.value.as_mut() {
            Some(value) => {
                value.clear();
                Ok(())
            }
            None => Err(HarnessError::NotActionable {
                selector: handle.to_string(),
                reason: "is not editable".into(),
            }),
        }
    }

    async fn send_keys(&self, handle: &str, keys: &[Key]) -> HarnessResult<()> {
        let mut events = Vec::new();
        let snapshot = {
            let mut doc = self.shared.doc.lock();
            let el = doc.by_handle(handle).ok_or_else(|| Self::stale(handle))?;
            let multiline = el.tag.eq_ignore_ascii_case("textarea");
            let select_all = &mut el.select_all;
            let Some(value) = el.value.as_mut() else {
                return Err(HarnessError::NotActionable {
                    selector: handle.to_string(),
                    reason: "is not editable".into(),
                });
            };

            for key in keys {
                match key {
                    Key::SelectAll => *select_all = true,
                    Key::Char(c) => {
                        if std::mem::take(select_all) {
                            value.clear();
                        }
                        value.push(*c);
                    }
                    Key::Backspace | Key::Delete => {
                        if std::mem::take(select_all) {
                            value.clear();
                        } else if matches!(key, Key::Backspace) {
                            value.pop();
                        }
                    }
                    Key::Enter if multiline => value.push('\n'),
                    other => events.push(other.clone()),
                }
            }
            el.snapshot()
        };

        for key in events {
            let ctx = self.context();
            let app = self.shared.app.clone();
            let element = snapshot.clone();
            ctx.clone().spawn(async move { app.on_key(ctx, element, key).await });
        }
        Ok(())
    }

    async fn clear_cookies(&self) -> HarnessResult<()> {
        self.shared.storage.lock().cookies.clear();
        Ok(())
    }

    async fn clear_storage(&self, kind: StorageKind) -> HarnessResult<()> {
        let mut storage = self.shared.storage.lock();
        match kind {
            StorageKind::Local => storage.local.clear(),
            StorageKind::Session => storage.session.clear(),
        }
        Ok(())
    }

    async fn screenshot(&self) -> HarnessResult<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(PLACEHOLDER_PNG)
            .map_err(|e| HarnessError::Driver(e.to_string()))
    }

    async fn take_page_errors(&self) -> HarnessResult<Vec<String>> {
        Ok(std::mem::take(&mut *self.shared.errors.lock()))
    }

    async fn close(&self) -> HarnessResult<()> {
        Ok(())
    }
}

/// Opens a fresh [`SimPage`] per scenario
pub struct SimPageFactory {
    app: Arc<dyn SimApp>,
    upstream: Arc<dyn Upstream>,
}

impl SimPageFactory {
    pub fn new(app: Arc<dyn SimApp>, upstream: Arc<dyn Upstream>) -> Self {
        Self { app, upstream }
    }
}

#[async_trait]
impl PageFactory for SimPageFactory {
    async fn open(&self, interceptor: Arc<Interceptor>) -> HarnessResult<Arc<dyn Page>> {
        Ok(Arc::new(SimPage::new(
            self.app.clone(),
            interceptor,
            self.upstream.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::RejectUpstream;
    use std::time::Duration;
    use webprobe_common::RuleOrdering;

    struct Todo;

    #[async_trait]
    impl SimApp for Todo {
        fn render(&self, _url: &str) -> SimDocument {
            SimDocument::new()
                .with(SimElement::new("input").attr("data-testid", "text-input").input(""))
                .with(SimElement::new("ul").class("todo-list"))
        }

        async fn on_click(&self, _ctx: SimContext, _element: ElementState) -> Result<(), String> {
            Err("TypeError: cannot read properties of undefined".into())
        }

        async fn on_key(&self, ctx: SimContext, element: ElementState, key: Key) -> Result<(), String> {
            if key == Key::Enter {
                let title = element.value.unwrap_or_default();
                ctx.with_doc(|doc| {
                    let list = doc.find(&Selector::parse("ul.todo-list").unwrap())[0];
                    doc.push_child(list, SimElement::new("li").attr("data-testid", "todo-item").text(&title));
                });
            }
            Ok(())
        }
    }

    fn page() -> SimPage {
        let interceptor = Arc::new(Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1)));
        SimPage::new(Arc::new(Todo), interceptor, Arc::new(RejectUpstream))
    }

    #[tokio::test]
    async fn test_typing_and_enter_adds_item() {
        let page = page();
        page.navigate("https://todomvc.com/examples/react/dist/").await.unwrap();

        let input = page.find_all("[data-testid=text-input]").await.unwrap().remove(0);
        let keys: Vec<Key> = "Learn Rust".chars().map(Key::Char).chain([Key::Enter]).collect();
        page.send_keys(&input.handle, &keys).await.unwrap();

        let value = page.find_all("[data-testid=text-input]").await.unwrap()[0].value.clone();
        assert_eq!(value.as_deref(), Some("Learn Rust"));

        for _ in 0..50 {
            if !page.find_all("ul.todo-list > li").await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let items = page.find_all("[data-testid=todo-item]").await.unwrap();
        assert_eq!(items[0].text, "Learn Rust");
    }

    #[tokio::test]
    async fn test_handler_errors_become_page_errors() {
        let page = page();
        page.navigate("/").await.unwrap();
        let list = page.find_all("ul").await.unwrap().remove(0);
        page.click(&list.handle).await.unwrap();

        let mut errors = Vec::new();
        for _ in 0..50 {
            errors.extend(page.take_page_errors().await.unwrap());
            if !errors.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("TypeError"));
    }

    #[tokio::test]
    async fn test_select_all_replaces_value() {
        let page = page();
        page.navigate("/").await.unwrap();
        let input = page.find_all("input").await.unwrap().remove(0);
        page.send_keys(&input.handle, &[Key::Char('a'), Key::Char('b')]).await.unwrap();
        page.send_keys(&input.handle, &[Key::SelectAll, Key::Char('z')]).await.unwrap();
        let value = page.find_all("input").await.unwrap()[0].value.clone();
        assert_eq!(value.as_deref(), Some("z"));
    }

    #[tokio::test]
    async fn test_stale_handle_after_navigation() {
        let page = page();
        page.navigate("/").await.unwrap();
        let before = page.find_all("input").await.unwrap().remove(0);
        page.send_keys(&before.handle, &[Key::Char('a')]).await.unwrap();

        page.reload().await.unwrap();
        let after = page.find_all("input").await.unwrap().remove(0);
        assert_ne!(before.handle, after.handle);
        let err = page.send_keys(&before.handle, &[Key::Char('b')]).await.unwrap_err();
        assert!(matches!(err, HarnessError::Driver(msg) if msg.contains("stale")));
        assert!(page.click(&before.handle).await.is_err());
        assert_eq!(after.value.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_unknown_handle_and_screenshot() {
        let page = page();
        page.navigate("/").await.unwrap();
        assert!(page.click("sim-99").await.is_err());
        assert!(page.screenshot().await.unwrap().starts_with(&[0x89, b'P', b'N', b'G']));
    }
}
