//! W3C WebDriver page driver
//!
//! Drives a real browser through a WebDriver server (chromedriver,
//! geckodriver, Selenium). The browser is configured to send its traffic
//! through an [`InterceptProxy`] bound to the session's interceptor.

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use webprobe_common::{HarnessConfig, HarnessError, HarnessResult};

use super::{ElementState, Key, Page, PageFactory, StorageKind};
use crate::intercept::{Interceptor, Upstream};
use crate::proxy::InterceptProxy;

/// JSON key identifying a web element reference
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Installs a collector for uncaught exceptions on the current document
const ERROR_COLLECTOR: &str = r#"
if (!window.__webprobeErrors) {
  window.__webprobeErrors = [];
  window.addEventListener('error', function (e) {
    window.__webprobeErrors.push(String(e.message || e));
  });
  window.addEventListener('unhandledrejection', function (e) {
    window.__webprobeErrors.push('Unhandled rejection: ' + String(e.reason));
  });
}
"#;

const DRAIN_ERRORS: &str = r#"
const errors = window.__webprobeErrors || [];
window.__webprobeErrors = [];
return errors;
"#;

const QUERY_ELEMENTS: &str = r#"
const editable = ['INPUT', 'TEXTAREA', 'SELECT'];
return Array.from(document.querySelectorAll(arguments[0])).map(function (el) {
  const style = window.getComputedStyle(el);
  const boxed = el.offsetWidth > 0 || el.offsetHeight > 0 || el.getClientRects().length > 0;
  const attributes = {};
  for (const a of Array.from(el.attributes)) { attributes[a.name] = a.value; }
  return {
    el: el,
    tag: el.tagName.toLowerCase(),
    id: el.id || null,
    classes: Array.from(el.classList),
    text: el.innerText !== undefined ? el.innerText : (el.textContent || ''),
    value: editable.includes(el.tagName) ? el.value : null,
    attributes: attributes,
    visible: boxed && style.visibility !== 'hidden' && style.display !== 'none'
  };
});
"#;

#[derive(Debug, Deserialize)]
struct RawElement {
    el: Value,
    tag: String,
    id: Option<String>,
    #[serde(default)]
    classes: Vec<String>,
    #[serde(default)]
    text: String,
    value: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    visible: bool,
}

impl RawElement {
    fn into_state(self) -> HarnessResult<ElementState> {
        let handle = self
            .el
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| HarnessError::Driver("script returned a non-element".into()))?
            .to_string();
        Ok(ElementState {
            handle,
            tag: self.tag,
            id: self.id,
            classes: self.classes,
            text: self.text,
            value: self.value,
            attributes: self.attributes,
            visible: self.visible,
        })
    }
}

/// Encode keystrokes as a WebDriver `value` text payload
fn encode_keys(keys: &[Key]) -> String {
    let mut text = String::new();
    for key in keys {
        match key {
            Key::Char(c) => text.push(*c),
            Key::Enter => text.push('\u{E007}'),
            Key::Backspace => text.push('\u{E003}'),
            Key::Delete => text.push('\u{E017}'),
            Key::Escape => text.push('\u{E00C}'),
            Key::Tab => text.push('\u{E004}'),
            // Control down, 'a', release modifiers
            Key::SelectAll => text.push_str("\u{E009}a\u{E000}"),
        }
    }
    text
}

/// Map a WebDriver error payload onto the harness taxonomy
fn map_error(status: u16, value: &Value) -> HarnessError {
    let code = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
    match code {
        "element not interactable" | "element click intercepted" => HarnessError::NotActionable {
            selector: String::new(),
            reason: message.to_string(),
        },
        "invalid selector" | "invalid argument" => HarnessError::InvalidInput(message.to_string()),
        _ => HarnessError::Driver(format!("{} ({}): {}", code, status, message)),
    }
}

struct Session {
    http: reqwest::Client,
    base: String,
}

impl Session {
    async fn request(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> HarnessResult<Value> {
        let url = format!("{}{}", self.base, path);
        let mut req = self.http.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let payload: Value = resp.json().await?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);
        if status >= 400 {
            return Err(map_error(status, &value));
        }
        Ok(value)
    }

    async fn post(&self, path: &str, body: Value) -> HarnessResult<Value> {
        self.request(reqwest::Method::POST, path, Some(body)).await
    }

    async fn get(&self, path: &str) -> HarnessResult<Value> {
        self.request(reqwest::Method::GET, path, None).await
    }

    async fn delete(&self, path: &str) -> HarnessResult<Value> {
        self.request(reqwest::Method::DELETE, path, None).await
    }

    async fn execute(&self, script: &str, args: Vec<Value>) -> HarnessResult<Value> {
        self.post("/execute/sync", json!({ "script": script, "args": args })).await
    }
}

/// A browser session driven over WebDriver
pub struct WebDriverPage {
    session: Session,
    proxy: Mutex<Option<InterceptProxy>>,
}

impl WebDriverPage {
    /// Create a browser session proxied through `proxy`
    pub async fn connect(config: &HarnessConfig, proxy: InterceptProxy) -> HarnessResult<Self> {
        let http = reqwest::Client::new();
        let wd = &config.webdriver;
        let proxy_addr = proxy.proxy_address();

        let mut chrome_args = vec![
            format!("--window-size={},{}", config.viewport_width, config.viewport_height),
            "--proxy-bypass-list=<-loopback>".to_string(),
        ];
        let mut firefox_args = Vec::new();
        if wd.headless {
            chrome_args.push("--headless=new".to_string());
            firefox_args.push("-headless".to_string());
        }

        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": wd.browser,
                    "acceptInsecureCerts": true,
                    "proxy": {
                        "proxyType": "manual",
                        "httpProxy": proxy_addr,
                        "sslProxy": proxy_addr,
                    },
                    "goog:chromeOptions": { "args": chrome_args },
                    "moz:firefoxOptions": { "args": firefox_args },
                }
            }
        });

        let endpoint = format!("{}/session", wd.url.trim_end_matches('/'));
        let resp = http.post(&endpoint).json(&capabilities).send().await?;
        let status = resp.status().as_u16();
        let payload: Value = resp.json().await?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);
        if status >= 400 {
            return Err(map_error(status, &value));
        }
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| HarnessError::Driver("new session response without sessionId".into()))?;

        info!("WebDriver session {} ({}) via proxy {}", session_id, wd.browser, proxy_addr);
        let page = Self {
            session: Session {
                http,
                base: format!("{}/{}", endpoint, session_id),
            },
            proxy: Mutex::new(Some(proxy)),
        };

        page.session
            .post("/timeouts", json!({ "pageLoad": config.page_load_timeout_ms }))
            .await?;
        if let Err(e) = page
            .session
            .post(
                "/window/rect",
                json!({ "width": config.viewport_width, "height": config.viewport_height }),
            )
            .await
        {
            debug!("Window resize not supported: {}", e);
        }
        Ok(page)
    }

    async fn install_error_collector(&self) -> HarnessResult<()> {
        self.session.execute(ERROR_COLLECTOR, vec![]).await.map(|_| ())
    }
}

#[async_trait]
impl Page for WebDriverPage {
    async fn navigate(&self, url: &str) -> HarnessResult<()> {
        self.session.post("/url", json!({ "url": url })).await?;
        self.install_error_collector().await
    }

    async fn reload(&self) -> HarnessResult<()> {
        self.session.post("/refresh", json!({})).await?;
        self.install_error_collector().await
    }

    async fn current_url(&self) -> HarnessResult<String> {
        let value = self.session.get("/url").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn find_all(&self, selector: &str) -> HarnessResult<Vec<ElementState>> {
        let value = self.session.execute(QUERY_ELEMENTS, vec![json!(selector)]).await?;
        let raw: Vec<RawElement> = serde_json::from_value(value)?;
        raw.into_iter().map(RawElement::into_state).collect()
    }

    async fn click(&self, handle: &str) -> HarnessResult<()> {
        self.session
            .post(&format!("/element/{}/click", handle), json!({}))
            .await
            .map(|_| ())
    }

    async fn clear(&self, handle: &str) -> HarnessResult<()> {
        self.session
            .post(&format!("/element/{}/clear", handle), json!({}))
            .await
            .map(|_| ())
    }

    async fn send_keys(&self, handle: &str, keys: &[Key]) -> HarnessResult<()> {
        self.session
            .post(&format!("/element/{}/value", handle), json!({ "text": encode_keys(keys) }))
            .await
            .map(|_| ())
    }

    async fn clear_cookies(&self) -> HarnessResult<()> {
        self.session.delete("/cookie").await.map(|_| ())
    }

    async fn clear_storage(&self, kind: StorageKind) -> HarnessResult<()> {
        self.session
            .execute("window[arguments[0]].clear();", vec![json!(kind.js_name())])
            .await
            .map(|_| ())
    }

    async fn screenshot(&self) -> HarnessResult<Vec<u8>> {
        let value = self.session.get("/screenshot").await?;
        let encoded = value.as_str().unwrap_or_default();
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| HarnessError::Driver(format!("invalid screenshot payload: {}", e)))
    }

    async fn take_page_errors(&self) -> HarnessResult<Vec<String>> {
        let value = self.session.execute(DRAIN_ERRORS, vec![]).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    async fn close(&self) -> HarnessResult<()> {
        let result = self.session.delete("").await.map(|_| ());
        let proxy = self.proxy.lock().take();
        if let Some(proxy) = proxy {
            proxy.stop().await;
        }
        result
    }
}

/// Opens a proxied browser session per scenario
pub struct WebDriverFactory {
    config: Arc<HarnessConfig>,
    upstream: Arc<dyn Upstream>,
}

impl WebDriverFactory {
    pub fn new(config: Arc<HarnessConfig>, upstream: Arc<dyn Upstream>) -> Self {
        Self { config, upstream }
    }
}

#[async_trait]
impl PageFactory for WebDriverFactory {
    async fn open(&self, interceptor: Arc<Interceptor>) -> HarnessResult<Arc<dyn Page>> {
        let proxy = InterceptProxy::start(
            &self.config.webdriver.proxy_listen,
            interceptor,
            self.upstream.clone(),
        )
        .await?;
        match WebDriverPage::connect(&self.config, proxy).await {
            Ok(page) => Ok(Arc::new(page)),
            Err(e) => {
                warn!("Failed to open WebDriver session at {}: {}", self.config.webdriver.url, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_special_keys() {
        let keys = [Key::SelectAll, Key::Char('4'), Key::Char('2'), Key::Enter];
        assert_eq!(encode_keys(&keys), "\u{E009}a\u{E000}42\u{E007}");
        assert_eq!(encode_keys(&[Key::Backspace, Key::Escape]), "\u{E003}\u{E00C}");
    }

    #[test]
    fn test_raw_element_conversion() {
        let raw: RawElement = serde_json::from_value(json!({
            "el": { ELEMENT_KEY: "f.1.e.7" },
            "tag": "button",
            "id": "submitBtn",
            "classes": ["primary"],
            "text": "Submit",
            "value": null,
            "attributes": { "id": "submitBtn", "type": "button" },
            "visible": true
        }))
        .unwrap();
        let state = raw.into_state().unwrap();
        assert_eq!(state.handle, "f.1.e.7");
        assert_eq!(state.attr("type"), Some("button"));
    }

    #[test]
    fn test_error_mapping() {
        let err = map_error(400, &json!({ "error": "element not interactable", "message": "covered" }));
        assert!(matches!(err, HarnessError::NotActionable { .. }));

        let err = map_error(404, &json!({ "error": "no such window", "message": "closed" }));
        assert_eq!(err.kind(), "Driver");
    }
}
