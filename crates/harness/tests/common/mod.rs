//! Simulated "Node Cache API GUI" and its in-memory backend
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use webprobe_common::{HarnessConfig, HarnessResult, HttpRequest, HttpResponse, Method, RuleOrdering};
use webprobe_harness::intercept::{Interceptor, Upstream};
use webprobe_harness::page::sim::{SimApp, SimContext, SimDocument, SimElement, SimPage};
use webprobe_harness::page::{ElementState, Key};
use webprobe_harness::{CommandRegistry, Session};

pub const GUI_URL: &str = "http://localhost:1312";
pub const API_URL: &str = "http://localhost:1312/api";

/// Key-value cache answering the GUI's REST calls
#[derive(Default)]
pub struct MemoryCache {
    items: Mutex<BTreeMap<String, Value>>,
    next_key: Mutex<u64>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            next_key: Mutex::new(1718),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }
}

#[async_trait]
impl Upstream for MemoryCache {
    async fn send(&self, request: HttpRequest) -> HarnessResult<HttpResponse> {
        let path = request.path();
        let key = path.strip_prefix("/api/").map(str::to_string);

        let response = match (request.method, key) {
            (Method::Get, None) => {
                let keys: Vec<String> = self.items.lock().keys().cloned().collect();
                HttpResponse::json_body(200, &json!({ "keys": keys }))
            }
            (Method::Post, None) => {
                let data = request.json()?;
                let key = {
                    let mut next = self.next_key.lock();
                    *next += 1;
                    next.to_string()
                };
                self.items.lock().insert(key.clone(), data);
                HttpResponse::json_body(201, &json!({ "key": key }))
            }
            (Method::Delete, None) => {
                self.items.lock().clear();
                HttpResponse::json_body(200, &json!({ "message": "Cache cleared" }))
            }
            (Method::Get, Some(key)) => match self.items.lock().get(&key) {
                Some(data) => HttpResponse::json_body(200, &json!({ "key": key, "data": data })),
                None => HttpResponse::json_body(404, &json!({ "error": "Key not found" })),
            },
            _ => HttpResponse::json_body(405, &json!({ "error": "Method not allowed" })),
        };
        Ok(response)
    }
}

/// Single-page GUI over the cache API
pub struct CacheGui;

fn show(ctx: &SimContext, id: &str, class: &str, text: &str) {
    ctx.with_doc(|doc| {
        if let Some(el) = doc.by_id(id) {
            el.text = text.to_string();
            el.set_classes(&["response", class]);
            el.visible = true;
        }
    });
}

fn set_value(ctx: &SimContext, id: &str, value: &str) {
    ctx.with_doc(|doc| {
        if let Some(el) = doc.by_id(id) {
            el.value = Some(value.to_string());
        }
    });
}

impl CacheGui {
    async fn fetch_keys(ctx: &SimContext) -> Result<(), String> {
        let resp = ctx
            .fetch(HttpRequest::new(Method::Get, API_URL))
            .await
            .map_err(|e| e.to_string())?;
        let body = resp.json().map_err(|e| e.to_string())?;
        let keys: Vec<String> = body["keys"]
            .as_array()
            .ok_or("keys missing from response")?
            .iter()
            .filter_map(|k| k.as_str().map(String::from))
            .collect();
        if keys.is_empty() {
            show(ctx, "keysResponse", "success", "Cache is empty 🗑️");
        } else {
            let text = format!("Found {} keys: {}", keys.len(), keys.join(", "));
            show(ctx, "keysResponse", "success", &text);
        }
        Ok(())
    }

    async fn create_item(ctx: &SimContext) -> Result<(), String> {
        let raw = ctx.value_of("postData").unwrap_or_default();
        if raw.trim().is_empty() {
            show(ctx, "postResponse", "error", "Please enter JSON data");
            return Ok(());
        }
        let data: Value = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(e) => {
                show(ctx, "postResponse", "error", &format!("Invalid JSON: {}", e));
                return Ok(());
            }
        };

        let resp = ctx
            .fetch(HttpRequest::new(Method::Post, API_URL).with_json(&data))
            .await
            .map_err(|e| e.to_string())?;
        let body = resp.json().map_err(|e| e.to_string())?;
        let key = body["key"].as_str().unwrap_or_default().to_string();
        show(
            ctx,
            "postResponse",
            "success",
            &format!("Item created successfully! Generated key: {}", key),
        );
        set_value(ctx, "postData", "");
        Self::fetch_keys(ctx).await
    }

    async fn fetch_item(ctx: &SimContext) -> Result<(), String> {
        let key = ctx.value_of("getKey").unwrap_or_default();
        if key.trim().is_empty() {
            show(ctx, "getResponse", "error", "Please enter a key");
            return Ok(());
        }
        let resp = ctx
            .fetch(HttpRequest::new(Method::Get, format!("{}/{}", API_URL, key.trim())))
            .await
            .map_err(|e| e.to_string())?;
        if resp.status == 404 {
            show(ctx, "getResponse", "error", "Key not found");
            return Ok(());
        }
        let body = resp.json().map_err(|e| e.to_string())?;
        show(
            ctx,
            "getResponse",
            "success",
            &format!("Retrieved data for key: {} {}", key.trim(), body["data"]),
        );
        Ok(())
    }

    async fn clear_cache(ctx: &SimContext) -> Result<(), String> {
        ctx.fetch(HttpRequest::new(Method::Delete, API_URL))
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[async_trait]
impl SimApp for CacheGui {
    fn render(&self, _url: &str) -> SimDocument {
        SimDocument::new()
            .with(SimElement::new("h1").text("Cache API Interface"))
            .with(SimElement::new("button").text("Clear Cache"))
            .with(SimElement::new("button").text("Fetch All Keys"))
            .with(SimElement::new("div").id("keysResponse").class("response").hidden())
            .with(SimElement::new("textarea").id("postData").input(""))
            .with(SimElement::new("button").text("Create Item"))
            .with(SimElement::new("div").id("postResponse").class("response").hidden())
            .with(SimElement::new("input").id("getKey").input(""))
            .with(SimElement::new("button").text("Fetch Item"))
            .with(SimElement::new("div").id("getResponse").class("response").hidden())
            .with(SimElement::new("button").text("Crash"))
    }

    async fn on_click(&self, ctx: SimContext, element: ElementState) -> Result<(), String> {
        match element.text.as_str() {
            "Fetch All Keys" => Self::fetch_keys(&ctx).await,
            "Create Item" => Self::create_item(&ctx).await,
            "Fetch Item" => Self::fetch_item(&ctx).await,
            "Clear Cache" => Self::clear_cache(&ctx).await,
            "Crash" => Err("TypeError: Cannot read properties of undefined (reading 'map')".into()),
            _ => Ok(()),
        }
    }

    async fn on_key(&self, ctx: SimContext, element: ElementState, key: Key) -> Result<(), String> {
        match (element.id.as_deref(), key) {
            (Some("getKey"), Key::Enter) => Self::fetch_item(&ctx).await,
            _ => Ok(()),
        }
    }
}

pub fn config() -> HarnessConfig {
    let mut config = HarnessConfig {
        base_url: GUI_URL.to_string(),
        default_command_timeout_ms: 2_000,
        intercept_timeout_ms: 2_000,
        poll_interval_ms: 10,
        screenshot_on_failure: false,
        ..Default::default()
    };
    config.env.insert("GUI_URL".into(), GUI_URL.into());
    config.env.insert("API_BASE_URL".into(), API_URL.into());
    config
}

/// Session on a fresh GUI page backed by `upstream`
pub fn session(upstream: Arc<dyn Upstream>) -> Session {
    session_with(config(), upstream)
}

pub fn session_with(config: HarnessConfig, upstream: Arc<dyn Upstream>) -> Session {
    let interceptor = Arc::new(Interceptor::new(
        RuleOrdering::FirstMatch,
        Duration::from_millis(config.intercept_timeout_ms),
    ));
    let page = SimPage::new(Arc::new(CacheGui), interceptor.clone(), upstream);
    let registry = Arc::new(CommandRegistry::with_builtins().expect("builtins register"));
    Session::new(Arc::new(config), registry, Arc::new(page), interceptor)
}
