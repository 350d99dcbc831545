//! Interceptor routing, aliases and ordering policies

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use webprobe_common::{HarnessError, HarnessResult, HttpRequest, HttpResponse, Method, RuleOrdering};
use webprobe_harness::intercept::{InterceptRule, Interceptor, StaticResponse, Upstream};

/// Upstream echoing what it received
#[derive(Default)]
struct Echo {
    seen: Mutex<Vec<HttpRequest>>,
}

#[async_trait]
impl Upstream for Echo {
    async fn send(&self, request: HttpRequest) -> HarnessResult<HttpResponse> {
        self.seen.lock().push(request.clone());
        Ok(HttpResponse::json_body(200, &json!({ "path": request.path(), "live": true })))
    }
}

fn get(url: &str) -> HttpRequest {
    HttpRequest::new(Method::Get, url)
}

#[tokio::test]
async fn await_returns_only_own_alias_traffic() {
    let interceptor = Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1));
    interceptor.register(InterceptRule::get("/api").unwrap().alias("getAllKeys")).unwrap();
    interceptor.register(InterceptRule::get("/api/*").unwrap().alias("getItem")).unwrap();
    interceptor.register(InterceptRule::post("/api").unwrap().alias("postItem")).unwrap();
    let upstream = Echo::default();

    interceptor.fetch(get("http://localhost:1312/api/7"), &upstream).await.unwrap();
    interceptor
        .fetch(HttpRequest::new(Method::Post, "http://localhost:1312/api"), &upstream)
        .await
        .unwrap();
    interceptor.fetch(get("http://localhost:1312/api"), &upstream).await.unwrap();

    let keys = interceptor.wait_for("getAllKeys", None).await.unwrap();
    assert_eq!(keys.request.path(), "/api");
    assert_eq!(keys.request.method, Method::Get);
    let item = interceptor.wait_for("getItem", None).await.unwrap();
    assert_eq!(item.request.path(), "/api/7");
    let post = interceptor.wait_for("postItem", None).await.unwrap();
    assert_eq!(post.request.method, Method::Post);

    // Each exchange is handed out once
    let err = interceptor
        .wait_for("getAllKeys", Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::InterceptTimeout { .. }));
    assert!(err.is_timeout());
}

#[tokio::test]
async fn wait_resolves_when_request_arrives_later() {
    let interceptor = Arc::new(Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(2)));
    interceptor
        .register(InterceptRule::post("/calc").unwrap().alias("calcRequest"))
        .unwrap();

    let background = interceptor.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = background
            .fetch(HttpRequest::new(Method::Post, "https://web2.0calc.com/calc"), &Echo::default())
            .await;
    });

    let exchange = interceptor.wait_for("calcRequest", None).await.unwrap();
    let body = exchange.response.unwrap().json().unwrap();
    assert_eq!(body["live"], true);
    assert!(!exchange.mocked);
}

async fn serve_twice(ordering: RuleOrdering) -> Vec<String> {
    let interceptor = Interceptor::new(ordering, Duration::from_secs(1));
    interceptor
        .register(InterceptRule::get("/api").unwrap().alias("before").reply(StaticResponse::json(200, &json!({ "keys": [] }))))
        .unwrap();
    interceptor
        .register(InterceptRule::get("/api").unwrap().alias("after").reply(StaticResponse::json(200, &json!({ "keys": ["42"] }))))
        .unwrap();

    let upstream = Echo::default();
    for _ in 0..3 {
        interceptor.fetch(get("http://localhost:1312/api"), &upstream).await.unwrap();
    }
    interceptor
        .traffic()
        .into_iter()
        .map(|e| e.alias.unwrap_or_default())
        .collect()
}

#[tokio::test]
async fn ordering_policies_for_duplicate_rules() {
    assert_eq!(serve_twice(RuleOrdering::FirstMatch).await, vec!["before", "before", "before"]);
    assert_eq!(serve_twice(RuleOrdering::LastMatch).await, vec!["after", "after", "after"]);
    assert_eq!(serve_twice(RuleOrdering::Sequential).await, vec!["before", "after", "after"]);
}

#[tokio::test]
async fn times_limit_falls_back_to_network() {
    let interceptor = Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1));
    interceptor
        .register(
            InterceptRule::get("/api")
                .unwrap()
                .alias("once")
                .times(1)
                .reply(StaticResponse::json(200, &json!({ "keys": ["mocked"] }))),
        )
        .unwrap();
    let upstream = Echo::default();

    let first = interceptor.fetch(get("http://localhost:1312/api"), &upstream).await.unwrap();
    let second = interceptor.fetch(get("http://localhost:1312/api"), &upstream).await.unwrap();
    assert_eq!(first.json().unwrap()["keys"][0], "mocked");
    assert_eq!(second.json().unwrap()["live"], true);
    assert_eq!(upstream.seen.lock().len(), 1);
}

#[tokio::test]
async fn handler_strips_validation_header_before_forwarding() {
    let interceptor = Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1));
    interceptor
        .register(InterceptRule::get("**/cached/**").unwrap().alias("fresh").handler(|req| {
            req.headers_mut().remove("if-none-match");
        }))
        .unwrap();
    let upstream = Echo::default();

    let request = get("https://example.org/cached/index.html").with_header("If-None-Match", "\"abc\"");
    interceptor.fetch(request, &upstream).await.unwrap();

    let forwarded = upstream.seen.lock()[0].clone();
    assert!(forwarded.headers.get("if-none-match").is_none());
    let recorded = interceptor.exchanges_for("fresh");
    assert!(recorded[0].request.headers.get("If-None-Match").is_none());
}

#[tokio::test]
async fn forced_network_error_is_distinct_from_error_status() {
    let interceptor = Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1));
    interceptor
        .register(InterceptRule::get("/down").unwrap().alias("down").reply(StaticResponse::network_error()))
        .unwrap();
    interceptor
        .register(InterceptRule::get("/missing").unwrap().alias("missing").reply(StaticResponse::new(404)))
        .unwrap();
    let upstream = Echo::default();

    let err = interceptor.fetch(get("http://x/down"), &upstream).await.unwrap_err();
    assert!(matches!(err, HarnessError::NetworkError(_)));
    let resp = interceptor.fetch(get("http://x/missing"), &upstream).await.unwrap();
    assert_eq!(resp.status, 404);

    assert!(interceptor.wait_for("down", None).await.unwrap().is_network_error());
    assert!(!interceptor.wait_for("missing", None).await.unwrap().is_network_error());
}

#[tokio::test]
async fn delayed_reply_holds_the_request() {
    let interceptor = Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1));
    interceptor
        .register(
            InterceptRule::get("/slow")
                .unwrap()
                .reply(StaticResponse::new(204).with_delay(Duration::from_millis(80))),
        )
        .unwrap();

    let started = std::time::Instant::now();
    interceptor.fetch(get("http://x/slow"), &Echo::default()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(80));
}
