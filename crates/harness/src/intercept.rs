//! Network interception
//!
//! Rules are matched against every request the page issues. A matching
//! rule may pass the request through untouched, answer it with a static
//! payload, or hand it to a callback that rewrites it or replies itself.
//! Every completed exchange is recorded, and exchanges of aliased rules
//! can be awaited one by one.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use webprobe_common::{
    HarnessError, HarnessResult, Headers, HttpRequest, HttpResponse, Method, RecordedExchange,
    RuleOrdering,
};

/// URL matcher of an intercept rule
#[derive(Clone)]
pub enum UrlPattern {
    /// Matches when the request path, or the full URL, equals the literal
    Literal(String),
    /// `*` matches within a path segment, `**` across segments
    Glob { source: String, regex: Regex },
    /// Regular expression searched in the full URL (`re:` prefix)
    Regex(Regex),
}

impl UrlPattern {
    pub fn parse(pattern: &str) -> HarnessResult<Self> {
        if let Some(re) = pattern.strip_prefix("re:") {
            let regex = Regex::new(re)
                .map_err(|e| HarnessError::InvalidInput(format!("invalid URL regex '{}': {}", re, e)))?;
            return Ok(UrlPattern::Regex(regex));
        }
        if pattern.contains('*') {
            return Ok(UrlPattern::Glob {
                source: pattern.to_string(),
                regex: glob_to_regex(pattern)?,
            });
        }
        Ok(UrlPattern::Literal(pattern.to_string()))
    }

    pub fn source(&self) -> &str {
        match self {
            UrlPattern::Literal(s) => s,
            UrlPattern::Glob { source, .. } => source,
            UrlPattern::Regex(r) => r.as_str(),
        }
    }

    pub fn matches(&self, request: &HttpRequest) -> bool {
        let url = request.url.split('#').next().unwrap_or_default();
        let without_query = url.split('?').next().unwrap_or_default();
        match self {
            UrlPattern::Literal(lit) => {
                url == lit || without_query == lit || request.path() == *lit
            }
            UrlPattern::Glob { regex, .. } => {
                regex.is_match(url) || regex.is_match(without_query) || regex.is_match(&request.path())
            }
            UrlPattern::Regex(regex) => regex.is_match(url),
        }
    }
}

impl fmt::Debug for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UrlPattern({})", self.source())
    }
}

impl PartialEq for UrlPattern {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other) && self.source() == other.source()
    }
}

fn glob_to_regex(glob: &str) -> HarnessResult<Regex> {
    let mut re = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '*' {
            if chars.peek() == Some(&'*') {
                chars.next();
                re.push_str(".*");
            } else {
                re.push_str("[^/]*");
            }
        } else {
            re.push_str(&regex::escape(&c.to_string()));
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| HarnessError::InvalidInput(format!("invalid URL glob '{}': {}", glob, e)))
}

/// A synthetic response
#[derive(Debug, Clone, PartialEq)]
pub struct StaticResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
    pub delay: Option<Duration>,
    /// Fail at transport level instead of answering
    pub force_network_error: bool,
}

impl StaticResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            delay: None,
            force_network_error: false,
        }
    }

    pub fn json(status: u16, body: &Value) -> Self {
        let mut resp = Self::new(status);
        resp.headers.set("content-type", "application/json");
        resp.body = Bytes::from(body.to_string());
        resp
    }

    pub fn network_error() -> Self {
        Self {
            force_network_error: true,
            ..Self::new(0)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(name, value);
        self
    }

    fn to_response(&self) -> HttpResponse {
        HttpResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Live request handed to a rule callback
#[derive(Debug)]
pub struct InterceptedRequest {
    pub request: HttpRequest,
    reply: Option<StaticResponse>,
}

impl InterceptedRequest {
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.request.headers
    }

    /// Answer the request instead of forwarding it
    pub fn reply(&mut self, response: StaticResponse) {
        self.reply = Some(response);
    }
}

pub type RequestHandler = Arc<dyn Fn(&mut InterceptedRequest) + Send + Sync>;

/// What a matching rule does with the request
#[derive(Clone, Default)]
pub enum Responder {
    /// Forward unmodified; the exchange is still recorded
    #[default]
    PassThrough,
    Static(StaticResponse),
    Handler(RequestHandler),
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Responder::PassThrough => f.write_str("PassThrough"),
            Responder::Static(r) => write!(f, "Static({})", r.status),
            Responder::Handler(_) => f.write_str("Handler"),
        }
    }
}

/// An interception rule
#[derive(Debug, Clone)]
pub struct InterceptRule {
    /// `None` matches any method
    pub method: Option<Method>,
    pub pattern: UrlPattern,
    pub responder: Responder,
    pub alias: Option<String>,
    /// Maximum number of requests this rule serves
    pub times: Option<usize>,
}

impl InterceptRule {
    pub fn new(method: Option<Method>, pattern: UrlPattern) -> Self {
        Self {
            method,
            pattern,
            responder: Responder::PassThrough,
            alias: None,
            times: None,
        }
    }

    pub fn get(pattern: &str) -> HarnessResult<Self> {
        Ok(Self::new(Some(Method::Get), UrlPattern::parse(pattern)?))
    }

    pub fn post(pattern: &str) -> HarnessResult<Self> {
        Ok(Self::new(Some(Method::Post), UrlPattern::parse(pattern)?))
    }

    pub fn any(pattern: &str) -> HarnessResult<Self> {
        Ok(Self::new(None, UrlPattern::parse(pattern)?))
    }

    pub fn reply(mut self, response: StaticResponse) -> Self {
        self.responder = Responder::Static(response);
        self
    }

    pub fn handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut InterceptedRequest) + Send + Sync + 'static,
    {
        self.responder = Responder::Handler(Arc::new(f));
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.times = Some(n);
        self
    }

    fn matches(&self, request: &HttpRequest) -> bool {
        self.method.map_or(true, |m| m == request.method) && self.pattern.matches(request)
    }

    fn same_target(&self, other: &InterceptRule) -> bool {
        self.method == other.method && self.pattern == other.pattern
    }
}

/// Where passed-through requests go
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Errors are transport failures and surface as `NetworkError`
    async fn send(&self, request: HttpRequest) -> HarnessResult<HttpResponse>;
}

/// Live network via reqwest
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new() -> HarnessResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, request: HttpRequest) -> HarnessResult<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| HarnessError::InvalidInput(e.to_string()))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        let resp = builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| HarnessError::NetworkError(e.to_string()))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect::<Headers>();
        let body = resp
            .bytes()
            .await
            .map_err(|e| HarnessError::NetworkError(e.to_string()))?;

        Ok(HttpResponse { status, headers, body })
    }
}

/// Upstream that refuses every request; for fully mocked sessions
pub struct RejectUpstream;

#[async_trait]
impl Upstream for RejectUpstream {
    async fn send(&self, request: HttpRequest) -> HarnessResult<HttpResponse> {
        Err(HarnessError::NetworkError(format!(
            "no upstream configured for {} {}",
            request.method, request.url
        )))
    }
}

struct RuleEntry {
    rule: InterceptRule,
    hits: usize,
}

impl RuleEntry {
    fn exhausted(&self) -> bool {
        self.rule.times.map_or(false, |t| self.hits >= t)
    }
}

#[derive(Default)]
struct AliasLog {
    exchanges: Vec<RecordedExchange>,
    /// Exchanges already handed out by `wait_for`
    awaited: usize,
}

#[derive(Default)]
struct InterceptState {
    rules: Vec<RuleEntry>,
    aliases: HashMap<String, AliasLog>,
    traffic: Vec<RecordedExchange>,
    anonymous: usize,
}

/// Per-session network interceptor
pub struct Interceptor {
    state: Mutex<InterceptState>,
    /// Bumped on every recorded exchange
    events: watch::Sender<u64>,
    ordering: RuleOrdering,
    default_timeout: Duration,
}

impl Interceptor {
    pub fn new(ordering: RuleOrdering, default_timeout: Duration) -> Self {
        let (events, _) = watch::channel(0);
        Self {
            state: Mutex::new(InterceptState::default()),
            events,
            ordering,
            default_timeout,
        }
    }

    /// Register a rule, returning its alias (generated when absent)
    pub fn register(&self, mut rule: InterceptRule) -> HarnessResult<String> {
        let mut state = self.state.lock();
        let alias = match rule.alias.clone() {
            Some(alias) => {
                if state.aliases.contains_key(&alias) {
                    return Err(HarnessError::DuplicateAlias(alias));
                }
                alias
            }
            None => {
                state.anonymous += 1;
                format!("intercept-{}", state.anonymous)
            }
        };

        debug!(
            "Registered intercept @{} {} {}",
            alias,
            rule.method.map(|m| m.as_str()).unwrap_or("*"),
            rule.pattern.source()
        );
        rule.alias = Some(alias.clone());
        state.aliases.insert(alias.clone(), AliasLog::default());
        state.rules.push(RuleEntry { rule, hits: 0 });
        Ok(alias)
    }

    /// Pick the rule serving `request` under the ordering policy and count the hit
    fn select(&self, request: &HttpRequest) -> Option<InterceptRule> {
        let mut state = self.state.lock();
        let rules = &state.rules;
        let live = |i: usize| !rules[i].exhausted() && rules[i].rule.matches(request);

        let chosen = match self.ordering {
            RuleOrdering::FirstMatch => (0..rules.len()).find(|&i| live(i)),
            RuleOrdering::LastMatch => (0..rules.len()).rev().find(|&i| live(i)),
            RuleOrdering::Sequential => (0..rules.len()).find(|&i| {
                if !live(i) {
                    return false;
                }
                // A used rule yields to a later live rule on the same target
                let superseded = rules[i].hits > 0
                    && rules[i + 1..]
                        .iter()
                        .any(|later| !later.exhausted() && later.rule.same_target(&rules[i].rule));
                !superseded
            }),
        };

        chosen.map(|i| {
            state.rules[i].hits += 1;
            state.rules[i].rule.clone()
        })
    }

    /// Route a page request through the rules
    pub async fn fetch(&self, request: HttpRequest, upstream: &dyn Upstream) -> HarnessResult<HttpResponse> {
        let started_at = Utc::now();
        let started = Instant::now();
        let rule = self.select(&request);
        let alias = rule.as_ref().and_then(|r| r.alias.clone());
        trace!("{} {} -> {:?}", request.method, request.url, alias);

        let mut request = request;
        let mut mocked = false;
        let outcome = match rule.map(|r| r.responder).unwrap_or_default() {
            Responder::PassThrough => upstream.send(request.clone()).await,
            Responder::Static(resp) => {
                mocked = true;
                synthesize(&resp).await
            }
            Responder::Handler(handler) => {
                let mut live = InterceptedRequest {
                    request,
                    reply: None,
                };
                handler(&mut live);
                request = live.request;
                match live.reply {
                    Some(resp) => {
                        mocked = true;
                        synthesize(&resp).await
                    }
                    None => upstream.send(request.clone()).await,
                }
            }
        };

        let (response, error) = match &outcome {
            Ok(resp) => (Some(resp.clone()), None),
            Err(e) => (None, Some(e.to_string())),
        };
        self.record(RecordedExchange {
            alias,
            request,
            response,
            error,
            mocked,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        });

        outcome.map_err(|e| match e {
            HarnessError::NetworkError(_) => e,
            other => HarnessError::NetworkError(other.to_string()),
        })
    }

    fn record(&self, exchange: RecordedExchange) {
        {
            let mut state = self.state.lock();
            if let Some(alias) = &exchange.alias {
                if let Some(log) = state.aliases.get_mut(alias) {
                    log.exchanges.push(exchange.clone());
                }
            }
            state.traffic.push(exchange);
        }
        self.events.send_modify(|generation| *generation += 1);
    }

    /// Wait for the next not-yet-awaited exchange of `alias`
    pub async fn wait_for(&self, alias: &str, timeout: Option<Duration>) -> HarnessResult<RecordedExchange> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let mut changes = self.events.subscribe();

        loop {
            {
                let mut state = self.state.lock();
                let log = state
                    .aliases
                    .get_mut(alias)
                    .ok_or_else(|| HarnessError::UnknownAlias(alias.to_string()))?;
                if log.awaited < log.exchanges.len() {
                    let exchange = log.exchanges[log.awaited].clone();
                    log.awaited += 1;
                    return Ok(exchange);
                }
            }

            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(_) => continue,
                Err(_) => {
                    return Err(HarnessError::InterceptTimeout {
                        alias: alias.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
        }
    }

    /// Every exchange seen by this session, in completion order
    pub fn traffic(&self) -> Vec<RecordedExchange> {
        self.state.lock().traffic.clone()
    }

    pub fn exchanges_for(&self, alias: &str) -> Vec<RecordedExchange> {
        self.state
            .lock()
            .aliases
            .get(alias)
            .map(|log| log.exchanges.clone())
            .unwrap_or_default()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.state.lock().aliases.keys().cloned().collect()
    }
}

async fn synthesize(resp: &StaticResponse) -> HarnessResult<HttpResponse> {
    if let Some(delay) = resp.delay {
        tokio::time::sleep(delay).await;
    }
    if resp.force_network_error {
        return Err(HarnessError::NetworkError("forced network error".into()));
    }
    Ok(resp.to_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case("/calc", "https://web2.0calc.com/calc", true ; "literal path")]
    #[test_case("/calc", "https://web2.0calc.com/calc?x=1", true ; "literal ignores query")]
    #[test_case("/api", "http://localhost:1312/api/42", false ; "literal is not prefix")]
    #[test_case("/api/*", "http://localhost:1312/api/42", true ; "glob segment")]
    #[test_case("/api/*", "http://localhost:1312/api/42/meta", false ; "glob stays in segment")]
    #[test_case("**/api/**", "http://localhost:1312/api/42/meta", true ; "double star")]
    #[test_case("re:/api/\\d+$", "http://localhost:1312/api/42", true ; "regex")]
    #[test_case("http://localhost:1312/api", "http://localhost:1312/api", true ; "full url")]
    fn test_url_patterns(pattern: &str, url: &str, expected: bool) {
        let req = HttpRequest::new(Method::Get, url);
        assert_eq!(UrlPattern::parse(pattern).unwrap().matches(&req), expected);
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let interceptor = Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1));
        interceptor.register(InterceptRule::get("/api").unwrap().alias("getAllKeys")).unwrap();
        let err = interceptor
            .register(InterceptRule::post("/api").unwrap().alias("getAllKeys"))
            .unwrap_err();
        assert!(matches!(err, HarnessError::DuplicateAlias(a) if a == "getAllKeys"));
    }

    #[test]
    fn test_generated_aliases() {
        let interceptor = Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1));
        let a = interceptor.register(InterceptRule::any("/calc").unwrap()).unwrap();
        let b = interceptor.register(InterceptRule::any("/calc").unwrap()).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_static_reply_is_recorded_as_mocked() {
        let interceptor = Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1));
        interceptor
            .register(
                InterceptRule::post("/api")
                    .unwrap()
                    .alias("createItem")
                    .reply(StaticResponse::json(201, &json!({ "key": "42" }))),
            )
            .unwrap();

        let req = HttpRequest::new(Method::Post, "http://localhost:1312/api").with_json(&json!({ "a": 1 }));
        let resp = interceptor.fetch(req, &RejectUpstream).await.unwrap();
        assert_eq!(resp.status, 201);

        let exchange = interceptor.wait_for("createItem", None).await.unwrap();
        assert!(exchange.mocked);
        assert_eq!(exchange.request.json().unwrap()["a"], 1);
    }

    #[tokio::test]
    async fn test_unmatched_traffic_is_logged_without_alias() {
        let interceptor = Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1));
        let req = HttpRequest::new(Method::Get, "http://localhost:1312/favicon.ico");
        assert!(interceptor.fetch(req, &RejectUpstream).await.is_err());

        let traffic = interceptor.traffic();
        assert_eq!(traffic.len(), 1);
        assert!(traffic[0].alias.is_none());
        assert!(traffic[0].is_network_error());
    }

    #[tokio::test]
    async fn test_unknown_alias() {
        let interceptor = Interceptor::new(RuleOrdering::FirstMatch, Duration::from_secs(1));
        let err = interceptor.wait_for("nope", None).await.unwrap_err();
        assert!(matches!(err, HarnessError::UnknownAlias(_)));
    }
}
