//! HTTP exchange types shared by the interceptor, the proxy and the drivers

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{HarnessError, HarnessResult};

/// HTTP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            other => Err(HarnessError::InvalidInput(format!("unsupported HTTP method: {}", other))),
        }
    }
}

/// Ordered header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every value of `name` with a single value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.0.push((name, value.into()));
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Remove all values of `name`, returning the first one
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let first = self.get(name).map(String::from);
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        first
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn to_value(&self) -> Value {
        let map = self
            .0
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>();
        Value::Object(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

/// Bodies are kept as bytes and rendered as UTF-8 text in reports
mod body_text {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(d)?;
        Ok(Bytes::from(text))
    }
}

/// Decode a body as JSON, falling back to a string value for non-JSON text
fn body_value(body: &Bytes) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// An outgoing request issued by the driven page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub id: String,
    pub method: Method,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "body_text")]
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            url: url.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(self, value: &Value) -> Self {
        self.with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    /// Path component of the URL (without query string)
    pub fn path(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(u) => u.path().to_string(),
            Err(_) => self.url.split(['?', '#']).next().unwrap_or_default().to_string(),
        }
    }

    pub fn json(&self) -> HarnessResult<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn to_value(&self) -> Value {
        json!({
            "method": self.method.as_str(),
            "url": self.url,
            "path": self.path(),
            "headers": self.headers.to_value(),
            "body": body_value(&self.body),
        })
    }
}

/// A response delivered to the driven page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "body_text")]
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn json_body(status: u16, value: &Value) -> Self {
        let mut resp = Self::new(status);
        resp.headers.set("content-type", "application/json");
        resp.body = Bytes::from(value.to_string());
        resp
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> HarnessResult<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn to_value(&self) -> Value {
        json!({
            "status": self.status,
            "headers": self.headers.to_value(),
            "body": body_value(&self.body),
        })
    }
}

/// One completed request/response pair captured by the interceptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedExchange {
    /// Alias of the rule that matched, if any
    pub alias: Option<String>,
    pub request: HttpRequest,
    pub response: Option<HttpResponse>,
    /// Transport-level failure; mutually exclusive with `response`
    pub error: Option<String>,
    /// True when the response was synthesized rather than fetched upstream
    pub mocked: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RecordedExchange {
    pub fn is_network_error(&self) -> bool {
        self.error.is_some()
    }

    /// JSON view used by value assertions (`response.body.keys`, ...)
    pub fn to_value(&self) -> Value {
        json!({
            "alias": self.alias,
            "request": self.request.to_value(),
            "response": self.response.as_ref().map(HttpResponse::to_value),
            "error": self.error,
            "mocked": self.mocked,
            "duration_ms": self.duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_are_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("If-None-Match", "W/\"abc\"");
        assert_eq!(headers.get("if-none-match"), Some("W/\"abc\""));

        headers.set("if-none-match", "W/\"def\"");
        assert_eq!(headers.len(), 1);

        assert_eq!(headers.remove("IF-NONE-MATCH").as_deref(), Some("W/\"def\""));
        assert!(headers.is_empty());
    }

    #[test]
    fn test_collected_headers_keep_repeated_names() {
        let headers: Headers = vec![("Set-Cookie", "a=1"), ("set-cookie", "b=2"), ("ETag", "W/\"abc\"")]
            .into_iter()
            .collect();
        assert_eq!(headers.len(), 3);
        let cookies: Vec<&str> = headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
            .map(|(_, value)| value)
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_request_path_ignores_query() {
        let req = HttpRequest::new(Method::Get, "http://localhost:1312/api?limit=5");
        assert_eq!(req.path(), "/api");

        let rel = HttpRequest::new(Method::Get, "/calc?q=1");
        assert_eq!(rel.path(), "/calc");
    }

    #[test]
    fn test_exchange_value_exposes_json_body() {
        let req = HttpRequest::new(Method::Get, "http://localhost:1312/api");
        let exchange = RecordedExchange {
            alias: Some("getAllKeys".into()),
            request: req,
            response: Some(HttpResponse::json_body(200, &json!({ "keys": [] }))),
            error: None,
            mocked: false,
            started_at: Utc::now(),
            duration_ms: 3,
        };
        let value = exchange.to_value();
        assert!(value["response"]["body"]["keys"].is_array());
        assert_eq!(value["request"]["method"], "GET");
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("post".parse::<Method>().unwrap(), Method::Post);
        assert!("FETCH".parse::<Method>().is_err());
    }
}
