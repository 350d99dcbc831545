//! Assertion engine
//!
//! [`poll`] re-evaluates an attempt until it passes or its deadline expires.
//! Element matchers are evaluated against fresh snapshots on every round,
//! so asynchronous DOM updates are observed; value matchers check JSON
//! subjects such as recorded exchanges.

use regex::Regex;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use webprobe_common::{HarnessError, HarnessResult};

use crate::page::ElementState;

/// Polling budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollOptions {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Outcome of one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Check<T> {
    Pass(T),
    Fail { message: String, observed: String },
}

impl<T> Check<T> {
    pub fn fail(message: impl Into<String>, observed: impl Into<String>) -> Self {
        Check::Fail {
            message: message.into(),
            observed: observed.into(),
        }
    }
}

/// Re-run `attempt` every `interval` until it passes
///
/// Fails with `AssertionTimeout` carrying the last failure once `timeout`
/// elapses. An attempt still running at the deadline is cut off. Attempt errors
/// abort immediately.
pub async fn poll<T, F, Fut>(options: PollOptions, mut attempt: F) -> HarnessResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HarnessResult<Check<T>>>,
{
    let deadline = Instant::now() + options.timeout;
    let mut last = (String::from("condition was never evaluated"), String::from("nothing"));
    let mut rounds = 0u32;

    loop {
        rounds += 1;
        match tokio::time::timeout_at(deadline, attempt()).await {
            Ok(Ok(Check::Pass(value))) => return Ok(value),
            Ok(Ok(Check::Fail { message, observed })) => last = (message, observed),
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(options.interval.min(deadline - now)).await;
    }

    trace!("poll gave up after {} rounds: {}", rounds, last.0);
    Err(HarnessError::AssertionTimeout {
        message: last.0,
        last_observed: last.1,
        timeout_ms: options.timeout.as_millis() as u64,
    })
}

/// Chainer name and arguments, e.g. `["have.class", "success"]`
pub type Chainer = (String, Vec<Value>);

/// Parse one chainer or a list of chainers
///
/// Accepted forms: `"be.visible"`, `["have.class", "success"]`, and a list
/// of either when the first element is itself a list.
pub fn parse_chainers(value: &Value) -> HarnessResult<Vec<Chainer>> {
    match value {
        Value::String(name) => Ok(vec![(name.clone(), Vec::new())]),
        Value::Array(items) => match items.first() {
            Some(Value::Array(_)) => items
                .iter()
                .map(|item| {
                    let mut parsed = parse_chainers(item)?;
                    if parsed.len() != 1 {
                        return Err(HarnessError::InvalidInput(format!("nested check list: {}", item)));
                    }
                    Ok(parsed.remove(0))
                })
                .collect(),
            Some(Value::String(name)) => Ok(vec![(name.clone(), items[1..].to_vec())]),
            _ => Err(HarnessError::InvalidInput(format!("invalid check: {}", value))),
        },
        other => Err(HarnessError::InvalidInput(format!("invalid check: {}", other))),
    }
}

/// `be.visible` → `visible`, `not.have.class` → `not_have_class`
fn normalize(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .replace(['.', '-', ' '], "_")
        .split('_')
        .filter(|part| !part.is_empty() && *part != "be" && *part != "to")
        .collect::<Vec<_>>()
        .join("_")
}

fn arg_str(name: &str, args: &[Value], idx: usize) -> HarnessResult<String> {
    match args.get(idx) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        _ => Err(HarnessError::InvalidInput(format!("'{}' expects a text argument", name))),
    }
}

fn arg_usize(name: &str, args: &[Value]) -> HarnessResult<usize> {
    args.first()
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .map(|n| n as usize)
        .ok_or_else(|| HarnessError::InvalidInput(format!("'{}' expects a count", name)))
}

/// Assertion on the element set a query yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementMatcher {
    Visible,
    Hidden,
    Exist,
    NotExist,
    HaveClass(String),
    NotHaveClass(String),
    /// Combined text contains
    Contain(String),
    NotContain(String),
    HaveText(String),
    HaveValue(String),
    ContainValue(String),
    NotHaveValue(String),
    HaveLength(usize),
    HaveAttr(String, Option<String>),
}

impl ElementMatcher {
    pub fn parse(chainer: &str, args: &[Value]) -> HarnessResult<Self> {
        let matcher = match normalize(chainer).as_str() {
            "visible" | "not_hidden" => ElementMatcher::Visible,
            "hidden" | "not_visible" => ElementMatcher::Hidden,
            "exist" => ElementMatcher::Exist,
            "not_exist" => ElementMatcher::NotExist,
            "have_class" => ElementMatcher::HaveClass(arg_str(chainer, args, 0)?),
            "not_have_class" => ElementMatcher::NotHaveClass(arg_str(chainer, args, 0)?),
            "contain" | "contain_text" | "include_text" => ElementMatcher::Contain(arg_str(chainer, args, 0)?),
            "not_contain" | "not_contain_text" => ElementMatcher::NotContain(arg_str(chainer, args, 0)?),
            "have_text" => ElementMatcher::HaveText(arg_str(chainer, args, 0)?),
            "have_value" => ElementMatcher::HaveValue(arg_str(chainer, args, 0)?),
            "contain_value" => ElementMatcher::ContainValue(arg_str(chainer, args, 0)?),
            "not_have_value" => ElementMatcher::NotHaveValue(arg_str(chainer, args, 0)?),
            "have_length" => ElementMatcher::HaveLength(arg_usize(chainer, args)?),
            "have_attr" => {
                let value = if args.len() > 1 { Some(arg_str(chainer, args, 1)?) } else { None };
                ElementMatcher::HaveAttr(arg_str(chainer, args, 0)?, value)
            }
            _ => return Err(HarnessError::InvalidInput(format!("unknown element assertion: {}", chainer))),
        };
        Ok(matcher)
    }

    /// Whether the matcher can pass on an empty element set
    pub fn accepts_empty(&self) -> bool {
        matches!(
            self,
            ElementMatcher::NotExist | ElementMatcher::NotContain(_) | ElementMatcher::HaveLength(0)
        )
    }

    pub fn describe(&self) -> String {
        match self {
            ElementMatcher::Visible => "be visible".into(),
            ElementMatcher::Hidden => "be hidden".into(),
            ElementMatcher::Exist => "exist".into(),
            ElementMatcher::NotExist => "not exist".into(),
            ElementMatcher::HaveClass(c) => format!("have class '{}'", c),
            ElementMatcher::NotHaveClass(c) => format!("not have class '{}'", c),
            ElementMatcher::Contain(t) => format!("contain '{}'", t),
            ElementMatcher::NotContain(t) => format!("not contain '{}'", t),
            ElementMatcher::HaveText(t) => format!("have text '{}'", t),
            ElementMatcher::HaveValue(v) => format!("have value '{}'", v),
            ElementMatcher::ContainValue(v) => format!("contain value '{}'", v),
            ElementMatcher::NotHaveValue(v) => format!("not have value '{}'", v),
            ElementMatcher::HaveLength(n) => format!("have length {}", n),
            ElementMatcher::HaveAttr(name, Some(v)) => format!("have attribute {}=\"{}\"", name, v),
            ElementMatcher::HaveAttr(name, None) => format!("have attribute {}", name),
        }
    }

    pub fn matches(&self, elements: &[ElementState]) -> bool {
        let text: String = elements.iter().map(|e| e.text.as_str()).collect();
        let value = elements.first().and_then(|e| e.value.as_deref());
        let any = !elements.is_empty();

        match self {
            ElementMatcher::Visible => any && elements.iter().all(|e| e.visible),
            ElementMatcher::Hidden => any && elements.iter().all(|e| !e.visible),
            ElementMatcher::Exist => any,
            ElementMatcher::NotExist => !any,
            ElementMatcher::HaveClass(c) => any && elements.iter().all(|e| e.has_class(c)),
            ElementMatcher::NotHaveClass(c) => any && !elements.iter().any(|e| e.has_class(c)),
            ElementMatcher::Contain(t) => any && text.contains(t.as_str()),
            ElementMatcher::NotContain(t) => !text.contains(t.as_str()),
            ElementMatcher::HaveText(t) => any && text.trim() == t.trim(),
            ElementMatcher::HaveValue(v) => value == Some(v.as_str()),
            ElementMatcher::ContainValue(v) => value.map_or(false, |val| val.contains(v.as_str())),
            ElementMatcher::NotHaveValue(v) => any && value != Some(v.as_str()),
            ElementMatcher::HaveLength(n) => elements.len() == *n,
            ElementMatcher::HaveAttr(name, expected) => elements.first().map_or(false, |e| {
                match (e.attr(name), expected) {
                    (Some(found), Some(want)) => found == want,
                    (Some(_), None) => true,
                    (None, _) => false,
                }
            }),
        }
    }
}

/// Human-readable rendering of an element set for failure reports
pub fn describe_elements(elements: &[ElementState]) -> String {
    if elements.is_empty() {
        return "no elements".to_string();
    }
    elements.iter().map(ElementState::describe).collect::<Vec<_>>().join(", ")
}

/// Evaluate matchers in order; the first failure decides the message
pub fn check_elements(subject: &str, elements: &[ElementState], matchers: &[ElementMatcher]) -> Check<()> {
    for matcher in matchers {
        if !matcher.matches(elements) {
            return Check::fail(
                format!("expected '{}' to {}", subject, matcher.describe()),
                describe_elements(elements),
            );
        }
    }
    Check::Pass(())
}

/// Assertion on a JSON value
#[derive(Debug, Clone)]
pub enum ValueMatcher {
    Equal(Value),
    NotEqual(Value),
    IsArray,
    HasKey(String),
    /// Substring, array element, or object subset
    Contains(Value),
    IsNull,
    NotNull,
    ParsesAsJson,
    Matches(Regex),
    HaveLength(usize),
}

impl ValueMatcher {
    pub fn parse(chainer: &str, args: &[Value]) -> HarnessResult<Self> {
        let one = || {
            args.first()
                .cloned()
                .ok_or_else(|| HarnessError::InvalidInput(format!("'{}' expects an argument", chainer)))
        };
        let matcher = match normalize(chainer).as_str() {
            "equal" | "eq" | "deep_equal" => ValueMatcher::Equal(one()?),
            "not_equal" | "not_eq" => ValueMatcher::NotEqual(one()?),
            "is_array" | "array" | "an_array" => ValueMatcher::IsArray,
            "has_key" | "have_property" => ValueMatcher::HasKey(arg_str(chainer, args, 0)?),
            "contains" | "contain" | "include" => ValueMatcher::Contains(one()?),
            "is_null" | "null" => ValueMatcher::IsNull,
            "not_null" | "exist" => ValueMatcher::NotNull,
            "parses_as_json" => ValueMatcher::ParsesAsJson,
            "matches" | "match" => {
                let pattern = arg_str(chainer, args, 0)?;
                ValueMatcher::Matches(
                    Regex::new(&pattern)
                        .map_err(|e| HarnessError::InvalidInput(format!("invalid regex '{}': {}", pattern, e)))?,
                )
            }
            "have_length" | "length" => ValueMatcher::HaveLength(arg_usize(chainer, args)?),
            _ => return Err(HarnessError::InvalidInput(format!("unknown value assertion: {}", chainer))),
        };
        Ok(matcher)
    }

    pub fn describe(&self) -> String {
        match self {
            ValueMatcher::Equal(v) => format!("equal {}", v),
            ValueMatcher::NotEqual(v) => format!("not equal {}", v),
            ValueMatcher::IsArray => "be an array".into(),
            ValueMatcher::HasKey(k) => format!("have key '{}'", k),
            ValueMatcher::Contains(v) => format!("contain {}", v),
            ValueMatcher::IsNull => "be null".into(),
            ValueMatcher::NotNull => "not be null".into(),
            ValueMatcher::ParsesAsJson => "parse as JSON".into(),
            ValueMatcher::Matches(re) => format!("match /{}/", re.as_str()),
            ValueMatcher::HaveLength(n) => format!("have length {}", n),
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueMatcher::Equal(expected) => value == expected,
            ValueMatcher::NotEqual(expected) => value != expected,
            ValueMatcher::IsArray => value.is_array(),
            ValueMatcher::HasKey(key) => value.as_object().map_or(false, |o| o.contains_key(key)),
            ValueMatcher::Contains(expected) => contains(value, expected),
            ValueMatcher::IsNull => value.is_null(),
            ValueMatcher::NotNull => !value.is_null(),
            ValueMatcher::ParsesAsJson => match value {
                Value::String(s) => serde_json::from_str::<Value>(s).is_ok(),
                Value::Object(_) | Value::Array(_) => true,
                _ => false,
            },
            ValueMatcher::Matches(re) => match value {
                Value::String(s) => re.is_match(s),
                Value::Null => false,
                other => re.is_match(&other.to_string()),
            },
            ValueMatcher::HaveLength(n) => match value {
                Value::Array(a) => a.len() == *n,
                Value::String(s) => s.chars().count() == *n,
                Value::Object(o) => o.len() == *n,
                _ => false,
            },
        }
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Array(items), needle) => items.iter().any(|item| item == needle),
        (Value::Object(h), Value::Object(n)) => n.iter().all(|(k, v)| h.get(k) == Some(v)),
        _ => false,
    }
}

/// Resolve a dotted path (`response.body.results.0.out`) inside a value
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Check a value (optionally at `path`) against matchers in order
pub fn expect_value(actual: &Value, path: Option<&str>, matchers: &[ValueMatcher]) -> HarnessResult<()> {
    let target = match path {
        Some(p) => lookup(actual, p).unwrap_or(&Value::Null),
        None => actual,
    };
    let label = path.unwrap_or("value");
    for matcher in matchers {
        if !matcher.matches(target) {
            return Err(HarnessError::AssertionFailed(format!(
                "expected {} to {}, got {}",
                label,
                matcher.describe(),
                target
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_case::test_case;

    fn element(classes: &[&str], text: &str) -> ElementState {
        ElementState {
            handle: "e".into(),
            tag: "div".into(),
            id: Some("keysResponse".into()),
            classes: classes.iter().map(|c| c.to_string()).collect(),
            text: text.into(),
            visible: true,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_succeeds_once_condition_holds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = poll(PollOptions::new(Duration::from_secs(4), Duration::from_millis(50)), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, HarnessError>(if n >= 3 { Check::Pass(n) } else { Check::fail("not yet", n.to_string()) })
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_within_budget() {
        let start = Instant::now();
        let err = poll::<(), _, _>(PollOptions::new(Duration::from_millis(300), Duration::from_millis(50)), || async {
            Ok::<_, HarnessError>(Check::fail("expected class 'success'", "class=\"error\""))
        })
        .await
        .unwrap_err();

        assert!(start.elapsed() <= Duration::from_millis(350));
        match err {
            HarnessError::AssertionTimeout { last_observed, timeout_ms, .. } => {
                assert_eq!(last_observed, "class=\"error\"");
                assert_eq!(timeout_ms, 300);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_cuts_off_slow_attempt() {
        let start = Instant::now();
        let err = poll::<(), _, _>(PollOptions::new(Duration::from_millis(100), Duration::from_millis(50)), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, HarnessError>(Check::Pass(()))
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_poll_propagates_attempt_errors() {
        let err = poll::<(), _, _>(PollOptions::new(Duration::from_secs(1), Duration::from_millis(10)), || async {
            Err::<Check<()>, _>(HarnessError::Driver("session closed".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "Driver");
    }

    #[test_case("be.visible", ElementMatcher::Visible ; "visible")]
    #[test_case("not.be.visible", ElementMatcher::Hidden ; "not visible")]
    #[test_case("not.exist", ElementMatcher::NotExist ; "not exist")]
    #[test_case("have.class", ElementMatcher::HaveClass("success".into()) ; "have class")]
    fn test_chainer_names(name: &str, expected: ElementMatcher) {
        assert_eq!(ElementMatcher::parse(name, &[json!("success")]).unwrap(), expected);
    }

    #[test]
    fn test_first_failing_matcher_decides_message() {
        let matchers = vec![
            ElementMatcher::HaveClass("success".into()),
            ElementMatcher::Contain("Found 1 keys:".into()),
        ];
        let elements = vec![element(&["response", "error"], "Invalid JSON")];
        match check_elements("#keysResponse", &elements, &matchers) {
            Check::Fail { message, observed } => {
                assert!(message.contains("have class 'success'"));
                assert!(observed.contains("Invalid JSON"));
            }
            Check::Pass(_) => panic!("should fail"),
        }

        let ok = vec![element(&["response", "success"], "Found 1 keys: 42")];
        assert_eq!(check_elements("#keysResponse", &ok, &matchers), Check::Pass(()));
    }

    #[test]
    fn test_parse_chainer_forms() {
        assert_eq!(parse_chainers(&json!("be.visible")).unwrap().len(), 1);
        let single = parse_chainers(&json!(["have.class", "error"])).unwrap();
        assert_eq!(single[0].1, vec![json!("error")]);
        let many = parse_chainers(&json!([["have.class", "error"], ["contain", "Invalid JSON"]])).unwrap();
        assert_eq!(many.len(), 2);
        assert!(parse_chainers(&json!(42)).is_err());
    }

    #[test]
    fn test_value_matchers_on_exchange() {
        let exchange = json!({
            "response": { "status": 200, "body": { "keys": ["42"], "results": [{ "out": "4" }] } }
        });
        expect_value(
            &exchange,
            Some("response.body.keys"),
            &[ValueMatcher::IsArray, ValueMatcher::HaveLength(1), ValueMatcher::Contains(json!("42"))],
        )
        .unwrap();
        expect_value(&exchange, Some("response.body.results.0.out"), &[ValueMatcher::Equal(json!("4"))]).unwrap();

        let err = expect_value(&exchange, Some("response.status"), &[ValueMatcher::Equal(json!(201))]).unwrap_err();
        assert!(err.to_string().contains("response.status"));
    }

    #[test]
    fn test_parses_as_json() {
        let m = ValueMatcher::parse("parses_as_json", &[]).unwrap();
        assert!(m.matches(&json!("{\"a\":1}")));
        assert!(!m.matches(&json!("{\"invalid\": json}")));
    }
}
