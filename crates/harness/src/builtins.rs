//! Primitive and built-in commands
//!
//! Primitives map one-to-one onto dispatcher, interceptor and assertion
//! operations. Built-ins are composed from other commands and go through
//! the registry, so overrides of the commands they use apply to them too.

use bytes::Bytes;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

use webprobe_common::{HarnessError, HarnessResult, Method};

use crate::artifacts;
use crate::assertion::{
    check_elements, expect_value, lookup, parse_chainers, poll, Check, ElementMatcher, PollOptions, ValueMatcher,
};
use crate::commands::{CommandFuture, CommandRegistry};
use crate::dispatcher::{ClickOptions, Position, Target, TypeOptions};
use crate::intercept::{InterceptRule, StaticResponse, UrlPattern};
use crate::page::ElementState;
use crate::session::{Session, Subject};

/// Default timeout of `visitUrl`
pub const VISIT_URL_TIMEOUT_MS: u64 = 20_000;

/// Default timeout of `acceptCookies`
pub const ACCEPT_COOKIES_TIMEOUT_MS: u64 = 10_000;

fn invalid(command: &str, expected: &str) -> HarnessError {
    HarnessError::InvalidInput(format!("{}: expected {}", command, expected))
}

fn field<'v>(args: &'v Value, key: &str) -> Option<&'v Value> {
    args.as_object().and_then(|o| o.get(key))
}

fn str_field(args: &Value, key: &str) -> Option<String> {
    match field(args, key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn bool_field(args: &Value, key: &str) -> bool {
    field(args, key).and_then(Value::as_bool).unwrap_or(false)
}

fn u64_field(args: &Value, key: &str) -> Option<u64> {
    field(args, key).and_then(Value::as_u64)
}

fn timeout_field(args: &Value) -> Option<Duration> {
    u64_field(args, "timeout").map(Duration::from_millis)
}

/// Bare string argument, or the named field of a map argument
fn primary(args: &Value, key: &str) -> Option<String> {
    match args {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => str_field(args, key),
    }
}

/// Text to type: strings verbatim, other JSON serialized
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn parse_position(value: &Value) -> HarnessResult<Position> {
    match value {
        Value::String(s) if s == "first" => Ok(Position::First),
        Value::String(s) if s == "last" => Ok(Position::Last),
        Value::String(s) => s
            .parse()
            .map(Position::Nth)
            .map_err(|_| invalid("index", "'first', 'last' or a number")),
        Value::Number(n) => n
            .as_u64()
            .map(|n| Position::Nth(n as usize))
            .ok_or_else(|| invalid("index", "a non-negative number")),
        _ => Err(invalid("index", "'first', 'last' or a number")),
    }
}

/// Element target from a selector argument, falling back to the subject
fn target_arg(session: &Session, command: &str, args: &Value) -> HarnessResult<Target> {
    let selector = match args {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => str_field(args, "selector"),
        Value::Null => None,
        _ => return Err(invalid(command, "a selector")),
    };

    let mut target = match (selector, session.subject()) {
        (Some(selector), _) => Target::new(selector),
        (None, Subject::Elements { target, .. }) => target.clone(),
        (None, other) => {
            return Err(HarnessError::InvalidInput(format!(
                "{}: no selector given and the subject is {}",
                command,
                other.kind()
            )))
        }
    };
    if let Some(text) = str_field(args, "contains") {
        target = target.containing(text);
    }
    if let Some(index) = field(args, "index") {
        target = target.at(parse_position(index)?);
    }
    Ok(target)
}

fn element_matchers(checks: &Value) -> HarnessResult<Vec<ElementMatcher>> {
    parse_chainers(checks)?
        .iter()
        .map(|(name, args)| ElementMatcher::parse(name, args))
        .collect()
}

fn value_matchers(checks: &Value) -> HarnessResult<Vec<ValueMatcher>> {
    parse_chainers(checks)?
        .iter()
        .map(|(name, args)| ValueMatcher::parse(name, args))
        .collect()
}

/// Poll a target until every matcher passes
async fn assert_elements(
    session: &Session,
    target: &Target,
    matchers: &[ElementMatcher],
    timeout: Option<Duration>,
) -> HarnessResult<Vec<ElementState>> {
    let config = session.config();
    let options = PollOptions::new(
        timeout.unwrap_or_else(|| config.command_timeout()),
        config.poll_interval(),
    );
    let dispatcher = session.dispatcher();
    let label = target.to_string();

    let outcome = poll(options, || async {
        let elements = dispatcher.snapshot(target).await?;
        Ok(match check_elements(&label, &elements, matchers) {
            Check::Pass(()) => Check::Pass(elements),
            Check::Fail { message, observed } => Check::Fail { message, observed },
        })
    })
    .await;

    // A target that never matched is missing, unless emptiness could satisfy the chain
    if let Err(HarnessError::AssertionTimeout { .. }) = &outcome {
        let may_be_empty = matchers.iter().any(ElementMatcher::accepts_empty);
        if !may_be_empty && dispatcher.snapshot(target).await?.is_empty() {
            return Err(HarnessError::ElementNotFound {
                selector: label,
                timeout_ms: options.timeout.as_millis() as u64,
            });
        }
    }
    outcome
}

fn visit<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let url = primary(&args, "url").ok_or_else(|| invalid("visit", "a URL"))?;
        let url = session.dispatcher().navigate(&url, timeout_field(&args)).await?;
        Ok(Subject::Value(Value::String(url)))
    })
}

fn get<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        if args.is_null() {
            return Err(invalid("get", "a selector"));
        }
        let target = target_arg(session, "get", &args)?;
        let timeout = timeout_field(&args);
        let elements = match field(&args, "should") {
            Some(checks) => {
                let matchers = element_matchers(checks)?;
                assert_elements(session, &target, &matchers, timeout).await?
            }
            None => session.dispatcher().query(&target, timeout).await?,
        };
        Ok(Subject::Elements { target, elements })
    })
}

fn click<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let target = target_arg(session, "click", &args)?;
        let options = ClickOptions {
            force: bool_field(&args, "force"),
            timeout: timeout_field(&args),
        };
        let element = session.dispatcher().click(&target, options).await?;
        Ok(Subject::Elements {
            target,
            elements: vec![element],
        })
    })
}

fn type_text<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let (target_args, text) = match &args {
            Value::String(text) => (Value::Null, text.clone()),
            Value::Object(_) => {
                let text = field(&args, "text")
                    .and_then(text_of)
                    .ok_or_else(|| invalid("type", "a 'text' value"))?;
                (args.clone(), text)
            }
            _ => return Err(invalid("type", "text or a map with 'text'")),
        };
        let target = target_arg(session, "type", &target_args)?;
        let options = TypeOptions {
            parse_special_chars: bool_field(&args, "parse_special_chars"),
            force: bool_field(&args, "force"),
            timeout: timeout_field(&args),
        };
        let element = session.dispatcher().type_text(&target, &text, options).await?;
        Ok(Subject::Elements {
            target,
            elements: vec![element],
        })
    })
}

fn clear<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let target = target_arg(session, "clear", &args)?;
        let element = session.dispatcher().clear(&target, timeout_field(&args)).await?;
        Ok(Subject::Elements {
            target,
            elements: vec![element],
        })
    })
}

fn reload<'a>(session: &'a mut Session, _args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        session.dispatcher().reload().await?;
        Ok(Subject::None)
    })
}

fn url<'a>(session: &'a mut Session, _args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let url = session.dispatcher().current_url().await?;
        Ok(Subject::Value(Value::String(url)))
    })
}

fn static_reply(session: &mut Session, reply: &Value) -> HarnessResult<StaticResponse> {
    let status = u64_field(reply, "status").unwrap_or(200) as u16;
    let body = match (str_field(reply, "fixture"), field(reply, "body")) {
        (Some(name), _) => Some(session.fixture(&name)?),
        (None, body) => body.cloned(),
    };

    let mut response = match body {
        Some(Value::String(text)) => {
            let mut r = StaticResponse::new(status).with_header("content-type", "text/plain");
            r.body = Bytes::from(text);
            r
        }
        Some(value) => StaticResponse::json(status, &value),
        None => StaticResponse::new(status),
    };
    if let Some(Value::Object(headers)) = field(reply, "headers") {
        for (name, value) in headers {
            if let Some(value) = text_of(value) {
                response.headers.set(name.as_str(), value);
            }
        }
    }
    if let Some(ms) = u64_field(reply, "delay_ms") {
        response = response.with_delay(Duration::from_millis(ms));
    }
    Ok(response)
}

fn intercept<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let pattern = primary(&args, "url").ok_or_else(|| invalid("intercept", "a URL pattern"))?;
        let method = match str_field(&args, "method").as_deref() {
            None | Some("*") => None,
            Some(m) => Some(m.parse::<Method>()?),
        };
        let mut rule = InterceptRule::new(method, UrlPattern::parse(&pattern)?);
        if let Some(alias) = str_field(&args, "alias") {
            rule = rule.alias(alias.trim_start_matches('@'));
        }
        if let Some(times) = u64_field(&args, "times") {
            rule = rule.times(times as usize);
        }

        if bool_field(&args, "force_network_error") {
            rule = rule.reply(StaticResponse::network_error());
        } else if let Some(reply) = field(&args, "reply") {
            rule = rule.reply(static_reply(session, reply)?);
        } else if field(&args, "remove_headers").is_some() || field(&args, "set_headers").is_some() {
            let remove: Vec<String> = field(&args, "remove_headers")
                .and_then(Value::as_array)
                .map(|names| names.iter().filter_map(|n| n.as_str().map(String::from)).collect())
                .unwrap_or_default();
            let set: Vec<(String, String)> = field(&args, "set_headers")
                .and_then(Value::as_object)
                .map(|m| m.iter().filter_map(|(k, v)| text_of(v).map(|v| (k.clone(), v))).collect())
                .unwrap_or_default();
            rule = rule.handler(move |req| {
                for name in &remove {
                    req.headers_mut().remove(name);
                }
                for (name, value) in &set {
                    req.headers_mut().set(name.as_str(), value.as_str());
                }
            });
        }

        let alias = session.interceptor().register(rule)?;
        Ok(Subject::Value(Value::String(alias)))
    })
}

fn wait<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        if let Some(ms) = args.as_u64() {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(session.subject().clone());
        }
        let alias = primary(&args, "alias").ok_or_else(|| invalid("wait", "'@alias' or milliseconds"))?;
        let alias = alias
            .strip_prefix('@')
            .ok_or_else(|| invalid("wait", "an alias starting with '@'"))?;
        let exchange = session.interceptor().wait_for(alias, timeout_field(&args)).await?;
        Ok(Subject::Exchange(Box::new(exchange)))
    })
}

fn should<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let (checks, path, timeout) = match &args {
            Value::Object(_) => (
                field(&args, "check").cloned().ok_or_else(|| invalid("should", "a 'check' value"))?,
                str_field(&args, "path"),
                timeout_field(&args),
            ),
            other => (other.clone(), None, None),
        };

        match session.subject().clone() {
            Subject::Elements { target, .. } => {
                let matchers = element_matchers(&checks)?;
                let elements = assert_elements(session, &target, &matchers, timeout).await?;
                Ok(Subject::Elements { target, elements })
            }
            Subject::None => Err(HarnessError::InvalidInput("should: there is no subject to assert on".into())),
            subject => {
                expect_value(&subject.to_value(), path.as_deref(), &value_matchers(&checks)?)?;
                Ok(subject)
            }
        }
    })
}

fn expect<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let checks = field(&args, "should").ok_or_else(|| invalid("expect", "a 'should' value"))?;
        let actual = match field(&args, "value") {
            Some(value) => value.clone(),
            None => session.subject().to_value(),
        };
        expect_value(&actual, str_field(&args, "path").as_deref(), &value_matchers(checks)?)?;
        Ok(session.subject().clone())
    })
}

fn extract<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let pattern = str_field(&args, "regex").ok_or_else(|| invalid("extract", "a 'regex'"))?;
        let regex = regex::Regex::new(&pattern)
            .map_err(|e| HarnessError::InvalidInput(format!("invalid regex '{}': {}", pattern, e)))?;
        let group = u64_field(&args, "group").unwrap_or(1) as usize;

        let source = match (field(&args, "value"), session.subject()) {
            (Some(value), _) => value.clone(),
            (None, Subject::Elements { elements, .. }) => {
                Value::String(elements.iter().map(|e| e.text.as_str()).collect())
            }
            (None, subject) => subject.to_value(),
        };
        let source = match str_field(&args, "path") {
            Some(path) => lookup(&source, &path).cloned().unwrap_or(Value::Null),
            None => source,
        };
        let text = text_of(&source).unwrap_or_default();

        let captured = regex
            .captures(&text)
            .and_then(|c| c.get(group))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                HarnessError::AssertionFailed(format!("/{}/ did not match {:?}", pattern, text))
            })?;
        Ok(Subject::Value(Value::String(captured)))
    })
}

fn fixture<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let name = primary(&args, "name").ok_or_else(|| invalid("fixture", "a fixture name"))?;
        Ok(Subject::Value(session.fixture(&name)?))
    })
}

fn clear_cookies<'a>(session: &'a mut Session, _args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        session.dispatcher().clear_cookies().await?;
        Ok(Subject::None)
    })
}

fn clear_local_storage<'a>(session: &'a mut Session, _args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        session.dispatcher().clear_local_storage().await?;
        Ok(Subject::None)
    })
}

fn clear_session_storage<'a>(session: &'a mut Session, _args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        session.dispatcher().clear_session_storage().await?;
        Ok(Subject::None)
    })
}

fn sleep<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let ms = args
            .as_u64()
            .or_else(|| u64_field(&args, "ms"))
            .ok_or_else(|| invalid("sleep", "milliseconds"))?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(session.subject().clone())
    })
}

fn log<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let message = primary(&args, "message").unwrap_or_else(|| args.to_string());
        info!("[scenario log] {}", message);
        Ok(session.subject().clone())
    })
}

fn screenshot<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let png = session.dispatcher().screenshot().await?;
        let name = primary(&args, "name").unwrap_or_else(|| "screenshot".to_string());
        let path = artifacts::write_screenshot(&session.config().screenshots_dir(), &name, &png)?;
        Ok(Subject::Value(Value::String(path.display().to_string())))
    })
}

/// Register the primitive commands
pub fn register_primitives(registry: &mut CommandRegistry) -> HarnessResult<()> {
    registry.define("visit", visit)?;
    registry.define("get", get)?;
    registry.define("click", click)?;
    registry.define("type", type_text)?;
    registry.define("clear", clear)?;
    registry.define("reload", reload)?;
    registry.define("url", url)?;
    registry.define("intercept", intercept)?;
    registry.define("wait", wait)?;
    registry.define("should", should)?;
    registry.define("expect", expect)?;
    registry.define("extract", extract)?;
    registry.define("fixture", fixture)?;
    registry.define("clearCookies", clear_cookies)?;
    registry.define("clearLocalStorage", clear_local_storage)?;
    registry.define("clearSessionStorage", clear_session_storage)?;
    registry.define("sleep", sleep)?;
    registry.define("log", log)?;
    registry.define("screenshot", screenshot)?;
    Ok(())
}

fn visit_url<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let url = primary(&args, "url").ok_or_else(|| invalid("visitUrl", "a URL"))?;
        let timeout = u64_field(&args, "timeout").unwrap_or(VISIT_URL_TIMEOUT_MS);
        session
            .invoke("visit", json!({ "url": url, "timeout": timeout, "log": false }))
            .await
    })
}

fn clear_all<'a>(session: &'a mut Session, _args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        session.invoke("clearCookies", Value::Null).await?;
        session.invoke("clearLocalStorage", Value::Null).await?;
        session.invoke("clearSessionStorage", Value::Null).await?;
        Ok(Subject::None)
    })
}

fn accept_cookies<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let selector = primary(&args, "selector").unwrap_or_else(|| session.config().consent_selector.clone());
        let timeout = u64_field(&args, "timeout").unwrap_or(ACCEPT_COOKIES_TIMEOUT_MS);
        session
            .invoke("click", json!({ "selector": selector, "timeout": timeout, "log": false }))
            .await
    })
}

fn type_json<'a>(session: &'a mut Session, args: Value) -> CommandFuture<'a> {
    Box::pin(async move {
        let (selector, text) = match &args {
            Value::String(text) => (None, text.clone()),
            Value::Object(_) => {
                let text = match (field(&args, "text"), field(&args, "json")) {
                    (Some(text), _) => text_of(text),
                    (None, Some(value)) => Some(value.to_string()),
                    (None, None) => None,
                };
                (
                    str_field(&args, "selector"),
                    text.ok_or_else(|| invalid("typeJson", "'text' or 'json'"))?,
                )
            }
            _ => return Err(invalid("typeJson", "text or a map with 'text'/'json'")),
        };

        let target = match &selector {
            Some(selector) => json!({ "selector": selector }),
            None => Value::Null,
        };
        session.invoke("clear", target.clone()).await?;

        let mut type_args = json!({ "text": text, "parse_special_chars": false });
        if let Some(selector) = selector {
            type_args["selector"] = Value::String(selector);
        }
        session.invoke("type", type_args).await
    })
}

/// Register the composed built-ins; requires the primitives
pub fn register_builtins(registry: &mut CommandRegistry) -> HarnessResult<()> {
    registry.define("visitUrl", visit_url)?;
    registry.define("clearAll", clear_all)?;
    registry.define("acceptCookies", accept_cookies)?;
    registry.define("typeJson", type_json)?;
    Ok(())
}
