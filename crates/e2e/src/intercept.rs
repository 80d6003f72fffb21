//! Network intercepts and observe-then-act sequencing
//!
//! An intercept observes a network exchange without altering it. Scenarios
//! use it to act only after a specific backend response is seen. The
//! ordering is always: register the observation, perform the action, await
//! the observation. Registering after the action could miss a fast response.

use std::future::Future;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{E2eError, E2eResult};

/// Matches requests by HTTP method and URL glob.
///
/// Globs are matched against the URL without its query string. `*` matches
/// within one path segment, `**` matches across segments. A pattern that
/// starts with `*` or `**` matches any origin prefix, so `*/projects/*`
/// matches `https://api.example.com/v1/projects/42`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMatcher {
    #[serde(default)]
    pub method: Option<String>,
    pub url: String,
}

impl RouteMatcher {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: Some(method.to_ascii_uppercase()),
            url: url.to_string(),
        }
    }

    pub fn any_method(url: &str) -> Self {
        Self {
            method: None,
            url: url.to_string(),
        }
    }

    /// Regex source equivalent to the URL glob
    pub fn url_regex_source(&self) -> String {
        glob_to_regex(&self.url)
    }

    pub fn compile(&self) -> E2eResult<Regex> {
        Regex::new(&self.url_regex_source()).map_err(E2eError::from)
    }

    pub fn matches(&self, method: &str, url: &str) -> E2eResult<bool> {
        if let Some(expected) = &self.method {
            if !expected.eq_ignore_ascii_case(method) {
                return Ok(false);
            }
        }
        let path = url.split('?').next().unwrap_or(url);
        Ok(self.compile()?.is_match(path))
    }

    /// JavaScript predicate over a Playwright `Response`
    pub fn to_js_predicate(&self) -> E2eResult<String> {
        // Validate here so a bad glob fails in Rust, not in the browser
        self.compile()?;
        let url_re = serde_json::to_string(&self.url_regex_source())?;
        let method_check = match &self.method {
            Some(m) => format!("r.request().method() === {} && ", serde_json::to_string(m)?),
            None => String::new(),
        };
        Ok(format!(
            "(r) => {}new RegExp({}).test(r.url().split('?')[0])",
            method_check, url_re
        ))
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut rest = glob;

    // Leading wildcard segment stands for scheme, host and any path prefix
    if let Some(stripped) = rest.strip_prefix("**") {
        out.push_str(".*");
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix('*') {
        out.push_str(".*");
        rest = stripped;
    }

    let mut literal = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '*' {
            out.push_str(&regex::escape(&literal));
            literal.clear();
            if chars.peek() == Some(&'*') {
                chars.next();
                out.push_str(".*");
            } else {
                out.push_str("[^/]*");
            }
        } else {
            literal.push(c);
        }
    }
    out.push_str(&regex::escape(&literal));
    out.push('$');
    out
}

/// An observation started ahead of the action it is waiting on
pub struct Armed<T> {
    label: String,
    handle: JoinHandle<E2eResult<T>>,
}

/// Start observing before acting.
///
/// The observation future must register its interest when it is created
/// (e.g. hold a subscribed receiver), not on first poll.
pub fn arm<F, T>(label: impl Into<String>, observation: F) -> Armed<T>
where
    F: Future<Output = E2eResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let label = label.into();
    debug!(label = %label, "Observation armed");
    Armed {
        label,
        handle: tokio::spawn(observation),
    }
}

impl<T> Armed<T> {
    /// Run `action` while the armed observation keeps going.
    ///
    /// Whichever fails first decides the error: a failed action cancels the
    /// observation, a failed observation drops the action. On success both
    /// results are returned once both have finished.
    pub async fn then<A, R>(self, action: A) -> E2eResult<(R, T)>
    where
        A: Future<Output = E2eResult<R>>,
    {
        let Armed { label, mut handle } = self;
        tokio::pin!(action);

        let (acted, observed) = tokio::select! {
            biased;
            joined = &mut handle => {
                let observed = joined.map_err(|e| E2eError::Task(format!("{}: {}", label, e)))??;
                debug!(label = %label, "Observation finished before the action");
                (action.await?, observed)
            }
            acted = &mut action => {
                let acted = match acted {
                    Ok(value) => value,
                    Err(e) => {
                        handle.abort();
                        return Err(e);
                    }
                };
                let observed = handle
                    .await
                    .map_err(|e| E2eError::Task(format!("{}: {}", label, e)))??;
                (acted, observed)
            }
        };

        debug!(label = %label, "Observation completed");
        Ok((acted, observed))
    }
}
