//! Uncaught page error policy
//!
//! Any uncaught exception raised by the UI fails the test, except messages
//! listed as known issues.
//!
//! Known issue: the UI emits `ResizeObserver loop limit exceeded` from a
//! layout measurement loop. The underlying UI bug is unresolved. It is
//! listed here so unrelated scenarios do not fail on it. Remove the entry
//! once the UI is fixed.

use regex::Regex;

use crate::error::E2eResult;

pub const RESIZE_OBSERVER_LOOP: &str = "ResizeObserver loop limit exceeded";

#[derive(Debug, Clone)]
pub struct PageErrorFilter {
    known_issues: Vec<Regex>,
}

impl PageErrorFilter {
    /// Filter with no known issues: every page error fails the test
    pub fn strict() -> Self {
        Self { known_issues: Vec::new() }
    }

    /// Filter tolerating only the documented known issues
    pub fn known_issues() -> E2eResult<Self> {
        Self::from_patterns(&[regex::escape(RESIZE_OBSERVER_LOOP)])
    }

    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> E2eResult<Self> {
        let known_issues = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { known_issues })
    }

    pub fn is_known_issue(&self, message: &str) -> bool {
        self.known_issues.iter().any(|re| re.is_match(message))
    }

    /// JavaScript array literal of the known-issue patterns
    pub fn to_js_array(&self) -> E2eResult<String> {
        let items = self
            .known_issues
            .iter()
            .map(|re| -> E2eResult<String> {
                Ok(format!("new RegExp({})", serde_json::to_string(re.as_str())?))
            })
            .collect::<E2eResult<Vec<_>>>()?;
        Ok(format!("[{}]", items.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tolerates_resize_observer_loop() {
        let filter = PageErrorFilter::known_issues().unwrap();
        assert!(filter.is_known_issue("ResizeObserver loop limit exceeded"));
        assert!(!filter.is_known_issue("TypeError: cannot read properties of undefined"));
    }

    #[test]
    fn test_strict_rejects_everything() {
        assert!(!PageErrorFilter::strict().is_known_issue(RESIZE_OBSERVER_LOOP));
    }

    #[test]
    fn test_js_array() {
        let filter = PageErrorFilter::from_patterns(&["^Script error", "chunk \\d+ failed"]).unwrap();
        assert_eq!(
            filter.to_js_array().unwrap(),
            r#"[new RegExp("^Script error"), new RegExp("chunk \\d+ failed")]"#
        );
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(PageErrorFilter::from_patterns(&["("]).is_err());
    }
}
