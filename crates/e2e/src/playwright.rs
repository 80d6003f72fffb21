//! Playwright browser automation
//!
//! Steps are compiled into one Node script that drives a single browser
//! context, so storage, intercepts and page state carry across steps. The
//! script reports progress on stdout as `E2E_STEP`/`E2E_FAIL`/`E2E_DONE`
//! lines which are parsed back into [`StepResult`]s.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};

use crate::auth::Session;
use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::page_errors::PageErrorFilter;
use crate::spec::TestStep;

/// Playwright browser handle
pub struct PlaywrightHandle {
    config: PlaywrightConfig,

    /// Seeded into local storage before any page script runs
    session: Option<Session>,

    page_errors: PageErrorFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "firefox" => Browser::Firefox,
            "webkit" => Browser::Webkit,
            _ => Browser::Chromium,
        }
    }
}

/// Result of executing a test step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub step_name: String,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// Set when the failure was an uncaught page error
    #[serde(default)]
    pub page_error: bool,
    pub screenshot_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct StepReport {
    step: usize,
    #[serde(default)]
    ms: u64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    page_error: bool,
}

fn report_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^E2E_(STEP|FAIL|DONE) (\{.*\})\s*$")
            .unwrap_or_else(|e| unreachable!("report line regex is valid: {e}"))
    })
}

/// JavaScript string literal
fn js_str(value: &str) -> E2eResult<String> {
    Ok(serde_json::to_string(value)?)
}

impl PlaywrightHandle {
    /// Create a new Playwright handle, checking that Playwright is installed
    pub fn new(config: PlaywrightConfig) -> E2eResult<Self> {
        Self::check_playwright_installed()?;
        std::fs::create_dir_all(&config.screenshot_dir)?;
        Ok(Self::unchecked(config))
    }

    /// Handle that can only build scripts reliably (no install check)
    pub fn unchecked(config: PlaywrightConfig) -> Self {
        Self {
            config,
            session: None,
            page_errors: PageErrorFilter::strict(),
        }
    }

    pub fn with_session(mut self, session: Option<Session>) -> Self {
        self.session = session;
        self
    }

    pub fn with_page_errors(mut self, filter: PageErrorFilter) -> Self {
        self.page_errors = filter;
        self
    }

    pub fn config(&self) -> &PlaywrightConfig {
        &self.config
    }

    /// Check if Playwright is installed
    fn check_playwright_installed() -> E2eResult<()> {
        let output = Command::new("npx")
            .args(["playwright", "--version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match output {
            Ok(status) if status.success() => Ok(()),
            _ => Err(E2eError::PlaywrightNotFound),
        }
    }

    /// Run steps in one browser session, stopping at the first failure
    pub async fn execute_steps(&self, steps: &[TestStep]) -> E2eResult<Vec<StepResult>> {
        let script = self.build_script(steps)?;
        let stdout = self.run_script(&script).await?;
        self.parse_report(&stdout, steps)
    }

    /// Run steps and turn the first failing step into an error
    pub async fn run_steps(&self, steps: &[TestStep]) -> E2eResult<Vec<StepResult>> {
        let results = self.execute_steps(steps).await?;
        if let Some(failed) = results.iter().find(|r| !r.success) {
            let reason = failed.error.clone().unwrap_or_else(|| "unknown error".to_string());
            return Err(if failed.page_error {
                E2eError::UncaughtPageError(reason)
            } else {
                E2eError::StepFailed {
                    step: failed.step_name.clone(),
                    reason,
                }
            });
        }
        Ok(results)
    }

    /// Build the Playwright test script for a set of steps
    pub fn build_script(&self, steps: &[TestStep]) -> E2eResult<String> {
        let mut script = String::new();

        let storage: Vec<(String, String)> = self
            .session
            .as_ref()
            .map(Session::storage_entries)
            .unwrap_or_default();

        // Header
        script.push_str(&format!(r#"
const {{ chromium, firefox, webkit }} = require('playwright');
const fs = require('fs');
const path = require('path');

class PageError extends Error {{}}

const report = (kind, data) => console.log('E2E_' + kind + ' ' + JSON.stringify(data));

(async () => {{
  const browser = await {browser}.launch({{ headless: {headless} }});
  const context = await browser.newContext({{
    viewport: {{ width: {width}, height: {height} }}
  }});
  await context.addInitScript((entries) => {{
    for (const [key, value] of entries) window.localStorage.setItem(key, value);
  }}, {storage});
  const page = await context.newPage();
  page.setDefaultTimeout({action_timeout});
  const baseUrl = {base_url};

  const knownIssues = {known_issues};
  const pageErrors = [];
  page.on('pageerror', (err) => {{
    if (!knownIssues.some((re) => re.test(err.message))) pageErrors.push(err.message);
  }});
  const checkPageErrors = () => {{
    if (pageErrors.length > 0) throw new PageError(pageErrors[0]);
  }};

  const eventually = async (check, timeout, description) => {{
    const deadline = Date.now() + timeout;
    let last = null;
    for (;;) {{
      try {{
        if (await check()) return;
      }} catch (e) {{
        last = e;
      }}
      if (Date.now() > deadline) {{
        throw new Error(description + (last ? ': ' + last.message : ''));
      }}
      await page.waitForTimeout(100);
    }}
  }};

  const intercepts = {{}};
  let step = 0;
  let started = Date.now();

  try {{
"#,
            browser = self.config.browser.as_str(),
            headless = self.config.headless,
            width = self.config.viewport_width,
            height = self.config.viewport_height,
            storage = serde_json::to_string(&storage)?,
            action_timeout = self.config.action_timeout_ms,
            base_url = js_str(&self.config.base_url)?,
            known_issues = self.page_errors.to_js_array()?,
        ));

        // Generate step code
        for (i, step) in steps.iter().enumerate() {
            script.push_str(&format!("\n    // Step {}: {}\n", i + 1, step.name()));
            script.push_str(&format!("    step = {};\n    started = Date.now();\n", i));
            script.push_str(&self.step_to_js(step)?);
            script.push_str("\n    checkPageErrors();\n");
            script.push_str("    report('STEP', { step, ms: Date.now() - started });\n");
        }

        // Footer
        script.push_str(r#"
    report('DONE', { step });
  } catch (error) {
    report('FAIL', {
      step,
      ms: Date.now() - started,
      error: error.message,
      page_error: error instanceof PageError,
    });
    process.exitCode = 1;
  } finally {
    await browser.close();
  }
})();
"#);

        Ok(script)
    }

    fn locator_js(selector: &str, has_text: Option<&str>) -> E2eResult<String> {
        Ok(match has_text {
            Some(text) => format!(
                "page.locator({}, {{ hasText: {} }})",
                js_str(selector)?,
                js_str(text)?
            ),
            None => format!("page.locator({})", js_str(selector)?),
        })
    }

    fn fixture_paths(&self, files: &[String]) -> E2eResult<Vec<String>> {
        let base = if self.config.fixtures_dir.is_absolute() {
            self.config.fixtures_dir.clone()
        } else {
            std::env::current_dir()?.join(&self.config.fixtures_dir)
        };
        Ok(files
            .iter()
            .map(|f| base.join(f).to_string_lossy().to_string())
            .collect())
    }

    /// Convert a step to JavaScript code
    fn step_to_js(&self, step: &TestStep) -> E2eResult<String> {
        let js = match step {
            TestStep::Navigate { url, wait_for_selector } => {
                let wait = match wait_for_selector {
                    Some(s) => format!("\n    await page.waitForSelector({});", js_str(s)?),
                    None => String::new(),
                };
                format!("    await page.goto(baseUrl + {});{}", js_str(url)?, wait)
            }
            TestStep::Click { selector, has_text, inner, force, timeout_ms } => {
                let mut locator = format!(
                    "{}.first()",
                    Self::locator_js(selector, has_text.as_deref())?
                );
                if let Some(inner) = inner {
                    locator.push_str(&format!(".locator({}).first()", js_str(inner)?));
                }
                let timeout = timeout_ms.unwrap_or(self.config.action_timeout_ms);
                format!(
                    "    await {}.click({{ force: {}, timeout: {} }});",
                    locator, force, timeout
                )
            }
            TestStep::Fill { selector, value, clear_first } => {
                let sel = js_str(selector)?;
                let val = js_str(value)?;
                if *clear_first {
                    format!("    await page.fill({sel}, '');\n    await page.fill({sel}, {val});")
                } else {
                    format!("    await page.fill({sel}, {val});")
                }
            }
            TestStep::Type { selector, text, delay_ms } => {
                let delay = delay_ms.unwrap_or(50);
                format!(
                    "    await page.type({}, {}, {{ delay: {} }});",
                    js_str(selector)?,
                    js_str(text)?,
                    delay
                )
            }
            TestStep::Press { selector, key } => match selector {
                Some(sel) => format!(
                    "    await page.locator({}).press({});",
                    js_str(sel)?,
                    js_str(key)?
                ),
                None => format!("    await page.keyboard.press({});", js_str(key)?),
            },
            TestStep::Wait { selector, has_text, timeout_ms, state } => format!(
                "    await {}.first().waitFor({{ state: '{}', timeout: {} }});",
                Self::locator_js(selector, has_text.as_deref())?,
                state.as_str(),
                timeout_ms
            ),
            TestStep::Sleep { ms } => format!("    await page.waitForTimeout({});", ms),
            TestStep::Assert { selector, has_text, visible, text, text_contains, count, timeout_ms } => {
                let locator = Self::locator_js(selector, has_text.as_deref())?;
                let timeout = timeout_ms.unwrap_or(self.config.action_timeout_ms);
                let mut assertions = vec![format!("    {{\n      const loc = {};", locator)];

                if let Some(vis) = visible {
                    let state = if *vis { "visible" } else { "hidden" };
                    assertions.push(format!(
                        "      await loc.first().waitFor({{ state: '{}', timeout: {} }});",
                        state, timeout
                    ));
                }

                if let Some(expected) = text {
                    assertions.push(format!(
                        "      await eventually(async () => (await loc.first().innerText()).trim() === {t}, {timeout}, {msg});",
                        t = js_str(expected)?,
                        timeout = timeout,
                        msg = js_str(&format!("{} should have text {:?}", selector, expected))?,
                    ));
                }

                for expected in text_contains {
                    assertions.push(format!(
                        "      await eventually(async () => (await loc.allInnerTexts()).join('\\n').includes({t}), {timeout}, {msg});",
                        t = js_str(expected)?,
                        timeout = timeout,
                        msg = js_str(&format!("{} should contain {:?}", selector, expected))?,
                    ));
                }

                if let Some(c) = count {
                    assertions.push(format!(
                        "      await eventually(async () => (await loc.count()) === {c}, {timeout}, {msg});",
                        c = c,
                        timeout = timeout,
                        msg = js_str(&format!("{} should match {} element(s)", selector, c))?,
                    ));
                }

                assertions.push("    }".to_string());
                assertions.join("\n")
            }
            TestStep::Intercept { alias, method, url } => {
                let matcher = crate::intercept::RouteMatcher {
                    method: method.as_ref().map(|m| m.to_ascii_uppercase()),
                    url: url.clone(),
                };
                format!(
                    "    intercepts[{}] = page.waitForResponse({}, {{ timeout: 0 }}).then((response) => ({{ response }}), (error) => ({{ error }}));",
                    js_str(alias)?,
                    matcher.to_js_predicate()?
                )
            }
            TestStep::AwaitIntercept { alias, status, timeout_ms } => {
                let status = status.map(|s| s.to_string()).unwrap_or_else(|| "null".to_string());
                format!(
                    r#"    {{
      const observed = await Promise.race([
        intercepts[{alias}],
        page.waitForTimeout({timeout}).then(() => null),
      ]);
      if (!observed) throw new Error({missing});
      if (observed.error) throw observed.error;
      const expectedStatus = {status};
      if (expectedStatus !== null && observed.response.status() !== expectedStatus) {{
        throw new Error({mismatch} + observed.response.status());
      }}
    }}"#,
                    alias = js_str(alias)?,
                    timeout = timeout_ms,
                    missing = js_str(&format!("@{}: no matching response within {} ms", alias, timeout_ms))?,
                    status = status,
                    mismatch = js_str(&format!("@{}: unexpected status ", alias))?,
                )
            }
            TestStep::SetInputFiles { selector, files } => format!(
                "    await page.setInputFiles({}, {});",
                js_str(selector)?,
                serde_json::to_string(&self.fixture_paths(files)?)?
            ),
            TestStep::DropFiles { selector, files } => {
                let entries: Vec<(String, String)> = files
                    .iter()
                    .cloned()
                    .zip(self.fixture_paths(files)?)
                    .collect();
                format!(
                    r#"    {{
      const files = {entries}.map(([relative, absolute]) => ({{
        relative,
        name: path.basename(absolute),
        data: fs.readFileSync(absolute).toString('base64'),
      }}));
      const dataTransfer = await page.evaluateHandle((files) => {{
        const dt = new DataTransfer();
        for (const f of files) {{
          const bytes = Uint8Array.from(atob(f.data), (c) => c.charCodeAt(0));
          const file = new File([bytes], f.name);
          Object.defineProperty(file, 'path', {{ value: f.relative }});
          dt.items.add(file);
        }}
        return dt;
      }}, files);
      await page.dispatchEvent({selector}, 'drop', {{ dataTransfer }});
    }}"#,
                    entries = serde_json::to_string(&entries)?,
                    selector = js_str(selector)?,
                )
            }
            TestStep::Screenshot { name, selector, full_page } => {
                let screenshot_path = self.screenshot_path(name);
                let path_str = js_str(&screenshot_path.to_string_lossy())?;

                if let Some(sel) = selector {
                    format!(
                        "    await page.locator({}).screenshot({{ path: {} }});",
                        js_str(sel)?,
                        path_str
                    )
                } else {
                    format!(
                        "    await page.screenshot({{ path: {}, fullPage: {} }});",
                        path_str, full_page
                    )
                }
            }
            TestStep::Hover { selector } => format!("    await page.hover({});", js_str(selector)?),
            TestStep::Log { message } => {
                format!("    console.log('[TEST] ' + {});", js_str(message)?)
            }
        };
        Ok(js)
    }

    fn screenshot_path(&self, name: &str) -> PathBuf {
        self.config.screenshot_dir.join(format!("{}.png", name))
    }

    /// Execute the full script via Node, returning its stdout
    pub async fn run_script(&self, script: &str) -> E2eResult<String> {
        // Write script to temp file
        let temp_dir = tempfile::tempdir()?;
        let script_path = temp_dir.path().join("test.js");
        std::fs::write(&script_path, script)?;

        debug!("Running Playwright script: {}", script_path.display());

        let mut cmd = TokioCommand::new("node");
        cmd.arg(&script_path).current_dir(temp_dir.path());

        // The script lives in a temp dir, so point module resolution back at
        // the project's node_modules
        if let Some(node_path) = self.node_path()? {
            cmd.env("NODE_PATH", node_path);
        }

        let output = cmd.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        if !output.status.success() && !report_line_re().is_match(&stdout) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(E2eError::Playwright(format!(
                "Script failed:\nstdout: {}\nstderr: {}",
                stdout, stderr
            )));
        }

        Ok(stdout)
    }

    fn node_path(&self) -> E2eResult<Option<PathBuf>> {
        if let Some(path) = &self.config.node_modules {
            return Ok(Some(path.clone()));
        }
        let local = std::env::current_dir()?.join("node_modules");
        Ok(local.is_dir().then_some(local))
    }

    /// Turn the script's report lines into step results
    pub fn parse_report(&self, stdout: &str, steps: &[TestStep]) -> E2eResult<Vec<StepResult>> {
        let mut results = Vec::new();
        let mut finished = false;

        for caps in report_line_re().captures_iter(stdout) {
            let kind = &caps[1];
            let report: StepReport = serde_json::from_str(&caps[2])?;
            let step_name = steps
                .get(report.step)
                .map(TestStep::name)
                .unwrap_or_else(|| format!("step-{}", report.step));

            match kind {
                "STEP" => {
                    let screenshot_path = match steps.get(report.step) {
                        Some(TestStep::Screenshot { name, .. }) => Some(self.screenshot_path(name)),
                        _ => None,
                    };
                    results.push(StepResult {
                        success: true,
                        step_name,
                        duration_ms: report.ms,
                        error: None,
                        page_error: false,
                        screenshot_path,
                    });
                }
                "FAIL" => {
                    warn!("Step {} failed: {}", step_name, report.error.as_deref().unwrap_or("unknown error"));
                    results.push(StepResult {
                        success: false,
                        step_name,
                        duration_ms: report.ms,
                        error: report.error,
                        page_error: report.page_error,
                        screenshot_path: None,
                    });
                    finished = true;
                }
                _ => finished = true,
            }
        }

        if !finished {
            return Err(E2eError::Playwright(format!(
                "script ended without a final report after {} step(s)",
                results.len()
            )));
        }

        info!("Executed {}/{} step(s)", results.iter().filter(|r| r.success).count(), steps.len());
        Ok(results)
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub base_url: String,
    pub screenshot_dir: PathBuf,
    pub fixtures_dir: PathBuf,
    /// `node_modules` holding `playwright`; defaults to `./node_modules`
    pub node_modules: Option<PathBuf>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub browser: Browser,
    pub headless: bool,
    pub action_timeout_ms: u64,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            screenshot_dir: PathBuf::from("test-results/screenshots"),
            fixtures_dir: PathBuf::from("fixtures"),
            node_modules: None,
            viewport_width: 1280,
            viewport_height: 720,
            browser: Browser::Chromium,
            headless: true,
            action_timeout_ms: 10_000,
        }
    }
}

impl PlaywrightConfig {
    /// Target, fixtures and output locations taken from the harness config
    pub fn from_harness(config: &HarnessConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            screenshot_dir: config.output_dir.join("screenshots"),
            fixtures_dir: config.fixtures_dir.clone(),
            action_timeout_ms: config.timeouts.action_ms,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthenticationResult;

    fn handle() -> PlaywrightHandle {
        PlaywrightHandle::unchecked(PlaywrightConfig {
            fixtures_dir: PathBuf::from("/data/fixtures"),
            ..Default::default()
        })
    }

    #[test]
    fn test_session_is_seeded_before_page_scripts() {
        let session = Session::new(
            "client123",
            "ci",
            AuthenticationResult {
                id_token: "id-token".into(),
                access_token: "access".into(),
                refresh_token: None,
                expires_in: None,
            },
        );
        let script = handle()
            .with_session(Some(session))
            .build_script(&[TestStep::Navigate { url: "/data-management".into(), wait_for_selector: None }])
            .unwrap();

        let seed = script.find("addInitScript").unwrap();
        let goto = script.find("page.goto").unwrap();
        assert!(seed < goto);
        assert!(script.contains(r#"["CognitoIdentityServiceProvider.client123.ci.idToken","id-token"]"#));
        assert!(script.contains(r#"["amplify-authenticator-authState","signedIn"]"#));
    }

    #[test]
    fn test_literals_are_escaped() {
        let script = handle()
            .build_script(&[TestStep::Type {
                selector: "#project-name".into(),
                text: "O'Brien \"sample\"".into(),
                delay_ms: None,
            }])
            .unwrap();
        assert!(script.contains(r##"await page.type("#project-name", "O'Brien \"sample\"", { delay: 50 });"##));
    }

    #[test]
    fn test_intercept_is_registered_before_action_and_awaited_after() {
        let steps = vec![
            TestStep::Intercept { alias: "newProject".into(), method: Some("post".into()), url: "*/projects/*".into() },
            TestStep::Click {
                selector: "#confirm-create-new-project".into(),
                has_text: None,
                inner: None,
                force: false,
                timeout_ms: None,
            },
            TestStep::AwaitIntercept { alias: "newProject".into(), status: Some(200), timeout_ms: 30_000 },
        ];
        let script = handle().build_script(&steps).unwrap();

        let register = script.find(r#"intercepts["newProject"] = page.waitForResponse("#).unwrap();
        let click = script.find("#confirm-create-new-project").unwrap();
        let await_at = script.find(r#"intercepts["newProject"],"#).unwrap();
        assert!(register < click && click < await_at);
        assert!(script.contains(r#"r.request().method() === "POST""#));
        assert!(script.contains("const expectedStatus = 200;"));
    }

    #[test]
    fn test_known_issues_are_embedded() {
        let script = handle()
            .with_page_errors(PageErrorFilter::known_issues().unwrap())
            .build_script(&[])
            .unwrap();
        assert!(script.contains(r#"const knownIssues = [new RegExp("ResizeObserver loop limit exceeded")];"#));
    }

    #[test]
    fn test_fixture_paths_are_resolved() {
        let script = handle()
            .build_script(&[TestStep::SetInputFiles {
                selector: "input[type=file]".into(),
                files: vec!["WT1/matrix.mtx".into()],
            }])
            .unwrap();
        assert!(script.contains(r#"["/data/fixtures/WT1/matrix.mtx"]"#));
    }

    #[test]
    fn test_parse_report_with_failure() {
        let steps = vec![
            TestStep::Navigate { url: "/data-management".into(), wait_for_selector: None },
            TestStep::Screenshot { name: "home".into(), selector: None, full_page: false },
            TestStep::Hover { selector: "#missing".into() },
        ];
        let stdout = "\
noise from the app
E2E_STEP {\"step\":0,\"ms\":120}
E2E_STEP {\"step\":1,\"ms\":40}
E2E_FAIL {\"step\":2,\"ms\":10000,\"error\":\"Timeout 10000ms exceeded\",\"page_error\":false}
";
        let results = handle().parse_report(stdout, &steps).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert_eq!(
            results[1].screenshot_path.as_deref(),
            Some(std::path::Path::new("test-results/screenshots/home.png"))
        );
        assert!(!results[2].success);
        assert_eq!(results[2].step_name, "hover:#missing");
    }

    #[test]
    fn test_parse_report_requires_final_line() {
        let steps = vec![TestStep::Sleep { ms: 1 }];
        let err = handle().parse_report("E2E_STEP {\"step\":0,\"ms\":1}\n", &steps).unwrap_err();
        assert!(matches!(err, E2eError::Playwright(_)));
    }
}
