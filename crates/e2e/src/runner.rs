//! Main test runner that orchestrates sign-in, Playwright and the pipeline waiter

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::api::ApiClient;
use crate::auth::{CognitoAuthenticator, Session};
use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::playwright::{PlaywrightConfig, PlaywrightHandle, StepResult};
use crate::scenarios::{AnalysisLauncher, AnalysisRun, Scenario};
use crate::server::TargetProbe;
use crate::socket::StatusFeed;
use crate::spec::{TestSpec, Viewport};
use crate::waiter::CompletionWaiter;

/// Result of running a single test
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub analyses: Vec<AnalysisRun>,
    pub error: Option<String>,
}

impl TestResult {
    fn failed(name: &str, duration_ms: u64, err: &E2eError) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            duration_ms,
            steps: vec![],
            analyses: vec![],
            error: Some(err.to_string()),
        }
    }
}

/// Result of running all tests
#[derive(Debug, Clone, Serialize)]
pub struct TestSuiteResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
}

impl TestSuiteResult {
    fn collect(started_at: DateTime<Utc>, skipped: usize, results: Vec<TestResult>) -> Self {
        let passed = results.iter().filter(|r| r.success).count();
        let failed = results.len() - passed;
        let finished_at = Utc::now();

        Self {
            started_at,
            finished_at,
            total: results.len() + skipped,
            passed,
            failed,
            skipped,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            results,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Main E2E test runner
pub struct TestRunner {
    config: HarnessConfig,

    /// Browser options; viewport is overridden per spec
    playwright_config: PlaywrightConfig,

    /// Signed-in session, once prepared
    session: Option<Session>,

    api: Option<Arc<ApiClient>>,

    waiter: Option<CompletionWaiter>,

    /// Pushed experiment updates; kept alive for the waiter
    feed: Option<StatusFeed>,
}

impl TestRunner {
    pub fn new(config: HarnessConfig, playwright_config: PlaywrightConfig) -> Self {
        Self {
            config,
            playwright_config,
            session: None,
            api: None,
            waiter: None,
            feed: None,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Whether pushed updates are still flowing
    pub fn push_connected(&self) -> bool {
        self.feed.as_ref().is_some_and(StatusFeed::is_connected)
    }

    pub fn is_prepared(&self) -> bool {
        self.session.is_some()
    }

    /// Probe the target, sign in and wire up the status sources
    pub async fn prepare(&mut self) -> E2eResult<()> {
        if self.is_prepared() {
            return Ok(());
        }

        self.config.validate()?;

        TargetProbe::new(self.config.base_url.clone())?
            .wait_until_reachable(Duration::from_secs(self.config.timeouts.probe_secs))
            .await?;

        let session = CognitoAuthenticator::from_config(&self.config)?.sign_in().await?;
        let api = Arc::new(ApiClient::new(&self.config.api_url, Some(session.clone()))?);
        let mut waiter = CompletionWaiter::new(api.clone());

        if let Some(socket_url) = &self.config.socket_url {
            let experiments: Vec<String> = api
                .list_projects()
                .await?
                .into_iter()
                .flat_map(|p| p.experiments)
                .collect();
            let feed = StatusFeed::connect(socket_url, &experiments).await?;
            waiter = waiter.with_updates(feed.sender());
            self.feed = Some(feed);
        } else {
            info!("No socket configured; pipeline status is polled only");
        }

        self.session = Some(session);
        self.api = Some(api);
        self.waiter = Some(waiter);
        Ok(())
    }

    /// Run all tests in the specs directory
    pub async fn run_all(&self) -> E2eResult<TestSuiteResult> {
        let specs = TestSpec::load_all(&self.config.specs_dir)?;
        self.run_specs(&specs).await
    }

    /// Run tests matching a tag
    pub async fn run_tagged(&self, tag: &str) -> E2eResult<TestSuiteResult> {
        let specs = TestSpec::load_all(&self.config.specs_dir)?;
        let filtered: Vec<TestSpec> = TestSpec::filter_by_tag(&specs, tag).into_iter().cloned().collect();
        self.run_specs(&filtered).await
    }

    /// Run a specific test by name
    pub async fn run_test(&self, name: &str) -> E2eResult<TestResult> {
        let spec = self.find_spec(name)?;
        self.run_spec(&spec).await
    }

    pub fn find_spec(&self, name: &str) -> E2eResult<TestSpec> {
        TestSpec::load_all(&self.config.specs_dir)?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| E2eError::SpecParse(format!("Test not found: {}", name)))
    }

    /// Run a list of test specs
    pub async fn run_specs(&self, specs: &[TestSpec]) -> E2eResult<TestSuiteResult> {
        let started_at = Utc::now();
        let mut results = Vec::new();
        let mut skipped = 0;

        info!("Running {} test(s)...", specs.len());

        for spec in specs {
            if spec.authenticated && self.session.is_none() {
                info!("- {} skipped: needs a signed-in session", spec.name);
                skipped += 1;
                continue;
            }

            let start = Instant::now();
            let result = match self.run_spec(spec).await {
                Ok(result) => result,
                Err(e) => TestResult::failed(&spec.name, start.elapsed().as_millis() as u64, &e),
            };
            log_result(&result);
            results.push(result);
        }

        let suite = TestSuiteResult::collect(started_at, skipped, results);
        info!(
            "Test Results: {} passed, {} failed, {} skipped ({} ms)",
            suite.passed, suite.failed, suite.skipped, suite.duration_ms
        );
        Ok(suite)
    }

    /// Run a single test spec in one browser session
    pub async fn run_spec(&self, spec: &TestSpec) -> E2eResult<TestResult> {
        let start = Instant::now();
        debug!("Running test: {}", spec.name);

        let session = if spec.authenticated {
            Some(self.require_session()?.clone())
        } else {
            None
        };
        let playwright = self.browser(&spec.viewport, session)?;

        let steps = playwright.execute_steps(&spec.steps).await?;
        let error = steps.iter().find(|s| !s.success).map(|s| {
            let reason = s.error.clone().unwrap_or_else(|| "unknown error".to_string());
            if s.page_error {
                E2eError::UncaughtPageError(reason).to_string()
            } else {
                E2eError::StepFailed { step: s.step_name.clone(), reason }.to_string()
            }
        });

        Ok(TestResult {
            name: spec.name.clone(),
            success: error.is_none(),
            duration_ms: start.elapsed().as_millis() as u64,
            steps,
            analyses: vec![],
            error,
        })
    }

    /// Run built-in scenarios in order
    pub async fn run_scenarios(&self, scenarios: &[Scenario]) -> E2eResult<TestSuiteResult> {
        let started_at = Utc::now();
        let mut results = Vec::new();

        for scenario in scenarios {
            let start = Instant::now();
            let result = match self.run_scenario(scenario).await {
                Ok(result) => result,
                Err(e) => TestResult::failed(scenario.name(), start.elapsed().as_millis() as u64, &e),
            };
            log_result(&result);
            results.push(result);
        }

        Ok(TestSuiteResult::collect(started_at, 0, results))
    }

    pub async fn run_scenario(&self, scenario: &Scenario) -> E2eResult<TestResult> {
        self.check_fixtures(scenario)?;
        if let Some(spec) = scenario.ui_spec() {
            return self.run_spec(&spec).await;
        }

        let start = Instant::now();
        let (api, waiter) = match (&self.api, &self.waiter) {
            (Some(api), Some(waiter)) => (api, waiter),
            _ => return Err(E2eError::Config("runner is not prepared: call prepare() first".into())),
        };

        let browser = self.browser(&Viewport::default(), Some(self.require_session()?.clone()))?;
        let analyses = AnalysisLauncher::new(&self.config, api, waiter, &browser).run().await?;
        let steps = analyses.iter().flat_map(|a| a.steps.iter().cloned()).collect();

        Ok(TestResult {
            name: scenario.name().to_string(),
            success: true,
            duration_ms: start.elapsed().as_millis() as u64,
            steps,
            analyses,
            error: None,
        })
    }

    /// Build the Playwright script for a spec without running it
    pub fn script_for(&self, spec: &TestSpec) -> E2eResult<String> {
        let session = if spec.authenticated { self.session.clone() } else { None };
        let mut config = self.playwright_config.clone();
        config.viewport_width = spec.viewport.width;
        config.viewport_height = spec.viewport.height;

        PlaywrightHandle::unchecked(config)
            .with_session(session)
            .with_page_errors(self.config.page_error_filter()?)
            .build_script(&spec.steps)
    }

    /// Write test results to JSON file
    pub fn write_results(&self, results: &TestSuiteResult) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let path = self.config.output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }

    /// Fail before opening a browser when an upload has nothing to upload
    fn check_fixtures(&self, scenario: &Scenario) -> E2eResult<()> {
        let missing: Vec<String> = scenario
            .fixture_files()
            .iter()
            .map(|file| self.config.fixtures_dir.join(file))
            .filter(|path| !path.is_file())
            .map(|path| path.display().to_string())
            .collect();

        if missing.is_empty() {
            return Ok(());
        }
        Err(E2eError::Config(format!(
            "missing sample fixtures under {}: {}",
            self.config.fixtures_dir.display(),
            missing.join(", ")
        )))
    }

    fn require_session(&self) -> E2eResult<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| E2eError::Config("no signed-in session: call prepare() first".into()))
    }

    fn browser(&self, viewport: &Viewport, session: Option<Session>) -> E2eResult<PlaywrightHandle> {
        let mut config = self.playwright_config.clone();
        config.viewport_width = viewport.width;
        config.viewport_height = viewport.height;

        Ok(PlaywrightHandle::new(config)?
            .with_session(session)
            .with_page_errors(self.config.page_error_filter()?))
    }
}

fn log_result(result: &TestResult) {
    if result.success {
        info!("✓ {} ({} ms)", result.name, result.duration_ms);
    } else {
        error!("✗ {} - {}", result.name, result.error.as_deref().unwrap_or("unknown error"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::TestStep;

    fn runner(dir: &std::path::Path) -> TestRunner {
        let config = HarnessConfig {
            specs_dir: dir.join("specs"),
            fixtures_dir: dir.join("fixtures"),
            output_dir: dir.join("out"),
            ..Default::default()
        };
        let playwright = PlaywrightConfig::from_harness(&config);
        TestRunner::new(config, playwright)
    }

    #[tokio::test]
    async fn test_authenticated_specs_are_skipped_before_sign_in() {
        let dir = tempfile::tempdir().unwrap();
        let spec = TestSpec::new("needs-login", vec![TestStep::Sleep { ms: 1 }]);

        let suite = runner(dir.path()).run_specs(&[spec]).await.unwrap();
        assert_eq!(suite.total, 1);
        assert_eq!(suite.skipped, 1);
        assert!(suite.results.is_empty());
        assert!(suite.success());
    }

    #[tokio::test]
    async fn test_launch_analysis_requires_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let err = runner(dir.path()).run_scenario(&Scenario::LaunchAnalysis).await.unwrap_err();
        assert!(matches!(err, E2eError::Config(_)));
    }

    #[tokio::test]
    async fn test_upload_without_fixtures_fails_early() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let upload = Scenario::from_name("upload-sample").unwrap();

        let err = runner.run_scenario(&upload).await.unwrap_err();
        match err {
            E2eError::Config(reason) => {
                assert!(reason.contains("WT1/matrix.mtx"));
                assert!(reason.contains("WT1/features.tsv"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let sample = dir.path().join("fixtures/WT1");
        std::fs::create_dir_all(&sample).unwrap();
        for file in ["matrix.mtx", "barcodes.tsv", "features.tsv"] {
            std::fs::write(sample.join(file), "").unwrap();
        }
        runner.check_fixtures(&upload).unwrap();
        runner.check_fixtures(&Scenario::LaunchAnalysis).unwrap();
    }

    #[test]
    fn test_unknown_test_name() {
        let dir = tempfile::tempdir().unwrap();
        let specs = dir.path().join("specs");
        std::fs::create_dir_all(&specs).unwrap();
        std::fs::write(
            specs.join("home.yaml"),
            "name: home\nauthenticated: false\nsteps:\n  - action: navigate\n    url: /\n",
        )
        .unwrap();

        let runner = runner(dir.path());
        assert_eq!(runner.find_spec("home").unwrap().name, "home");
        assert!(matches!(runner.find_spec("missing"), Err(E2eError::SpecParse(_))));
    }

    #[test]
    fn test_script_for_unauthenticated_spec_has_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = TestSpec::new("public", vec![TestStep::Navigate { url: "/".into(), wait_for_selector: None }]);
        spec.authenticated = false;
        spec.viewport = Viewport { width: 1920, height: 1080 };

        let script = runner(dir.path()).script_for(&spec).unwrap();
        assert!(!script.contains("CognitoIdentityServiceProvider"));
        assert!(script.contains("1920"));
        assert!(script.contains("ResizeObserver loop limit exceeded"));
    }

    #[test]
    fn test_write_results() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let failed = TestResult::failed("create-project", 12, &E2eError::AssertionFailed("no card".into()));
        let suite = TestSuiteResult::collect(Utc::now(), 0, vec![failed]);
        assert!(!suite.success());

        let path = runner.write_results(&suite).unwrap();
        let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["failed"], 1);
        assert_eq!(written["results"][0]["error"], "Assertion failed: no card");
        assert!(written["results"][0].get("analyses").is_none());
        assert!(written["started_at"].is_string());
    }
}
