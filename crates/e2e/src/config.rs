//! Harness configuration
//!
//! Everything a scenario needs is carried in [`HarnessConfig`] and passed
//! explicitly. Layers, lowest precedence first: built-in defaults, an
//! optional TOML file, `E2E_*` environment variables, CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{E2eError, E2eResult};
use crate::page_errors::{PageErrorFilter, RESIZE_OBSERVER_LOOP};
use crate::pipeline::PipelineStage;
use crate::waiter::WaitPolicy;

/// Upper bound for any configured wait, in seconds
pub const MAX_WAIT_SECS: u64 = 24 * 60 * 60;

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Base URL of the UI under test
    pub base_url: String,

    /// Base URL of the API (without the `/v1` suffix)
    pub api_url: String,

    /// Socket.IO endpoint for pushed experiment updates
    pub socket_url: Option<String>,

    /// Test account
    pub credentials: Credentials,

    /// Hosted identity provider
    pub identity: IdentityConfig,

    /// Wait and probe timeouts
    pub timeouts: TimeoutConfig,

    /// Regexes of uncaught page errors tolerated as known issues
    pub known_page_errors: Vec<String>,

    /// Directory holding sample files.
    ///
    /// The upload scenario expects `WT1/matrix.mtx`, `WT1/barcodes.tsv` and
    /// `WT1/features.tsv` below it.
    pub fixtures_dir: PathBuf,

    /// Directory of YAML test specs
    pub specs_dir: PathBuf,

    /// Output directory for results and screenshots
    pub output_dir: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            api_url: "http://localhost:3000".to_string(),
            socket_url: None,
            credentials: Credentials::default(),
            identity: IdentityConfig::default(),
            timeouts: TimeoutConfig::default(),
            known_page_errors: vec![regex::escape(RESIZE_OBSERVER_LOOP)],
            fixtures_dir: PathBuf::from("fixtures"),
            specs_dir: PathBuf::from("specs"),
            output_dir: PathBuf::from("test-results"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Cognito user pool, e.g. `eu-west-1_AbCdEf`
    pub user_pool_id: Option<String>,

    /// App client id of the web UI
    pub client_id: Option<String>,

    /// AWS region; derived from the user pool id when unset
    pub region: Option<String>,

    /// Override of the identity provider endpoint
    pub endpoint: Option<String>,
}

impl IdentityConfig {
    pub fn region(&self) -> Option<String> {
        self.region.clone().or_else(|| {
            self.user_pool_id
                .as_deref()
                .and_then(|id| id.split_once('_'))
                .map(|(region, _)| region.to_string())
        })
    }

    /// Identity provider endpoint URL
    pub fn endpoint(&self) -> E2eResult<String> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.clone());
        }
        let region = self.region().ok_or_else(|| {
            E2eError::Config("identity region unknown: set E2E_REGION or E2E_USER_POOL_ID".into())
        })?;
        Ok(format!("https://cognito-idp.{}.amazonaws.com/", region))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub gem2s_secs: u64,
    pub qc_secs: u64,
    pub poll_interval_secs: u64,
    pub max_poll_interval_secs: u64,

    /// How long to wait for the UI to become reachable
    pub probe_secs: u64,

    /// Default Playwright action timeout
    pub action_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            gem2s_secs: PipelineStage::Gem2s.default_timeout().as_secs(),
            qc_secs: PipelineStage::Qc.default_timeout().as_secs(),
            poll_interval_secs: 5,
            max_poll_interval_secs: 30,
            probe_secs: 30,
            action_ms: 10_000,
        }
    }
}

impl HarnessConfig {
    /// Defaults, overlaid with a TOML file when given, then the environment
    pub fn load(path: Option<&Path>) -> E2eResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> E2eResult<Self> {
        toml::from_str(content).map_err(E2eError::from)
    }

    pub fn from_file(path: &Path) -> E2eResult<Self> {
        debug!("Loading config from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Apply `E2E_*` overrides from a variable lookup
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("E2E_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("E2E_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = lookup("E2E_SOCKET_URL") {
            self.socket_url = Some(v);
        }
        if let Some(v) = lookup("E2E_USERNAME") {
            self.credentials.username = Some(v);
        }
        if let Some(v) = lookup("E2E_PASSWORD") {
            self.credentials.password = Some(v);
        }
        if let Some(v) = lookup("E2E_USER_POOL_ID") {
            self.identity.user_pool_id = Some(v);
        }
        if let Some(v) = lookup("E2E_CLIENT_ID") {
            self.identity.client_id = Some(v);
        }
        if let Some(v) = lookup("E2E_REGION") {
            self.identity.region = Some(v);
        }
    }

    /// Check everything a login needs is present
    pub fn validate(&self) -> E2eResult<()> {
        let missing: Vec<&str> = [
            ("E2E_USERNAME", self.credentials.username.is_none()),
            ("E2E_PASSWORD", self.credentials.password.is_none()),
            ("E2E_USER_POOL_ID", self.identity.user_pool_id.is_none()),
            ("E2E_CLIENT_ID", self.identity.client_id.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        if !missing.is_empty() {
            return Err(E2eError::Config(format!("missing settings: {}", missing.join(", "))));
        }
        if self.timeouts.gem2s_secs == 0 || self.timeouts.qc_secs == 0 {
            return Err(E2eError::Config("stage timeouts must be positive".into()));
        }
        let waits = [
            ("gem2s_secs", self.timeouts.gem2s_secs),
            ("qc_secs", self.timeouts.qc_secs),
            ("poll_interval_secs", self.timeouts.poll_interval_secs),
            ("max_poll_interval_secs", self.timeouts.max_poll_interval_secs),
            ("probe_secs", self.timeouts.probe_secs),
            ("action_ms", self.timeouts.action_ms / 1000),
        ];
        if let Some((name, secs)) = waits.into_iter().find(|(_, secs)| *secs > MAX_WAIT_SECS) {
            return Err(E2eError::Config(format!(
                "timeouts.{} is {}s, more than the {}s limit",
                name, secs, MAX_WAIT_SECS
            )));
        }
        self.identity.endpoint()?;
        Ok(())
    }

    pub fn timeout_for(&self, stage: PipelineStage) -> Duration {
        match stage {
            PipelineStage::Gem2s => Duration::from_secs(self.timeouts.gem2s_secs),
            PipelineStage::Qc => Duration::from_secs(self.timeouts.qc_secs),
        }
    }

    /// Wait policy for a stage as configured at this call site
    pub fn wait_policy(&self, stage: PipelineStage) -> WaitPolicy {
        WaitPolicy::for_stage(stage)
            .with_timeout(self.timeout_for(stage))
            .with_poll_interval(Duration::from_secs(self.timeouts.poll_interval_secs))
            .with_backoff(1.5, Duration::from_secs(self.timeouts.max_poll_interval_secs))
    }

    pub fn page_error_filter(&self) -> E2eResult<PageErrorFilter> {
        PageErrorFilter::from_patterns(&self.known_page_errors)
    }
}
