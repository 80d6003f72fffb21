//! Built-in smoke scenarios
//!
//! UI-only scenarios compile to a [`TestSpec`]. Launching an analysis also
//! needs the completion waiter, so it runs through [`AnalysisLauncher`].

use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::commands::{
    self, AddFileMode, PROJECT_CARD, PROJECT_DETAILS, SAMPLE_FILES, SAMPLE_NAME, SAMPLE_NAME_CELL,
};
use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::intercept;
use crate::pipeline::{JobId, PipelineStage};
use crate::playwright::{PlaywrightHandle, StepResult};
use crate::spec::{TestSpec, TestStep};
use crate::waiter::{CompletionWaiter, WaitOutcome};

pub const PROJECT_NAME: &str = "Pequeninos Sample";
pub const PROJECT_DESCRIPTION: &str = "Tissue sample from varelse species known as pequeninos.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scenario", rename_all = "snake_case")]
pub enum Scenario {
    CreateProject { name: String, description: String },
    DeleteProject { name: String },
    UploadSample { project: String, mode: AddFileMode },
    EditMetadata { project: String },
    LaunchAnalysis,
}

impl Scenario {
    pub fn name(&self) -> &'static str {
        match self {
            Scenario::CreateProject { .. } => "create-project",
            Scenario::DeleteProject { .. } => "delete-project",
            Scenario::UploadSample { .. } => "upload-sample",
            Scenario::EditMetadata { .. } => "edit-metadata",
            Scenario::LaunchAnalysis => "launch-analysis",
        }
    }

    /// Scenario by name, with the default project fixture
    pub fn from_name(name: &str) -> Option<Self> {
        let project = PROJECT_NAME.to_string();
        match name {
            "create-project" => Some(Scenario::CreateProject {
                name: project,
                description: PROJECT_DESCRIPTION.to_string(),
            }),
            "delete-project" => Some(Scenario::DeleteProject { name: project }),
            "upload-sample" => Some(Scenario::UploadSample {
                project,
                mode: AddFileMode::DragAndDrop,
            }),
            "edit-metadata" => Some(Scenario::EditMetadata { project }),
            "launch-analysis" => Some(Scenario::LaunchAnalysis),
            _ => None,
        }
    }

    /// Project smoke suite: create then delete the fixture project
    pub fn project_smoke() -> Vec<Self> {
        ["create-project", "delete-project"]
            .into_iter()
            .filter_map(Self::from_name)
            .collect()
    }

    /// Files the scenario uploads, relative to the fixtures directory
    pub fn fixture_files(&self) -> &'static [&'static str] {
        match self {
            Scenario::UploadSample { .. } => &SAMPLE_FILES,
            _ => &[],
        }
    }

    /// Spec for scenarios that only drive the UI
    pub fn ui_spec(&self) -> Option<TestSpec> {
        match self {
            Scenario::CreateProject { name, description } => Some(create_project_spec(name, description)),
            Scenario::DeleteProject { name } => Some(delete_project_spec(name)),
            Scenario::UploadSample { project, mode } => Some(upload_sample_spec(project, *mode)),
            Scenario::EditMetadata { project } => Some(edit_metadata_spec(project)),
            Scenario::LaunchAnalysis => None,
        }
    }
}

pub fn create_project_spec(name: &str, description: &str) -> TestSpec {
    let mut steps = vec![TestStep::Intercept {
        alias: "newProject".to_string(),
        method: Some("POST".to_string()),
        url: "*/projects/*".to_string(),
    }];
    steps.extend(commands::visit("/data-management"));
    steps.extend(commands::create_project(name, description));
    steps.push(TestStep::AwaitIntercept {
        alias: "newProject".to_string(),
        status: None,
        timeout_ms: 30_000,
    });
    steps.push(TestStep::Assert {
        selector: PROJECT_DETAILS.to_string(),
        has_text: None,
        visible: Some(true),
        text: None,
        text_contains: vec![name.to_string(), description.to_string()],
        count: None,
        timeout_ms: None,
    });
    steps.push(TestStep::Assert {
        selector: PROJECT_CARD.to_string(),
        has_text: None,
        visible: None,
        text: None,
        text_contains: vec![name.to_string()],
        count: None,
        timeout_ms: None,
    });

    TestSpec::new("create-project", steps)
        .with_description("Creates a new project when authenticated")
}

pub fn delete_project_spec(name: &str) -> TestSpec {
    let mut steps = vec![TestStep::Intercept {
        alias: "deleteProject".to_string(),
        method: Some("DELETE".to_string()),
        url: "*/projects/*".to_string(),
    }];
    steps.extend(commands::visit("/data-management"));
    steps.extend(commands::delete_project(name));
    steps.push(TestStep::AwaitIntercept {
        alias: "deleteProject".to_string(),
        status: None,
        timeout_ms: 30_000,
    });
    steps.push(TestStep::Assert {
        selector: PROJECT_CARD.to_string(),
        has_text: Some(name.to_string()),
        visible: None,
        text: None,
        text_contains: Vec::new(),
        count: Some(0),
        timeout_ms: None,
    });

    TestSpec::new("delete-project", steps).with_description("Deletes a project when authenticated")
}

pub fn upload_sample_spec(project: &str, mode: AddFileMode) -> TestSpec {
    let mut steps = commands::visit("/data-management");
    steps.extend(commands::select_project(project));
    steps.extend(commands::add_sample(mode));
    steps.push(TestStep::Assert {
        selector: SAMPLE_NAME_CELL.to_string(),
        has_text: Some(SAMPLE_NAME.to_string()),
        visible: Some(true),
        text: None,
        text_contains: Vec::new(),
        count: None,
        timeout_ms: Some(60_000),
    });
    steps.extend(commands::remove_sample(SAMPLE_NAME));
    steps.push(TestStep::Assert {
        selector: SAMPLE_NAME_CELL.to_string(),
        has_text: Some(SAMPLE_NAME.to_string()),
        visible: None,
        text: None,
        text_contains: Vec::new(),
        count: Some(0),
        timeout_ms: None,
    });

    TestSpec::new("upload-sample", steps).with_description("Uploads and removes the WT1 sample")
}

pub fn edit_metadata_spec(project: &str) -> TestSpec {
    let mut steps = commands::visit("/data-management");
    steps.extend(commands::select_project(project));
    steps.extend(commands::add_metadata());
    steps.push(TestStep::Assert {
        selector: ".ant-table-cell".to_string(),
        has_text: Some("Track 1".to_string()),
        visible: Some(true),
        text: None,
        text_contains: Vec::new(),
        count: None,
        timeout_ms: None,
    });
    steps.extend(commands::delete_metadata("Track 1"));
    steps.push(TestStep::Assert {
        selector: ".ant-table-cell".to_string(),
        has_text: Some("Track 1".to_string()),
        visible: None,
        text: None,
        text_contains: Vec::new(),
        count: Some(0),
        timeout_ms: None,
    });

    TestSpec::new("edit-metadata", steps).with_description("Adds and deletes a metadata track")
}

/// Select a project and launch its analysis, until Data Processing shows up
pub fn launch_steps(project: &str, gem2s_timeout: Duration) -> Vec<TestStep> {
    let mut steps = vec![
        TestStep::Intercept {
            alias: "getProjects".to_string(),
            method: Some("GET".to_string()),
            url: "**/projects".to_string(),
        },
        TestStep::Intercept {
            alias: "getExperiment".to_string(),
            method: Some("GET".to_string()),
            url: "**/experiments".to_string(),
        },
    ];
    steps.extend(commands::visit("/data-management"));
    steps.push(TestStep::AwaitIntercept {
        alias: "getProjects".to_string(),
        status: Some(200),
        timeout_ms: 30_000,
    });
    steps.extend(commands::select_project(project));
    steps.push(TestStep::AwaitIntercept {
        alias: "getExperiment".to_string(),
        status: None,
        timeout_ms: 30_000,
    });
    steps.extend(commands::launch_analysis());
    steps.extend(commands::expect_page_header(
        "Data Processing",
        gem2s_timeout.as_millis() as u64,
    ));
    steps
}

/// After QC: reopen data processing and go back to Data Management
pub fn return_steps(experiment_id: &str) -> Vec<TestStep> {
    let mut steps = commands::visit(&format!("/experiments/{}/data-processing", experiment_id));
    steps.extend(commands::expect_page_header("Data Processing", 60_000));
    steps.extend(commands::navigate_to("Data Management"));
    steps.extend(commands::expect_page_header("Data Management", 30_000));
    steps
}

/// One launched analysis
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRun {
    pub project: String,
    pub experiment_id: String,
    pub gem2s: WaitOutcome,
    pub qc: WaitOutcome,
    pub steps: Vec<StepResult>,
}

/// Launches the analysis of every project and waits for GEM2S and QC
pub struct AnalysisLauncher<'a> {
    config: &'a HarnessConfig,
    api: &'a ApiClient,
    waiter: &'a CompletionWaiter,
    browser: &'a PlaywrightHandle,
}

impl<'a> AnalysisLauncher<'a> {
    pub fn new(
        config: &'a HarnessConfig,
        api: &'a ApiClient,
        waiter: &'a CompletionWaiter,
        browser: &'a PlaywrightHandle,
    ) -> Self {
        Self { config, api, waiter, browser }
    }

    pub async fn run(&self) -> E2eResult<Vec<AnalysisRun>> {
        let projects = self.api.list_projects().await?;
        if projects.is_empty() {
            return Err(E2eError::AssertionFailed("no projects to launch".into()));
        }

        let mut runs = Vec::new();
        for project in &projects {
            match project.primary_experiment() {
                Some(experiment_id) => runs.push(self.launch(&project.name, experiment_id).await?),
                None => warn!("Project {} has no experiment; skipping", project.name),
            }
        }
        Ok(runs)
    }

    pub async fn launch(&self, project: &str, experiment_id: &str) -> E2eResult<AnalysisRun> {
        info!("Launching analysis of {} ({})", project, experiment_id);

        // Subscribe to both stages before the launch click so no pushed
        // update is missed; statuses left from an earlier run are ignored
        let gem2s = self
            .waiter
            .arm(JobId::gem2s(experiment_id), self.config.wait_policy(PipelineStage::Gem2s).fresh_only())
            .await?;
        let qc = self
            .waiter
            .arm(JobId::qc(experiment_id), self.config.wait_policy(PipelineStage::Qc).fresh_only())
            .await?;

        let launch = launch_steps(project, self.config.timeout_for(PipelineStage::Gem2s));
        let (mut steps, gem2s) = intercept::arm(gem2s.job().to_string(), gem2s.wait())
            .then(self.browser.run_steps(&launch))
            .await?;

        let qc = qc.wait().await?;

        steps.extend(self.browser.run_steps(&return_steps(experiment_id)).await?);

        Ok(AnalysisRun {
            project: project.to_string(),
            experiment_id: experiment_id.to_string(),
            gem2s,
            qc,
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(steps: &[TestStep], name: &str) -> usize {
        steps
            .iter()
            .position(|s| s.name() == name)
            .unwrap_or_else(|| panic!("no step {name}"))
    }

    #[test]
    fn test_builtin_specs_are_valid() {
        for name in ["create-project", "delete-project", "upload-sample", "edit-metadata"] {
            let spec = Scenario::from_name(name).unwrap().ui_spec().unwrap();
            assert_eq!(spec.name, name);
            spec.validate().unwrap();
        }
        assert!(Scenario::LaunchAnalysis.ui_spec().is_none());
        assert!(Scenario::from_name("unknown").is_none());
    }

    #[test]
    fn test_create_project_awaits_request_before_asserting() {
        let spec = create_project_spec(PROJECT_NAME, PROJECT_DESCRIPTION);
        let confirm = position(&spec.steps, "click:#confirm-create-new-project");
        let awaited = position(&spec.steps, "await:@newProject");
        let details = position(&spec.steps, "assert:#project-details");
        assert!(confirm < awaited && awaited < details);
    }

    #[test]
    fn test_delete_project_expects_no_card() {
        let spec = delete_project_spec(PROJECT_NAME);
        match spec.steps.last().unwrap() {
            TestStep::Assert { has_text, count, .. } => {
                assert_eq!(has_text.as_deref(), Some(PROJECT_NAME));
                assert_eq!(*count, Some(0));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_launch_steps_wait_for_data_processing_with_stage_timeout() {
        let steps = launch_steps(PROJECT_NAME, Duration::from_secs(300));
        TestSpec::new("launch", steps.clone()).validate().unwrap();

        let selected = position(&steps, &format!("click:{}[{}]", PROJECT_CARD, PROJECT_NAME));
        let experiments = position(&steps, "await:@getExperiment");
        assert!(selected < experiments);

        match steps.last().unwrap() {
            TestStep::Wait { has_text, timeout_ms, .. } => {
                assert_eq!(has_text.as_deref(), Some("Data Processing"));
                assert_eq!(*timeout_ms, 300_000);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_project_smoke_order() {
        let names: Vec<_> = Scenario::project_smoke().iter().map(Scenario::name).collect();
        assert_eq!(names, vec!["create-project", "delete-project"]);
    }
}
