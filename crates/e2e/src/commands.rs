//! UI commands: reusable step sequences for the Biomage UI
//!
//! Each command expands into plain [`TestStep`]s; sign-in is not a step but
//! a [`crate::auth::Session`] handed to the browser driver.

use serde::{Deserialize, Serialize};

use crate::spec::{TestStep, WaitState};

pub const PROJECT_CARD: &str = r#"[data-test-class="data-test-project-card"]"#;
pub const PROJECT_DETAILS: &str = "#project-details";
pub const PAGE_HEADER: &str = ".data-test-page-header";
pub const SAMPLE_NAME_CELL: &str = r#"[data-test-id="data-test-sample-cell-name-text"]"#;
pub const FILE_DROPZONE: &str = r#"[data-test-id="file-upload-dropzone"]"#;
pub const FILE_INPUT: &str = r#"[data-test-id="file-upload-dropzone"] input[type="file"]"#;

/// Files of the `WT1` sample, relative to the fixtures directory
pub const SAMPLE_FILES: [&str; 3] = ["WT1/matrix.mtx", "WT1/barcodes.tsv", "WT1/features.tsv"];
pub const SAMPLE_NAME: &str = "WT1";

/// How sample files are handed to the upload modal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddFileMode {
    DragAndDrop,
    SelectInput,
}

fn click(selector: &str) -> TestStep {
    TestStep::Click {
        selector: selector.to_string(),
        has_text: None,
        inner: None,
        force: false,
        timeout_ms: None,
    }
}

fn click_containing(selector: &str, text: &str, inner: Option<&str>) -> TestStep {
    TestStep::Click {
        selector: selector.to_string(),
        has_text: Some(text.to_string()),
        inner: inner.map(String::from),
        force: false,
        timeout_ms: None,
    }
}

fn type_into(selector: &str, text: &str) -> TestStep {
    TestStep::Type {
        selector: selector.to_string(),
        text: text.to_string(),
        delay_ms: Some(10),
    }
}

pub fn visit(url: &str) -> Vec<TestStep> {
    vec![TestStep::Navigate {
        url: url.to_string(),
        wait_for_selector: None,
    }]
}

pub fn create_project(name: &str, description: &str) -> Vec<TestStep> {
    vec![
        TestStep::Log { message: format!("Creating project named {}", name) },
        // The modal trigger can be covered by the empty-state overlay
        TestStep::Click {
            selector: "#create-new-project-modal".to_string(),
            has_text: None,
            inner: None,
            force: true,
            timeout_ms: None,
        },
        type_into("#project-name", name),
        type_into("#project-description", description),
        click("#confirm-create-new-project"),
    ]
}

pub fn delete_project(name: &str) -> Vec<TestStep> {
    vec![
        TestStep::Log { message: format!("Deleting project named {}", name) },
        click_containing(".project-card", name, Some(".anticon-delete")),
        type_into(".delete-project-modal input", name),
        click_containing("button", "Permanently delete project", None),
    ]
}

pub fn select_project(name: &str) -> Vec<TestStep> {
    vec![
        TestStep::Log { message: format!("Selecting project named {}", name) },
        click_containing(PROJECT_CARD, name, None),
    ]
}

pub fn add_metadata() -> Vec<TestStep> {
    vec![
        TestStep::Log { message: "Adding metadata track".to_string() },
        click_containing("button", "Add metadata", None),
        click_containing(".ant-popover", "Provide new metadata track name", Some(".anticon-check")),
    ]
}

pub fn delete_metadata(track: &str) -> Vec<TestStep> {
    vec![
        TestStep::Log { message: format!("Deleting metadata track named {}", track) },
        click_containing(".ant-table-cell", track, Some(".anticon-delete")),
    ]
}

pub fn add_sample(mode: AddFileMode) -> Vec<TestStep> {
    let files: Vec<String> = SAMPLE_FILES.iter().map(|f| f.to_string()).collect();
    let attach = match mode {
        AddFileMode::DragAndDrop => TestStep::DropFiles {
            selector: FILE_DROPZONE.to_string(),
            files,
        },
        AddFileMode::SelectInput => TestStep::SetInputFiles {
            selector: FILE_INPUT.to_string(),
            files,
        },
    };

    vec![
        TestStep::Log { message: "Adding sample files".to_string() },
        click(r#"[data-test-id="add-samples-button"]"#),
        attach,
        click(r#"[data-test-id="file-upload-button"]"#),
    ]
}

pub fn remove_sample(name: &str) -> Vec<TestStep> {
    vec![
        TestStep::Log { message: format!("Removing sample {}", name) },
        TestStep::Wait {
            selector: SAMPLE_NAME_CELL.to_string(),
            has_text: Some(name.to_string()),
            timeout_ms: 10_000,
            state: WaitState::Visible,
        },
        click(r#"[data-test-class="data-test-delete-editable-field-button"]"#),
    ]
}

pub fn launch_analysis() -> Vec<TestStep> {
    vec![
        TestStep::Log { message: "Launching analysis".to_string() },
        click_containing("button", "Launch analysis", None),
    ]
}

/// Switch page through the navigation menu
pub fn navigate_to(page: &str) -> Vec<TestStep> {
    vec![click_containing(".ant-menu-item", page, None)]
}

pub fn expect_page_header(title: &str, timeout_ms: u64) -> Vec<TestStep> {
    vec![TestStep::Wait {
        selector: PAGE_HEADER.to_string(),
        has_text: Some(title.to_string()),
        timeout_ms,
        state: WaitState::Visible,
    }]
}
