//! Biomage E2E Test Framework
//!
//! This crate drives smoke tests against a deployed Biomage UI:
//! - Signs in against the hosted identity provider and seeds the session
//!   into the browser before the first page load
//! - Controls Playwright through generated Node scripts
//! - Parses declarative YAML test specs and runs built-in scenarios
//! - Waits for long-running pipeline jobs (GEM2S, QC) by polling the API,
//!   woken early by pushed Socket.IO updates
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    E2E Test Runner (Rust)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestRunner                                                 │
//! │    ├── prepare(): probe target, sign in, connect feed       │
//! │    ├── run_spec(spec: TestSpec) -> TestResult               │
//! │    └── run_scenario(scenario) -> TestResult                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CompletionWaiter                                           │
//! │    ├── arm(job, policy) -> ArmedWait   (before the action)  │
//! │    └── ArmedWait::wait() -> Succeeded | PipelineFailed      │
//! │                               | Timeout                     │
//! │         sources: ApiClient (poll) + StatusFeed (push)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  intercept::arm(label, observation).then(action)            │
//! │    observation is registered before the action runs         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestSpec (YAML)                                            │
//! │    ├── name, description, tags, authenticated              │
//! │    └── steps: navigate | click | type | wait | assert |     │
//! │              intercept | await_intercept | drop_files | ... │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod intercept;
pub mod page_errors;
pub mod pipeline;
pub mod playwright;
pub mod runner;
pub mod scenarios;
pub mod server;
pub mod socket;
pub mod spec;
pub mod waiter;

pub use config::HarnessConfig;
pub use error::{E2eError, E2eResult};
pub use pipeline::{JobId, JobStatus, PipelineStage};
pub use runner::TestRunner;
pub use scenarios::Scenario;
pub use spec::{TestSpec, TestStep};
pub use waiter::{CompletionWaiter, StatusSource, WaitOutcome, WaitPolicy};
