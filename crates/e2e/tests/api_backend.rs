//! Sign-in, API client and HTTP polling against a fake backend

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use biomage_e2e::api::ApiClient;
use biomage_e2e::auth::CognitoAuthenticator;
use biomage_e2e::{CompletionWaiter, E2eError, HarnessConfig, JobId, JobStatus, PipelineStage, WaitPolicy};

const ID_TOKEN: &str = "id-token";

#[derive(Clone, Default)]
struct Backend {
    /// backendStatus calls per experiment
    calls: Arc<Mutex<HashMap<String, usize>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", ID_TOKEN))
}

async fn initiate_auth(headers: HeaderMap, body: String) -> impl IntoResponse {
    let target = headers.get("x-amz-target").and_then(|v| v.to_str().ok());
    if target != Some("AWSCognitoIdentityProviderService.InitiateAuth") {
        return (StatusCode::BAD_REQUEST, Json(json!({"__type": "UnknownOperationException"})));
    }

    let body: Value = serde_json::from_str(&body).unwrap_or_default();
    if body["AuthFlow"] != "USER_PASSWORD_AUTH" || body["AuthParameters"]["PASSWORD"] != "hunter2" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"__type": "NotAuthorizedException", "message": "Incorrect username or password."})),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "AuthenticationResult": {
                "IdToken": ID_TOKEN,
                "AccessToken": "access-token",
                "RefreshToken": "refresh-token",
                "ExpiresIn": 3600
            }
        })),
    )
}

async fn projects(headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "unauthorized"})));
    }
    (
        StatusCode::OK,
        Json(json!([
            {
                "uuid": "p1",
                "name": "Pequeninos Sample",
                "description": "Tissue sample from varelse species known as pequeninos.",
                "experiments": ["e1"]
            },
            {"uuid": "p2", "name": "Empty", "experiments": []}
        ])),
    )
}

async fn delete_project(headers: HeaderMap, Path(uuid): Path<String>) -> StatusCode {
    match (authorized(&headers), uuid.as_str()) {
        (false, _) => StatusCode::UNAUTHORIZED,
        (true, "p1") => StatusCode::OK,
        (true, _) => StatusCode::NOT_FOUND,
    }
}

/// `e1`: GEM2S running once, then succeeded. `e2`: QC failed.
async fn backend_status(State(backend): State<Backend>, Path(id): Path<String>) -> Json<Value> {
    let call = {
        let mut calls = backend.calls.lock().unwrap();
        let count = calls.entry(id.clone()).or_default();
        *count += 1;
        *count
    };

    Json(match (id.as_str(), call) {
        ("e1", 1) => json!({"gem2s": {"status": "RUNNING"}}),
        ("e1", _) => json!({"gem2s": {"status": "SUCCEEDED"}, "pipeline": {"status": "NOT_CREATED"}}),
        ("e2", _) => json!({"gem2s": {"status": "SUCCEEDED"}, "pipeline": {"status": "FAILED"}}),
        _ => json!({}),
    })
}

async fn serve() -> (String, Backend) {
    let backend = Backend::default();
    let router = Router::new()
        .route("/cognito", post(initiate_auth))
        .route("/v1/projects", get(projects))
        .route("/v1/projects/:uuid", delete(delete_project))
        .route("/v1/experiments/:id/backendStatus", get(backend_status))
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", addr), backend)
}

fn config(base: &str, password: &str) -> HarnessConfig {
    let mut config = HarnessConfig {
        api_url: base.to_string(),
        ..Default::default()
    };
    config.credentials.username = Some("ci@biomage.net".into());
    config.credentials.password = Some(password.into());
    config.identity.user_pool_id = Some("eu-west-1_AbCdEf".into());
    config.identity.client_id = Some("client123".into());
    config.identity.endpoint = Some(format!("{}/cognito", base));
    config
}

#[tokio::test]
async fn test_sign_in_then_list_projects() {
    let (base, _) = serve().await;

    let session = CognitoAuthenticator::from_config(&config(&base, "hunter2"))
        .unwrap()
        .sign_in()
        .await
        .unwrap();
    assert_eq!(session.bearer(), "Bearer id-token");
    assert!(session
        .storage_entries()
        .contains(&("CognitoIdentityServiceProvider.client123.LastAuthUser".to_string(), "ci@biomage.net".to_string())));

    let api = ApiClient::new(&base, Some(session)).unwrap();
    let projects = api.list_projects().await.unwrap();
    assert_eq!(projects.len(), 2);
    assert_eq!(projects[0].primary_experiment(), Some("e1"));
    assert_eq!(projects[1].primary_experiment(), None);

    let found = api.find_project("Pequeninos Sample").await.unwrap().unwrap();
    assert_eq!(found.uuid, "p1");
    api.delete_project(&found.uuid).await.unwrap();

    match api.delete_project("missing").await {
        Err(E2eError::Api { status, url }) => {
            assert_eq!(status, 404);
            assert!(url.ends_with("/v1/projects/missing"));
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn test_wrong_password_is_an_auth_error() {
    let (base, _) = serve().await;

    let err = CognitoAuthenticator::from_config(&config(&base, "wrong"))
        .unwrap()
        .sign_in()
        .await
        .unwrap_err();
    match err {
        E2eError::Auth(reason) => assert!(reason.contains("NotAuthorizedException")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_requests_without_session_are_rejected() {
    let (base, _) = serve().await;

    let err = ApiClient::new(&base, None).unwrap().list_projects().await.unwrap_err();
    assert!(matches!(err, E2eError::Api { status: 401, .. }));
}

#[tokio::test]
async fn test_waiter_polls_backend_status_until_success() {
    let (base, backend) = serve().await;
    let waiter = CompletionWaiter::new(Arc::new(ApiClient::new(&base, None).unwrap()));

    let policy = WaitPolicy::for_stage(PipelineStage::Gem2s)
        .with_timeout(Duration::from_secs(10))
        .with_poll_interval(Duration::from_secs(1));
    let outcome = waiter.wait(JobId::gem2s("e1"), policy).await.unwrap();

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.checks, 2);
    assert_eq!(backend.calls.lock().unwrap()["e1"], 2);
}

#[tokio::test]
async fn test_waiter_reports_qc_failure_from_pipeline_key() {
    let (base, backend) = serve().await;
    let waiter = CompletionWaiter::new(Arc::new(ApiClient::new(&base, None).unwrap()));

    let err = waiter
        .wait(JobId::qc("e2"), WaitPolicy::for_stage(PipelineStage::Qc).with_timeout(Duration::from_secs(10)))
        .await
        .unwrap_err();

    match err {
        E2eError::PipelineFailed { job, status } => {
            assert_eq!(job, JobId::qc("e2"));
            assert_eq!(status, JobStatus::Failed);
        }
        other => panic!("unexpected error {other:?}"),
    }
    // No polling after the failure was observed
    assert_eq!(backend.calls.lock().unwrap()["e2"], 1);
}
