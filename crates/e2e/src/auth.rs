//! Sign-in against the hosted identity provider (Cognito)
//!
//! The resulting [`Session`] is handed to the browser driver, which seeds it
//! into local storage before the page loads. Nothing is read back from
//! ambient browser state.

use std::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};

const INITIATE_AUTH_TARGET: &str = "AWSCognitoIdentityProviderService.InitiateAuth";
const AMZ_JSON: &str = "application/x-amz-json-1.1";

/// Tokens of a signed-in test user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub username: String,

    /// `CognitoIdentityServiceProvider.<clientId>`
    pub key_prefix: String,

    pub id_token: String,
    pub access_token: String,
    pub refresh_token: String,
    pub clock_drift: i64,
}

impl Session {
    pub fn new(client_id: &str, username: &str, tokens: AuthenticationResult) -> Self {
        Self {
            username: username.to_string(),
            key_prefix: format!("CognitoIdentityServiceProvider.{}", client_id),
            id_token: tokens.id_token,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.unwrap_or_default(),
            clock_drift: 0,
        }
    }

    /// Local storage entries the web app reads to consider a user signed in
    pub fn storage_entries(&self) -> Vec<(String, String)> {
        let user_prefix = format!("{}.{}", self.key_prefix, self.username);
        vec![
            (format!("{}.idToken", user_prefix), self.id_token.clone()),
            (format!("{}.accessToken", user_prefix), self.access_token.clone()),
            (format!("{}.refreshToken", user_prefix), self.refresh_token.clone()),
            (format!("{}.clockDrift", user_prefix), self.clock_drift.to_string()),
            (format!("{}.LastAuthUser", self.key_prefix), self.username.clone()),
            ("amplify-authenticator-authState".to_string(), "signedIn".to_string()),
            ("amplify-signin-with-hostedUI".to_string(), "true".to_string()),
        ]
    }

    /// Value of the `Authorization` header for API calls
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.id_token)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthenticationResult {
    pub id_token: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateAuthResponse {
    #[serde(default)]
    authentication_result: Option<AuthenticationResult>,
    #[serde(default)]
    challenge_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CognitoErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Username/password sign-in with the `USER_PASSWORD_AUTH` flow
pub struct CognitoAuthenticator {
    endpoint: String,
    client_id: String,
    username: String,
    password: String,
    http_client: reqwest::Client,
}

impl CognitoAuthenticator {
    pub fn from_config(config: &HarnessConfig) -> E2eResult<Self> {
        let username = config
            .credentials
            .username
            .clone()
            .ok_or_else(|| E2eError::Auth("E2E_USERNAME is not set".into()))?;
        let password = config
            .credentials
            .password
            .clone()
            .ok_or_else(|| E2eError::Auth("E2E_PASSWORD is not set".into()))?;
        let client_id = config
            .identity
            .client_id
            .clone()
            .ok_or_else(|| E2eError::Auth("E2E_CLIENT_ID is not set".into()))?;

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            endpoint: config.identity.endpoint()?,
            client_id,
            username,
            password,
            http_client,
        })
    }

    pub async fn sign_in(&self) -> E2eResult<Session> {
        info!("Logging into Cognito as {}", self.username);

        let body = json!({
            "AuthFlow": "USER_PASSWORD_AUTH",
            "ClientId": self.client_id,
            "AuthParameters": {
                "USERNAME": self.username,
                "PASSWORD": self.password,
            }
        });

        let resp = self
            .http_client
            .post(&self.endpoint)
            .header("Content-Type", AMZ_JSON)
            .header("X-Amz-Target", INITIATE_AUTH_TARGET)
            .body(body.to_string())
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            let reason = serde_json::from_str::<CognitoErrorBody>(&text)
                .map(|e| format!("{}: {}", e.kind, e.message))
                .unwrap_or_else(|_| format!("HTTP {}", status));
            return Err(E2eError::Auth(reason));
        }

        let parsed: InitiateAuthResponse = serde_json::from_str(&text)?;
        if let Some(challenge) = parsed.challenge_name {
            return Err(E2eError::Auth(format!(
                "identity provider requires challenge {}",
                challenge
            )));
        }
        let tokens = parsed
            .authentication_result
            .ok_or_else(|| E2eError::Auth("no authentication result in response".into()))?;

        debug!(expires_in = ?tokens.expires_in, "Signed in");
        Ok(Session::new(&self.client_id, &self.username, tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "client123",
            "ci@biomage.net",
            AuthenticationResult {
                id_token: "id".into(),
                access_token: "access".into(),
                refresh_token: Some("refresh".into()),
                expires_in: Some(3600),
            },
        )
    }

    #[test]
    fn test_storage_entries_match_amplify_layout() {
        let entries = session().storage_entries();
        let get = |k: &str| {
            entries
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };

        let prefix = "CognitoIdentityServiceProvider.client123";
        assert_eq!(get(&format!("{prefix}.ci@biomage.net.idToken")), Some("id"));
        assert_eq!(get(&format!("{prefix}.ci@biomage.net.accessToken")), Some("access"));
        assert_eq!(get(&format!("{prefix}.ci@biomage.net.refreshToken")), Some("refresh"));
        assert_eq!(get(&format!("{prefix}.ci@biomage.net.clockDrift")), Some("0"));
        assert_eq!(get(&format!("{prefix}.LastAuthUser")), Some("ci@biomage.net"));
        assert_eq!(get("amplify-authenticator-authState"), Some("signedIn"));
        assert_eq!(get("amplify-signin-with-hostedUI"), Some("true"));
        assert_eq!(entries.len(), 7);
    }

    #[test]
    fn test_bearer_uses_id_token() {
        assert_eq!(session().bearer(), "Bearer id");
    }

    #[test]
    fn test_missing_password_is_auth_error() {
        let mut config = HarnessConfig::default();
        config.credentials.username = Some("ci".into());
        config.identity.client_id = Some("c".into());
        config.identity.region = Some("eu-west-1".into());
        assert!(matches!(
            CognitoAuthenticator::from_config(&config),
            Err(E2eError::Auth(_))
        ));
    }
}
