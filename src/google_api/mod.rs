//! Native Google API client over plain HTTP via reqwest.
//!
//! Token format stays compatible with what Python's google-auth writes, so a
//! token.json produced by an earlier setup keeps working. Modules:
//! - gmail: Gmail API v1 message fetch
//! - token_store: token.json file backend

pub mod gmail;
pub mod token_store;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// OAuth scopes requested at consent. Read-only mail plus identity.
pub const SCOPES: &[&str] = &[
    "openid",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/gmail.readonly",
];

// ============================================================================
// Credential
// ============================================================================

/// Bearer credential for the mail API.
///
/// Field names match Python's `google.oauth2.credentials.Credentials.to_json()`
/// output; `access_token` is accepted as an alias on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// The access token (Python writes this as "token").
    #[serde(alias = "access_token")]
    pub token: String,
    /// Long-lived refresh token, absent for consent flows without offline access.
    pub refresh_token: Option<String>,
    /// Token endpoint URL.
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Access token expiry (RFC 3339). None means unknown, treated as expired.
    #[serde(default)]
    pub expiry: Option<String>,
    /// Authenticated user email (Python stores this in "account").
    #[serde(default, alias = "email")]
    pub account: Option<String>,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl Credential {
    /// Whether the access token is expired (or close enough to be unusable).
    ///
    /// A 60-second skew avoids handing out a token that dies mid-request.
    pub fn is_expired(&self) -> bool {
        match &self.expiry {
            None => true,
            Some(expiry_str) => {
                match chrono::DateTime::parse_from_rfc3339(&expiry_str.replace('Z', "+00:00"))
                    .or_else(|_| chrono::DateTime::parse_from_rfc3339(expiry_str))
                {
                    Ok(expiry) => expiry <= chrono::Utc::now() + chrono::Duration::seconds(60),
                    Err(_) => true,
                }
            }
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No refresh token, or the refresh exchange was rejected.
    /// The caller must send the user back through consent.
    #[error("credential invalid, re-authentication required")]
    CredentialInvalid,
    #[error("token endpoint error: {0}")]
    Endpoint(String),
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token not found at {0}")]
    TokenNotFound(PathBuf),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Retry
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

fn status_is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    Duration::from_millis(base)
}

/// Send a request, retrying rate limits, 5xx, and transport timeouts.
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, reqwest::Error> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await;
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                if status_is_retryable(status) && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "google_api retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                if (err.is_timeout() || err.is_connect()) && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "google_api retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(err);
            }
        }
    }

    // Unreachable in practice: the final attempt always returns above.
    request.send().await
}

// ============================================================================
// Token provider
// ============================================================================

/// Yields a usable credential, refreshing transparently when expired.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a valid credential derived from `stored`.
    ///
    /// Does not persist anything; the caller owns storage of the returned
    /// value. Fails with [`AuthError::CredentialInvalid`] when no refresh is
    /// possible.
    async fn ensure_valid(&self, stored: Credential) -> Result<Credential, AuthError>;
}

/// Token provider backed by Google's token endpoint.
pub struct GoogleTokenProvider {
    client: reqwest::Client,
}

impl GoogleTokenProvider {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Exchange the refresh token for a fresh access token + expiry.
    async fn refresh(&self, stored: &Credential) -> Result<Credential, AuthError> {
        let refresh_token = stored
            .refresh_token
            .as_deref()
            .ok_or(AuthError::CredentialInvalid)?;

        let mut form = vec![
            ("client_id", stored.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        if let Some(secret) = stored.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let resp = self
            .client
            .post(&stored.token_uri)
            .form(&form)
            .send()
            .await?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(map_refresh_error(status.as_u16(), &body_text));
        }

        let body: serde_json::Value = serde_json::from_str(&body_text)?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| AuthError::Endpoint("no access_token in response".into()))?;
        let expires_in = body["expires_in"].as_u64().unwrap_or(3600);
        let expiry = chrono::Utc::now() + chrono::Duration::seconds(expires_in as i64);

        let mut refreshed = stored.clone();
        refreshed.token = access_token.to_string();
        refreshed.expiry = Some(expiry.to_rfc3339());
        Ok(refreshed)
    }
}

#[async_trait]
impl TokenProvider for GoogleTokenProvider {
    async fn ensure_valid(&self, stored: Credential) -> Result<Credential, AuthError> {
        if !stored.is_expired() {
            return Ok(stored);
        }
        log::info!("Access token expired, refreshing");
        self.refresh(&stored).await
    }
}

fn map_refresh_error(status: u16, body: &str) -> AuthError {
    let lowered = body.to_lowercase();
    if (status == 400 || status == 401)
        && (lowered.contains("invalid_grant") || lowered.contains("token has been expired"))
    {
        return AuthError::CredentialInvalid;
    }
    AuthError::Endpoint(format!("HTTP {}: {}", status, body))
}

// ============================================================================
// Consent flow (auth URL + code exchange)
// ============================================================================

/// Build the Google consent URL the client should visit.
pub fn auth_url(google: &crate::config::GoogleConfig, redirect_uri: &str) -> String {
    let scope_string = SCOPES.join(" ");
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent",
        google.auth_uri,
        urlencode(&google.client_id),
        urlencode(redirect_uri),
        urlencode(&scope_string),
    )
}

/// Exchange an authorization code for a credential, then resolve the
/// account email from the Gmail profile (userinfo as fallback).
pub async fn exchange_code(
    google: &crate::config::GoogleConfig,
    code: &str,
    redirect_uri: &str,
) -> Result<Credential, AuthError> {
    let client = reqwest::Client::new();
    let mut form = vec![
        ("code", code),
        ("client_id", google.client_id.as_str()),
        ("redirect_uri", redirect_uri),
        ("grant_type", "authorization_code"),
    ];
    if let Some(secret) = google.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }

    let resp = client.post(&google.token_uri).form(&form).send().await?;
    let status = resp.status();
    let body_text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(AuthError::Endpoint(format!(
            "code exchange failed: HTTP {}: {}",
            status, body_text
        )));
    }

    let body: serde_json::Value = serde_json::from_str(&body_text)?;
    let access_token = body["access_token"]
        .as_str()
        .ok_or_else(|| AuthError::Endpoint("no access_token in response".into()))?
        .to_string();
    let refresh_token = body["refresh_token"].as_str().map(|s| s.to_string());
    let expires_in = body["expires_in"].as_u64().unwrap_or(3600);
    let expiry = chrono::Utc::now() + chrono::Duration::seconds(expires_in as i64);

    let email = fetch_account_email(&client, &access_token).await;

    Ok(Credential {
        token: access_token,
        refresh_token,
        token_uri: google.token_uri.clone(),
        client_id: google.client_id.clone(),
        client_secret: google.client_secret.clone(),
        expiry: Some(expiry.to_rfc3339()),
        account: email,
    })
}

/// Resolve the authenticated address: Gmail profile first, userinfo second.
async fn fetch_account_email(client: &reqwest::Client, access_token: &str) -> Option<String> {
    if let Ok(resp) = client
        .get("https://gmail.googleapis.com/gmail/v1/users/me/profile")
        .bearer_auth(access_token)
        .send()
        .await
    {
        if resp.status().is_success() {
            if let Ok(body) = resp.json::<serde_json::Value>().await {
                if let Some(email) = body["emailAddress"].as_str() {
                    return Some(email.to_string());
                }
            }
        }
    }

    if let Ok(resp) = client
        .get("https://www.googleapis.com/oauth2/v2/userinfo")
        .bearer_auth(access_token)
        .send()
        .await
    {
        if resp.status().is_success() {
            if let Ok(body) = resp.json::<serde_json::Value>().await {
                if let Some(email) = body["email"].as_str() {
                    return Some(email.to_string());
                }
            }
        }
    }

    None
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(expiry: Option<String>, refresh: Option<&str>) -> Credential {
        Credential {
            token: "ya29.test-access-token".to_string(),
            refresh_token: refresh.map(|s| s.to_string()),
            token_uri: default_token_uri(),
            client_id: "12345.apps.googleusercontent.com".to_string(),
            client_secret: Some("test-secret".to_string()),
            expiry,
            account: Some("user@example.com".to_string()),
        }
    }

    #[test]
    fn test_credential_roundtrip() {
        let cred = credential(Some("2026-09-01T12:00:00Z".to_string()), Some("1//refresh"));
        let json = serde_json::to_string_pretty(&cred).unwrap();
        let parsed: Credential = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.token, "ya29.test-access-token");
        assert_eq!(parsed.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(parsed.account.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn test_credential_python_compat() {
        // JSON in the shape Python's google-auth writes
        let python_json = r#"{
            "token": "ya29.python-token",
            "refresh_token": "1//python-refresh",
            "token_uri": "https://oauth2.googleapis.com/token",
            "client_id": "client.apps.googleusercontent.com",
            "client_secret": "secret",
            "expiry": "2026-09-01T12:00:00.000000Z",
            "account": "user@company.com"
        }"#;

        let cred: Credential = serde_json::from_str(python_json).unwrap();
        assert_eq!(cred.token, "ya29.python-token");
        assert_eq!(cred.account.as_deref(), Some("user@company.com"));
    }

    #[test]
    fn test_credential_access_token_alias() {
        let json = r#"{
            "access_token": "ya29.alias-token",
            "refresh_token": "1//refresh",
            "client_id": "client"
        }"#;

        let cred: Credential = serde_json::from_str(json).unwrap();
        assert_eq!(cred.token, "ya29.alias-token");
    }

    #[test]
    fn test_is_expired_no_expiry() {
        assert!(credential(None, None).is_expired());
    }

    #[test]
    fn test_is_expired_future() {
        let future = chrono::Utc::now() + chrono::Duration::hours(1);
        assert!(!credential(Some(future.to_rfc3339()), None).is_expired());
    }

    #[test]
    fn test_is_expired_past() {
        let past = chrono::Utc::now() - chrono::Duration::hours(1);
        assert!(credential(Some(past.to_rfc3339()), None).is_expired());
    }

    #[test]
    fn test_is_expired_within_skew() {
        // 30 seconds left is inside the 60-second skew window
        let soon = chrono::Utc::now() + chrono::Duration::seconds(30);
        assert!(credential(Some(soon.to_rfc3339()), None).is_expired());
    }

    #[test]
    fn test_map_refresh_error_invalid_grant() {
        let err = map_refresh_error(400, r#"{"error": "invalid_grant"}"#);
        assert!(matches!(err, AuthError::CredentialInvalid));
    }

    #[test]
    fn test_map_refresh_error_server_side() {
        let err = map_refresh_error(500, "internal");
        assert!(matches!(err, AuthError::Endpoint(_)));
    }

    #[test]
    fn test_retry_delay_honors_retry_after() {
        let header = reqwest::header::HeaderValue::from_static("7");
        let delay = retry_delay(1, &RetryPolicy::default(), Some(&header));
        assert_eq!(delay, Duration::from_secs(7));
    }

    #[test]
    fn test_retry_delay_backs_off() {
        let policy = RetryPolicy::default();
        let first = retry_delay(1, &policy, None);
        let second = retry_delay(2, &policy, None);
        assert!(second >= first);
        assert!(second <= Duration::from_millis(policy.max_backoff_ms));
    }

    #[test]
    fn test_auth_url_contains_scopes_and_redirect() {
        let google = crate::config::GoogleConfig {
            client_id: "abc.apps.googleusercontent.com".to_string(),
            client_secret: None,
            ..Default::default()
        };
        let url = auth_url(&google, "http://localhost:8080/login/google/authorized");
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/auth?"));
        assert!(url.contains("gmail.readonly"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("abc.apps.googleusercontent.com"));
    }
}
