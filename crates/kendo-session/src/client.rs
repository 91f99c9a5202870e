//! Remote login and renewal.
//!
//! The backend returns issued tokens in response headers: the token in
//! `Authorization` and its absolute expiry (epoch milliseconds) in `Expires`.
//! Login and renewal share that shape, see [`credential_from_headers`].

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, EXPIRES, HeaderMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SessionConfig;
use crate::credential::Credential;
use crate::error::{AuthError, RenewalError, Result};
use crate::http::build_client;

/// Login endpoint, relative to the backend root.
pub const LOGIN_PATH: &str = "auth/public/login";

/// Renewal endpoint, relative to the backend root.
pub const RENEW_PATH: &str = "auth/jwt/renew";

const BEARER_SCHEME: &str = "Bearer";

/// Performs a single renewal attempt.
///
/// Implementations must not retry: the scheduler decides what happens after
/// a failure.
#[async_trait]
pub trait RenewalClient: Send + Sync {
    /// Exchange the still-valid `current` credential for a fresh one.
    async fn renew(&self, current: &Credential) -> std::result::Result<Credential, RenewalError>;
}

/// Performs the initial username/password authentication.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, username: &str, password: &str)
    -> std::result::Result<LoginOutcome, AuthError>;
}

/// User profile returned in the login response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticatedUser {
    pub username: String,
    pub name: Option<String>,
    pub lastname: Option<String>,
    pub roles: Vec<String>,
}

/// Result of a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub user: AuthenticatedUser,
    pub credential: Credential,
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Build a credential from token response headers.
///
/// `None` stands for "no response at all". The token may carry a `Bearer `
/// prefix, which is stripped.
pub fn credential_from_headers(
    headers: Option<&HeaderMap>,
) -> std::result::Result<Credential, RenewalError> {
    let headers =
        headers.ok_or_else(|| RenewalError::NoResponse("server returned no response".into()))?;

    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(strip_bearer)
        .filter(|value| !value.is_empty())
        .ok_or(RenewalError::MissingAuthHeader)?;

    let raw_expiry = headers
        .get(EXPIRES)
        .ok_or(RenewalError::InvalidExpiration(None))?;
    let raw_expiry = raw_expiry
        .to_str()
        .map_err(|_| RenewalError::InvalidExpiration(None))?
        .trim();

    let expires_at = parse_expiry(raw_expiry)
        .ok_or_else(|| RenewalError::InvalidExpiration(Some(raw_expiry.to_string())))?;

    Ok(Credential::new(token, expires_at))
}

fn strip_bearer(value: &str) -> &str {
    let value = value.trim();
    match value.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case(BEARER_SCHEME) => rest.trim(),
        None if value.eq_ignore_ascii_case(BEARER_SCHEME) => "",
        _ => value,
    }
}

/// Epoch milliseconds; a fractional value is truncated, zero or negative is
/// rejected.
fn parse_expiry(raw: &str) -> Option<i64> {
    let millis = match raw.parse::<i64>() {
        Ok(millis) => millis,
        Err(_) => {
            let value = raw.parse::<f64>().ok().filter(|v| v.is_finite())?;
            if value >= i64::MAX as f64 || value <= i64::MIN as f64 {
                return None;
            }
            value.trunc() as i64
        }
    };
    (millis > 0).then_some(millis)
}

/// Login and renewal over the backend's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpAuthClient {
    client: reqwest::Client,
    login_url: Url,
    renew_url: Url,
}

impl HttpAuthClient {
    /// Create a client from configuration.
    pub fn new(config: &SessionConfig) -> Result<Self> {
        Self::with_client(build_client(config), config)
    }

    /// Create a client reusing an existing `reqwest::Client`.
    pub fn with_client(client: reqwest::Client, config: &SessionConfig) -> Result<Self> {
        Ok(Self {
            client,
            login_url: config.endpoint(LOGIN_PATH)?,
            renew_url: config.endpoint(RENEW_PATH)?,
        })
    }
}

#[async_trait]
impl RenewalClient for HttpAuthClient {
    async fn renew(&self, current: &Credential) -> std::result::Result<Credential, RenewalError> {
        let response = match self
            .client
            .get(self.renew_url.clone())
            .bearer_auth(&current.token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Renewal request failed");
                return Err(RenewalError::NoResponse(e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(RenewalError::NoResponse(format!(
                "renewal endpoint answered {status}"
            )));
        }

        let credential = credential_from_headers(Some(response.headers()))?;
        info!(expires_at = credential.expires_at, "Token renewed");
        Ok(credential)
    }
}

#[async_trait]
impl Authenticator for HttpAuthClient {
    async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> std::result::Result<LoginOutcome, AuthError> {
        let response = self
            .client
            .post(self.login_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(&AuthRequest { username, password })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            let reason = if reason.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("authentication failed")
                    .to_string()
            } else {
                reason
            };
            return Err(AuthError::rejected(status.as_u16(), reason));
        }

        let credential = credential_from_headers(Some(response.headers()))?;
        let body = response.bytes().await?;
        let user = if body.is_empty() {
            AuthenticatedUser::default()
        } else {
            serde_json::from_slice(&body).unwrap_or_else(|e| {
                debug!(error = %e, "Login response body is not a user profile");
                AuthenticatedUser::default()
            })
        };

        Ok(LoginOutcome { user, credential })
    }
}
