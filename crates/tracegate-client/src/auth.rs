//! Session authentication for the traces server.
//!
//! Two methods are supported:
//! - Bearer token (`TRACEGATE_TOKEN`), sent on every request
//! - Username/password login, performed once per client and replayed as a cookie

use reqwest::header::{HeaderValue, COOKIE, SET_COOKIE};
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// How requests are authenticated.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Static bearer token.
    Token(String),

    /// Login with username and password; the session cookie is cached.
    Password { username: String, password: String },

    /// No authentication.
    None,
}

impl Credentials {
    /// Pick credentials from a token, falling back to username/password.
    pub fn resolve(
        token: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> ClientResult<Self> {
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            return Ok(Self::Token(token.to_string()));
        }

        match (username, password) {
            (Some(username), Some(password)) => Ok(Self::Password {
                username: username.to_string(),
                password: password.to_string(),
            }),
            (Some(_), None) => Err(ClientError::Config {
                message: "a username was given but no password (TRACEGATE_PASSWORD)".to_string(),
            }),
            (None, Some(_)) => Err(ClientError::Config {
                message: "a password was given but no username (TRACEGATE_USERNAME)".to_string(),
            }),
            (None, None) => Ok(Self::None),
        }
    }

    /// Check if authentication is configured.
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Authenticated session shared by every request of a client.
#[derive(Debug)]
pub(crate) struct Session {
    credentials: Credentials,
    cookie: OnceCell<HeaderValue>,
}

impl Session {
    pub(crate) fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            cookie: OnceCell::new(),
        }
    }

    /// Attach credentials to a request, logging in first if needed.
    pub(crate) async fn authorize(
        &self,
        http: &reqwest::Client,
        base_url: &str,
        request: reqwest::RequestBuilder,
    ) -> ClientResult<reqwest::RequestBuilder> {
        match &self.credentials {
            Credentials::Token(token) => Ok(request.bearer_auth(token)),
            Credentials::Password { username, password } => {
                let cookie = self
                    .cookie
                    .get_or_try_init(|| login(http, base_url, username, password))
                    .await?;
                Ok(request.header(COOKIE, cookie.clone()))
            }
            Credentials::None => Ok(request),
        }
    }
}

async fn login(
    http: &reqwest::Client,
    base_url: &str,
    username: &str,
    password: &str,
) -> ClientResult<HeaderValue> {
    let url = format!("{}/api/v1/login", base_url);
    debug!(url = %url, username, "logging in");

    let response = http
        .post(&url)
        .json(&json!({ "user": { "username": username, "password": password } }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() && !status.is_redirection() {
        return Err(ClientError::Unauthorized {
            message: format!("login as '{}' failed with HTTP {}", username, status.as_u16()),
        });
    }

    let cookie = session_cookie(response.headers().get_all(SET_COOKIE).iter());
    if cookie.is_empty() {
        return Err(ClientError::Unauthorized {
            message: "login response did not set a session cookie".to_string(),
        });
    }

    HeaderValue::from_str(&cookie).map_err(|e| ClientError::InvalidResponse {
        message: format!("invalid session cookie: {}", e),
    })
}

/// Turn `Set-Cookie` headers into a single `Cookie` header value.
fn session_cookie<'a>(set_cookies: impl Iterator<Item = &'a HeaderValue>) -> String {
    set_cookies
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .collect::<Vec<_>>()
        .join("; ")
}
