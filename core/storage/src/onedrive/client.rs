//! Microsoft Graph request executor.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use graphdrive_common::{Error, Result};

use super::auth::AuthSession;
use crate::http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};

/// Graph API base URL.
pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0/";

/// Executes Graph requests on behalf of an [`AuthSession`].
///
/// Every authenticated request gets a bearer token from
/// [`AuthSession::ensure_valid`]. A 401 triggers exactly one forced refresh
/// and one retry; nothing else is retried at this layer.
#[derive(Clone)]
pub struct GraphClient {
    transport: Arc<dyn HttpTransport>,
    session: Arc<AuthSession>,
    base_url: String,
}

impl GraphClient {
    pub fn new(transport: Arc<dyn HttpTransport>, session: Arc<AuthSession>) -> Self {
        Self {
            transport,
            session,
            base_url: GRAPH_API_BASE.to_string(),
        }
    }

    /// Override the API base URL. A trailing slash is added if missing.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        self.base_url = base_url;
        self
    }

    /// Resolve a path relative to the API base. Absolute URLs (paging links,
    /// monitor URLs) are returned unchanged.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    /// Execute an authenticated request.
    ///
    /// # Errors
    /// - `Auth` if the session cannot produce a token, or the request is still
    ///   rejected with 401 after one forced refresh
    /// - `Request` for any other 4xx
    /// - `Transient` for 5xx and transport failures
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let token = self.session.ensure_valid().await?;
        let response = self
            .transport
            .execute(request.clone().bearer_token(&token))
            .await?;

        if response.status != 401 {
            return check_status(response).await;
        }

        warn!(url = %request.url, "Access token rejected, refreshing and retrying once");
        let token = self.session.force_refresh(&token).await?;
        let response = self.transport.execute(request.bearer_token(&token)).await?;

        check_status(response).await
    }

    /// Execute a request without credentials.
    ///
    /// Used for pre-authenticated URLs (upload sessions, download URLs, copy
    /// monitors), which reject a bearer token.
    pub async fn execute_anonymous(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self.transport.execute(request).await?;
        check_status(response).await
    }

    /// GET a path and decode the JSON response.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!(path, "GET");
        self.execute(HttpRequest::get(self.url(path)))
            .await?
            .json()
            .await
    }

    /// Send a JSON body and decode the JSON response.
    pub async fn send_json<B, T>(&self, method: HttpMethod, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(path, ?method, "Sending JSON request");
        let request = HttpRequest::new(method, self.url(path)).json(body)?;
        self.execute(request).await?.json().await
    }

    /// DELETE a path.
    pub async fn delete(&self, path: &str) -> Result<()> {
        debug!(path, "DELETE");
        self.execute(HttpRequest::delete(self.url(path))).await?;
        Ok(())
    }
}

/// Map a response status onto the error taxonomy.
///
/// 2xx passes through. 401 is `Auth`, other 4xx are `Request`, 5xx are
/// `Transient`. Anything else (an unfollowed redirect) is reported as a
/// `Request` error.
pub(crate) async fn check_status(response: HttpResponse) -> Result<HttpResponse> {
    if response.is_success() {
        return Ok(response);
    }

    let status = response.status;
    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body);

    Err(match status {
        401 => Error::Auth(format!("Request unauthorized: {}", message)),
        500..=599 => Error::Transient(format!("Server error {}: {}", status, message)),
        _ => Error::Request { status, message },
    })
}

/// Extract a readable message from a Graph or identity platform error body.
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };

    if let Some(error) = value.get("error") {
        if let Some(message) = error.get("message").and_then(|m| m.as_str()) {
            return match error.get("code").and_then(|c| c.as_str()) {
                Some(code) => format!("{}: {}", code, message),
                None => message.to_string(),
            };
        }
    }
    if let Some(description) = value.get("error_description").and_then(|d| d.as_str()) {
        return description.to_string();
    }

    body.trim().to_string()
}
