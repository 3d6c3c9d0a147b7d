//! OAuth2 authentication and token management for the Microsoft identity platform.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponse};
use oauth2::{
    reqwest, AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet,
    EndpointSet, RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use graphdrive_common::{Error, Result, Secret};

/// Identity platform authority.
const AUTHORITY_BASE: &str = "https://login.microsoftonline.com";
/// Tenant used by multi-tenant and personal-account apps.
pub const DEFAULT_TENANT: &str = "common";
/// Redirect URL registered for desktop apps.
pub const DEFAULT_REDIRECT_URL: &str = "http://localhost:8080";
/// Scopes requested on every grant.
const SCOPES: [&str; 2] = ["offline_access", "files.readwrite"];
/// Tokens this close to expiry are refreshed before use.
const EXPIRY_MARGIN_SECS: i64 = 60;
/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// App registration used to talk to the identity platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Secret,
    pub redirect_url: String,
}

impl Credentials {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<Secret>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_url: DEFAULT_REDIRECT_URL.to_string(),
        }
    }

    pub fn with_redirect_url(mut self, redirect_url: impl Into<String>) -> Self {
        self.redirect_url = redirect_url.into();
        self
    }

    fn authority(&self, base: &str) -> String {
        format!("{}/{}/oauth2/v2.0", base.trim_end_matches('/'), self.tenant_id)
    }
}

/// OAuth2 tokens with expiration tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenState {
    /// Access token for API requests.
    pub access_token: Secret,
    /// Refresh token for obtaining new access tokens.
    pub refresh_token: Option<Secret>,
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
}

impl TokenState {
    /// Build a token state expiring `expires_in` from now.
    pub fn new(
        access_token: impl Into<Secret>,
        refresh_token: Option<String>,
        expires_in: std::time::Duration,
    ) -> Self {
        let lifetime = Duration::from_std(expires_in).unwrap_or_else(|_| Duration::hours(1));
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.map(Secret::from),
            expires_at: Utc::now() + lifetime,
        }
    }

    /// Check if the access token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        !self.is_valid_at(Utc::now())
    }

    /// Whether the access token is still usable at `now`, keeping the safety margin.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) < self.expires_at
    }
}

/// Authorization URL handed to the user, with the state that must come back.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Token endpoint operations.
///
/// [`OAuthClient`] talks to the identity platform; tests substitute fakes.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Build the URL the user visits to grant access.
    fn authorization_request(&self) -> AuthorizationRequest;

    /// Exchange an authorization code for tokens.
    async fn exchange_code(&self, code: &str) -> Result<TokenState>;

    /// Exchange a refresh token for a new access token.
    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenState>;
}

/// Completes the browser step of interactive authorization.
///
/// Receives the authorization URL and returns whatever the user pasted back:
/// the full redirect URL or the bare authorization code.
#[async_trait]
pub trait AuthorizationPrompt: Send + Sync {
    async fn authorize(&self, authorization_url: &str) -> Result<String>;
}

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Token endpoint backed by the `oauth2` crate.
pub struct OAuthClient {
    client: ConfiguredClient,
    http: reqwest::Client,
}

impl OAuthClient {
    /// Create a new client for the given app registration.
    ///
    /// # Errors
    /// - Tenant or redirect URL do not form valid URLs
    pub fn new(credentials: &Credentials) -> Result<Self> {
        Self::with_authority(credentials, AUTHORITY_BASE)
    }

    /// Create a client against another identity authority, such as a national
    /// cloud.
    pub fn with_authority(credentials: &Credentials, authority_base: &str) -> Result<Self> {
        let authority = credentials.authority(authority_base);
        // Client credentials travel in the token request body, not a Basic header
        let client = BasicClient::new(ClientId::new(credentials.client_id.clone()))
            .set_client_secret(ClientSecret::new(
                credentials.client_secret.expose().to_string(),
            ))
            .set_auth_type(AuthType::RequestBody)
            .set_auth_uri(
                AuthUrl::new(format!("{}/authorize", authority))
                    .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(format!("{}/token", authority))
                    .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(credentials.redirect_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
            );

        // The token endpoint must not be followed through redirects.
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Config(format!("Failed to create token HTTP client: {}", e)))?;

        Ok(Self { client, http })
    }

    fn into_token_state<T: TokenResponse>(token: &T) -> TokenState {
        TokenState::new(
            token.access_token().secret().clone(),
            token.refresh_token().map(|t| t.secret().clone()),
            token
                .expires_in()
                .unwrap_or_else(|| std::time::Duration::from_secs(DEFAULT_EXPIRES_IN_SECS)),
        )
    }
}

#[async_trait]
impl TokenEndpoint for OAuthClient {
    fn authorization_request(&self) -> AuthorizationRequest {
        let (url, state) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(SCOPES.iter().map(|s| Scope::new(s.to_string())))
            .add_extra_param("response_mode", "query")
            .url();

        AuthorizationRequest {
            url: url.to_string(),
            state: state.secret().clone(),
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenState> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .add_extra_param("scope", SCOPES.join(" "))
            .request_async(&self.http)
            .await
            .map_err(|e| token_error("Token exchange failed", e))?;

        Ok(Self::into_token_state(&token))
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenState> {
        let token = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .add_scopes(SCOPES.iter().map(|s| Scope::new(s.to_string())))
            .request_async(&self.http)
            .await
            .map_err(|e| token_error("Token refresh failed", e))?;

        Ok(Self::into_token_state(&token))
    }
}

/// Rejections from the endpoint are fatal to the session; failing to reach it is not.
fn token_error<RE>(context: &str, err: RequestTokenError<RE, BasicErrorResponse>) -> Error
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => {
            let detail = response
                .error_description()
                .cloned()
                .unwrap_or_else(|| response.to_string());
            Error::Auth(format!("{}: {}", context, detail))
        }
        RequestTokenError::Request(e) => Error::Transient(format!("{}: {}", context, e)),
        RequestTokenError::Parse(e, _) => {
            Error::Auth(format!("{}: unexpected token response: {}", context, e))
        }
        RequestTokenError::Other(message) => Error::Auth(format!("{}: {}", context, message)),
    }
}

/// Extract the authorization code from what the user pasted back.
///
/// Accepts either the full redirect URL or the bare code. A `state` present in
/// the response must match `expected_state`.
///
/// # Errors
/// - The identity platform redirected with an `error`
/// - State mismatch (response belongs to an older authorization URL)
/// - No code, or a malformed bare code
pub fn parse_authorization_response(response: &str, expected_state: &str) -> Result<String> {
    let response = response.trim();
    if response.is_empty() {
        return Err(Error::Auth("Authorization response is empty".to_string()));
    }

    let query = match response.split_once('?') {
        Some((_, query)) => query,
        None if response.contains("code=") || response.contains("error=") => response,
        None => {
            if response
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '&' | '=' | '#' | '/'))
            {
                return Err(Error::Auth("Authorization code is malformed".to_string()));
            }
            return Ok(response.to_string());
        }
    };
    let query = query.split('#').next().unwrap_or_default();

    let mut code = None;
    let mut state = None;
    let mut error = None;
    let mut error_description = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => error_description = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Err(Error::Auth(format!(
            "Authorization was denied: {}",
            error_description.unwrap_or(error)
        )));
    }

    match state {
        Some(state) if state != expected_state => {
            return Err(Error::Auth(
                "Response state does not match this authorization request".to_string(),
            ));
        }
        Some(_) => {}
        None => warn!("Authorization response carried no state, response not confirmed"),
    }

    code.filter(|c| !c.is_empty())
        .ok_or_else(|| Error::Auth("Response did not contain an authorization code".to_string()))
}

/// Authenticated session holding the current tokens.
///
/// The token state is a single-writer cell: readers share the read lock while
/// the token is valid, and a refresh holds the write lock for its whole
/// duration, so concurrent callers wait for the in-flight refresh instead of
/// issuing their own.
pub struct AuthSession {
    endpoint: Arc<dyn TokenEndpoint>,
    tokens: RwLock<Option<TokenState>>,
}

impl AuthSession {
    /// Create an unauthorized session.
    pub fn new(endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            endpoint,
            tokens: RwLock::new(None),
        }
    }

    /// Create a session from previously obtained tokens.
    pub fn with_tokens(endpoint: Arc<dyn TokenEndpoint>, tokens: TokenState) -> Self {
        Self {
            endpoint,
            tokens: RwLock::new(Some(tokens)),
        }
    }

    /// Generate the authorization URL for the user to visit.
    pub fn authorization_request(&self) -> AuthorizationRequest {
        self.endpoint.authorization_request()
    }

    /// Finish an authorization started with [`authorization_request`](Self::authorization_request).
    ///
    /// # Errors
    /// - Malformed or mismatched response
    /// - Code rejected by the token endpoint
    pub async fn complete_authorization(
        &self,
        request: &AuthorizationRequest,
        response: &str,
    ) -> Result<()> {
        let code = parse_authorization_response(response, &request.state)?;

        info!("Exchanging authorization code for tokens");
        let tokens = self.endpoint.exchange_code(&code).await?;
        if tokens.refresh_token.is_none() {
            warn!("Token response did not include a refresh token");
        }

        *self.tokens.write().await = Some(tokens);
        Ok(())
    }

    /// Run the full interactive authorization-code flow.
    ///
    /// The prompt shows the URL to the user and returns their pasted response.
    pub async fn authorize_interactive(&self, prompt: &dyn AuthorizationPrompt) -> Result<()> {
        let request = self.authorization_request();
        let response = prompt.authorize(&request.url).await?;
        self.complete_authorization(&request, &response).await
    }

    /// Authorize silently with a refresh token from a previous session.
    ///
    /// # Errors
    /// - Refresh token revoked, expired or issued to another client; the
    ///   caller must fall back to interactive authorization
    pub async fn authorize_with_refresh_token(&self, refresh_token: &str) -> Result<()> {
        info!("Authorizing with stored refresh token");
        let mut tokens = self.endpoint.exchange_refresh_token(refresh_token).await?;
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(Secret::new(refresh_token));
        }

        *self.tokens.write().await = Some(tokens);
        Ok(())
    }

    /// Get a valid access token, refreshing if necessary.
    ///
    /// # Postconditions
    /// - Returns an access token valid for at least the safety margin
    ///
    /// # Errors
    /// - Session not authorized
    /// - Refresh failed
    pub async fn ensure_valid(&self) -> Result<String> {
        {
            let tokens = self.tokens.read().await;
            match tokens.as_ref() {
                None => return Err(not_authorized()),
                Some(current) if !current.is_expired() => {
                    return Ok(current.access_token.expose().to_string());
                }
                Some(_) => {}
            }
        }

        let mut tokens = self.tokens.write().await;

        // Double-check after acquiring write lock
        let current = tokens.as_ref().ok_or_else(not_authorized)?;
        if !current.is_expired() {
            return Ok(current.access_token.expose().to_string());
        }

        info!("Refreshing expired access token");
        let refreshed = self.refresh(current).await?;
        let access_token = refreshed.access_token.expose().to_string();
        *tokens = Some(refreshed);

        Ok(access_token)
    }

    /// Refresh after the API rejected `rejected_token`.
    ///
    /// If another caller already replaced that token, the current one is
    /// returned without a second refresh.
    pub async fn force_refresh(&self, rejected_token: &str) -> Result<String> {
        let mut tokens = self.tokens.write().await;

        let current = tokens.as_ref().ok_or_else(not_authorized)?;
        if current.access_token.expose() != rejected_token && !current.is_expired() {
            debug!("Access token already refreshed by another request");
            return Ok(current.access_token.expose().to_string());
        }

        info!("Forcing access token refresh");
        let refreshed = self.refresh(current).await?;
        let access_token = refreshed.access_token.expose().to_string();
        *tokens = Some(refreshed);

        Ok(access_token)
    }

    async fn refresh(&self, current: &TokenState) -> Result<TokenState> {
        let refresh_token = current.refresh_token.clone().ok_or_else(|| {
            Error::Auth(
                "No refresh token available, interactive authorization required".to_string(),
            )
        })?;

        let mut refreshed = self
            .endpoint
            .exchange_refresh_token(refresh_token.expose())
            .await?;

        // Refresh tokens may or may not be rotated
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token);
        }
        debug!(expires_at = %refreshed.expires_at, "Access token refreshed");

        Ok(refreshed)
    }

    /// Whether the session holds tokens.
    pub async fn is_authorized(&self) -> bool {
        self.tokens.read().await.is_some()
    }

    /// Get the current tokens.
    pub async fn tokens(&self) -> Option<TokenState> {
        self.tokens.read().await.clone()
    }

    /// Current refresh token, for persisting between sessions.
    pub async fn refresh_token(&self) -> Option<Secret> {
        self.tokens
            .read()
            .await
            .as_ref()
            .and_then(|t| t.refresh_token.clone())
    }

    /// Replace the tokens (e.g., restored from an external store).
    pub async fn set_tokens(&self, tokens: TokenState) {
        *self.tokens.write().await = Some(tokens);
    }
}

fn not_authorized() -> Error {
    Error::Auth("Session is not authorized".to_string())
}
