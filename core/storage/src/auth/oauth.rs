//! OAuth2 endpoints for Google and the Microsoft identity platform.

use async_trait::async_trait;
use chrono::Utc;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet,
    EndpointSet, ErrorResponse, RedirectUrl, RefreshToken, RequestTokenError, Scope,
    TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};

use skyferry_common::{Error, Result};

use super::credential::{Credential, ProviderKind, RefreshedToken, DEFAULT_TOKEN_LIFETIME};
use super::manager::TokenRefresher;

/// OAuth2 authorization endpoint for Google.
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// OAuth2 token endpoint for Google.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Scopes needed to read Drive and Photos and to learn the account email.
const GOOGLE_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
    "https://www.googleapis.com/auth/drive",
    "https://www.googleapis.com/auth/photoslibrary.readonly",
];

/// Microsoft identity platform base URL; the tenant and endpoint follow.
const MICROSOFT_LOGIN_BASE: &str = "https://login.microsoftonline.com";

const MICROSOFT_SCOPES: &[&str] = &[
    "openid",
    "offline_access",
    "profile",
    "User.Read",
    "Files.ReadWrite",
];

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Application registration for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Client ID.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
    /// Redirect URL registered for the consent callback.
    pub redirect_url: String,
}

impl OAuthConfig {
    /// Configuration whose redirect points at `{base_url}/auth/{provider}/callback`.
    pub fn with_base_url(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        base_url: &str,
        provider: ProviderKind,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_url: format!(
                "{}/auth/{}/callback",
                base_url.trim_end_matches('/'),
                provider
            ),
        }
    }
}

/// OAuth2 client for one provider.
pub struct OAuthClient {
    provider: ProviderKind,
    client: ConfiguredClient,
    http: oauth2::reqwest::Client,
    scopes: &'static [&'static str],
}

impl OAuthClient {
    /// Client for Google (Drive + Photos).
    pub fn google(config: &OAuthConfig) -> Result<Self> {
        Self::build(
            ProviderKind::Google,
            config,
            GOOGLE_AUTH_URL.to_string(),
            GOOGLE_TOKEN_URL.to_string(),
            AuthType::BasicAuth,
            GOOGLE_SCOPES,
        )
    }

    /// Client for Microsoft (OneDrive) in the given tenant.
    pub fn microsoft(config: &OAuthConfig, tenant_id: &str) -> Result<Self> {
        if tenant_id.is_empty() {
            return Err(Error::InvalidInput("Tenant ID cannot be empty".to_string()));
        }
        Self::build(
            ProviderKind::Microsoft,
            config,
            format!("{}/{}/oauth2/v2.0/authorize", MICROSOFT_LOGIN_BASE, tenant_id),
            format!("{}/{}/oauth2/v2.0/token", MICROSOFT_LOGIN_BASE, tenant_id),
            AuthType::RequestBody,
            MICROSOFT_SCOPES,
        )
    }

    fn build(
        provider: ProviderKind,
        config: &OAuthConfig,
        auth_url: String,
        token_url: String,
        auth_type: AuthType,
        scopes: &'static [&'static str],
    ) -> Result<Self> {
        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new(auth_url)
                    .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(token_url)
                    .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
            )
            .set_auth_type(auth_type);

        // Token endpoints must not redirect (SSRF guard recommended by oauth2)
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            provider,
            client,
            http,
            scopes,
        })
    }

    /// Provider this client talks to.
    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// Generate the authorization URL for the user to visit.
    ///
    /// Returns the URL and a CSRF token that should be verified on callback.
    pub fn authorization_url(&self) -> (String, String) {
        let mut request = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(self.scopes.iter().map(|s| Scope::new(s.to_string())));

        if self.provider == ProviderKind::Google {
            // Offline access plus forced consent so Google issues a refresh token
            request = request
                .add_extra_param("access_type", "offline")
                .add_extra_param("prompt", "consent");
        }

        let (url, csrf_token) = request.url();
        (url.to_string(), csrf_token.secret().clone())
    }

    /// Exchange an authorization code for a credential.
    ///
    /// # Errors
    /// - `AuthenticationRejected` for an invalid or used code
    /// - `Network` on transport failures
    pub async fn exchange_code(&self, code: &str) -> Result<Credential> {
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| token_error("Token exchange failed", e))?;

        let token = RefreshedToken {
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_in: response.expires_in().unwrap_or(DEFAULT_TOKEN_LIFETIME),
        };

        Ok(Credential::issued(&token, Utc::now()))
    }
}

#[async_trait]
impl TokenRefresher for OAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken> {
        let refresh_token = RefreshToken::new(refresh_token.to_string());
        let mut request = self.client.exchange_refresh_token(&refresh_token);
        if self.provider == ProviderKind::Microsoft {
            request = request.add_scopes(self.scopes.iter().map(|s| Scope::new(s.to_string())));
        }

        let response = request
            .request_async(&self.http)
            .await
            .map_err(|e| token_error("Token refresh failed", e))?;

        Ok(RefreshedToken {
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_in: response.expires_in().unwrap_or(DEFAULT_TOKEN_LIFETIME),
        })
    }
}

/// Transport failures are network errors; anything the endpoint answered
/// (error response, unparsable non-2xx body) is a rejection.
fn token_error<RE, TE>(context: &str, err: RequestTokenError<RE, TE>) -> Error
where
    RE: std::error::Error + 'static,
    TE: ErrorResponse + 'static,
{
    match err {
        RequestTokenError::Request(e) => Error::Network(format!("{}: {}", context, e)),
        other => Error::AuthenticationRejected(format!("{}: {}", context, other)),
    }
}
