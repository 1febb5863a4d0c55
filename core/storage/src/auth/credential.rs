//! OAuth2 credentials with expiration tracking.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Tokens are treated as expired this long before their stated expiry.
pub const EXPIRY_MARGIN_MINUTES: i64 = 5;

/// Fallback lifetime when the token endpoint omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME: std::time::Duration = std::time::Duration::from_secs(3600);

/// The OAuth2 provider a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Google (Drive and Photos share one consent).
    Google,
    /// Microsoft identity platform (OneDrive).
    Microsoft,
}

impl ProviderKind {
    /// Key under which the credential is persisted.
    pub fn store_key(&self) -> &'static str {
        match self {
            ProviderKind::Google => "google_token",
            ProviderKind::Microsoft => "microsoft_token",
        }
    }

    /// All known providers.
    pub fn all() -> [ProviderKind; 2] {
        [ProviderKind::Google, ProviderKind::Microsoft]
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Google => f.write_str("google"),
            ProviderKind::Microsoft => f.write_str("microsoft"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = skyferry_common::Error;

    fn from_str(s: &str) -> skyferry_common::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(ProviderKind::Google),
            "microsoft" | "onedrive" => Ok(ProviderKind::Microsoft),
            other => Err(skyferry_common::Error::InvalidInput(format!(
                "Unknown provider: {}",
                other
            ))),
        }
    }
}

/// Token material returned by a provider's token endpoint.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RefreshedToken {
    /// New access token.
    pub access_token: String,
    /// New refresh token, only when the provider rotated it.
    pub refresh_token: Option<String>,
    /// Lifetime of the access token.
    #[zeroize(skip)]
    pub expires_in: std::time::Duration,
}

impl fmt::Debug for RefreshedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshedToken")
            .field("access_token", &"[REDACTED]")
            .field("rotated_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// An immutable OAuth2 credential.
///
/// A refresh never edits a credential in place; it produces a new value.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    /// Access token for API requests.
    pub access_token: String,
    /// Refresh token for obtaining new access tokens.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// When the access token expires.
    #[zeroize(skip)]
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Build a credential from a token endpoint response received at `now`.
    pub fn issued(token: &RefreshedToken, now: DateTime<Utc>) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: now + lifetime(token.expires_in),
        }
    }

    /// Check if the access token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check expiry against an explicit clock reading.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now + Duration::minutes(EXPIRY_MARGIN_MINUTES)
    }

    /// The credential that replaces this one after a refresh.
    ///
    /// The existing refresh token is kept unless the provider issued a new one.
    pub fn renewed(&self, token: &RefreshedToken, now: DateTime<Utc>) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token
                .refresh_token
                .clone()
                .or_else(|| self.refresh_token.clone()),
            expires_at: now + lifetime(token.expires_in),
        }
    }

    /// Merge a freshly consented credential over a previously stored one.
    ///
    /// Providers often omit the refresh token on repeated consent.
    pub fn merged_over(&self, previous: Option<&Credential>) -> Self {
        let mut merged = self.clone();
        if merged.refresh_token.is_none() {
            merged.refresh_token = previous.and_then(|p| p.refresh_token.clone());
        }
        merged
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn lifetime(expires_in: std::time::Duration) -> Duration {
    Duration::from_std(expires_in).unwrap_or_else(|_| Duration::hours(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(expires_at: DateTime<Utc>) -> Credential {
        Credential {
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at,
        }
    }

    fn token(refresh: Option<&str>) -> RefreshedToken {
        RefreshedToken {
            access_token: "new-access".to_string(),
            refresh_token: refresh.map(String::from),
            expires_in: std::time::Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_credential_expiration() {
        assert!(credential(Utc::now() - Duration::hours(1)).is_expired());
        assert!(!credential(Utc::now() + Duration::hours(1)).is_expired());
    }

    #[test]
    fn test_credential_near_expiration() {
        // Inside the safety margin counts as expired
        assert!(credential(Utc::now() + Duration::minutes(4)).is_expired());
    }

    #[test]
    fn test_renewed_keeps_refresh_token() {
        let now = Utc::now();
        let old = credential(now - Duration::hours(1));
        let renewed = old.renewed(&token(None), now);

        assert_eq!(renewed.access_token, "new-access");
        assert_eq!(renewed.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(renewed.expires_at, now + Duration::hours(1));
        // The previous value is untouched
        assert_eq!(old.access_token, "access");
    }

    #[test]
    fn test_renewed_takes_rotated_refresh_token() {
        let now = Utc::now();
        let renewed = credential(now).renewed(&token(Some("rotated")), now);
        assert_eq!(renewed.refresh_token.as_deref(), Some("rotated"));
    }

    #[test]
    fn test_merged_over_previous() {
        let now = Utc::now();
        let fresh = Credential::issued(&token(None), now);
        let previous = credential(now);

        let merged = fresh.merged_over(Some(&previous));
        assert_eq!(merged.access_token, "new-access");
        assert_eq!(merged.refresh_token.as_deref(), Some("refresh"));

        assert!(fresh.merged_over(None).refresh_token.is_none());
    }

    #[test]
    fn test_credential_serialization() {
        let original = credential(Utc::now());
        let json = serde_json::to_string(&original).unwrap();
        let restored: Credential = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.access_token, original.access_token);
        assert_eq!(restored.refresh_token, original.refresh_token);
        assert_eq!(restored.expires_at, original.expires_at);
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let rendered = format!("{:?}", credential(Utc::now()));
        assert!(!rendered.contains("access\""));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn test_provider_keys() {
        assert_eq!(ProviderKind::Google.store_key(), "google_token");
        assert_eq!(ProviderKind::Microsoft.store_key(), "microsoft_token");
        assert_eq!("OneDrive".parse::<ProviderKind>().unwrap(), ProviderKind::Microsoft);
        assert!("dropbox".parse::<ProviderKind>().is_err());
    }
}
