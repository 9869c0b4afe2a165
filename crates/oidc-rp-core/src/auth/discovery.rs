use serde::{Deserialize, Serialize};
use url::Url;

use super::AuthError;

pub const WELL_KNOWN_PATH: &str = "/.well-known/openid-configuration";

/// Provider metadata from `.well-known/openid-configuration`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub jwks_uri: Url,
    pub userinfo_endpoint: Option<Url>,
    pub end_session_endpoint: Option<Url>,
    pub revocation_endpoint: Option<Url>,
    pub check_session_iframe: Option<Url>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

impl DiscoveryDocument {
    /// Location of the discovery document for `issuer`.
    pub fn url_for(issuer: &str) -> Result<Url, AuthError> {
        Ok(Url::parse(&format!(
            "{}{WELL_KNOWN_PATH}",
            issuer.trim_end_matches('/')
        ))?)
    }

    /// Providers that omit `code_challenge_methods_supported` are assumed to accept S256.
    pub fn supports_pkce_s256(&self) -> bool {
        self.code_challenge_methods_supported.is_empty()
            || self
                .code_challenge_methods_supported
                .iter()
                .any(|method| method == "S256")
    }

    pub fn supports_refresh_grant(&self) -> bool {
        self.grant_types_supported.is_empty()
            || self
                .grant_types_supported
                .iter()
                .any(|grant| grant == "refresh_token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_for_handles_trailing_slash() {
        assert_eq!(
            DiscoveryDocument::url_for("https://idp.example/realms/dev/")
                .unwrap()
                .as_str(),
            "https://idp.example/realms/dev/.well-known/openid-configuration"
        );
    }

    #[test]
    fn minimal_document_parses() {
        let doc: DiscoveryDocument = serde_json::from_value(serde_json::json!({
            "issuer": "https://idp.example",
            "authorization_endpoint": "https://idp.example/authorize",
            "token_endpoint": "https://idp.example/token",
            "jwks_uri": "https://idp.example/jwks",
        }))
        .unwrap();
        assert!(doc.end_session_endpoint.is_none());
        assert!(doc.supports_pkce_s256());
        assert!(doc.supports_refresh_grant());
    }

    #[test]
    fn plain_only_pkce_is_detected() {
        let doc: DiscoveryDocument = serde_json::from_value(serde_json::json!({
            "issuer": "https://idp.example",
            "authorization_endpoint": "https://idp.example/authorize",
            "token_endpoint": "https://idp.example/token",
            "jwks_uri": "https://idp.example/jwks",
            "code_challenge_methods_supported": ["plain"],
        }))
        .unwrap();
        assert!(!doc.supports_pkce_s256());
    }
}
