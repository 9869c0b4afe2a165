use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{AuthChallenge, PkcePair};

/// Secrets of one in-flight login, persisted until its callback arrives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthRequestState {
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
    pub scope: String,
    pub redirect_uri: Url,
    pub created_at: DateTime<Utc>,
}

impl AuthRequestState {
    pub fn new(challenge: &AuthChallenge, scope: impl Into<String>, redirect_uri: Url) -> Self {
        Self {
            state: challenge.state.clone(),
            nonce: challenge.nonce.clone(),
            code_verifier: challenge.pkce.verifier().to_owned(),
            scope: scope.into(),
            redirect_uri,
            created_at: Utc::now(),
        }
    }

    pub fn pkce(&self) -> PkcePair {
        PkcePair::from_verifier(self.code_verifier.clone())
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        Utc::now() >= self.created_at + ttl
    }

    pub fn requested_scopes(&self) -> Vec<String> {
        self.scope.split_whitespace().map(ToOwned::to_owned).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_state_keeps_challenge_secrets() {
        let challenge = AuthChallenge::generate();
        let request = AuthRequestState::new(
            &challenge,
            "openid profile",
            Url::parse("http://127.0.0.1/callback").unwrap(),
        );
        assert_eq!(request.state, challenge.state);
        assert_eq!(request.pkce().challenge(), challenge.pkce.challenge());
        assert_eq!(request.requested_scopes(), vec!["openid", "profile"]);
    }

    #[test]
    fn request_state_expires_after_ttl() {
        let mut request = AuthRequestState::new(
            &AuthChallenge::generate(),
            "openid",
            Url::parse("http://127.0.0.1/callback").unwrap(),
        );
        assert!(!request.is_expired(Duration::minutes(15)));
        request.created_at = Utc::now() - Duration::minutes(16);
        assert!(request.is_expired(Duration::minutes(15)));
    }
}
