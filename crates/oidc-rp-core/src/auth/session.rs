use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::id_token::IdTokenClaims;
use super::AuthError;

/// Type of access token issued by the provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Bearer,
}

impl std::str::FromStr for TokenType {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bearer" => Ok(TokenType::Bearer),
            other => Err(AuthError::Protocol(format!(
                "unsupported token type '{other}'"
            ))),
        }
    }
}

/// Immutable token material from one successful exchange or refresh.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub token_type: TokenType,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub claims: Option<IdTokenClaims>,
    pub expires_at: DateTime<Utc>,
    pub scope: Vec<String>,
    pub session_state: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// The signed-in user's session as held by the session manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub subject: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: String,
    pub token_type: TokenType,
    pub expires_at: DateTime<Utc>,
    pub scope: Vec<String>,
    pub acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub session_state: Option<String>,
    #[serde(default)]
    pub profile: Map<String, Value>,
}

impl Session {
    /// Build a session from the first token set of a login; requires a validated ID token.
    pub fn from_token_set(tokens: TokenSet) -> Result<Self, AuthError> {
        let claims = tokens
            .claims
            .ok_or_else(|| AuthError::Protocol("token response missing id_token".into()))?;
        let id_token = tokens
            .id_token
            .ok_or_else(|| AuthError::Protocol("token response missing id_token".into()))?;
        if claims.sub.is_empty() {
            return Err(AuthError::Validation("empty subject".into()));
        }
        ensure_future_expiry(tokens.expires_at, tokens.received_at)?;

        Ok(Self {
            subject: claims.sub.clone(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            id_token,
            token_type: tokens.token_type,
            expires_at: tokens.expires_at,
            scope: tokens.scope,
            acquired_at: tokens.received_at,
            session_state: tokens.session_state,
            profile: claims.profile(),
        })
    }

    /// Produce the successor session after a renewal. The subject may not change.
    pub fn renewed(&self, tokens: TokenSet) -> Result<Self, AuthError> {
        ensure_future_expiry(tokens.expires_at, tokens.received_at)?;
        let mut next = self.clone();
        if let Some(claims) = tokens.claims {
            if claims.sub != self.subject {
                return Err(AuthError::Validation(format!(
                    "renewed ID token subject '{}' differs from session subject",
                    claims.sub
                )));
            }
            next.profile = claims.profile();
        }
        if let Some(id_token) = tokens.id_token {
            next.id_token = id_token;
        }
        next.access_token = tokens.access_token;
        next.token_type = tokens.token_type;
        next.refresh_token = tokens.refresh_token.or(next.refresh_token);
        next.expires_at = tokens.expires_at;
        if !tokens.scope.is_empty() {
            next.scope = tokens.scope;
        }
        if tokens.session_state.is_some() {
            next.session_state = tokens.session_state;
        }
        next.acquired_at = tokens.received_at;
        Ok(next)
    }

    /// Merge userinfo claims into the profile without overriding `sub`.
    pub fn merge_user_info(&mut self, claims: Map<String, Value>) {
        for (key, value) in claims {
            if key != "sub" {
                self.profile.insert(key, value);
            }
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn will_expire_within(&self, window: Duration) -> bool {
        Utc::now() + window >= self.expires_at
    }

    /// Remaining lifetime, zero once expired.
    pub fn expires_in(&self) -> Duration {
        (self.expires_at - Utc::now()).max(Duration::zero())
    }
}

fn ensure_future_expiry(
    expires_at: DateTime<Utc>,
    received_at: DateTime<Utc>,
) -> Result<(), AuthError> {
    if expires_at <= received_at {
        return Err(AuthError::Protocol(
            "token expiry is not later than its issuance".into(),
        ));
    }
    Ok(())
}
