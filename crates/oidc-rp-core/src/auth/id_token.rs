use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256, Sha384, Sha512};

use super::utils::constant_time_eq;
use super::AuthError;

/// `aud` may be a single string or an array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn contains(&self, value: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == value,
            Audience::Multiple(values) => values.iter().any(|aud| aud == value),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Audience::Single(_) => 1,
            Audience::Multiple(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Claims of a validated ID token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Audience,
    pub exp: i64,
    pub iat: i64,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub azp: Option<String>,
    #[serde(default)]
    pub at_hash: Option<String>,
    #[serde(default)]
    pub auth_time: Option<i64>,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

impl IdTokenClaims {
    /// End-user profile claims (everything except protocol claims).
    pub fn profile(&self) -> Map<String, Value> {
        let mut profile = self.additional.clone();
        if let Some(auth_time) = self.auth_time {
            profile.insert("auth_time".into(), Value::from(auth_time));
        }
        profile
    }
}

/// Checks an ID token's signature and claims on behalf of one client.
#[derive(Debug, Clone)]
pub struct IdTokenValidator<'a> {
    pub issuer: &'a str,
    pub client_id: &'a str,
    pub client_secret: Option<&'a str>,
    pub leeway_secs: u64,
    /// `id_token_signing_alg_values_supported`; empty accepts any supported algorithm.
    pub allowed_algs: &'a [String],
}

impl<'a> IdTokenValidator<'a> {
    /// Validate signature, issuer, audience, expiry, `iat`, `azp`, `nonce` and `at_hash`.
    ///
    /// `expected_nonce` is `None` for refresh responses, where the provider is not
    /// required to echo the nonce.
    pub fn validate(
        &self,
        token: &str,
        jwks: &JwkSet,
        expected_nonce: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<IdTokenClaims, AuthError> {
        let header = decode_header(token).map_err(|err| AuthError::Validation(err.to_string()))?;
        self.check_algorithm(header.alg)?;
        let key = self.decoding_key(header.alg, header.kid.as_deref(), jwks)?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.issuer]);
        validation.set_audience(&[self.client_id]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "sub", "aud"]);
        validation.leeway = self.leeway_secs;
        validation.validate_exp = true;

        let claims = decode::<IdTokenClaims>(token, &key, &validation)
            .map_err(|err| AuthError::Validation(err.to_string()))?
            .claims;

        self.check_claims(&claims, header.alg, expected_nonce, access_token)?;
        Ok(claims)
    }

    fn check_algorithm(&self, alg: Algorithm) -> Result<(), AuthError> {
        let advertised = self.allowed_algs.is_empty()
            || self
                .allowed_algs
                .iter()
                .any(|name| name.parse::<Algorithm>().is_ok_and(|allowed| allowed == alg));
        if advertised {
            Ok(())
        } else {
            Err(AuthError::Validation(format!(
                "ID token signed with {alg:?}, which the provider does not advertise"
            )))
        }
    }

    fn decoding_key(
        &self,
        alg: Algorithm,
        kid: Option<&str>,
        jwks: &JwkSet,
    ) -> Result<DecodingKey, AuthError> {
        if matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            let secret = self.client_secret.ok_or_else(|| {
                AuthError::Validation("symmetric ID token signature without a client secret".into())
            })?;
            return Ok(DecodingKey::from_secret(secret.as_bytes()));
        }

        let jwk = match kid {
            Some(kid) => jwks.find(kid),
            None if jwks.keys.len() == 1 => jwks.keys.first(),
            None => None,
        }
        .ok_or_else(|| {
            AuthError::Validation(format!(
                "no signing key matches kid {}",
                kid.unwrap_or("<none>")
            ))
        })?;

        DecodingKey::from_jwk(jwk).map_err(|err| AuthError::Validation(err.to_string()))
    }

    fn check_claims(
        &self,
        claims: &IdTokenClaims,
        alg: Algorithm,
        expected_nonce: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<(), AuthError> {
        let leeway = self.leeway_secs as i64;
        if claims.iat > Utc::now().timestamp() + leeway {
            return Err(AuthError::Validation("ID token issued in the future".into()));
        }

        if claims.aud.len() > 1 && claims.azp.is_none() {
            return Err(AuthError::Validation(
                "multi-audience ID token without azp".into(),
            ));
        }
        if let Some(azp) = &claims.azp {
            if azp != self.client_id {
                return Err(AuthError::Validation(format!(
                    "azp '{azp}' does not match client id"
                )));
            }
        }

        if let Some(expected) = expected_nonce {
            match claims.nonce.as_deref() {
                Some(nonce) if constant_time_eq(nonce, expected) => {}
                Some(_) => return Err(AuthError::Validation("nonce mismatch".into())),
                None => return Err(AuthError::Validation("ID token missing nonce".into())),
            }
        }

        if let (Some(at_hash), Some(access_token)) = (claims.at_hash.as_deref(), access_token) {
            let expected = token_hash(alg, access_token)?;
            if !constant_time_eq(at_hash, &expected) {
                return Err(AuthError::Validation("at_hash does not match access token".into()));
            }
        }
        Ok(())
    }
}

/// Left-most half of the access token digest, per OIDC Core 3.1.3.6.
pub fn token_hash(alg: Algorithm, token: &str) -> Result<String, AuthError> {
    let digest: Vec<u8> = match alg {
        Algorithm::HS256 | Algorithm::RS256 | Algorithm::PS256 | Algorithm::ES256 => {
            Sha256::digest(token.as_bytes()).to_vec()
        }
        Algorithm::HS384 | Algorithm::RS384 | Algorithm::PS384 | Algorithm::ES384 => {
            Sha384::digest(token.as_bytes()).to_vec()
        }
        Algorithm::HS512 | Algorithm::RS512 | Algorithm::PS512 => {
            Sha512::digest(token.as_bytes()).to_vec()
        }
        other => {
            return Err(AuthError::Validation(format!(
                "cannot compute at_hash for {other:?}"
            )))
        }
    };
    Ok(URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2]))
}
