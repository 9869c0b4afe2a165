//! Fixtures shared by the auth unit tests: a signing key, an ID token builder and
//! an httpmock-backed provider.

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use httpmock::prelude::*;
use httpmock::Mock;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Map, Value};
use url::Url;

use crate::config::{RetryPolicy, RpConfig};

use super::id_token::token_hash;
use super::{ProtocolClient, Session, StorageScope, TokenStore, TokenType};

pub const CLIENT_ID: &str = "client";
pub const SUBJECT: &str = "user-1";
pub const TEST_KID: &str = "test-key";
pub const REDIRECT_URI: &str = "http://127.0.0.1:9000/callback";

const RSA_PRIVATE_PEM: &[u8] = include_bytes!("testdata/rsa_private.pem");
const RSA_MODULUS: &str = "yC66veNChk7KhfI5M8G876SwLwDVUhDB-CdCqWJi3wo3b55qFfbH38rc-0s9n8ZIEqdXe_SpIImO7lhpxBaSfAbXswzUzT0laOiQjC7NgucCtzfcSgxKFdDp8QGYXxH3FD3Qf5zGmR7iQ4JTzVfWmRlSSvLqmx_QAWoHet2uvxr2jj3rWOPbtFOd9-uE1Bo2dgagkucUQm4KpACx7U4Q3XXGkr4EdLtfI5VG1GqeEcPDeKtuWJ1q_SaPJuX53OVllTQi_EjCe0BggeE6iPylgxeGDOqle-ME9S3MJhDDXxs3xflWFQy7m6nBQkW6Yi7PW3mhrI9m6kz6UMJk1ioNHw";
const RSA_EXPONENT: &str = "AQAB";

/// Builder for ID token claims signed by the test key.
#[derive(Debug, Clone)]
pub struct IdTokenBuilder {
    issuer: String,
    audience: Vec<String>,
    subject: String,
    nonce: Option<String>,
    azp: Option<String>,
    at_hash: Option<String>,
    expires_in: i64,
    kid: String,
}

impl IdTokenBuilder {
    pub fn new(issuer: &str, audience: &str, subject: &str) -> Self {
        Self {
            issuer: issuer.to_owned(),
            audience: vec![audience.to_owned()],
            subject: subject.to_owned(),
            nonce: None,
            azp: None,
            at_hash: None,
            expires_in: 3600,
            kid: TEST_KID.to_owned(),
        }
    }

    pub fn nonce(mut self, nonce: &str) -> Self {
        self.nonce = Some(nonce.to_owned());
        self
    }

    pub fn azp(mut self, azp: &str) -> Self {
        self.azp = Some(azp.to_owned());
        self
    }

    pub fn extra_audience(mut self, audience: &str) -> Self {
        self.audience.push(audience.to_owned());
        self
    }

    pub fn at_hash_for(mut self, access_token: &str) -> Self {
        self.at_hash = Some(token_hash(Algorithm::RS256, access_token).unwrap());
        self
    }

    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.expires_in = seconds;
        self
    }

    pub fn kid(mut self, kid: &str) -> Self {
        self.kid = kid.to_owned();
        self
    }

    fn claims(&self) -> Value {
        let now = Utc::now().timestamp();
        let aud = match self.audience.as_slice() {
            [single] => Value::from(single.clone()),
            many => Value::from(many.to_vec()),
        };
        let mut claims = json!({
            "iss": self.issuer,
            "sub": self.subject,
            "aud": aud,
            "iat": now - 5,
            "exp": now + self.expires_in,
            "name": "Test User",
        });
        let object = claims.as_object_mut().unwrap();
        if let Some(nonce) = &self.nonce {
            object.insert("nonce".into(), Value::from(nonce.clone()));
        }
        if let Some(azp) = &self.azp {
            object.insert("azp".into(), Value::from(azp.clone()));
        }
        if let Some(at_hash) = &self.at_hash {
            object.insert("at_hash".into(), Value::from(at_hash.clone()));
        }
        claims
    }
}

pub fn sign_id_token(token: &IdTokenBuilder) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(token.kid.clone());
    let key = EncodingKey::from_rsa_pem(RSA_PRIVATE_PEM).unwrap();
    encode(&header, &token.claims(), &key).unwrap()
}

pub fn sign_hs256_id_token(token: &IdTokenBuilder, secret: &str) -> String {
    encode(
        &Header::new(Algorithm::HS256),
        &token.claims(),
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

fn jwks_json() -> Value {
    json!({
        "keys": [{
            "kty": "RSA",
            "kid": TEST_KID,
            "use": "sig",
            "alg": "RS256",
            "n": RSA_MODULUS,
            "e": RSA_EXPONENT,
        }]
    })
}

pub fn test_jwks() -> JwkSet {
    serde_json::from_value(jwks_json()).unwrap()
}

pub fn sample_session() -> Session {
    let now = Utc::now();
    Session {
        subject: SUBJECT.into(),
        access_token: "access-0".into(),
        refresh_token: Some("refresh-0".into()),
        id_token: "header.payload.signature".into(),
        token_type: TokenType::Bearer,
        expires_at: now + Duration::hours(1),
        scope: vec!["openid".into(), "profile".into()],
        acquired_at: now,
        session_state: None,
        profile: Map::from_iter([("name".to_string(), Value::from("Test User"))]),
    }
}

/// Configuration pointing at `issuer` with a short retry budget.
pub fn rp_config(issuer: &str) -> RpConfig {
    RpConfig::new(issuer, CLIENT_ID, Url::parse(REDIRECT_URI).unwrap()).with_retry_policy(
        RetryPolicy {
            max_attempts: 2,
            initial_backoff: StdDuration::from_millis(10),
        },
    )
}

pub fn memory_store(config: &RpConfig) -> TokenStore {
    TokenStore::in_memory(StorageScope::new(&config.issuer, &config.client_id))
}

pub fn query_param(url: &Url, name: &str) -> String {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| panic!("missing query parameter {name} in {url}"))
}

pub async fn mount_discovery(server: &MockServer) -> Mock<'_> {
    let base = server.base_url();
    server
        .mock_async(|when, then| {
            when.method(GET).path("/.well-known/openid-configuration");
            then.status(200).json_body(json!({
                "issuer": base,
                "authorization_endpoint": format!("{base}/authorize"),
                "token_endpoint": format!("{base}/token"),
                "jwks_uri": format!("{base}/jwks"),
                "userinfo_endpoint": format!("{base}/userinfo"),
                "end_session_endpoint": format!("{base}/logout"),
                "revocation_endpoint": format!("{base}/revoke"),
                "scopes_supported": ["openid", "profile", "email"],
                "response_types_supported": ["code"],
                "grant_types_supported": ["authorization_code", "refresh_token"],
                "code_challenge_methods_supported": ["S256"],
                "id_token_signing_alg_values_supported": ["RS256"],
            }));
        })
        .await
}

/// An OpenID provider served by httpmock with discovery and JWKS mounted.
pub struct MockProvider {
    pub server: MockServer,
}

impl MockProvider {
    pub async fn start() -> Self {
        let server = MockServer::start_async().await;
        mount_discovery(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/jwks");
                then.status(200).json_body(jwks_json());
            })
            .await;
        Self { server }
    }

    pub fn issuer(&self) -> String {
        self.server.base_url()
    }

    pub fn config(&self) -> RpConfig {
        rp_config(&self.issuer())
    }

    pub fn client(&self) -> ProtocolClient {
        ProtocolClient::new(self.config()).unwrap()
    }

    pub fn id_token(&self, nonce: Option<&str>, access_token: &str) -> String {
        let mut token = IdTokenBuilder::new(&self.issuer(), CLIENT_ID, SUBJECT).at_hash_for(access_token);
        if let Some(nonce) = nonce {
            token = token.nonce(nonce);
        }
        sign_id_token(&token)
    }

    pub fn token_response(
        &self,
        nonce: Option<&str>,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in: i64,
    ) -> Value {
        let mut body = json!({
            "access_token": access_token,
            "token_type": "Bearer",
            "expires_in": expires_in,
            "id_token": self.id_token(nonce, access_token),
        });
        if let Some(refresh) = refresh_token {
            body.as_object_mut()
                .unwrap()
                .insert("refresh_token".into(), Value::from(refresh));
        }
        body
    }

    /// Mount a token endpoint response for one grant type.
    pub async fn mock_token(&self, grant_type: &str, body: Value) -> Mock<'_> {
        self.server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_contains(format!("grant_type={grant_type}"));
                then.status(200).json_body(body);
            })
            .await
    }
}
