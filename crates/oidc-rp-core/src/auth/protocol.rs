use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode_header, Algorithm};
use reqwest::header::ACCEPT;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ConfigError, RpConfig};

use super::id_token::{IdTokenClaims, IdTokenValidator};
use super::utils::constant_time_eq;
use super::{AuthError, AuthRequestState, CallbackParams, DiscoveryDocument, TokenSet};

const DEFAULT_USER_AGENT: &str = concat!("oidc-rp/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(30);
const RESERVED_AUTH_PARAMS: &[&str] = &[
    "response_type",
    "client_id",
    "redirect_uri",
    "scope",
    "state",
    "nonce",
    "code_challenge",
    "code_challenge_method",
];

/// Inputs of one authorization redirect.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest<'a> {
    pub scope: &'a str,
    pub redirect_uri: &'a Url,
    pub code_challenge: &'a str,
    pub state: &'a str,
    pub nonce: &'a str,
    pub prompt: Option<&'a str>,
    pub login_hint: Option<&'a str>,
    pub id_token_hint: Option<&'a str>,
}

impl<'a> AuthorizationRequest<'a> {
    pub fn new(
        scope: &'a str,
        redirect_uri: &'a Url,
        code_challenge: &'a str,
        state: &'a str,
        nonce: &'a str,
    ) -> Self {
        Self {
            scope,
            redirect_uri,
            code_challenge,
            state,
            nonce,
            prompt: None,
            login_hint: None,
            id_token_hint: None,
        }
    }

    pub fn with_prompt(mut self, prompt: &'a str) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_login_hint(mut self, hint: &'a str) -> Self {
        self.login_hint = Some(hint);
        self
    }

    pub fn with_id_token_hint(mut self, hint: &'a str) -> Self {
        self.id_token_hint = Some(hint);
        self
    }
}

/// Back-channel OIDC client: discovery, code exchange, refresh, userinfo, revocation.
#[derive(Debug, Clone)]
pub struct ProtocolClient {
    http: Client,
    config: Arc<RpConfig>,
    discovery: Arc<RwLock<Option<Arc<DiscoveryDocument>>>>,
    jwks: Arc<RwLock<Option<Arc<JwkSet>>>>,
}

impl ProtocolClient {
    pub fn new(config: RpConfig) -> Result<Self, AuthError> {
        let http = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Self::with_http_client(config, http)
    }

    pub fn with_http_client(config: RpConfig, http: Client) -> Result<Self, AuthError> {
        config.validate()?;
        Ok(Self {
            http,
            config: Arc::new(config),
            discovery: Arc::new(RwLock::new(None)),
            jwks: Arc::new(RwLock::new(None)),
        })
    }

    pub fn config(&self) -> &RpConfig {
        &self.config
    }

    /// Fetch and cache the provider's discovery document.
    pub async fn fetch_discovery_document(&self) -> Result<Arc<DiscoveryDocument>, AuthError> {
        if let Some(doc) = self.discovery.read().await.as_ref() {
            return Ok(doc.clone());
        }

        let mut slot = self.discovery.write().await;
        if let Some(doc) = slot.as_ref() {
            return Ok(doc.clone());
        }

        let url = DiscoveryDocument::url_for(&self.config.issuer)?;
        let url = &url;
        let doc: DiscoveryDocument = self
            .with_retry("discovery", move || self.get_json(url.clone()))
            .await?;

        if doc.issuer.trim_end_matches('/') != self.config.normalized_issuer() {
            return Err(ConfigError::IssuerMismatch {
                expected: self.config.issuer.clone(),
                actual: doc.issuer,
            }
            .into());
        }
        if !doc.supports_pkce_s256() {
            return Err(ConfigError::Unsupported("PKCE with S256".into()).into());
        }

        info!(issuer = %doc.issuer, "loaded discovery document");
        let doc = Arc::new(doc);
        *slot = Some(doc.clone());
        Ok(doc)
    }

    /// Build the authorization endpoint URL. No side effects.
    pub fn begin_authorization(
        &self,
        discovery: &DiscoveryDocument,
        request: &AuthorizationRequest<'_>,
    ) -> Url {
        let mut url = discovery.authorization_endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("response_type", "code");
            pairs.append_pair("client_id", &self.config.client_id);
            pairs.append_pair("redirect_uri", request.redirect_uri.as_str());
            pairs.append_pair("scope", request.scope);
            pairs.append_pair("state", request.state);
            pairs.append_pair("nonce", request.nonce);
            pairs.append_pair("code_challenge", request.code_challenge);
            pairs.append_pair("code_challenge_method", "S256");
            if let Some(prompt) = request.prompt {
                pairs.append_pair("prompt", prompt);
            }
            if let Some(hint) = request.login_hint {
                pairs.append_pair("login_hint", hint);
            }
            if let Some(hint) = request.id_token_hint {
                pairs.append_pair("id_token_hint", hint);
            }
            for (key, value) in &self.config.extra_auth_params {
                if RESERVED_AUTH_PARAMS.contains(&key.as_str()) {
                    warn!(param = %key, "ignoring extra authorization parameter that overrides a protocol parameter");
                    continue;
                }
                pairs.append_pair(key, value);
            }
        }
        url
    }

    /// Exchange an authorization code after checking it belongs to `request`.
    pub async fn exchange_code(
        &self,
        callback: &CallbackParams,
        request: &AuthRequestState,
    ) -> Result<TokenSet, AuthError> {
        let returned_state = callback.state.as_deref().unwrap_or_default();
        if !constant_time_eq(returned_state, &request.state) {
            return Err(AuthError::StateMismatch);
        }
        if let Some(err) = callback.provider_error() {
            return Err(err);
        }
        let code = callback
            .code
            .as_deref()
            .ok_or(AuthError::MissingAuthorizationCode)?;

        let doc = self.fetch_discovery_document().await?;
        if let Some(iss) = &callback.iss {
            if iss.trim_end_matches('/') != doc.issuer.trim_end_matches('/') {
                return Err(AuthError::Validation(format!(
                    "authorization response issued by '{iss}'"
                )));
            }
        }

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_owned()),
            ("redirect_uri", request.redirect_uri.to_string()),
            ("code_verifier", request.code_verifier.clone()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        debug!(endpoint = %doc.token_endpoint, "exchanging authorization code");
        let response = self.post_form(&doc.token_endpoint, &form).await?;
        let received_at = Utc::now();
        let payload = read_token_response(response).await?;

        let id_token = payload
            .id_token
            .as_deref()
            .ok_or_else(|| AuthError::Protocol("token response missing id_token".into()))?;
        let claims = self
            .validate_id_token(&doc, id_token, Some(&request.nonce), Some(&payload.access_token))
            .await?;

        payload.into_token_set(
            received_at,
            Some(claims),
            request.requested_scopes(),
            callback.session_state.clone(),
        )
    }

    /// Redeem a refresh token. A rejected token surfaces as [`AuthError::InvalidGrant`].
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AuthError> {
        let doc = self.fetch_discovery_document().await?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_owned()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        debug!(endpoint = %doc.token_endpoint, "refreshing tokens");
        let (form, endpoint) = (&form, &doc.token_endpoint);
        let (payload, received_at) = self
            .with_retry("refresh", move || async move {
                let response = self.post_form(endpoint, form).await?;
                let received_at = Utc::now();
                Ok((read_token_response(response).await?, received_at))
            })
            .await
            .map_err(|err| match err {
                AuthError::Provider { error, .. } if error == "invalid_grant" => {
                    AuthError::InvalidGrant
                }
                other => other,
            })?;

        let claims = match payload.id_token.as_deref() {
            Some(id_token) => Some(
                self.validate_id_token(&doc, id_token, None, Some(&payload.access_token))
                    .await?,
            ),
            None => None,
        };

        payload.into_token_set(received_at, claims, vec![], None)
    }

    /// Claims from the userinfo endpoint; `sub` must match the session subject.
    pub async fn fetch_user_info(
        &self,
        access_token: &str,
        expected_subject: &str,
    ) -> Result<Map<String, Value>, AuthError> {
        let doc = self.fetch_discovery_document().await?;
        let endpoint = doc
            .userinfo_endpoint
            .clone()
            .ok_or_else(|| ConfigError::Unsupported("userinfo endpoint".into()))?;

        debug!(%endpoint, "loading userinfo");
        let response = self
            .http
            .get(endpoint)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let claims: Map<String, Value> = read_json(response, "userinfo").await?;

        match claims.get("sub").and_then(Value::as_str) {
            Some(sub) if sub == expected_subject => Ok(claims),
            _ => Err(AuthError::Validation("userinfo subject mismatch".into())),
        }
    }

    /// Revoke a token (RFC 7009). `hint` is `access_token` or `refresh_token`.
    pub async fn revoke(&self, token: &str, hint: &str) -> Result<(), AuthError> {
        let doc = self.fetch_discovery_document().await?;
        let endpoint = doc
            .revocation_endpoint
            .clone()
            .ok_or_else(|| ConfigError::Unsupported("token revocation".into()))?;

        let mut form = vec![
            ("token", token.to_owned()),
            ("token_type_hint", hint.to_owned()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        debug!(%endpoint, hint, "revoking token");
        let response = self.post_form(&endpoint, &form).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.is_server_error() {
            return Err(AuthError::ServerUnavailable { status });
        }
        let body = response.text().await.unwrap_or_default();
        Err(error_from_body(status, &body))
    }

    /// RP-initiated logout URL, when the provider advertises an end-session endpoint.
    pub fn end_session_url(
        &self,
        discovery: &DiscoveryDocument,
        id_token_hint: Option<&str>,
        state: Option<&str>,
    ) -> Option<Url> {
        let mut url = discovery.end_session_endpoint.clone()?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("client_id", &self.config.client_id);
            if let Some(hint) = id_token_hint {
                pairs.append_pair("id_token_hint", hint);
            }
            if let Some(redirect) = &self.config.post_logout_redirect_uri {
                pairs.append_pair("post_logout_redirect_uri", redirect.as_str());
            }
            if let Some(state) = state {
                pairs.append_pair("state", state);
            }
        }
        Some(url)
    }

    async fn validate_id_token(
        &self,
        doc: &DiscoveryDocument,
        id_token: &str,
        expected_nonce: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<IdTokenClaims, AuthError> {
        let header = decode_header(id_token).map_err(|err| AuthError::Validation(err.to_string()))?;
        let jwks = if matches!(header.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            Arc::new(JwkSet { keys: vec![] })
        } else {
            let cached = self.jwks(false).await?;
            match header.kid.as_deref() {
                Some(kid) if cached.find(kid).is_none() => {
                    debug!(kid, "unknown signing key, reloading JWKS");
                    self.jwks(true).await?
                }
                _ => cached,
            }
        };

        let validator = IdTokenValidator {
            issuer: &doc.issuer,
            client_id: &self.config.client_id,
            client_secret: self.config.client_secret.as_deref(),
            leeway_secs: self.config.clock_skew.num_seconds().max(0) as u64,
            allowed_algs: &doc.id_token_signing_alg_values_supported,
        };
        validator.validate(id_token, &jwks, expected_nonce, access_token)
    }

    async fn jwks(&self, reload: bool) -> Result<Arc<JwkSet>, AuthError> {
        if !reload {
            if let Some(jwks) = self.jwks.read().await.as_ref() {
                return Ok(jwks.clone());
            }
        }

        let doc = self.fetch_discovery_document().await?;
        let mut slot = self.jwks.write().await;
        if !reload {
            if let Some(jwks) = slot.as_ref() {
                return Ok(jwks.clone());
            }
        }

        let url = &doc.jwks_uri;
        let jwks: JwkSet = self
            .with_retry("jwks", move || self.get_json(url.clone()))
            .await?;
        debug!(keys = jwks.keys.len(), "loaded JWKS");
        let jwks = Arc::new(jwks);
        *slot = Some(jwks.clone());
        Ok(jwks)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, AuthError> {
        debug!(%url, "GET");
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        read_json(response, "provider metadata").await
    }

    async fn post_form(
        &self,
        url: &Url,
        form: &[(&'static str, String)],
    ) -> Result<Response, AuthError> {
        Ok(self
            .http
            .post(url.clone())
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .await?)
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, AuthError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AuthError>>,
    {
        let policy = self.config.retry;
        let mut attempt = 1;
        loop {
            match call().await {
                Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(operation, attempt, ?delay, error = %err, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    refresh_token: Option<String>,
    id_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

impl TokenResponse {
    fn into_token_set(
        self,
        received_at: DateTime<Utc>,
        claims: Option<IdTokenClaims>,
        requested_scope: Vec<String>,
        session_state: Option<String>,
    ) -> Result<TokenSet, AuthError> {
        let token_type = self.token_type.parse()?;

        let expires_at = match (self.expires_in, claims.as_ref()) {
            (Some(seconds), _) if seconds > 0 => received_at + Duration::seconds(seconds),
            (Some(seconds), _) => {
                return Err(AuthError::Protocol(format!("invalid expires_in {seconds}")))
            }
            (None, Some(claims)) => DateTime::from_timestamp(claims.exp, 0)
                .ok_or_else(|| AuthError::Protocol("ID token exp out of range".into()))?,
            (None, None) => {
                return Err(AuthError::Protocol(
                    "token response carries no expiry".into(),
                ))
            }
        };

        let scope = match self.scope {
            Some(scope) => scope.split_whitespace().map(ToOwned::to_owned).collect(),
            None => requested_scope,
        };

        Ok(TokenSet {
            access_token: self.access_token,
            token_type,
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            claims,
            expires_at,
            scope,
            session_state,
            received_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    error_description: Option<String>,
}

fn truncate(body: &str) -> &str {
    const LIMIT: usize = 256;
    match body.char_indices().nth(LIMIT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

fn error_from_body(status: reqwest::StatusCode, body: &str) -> AuthError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) => AuthError::Provider {
            error: err.error,
            description: err.error_description,
        },
        Err(_) => AuthError::Protocol(format!("provider returned {status}: {}", truncate(body))),
    }
}

async fn read_token_response(response: Response) -> Result<TokenResponse, AuthError> {
    let status = response.status();
    if status.is_server_error() {
        return Err(AuthError::ServerUnavailable { status });
    }
    let body = response.text().await?;
    if !status.is_success() {
        return Err(error_from_body(status, &body));
    }
    serde_json::from_str(&body)
        .map_err(|err| AuthError::Protocol(format!("malformed token response: {err}")))
}

async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, AuthError> {
    let status = response.status();
    if status.is_server_error() {
        return Err(AuthError::ServerUnavailable { status });
    }
    let body = response.text().await?;
    if !status.is_success() {
        return Err(AuthError::Protocol(format!(
            "{what} request returned {status}: {}",
            truncate(&body)
        )));
    }
    serde_json::from_str(&body)
        .map_err(|err| AuthError::Protocol(format!("malformed {what} response: {err}")))
}
