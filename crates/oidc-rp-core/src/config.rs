use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::Duration;
use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

pub const DEFAULT_SCOPES: &[&str; 2] = &["openid", "profile"];
pub const DEFAULT_RENEWAL_LEAD_SECS: i64 = 60;
pub const DEFAULT_RENEWAL_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REQUEST_STATE_TTL_SECS: i64 = 900;
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 300;

/// Resolves the on-disk location used by the file-backed token store.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Attempt to discover the persistent configuration directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs =
            ProjectDirs::from("dev", "oidc-rp", "oidc-rp").ok_or(ConfigError::MissingProjectDirs)?;
        Self::from_root(dirs.config_dir().to_path_buf())
    }

    /// Use an explicit directory (created with user-only permissions).
    pub fn from_root(root: PathBuf) -> Result<Self, ConfigError> {
        fs::create_dir_all(&root).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one file per storage key.
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Bounded exponential backoff used for discovery and refresh requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: StdDuration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: StdDuration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based; attempt 1 is the first retry).
    pub fn backoff(&self, attempt: u32) -> StdDuration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: StdDuration::from_millis(250),
        }
    }
}

/// Relying-party configuration supplied by the composition root.
#[derive(Debug, Clone)]
pub struct RpConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: Url,
    pub scopes: Vec<String>,
    pub post_logout_redirect_uri: Option<Url>,
    pub extra_auth_params: Vec<(String, String)>,
    pub renewal_lead: Duration,
    pub renewal_timeout: StdDuration,
    pub request_state_ttl: Duration,
    pub clock_skew: Duration,
    pub load_user_info: bool,
    pub revoke_on_logout: bool,
    pub retry: RetryPolicy,
}

impl RpConfig {
    pub fn new<I, C>(issuer: I, client_id: C, redirect_uri: Url) -> Self
    where
        I: Into<String>,
        C: Into<String>,
    {
        Self {
            issuer: issuer.into(),
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri,
            scopes: DEFAULT_SCOPES.iter().map(|scope| scope.to_string()).collect(),
            post_logout_redirect_uri: None,
            extra_auth_params: vec![],
            renewal_lead: Duration::seconds(DEFAULT_RENEWAL_LEAD_SECS),
            renewal_timeout: StdDuration::from_secs(DEFAULT_RENEWAL_TIMEOUT_SECS),
            request_state_ttl: Duration::seconds(DEFAULT_REQUEST_STATE_TTL_SECS),
            clock_skew: Duration::seconds(DEFAULT_CLOCK_SKEW_SECS),
            load_user_info: false,
            revoke_on_logout: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Build a configuration from `OIDC_RP_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let issuer = required_var("OIDC_RP_ISSUER")?;
        let client_id = required_var("OIDC_RP_CLIENT_ID")?;
        let redirect_uri = parse_url_setting("OIDC_RP_REDIRECT_URI", &required_var("OIDC_RP_REDIRECT_URI")?)?;
        let mut config = Self::new(issuer, client_id, redirect_uri);
        if let Ok(secret) = env::var("OIDC_RP_CLIENT_SECRET") {
            config = config.with_secret(secret);
        }
        if let Ok(scopes) = env::var("OIDC_RP_SCOPES") {
            config = config.with_scopes(scopes.split_whitespace());
        }
        if let Ok(uri) = env::var("OIDC_RP_POST_LOGOUT_REDIRECT_URI") {
            config.post_logout_redirect_uri =
                Some(parse_url_setting("OIDC_RP_POST_LOGOUT_REDIRECT_URI", &uri)?);
        }
        Ok(config)
    }

    pub fn with_secret<S: Into<String>>(mut self, secret: S) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_post_logout_redirect(mut self, uri: Url) -> Self {
        self.post_logout_redirect_uri = Some(uri);
        self
    }

    pub fn with_extra_auth_param<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.extra_auth_params.push((key.into(), value.into()));
        self
    }

    pub fn with_renewal_lead(mut self, lead: Duration) -> Self {
        self.renewal_lead = lead;
        self
    }

    pub fn with_renewal_timeout(mut self, timeout: StdDuration) -> Self {
        self.renewal_timeout = timeout;
        self
    }

    pub fn with_request_state_ttl(mut self, ttl: Duration) -> Self {
        self.request_state_ttl = ttl;
        self
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    pub fn with_user_info(mut self, enabled: bool) -> Self {
        self.load_user_info = enabled;
        self
    }

    pub fn with_revoke_on_logout(mut self, enabled: bool) -> Self {
        self.revoke_on_logout = enabled;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Space-separated scope string sent to the provider.
    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }

    /// Issuer without a trailing slash, as used for discovery and comparisons.
    pub fn normalized_issuer(&self) -> &str {
        self.issuer.trim_end_matches('/')
    }

    /// Check the configuration for errors that would make every login fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let issuer = Url::parse(&self.issuer)
            .map_err(|err| ConfigError::InvalidIssuer(format!("{}: {err}", self.issuer)))?;
        if issuer.query().is_some() || issuer.fragment().is_some() {
            return Err(ConfigError::InvalidIssuer(
                "issuer must not contain a query or fragment".into(),
            ));
        }
        if issuer.scheme() != "https" && !is_loopback(&issuer) {
            return Err(ConfigError::InvalidIssuer(format!(
                "{} must use https",
                self.issuer
            )));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        if !self.scopes.iter().any(|scope| scope == "openid") {
            return Err(ConfigError::MissingOpenIdScope);
        }
        if self.redirect_uri.fragment().is_some() {
            return Err(ConfigError::InvalidRedirectUri(
                "redirect URI must not contain a fragment".into(),
            ));
        }
        if self.renewal_lead <= Duration::zero() {
            return Err(ConfigError::InvalidSetting {
                name: "renewal_lead",
                reason: "must be positive".into(),
            });
        }
        if self.request_state_ttl <= Duration::zero() {
            return Err(ConfigError::InvalidSetting {
                name: "request_state_ttl",
                reason: "must be positive".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "retry.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn is_loopback(url: &Url) -> bool {
    matches!(url.host_str(), Some("localhost") | Some("127.0.0.1") | Some("[::1]"))
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingSetting(name))
}

fn parse_url_setting(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|err| ConfigError::InvalidSetting {
        name,
        reason: err.to_string(),
    })
}

/// Errors caused by bad relying-party setup; fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for oidc-rp")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("invalid issuer: {0}")]
    InvalidIssuer(String),
    #[error("client id must not be empty")]
    MissingClientId,
    #[error("requested scopes must include 'openid'")]
    MissingOpenIdScope,
    #[error("invalid redirect URI: {0}")]
    InvalidRedirectUri(String),
    #[error("missing setting {0}")]
    MissingSetting(&'static str),
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
    #[error("discovery document issuer '{actual}' does not match configured issuer '{expected}'")]
    IssuerMismatch { expected: String, actual: String },
    #[error("provider does not support {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(issuer: &str) -> RpConfig {
        RpConfig::new(
            issuer,
            "client",
            Url::parse("http://127.0.0.1:9000/callback").unwrap(),
        )
    }

    #[test]
    fn store_dir_lives_under_root() {
        let temp_dir = TempDir::new().unwrap();
        let locator = ConfigLocator::from_root(temp_dir.path().join("cfg")).unwrap();
        assert!(locator.store_dir().ends_with("cfg/store"));
        assert!(locator.root().exists());
    }

    #[test]
    fn defaults_request_openid_profile() {
        let config = config("https://idp.example");
        assert_eq!(config.scope(), "openid profile");
        config.validate().unwrap();
    }

    #[test]
    fn rejects_plain_http_issuer() {
        let err = config("http://idp.example").validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIssuer(_)));
        config("http://127.0.0.1:8080").validate().unwrap();
    }

    #[test]
    fn rejects_missing_openid_scope() {
        let err = config("https://idp.example")
            .with_scopes(["profile"])
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingOpenIdScope));
    }

    #[test]
    fn rejects_empty_client_id() {
        let mut config = config("https://idp.example");
        config.client_id = " ".into();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::MissingClientId
        ));
    }

    #[test]
    fn normalized_issuer_strips_trailing_slash() {
        assert_eq!(
            config("https://idp.example/").normalized_issuer(),
            "https://idp.example"
        );
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff: StdDuration::from_millis(100),
        };
        assert_eq!(policy.backoff(1), StdDuration::from_millis(100));
        assert_eq!(policy.backoff(2), StdDuration::from_millis(200));
        assert_eq!(policy.backoff(3), StdDuration::from_millis(400));
    }
}
