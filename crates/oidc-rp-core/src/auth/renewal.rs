use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::events::{EventBus, SessionEvent};
use super::protocol::{AuthorizationRequest, ProtocolClient};
use super::{AuthChallenge, AuthError, AuthRequestState, CallbackParams, Session, TokenSet};

/// Observable state of the renewal timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewState {
    Idle,
    Scheduled { at: DateTime<Utc> },
    Renewing,
    Failed,
}

impl fmt::Display for RenewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenewState::Idle => write!(f, "idle"),
            RenewState::Scheduled { at } => write!(f, "scheduled for {}", at.to_rfc3339()),
            RenewState::Renewing => write!(f, "renewing"),
            RenewState::Failed => write!(f, "failed"),
        }
    }
}

/// Obtains fresh tokens for `current` without user interaction.
///
/// Implementations must not mutate shared session state; the caller commits
/// the returned [`TokenSet`] only once the transaction completes.
#[async_trait]
pub trait RenewalTransaction: Send + Sync {
    async fn renew(&self, current: &Session) -> Result<TokenSet, AuthError>;

    /// Whether `renew` has any chance of succeeding for `session`.
    fn can_renew(&self, session: &Session) -> bool {
        let _ = session;
        true
    }
}

/// Renewal through the refresh-token grant.
#[derive(Debug, Clone)]
pub struct RefreshTokenRenewal {
    protocol: ProtocolClient,
}

impl RefreshTokenRenewal {
    pub fn new(protocol: ProtocolClient) -> Self {
        Self { protocol }
    }
}

#[async_trait]
impl RenewalTransaction for RefreshTokenRenewal {
    async fn renew(&self, current: &Session) -> Result<TokenSet, AuthError> {
        let refresh_token = current
            .refresh_token
            .as_deref()
            .ok_or(AuthError::RenewalUnavailable)?;
        self.protocol.refresh(refresh_token).await
    }

    fn can_renew(&self, session: &Session) -> bool {
        session.refresh_token.is_some()
    }
}

/// Loads an authorization URL out of sight (hidden frame, headless agent, ...)
/// and returns the URL the provider finally redirected to.
#[async_trait]
pub trait SilentNavigator: Send + Sync {
    async fn navigate(&self, authorization_url: Url) -> Result<Url, AuthError>;
}

/// Renewal through a `prompt=none` authorization request with its own challenge.
#[derive(Clone)]
pub struct SilentAuthorizeRenewal {
    protocol: ProtocolClient,
    navigator: Arc<dyn SilentNavigator>,
}

impl fmt::Debug for SilentAuthorizeRenewal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SilentAuthorizeRenewal")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl SilentAuthorizeRenewal {
    pub fn new(protocol: ProtocolClient, navigator: Arc<dyn SilentNavigator>) -> Self {
        Self {
            protocol,
            navigator,
        }
    }
}

#[async_trait]
impl RenewalTransaction for SilentAuthorizeRenewal {
    async fn renew(&self, current: &Session) -> Result<TokenSet, AuthError> {
        let config = self.protocol.config();
        let discovery = self.protocol.fetch_discovery_document().await?;
        let challenge = AuthChallenge::generate();
        let request = AuthRequestState::new(&challenge, config.scope(), config.redirect_uri.clone());

        let authorization = AuthorizationRequest::new(
            &request.scope,
            &request.redirect_uri,
            challenge.pkce.challenge(),
            &request.state,
            &request.nonce,
        )
        .with_prompt("none")
        .with_id_token_hint(&current.id_token);
        let url = self.protocol.begin_authorization(&discovery, &authorization);

        debug!("starting silent authorization");
        let redirect = self.navigator.navigate(url).await?;
        let params = CallbackParams::from_url(&redirect);
        self.protocol.exchange_code(&params, &request).await
    }
}

/// Refresh grant when a refresh token is held, silent authorization otherwise.
#[derive(Debug, Clone)]
pub struct FallbackRenewal {
    refresh: RefreshTokenRenewal,
    silent: SilentAuthorizeRenewal,
}

impl FallbackRenewal {
    pub fn new(protocol: ProtocolClient, navigator: Arc<dyn SilentNavigator>) -> Self {
        Self {
            refresh: RefreshTokenRenewal::new(protocol.clone()),
            silent: SilentAuthorizeRenewal::new(protocol, navigator),
        }
    }
}

#[async_trait]
impl RenewalTransaction for FallbackRenewal {
    async fn renew(&self, current: &Session) -> Result<TokenSet, AuthError> {
        if current.refresh_token.is_some() {
            self.refresh.renew(current).await
        } else {
            self.silent.renew(current).await
        }
    }
}

pub type RenewFuture = Pin<Box<dyn Future<Output = Result<DateTime<Utc>, AuthError>> + Send>>;

/// Performs and commits one renewal, yielding the new expiry.
pub type RenewFn = Arc<dyn Fn() -> RenewFuture + Send + Sync>;

/// When a session expiring at `expires_at` should be renewed.
pub fn renewal_time(expires_at: DateTime<Utc>, lead: Duration) -> DateTime<Utc> {
    (expires_at - lead).max(Utc::now())
}

/// Timer that renews the session ahead of expiry.
pub struct SilentRenewScheduler {
    lead: Duration,
    timeout: StdDuration,
    events: EventBus,
    state: Arc<watch::Sender<RenewState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SilentRenewScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SilentRenewScheduler")
            .field("lead", &self.lead)
            .field("timeout", &self.timeout)
            .field("state", &self.state())
            .finish()
    }
}

impl SilentRenewScheduler {
    pub fn new(lead: Duration, timeout: StdDuration, events: EventBus) -> Self {
        let (state, _) = watch::channel(RenewState::Idle);
        Self {
            lead,
            timeout,
            events,
            state: Arc::new(state),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RenewState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<RenewState> {
        self.state.subscribe()
    }

    /// Replace any pending timer with one for a session expiring at `expires_at`.
    ///
    /// Without a renewer the timer only reports `Expiring` and `Expired`.
    pub fn arm(&self, expires_at: DateTime<Utc>, renew: Option<RenewFn>) {
        let mut task = self.lock_task();
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let timer = Timer {
            lead: self.lead,
            timeout: self.timeout,
            events: self.events.clone(),
            state: self.state.clone(),
        };
        let at = renewal_time(expires_at, self.lead);
        self.state.send_replace(RenewState::Scheduled { at });
        debug!(renew_at = %at, "renewal scheduled");
        *task = Some(tokio::spawn(timer.run(expires_at, renew)));
    }

    /// Drop a scheduled or in-flight renewal.
    pub fn cancel(&self) {
        if let Some(task) = self.lock_task().take() {
            task.abort();
            debug!("renewal cancelled");
        }
        self.state.send_replace(RenewState::Idle);
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SilentRenewScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.lock_task().take() {
            task.abort();
        }
    }
}

struct Timer {
    lead: Duration,
    timeout: StdDuration,
    events: EventBus,
    state: Arc<watch::Sender<RenewState>>,
}

impl Timer {
    async fn run(self, mut expires_at: DateTime<Utc>, renew: Option<RenewFn>) {
        loop {
            let at = renewal_time(expires_at, self.lead);
            self.state.send_replace(RenewState::Scheduled { at });
            sleep_until(at).await;
            self.events.emit(SessionEvent::Expiring { expires_at });

            let Some(renew) = renew.as_ref() else {
                self.state.send_replace(RenewState::Idle);
                self.expire_at(expires_at).await;
                return;
            };

            self.state.send_replace(RenewState::Renewing);
            self.events.emit(SessionEvent::Renewing);
            let err = match tokio::time::timeout(self.timeout, renew()).await {
                Ok(Ok(next)) => {
                    info!(expires_at = %next, "session renewed");
                    self.state.send_replace(RenewState::Idle);
                    expires_at = next;
                    continue;
                }
                Ok(Err(err)) => err,
                Err(_) => AuthError::RenewalTimeout,
            };

            warn!(error = %err, terminal = err.is_terminal(), "silent renewal failed");
            self.state.send_replace(RenewState::Failed);
            self.events.emit(SessionEvent::RenewError(Arc::new(err)));
            self.expire_at(expires_at).await;
            return;
        }
    }

    async fn expire_at(&self, expires_at: DateTime<Utc>) {
        sleep_until(expires_at).await;
        info!("session expired");
        self.events.emit(SessionEvent::Expired);
    }
}

async fn sleep_until(at: DateTime<Utc>) {
    let delay = (at - Utc::now()).to_std().unwrap_or_default();
    tokio::time::sleep(delay).await;
}
