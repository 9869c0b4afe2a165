use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::Utc;
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::coordinator::{CrossContextCoordinator, Incoming, Reconciliation, SessionChange};
use super::events::{EventBus, SessionEvent, SubscriptionId};
use super::protocol::{AuthorizationRequest, ProtocolClient};
use super::renewal::{
    RefreshTokenRenewal, RenewFn, RenewFuture, RenewState, RenewalTransaction,
    SilentRenewScheduler,
};
use super::{AuthChallenge, AuthError, AuthRequestState, CallbackParams, Session, TokenStore};

/// Builder for [`SessionManager`]; renewal defaults to the refresh-token grant.
pub struct SessionManagerBuilder {
    protocol: ProtocolClient,
    store: TokenStore,
    renewal: Option<Arc<dyn RenewalTransaction>>,
    coordinator: Option<CrossContextCoordinator>,
}

impl SessionManagerBuilder {
    pub fn renewal(mut self, renewal: Arc<dyn RenewalTransaction>) -> Self {
        self.renewal = Some(renewal);
        self
    }

    /// Never renew; the session simply expires.
    pub fn without_renewal(mut self) -> Self {
        self.renewal = None;
        self
    }

    pub fn coordinator(mut self, coordinator: CrossContextCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn build(self) -> SessionManager {
        let config = self.protocol.config();
        let events = EventBus::new();
        let scheduler =
            SilentRenewScheduler::new(config.renewal_lead, config.renewal_timeout, events.clone());
        SessionManager {
            inner: Arc::new(Inner {
                protocol: self.protocol,
                store: self.store,
                events,
                scheduler,
                renewal: self.renewal,
                coordinator: self.coordinator,
                session: RwLock::new(None),
                op_guard: AsyncMutex::new(()),
                epoch: AtomicU64::new(0),
                listener: Mutex::new(None),
            }),
        }
    }
}

/// Owns the signed-in session of one storage scope and drives its lifecycle.
///
/// Login, callback handling and manual renewal are serialized; a second call
/// while one is in flight fails with [`AuthError::OperationInProgress`].
/// Logout never waits: it invalidates whatever is in flight.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    protocol: ProtocolClient,
    store: TokenStore,
    events: EventBus,
    scheduler: SilentRenewScheduler,
    renewal: Option<Arc<dyn RenewalTransaction>>,
    coordinator: Option<CrossContextCoordinator>,
    session: RwLock<Option<Session>>,
    op_guard: AsyncMutex<()>,
    // bumped by every sign-out; results started under an older epoch are discarded
    epoch: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("scope", self.inner.store.scope())
            .field("signed_in", &self.inner.read_session().is_some())
            .field("renewal", &self.inner.scheduler.state())
            .finish()
    }
}

impl SessionManager {
    pub fn builder(protocol: ProtocolClient, store: TokenStore) -> SessionManagerBuilder {
        let renewal: Arc<dyn RenewalTransaction> =
            Arc::new(RefreshTokenRenewal::new(protocol.clone()));
        SessionManagerBuilder {
            protocol,
            store,
            renewal: Some(renewal),
            coordinator: None,
        }
    }

    pub fn new(protocol: ProtocolClient, store: TokenStore) -> Self {
        Self::builder(protocol, store).build()
    }

    pub fn protocol(&self) -> &ProtocolClient {
        &self.inner.protocol
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Load persisted state, arm renewal and start listening to peer contexts.
    pub async fn initialize(&self) -> Result<Option<Session>, AuthError> {
        let inner = &self.inner;
        let stored = match inner.store.load_session()? {
            Some(session) if session.is_expired() && !inner.can_renew(&session) => {
                info!(subject = %session.subject, "discarding expired session");
                inner.store.remove_session()?;
                None
            }
            other => other,
        };

        *inner.write_session() = stored.clone();
        match &stored {
            Some(session) => {
                debug!(subject = %session.subject, expires_at = %session.expires_at, "restored session");
                inner.arm(session.expires_at);
            }
            None => inner.scheduler.cancel(),
        }
        self.spawn_listener();
        Ok(stored)
    }

    /// Start a login and return the authorization URL to send the user to.
    pub async fn login(&self) -> Result<Url, AuthError> {
        let _guard = self.inner.try_guard()?;
        let inner = &self.inner;
        let config = inner.protocol.config();

        if let Some(pending) = inner.store.load_request()? {
            if !pending.is_expired(config.request_state_ttl) {
                return Err(AuthError::OperationInProgress);
            }
            debug!("discarding expired login request");
            inner.store.take_request()?;
        }

        let discovery = inner.protocol.fetch_discovery_document().await?;
        let challenge = AuthChallenge::generate();
        let request = AuthRequestState::new(&challenge, config.scope(), config.redirect_uri.clone());
        if !inner.store.save_request_if_absent(&request)? {
            return Err(AuthError::OperationInProgress);
        }

        let authorization = AuthorizationRequest::new(
            &request.scope,
            &request.redirect_uri,
            challenge.pkce.challenge(),
            &request.state,
            &request.nonce,
        );
        info!(scope = %request.scope, "login started");
        Ok(inner.protocol.begin_authorization(&discovery, &authorization))
    }

    /// Abandon a pending login so a new one can start. Returns whether one existed.
    pub fn cancel_login(&self) -> Result<bool, AuthError> {
        let cancelled = self.inner.store.take_request()?.is_some();
        if cancelled {
            info!("pending login cancelled");
        }
        Ok(cancelled)
    }

    /// Complete a login from the redirect URL or its raw query string.
    ///
    /// The pending request is consumed even when `input` cannot be parsed.
    pub async fn handle_callback(&self, input: &str) -> Result<Session, AuthError> {
        self.complete_login(CallbackParams::parse(input)).await
    }

    pub async fn handle_callback_params(&self, params: CallbackParams) -> Result<Session, AuthError> {
        self.complete_login(Ok(params)).await
    }

    async fn complete_login(
        &self,
        params: Result<CallbackParams, AuthError>,
    ) -> Result<Session, AuthError> {
        let _guard = self.inner.try_guard()?;
        let inner = &self.inner;
        let config = inner.protocol.config();
        let epoch = inner.epoch.load(Ordering::SeqCst);

        let request = inner.store.take_request()?.ok_or(AuthError::NoPendingRequest)?;
        if request.is_expired(config.request_state_ttl) {
            warn!("login request expired before its callback arrived");
            return Err(AuthError::NoPendingRequest);
        }
        let params = params?;

        let tokens = inner.protocol.exchange_code(&params, &request).await?;
        let mut session = Session::from_token_set(tokens)?;
        if config.load_user_info {
            let claims = inner
                .protocol
                .fetch_user_info(&session.access_token, &session.subject)
                .await?;
            session.merge_user_info(claims);
        }

        let session = inner.commit(session, epoch, true)?;
        info!(subject = %session.subject, expires_at = %session.expires_at, "signed in");
        Ok(session)
    }

    /// Sign out locally and return the provider's end-session URL, if any.
    ///
    /// Safe to call repeatedly; `Unloaded` is only emitted when a session existed.
    pub async fn logout(&self) -> Result<Option<Url>, AuthError> {
        let inner = &self.inner;
        let config = inner.protocol.config();
        let previous = inner.sign_out_locally()?;

        if let (Some(session), true) = (&previous, config.revoke_on_logout) {
            inner.revoke(session).await;
        }

        let discovery = match inner.protocol.fetch_discovery_document().await {
            Ok(discovery) => discovery,
            Err(err) => {
                warn!(error = %err, "end-session endpoint unavailable");
                return Ok(None);
            }
        };
        let hint = previous.as_ref().map(|session| session.id_token.as_str());
        Ok(inner.protocol.end_session_url(&discovery, hint, None))
    }

    /// Forget the session locally without contacting the provider.
    pub fn remove_user(&self) -> Result<(), AuthError> {
        self.inner.sign_out_locally().map(|_| ())
    }

    pub fn get_user(&self) -> Option<Session> {
        self.inner.read_session().clone()
    }

    /// Renew the current session immediately.
    pub async fn renew_now(&self) -> Result<Session, AuthError> {
        let _guard = self.inner.try_guard()?;
        self.inner.renew(true).await
    }

    pub fn pending_request(&self) -> Result<Option<AuthRequestState>, AuthError> {
        self.inner.store.load_request()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn renewal_state(&self) -> RenewState {
        self.inner.scheduler.state()
    }

    pub fn watch_renewal(&self) -> watch::Receiver<RenewState> {
        self.inner.scheduler.watch()
    }

    fn spawn_listener(&self) {
        let Some(coordinator) = &self.inner.coordinator else {
            return;
        };
        let mut slot = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }

        let mut receiver = coordinator.subscribe();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            while let Some(incoming) = receiver.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = inner.apply_remote(incoming) {
                    warn!(error = %err, "failed to apply session change from another context");
                }
            }
        }));
    }
}

impl Inner {
    fn try_guard(&self) -> Result<AsyncMutexGuard<'_, ()>, AuthError> {
        self.op_guard
            .try_lock()
            .map_err(|_| AuthError::OperationInProgress)
    }

    fn read_session(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_session(&self) -> RwLockWriteGuard<'_, Option<Session>> {
        self.session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn can_renew(&self, session: &Session) -> bool {
        self.renewal
            .as_ref()
            .is_some_and(|renewal| renewal.can_renew(session))
    }

    /// Arm the scheduler for a session expiring at `expires_at`.
    fn arm(self: &Arc<Self>, expires_at: chrono::DateTime<Utc>) {
        let renew = self.renewal.as_ref().map(|_| {
            let weak = Arc::downgrade(self);
            Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    let inner = weak.upgrade().ok_or(AuthError::Cancelled)?;
                    let _guard = inner.op_guard.lock().await;
                    let session = inner.renew(false).await?;
                    Ok::<_, AuthError>(session.expires_at)
                }) as RenewFuture
            }) as RenewFn
        });
        self.scheduler.arm(expires_at, renew);
    }

    async fn renew(self: &Arc<Self>, rearm: bool) -> Result<Session, AuthError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let renewal = self.renewal.clone().ok_or(AuthError::RenewalUnavailable)?;
        let current = self
            .read_session()
            .clone()
            .ok_or(AuthError::RenewalUnavailable)?;

        debug!(subject = %current.subject, "renewing session");
        let tokens = renewal.renew(&current).await?;
        let mut next = current.renewed(tokens)?;
        if self.protocol.config().load_user_info {
            let claims = self
                .protocol
                .fetch_user_info(&next.access_token, &next.subject)
                .await?;
            next.merge_user_info(claims);
        }
        self.commit(next, epoch, rearm)
    }

    /// Persist and publish `session` unless a sign-out happened since `epoch`.
    fn commit(self: &Arc<Self>, session: Session, epoch: u64, rearm: bool) -> Result<Session, AuthError> {
        {
            let mut slot = self.write_session();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                debug!("discarding result of an operation cancelled by sign-out");
                return Err(AuthError::Cancelled);
            }
            self.store.save_session(&session)?;
            *slot = Some(session.clone());
        }

        if rearm {
            self.arm(session.expires_at);
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.publish(SessionChange::SignedIn(session.clone()));
        }
        self.events.emit(SessionEvent::Loaded(session.clone()));
        Ok(session)
    }

    /// Clear memory, storage and timers; returns the session that was signed in.
    fn sign_out_locally(&self) -> Result<Option<Session>, AuthError> {
        let previous = {
            let mut slot = self.write_session();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.scheduler.cancel();
            let in_memory = slot.take();
            let removed = self.store.remove_session();
            let pending = self.store.take_request();
            let stored = removed?;
            pending?;
            in_memory.or(stored)
        };

        if let Some(session) = &previous {
            info!(subject = %session.subject, "signed out");
            if let Some(coordinator) = &self.coordinator {
                coordinator.publish(SessionChange::SignedOut { at: Utc::now() });
            }
            self.events.emit(SessionEvent::Unloaded);
        }
        Ok(previous)
    }

    async fn revoke(&self, session: &Session) {
        if let Some(refresh_token) = &session.refresh_token {
            if let Err(err) = self.protocol.revoke(refresh_token, "refresh_token").await {
                warn!(error = %err, "refresh token revocation failed");
            }
        }
        if let Err(err) = self
            .protocol
            .revoke(&session.access_token, "access_token")
            .await
        {
            warn!(error = %err, "access token revocation failed");
        }
    }

    fn apply_remote(self: &Arc<Self>, incoming: Incoming) -> Result<(), AuthError> {
        match incoming {
            Incoming::Change(change) => {
                let decision = {
                    let slot = self.read_session();
                    CrossContextCoordinator::reconcile(slot.as_ref(), &change)
                };
                match decision {
                    Reconciliation::Adopt(session) => self.adopt(Some(session)),
                    Reconciliation::Clear => self.adopt(None),
                    Reconciliation::Ignore => debug!("ignoring stale session change"),
                }
            }
            Incoming::Lagged(_) => {
                let stored = self.store.load_session()?;
                if *self.read_session() != stored {
                    self.adopt(stored);
                }
            }
        }
        Ok(())
    }

    /// Take over a session written by another context (which already persisted it).
    fn adopt(self: &Arc<Self>, session: Option<Session>) {
        match session {
            Some(session) => {
                *self.write_session() = Some(session.clone());
                debug!(subject = %session.subject, "adopted session from another context");
                self.arm(session.expires_at);
                self.events.emit(SessionEvent::Loaded(session));
            }
            None => {
                let previous = {
                    let mut slot = self.write_session();
                    self.epoch.fetch_add(1, Ordering::SeqCst);
                    self.scheduler.cancel();
                    slot.take()
                };
                if previous.is_some() {
                    debug!("signed out by another context");
                    self.events.emit(SessionEvent::Unloaded);
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let listener = self
            .listener
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = listener.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::coordinator::SessionChannel;
    use crate::auth::test_support::{
        memory_store, query_param, sample_session, MockProvider, REDIRECT_URI,
    };
    use crate::auth::{MemoryBackend, StoreBackend};
    use crate::config::RpConfig;
    use chrono::Duration;
    use httpmock::prelude::*;
    use std::time::Duration as StdDuration;
    use tokio::sync::mpsc;

    fn manager_for(config: RpConfig) -> SessionManager {
        let store = memory_store(&config);
        SessionManager::new(ProtocolClient::new(config).unwrap(), store)
    }

    fn event_names(manager: &SessionManager) -> mpsc::UnboundedReceiver<&'static str> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.subscribe(move |event| {
            let _ = tx.send(event.name());
        });
        rx
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<&'static str>) -> &'static str {
        tokio::time::timeout(StdDuration::from_secs(5), rx.recv())
            .await
            .expect("event not delivered in time")
            .expect("event channel closed")
    }

    async fn sign_in(provider: &MockProvider, manager: &SessionManager) -> Session {
        let url = manager.login().await.unwrap();
        let nonce = query_param(&url, "nonce");
        let state = query_param(&url, "state");
        let token = provider
            .mock_token(
                "authorization_code",
                provider.token_response(Some(&nonce), "access-1", Some("refresh-1"), 3600),
            )
            .await;
        let session = manager
            .handle_callback(&format!("{REDIRECT_URI}?code=abc&state={state}"))
            .await
            .unwrap();
        token.delete_async().await;
        session
    }

    #[tokio::test]
    async fn login_and_callback_create_session() {
        let provider = MockProvider::start().await;
        let manager = manager_for(provider.config());
        let mut events = event_names(&manager);

        let url = manager.login().await.unwrap();
        assert!(url.as_str().starts_with(&format!("{}/authorize", provider.issuer())));
        assert_eq!(query_param(&url, "code_challenge_method"), "S256");
        assert!(query_param(&url, "state").len() >= 22);
        assert!(manager.pending_request().unwrap().is_some());

        let nonce = query_param(&url, "nonce");
        let state = query_param(&url, "state");
        provider
            .mock_token(
                "authorization_code",
                provider.token_response(Some(&nonce), "access-1", Some("refresh-1"), 3600),
            )
            .await;
        let session = manager
            .handle_callback(&format!("code=abc&state={state}"))
            .await
            .unwrap();

        assert_eq!(session.subject, "user-1");
        assert!(session.expires_at > session.acquired_at);
        assert!(session.expires_at > Utc::now());
        assert_eq!(manager.get_user(), Some(session.clone()));
        assert!(manager.pending_request().unwrap().is_none());
        assert!(matches!(manager.renewal_state(), RenewState::Scheduled { .. }));
        assert_eq!(next_event(&mut events).await, "loaded");
    }

    #[tokio::test]
    async fn concurrent_logins_fail_fast() {
        let provider = MockProvider::start().await;
        let manager = manager_for(provider.config());
        let (first, second) = tokio::join!(manager.login(), manager.login());
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|result| matches!(result, Err(AuthError::OperationInProgress))));
    }

    #[tokio::test]
    async fn pending_login_blocks_another_until_expired() {
        let provider = MockProvider::start().await;
        let manager = manager_for(provider.config());
        manager.login().await.unwrap();
        assert!(matches!(
            manager.login().await,
            Err(AuthError::OperationInProgress)
        ));

        let short = manager_for(
            provider
                .config()
                .with_request_state_ttl(Duration::milliseconds(20)),
        );
        let first = short.login().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let second = short.login().await.unwrap();
        assert_ne!(query_param(&first, "state"), query_param(&second, "state"));
    }

    #[tokio::test]
    async fn cancel_login_unblocks_next_login() {
        let provider = MockProvider::start().await;
        let manager = manager_for(provider.config());
        manager.login().await.unwrap();
        assert!(manager.cancel_login().unwrap());
        assert!(!manager.cancel_login().unwrap());
        manager.login().await.unwrap();
    }

    #[tokio::test]
    async fn state_mismatch_consumes_pending_request() {
        let provider = MockProvider::start().await;
        let manager = manager_for(provider.config());
        manager.login().await.unwrap();

        let err = manager
            .handle_callback(&format!("{REDIRECT_URI}?code=abc&state=forged"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::StateMismatch));
        assert!(manager.get_user().is_none());

        let err = manager
            .handle_callback(&format!("{REDIRECT_URI}?code=abc&state=forged"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NoPendingRequest));
    }

    #[tokio::test]
    async fn malformed_callback_clears_pending_login() {
        let provider = MockProvider::start().await;
        let manager = manager_for(provider.config());
        manager.login().await.unwrap();

        for input in ["raw-code", ""] {
            let err = manager.handle_callback(input).await.unwrap_err();
            assert!(
                matches!(err, AuthError::InvalidAuthorizationResponse(_) | AuthError::NoPendingRequest),
                "unexpected error {err:?}"
            );
            assert!(manager.pending_request().unwrap().is_none());
        }
        assert!(manager.get_user().is_none());
        manager.login().await.expect("a new login can start");
    }

    #[tokio::test]
    async fn callback_without_login_is_rejected() {
        let provider = MockProvider::start().await;
        let manager = manager_for(provider.config());
        let err = manager.handle_callback("code=abc&state=xyz").await.unwrap_err();
        assert!(matches!(err, AuthError::NoPendingRequest));
    }

    #[tokio::test]
    async fn provider_error_callback_is_surfaced() {
        let provider = MockProvider::start().await;
        let manager = manager_for(provider.config());
        let url = manager.login().await.unwrap();
        let state = query_param(&url, "state");
        let err = manager
            .handle_callback(&format!(
                "{REDIRECT_URI}?error=access_denied&error_description=nope&state={state}"
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Provider { ref error, .. } if error == "access_denied"));
        assert!(manager.pending_request().unwrap().is_none());
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let provider = MockProvider::start().await;
        let config = provider.config();
        let store = memory_store(&config);
        let manager = SessionManager::new(ProtocolClient::new(config).unwrap(), store.clone());
        let session = sign_in(&provider, &manager).await;
        let mut events = event_names(&manager);

        let url = manager.logout().await.unwrap().unwrap();
        assert!(url.as_str().starts_with(&format!("{}/logout", provider.issuer())));
        assert_eq!(query_param(&url, "id_token_hint"), session.id_token);
        assert_eq!(next_event(&mut events).await, "unloaded");

        manager.logout().await.unwrap();
        assert!(manager.get_user().is_none());
        assert!(store.load_session().unwrap().is_none());
        assert!(store.load_request().unwrap().is_none());
        assert_eq!(manager.renewal_state(), RenewState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn logout_revokes_tokens_when_configured() {
        let provider = MockProvider::start().await;
        let revoke = provider
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/revoke");
                then.status(200);
            })
            .await;
        let manager = manager_for(provider.config().with_revoke_on_logout(true));
        sign_in(&provider, &manager).await;
        manager.logout().await.unwrap();
        assert_eq!(revoke.hits_async().await, 2);
    }

    #[tokio::test]
    async fn logout_cancels_inflight_callback() {
        let provider = MockProvider::start().await;
        let manager = manager_for(provider.config());
        let url = manager.login().await.unwrap();
        let nonce = query_param(&url, "nonce");
        let state = query_param(&url, "state");
        let body = provider.token_response(Some(&nonce), "access-1", None, 3600);
        provider
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200)
                    .delay(StdDuration::from_millis(300))
                    .json_body(body);
            })
            .await;

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .handle_callback(&format!("{REDIRECT_URI}?code=abc&state={state}"))
                    .await
            })
        };
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        manager.logout().await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
        assert!(manager.get_user().is_none());
    }

    #[tokio::test]
    async fn renew_now_replaces_tokens() {
        let provider = MockProvider::start().await;
        let manager = manager_for(provider.config());
        let before = sign_in(&provider, &manager).await;
        provider
            .mock_token(
                "refresh_token",
                provider.token_response(None, "access-2", None, 7200),
            )
            .await;

        let after = manager.renew_now().await.unwrap();
        assert_eq!(after.access_token, "access-2");
        assert_eq!(after.refresh_token, before.refresh_token);
        assert_eq!(after.subject, before.subject);
        assert_eq!(manager.get_user(), Some(after));
    }

    #[tokio::test]
    async fn failed_renewal_leaves_session_unchanged() {
        let provider = MockProvider::start().await;
        let manager = manager_for(provider.config());
        let before = sign_in(&provider, &manager).await;
        provider
            .server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_contains("grant_type=refresh_token");
                then.status(400)
                    .json_body(serde_json::json!({ "error": "invalid_grant" }));
            })
            .await;

        let err = manager.renew_now().await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant));
        assert_eq!(manager.get_user(), Some(before));
    }

    #[tokio::test]
    async fn scheduled_renewal_commits_new_session() {
        let provider = MockProvider::start().await;
        let manager = manager_for(
            provider
                .config()
                .with_renewal_lead(Duration::seconds(3599)),
        );
        sign_in(&provider, &manager).await;
        let mut events = event_names(&manager);
        provider
            .mock_token(
                "refresh_token",
                provider.token_response(None, "access-2", None, 7200),
            )
            .await;

        assert_eq!(next_event(&mut events).await, "expiring");
        assert_eq!(next_event(&mut events).await, "renewing");
        assert_eq!(next_event(&mut events).await, "loaded");
        assert_eq!(manager.get_user().unwrap().access_token, "access-2");
    }

    #[tokio::test]
    async fn scheduled_renewal_failure_reports_error() {
        let provider = MockProvider::start().await;
        let manager = manager_for(
            provider
                .config()
                .with_renewal_lead(Duration::seconds(3599)),
        );
        let before = sign_in(&provider, &manager).await;
        let mut events = event_names(&manager);
        provider
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(400)
                    .json_body(serde_json::json!({ "error": "invalid_grant" }));
            })
            .await;

        assert_eq!(next_event(&mut events).await, "expiring");
        assert_eq!(next_event(&mut events).await, "renewing");
        assert_eq!(next_event(&mut events).await, "renew_error");
        assert_eq!(manager.renewal_state(), RenewState::Failed);
        assert_eq!(manager.get_user(), Some(before));
    }

    #[tokio::test]
    async fn initialize_restores_and_discards() {
        let provider = MockProvider::start().await;
        let config = provider.config();
        let store = memory_store(&config);
        let protocol = ProtocolClient::new(config).unwrap();

        let saved = sample_session();
        store.save_session(&saved).unwrap();
        let manager = SessionManager::new(protocol.clone(), store.clone());
        assert_eq!(manager.initialize().await.unwrap(), Some(saved.clone()));
        assert_eq!(manager.get_user(), Some(saved));
        assert!(matches!(manager.renewal_state(), RenewState::Scheduled { .. }));

        let mut expired = sample_session();
        expired.refresh_token = None;
        expired.expires_at = Utc::now() - Duration::minutes(1);
        store.save_session(&expired).unwrap();
        let manager = SessionManager::new(protocol, store.clone());
        assert!(manager.initialize().await.unwrap().is_none());
        assert!(store.load_session().unwrap().is_none());
    }

    #[tokio::test]
    async fn peer_contexts_follow_sign_in_and_sign_out() {
        let provider = MockProvider::start().await;
        let config = provider.config();
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let channel = SessionChannel::new();
        let context = |config: &RpConfig| {
            let store = TokenStore::new(backend.clone(), memory_store(config).scope().clone());
            SessionManager::builder(ProtocolClient::new(config.clone()).unwrap(), store.clone())
                .coordinator(channel.coordinator(store.scope().clone()))
                .build()
        };
        let first = context(&config);
        let second = context(&config);
        first.initialize().await.unwrap();
        second.initialize().await.unwrap();
        let mut peer_events = event_names(&second);

        let session = sign_in(&provider, &first).await;
        assert_eq!(next_event(&mut peer_events).await, "loaded");
        assert_eq!(second.get_user(), Some(session));

        first.logout().await.unwrap();
        assert_eq!(next_event(&mut peer_events).await, "unloaded");
        assert!(second.get_user().is_none());
    }

    #[tokio::test]
    async fn unsubscribed_listener_stops_receiving() {
        let provider = MockProvider::start().await;
        let manager = manager_for(provider.config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = manager.subscribe(move |event| {
            let _ = tx.send(event.name());
        });
        assert!(manager.unsubscribe(id));
        sign_in(&provider, &manager).await;
        assert!(rx.try_recv().is_err());
    }
}
