//! Session bootstrap, login and logout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::config::SessionConfig;
use crate::error::Error;
use crate::notify::{Notice, Notifier, TracingNotifier};
use crate::state::{AuthAction, AuthState, reduce};
use crate::storage::{Storage, UserCache};
use crate::token::TokenStore;
use crate::traits::{AuthBackend, ProfileBackend};
use crate::types::{AuthToken, Credentials, PasswordChange, ProfileUpdate, UserSummary};

/// Result of [`AuthService::login`]. Login never returns an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Success,
    Failure { error: String },
    /// A logout, newer login or [`detach`](AuthService::detach) happened
    /// while the request was in flight. Nothing was stored.
    Cancelled,
}

impl LoginOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::Failure { error } => Some(error),
            Self::Cancelled => Some("Sign-in was cancelled"),
        }
    }
}

/// Owner of the client session.
///
/// State changes go through [`reduce`] and are published on a `watch`
/// channel; [`subscribe`](Self::subscribe) to follow them. Every bootstrap,
/// login and logout starts a new epoch. A request that finishes after its
/// epoch has passed drops its result: the token, the cached user and the
/// published state are left to the newer operation.
pub struct AuthService<B> {
    backend: Arc<B>,
    tokens: Arc<dyn TokenStore>,
    cache: UserCache,
    notifier: Arc<dyn Notifier>,
    config: SessionConfig,
    state: watch::Sender<AuthState>,
    epoch: Mutex<u64>,
    detached: AtomicBool,
}

impl<B: AuthBackend> AuthService<B> {
    #[must_use]
    pub fn new(backend: Arc<B>, tokens: Arc<dyn TokenStore>, cache: UserCache) -> Self {
        Self {
            backend,
            tokens,
            cache,
            notifier: Arc::new(TracingNotifier),
            config: SessionConfig::default(),
            state: watch::Sender::new(AuthState::default()),
            epoch: Mutex::new(0),
            detached: AtomicBool::new(false),
        }
    }

    /// Build the cookie token store and user cache described by `config`.
    #[must_use]
    pub fn from_config(backend: Arc<B>, config: SessionConfig, storage: Arc<dyn Storage>) -> Self {
        let tokens = Arc::new(config.token_store());
        let cache = UserCache::with_key(storage, config.user_key.clone());
        Self::new(backend, tokens, cache).with_config(config)
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn token_store(&self) -> Arc<dyn TokenStore> {
        self.tokens.clone()
    }

    /// Snapshot of the current session.
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Whether a token is held in the session and still present in the store.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated() && self.tokens.get_token().is_some()
    }

    /// Whether the signed-in user's embedded permission list names `codename`.
    ///
    /// Prefer [`PermissionService`](crate::permissions::PermissionService),
    /// which holds the authoritative set.
    #[must_use]
    pub fn has_permission(&self, codename: &str) -> bool {
        self.state
            .borrow()
            .user
            .as_ref()
            .is_some_and(|u| u.has_embedded_permission(codename))
    }

    /// Restore the session from a stored token.
    ///
    /// Does nothing when the token store is not available. Never fails: every
    /// path ends in an initialized state.
    pub async fn initialize(&self) {
        if !self.tokens.is_available() {
            tracing::debug!("Token store unavailable, skipping session bootstrap");
            return;
        }

        let epoch = self.next_epoch();

        let Some(token) = self.tokens.get_token() else {
            tracing::debug!("No stored token");
            self.commit(epoch, || self.dispatch(AuthAction::Ready));
            return;
        };

        if self.commit(epoch, || self.dispatch(AuthAction::Init)).is_none() {
            return;
        }
        let validated = self.backend.validate_token(&token).await;

        let applied = self.commit(epoch, || {
            let action = self.settle(token, validated).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Session bootstrap failed");
                self.clear_persisted();
                AuthAction::Ready
            });
            self.dispatch(action);
        });
        if applied.is_none() {
            tracing::debug!("Discarding superseded session bootstrap");
        }
    }

    fn settle(
        &self,
        token: AuthToken,
        validated: Result<UserSummary, Error>,
    ) -> Result<AuthAction, Error> {
        let error = match validated {
            Ok(user) => {
                self.cache.store(&user)?;
                tracing::info!(user_id = %user.id, "Session restored");
                return Ok(AuthAction::LoginSuccess { token, user });
            }
            Err(e) => e,
        };

        if !self.config.stale_cache_policy.allows(&error) {
            tracing::info!(error = %error, "Stored token rejected");
            self.clear_persisted();
            return Ok(AuthAction::Ready);
        }

        match self.cache.load()? {
            Some(user) => {
                tracing::warn!(
                    error = %error,
                    user_id = %user.id,
                    "Token validation failed, continuing with cached user"
                );
                Ok(AuthAction::LoginSuccess { token, user })
            }
            None => {
                tracing::info!(error = %error, "Token validation failed and no cached user");
                self.clear_persisted();
                Ok(AuthAction::Ready)
            }
        }
    }

    /// Sign in. Failures are reported in the outcome and as a notice.
    ///
    /// If the session changes while the request is in flight, the response
    /// is dropped and [`LoginOutcome::Cancelled`] returned.
    pub async fn login(&self, credentials: &Credentials) -> LoginOutcome {
        let epoch = self.start(AuthAction::LoginRequest);

        let result = self.backend.login(credentials).await;
        let outcome = match result {
            Ok(response) => {
                let user_id = response.user.id;
                let welcome = format!("Welcome, {}", response.user.display_name());
                self.commit(epoch, move || {
                    let expires = response
                        .expires
                        .unwrap_or_else(|| OffsetDateTime::now_utc() + self.config.token_ttl);
                    self.tokens.set_token(&response.token, expires);
                    if let Err(e) = self.cache.store(&response.user) {
                        tracing::warn!(error = %e, "Failed to cache user");
                    }
                    self.dispatch(AuthAction::LoginSuccess {
                        token: response.token,
                        user: response.user,
                    });
                })
                .map(|()| {
                    tracing::info!(user_id = %user_id, "Login successful");
                    self.notifier.notify(Notice::success(welcome));
                    LoginOutcome::Success
                })
            }
            Err(e) => {
                let error = e.user_message();
                self.commit(epoch, || {
                    self.dispatch(AuthAction::LoginFailure {
                        error: error.clone(),
                    });
                })
                .map(|()| {
                    tracing::warn!(error = %e, username = %credentials.username, "Login failed");
                    self.notifier.notify(Notice::error(error.clone()));
                    LoginOutcome::Failure { error }
                })
            }
        };

        outcome.unwrap_or_else(|| {
            tracing::info!(username = %credentials.username, "Discarding superseded login response");
            LoginOutcome::Cancelled
        })
    }

    /// Tear down the session locally. No backend call is made.
    pub fn logout(&self) {
        self.end_session();
        tracing::info!("Logged out");
        self.notifier
            .notify(Notice::info("You have been signed out"));
    }

    /// End the session if its token disappeared from the store.
    ///
    /// Returns whether a logout was dispatched.
    pub fn reconcile(&self) -> bool {
        if !self.state.borrow().is_authenticated() || self.tokens.get_token().is_some() {
            return false;
        }
        tracing::info!("Token removed outside the session, signing out");
        self.end_session();
        true
    }

    /// Stop applying state changes. In-flight operations finish without
    /// storing anything or publishing state.
    pub fn detach(&self) {
        let _epoch = self.epoch.lock();
        self.detached.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn dispatch(&self, action: AuthAction) {
        if self.is_detached() {
            tracing::debug!(?action, "Dropping action for detached session");
            return;
        }
        self.state
            .send_modify(|state| *state = reduce(std::mem::take(state), action));
    }

    fn next_epoch(&self) -> u64 {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        *epoch
    }

    fn start(&self, action: AuthAction) -> u64 {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.dispatch(action);
        *epoch
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Run `apply` while no newer operation can start, if `epoch` is still
    /// current and the service is attached.
    fn commit<T>(&self, epoch: u64, apply: impl FnOnce() -> T) -> Option<T> {
        let current = self.epoch.lock();
        if self.is_detached() || *current != epoch {
            return None;
        }
        let applied = apply();
        drop(current);
        Some(applied)
    }

    fn end_session(&self) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.clear_persisted();
        self.dispatch(AuthAction::Logout);
    }

    fn clear_persisted(&self) {
        self.tokens.remove_token();
        if let Err(e) = self.cache.clear() {
            tracing::warn!(error = %e, "Failed to clear cached user");
        }
    }

    fn current_token(&self) -> Result<AuthToken, Error> {
        self.state
            .borrow()
            .token
            .clone()
            .ok_or(Error::Unauthenticated)
    }

    /// Returns whether the session was still the one the request started in.
    fn apply_profile(&self, epoch: u64, user: &UserSummary) -> bool {
        let applied = self.commit(epoch, || {
            if let Err(e) = self.cache.store(user) {
                tracing::warn!(error = %e, "Failed to cache user");
            }
            self.dispatch(AuthAction::UserUpdated(user.clone()));
        });
        if applied.is_none() {
            tracing::debug!(user_id = %user.id, "Session changed during profile request");
        }
        applied.is_some()
    }
}

impl<B: AuthBackend + ProfileBackend> AuthService<B> {
    /// Re-fetch the signed-in user's profile.
    ///
    /// The session is left untouched if it changed while the request was in
    /// flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthenticated`] without a session, or the backend error.
    pub async fn refresh_profile(&self) -> Result<UserSummary, Error> {
        let epoch = self.current_epoch();
        let token = self.current_token()?;
        let user = self.backend.me(&token).await?;
        self.apply_profile(epoch, &user);
        Ok(user)
    }

    /// # Errors
    ///
    /// Returns [`Error::Unauthenticated`] without a session, or the backend error.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserSummary, Error> {
        let epoch = self.current_epoch();
        let token = self.current_token()?;
        let user = self.backend.update_me(&token, update).await?;
        tracing::info!(user_id = %user.id, "Profile updated");
        if self.apply_profile(epoch, &user) {
            self.notifier.notify(Notice::success("Profile updated"));
        }
        Ok(user)
    }

    /// # Errors
    ///
    /// Returns [`Error::Unauthenticated`] without a session, or the backend error.
    pub async fn change_password(&self, change: &PasswordChange) -> Result<(), Error> {
        let token = self.current_token()?;
        self.backend.change_password(&token, change).await?;
        tracing::info!("Password changed");
        self.notifier.notify(Notice::success("Password changed"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::Duration;

    use super::*;
    use crate::config::StaleCachePolicy;
    use crate::notify::NoticeLevel;
    use crate::state::AuthPhase;
    use crate::storage::MemoryStorage;
    use crate::testing::{CollectingNotifier, FakeBackend, ReadOnlyStorage, Reply};
    use crate::token::CookieTokenStore;
    use crate::types::{LoginResponse, UserId};

    struct Harness {
        backend: Arc<FakeBackend>,
        tokens: Arc<CookieTokenStore>,
        storage: Arc<MemoryStorage>,
        notifier: Arc<CollectingNotifier>,
        service: AuthService<FakeBackend>,
    }

    fn harness(backend: FakeBackend) -> Harness {
        harness_with(backend, SessionConfig::default())
    }

    fn harness_with(backend: FakeBackend, config: SessionConfig) -> Harness {
        let backend = Arc::new(backend);
        let tokens = Arc::new(CookieTokenStore::new());
        let storage = Arc::new(MemoryStorage::new());
        let notifier = Arc::new(CollectingNotifier::default());
        let service = AuthService::new(
            backend.clone(),
            tokens.clone(),
            UserCache::new(storage.clone()),
        )
        .with_notifier(notifier.clone())
        .with_config(config);
        Harness {
            backend,
            tokens,
            storage,
            notifier,
            service,
        }
    }

    fn alice() -> UserSummary {
        UserSummary::new(1, "alice")
    }

    fn store_token(h: &Harness, token: &str) {
        h.tokens.set_token(
            &AuthToken::new(token),
            OffsetDateTime::now_utc() + Duration::hours(1),
        );
    }

    fn cache(h: &Harness) -> UserCache {
        UserCache::new(h.storage.clone())
    }

    #[tokio::test]
    async fn no_token_initializes_without_network() {
        let h = harness(FakeBackend::new());
        h.service.initialize().await;

        let state = h.service.state();
        assert!(!state.is_authenticated());
        assert!(state.is_initialized);
        assert_eq!(state.user, None);
        assert_eq!(FakeBackend::calls(&h.backend.validate_calls), 0);
    }

    #[tokio::test]
    async fn valid_token_restores_session() {
        let h = harness(FakeBackend::new().with_validate(Reply::Ok(alice())));
        store_token(&h, "tok");

        h.service.initialize().await;

        let state = h.service.state();
        assert_eq!(state.phase(), AuthPhase::Authenticated);
        assert_eq!(state.user.as_ref().map(|u| u.username.as_str()), Some("alice"));
        assert!(h.service.is_authenticated());
        assert_eq!(cache(&h).load().unwrap(), Some(alice()));
    }

    #[tokio::test]
    async fn transient_failure_falls_back_to_cached_user() {
        let h = harness(FakeBackend::new().with_validate(Reply::Status(503)));
        store_token(&h, "tok");
        let cached = alice().with_email("alice@shop.test");
        cache(&h).store(&cached).unwrap();

        h.service.initialize().await;

        let state = h.service.state();
        assert!(state.is_authenticated());
        assert!(state.is_initialized);
        assert_eq!(state.user, Some(cached));
        assert_eq!(h.tokens.get_token(), Some(AuthToken::new("tok")));
    }

    #[tokio::test]
    async fn rejected_token_ignores_cache_by_default() {
        let h = harness(FakeBackend::new().with_validate(Reply::Status(401)));
        store_token(&h, "revoked");
        cache(&h).store(&alice()).unwrap();

        h.service.initialize().await;

        let state = h.service.state();
        assert_eq!(state.phase(), AuthPhase::Unauthenticated);
        assert_eq!(h.tokens.get_token(), None);
        assert_eq!(cache(&h).load().unwrap(), None);
    }

    #[tokio::test]
    async fn any_error_policy_trusts_cache_on_rejection() {
        let config = SessionConfig::default().with_stale_cache_policy(StaleCachePolicy::AnyError);
        let h = harness_with(FakeBackend::new().with_validate(Reply::Status(401)), config);
        store_token(&h, "tok");
        cache(&h).store(&alice()).unwrap();

        h.service.initialize().await;

        assert_eq!(h.service.state().user_id(), Some(UserId(1)));
    }

    #[tokio::test]
    async fn never_policy_ignores_cache_on_outage() {
        let config = SessionConfig::default().with_stale_cache_policy(StaleCachePolicy::Never);
        let h = harness_with(FakeBackend::new().with_validate(Reply::Status(503)), config);
        store_token(&h, "tok");
        cache(&h).store(&alice()).unwrap();

        h.service.initialize().await;

        assert!(!h.service.state().is_authenticated());
        assert_eq!(h.tokens.get_token(), None);
    }

    #[tokio::test]
    async fn failure_without_cache_clears_token() {
        let h = harness(FakeBackend::new().with_validate(Reply::Status(502)));
        store_token(&h, "tok");

        h.service.initialize().await;

        let state = h.service.state();
        assert_eq!(state.phase(), AuthPhase::Unauthenticated);
        assert_eq!(h.tokens.get_token(), None);
    }

    #[tokio::test]
    async fn corrupt_cache_during_fallback_ends_session() {
        let h = harness(FakeBackend::new().with_validate(Reply::Status(503)));
        store_token(&h, "tok");
        h.storage.set_item("userData", "{broken").unwrap();

        h.service.initialize().await;

        assert_eq!(h.service.state().phase(), AuthPhase::Unauthenticated);
        assert_eq!(h.tokens.get_token(), None);
        assert_eq!(h.storage.get_item("userData").unwrap(), None);
    }

    #[tokio::test]
    async fn cache_write_failure_during_bootstrap_ends_session() {
        let backend = Arc::new(FakeBackend::new().with_validate(Reply::Ok(alice())));
        let tokens = Arc::new(CookieTokenStore::new());
        tokens.set_token(
            &AuthToken::new("tok"),
            OffsetDateTime::now_utc() + Duration::hours(1),
        );
        let service = AuthService::new(
            backend,
            tokens.clone(),
            UserCache::new(Arc::new(ReadOnlyStorage)),
        );

        service.initialize().await;

        assert_eq!(service.state().phase(), AuthPhase::Unauthenticated);
        assert_eq!(tokens.get_token(), None);
    }

    #[tokio::test]
    async fn unavailable_store_skips_bootstrap() {
        let backend = Arc::new(FakeBackend::new());
        let service = AuthService::new(
            backend.clone(),
            Arc::new(CookieTokenStore::detached()),
            UserCache::new(Arc::new(MemoryStorage::new())),
        );

        service.initialize().await;

        assert_eq!(service.state().phase(), AuthPhase::Uninitialized);
        assert_eq!(FakeBackend::calls(&backend.validate_calls), 0);
    }

    #[tokio::test]
    async fn login_success_persists_session() {
        let expires = OffsetDateTime::now_utc() + Duration::days(2);
        let response = LoginResponse::new("fresh", alice().with_full_name("Alice Moyo"))
            .with_expires(expires);
        let h = harness(FakeBackend::new().with_login(Reply::Ok(response)));

        let outcome = h.service.login(&Credentials::new("alice", "pw")).await;

        assert!(outcome.is_success());
        assert_eq!(h.tokens.get_token(), Some(AuthToken::new("fresh")));
        assert_eq!(
            cache(&h).load().unwrap().map(|u| u.id),
            Some(UserId(1))
        );
        let state = h.service.state();
        assert_eq!(state.phase(), AuthPhase::Authenticated);
        assert!(!state.is_loading);

        let notices = h.notifier.notices.lock();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Success);
        assert!(notices[0].message.contains("Alice Moyo"));
    }

    #[tokio::test]
    async fn login_without_expiry_uses_configured_ttl() {
        let h = harness(FakeBackend::new().with_login(Reply::Ok(LoginResponse::new("t", alice()))));
        h.service.login(&Credentials::new("alice", "pw")).await;

        let header = h.tokens.set_cookie_header().unwrap();
        assert!(header.contains("Expires="));
        assert_eq!(h.tokens.get_token(), Some(AuthToken::new("t")));
    }

    #[tokio::test]
    async fn login_failure_is_reported_not_raised() {
        let h = harness(FakeBackend::new().with_login(Reply::Status(400)));

        let outcome = h.service.login(&Credentials::new("alice", "wrong")).await;

        assert_eq!(outcome.error(), Some("Invalid username or password"));
        let state = h.service.state();
        assert_eq!(state.error.as_deref(), Some("Invalid username or password"));
        assert!(state.is_initialized);
        assert!(!state.is_authenticated());
        assert_eq!(h.tokens.get_token(), None);

        let notices = h.notifier.notices.lock();
        assert_eq!(notices[0].level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn logout_clears_everything() {
        let h = harness(FakeBackend::new().with_login(Reply::Ok(LoginResponse::new("t", alice()))));
        h.service.login(&Credentials::new("alice", "pw")).await;

        h.service.logout();

        assert_eq!(h.tokens.get_token(), None);
        assert_eq!(cache(&h).load().unwrap(), None);
        assert_eq!(h.service.state(), reduce(AuthState::default(), AuthAction::Ready));
        assert!(!h.service.is_authenticated());
        let notices = h.notifier.notices.lock();
        assert_eq!(notices.last().map(|n| n.level), Some(NoticeLevel::Info));
    }

    #[tokio::test]
    async fn has_permission_reads_embedded_list() {
        let user = alice().with_permissions(["can_view_sales"]);
        let h = harness(FakeBackend::new().with_login(Reply::Ok(LoginResponse::new("t", user))));

        assert!(!h.service.has_permission("can_view_sales"));
        h.service.login(&Credentials::new("alice", "pw")).await;

        assert!(h.service.has_permission("can_view_sales"));
        assert!(!h.service.has_permission("can_edit_sales"));
    }

    #[tokio::test]
    async fn externally_removed_token_is_not_authenticated() {
        let h = harness(FakeBackend::new().with_login(Reply::Ok(LoginResponse::new("t", alice()))));
        h.service.login(&Credentials::new("alice", "pw")).await;

        h.tokens.remove_token();

        assert!(!h.service.is_authenticated());
        assert!(h.service.reconcile());
        assert_eq!(h.service.state().phase(), AuthPhase::Unauthenticated);
        assert!(!h.service.reconcile());
    }

    #[tokio::test]
    async fn logout_during_bootstrap_wins() {
        let backend = FakeBackend::new().with_validate(Reply::Ok(alice()));
        let gate = backend.gated();
        let h = harness(backend);
        store_token(&h, "tok");
        let service = Arc::new(h.service);
        let mut rx = service.subscribe();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.initialize().await }
        });
        rx.wait_for(|s| s.is_loading).await.unwrap();

        service.logout();
        gate.notify_one();
        task.await.unwrap();

        let state = service.state();
        assert_eq!(state.phase(), AuthPhase::Unauthenticated);
        assert_eq!(h.tokens.get_token(), None);
    }

    #[tokio::test]
    async fn logout_during_login_discards_response() {
        let backend =
            FakeBackend::new().with_login(Reply::Ok(LoginResponse::new("late", alice())));
        let gate = backend.gated();
        let h = harness(backend);
        let service = Arc::new(h.service);
        let mut rx = service.subscribe();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.login(&Credentials::new("alice", "pw")).await }
        });
        rx.wait_for(|s| s.is_loading).await.unwrap();

        service.logout();
        gate.notify_one();

        assert_eq!(task.await.unwrap(), LoginOutcome::Cancelled);
        assert!(!service.is_authenticated());
        assert_eq!(service.state().phase(), AuthPhase::Unauthenticated);
        assert_eq!(h.tokens.get_token(), None);
        assert_eq!(UserCache::new(h.storage.clone()).load().unwrap(), None);
        let notices = h.notifier.notices.lock();
        assert!(notices.iter().all(|n| n.level != NoticeLevel::Success));
    }

    #[tokio::test]
    async fn detach_during_login_persists_nothing() {
        let backend =
            FakeBackend::new().with_login(Reply::Ok(LoginResponse::new("late", alice())));
        let gate = backend.gated();
        let h = harness(backend);
        let service = Arc::new(h.service);
        let mut rx = service.subscribe();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.login(&Credentials::new("alice", "pw")).await }
        });
        rx.wait_for(|s| s.is_loading).await.unwrap();

        service.detach();
        gate.notify_one();

        assert_eq!(task.await.unwrap(), LoginOutcome::Cancelled);
        assert_eq!(h.tokens.get_token(), None);
        assert_eq!(UserCache::new(h.storage.clone()).load().unwrap(), None);
        assert!(!service.state().is_authenticated());
        assert!(h.notifier.notices.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_logout_never_leaves_a_session_without_token() {
        for _ in 0..50 {
            let h = harness(FakeBackend::new().with_validate(Reply::Ok(alice())));
            store_token(&h, "tok");
            let tokens = h.tokens.clone();
            let service = Arc::new(h.service);

            let bootstrap = tokio::spawn({
                let service = service.clone();
                async move { service.initialize().await }
            });
            let logout = tokio::spawn({
                let service = service.clone();
                async move {
                    tokio::task::yield_now().await;
                    service.logout();
                }
            });
            bootstrap.await.unwrap();
            logout.await.unwrap();

            let state = service.state();
            assert!(state.is_initialized);
            assert!(!state.is_loading);
            assert_eq!(state.is_authenticated(), tokens.get_token().is_some());
        }
    }

    #[tokio::test]
    async fn detached_service_ignores_late_results() {
        let backend = FakeBackend::new().with_validate(Reply::Ok(alice()));
        let gate = backend.gated();
        let h = harness(backend);
        store_token(&h, "tok");
        let service = Arc::new(h.service);
        let mut rx = service.subscribe();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.initialize().await }
        });
        rx.wait_for(|s| s.is_loading).await.unwrap();

        service.detach();
        gate.notify_one();
        task.await.unwrap();

        let state = service.state();
        assert_eq!(state.phase(), AuthPhase::Initializing);
        assert_eq!(h.tokens.get_token(), Some(AuthToken::new("tok")));
    }

    #[tokio::test]
    async fn profile_refresh_updates_session_and_cache() {
        let renamed = alice().with_names("Alice", "Moyo");
        let h = harness(
            FakeBackend::new()
                .with_login(Reply::Ok(LoginResponse::new("t", alice())))
                .with_profile(Reply::Ok(renamed.clone())),
        );

        assert!(matches!(
            h.service.refresh_profile().await,
            Err(Error::Unauthenticated)
        ));

        h.service.login(&Credentials::new("alice", "pw")).await;
        let user = h.service.refresh_profile().await.unwrap();

        assert_eq!(user.display_name(), "Alice Moyo");
        assert_eq!(h.service.state().user, Some(renamed.clone()));
        assert_eq!(cache(&h).load().unwrap(), Some(renamed));
    }

    #[tokio::test]
    async fn change_password_requires_session() {
        let h = harness(FakeBackend::new().with_login(Reply::Ok(LoginResponse::new("t", alice()))));
        let change = PasswordChange {
            old_password: "a".into(),
            new_password: "b".into(),
        };

        assert!(h.service.change_password(&change).await.is_err());
        h.service.login(&Credentials::new("alice", "pw")).await;
        h.service.change_password(&change).await.unwrap();

        let notices = h.notifier.notices.lock();
        assert_eq!(notices.last().map(|n| n.message.as_str()), Some("Password changed"));
    }
}
