//! Session lifecycle: the sole mutator of credential state.
//!
//! ```text
//! Unknown -> Loading -> Authenticated(kind) -> Refreshing(kind) -> Authenticated(kind)
//!                    \                                         \
//!                     -> Unauthenticated                        -> Unauthenticated
//! ```
//!
//! Every install writes the server-authoritative cookies first, then the
//! client mirror, then process memory, and only then broadcasts, so another
//! context reacting to the broadcast never reads a half-written session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::AuthBackend;
use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::error::Error;
use crate::lease::RefreshLease;
use crate::store::{Carrier, CredentialStore};
use crate::sync::{SyncHub, SyncMessage};
use crate::types::{ContextId, Credential, CredentialKind, TokenGrant};

/// What the render layer sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unknown,
    Loading,
    Authenticated(CredentialKind),
    Refreshing(CredentialKind),
    Unauthenticated,
}

impl SessionState {
    #[must_use]
    pub fn is_registered(self) -> bool {
        matches!(
            self,
            Self::Authenticated(CredentialKind::Registered)
                | Self::Refreshing(CredentialKind::Registered)
        )
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Credential, Error>>>;

/// Owns the active credential of one execution context.
///
/// Cheap to clone; clones share state. Construct once per context and call
/// [`load`](Self::load). Timers are torn down by [`shutdown`](Self::shutdown)
/// or when the last clone is dropped.
pub struct SessionManager<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for SessionManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<B> {
    config: SessionConfig,
    backend: Arc<B>,
    store: Arc<CredentialStore>,
    hub: SyncHub,
    clock: Arc<dyn Clock>,
    context: ContextId,
    state: watch::Sender<SessionState>,
    in_flight: Mutex<Option<SharedRefresh>>,
    lease_timer: Mutex<Option<JoinHandle<()>>>,
    // Bumped on every install or clear; stale timers and refreshes compare against it.
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl<B> Drop for Inner<B> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(timer) = self.lease_timer.get_mut().take() {
            timer.abort();
        }
    }
}

impl<B: AuthBackend> SessionManager<B> {
    #[must_use]
    pub fn new(
        config: SessionConfig,
        backend: Arc<B>,
        store: Arc<CredentialStore>,
        hub: SyncHub,
    ) -> Self {
        Self::with_clock(config, backend, store, hub, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        config: SessionConfig,
        backend: Arc<B>,
        store: Arc<CredentialStore>,
        hub: SyncHub,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Unknown);
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                store,
                hub,
                clock,
                context: ContextId::generate(),
                state,
                in_flight: Mutex::new(None),
                lease_timer: Mutex::new(None),
                generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// The credential this context currently treats as active.
    #[must_use]
    pub fn active_credential(&self) -> Option<Credential> {
        self.inner.store.held()
    }

    #[must_use]
    pub fn context(&self) -> ContextId {
        self.inner.context
    }

    #[must_use]
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub(crate) fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Number of installs and clears so far. Changes whenever the active
    /// credential is replaced.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Reads every carrier, reconciles, and settles into a state.
    ///
    /// A credential whose refresh is already due is refreshed before this
    /// returns. Failures end in [`SessionState::Unauthenticated`]; they are
    /// logged, not returned.
    pub async fn load(&self) -> SessionState {
        self.inner.set_state(SessionState::Loading);
        let now = self.inner.clock.now();
        let reconciled = self.inner.store.reconcile(now);

        let Some(credential) = reconciled.credential else {
            if reconciled.local_stale {
                self.inner.store.clear(Carrier::ClientPersistent);
            }
            self.inner.store.clear(Carrier::ProcessMemory);
            tracing::debug!(source = ?reconciled.source, "No session found");
            self.inner.set_state(SessionState::Unauthenticated);
            return self.state();
        };

        self.inner.adopt(&credential, reconciled.local_stale);
        let lease = RefreshLease::for_credential(&credential, self.inner.config.refresh_margin());
        if !lease.is_due(now) {
            self.inner.schedule(&credential);
            return self.state();
        }

        tracing::debug!(kind = credential.kind.as_str(), "Refresh due on load");
        match credential.kind {
            CredentialKind::Registered => {
                if let Err(e) = self.refresh().await {
                    tracing::warn!(error = %e, "Refresh on load failed");
                }
            }
            CredentialKind::Anonymous => self.inner.expire_anonymous(),
        }
        self.state()
    }

    /// Exchanges the refresh secret for a new registered credential.
    ///
    /// Concurrent callers share one exchange and observe the same outcome.
    /// Failure is terminal: every carrier is cleared, the state becomes
    /// [`SessionState::Unauthenticated`] and the change is broadcast.
    ///
    /// # Errors
    ///
    /// Returns the classified backend failure, [`Error::CredentialInvalid`] if
    /// no refresh secret is available, [`Error::CredentialExpired`] if the
    /// active credential is anonymous, or [`Error::Cancelled`] if the session
    /// was replaced or torn down while the exchange was in flight.
    pub async fn refresh(&self) -> Result<Credential, Error> {
        let pending = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let pending = async move {
                        let result = inner.refresh_exchange().await;
                        *inner.in_flight.lock() = None;
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Signs out: best-effort backend notification, then unconditional local clear.
    ///
    /// Clears both the registered session and the anonymous record, but keeps
    /// the device fingerprint.
    pub async fn logout(&self) {
        let token = self
            .inner
            .store
            .held()
            .map(|c| c.access_token)
            .or_else(|| {
                self.inner
                    .store
                    .read_cookies()
                    .and_then(|view| view.access_token)
            });

        if let Some(token) = token {
            let notified = tokio::select! {
                result = self.inner.backend.logout(&token) => result,
                () = self.inner.shutdown.cancelled() => Err(Error::Cancelled),
            };
            if let Err(e) = notified {
                tracing::warn!(error = %e, "Logout notification failed; clearing local session anyway");
            }
        }

        self.inner.store.clear_anonymous();
        self.inner.clear_session();
        tracing::info!("Signed out");
    }

    /// Email and password sign-in.
    ///
    /// # Errors
    ///
    /// [`Error::InputInvalid`] for a blank or malformed email or an empty
    /// password; otherwise the classified backend failure.
    pub async fn login(&self, email: &str, password: &str) -> Result<Credential, Error> {
        let email = validate_email(email)?;
        if password.is_empty() {
            return Err(Error::InputInvalid("password is required".into()));
        }
        let grant = self
            .inner
            .cancellable(self.inner.backend.login(email, password))
            .await?;
        let credential = self.inner.install_grant(grant, CredentialKind::Registered)?;
        tracing::info!(subject_id = ?credential.subject_id, "Signed in");
        Ok(credential)
    }

    /// Google identity sign-in under the configured deadline.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the deadline elapses, [`Error::Cancelled`] when
    /// the context is torn down, [`Error::InputInvalid`] for an empty token;
    /// otherwise the classified backend failure.
    pub async fn sign_in_with_google(&self, id_token: &str) -> Result<Credential, Error> {
        if id_token.trim().is_empty() {
            return Err(Error::InputInvalid("Google ID token is required".into()));
        }
        let deadline = self.inner.config.google_timeout();
        let grant = tokio::select! {
            result = self.inner.backend.google_sign_in(id_token) => result?,
            () = tokio::time::sleep(deadline) => {
                tracing::warn!(timeout_secs = deadline.as_secs(), "Google sign-in timed out");
                return Err(Error::Timeout { operation: "google-signin" });
            }
            () = self.inner.shutdown.cancelled() => return Err(Error::Cancelled),
        };
        let credential = self.inner.install_grant(grant, CredentialKind::Registered)?;
        tracing::info!(subject_id = ?credential.subject_id, "Signed in with Google");
        Ok(credential)
    }

    /// Completes sign-up by verifying the emailed code.
    ///
    /// # Errors
    ///
    /// [`Error::InputInvalid`] for a malformed email or blank code; otherwise
    /// the classified backend failure.
    pub async fn verify_email(&self, email: &str, code: &str) -> Result<Credential, Error> {
        let email = validate_email(email)?;
        let code = code.trim();
        if code.is_empty() {
            return Err(Error::InputInvalid("verification code is required".into()));
        }
        let grant = self
            .inner
            .cancellable(self.inner.backend.verify_email(email, code))
            .await?;
        let credential = self.inner.install_grant(grant, CredentialKind::Registered)?;
        tracing::info!(subject_id = ?credential.subject_id, "Email verified");
        Ok(credential)
    }

    /// Installs an anonymous credential unless a registered one is active.
    ///
    /// Returns `false` when refused.
    ///
    /// # Errors
    ///
    /// [`Error::InputInvalid`] if `credential` is not anonymous.
    pub fn adopt_anonymous(&self, credential: Credential) -> Result<bool, Error> {
        if credential.kind != CredentialKind::Anonymous {
            return Err(Error::InputInvalid("credential is not anonymous".into()));
        }
        if self.inner.store.held().is_some_and(|c| c.is_registered()) {
            tracing::debug!("Registered session active; anonymous credential ignored");
            return Ok(false);
        }
        self.inner.install(&credential)?;
        Ok(true)
    }

    /// Access token for an outgoing request, refreshing first if it expired.
    ///
    /// # Errors
    ///
    /// Whatever [`refresh`](Self::refresh) returns, or
    /// [`Error::CredentialExpired`] for an expired anonymous credential.
    pub async fn access_token(&self) -> Result<Option<String>, Error> {
        let Some(credential) = self.inner.store.held() else {
            return Ok(None);
        };
        if !credential.is_expired(self.inner.clock.now()) {
            return Ok(Some(credential.access_token));
        }
        match credential.kind {
            CredentialKind::Registered => self.refresh().await.map(|c| Some(c.access_token)),
            CredentialKind::Anonymous => {
                self.inner.expire_anonymous();
                Err(Error::CredentialExpired)
            }
        }
    }

    /// Re-reads the carriers after another context changed them, or after
    /// this context was in the background.
    ///
    /// An unchanged credential whose refresh is due is renewed in the
    /// background, as the lease timer would. Does not broadcast. Must run
    /// inside a Tokio runtime.
    pub fn resync(&self) -> SessionState {
        let inner = &self.inner;
        let now = inner.clock.now();
        let reconciled = inner.store.reconcile(now);
        let held = inner.store.held();

        match (reconciled.credential, held) {
            (Some(found), Some(held))
                if found.access_token == held.access_token
                    && found.expires_at == held.expires_at =>
            {
                if reconciled.local_stale {
                    inner.write_mirror(&held);
                }
                if RefreshLease::for_credential(&held, inner.config.refresh_margin()).is_due(now) {
                    tracing::debug!(kind = held.kind.as_str(), "Held credential due on re-read");
                    inner.renew_in_background(held.kind);
                }
            }
            (Some(found), _) => {
                tracing::debug!(kind = found.kind.as_str(), "Adopting session written elsewhere");
                inner.adopt(&found, reconciled.local_stale);
                inner.schedule(&found);
            }
            (None, Some(_)) => {
                tracing::debug!("Session cleared elsewhere");
                if reconciled.local_stale {
                    inner.store.clear(Carrier::ClientPersistent);
                }
                inner.store.clear(Carrier::ProcessMemory);
                inner.bump();
                inner.cancel_timer();
                inner.set_state(SessionState::Unauthenticated);
            }
            (None, None) => {
                if self.state() != SessionState::Unauthenticated {
                    inner.set_state(SessionState::Unauthenticated);
                }
            }
        }
        self.state()
    }

    /// Tears down timers and aborts pending exchanges.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.cancel_timer();
    }
}

impl<B: AuthBackend> Inner<B> {
    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn broadcast(&self, kind: Option<CredentialKind>) {
        self.hub.publish(SyncMessage::CredentialChanged {
            kind,
            origin: self.context,
        });
    }

    async fn cancellable<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        tokio::select! {
            result = fut => result,
            () = self.shutdown.cancelled() => Err(Error::Cancelled),
        }
    }

    fn write_mirror(&self, credential: &Credential) {
        let options = self.store.default_options().clone();
        if let Err(e) = self.store.write(Carrier::ClientPersistent, credential, &options) {
            tracing::warn!(error = %e, "Client store mirror not written");
        }
    }

    /// Takes a credential read from the carriers as the active one.
    fn adopt(&self, credential: &Credential, local_stale: bool) {
        if local_stale {
            self.write_mirror(credential);
        }
        let options = self.store.default_options().clone();
        if let Err(e) = self.store.write(Carrier::ProcessMemory, credential, &options) {
            tracing::warn!(error = %e, "Credential not held in memory");
        }
        self.bump();
        self.set_state(SessionState::Authenticated(credential.kind));
    }

    fn install_grant(
        self: &Arc<Self>,
        grant: TokenGrant,
        kind: CredentialKind,
    ) -> Result<Credential, Error> {
        let credential = Credential::from_grant(grant, kind, self.clock.now())?;
        self.install(&credential)?;
        Ok(credential)
    }

    /// Writes a new credential to every carrier, cookies first, then broadcasts.
    fn install(self: &Arc<Self>, credential: &Credential) -> Result<(), Error> {
        let options = self.store.default_options().clone();
        self.store.write(
            Carrier::CookieHttpOnly,
            credential,
            &options.clone().with_http_only(true),
        )?;
        self.store.write(
            Carrier::CookieVisible,
            credential,
            &options.clone().with_http_only(false),
        )?;
        self.write_mirror(credential);
        self.store.write(Carrier::ProcessMemory, credential, &options)?;

        self.bump();
        self.set_state(SessionState::Authenticated(credential.kind));
        self.schedule(credential);
        self.broadcast(Some(credential.kind));
        Ok(())
    }

    fn clear_session(&self) {
        self.store.clear_all();
        self.bump();
        self.cancel_timer();
        self.set_state(SessionState::Unauthenticated);
        self.broadcast(None);
    }

    /// Drops an expired anonymous credential. The anonymous record stays so
    /// a running [`AnonymousIdentity`](crate::AnonymousIdentity) can rotate it.
    fn expire_anonymous(&self) {
        tracing::debug!("Anonymous credential expired");
        self.clear_session();
    }

    async fn refresh_exchange(self: &Arc<Self>) -> Result<Credential, Error> {
        let previous = self.store.held();
        if previous.as_ref().is_some_and(|c| !c.is_registered()) {
            self.expire_anonymous();
            return Err(Error::CredentialExpired);
        }

        let started = self.generation.load(Ordering::SeqCst);
        self.set_state(SessionState::Refreshing(CredentialKind::Registered));

        let secret = self
            .store
            .read(Carrier::CookieHttpOnly)
            .and_then(|view| view.refresh)
            .and_then(|handle| handle.secret().map(str::to_string));

        let outcome = match secret {
            Some(secret) => self.cancellable(self.backend.refresh_token(&secret)).await,
            None => Err(Error::CredentialInvalid("no refresh secret available".into())),
        };

        if matches!(outcome, Err(Error::Cancelled)) {
            return Err(Error::Cancelled);
        }
        if self.generation.load(Ordering::SeqCst) != started {
            // Logout or a session from another context landed meanwhile.
            tracing::debug!("Discarding refresh result for a replaced session");
            return Err(Error::Cancelled);
        }

        let result = outcome.and_then(|grant| {
            let fresh = Credential::from_grant(grant, CredentialKind::Registered, self.clock.now())?;
            let credential = carry_over(fresh, previous.as_ref());
            self.install(&credential)?;
            Ok(credential)
        });

        match result {
            Ok(credential) => {
                tracing::info!(subject_id = ?credential.subject_id, "Session refreshed");
                Ok(credential)
            }
            Err(e) => {
                tracing::error!(error = %e, "Session refresh failed; signing out");
                self.clear_session();
                Err(e)
            }
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.lease_timer.lock().take() {
            timer.abort();
        }
    }

    /// Arms a single-shot timer at the credential's refresh due time.
    fn schedule(self: &Arc<Self>, credential: &Credential) {
        let lease = RefreshLease::for_credential(credential, self.config.refresh_margin());
        let delay = lease.delay_from(self.clock.now());
        let kind = credential.kind;
        let generation = self.generation.load(Ordering::SeqCst);
        let shutdown = self.shutdown.clone();
        let weak = Arc::downgrade(self);

        tracing::debug!(
            kind = kind.as_str(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Refresh scheduled"
        );

        let timer = tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.cancelled() => return,
            }
            let Some(inner) = weak.upgrade() else { return };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            inner.renew_in_background(kind);
        });

        if let Some(previous) = self.lease_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Starts renewing a credential whose refresh is due without waiting:
    /// a registered one is refreshed, an anonymous one expires.
    fn renew_in_background(self: &Arc<Self>, kind: CredentialKind) {
        match kind {
            CredentialKind::Registered => {
                self.set_state(SessionState::Refreshing(CredentialKind::Registered));
                // Refresh reschedules the lease timer; run it outside the timer task.
                let manager = SessionManager {
                    inner: Arc::clone(self),
                };
                tokio::spawn(async move {
                    if let Err(e) = manager.refresh().await {
                        tracing::debug!(error = %e, "Background refresh ended without a session");
                    }
                });
            }
            CredentialKind::Anonymous => self.expire_anonymous(),
        }
    }
}

/// Keeps identity and profile facts a refresh grant does not repeat.
fn carry_over(mut fresh: Credential, previous: Option<&Credential>) -> Credential {
    let Some(previous) = previous else {
        return fresh;
    };
    fresh.subject_id = fresh.subject_id.or_else(|| previous.subject_id.clone());
    fresh.subject_email = fresh.subject_email.or_else(|| previous.subject_email.clone());
    let profile = &mut fresh.profile;
    profile.full_name = profile.full_name.take().or_else(|| previous.profile.full_name.clone());
    profile.email = profile.email.take().or_else(|| previous.profile.email.clone());
    profile.subscription_status = profile
        .subscription_status
        .take()
        .or_else(|| previous.profile.subscription_status.clone());
    profile.user_type = profile.user_type.take().or_else(|| previous.profile.user_type.clone());
    fresh
}

fn validate_email(email: &str) -> Result<&str, Error> {
    let email = email.trim();
    if email.is_empty() {
        return Err(Error::InputInvalid("email is required".into()));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(Error::InputInvalid(format!("invalid email: {email}"))),
    }
}
