//! Device-scoped anonymous credentials for visitors without a session.
//!
//! The fallback chain is bounded by construction: a failed refresh may fall
//! back to one registration, and nothing falls back from a registration.
//!
//! ```text
//! Register ----------------------------> Established | Failed
//! Refresh -> (fail) RegisterFallback --> Established | Failed
//! ```

use std::sync::{Arc, Weak};

use time::OffsetDateTime;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::AuthBackend;
use crate::device::DeviceFingerprint;
use crate::error::Error;
use crate::lease::RefreshLease;
use crate::lifecycle::{SessionManager, SessionState};
use crate::store::AnonymousRecord;
use crate::types::{Credential, CredentialKind, RefreshHandle, TokenGrant};

/// What to do with the stored anonymous record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnonymousDecision {
    /// No refresh token stored.
    Register,
    /// Stored tokens expired, are due for renewal, or their age is unknown.
    Refresh(String),
    /// Stored access token outlives the refresh margin; no network call.
    Reuse,
}

/// Decision rule over the stored quadruple.
///
/// A token inside the refresh margin is renewed rather than reused, so the
/// lease timer never drops a credential the moment it is handed over.
#[must_use]
pub fn decide(
    record: &AnonymousRecord,
    now: OffsetDateTime,
    margin: time::Duration,
) -> AnonymousDecision {
    let Some(refresh_token) = &record.refresh_token else {
        return AnonymousDecision::Register;
    };
    match record.expires_at() {
        Some(expires_at)
            if record.access_token.is_some() && !RefreshLease::new(expires_at, margin).is_due(now) =>
        {
            AnonymousDecision::Reuse
        }
        _ => AnonymousDecision::Refresh(refresh_token.clone()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Attempt {
    Register,
    Refresh(String),
    RegisterFallback,
}

impl Attempt {
    /// Next attempt after this one failed; `None` ends the cycle.
    fn after_failure(&self) -> Option<Self> {
        match self {
            Self::Refresh(_) => Some(Self::RegisterFallback),
            Self::Register | Self::RegisterFallback => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Refresh(_) => "refresh",
            Self::RegisterFallback => "register-fallback",
        }
    }
}

/// Establishes the anonymous credential of one context.
///
/// A cycle starts at construction (page load) and ends either with a
/// credential or, after a bounded number of failures, with nothing. An
/// exhausted cycle makes no further calls until [`new_cycle`](Self::new_cycle).
///
/// [`start`](Self::start) keeps the credential alive: whenever the session
/// reports no authenticated session, including after an anonymous lease ran
/// out, it establishes (or rotates) the device credential again.
pub struct AnonymousIdentity<B> {
    session: SessionManager<B>,
    exhausted: Mutex<bool>,
    running: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<B> Drop for AnonymousIdentity<B> {
    fn drop(&mut self) {
        if let Some((token, task)) = self.running.get_mut().take() {
            token.cancel();
            task.abort();
        }
    }
}

impl<B: AuthBackend> AnonymousIdentity<B> {
    #[must_use]
    pub fn new(session: SessionManager<B>) -> Self {
        Self {
            session,
            exhausted: Mutex::new(false),
            running: parking_lot::Mutex::new(None),
        }
    }

    /// Watches the session state and runs [`establish`](Self::establish)
    /// every time it becomes [`SessionState::Unauthenticated`]. Calling it
    /// again while running is a no-op.
    pub fn start(self: &Arc<Self>, fingerprint: DeviceFingerprint) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|(_, task)| !task.is_finished()) {
            return;
        }

        let token = self.session.shutdown_token().child_token();
        let task = tokio::spawn(watch_session(
            Arc::downgrade(self),
            self.session.subscribe_state(),
            fingerprint,
            token.clone(),
        ));
        *running = Some((token, task));
    }

    /// Stops the watcher and waits for it to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some((token, task)) = running {
            token.cancel();
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Anonymous identity watcher ended abnormally");
            }
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|(_, task)| !task.is_finished())
    }

    /// Starts a new fingerprint-ready cycle, re-enabling automatic attempts.
    pub async fn new_cycle(&self) {
        *self.exhausted.lock().await = false;
    }

    /// Obtains an anonymous credential for `fingerprint` and hands it to the
    /// session, unless a registered session is active.
    ///
    /// Returns `Ok(None)` when skipped: a registered session is active, or
    /// this cycle is exhausted.
    ///
    /// # Errors
    ///
    /// The last backend failure once every allowed attempt failed. The
    /// stored anonymous record is cleared and the cycle marked exhausted.
    pub async fn establish(
        &self,
        fingerprint: &DeviceFingerprint,
    ) -> Result<Option<Credential>, Error> {
        // Serialises concurrent calls within the context.
        let mut exhausted = self.exhausted.lock().await;
        if *exhausted {
            tracing::debug!("Anonymous cycle exhausted; not retrying");
            return Ok(None);
        }

        let store = self.session.store().clone();
        let now = self.session.clock().now();
        let margin = self.session.config().refresh_margin();
        if let Some(held) = self.session.active_credential() {
            if held.is_registered() {
                return Ok(None);
            }
            if !RefreshLease::for_credential(&held, margin).is_due(now) {
                return Ok(Some(held));
            }
        }

        let record = store.read_anonymous();
        let mut attempt = match decide(&record, now, margin) {
            AnonymousDecision::Reuse => return self.reuse(&record),
            AnonymousDecision::Register => Attempt::Register,
            AnonymousDecision::Refresh(token) => Attempt::Refresh(token),
        };

        let (grant, credential) = loop {
            match self.try_attempt(&attempt, fingerprint).await {
                Ok(issued) => break issued,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => match attempt.after_failure() {
                    Some(next) => {
                        tracing::warn!(error = %e, attempt = attempt.name(), "Anonymous attempt failed; falling back");
                        attempt = next;
                    }
                    None => {
                        tracing::warn!(error = %e, attempt = attempt.name(), "Anonymous identity unavailable");
                        store.clear_anonymous();
                        *exhausted = true;
                        return Err(e);
                    }
                },
            }
        };

        let refresh_token = grant.refresh_token.clone().or(match &attempt {
            Attempt::Refresh(previous) => Some(previous.clone()),
            Attempt::Register | Attempt::RegisterFallback => None,
        });
        store.write_anonymous(&AnonymousRecord {
            access_token: Some(credential.access_token.clone()),
            refresh_token,
            expires_in: Some(grant.expires_in),
            timestamp: Some(credential.issued_at),
        });
        tracing::info!(attempt = attempt.name(), "Anonymous identity established");

        self.hand_over(credential)
    }

    async fn try_attempt(
        &self,
        attempt: &Attempt,
        fingerprint: &DeviceFingerprint,
    ) -> Result<(TokenGrant, Credential), Error> {
        let backend = self.session.backend();
        let exchange = async {
            match attempt {
                Attempt::Register | Attempt::RegisterFallback => {
                    backend
                        .register_device(&fingerprint.device_id, &fingerprint.info)
                        .await
                }
                Attempt::Refresh(token) => backend.refresh_anonymous(token).await,
            }
        };
        let grant = tokio::select! {
            result = exchange => result?,
            () = self.session.shutdown_token().cancelled() => return Err(Error::Cancelled),
        };
        let now = self.session.clock().now();
        let credential = Credential::from_grant(grant.clone(), CredentialKind::Anonymous, now)?;
        // Renewal would be due at once and the lease timer would drop it again.
        if RefreshLease::for_credential(&credential, self.session.config().refresh_margin())
            .is_due(now)
        {
            return Err(Error::UpstreamUnavailable(format!(
                "anonymous grant lifetime of {}s is inside the refresh margin",
                grant.expires_in
            )));
        }
        Ok((grant, credential))
    }

    fn reuse(&self, record: &AnonymousRecord) -> Result<Option<Credential>, Error> {
        let (Some(access_token), Some(issued_at), Some(expires_at)) =
            (&record.access_token, record.timestamp, record.expires_at())
        else {
            return Ok(None);
        };
        tracing::debug!("Reusing stored anonymous credential");
        self.hand_over(Credential {
            kind: CredentialKind::Anonymous,
            access_token: access_token.clone(),
            refresh: record.refresh_token.clone().map(RefreshHandle::Secret),
            issued_at,
            expires_at,
            subject_id: None,
            subject_email: None,
            profile: Default::default(),
        })
    }

    fn hand_over(&self, credential: Credential) -> Result<Option<Credential>, Error> {
        if self.session.adopt_anonymous(credential.clone())? {
            Ok(Some(credential))
        } else {
            Ok(None)
        }
    }
}

async fn watch_session<B: AuthBackend>(
    identity: Weak<AnonymousIdentity<B>>,
    mut states: watch::Receiver<SessionState>,
    fingerprint: DeviceFingerprint,
    shutdown: CancellationToken,
) {
    loop {
        let unauthenticated = *states.borrow_and_update() == SessionState::Unauthenticated;
        if unauthenticated {
            let Some(identity) = identity.upgrade() else { break };
            let outcome = tokio::select! {
                outcome = identity.establish(&fingerprint) => outcome,
                () = shutdown.cancelled() => break,
            };
            if let Err(e) = outcome {
                tracing::debug!(error = %e, "No anonymous identity this cycle");
            }
        }

        tokio::select! {
            () = shutdown.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Anonymous identity watcher stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::{ManualClock, epoch_ms, from_epoch_ms};
    use crate::lifecycle::SessionState;
    use crate::sync::SyncHub;
    use crate::testing::{Browser, Endpoint, ScriptedBackend, config};
    use crate::types::GrantId;

    const NOW_MS: i64 = 1_760_000_000_000;

    fn at(ms: i64) -> OffsetDateTime {
        from_epoch_ms(ms).unwrap()
    }

    struct Harness {
        browser: Browser,
        backend: Arc<ScriptedBackend>,
        clock: Arc<ManualClock>,
        session: SessionManager<ScriptedBackend>,
        identity: Arc<AnonymousIdentity<ScriptedBackend>>,
        fingerprint: DeviceFingerprint,
    }

    impl Harness {
        fn new() -> Self {
            let browser = Browser::new();
            let backend = ScriptedBackend::new();
            let clock = Arc::new(ManualClock::at_epoch_ms(NOW_MS));
            let session = SessionManager::with_clock(
                config(),
                backend.clone(),
                browser.tab(),
                SyncHub::new(),
                clock.clone(),
            );
            let fingerprint = session
                .store()
                .device_fingerprint("Mozilla/5.0 (X11; Linux x86_64) Firefox/127.0");
            Self {
                identity: Arc::new(AnonymousIdentity::new(session.clone())),
                browser,
                backend,
                clock,
                session,
                fingerprint,
            }
        }

        /// Moves wall-clock and timer time forward together.
        async fn elapse(&self, secs: u64) {
            self.clock.advance(time::Duration::seconds(secs.try_into().unwrap()));
            tokio::time::sleep(Duration::from_secs(secs)).await;
            settle().await;
        }

        fn record(&self) -> AnonymousRecord {
            self.session.store().read_anonymous()
        }

        fn seed_record(&self, issued_ms: i64, expires_in: u64) {
            self.session.store().write_anonymous(&AnonymousRecord {
                access_token: Some("anon-old".into()),
                refresh_token: Some("anon-r-old".into()),
                expires_in: Some(expires_in),
                timestamp: Some(at(issued_ms)),
            });
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn anon_grant(access: &str, refresh: &str) -> TokenGrant {
        TokenGrant::new(access, refresh, 3600).with_user_type("anonym")
    }

    #[test]
    fn decision_rule() {
        let now = at(NOW_MS);
        let margin = time::Duration::seconds(60);
        assert_eq!(
            decide(&AnonymousRecord::default(), now, margin),
            AnonymousDecision::Register
        );

        let mut record = AnonymousRecord {
            access_token: Some("a".into()),
            refresh_token: Some("r".into()),
            expires_in: Some(3600),
            timestamp: Some(at(NOW_MS - 30_000)),
        };
        assert_eq!(decide(&record, now, margin), AnonymousDecision::Reuse);

        // 30 seconds left, inside the 60 second margin.
        record.timestamp = Some(at(NOW_MS - 3_570_000));
        assert_eq!(decide(&record, now, margin), AnonymousDecision::Refresh("r".into()));

        record.timestamp = Some(at(NOW_MS - 3_601_000));
        assert_eq!(decide(&record, now, margin), AnonymousDecision::Refresh("r".into()));

        // Unknown age is treated as expired.
        record.timestamp = None;
        assert_eq!(decide(&record, now, margin), AnonymousDecision::Refresh("r".into()));
    }

    #[test]
    fn fallback_chain_is_bounded() {
        let mut attempt = Attempt::Refresh("r".into());
        let mut tries = 1;
        while let Some(next) = attempt.after_failure() {
            attempt = next;
            tries += 1;
        }
        assert_eq!(tries, 2);
        assert_eq!(Attempt::Register.after_failure(), None);
    }

    #[tokio::test]
    async fn fresh_browser_registers_exactly_once() {
        let h = Harness::new();
        h.backend
            .push(Endpoint::RegisterDevice, Ok(anon_grant("anon-1", "anon-r-1")));

        let credential = h.identity.establish(&h.fingerprint).await.unwrap().unwrap();

        assert_eq!(h.backend.calls(Endpoint::RegisterDevice), 1);
        assert_eq!(h.backend.calls(Endpoint::RefreshAnonymous), 0);
        assert_eq!(
            h.backend.seen(Endpoint::RegisterDevice),
            vec![h.fingerprint.device_id.0.clone()]
        );
        assert_eq!(credential.kind, CredentialKind::Anonymous);
        assert_eq!(
            h.record(),
            AnonymousRecord {
                access_token: Some("anon-1".into()),
                refresh_token: Some("anon-r-1".into()),
                expires_in: Some(3600),
                timestamp: Some(at(NOW_MS)),
            }
        );
        assert_eq!(
            h.session.state(),
            SessionState::Authenticated(CredentialKind::Anonymous)
        );
        assert_eq!(
            h.browser.cookies.script_value("finboard.user-type").as_deref(),
            Some("anonym")
        );
    }

    #[tokio::test]
    async fn expired_record_refreshes_once_and_overwrites() {
        let h = Harness::new();
        h.seed_record(NOW_MS - 7_200_000, 3600);
        h.backend
            .push(Endpoint::RefreshAnonymous, Ok(anon_grant("anon-2", "anon-r-2")));

        h.identity.establish(&h.fingerprint).await.unwrap().unwrap();

        assert_eq!(h.backend.calls(Endpoint::RefreshAnonymous), 1);
        assert_eq!(h.backend.seen(Endpoint::RefreshAnonymous), vec!["anon-r-old"]);
        assert_eq!(h.backend.calls(Endpoint::RegisterDevice), 0);
        let record = h.record();
        assert_eq!(record.access_token.as_deref(), Some("anon-2"));
        assert_eq!(record.refresh_token.as_deref(), Some("anon-r-2"));
        assert_eq!(record.expires_in, Some(3600));
        assert_eq!(record.timestamp.map(epoch_ms), Some(NOW_MS));
    }

    #[tokio::test]
    async fn valid_record_is_reused_without_network() {
        let h = Harness::new();
        h.seed_record(NOW_MS - 1_000, 3600);

        let credential = h.identity.establish(&h.fingerprint).await.unwrap().unwrap();

        assert_eq!(credential.access_token, "anon-old");
        assert_eq!(epoch_ms(credential.expires_at), NOW_MS - 1_000 + 3_600_000);
        assert_eq!(h.backend.calls(Endpoint::RefreshAnonymous), 0);
        assert_eq!(h.backend.calls(Endpoint::RegisterDevice), 0);
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_register() {
        let h = Harness::new();
        h.seed_record(NOW_MS - 7_200_000, 3600);
        h.backend.push(
            Endpoint::RefreshAnonymous,
            Err(Error::CredentialInvalid("revoked".into())),
        );
        h.backend
            .push(Endpoint::RegisterDevice, Ok(anon_grant("anon-3", "anon-r-3")));

        let credential = h.identity.establish(&h.fingerprint).await.unwrap().unwrap();

        assert_eq!(credential.access_token, "anon-3");
        assert_eq!(h.backend.calls(Endpoint::RefreshAnonymous), 1);
        assert_eq!(h.backend.calls(Endpoint::RegisterDevice), 1);
        assert_eq!(h.record().refresh_token.as_deref(), Some("anon-r-3"));
    }

    #[tokio::test]
    async fn two_failures_end_the_cycle() {
        let h = Harness::new();
        h.seed_record(NOW_MS - 7_200_000, 3600);
        h.backend.push(
            Endpoint::RefreshAnonymous,
            Err(Error::CredentialInvalid("revoked".into())),
        );
        h.backend.push(
            Endpoint::RegisterDevice,
            Err(Error::UpstreamUnavailable("down".into())),
        );

        let err = h.identity.establish(&h.fingerprint).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable(_)));
        assert!(h.record().is_empty());
        assert_eq!(h.session.active_credential(), None);

        // No automatic retry within the cycle.
        assert_eq!(h.identity.establish(&h.fingerprint).await.unwrap(), None);
        assert_eq!(h.backend.calls(Endpoint::RefreshAnonymous), 1);
        assert_eq!(h.backend.calls(Endpoint::RegisterDevice), 1);

        // A new cycle (page reload) tries again, from scratch.
        h.backend
            .push(Endpoint::RegisterDevice, Ok(anon_grant("anon-4", "anon-r-4")));
        h.identity.new_cycle().await;
        assert!(h.identity.establish(&h.fingerprint).await.unwrap().is_some());
        assert_eq!(h.backend.calls(Endpoint::RegisterDevice), 2);
    }

    #[tokio::test]
    async fn failed_registration_is_not_retried() {
        let h = Harness::new();
        h.backend.push(
            Endpoint::RegisterDevice,
            Err(Error::UpstreamUnavailable("down".into())),
        );
        assert!(h.identity.establish(&h.fingerprint).await.is_err());
        assert_eq!(h.backend.calls(Endpoint::RegisterDevice), 1);
    }

    #[tokio::test]
    async fn skipped_while_registered() {
        let h = Harness::new();
        h.backend.push(
            Endpoint::Login,
            Ok(TokenGrant::new("acc", "refresh-1", 900)
                .with_subject(GrantId::Number(1), "kim@example.com")),
        );
        h.session.login("kim@example.com", "pw").await.unwrap();

        assert_eq!(h.identity.establish(&h.fingerprint).await.unwrap(), None);
        assert_eq!(h.backend.calls(Endpoint::RegisterDevice), 0);
    }

    #[tokio::test]
    async fn login_during_registration_wins() {
        let h = Arc::new(Harness::new());
        h.backend
            .push(Endpoint::RegisterDevice, Ok(anon_grant("anon-1", "anon-r-1")));
        h.backend.hold(Endpoint::RegisterDevice);

        let pending = tokio::spawn({
            let h = h.clone();
            async move { h.identity.establish(&h.fingerprint).await }
        });
        tokio::task::yield_now().await;

        h.backend
            .push(Endpoint::Login, Ok(TokenGrant::new("acc", "refresh-1", 900)));
        h.session.login("kim@example.com", "pw").await.unwrap();
        h.backend.release(Endpoint::RegisterDevice);

        assert_eq!(pending.await.unwrap().unwrap(), None);
        assert!(h.session.state().is_registered());
        assert_eq!(h.session.active_credential().unwrap().access_token, "acc");
    }

    #[tokio::test]
    async fn record_inside_refresh_margin_is_renewed_not_reused() {
        let h = Harness::new();
        // Expires in 30 seconds; the margin is 60.
        h.seed_record(NOW_MS - 3_570_000, 3600);
        h.backend
            .push(Endpoint::RefreshAnonymous, Ok(anon_grant("anon-2", "anon-r-2")));

        let credential = h.identity.establish(&h.fingerprint).await.unwrap().unwrap();
        settle().await;

        assert_eq!(credential.access_token, "anon-2");
        assert_eq!(h.backend.seen(Endpoint::RefreshAnonymous), vec!["anon-r-old"]);
        assert_eq!(h.backend.calls(Endpoint::RegisterDevice), 0);
        assert_eq!(
            h.session.state(),
            SessionState::Authenticated(CredentialKind::Anonymous)
        );
        assert_eq!(h.session.active_credential().unwrap().access_token, "anon-2");

        // The fresh credential is held and outlives the margin: no further calls.
        let again = h.identity.establish(&h.fingerprint).await.unwrap().unwrap();
        assert_eq!(again.access_token, "anon-2");
        assert_eq!(h.backend.calls(Endpoint::RefreshAnonymous), 1);
    }

    #[tokio::test]
    async fn grant_shorter_than_margin_is_not_adopted() {
        let h = Harness::new();
        h.backend
            .push(Endpoint::RegisterDevice, Ok(TokenGrant::new("short", "short-r", 30)));

        let err = h.identity.establish(&h.fingerprint).await.unwrap_err();

        assert!(matches!(err, Error::UpstreamUnavailable(_)));
        assert_eq!(h.backend.calls(Endpoint::RegisterDevice), 1);
        assert_eq!(h.session.active_credential(), None);
        assert_eq!(h.identity.establish(&h.fingerprint).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_rotates_credential_across_leases() {
        let h = Harness::new();
        h.backend
            .push(Endpoint::RegisterDevice, Ok(anon_grant("anon-1", "anon-r-1")));
        h.backend
            .push(Endpoint::RefreshAnonymous, Ok(anon_grant("anon-2", "anon-r-2")));
        h.identity.start(h.fingerprint.clone());
        assert!(h.identity.is_running());

        h.session.load().await;
        settle().await;
        assert_eq!(h.session.active_credential().unwrap().access_token, "anon-1");

        // Past the first lease's refresh due time (3600 s lifetime, 60 s margin).
        h.elapse(3_541).await;

        assert_eq!(h.backend.calls(Endpoint::RegisterDevice), 1);
        assert_eq!(h.backend.seen(Endpoint::RefreshAnonymous), vec!["anon-r-1"]);
        assert_eq!(
            h.session.state(),
            SessionState::Authenticated(CredentialKind::Anonymous)
        );
        assert_eq!(h.session.active_credential().unwrap().access_token, "anon-2");
        assert_eq!(h.record().refresh_token.as_deref(), Some("anon-r-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_respects_an_exhausted_cycle() {
        let h = Harness::new();
        h.backend.push(
            Endpoint::RegisterDevice,
            Err(Error::UpstreamUnavailable("down".into())),
        );
        h.identity.start(h.fingerprint.clone());

        h.session.load().await;
        settle().await;
        h.elapse(86_400).await;

        assert_eq!(h.backend.calls(Endpoint::RegisterDevice), 1);
        assert_eq!(h.session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn watcher_stops() {
        let h = Harness::new();
        h.identity.start(h.fingerprint.clone());
        h.identity.stop().await;
        assert!(!h.identity.is_running());

        h.session.load().await;
        settle().await;
        assert_eq!(h.backend.calls(Endpoint::RegisterDevice), 0);
    }
}
