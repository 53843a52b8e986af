//! Reading and writing the credential carriers.
//!
//! Four carriers hold (partial) views of the session:
//!
//! | Carrier | Readable by | Holds |
//! |---|---|---|
//! | [`Carrier::CookieVisible`] | client script + server | access token, user type, expiry, name, subscription |
//! | [`Carrier::CookieHttpOnly`] | server only | refresh secret, user id, user email |
//! | [`Carrier::ClientPersistent`] | client script | mirror of the visible fields + `has_refresh` flag, anonymous record, device fingerprint |
//! | [`Carrier::ProcessMemory`] | this context only | the full credential |
//!
//! Reads never fail: missing or malformed data reads as `None`. Writes refuse
//! any option set that would expose the refresh secret to script.

mod cookies;
mod local;
mod reconcile;

use std::sync::Arc;

use axum_extra::extract::cookie::SameSite;
use parking_lot::Mutex;
use time::OffsetDateTime;

pub use cookies::{CookieNames, SharedCookies};
pub use local::{AnonymousRecord, KeyValueStore, MemoryKeyValueStore};
pub use reconcile::{ReconcileSource, Reconciled, reconcile};

use crate::clock::{epoch_ms, from_epoch_ms};
use crate::config::SessionConfig;
use crate::device::DeviceFingerprint;
use crate::error::Error;
use crate::types::{
    Credential, CredentialKind, PartialCredential, Profile, REGISTERED_USER_TYPE, RefreshHandle,
    SubjectId,
};
use local::LocalKeys;

/// A physical location holding a serialized view of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Carrier {
    CookieVisible,
    CookieHttpOnly,
    ClientPersistent,
    ProcessMemory,
}

impl Carrier {
    pub const ALL: [Self; 4] = [
        Self::CookieVisible,
        Self::CookieHttpOnly,
        Self::ClientPersistent,
        Self::ProcessMemory,
    ];

    /// Whether client script can read this carrier.
    #[must_use]
    pub const fn is_client_visible(self) -> bool {
        matches!(self, Self::CookieVisible | Self::ClientPersistent)
    }
}

/// Cookie attributes for a write. `http_only`, when set, must agree with the
/// carrier being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    pub http_only: Option<bool>,
    pub same_site: SameSite,
    pub domain: Option<String>,
    pub max_age: Option<time::Duration>,
    pub secure: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            http_only: None,
            same_site: cookies::SAME_SITE,
            domain: None,
            max_age: None,
            secure: false,
        }
    }
}

impl WriteOptions {
    /// `path=/`, `SameSite=Lax`, domain-scoped and `Secure` in production only.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            http_only: None,
            same_site: cookies::SAME_SITE,
            domain: config.effective_cookie_domain().map(str::to_string),
            max_age: Some(config.cookie_max_age()),
            secure: config.is_production(),
        }
    }

    #[must_use]
    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = Some(http_only);
        self
    }

    #[must_use]
    pub fn with_max_age(mut self, max_age: time::Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

/// Access point to every carrier of one execution context.
///
/// Cookies and the client store are shared with the other contexts of the
/// same browser; process memory belongs to this context alone.
pub struct CredentialStore {
    cookies: Arc<SharedCookies>,
    local: Arc<dyn KeyValueStore>,
    memory: Mutex<Option<Credential>>,
    names: CookieNames,
    keys: LocalKeys,
    anonymous_sentinel: String,
    defaults: WriteOptions,
}

impl CredentialStore {
    #[must_use]
    pub fn new(
        cookies: Arc<SharedCookies>,
        local: Arc<dyn KeyValueStore>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            cookies,
            local,
            memory: Mutex::new(None),
            names: CookieNames::new(config.cookie_prefix()),
            keys: LocalKeys::new(config.cookie_prefix()),
            anonymous_sentinel: config.anonymous_sentinel().to_string(),
            defaults: WriteOptions::from_config(config),
        }
    }

    #[must_use]
    pub fn names(&self) -> &CookieNames {
        &self.names
    }

    /// Write options derived from configuration.
    #[must_use]
    pub fn default_options(&self) -> &WriteOptions {
        &self.defaults
    }

    #[must_use]
    pub fn cookies(&self) -> &Arc<SharedCookies> {
        &self.cookies
    }

    /// Reads one carrier. Never fails; an empty carrier reads as `None`.
    #[must_use]
    pub fn read(&self, carrier: Carrier) -> Option<PartialCredential> {
        let view = match carrier {
            Carrier::CookieVisible => self.read_visible_cookies(),
            Carrier::CookieHttpOnly => self.read_http_only_cookies(),
            Carrier::ClientPersistent => local::read_session(self.local.as_ref(), &self.keys),
            Carrier::ProcessMemory => self
                .memory
                .lock()
                .as_ref()
                .map(PartialCredential::from)
                .unwrap_or_default(),
        };
        (!view.is_empty()).then_some(view)
    }

    /// The credential held in process memory.
    #[must_use]
    pub fn held(&self) -> Option<Credential> {
        self.memory.lock().clone()
    }

    /// Both cookie carriers combined, as the server sees them.
    #[must_use]
    pub fn read_cookies(&self) -> Option<PartialCredential> {
        match (
            self.read(Carrier::CookieVisible),
            self.read(Carrier::CookieHttpOnly),
        ) {
            (Some(visible), Some(server)) => Some(visible.or(server)),
            (visible, server) => visible.or(server),
        }
    }

    /// Reconciles the cookie carriers with the client store.
    #[must_use]
    pub fn reconcile(&self, now: OffsetDateTime) -> Reconciled {
        reconcile(
            self.read_cookies(),
            self.read(Carrier::ClientPersistent),
            now,
        )
    }

    /// Writes `credential` into one carrier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InputInvalid`] if `options.http_only` contradicts the
    /// carrier (a visible write marked http-only, or an http-only write
    /// marked visible), or if the profile cannot be serialized.
    pub fn write(
        &self,
        carrier: Carrier,
        credential: &Credential,
        options: &WriteOptions,
    ) -> Result<(), Error> {
        match (carrier, options.http_only) {
            (Carrier::CookieHttpOnly, Some(false)) => {
                return Err(Error::InputInvalid(
                    "server-only cookies cannot be written script-visible".into(),
                ));
            }
            (Carrier::CookieVisible, Some(true)) => {
                return Err(Error::InputInvalid(
                    "client-visible cookies cannot be written http-only".into(),
                ));
            }
            _ => {}
        }

        match carrier {
            Carrier::CookieVisible => self.write_visible_cookies(credential, options),
            Carrier::CookieHttpOnly => self.write_http_only_cookies(credential, options),
            Carrier::ClientPersistent => {
                local::write_session(self.local.as_ref(), &self.keys, credential)
                    .map_err(|e| Error::InputInvalid(format!("profile: {e}")))?;
            }
            Carrier::ProcessMemory => *self.memory.lock() = Some(credential.clone()),
        }
        Ok(())
    }

    /// Empties one carrier. Clearing an empty carrier is a no-op.
    pub fn clear(&self, carrier: Carrier) {
        match carrier {
            Carrier::CookieVisible => {
                for name in self.names.client_visible() {
                    self.cookies.set(cookies::removal_cookie(name, &self.defaults));
                }
            }
            Carrier::CookieHttpOnly => {
                for name in self.names.server_only() {
                    self.cookies.set(cookies::removal_cookie(name, &self.defaults));
                }
            }
            Carrier::ClientPersistent => {
                for key in self.keys.session() {
                    self.local.remove(key);
                }
            }
            Carrier::ProcessMemory => *self.memory.lock() = None,
        }
    }

    /// Clears every carrier, cookies first.
    pub fn clear_all(&self) {
        for carrier in Carrier::ALL {
            self.clear(carrier);
        }
    }

    #[must_use]
    pub fn read_anonymous(&self) -> AnonymousRecord {
        local::read_anonymous(self.local.as_ref(), &self.keys)
    }

    /// Replaces the stored anonymous quadruple.
    pub fn write_anonymous(&self, record: &AnonymousRecord) {
        local::write_anonymous(self.local.as_ref(), &self.keys, record);
    }

    /// Removes the anonymous quadruple. The device fingerprint is kept.
    pub fn clear_anonymous(&self) {
        for key in self.keys.anonymous() {
            self.local.remove(key);
        }
    }

    /// Returns the persisted fingerprint, creating it on first use.
    pub fn device_fingerprint(&self, user_agent: &str) -> DeviceFingerprint {
        if let Some(existing) = self
            .local
            .get(&self.keys.device)
            .and_then(|json| serde_json::from_str::<DeviceFingerprint>(&json).ok())
        {
            return existing;
        }

        let fingerprint = DeviceFingerprint::generate(user_agent);
        match serde_json::to_string(&fingerprint) {
            Ok(json) => self.local.set(&self.keys.device, json),
            Err(e) => tracing::warn!(error = %e, "Device fingerprint not persisted"),
        }
        tracing::debug!(device_id = %fingerprint.device_id, "Created device fingerprint");
        fingerprint
    }

    fn read_visible_cookies(&self) -> PartialCredential {
        let marker = self.cookies.script_value(&self.names.user_type);
        let kind = marker
            .as_deref()
            .map(|m| CredentialKind::from_marker(m, &self.anonymous_sentinel));
        let full_name = self.cookies.script_value(&self.names.user_name);
        let subscription_status = self.cookies.script_value(&self.names.subscription_status);
        // The default registered marker carries no profile information.
        let user_type = marker.filter(|m| {
            kind == Some(CredentialKind::Registered) && m.as_str() != REGISTERED_USER_TYPE
        });

        let profile = (full_name.is_some() || subscription_status.is_some() || user_type.is_some())
            .then(|| Profile {
                full_name,
                email: None,
                subscription_status,
                user_type,
            });

        PartialCredential {
            kind,
            access_token: self
                .cookies
                .script_value(&self.names.access_token)
                .filter(|t| !t.is_empty()),
            refresh: None,
            issued_at: None,
            expires_at: self
                .cookies
                .script_value(&self.names.expires_at)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .and_then(from_epoch_ms),
            subject_id: None,
            subject_email: None,
            profile,
        }
    }

    fn read_http_only_cookies(&self) -> PartialCredential {
        // Only honour the secret if it really sits in an http-only cookie.
        let refresh = self
            .cookies
            .get(&self.names.refresh_token)
            .filter(|c| c.http_only() == Some(true) && !c.value().is_empty())
            .map(|c| RefreshHandle::Secret(c.value().to_string()));

        PartialCredential {
            refresh,
            subject_id: self.cookies.value(&self.names.user_id).map(SubjectId),
            subject_email: self.cookies.value(&self.names.user_email),
            ..PartialCredential::default()
        }
    }

    fn write_visible_cookies(&self, credential: &Credential, options: &WriteOptions) {
        let set = |name: &str, value: Option<String>| match value {
            Some(value) => self.cookies.set(cookies::visible_cookie(name, value, options)),
            None => self.cookies.set(cookies::removal_cookie(name, options)),
        };

        set(&self.names.access_token, Some(credential.access_token.clone()));
        set(
            &self.names.user_type,
            Some(credential.user_type_marker(&self.anonymous_sentinel).to_string()),
        );
        set(
            &self.names.expires_at,
            Some(epoch_ms(credential.expires_at).to_string()),
        );
        set(&self.names.user_name, credential.profile.full_name.clone());
        set(
            &self.names.subscription_status,
            credential.profile.subscription_status.clone(),
        );
    }

    fn write_http_only_cookies(&self, credential: &Credential, options: &WriteOptions) {
        let set = |name: &str, value: Option<String>| match value {
            Some(value) => self.cookies.set(cookies::http_only_cookie(name, value, options)),
            None => self.cookies.set(cookies::removal_cookie(name, options)),
        };

        match &credential.refresh {
            Some(RefreshHandle::Secret(secret)) => {
                set(&self.names.refresh_token, Some(secret.clone()));
            }
            // The secret already sits in the cookie; this context cannot see it.
            Some(RefreshHandle::ServerHeld) => {}
            None => set(&self.names.refresh_token, None),
        }
        set(
            &self.names.user_id,
            credential.subject_id.as_ref().map(ToString::to_string),
        );
        set(&self.names.user_email, credential.subject_email.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GrantId, TokenGrant};

    fn config() -> SessionConfig {
        SessionConfig::new("https://api.example.com/".parse().unwrap())
    }

    fn store() -> (CredentialStore, Arc<SharedCookies>, Arc<MemoryKeyValueStore>) {
        let cookies = Arc::new(SharedCookies::new());
        let local = Arc::new(MemoryKeyValueStore::new());
        let store = CredentialStore::new(cookies.clone(), local.clone(), &config());
        (store, cookies, local)
    }

    fn registered() -> Credential {
        let now = from_epoch_ms(1_700_000_000_000).unwrap();
        let mut grant = TokenGrant::new("acc-1", "refresh-secret", 900)
            .with_user_type("premium")
            .with_subject(GrantId::Number(7), "kim@example.com");
        grant.full_name = Some("Kim".into());
        grant.subscription_status = Some("active".into());
        Credential::from_grant(grant, CredentialKind::Registered, now).unwrap()
    }

    #[test]
    fn empty_carriers_read_none() {
        let (store, _, _) = store();
        for carrier in Carrier::ALL {
            assert_eq!(store.read(carrier), None, "{carrier:?}");
        }
    }

    #[test]
    fn refresh_secret_never_reaches_visible_carriers() {
        let (store, cookies, local) = store();
        let cred = registered();
        let opts = store.default_options().clone();
        for carrier in Carrier::ALL {
            store.write(carrier, &cred, &opts).unwrap();
        }

        for name in store.names().client_visible() {
            assert_ne!(cookies.script_value(name).as_deref(), Some("refresh-secret"));
        }
        assert_eq!(cookies.script_value(&store.names().refresh_token), None);
        assert!(local.values().iter().all(|v| !v.contains("refresh-secret")));

        let server = store.read(Carrier::CookieHttpOnly).unwrap();
        assert_eq!(
            server.refresh.as_ref().and_then(RefreshHandle::secret),
            Some("refresh-secret")
        );
        assert_eq!(server.subject_id, Some(SubjectId("7".into())));
    }

    #[test]
    fn contradictory_visibility_is_rejected() {
        let (store, cookies, _) = store();
        let cred = registered();
        let exposed = store.default_options().clone().with_http_only(false);
        assert!(matches!(
            store.write(Carrier::CookieHttpOnly, &cred, &exposed),
            Err(Error::InputInvalid(_))
        ));
        assert!(cookies.is_empty());

        let hidden = store.default_options().clone().with_http_only(true);
        assert!(store.write(Carrier::CookieVisible, &cred, &hidden).is_err());
    }

    #[test]
    fn visible_cookie_roundtrip() {
        let (store, _, _) = store();
        let cred = registered();
        store
            .write(Carrier::CookieVisible, &cred, store.default_options())
            .unwrap();

        let view = store.read(Carrier::CookieVisible).unwrap();
        assert_eq!(view.kind, Some(CredentialKind::Registered));
        assert_eq!(view.access_token.as_deref(), Some("acc-1"));
        assert_eq!(view.expires_at, Some(cred.expires_at));
        let profile = view.profile.unwrap();
        assert_eq!(profile.user_type.as_deref(), Some("premium"));
        assert_eq!(profile.subscription_status.as_deref(), Some("active"));
    }

    #[test]
    fn malformed_expiry_cookie_reads_as_missing() {
        let (store, cookies, _) = store();
        cookies.apply_set_cookie("finboard.access-token=abc; Path=/");
        cookies.apply_set_cookie("finboard.expires-at=soon; Path=/");
        let view = store.read(Carrier::CookieVisible).unwrap();
        assert_eq!(view.access_token.as_deref(), Some("abc"));
        assert_eq!(view.expires_at, None);
    }

    #[test]
    fn clear_is_idempotent() {
        let (store, cookies, local) = store();
        let cred = registered();
        for carrier in Carrier::ALL {
            store.write(carrier, &cred, store.default_options()).unwrap();
        }
        store.clear_all();
        store.clear_all();
        assert!(cookies.is_empty());
        assert!(local.keys().is_empty());
        for carrier in Carrier::ALL {
            assert_eq!(store.read(carrier), None);
        }
    }

    #[test]
    fn fingerprint_survives_clears() {
        let (store, _, _) = store();
        let first = store.device_fingerprint("Mozilla/5.0 (Windows NT 10.0) Chrome/126.0 Safari/537.36");
        store.write_anonymous(&AnonymousRecord {
            access_token: Some("anon".into()),
            ..AnonymousRecord::default()
        });
        store.clear_all();
        store.clear_anonymous();

        assert!(store.read_anonymous().is_empty());
        let again = store.device_fingerprint("something else entirely");
        assert_eq!(first, again);
    }

    #[test]
    fn http_only_secret_ignored_when_script_visible() {
        let (store, cookies, _) = store();
        cookies.apply_set_cookie("finboard.refresh-token=leaked; Path=/");
        assert_eq!(store.read(Carrier::CookieHttpOnly), None);
    }
}
