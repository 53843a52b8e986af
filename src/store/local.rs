use std::collections::HashMap;

use parking_lot::RwLock;
use time::OffsetDateTime;

use crate::clock::{epoch_ms, from_epoch_ms};
use crate::types::{Credential, CredentialKind, PartialCredential, Profile, RefreshHandle};

/// Client-side persistent key/value storage shared by every tab of one origin.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

/// In-process [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn values(&self) -> Vec<String> {
        self.entries.read().values().cloned().collect()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries.write().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

/// Keys of the client-persistent carrier.
#[derive(Debug, Clone)]
pub(crate) struct LocalKeys {
    pub(crate) access_token: String,
    pub(crate) has_refresh: String,
    pub(crate) kind: String,
    pub(crate) issued_at: String,
    pub(crate) expires_at: String,
    pub(crate) profile: String,
    pub(crate) anon_access_token: String,
    pub(crate) anon_refresh_token: String,
    pub(crate) anon_expires_in: String,
    pub(crate) anon_timestamp: String,
    pub(crate) device: String,
}

impl LocalKeys {
    pub(crate) fn new(prefix: &str) -> Self {
        Self {
            access_token: format!("{prefix}.access_token"),
            has_refresh: format!("{prefix}.has_refresh"),
            kind: format!("{prefix}.kind"),
            issued_at: format!("{prefix}.issued_at"),
            expires_at: format!("{prefix}.expires_at"),
            profile: format!("{prefix}.profile"),
            anon_access_token: format!("{prefix}.anon.access_token"),
            anon_refresh_token: format!("{prefix}.anon.refresh_token"),
            anon_expires_in: format!("{prefix}.anon.expires_in"),
            anon_timestamp: format!("{prefix}.anon.timestamp"),
            device: format!("{prefix}.device"),
        }
    }

    pub(crate) fn session(&self) -> [&str; 6] {
        [
            &self.access_token,
            &self.has_refresh,
            &self.kind,
            &self.issued_at,
            &self.expires_at,
            &self.profile,
        ]
    }

    pub(crate) fn anonymous(&self) -> [&str; 4] {
        [
            &self.anon_access_token,
            &self.anon_refresh_token,
            &self.anon_expires_in,
            &self.anon_timestamp,
        ]
    }
}

/// The anonymous quadruple kept in the client store: tokens, lifetime in
/// seconds, and the time they were received.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AnonymousRecord {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub timestamp: Option<OffsetDateTime>,
}

impl AnonymousRecord {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// `timestamp + expires_in`, when both are known.
    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        let lifetime = i64::try_from(self.expires_in?).ok()?;
        self.timestamp?
            .checked_add(time::Duration::seconds(lifetime))
    }
}

impl std::fmt::Debug for AnonymousRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnonymousRecord")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("timestamp_ms", &self.timestamp.map(epoch_ms))
            .finish()
    }
}

fn parse_ms(value: Option<String>) -> Option<OffsetDateTime> {
    value?.trim().parse::<i64>().ok().and_then(from_epoch_ms)
}

fn parse_kind(value: Option<String>) -> Option<CredentialKind> {
    match value?.as_str() {
        "anonymous" => Some(CredentialKind::Anonymous),
        "registered" => Some(CredentialKind::Registered),
        _ => None,
    }
}

/// Reads the session mirror. Malformed fields read as missing.
pub(crate) fn read_session(store: &dyn KeyValueStore, keys: &LocalKeys) -> PartialCredential {
    let has_refresh = store.get(&keys.has_refresh).as_deref() == Some("true");
    PartialCredential {
        kind: parse_kind(store.get(&keys.kind)),
        access_token: store.get(&keys.access_token).filter(|t| !t.is_empty()),
        refresh: has_refresh.then_some(RefreshHandle::ServerHeld),
        issued_at: parse_ms(store.get(&keys.issued_at)),
        expires_at: parse_ms(store.get(&keys.expires_at)),
        subject_id: None,
        subject_email: None,
        profile: store
            .get(&keys.profile)
            .and_then(|json| serde_json::from_str::<Profile>(&json).ok()),
    }
}

/// Writes the session mirror. The refresh secret is never written; only
/// whether one exists.
pub(crate) fn write_session(
    store: &dyn KeyValueStore,
    keys: &LocalKeys,
    credential: &Credential,
) -> Result<(), serde_json::Error> {
    let profile = serde_json::to_string(&credential.profile)?;
    store.set(&keys.access_token, credential.access_token.clone());
    store.set(&keys.has_refresh, credential.refresh.is_some().to_string());
    store.set(&keys.kind, credential.kind.as_str().to_string());
    store.set(&keys.issued_at, epoch_ms(credential.issued_at).to_string());
    store.set(&keys.expires_at, epoch_ms(credential.expires_at).to_string());
    store.set(&keys.profile, profile);
    Ok(())
}

/// What [`read_session`] returns right after [`write_session`] of `credential`.
pub(crate) fn mirror_view(credential: &Credential) -> PartialCredential {
    PartialCredential {
        kind: Some(credential.kind),
        access_token: Some(credential.access_token.clone()),
        refresh: credential.refresh.as_ref().map(|_| RefreshHandle::ServerHeld),
        issued_at: Some(credential.issued_at),
        expires_at: Some(credential.expires_at),
        subject_id: None,
        subject_email: None,
        profile: Some(credential.profile.clone()),
    }
}

pub(crate) fn read_anonymous(store: &dyn KeyValueStore, keys: &LocalKeys) -> AnonymousRecord {
    AnonymousRecord {
        access_token: store.get(&keys.anon_access_token).filter(|t| !t.is_empty()),
        refresh_token: store.get(&keys.anon_refresh_token).filter(|t| !t.is_empty()),
        expires_in: store
            .get(&keys.anon_expires_in)
            .and_then(|v| v.trim().parse().ok()),
        timestamp: parse_ms(store.get(&keys.anon_timestamp)),
    }
}

/// Overwrites the whole quadruple; fields absent from `record` are removed.
pub(crate) fn write_anonymous(store: &dyn KeyValueStore, keys: &LocalKeys, record: &AnonymousRecord) {
    let values = [
        (&keys.anon_access_token, record.access_token.clone()),
        (&keys.anon_refresh_token, record.refresh_token.clone()),
        (&keys.anon_expires_in, record.expires_in.map(|s| s.to_string())),
        (
            &keys.anon_timestamp,
            record.timestamp.map(|t| epoch_ms(t).to_string()),
        ),
    ];
    for (key, value) in values {
        match value {
            Some(value) => store.set(key, value),
            None => store.remove(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenGrant;

    fn keys() -> LocalKeys {
        LocalKeys::new("fb")
    }

    fn credential() -> Credential {
        let now = from_epoch_ms(1_700_000_000_000).unwrap();
        let mut grant = TokenGrant::new("acc-1", "refresh-secret", 900);
        grant.full_name = Some("Kim Analyst".into());
        Credential::from_grant(grant, CredentialKind::Registered, now).unwrap()
    }

    #[test]
    fn session_mirror_never_holds_refresh_secret() {
        let store = MemoryKeyValueStore::new();
        write_session(&store, &keys(), &credential()).unwrap();

        assert!(store.values().iter().all(|v| !v.contains("refresh-secret")));
        assert_eq!(store.get("fb.has_refresh").as_deref(), Some("true"));
    }

    #[test]
    fn mirror_view_matches_read_back() {
        let store = MemoryKeyValueStore::new();
        let cred = credential();
        write_session(&store, &keys(), &cred).unwrap();
        assert_eq!(read_session(&store, &keys()), mirror_view(&cred));
    }

    #[test]
    fn malformed_fields_read_as_missing() {
        let store = MemoryKeyValueStore::new();
        store.set("fb.access_token", "acc".into());
        store.set("fb.expires_at", "tomorrow".into());
        store.set("fb.kind", "admin".into());
        store.set("fb.profile", "{not json".into());

        let view = read_session(&store, &keys());
        assert_eq!(view.access_token.as_deref(), Some("acc"));
        assert_eq!(view.expires_at, None);
        assert_eq!(view.kind, None);
        assert_eq!(view.profile, None);
    }

    #[test]
    fn anonymous_write_overwrites_whole_record() {
        let store = MemoryKeyValueStore::new();
        let first = AnonymousRecord {
            access_token: Some("a1".into()),
            refresh_token: Some("r1".into()),
            expires_in: Some(60),
            timestamp: from_epoch_ms(1_000),
        };
        write_anonymous(&store, &keys(), &first);
        assert_eq!(read_anonymous(&store, &keys()), first);

        let second = AnonymousRecord {
            access_token: Some("a2".into()),
            ..AnonymousRecord::default()
        };
        write_anonymous(&store, &keys(), &second);
        assert_eq!(read_anonymous(&store, &keys()), second);
    }

    #[test]
    fn anonymous_expiry_is_timestamp_plus_lifetime() {
        let record = AnonymousRecord {
            expires_in: Some(120),
            timestamp: from_epoch_ms(10_000),
            ..AnonymousRecord::default()
        };
        assert_eq!(record.expires_at().map(epoch_ms), Some(130_000));
        assert_eq!(AnonymousRecord::default().expires_at(), None);
    }
}
