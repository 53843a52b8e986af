use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::clock::{epoch_ms, from_epoch_ms};
use crate::error::Error;

/// `user-type` marker value carried by non-authenticated (device-scoped) sessions.
pub const ANONYMOUS_USER_TYPE: &str = "anonym";

pub const REGISTERED_USER_TYPE: &str = "registered";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Anonymous,
    Registered,
}

impl CredentialKind {
    /// Classifies a `user-type` marker. Only the exact sentinel is anonymous.
    #[must_use]
    pub fn from_marker(marker: &str, anonymous_sentinel: &str) -> Self {
        if marker == anonymous_sentinel {
            Self::Anonymous
        } else {
            Self::Registered
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Registered => "registered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct SubjectId(pub String);

/// Stable per-browser identifier. Never conflated with [`SubjectId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string().to_lowercase())
    }
}

/// Identifies one execution context (a tab, a server request) on the sync channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
pub struct ContextId(pub Ulid);

impl ContextId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

/// How the holder of a credential can obtain a fresh one.
#[derive(Clone, PartialEq, Eq)]
pub enum RefreshHandle {
    Secret(String),
    /// Lives in a carrier this context cannot read.
    ServerHeld,
}

impl RefreshHandle {
    #[must_use]
    pub fn secret(&self) -> Option<&str> {
        match self {
            Self::Secret(s) => Some(s),
            Self::ServerHeld => None,
        }
    }
}

impl std::fmt::Debug for RefreshHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Secret(_) => f.write_str("Secret(<redacted>)"),
            Self::ServerHeld => f.write_str("ServerHeld"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<String>,
}

impl Profile {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// The authoritative answer to "who is this, and with which token".
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub kind: CredentialKind,
    pub access_token: String,
    pub refresh: Option<RefreshHandle>,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub subject_id: Option<SubjectId>,
    pub subject_email: Option<String>,
    pub profile: Profile,
}

impl Credential {
    /// Builds a credential from a backend grant received at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamUnavailable`] if the grant carries no access token.
    pub fn from_grant(
        grant: TokenGrant,
        kind: CredentialKind,
        now: OffsetDateTime,
    ) -> Result<Self, Error> {
        if grant.access_token.trim().is_empty() {
            return Err(Error::UpstreamUnavailable(
                "grant is missing access_token".into(),
            ));
        }
        // Carriers persist epoch milliseconds; keep the in-memory copy comparable.
        let now = from_epoch_ms(epoch_ms(now)).unwrap_or(now);
        let lifetime = i64::try_from(grant.expires_in).unwrap_or(i64::MAX);
        let expires_at = now
            .checked_add(time::Duration::seconds(lifetime))
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let refresh = grant
            .refresh_token
            .filter(|t| !t.is_empty())
            .map(RefreshHandle::Secret);

        Ok(Self {
            kind,
            access_token: grant.access_token,
            refresh,
            issued_at: now,
            expires_at,
            subject_id: grant.id.map(|id| SubjectId(id.to_string())),
            subject_email: grant.email.clone(),
            profile: Profile {
                full_name: grant.full_name,
                email: grant.email,
                subscription_status: grant.subscription_status,
                user_type: grant.user_type,
            },
        })
    }

    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.kind == CredentialKind::Registered
    }

    /// Value for the `user-type` cookie.
    #[must_use]
    pub fn user_type_marker<'a>(&'a self, anonymous_sentinel: &'a str) -> &'a str {
        match self.kind {
            CredentialKind::Anonymous => anonymous_sentinel,
            CredentialKind::Registered => self
                .profile
                .user_type
                .as_deref()
                .filter(|t| !t.is_empty() && *t != anonymous_sentinel)
                .unwrap_or(REGISTERED_USER_TYPE),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("access_token", &"<redacted>")
            .field("refresh", &self.refresh)
            .field("expires_at_ms", &epoch_ms(self.expires_at))
            .field("subject_id", &self.subject_id)
            .finish_non_exhaustive()
    }
}

/// Whatever one carrier holds of a credential. Every field may be missing.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PartialCredential {
    pub kind: Option<CredentialKind>,
    pub access_token: Option<String>,
    pub refresh: Option<RefreshHandle>,
    pub issued_at: Option<OffsetDateTime>,
    pub expires_at: Option<OffsetDateTime>,
    pub subject_id: Option<SubjectId>,
    pub subject_email: Option<String>,
    pub profile: Option<Profile>,
}

impl PartialCredential {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Fills every field missing in `self` from `other`.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self {
            kind: self.kind.or(other.kind),
            access_token: self.access_token.or(other.access_token),
            refresh: self.refresh.or(other.refresh),
            issued_at: self.issued_at.or(other.issued_at),
            expires_at: self.expires_at.or(other.expires_at),
            subject_id: self.subject_id.or(other.subject_id),
            subject_email: self.subject_email.or(other.subject_email),
            profile: self.profile.or(other.profile),
        }
    }
}

impl From<&Credential> for PartialCredential {
    fn from(c: &Credential) -> Self {
        Self {
            kind: Some(c.kind),
            access_token: Some(c.access_token.clone()),
            refresh: c.refresh.clone(),
            issued_at: Some(c.issued_at),
            expires_at: Some(c.expires_at),
            subject_id: c.subject_id.clone(),
            subject_email: c.subject_email.clone(),
            profile: Some(c.profile.clone()),
        }
    }
}

impl std::fmt::Debug for PartialCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartialCredential")
            .field("kind", &self.kind)
            .field("has_access_token", &self.access_token.is_some())
            .field("refresh", &self.refresh)
            .field("expires_at_ms", &self.expires_at.map(epoch_ms))
            .finish_non_exhaustive()
    }
}

/// Some endpoints send a number, some a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GrantId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for GrantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Successful response body shared by every auth and device endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub user_type: Option<String>,
    #[serde(default)]
    pub id: Option<GrantId>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub subscription_status: Option<String>,
}

impl TokenGrant {
    #[must_use]
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: u64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: Some(refresh_token.into()),
            expires_in,
            user_type: None,
            id: None,
            email: None,
            full_name: None,
            subscription_status: None,
        }
    }

    #[must_use]
    pub fn with_user_type(mut self, user_type: impl Into<String>) -> Self {
        self.user_type = Some(user_type.into());
        self
    }

    #[must_use]
    pub fn with_subject(mut self, id: GrantId, email: impl Into<String>) -> Self {
        self.id = Some(id);
        self.email = Some(email.into());
        self
    }
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .field("user_type", &self.user_type)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
