//! Precedence between the cookie carriers and the client-persistent mirror.
//!
//! Cookies are issued by the server and are the source of truth; the
//! client store is a cache. When both hold a token and the tokens differ,
//! the cache is ignored entirely and flagged stale so the caller overwrites it.

use time::OffsetDateTime;

use super::local::mirror_view;
use crate::types::{Credential, PartialCredential, Profile};

/// Which carrier the reconciled credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileSource {
    Cookie,
    Local,
    Nothing,
}

/// Result of [`reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub credential: Option<Credential>,
    pub source: ReconcileSource,
    /// The client store disagrees with the result and must be rewritten (or cleared).
    pub local_stale: bool,
}

/// Merges the cookie view and the client-store view into one credential.
///
/// - Cookie view holds an access token: it wins. Local fields only fill gaps
///   when the local token is the same token.
/// - No cookie token: the local view is used on its own, covering the window
///   in which a fresh server cookie is not yet visible to script.
/// - A view without access token, kind and expiry yields no credential.
#[must_use]
pub fn reconcile(
    cookie_view: Option<PartialCredential>,
    local_view: Option<PartialCredential>,
    now: OffsetDateTime,
) -> Reconciled {
    let cookie = cookie_view.filter(|c| c.access_token.is_some());
    let local = local_view.filter(|l| !l.is_empty());

    match cookie {
        Some(cookie) => {
            let merged = match &local {
                Some(l) if l.access_token == cookie.access_token => merge(cookie, l.clone()),
                _ => cookie,
            };
            let credential = complete(merged, now);
            let local_stale = match &credential {
                Some(c) => local.as_ref() != Some(&mirror_view(c)),
                None => local.is_some(),
            };
            Reconciled {
                credential,
                source: ReconcileSource::Cookie,
                local_stale,
            }
        }
        None => match local {
            Some(local) => {
                let credential = complete(local, now);
                Reconciled {
                    local_stale: credential.is_none(),
                    credential,
                    source: ReconcileSource::Local,
                }
            }
            None => Reconciled {
                credential: None,
                source: ReconcileSource::Nothing,
                local_stale: false,
            },
        },
    }
}

fn merge(mut cookie: PartialCredential, mut local: PartialCredential) -> PartialCredential {
    let profile = match (cookie.profile.take(), local.profile.take()) {
        (Some(c), Some(l)) => Some(Profile {
            full_name: c.full_name.or(l.full_name),
            email: c.email.or(l.email),
            subscription_status: c.subscription_status.or(l.subscription_status),
            user_type: c.user_type.or(l.user_type),
        }),
        (c, l) => c.or(l),
    };
    let mut merged = cookie.or(local);
    merged.profile = profile;
    merged
}

fn complete(view: PartialCredential, now: OffsetDateTime) -> Option<Credential> {
    let access_token = view.access_token.filter(|t| !t.is_empty())?;
    Some(Credential {
        kind: view.kind?,
        access_token,
        refresh: view.refresh,
        issued_at: view.issued_at.unwrap_or(now),
        expires_at: view.expires_at?,
        subject_id: view.subject_id,
        subject_email: view.subject_email,
        profile: view.profile.unwrap_or_default(),
    })
}
