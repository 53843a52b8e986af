use axum_extra::extract::CookieJar;
use time::OffsetDateTime;

use super::types::AuthSummary;
use crate::clock::from_epoch_ms;
use crate::config::SessionConfig;
use crate::store::{CookieNames, SharedCookies};
use crate::types::CredentialKind;

/// What the server can see of a session at request time: cookies only.
///
/// Holds presence flags, never token values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCredentialFacts {
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    pub user_type: Option<String>,
    /// Raw `expires-at` cookie value (epoch milliseconds, unvalidated).
    pub expires_at: Option<String>,
    pub subscription_status: Option<String>,
}

impl RequestCredentialFacts {
    /// Builds facts from any cookie lookup.
    pub fn from_lookup(names: &CookieNames, lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            has_access_token: lookup(&names.access_token).is_some_and(|v| !v.is_empty()),
            has_refresh_token: lookup(&names.refresh_token).is_some_and(|v| !v.is_empty()),
            user_type: lookup(&names.user_type).filter(|v| !v.is_empty()),
            expires_at: lookup(&names.expires_at),
            subscription_status: lookup(&names.subscription_status).filter(|v| !v.is_empty()),
        }
    }

    #[must_use]
    pub fn from_jar(names: &CookieNames, jar: &CookieJar) -> Self {
        Self::from_lookup(names, |name| jar.get(name).map(|c| c.value().to_string()))
    }

    /// Facts as a request carrying this jar would present them.
    #[must_use]
    pub fn from_cookies(names: &CookieNames, cookies: &SharedCookies) -> Self {
        Self::from_lookup(names, |name| cookies.value(name))
    }
}

/// Outcome of [`RouteGuard::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow(AuthSummary),
    RedirectTo { location: String },
}

/// Request-time gate in front of protected paths.
#[derive(Debug, Clone)]
pub struct RouteGuard {
    protected_prefixes: Vec<String>,
    login_path: String,
    anonymous_sentinel: String,
    names: CookieNames,
}

impl RouteGuard {
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            protected_prefixes: config.protected_prefixes().to_vec(),
            login_path: config.login_path().to_string(),
            anonymous_sentinel: config.anonymous_sentinel().to_string(),
            names: CookieNames::new(config.cookie_prefix()),
        }
    }

    #[must_use]
    pub fn names(&self) -> &CookieNames {
        &self.names
    }

    /// `path` equals a protected prefix or continues it with `/`.
    #[must_use]
    pub fn is_protected(&self, path: &str) -> bool {
        self.protected_prefixes.iter().any(|prefix| {
            prefix == "/"
                || path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Access token present, kind marker present and not the anonymous
    /// sentinel, and a well-formed expiry in the future. Anything else,
    /// including a malformed expiry, is unauthenticated.
    #[must_use]
    pub fn is_authenticated(&self, facts: &RequestCredentialFacts, now: OffsetDateTime) -> bool {
        let Some(marker) = facts.user_type.as_deref() else {
            return false;
        };
        let expires_at = facts
            .expires_at
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .and_then(from_epoch_ms);
        facts.has_access_token
            && marker != self.anonymous_sentinel
            && expires_at.is_some_and(|at| at > now)
    }

    /// Non-sensitive summary handed to rendering logic.
    #[must_use]
    pub fn summarize(&self, facts: &RequestCredentialFacts, now: OffsetDateTime) -> AuthSummary {
        let kind = facts
            .user_type
            .as_deref()
            .filter(|_| facts.has_access_token)
            .map(|marker| CredentialKind::from_marker(marker, &self.anonymous_sentinel));
        AuthSummary {
            authenticated: self.is_authenticated(facts, now),
            kind,
            subscription_status: facts.subscription_status.clone(),
        }
    }

    /// Decides whether a request for `path_and_query` may proceed.
    #[must_use]
    pub fn evaluate(
        &self,
        facts: &RequestCredentialFacts,
        path_and_query: &str,
        now: OffsetDateTime,
    ) -> GuardDecision {
        let path = path_and_query
            .split_once('?')
            .map_or(path_and_query, |(path, _)| path);
        let summary = self.summarize(facts, now);

        if summary.authenticated || !self.is_protected(path) {
            return GuardDecision::Allow(summary);
        }
        GuardDecision::RedirectTo {
            location: self.login_location(path_and_query),
        }
    }

    /// Sign-in location carrying a same-origin `redirect` back to the request.
    fn login_location(&self, path_and_query: &str) -> String {
        let return_to = if path_and_query.starts_with('/') && !path_and_query.starts_with("//") {
            path_and_query
        } else {
            "/"
        };
        format!(
            "{}?redirect={}",
            self.login_path,
            urlencoding::encode(return_to)
        )
    }
}
