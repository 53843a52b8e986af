use std::collections::BTreeMap;

use axum_extra::extract::cookie::{Cookie, SameSite};
use parking_lot::RwLock;
use time::Duration;

use super::WriteOptions;

/// Cookie names for one deployment, all sharing a prefix (`<prefix>.access-token`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieNames {
    pub access_token: String,
    pub refresh_token: String,
    pub user_type: String,
    pub expires_at: String,
    pub user_id: String,
    pub user_email: String,
    pub user_name: String,
    pub subscription_status: String,
}

impl CookieNames {
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            access_token: format!("{prefix}.access-token"),
            refresh_token: format!("{prefix}.refresh-token"),
            user_type: format!("{prefix}.user-type"),
            expires_at: format!("{prefix}.expires-at"),
            user_id: format!("{prefix}.user-id"),
            user_email: format!("{prefix}.user-email"),
            user_name: format!("{prefix}.user-name"),
            subscription_status: format!("{prefix}.subscription-status"),
        }
    }

    /// Names readable by client script.
    #[must_use]
    pub fn client_visible(&self) -> [&str; 5] {
        [
            &self.access_token,
            &self.user_type,
            &self.expires_at,
            &self.user_name,
            &self.subscription_status,
        ]
    }

    /// Names only the server may read or write.
    #[must_use]
    pub fn server_only(&self) -> [&str; 3] {
        [&self.refresh_token, &self.user_id, &self.user_email]
    }
}

/// The same-origin cookie jar every tab of one browser shares.
///
/// Keeps full cookie attributes so the http-only split between what
/// client script and the server can see is observable.
#[derive(Debug, Default)]
pub struct SharedCookies {
    jar: RwLock<BTreeMap<String, Cookie<'static>>>,
}

impl SharedCookies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a cookie; a zero or negative `Max-Age` deletes it, as a browser would.
    pub fn set(&self, cookie: Cookie<'static>) {
        let expired = cookie.max_age().is_some_and(|age| age <= Duration::ZERO);
        let mut jar = self.jar.write();
        if expired {
            jar.remove(cookie.name());
        } else {
            jar.insert(cookie.name().to_string(), cookie);
        }
    }

    /// Applies one `Set-Cookie` header value. Returns `false` if it does not parse.
    pub fn apply_set_cookie(&self, header: &str) -> bool {
        match Cookie::parse(header.to_string()) {
            Ok(cookie) => {
                self.set(cookie.into_owned());
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring malformed Set-Cookie header");
                false
            }
        }
    }

    pub fn remove(&self, name: &str) {
        self.jar.write().remove(name);
    }

    /// Value as the server sees it (every cookie is sent with a request).
    #[must_use]
    pub fn value(&self, name: &str) -> Option<String> {
        self.jar.read().get(name).map(|c| c.value().to_string())
    }

    /// Value as client script sees it: http-only cookies are invisible.
    #[must_use]
    pub fn script_value(&self, name: &str) -> Option<String> {
        self.jar
            .read()
            .get(name)
            .filter(|c| c.http_only() != Some(true))
            .map(|c| c.value().to_string())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Cookie<'static>> {
        self.jar.read().get(name).cloned()
    }

    /// `Cookie` request header a browser would send for this jar.
    #[must_use]
    pub fn request_header(&self) -> String {
        self.jar
            .read()
            .values()
            .map(|c| format!("{}={}", c.name(), c.value()))
            .collect::<Vec<_>>()
            .join("; ")
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jar.read().is_empty()
    }
}

/// Cookie readable by client script.
pub(super) fn visible_cookie(name: &str, value: String, options: &WriteOptions) -> Cookie<'static> {
    build(name, value, false, options)
}

/// Cookie readable only by the server.
pub(super) fn http_only_cookie(
    name: &str,
    value: String,
    options: &WriteOptions,
) -> Cookie<'static> {
    build(name, value, true, options)
}

/// Removal cookie (empty value, `Max-Age=0`).
pub(super) fn removal_cookie(name: &str, options: &WriteOptions) -> Cookie<'static> {
    let mut cookie = Cookie::build((name.to_string(), ""))
        .path("/".to_string())
        .max_age(Duration::ZERO)
        .build();
    if let Some(domain) = &options.domain {
        cookie.set_domain(domain.clone());
    }
    cookie
}

fn build(name: &str, value: String, http_only: bool, options: &WriteOptions) -> Cookie<'static> {
    let mut builder = Cookie::build((name.to_string(), value))
        .http_only(http_only)
        .secure(options.secure)
        .same_site(options.same_site)
        .path("/".to_string());
    if let Some(max_age) = options.max_age {
        builder = builder.max_age(max_age);
    }
    let mut cookie = builder.build();
    if let Some(domain) = &options.domain {
        cookie.set_domain(domain.clone());
    }
    cookie
}

/// Default `SameSite` policy for every session cookie.
pub(super) const SAME_SITE: SameSite = SameSite::Lax;
