use std::time::Duration;

use url::Url;

use crate::error::Error;
use crate::types::ANONYMOUS_USER_TYPE;

const MIN_REFRESH_MARGIN_SECS: i64 = 30;
const MAX_REFRESH_MARGIN_SECS: i64 = 60;

/// Timing of the cross-context re-read schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Delays after start at which the store is re-read, to absorb cookie
    /// propagation latency between a server response and client script.
    pub mount_delays: Vec<Duration>,
    /// Background poll period.
    pub poll_interval: Duration,
    /// Window within which a burst of notifications collapses into one re-read.
    pub debounce: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mount_delays: [50, 200, 500, 1000, 2000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            poll_interval: Duration::from_secs(30),
            debounce: Duration::from_millis(25),
        }
    }
}

/// Session core configuration.
///
/// Required field (`api_base`) is a constructor parameter; everything else
/// has a default and a `with_*` override.
///
/// Use [`from_env()`](SessionConfig::from_env) for convention-based setup.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub(crate) api_base: Url,
    pub(crate) cookie_prefix: String,
    pub(crate) cookie_domain: Option<String>,
    pub(crate) production: bool,
    pub(crate) cookie_max_age: time::Duration,
    pub(crate) refresh_margin: time::Duration,
    pub(crate) login_path: String,
    pub(crate) protected_prefixes: Vec<String>,
    pub(crate) anonymous_sentinel: String,
    pub(crate) google_timeout: Duration,
    pub(crate) sync: SyncSettings,
}

impl SessionConfig {
    #[must_use]
    pub fn new(api_base: Url) -> Self {
        Self {
            api_base,
            cookie_prefix: "finboard".into(),
            cookie_domain: None,
            production: false,
            cookie_max_age: time::Duration::days(30),
            refresh_margin: time::Duration::seconds(MAX_REFRESH_MARGIN_SECS),
            login_path: "/sign-in".into(),
            protected_prefixes: vec!["/app".into()],
            anonymous_sentinel: ANONYMOUS_USER_TYPE.into(),
            google_timeout: Duration::from_secs(30),
            sync: SyncSettings::default(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `FINBOARD_API_URL`: backend base URL
    ///
    /// # Optional env vars
    /// - `FINBOARD_COOKIE_PREFIX`: cookie name prefix (default `finboard`)
    /// - `FINBOARD_COOKIE_DOMAIN`: cookie domain, applied in production only
    /// - `APP_ENV`: `production` enables domain scoping and `Secure` cookies
    /// - `FINBOARD_REFRESH_MARGIN_SECS`: refresh safety margin, clamped to 30..=60
    /// - `FINBOARD_LOGIN_PATH`: sign-in path (default `/sign-in`)
    /// - `FINBOARD_PROTECTED_PREFIXES`: comma-separated protected path prefixes
    /// - `FINBOARD_GOOGLE_TIMEOUT_SECS`: Google exchange deadline (default 30)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required env vars are missing or values are invalid.
    pub fn from_env() -> Result<Self, Error> {
        let api_url = std::env::var("FINBOARD_API_URL")
            .map_err(|_| Error::Config("FINBOARD_API_URL is required".into()))?;
        let api_base: Url = api_url
            .parse()
            .map_err(|e| Error::Config(format!("FINBOARD_API_URL: {e}")))?;

        let mut config = Self::new(api_base);

        if let Ok(prefix) = std::env::var("FINBOARD_COOKIE_PREFIX") {
            config = config.with_cookie_prefix(prefix)?;
        }
        if let Ok(domain) = std::env::var("FINBOARD_COOKIE_DOMAIN") {
            config = config.with_cookie_domain(domain);
        }
        config = config.with_production(matches!(
            std::env::var("APP_ENV").as_deref(),
            Ok("production") | Ok("prod"),
        ));
        if let Ok(secs) = std::env::var("FINBOARD_REFRESH_MARGIN_SECS") {
            let secs: i64 = secs
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("FINBOARD_REFRESH_MARGIN_SECS: {e}")))?;
            config = config.with_refresh_margin(time::Duration::seconds(secs));
        }
        if let Ok(path) = std::env::var("FINBOARD_LOGIN_PATH") {
            config = config.with_login_path(path)?;
        }
        if let Ok(prefixes) = std::env::var("FINBOARD_PROTECTED_PREFIXES") {
            config = config.with_protected_prefixes(
                prefixes
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect(),
            )?;
        }
        if let Ok(secs) = std::env::var("FINBOARD_GOOGLE_TIMEOUT_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("FINBOARD_GOOGLE_TIMEOUT_SECS: {e}")))?;
            config = config.with_google_timeout(Duration::from_secs(secs));
        }

        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`Error::Config`] if the prefix is empty or contains cookie-unsafe characters.
    pub fn with_cookie_prefix(mut self, prefix: impl Into<String>) -> Result<Self, Error> {
        let prefix = prefix.into();
        let valid = !prefix.is_empty()
            && prefix
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        if !valid {
            return Err(Error::Config(format!("invalid cookie prefix: {prefix:?}")));
        }
        self.cookie_prefix = prefix;
        Ok(self)
    }

    #[must_use]
    pub fn with_cookie_domain(mut self, domain: impl Into<String>) -> Self {
        let domain = domain.into();
        self.cookie_domain = (!domain.trim().is_empty()).then(|| domain.trim().to_string());
        self
    }

    #[must_use]
    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    #[must_use]
    pub fn with_cookie_max_age(mut self, max_age: time::Duration) -> Self {
        self.cookie_max_age = max_age;
        self
    }

    /// Safety margin before expiry at which refresh fires; clamped to 30..=60 seconds.
    #[must_use]
    pub fn with_refresh_margin(mut self, margin: time::Duration) -> Self {
        self.refresh_margin = margin.clamp(
            time::Duration::seconds(MIN_REFRESH_MARGIN_SECS),
            time::Duration::seconds(MAX_REFRESH_MARGIN_SECS),
        );
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::Config`] unless the path is absolute (`/...`).
    pub fn with_login_path(mut self, path: impl Into<String>) -> Result<Self, Error> {
        let path = path.into();
        if !is_local_path(&path) {
            return Err(Error::Config(format!("login path must start with '/': {path}")));
        }
        self.login_path = path;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`Error::Config`] unless every prefix is an absolute path.
    pub fn with_protected_prefixes(mut self, prefixes: Vec<String>) -> Result<Self, Error> {
        if let Some(bad) = prefixes.iter().find(|p| !is_local_path(p)) {
            return Err(Error::Config(format!(
                "protected prefix must start with '/': {bad}"
            )));
        }
        self.protected_prefixes = prefixes
            .into_iter()
            .map(|p| {
                if p.len() > 1 {
                    p.trim_end_matches('/').to_string()
                } else {
                    p
                }
            })
            .collect();
        Ok(self)
    }

    #[must_use]
    pub fn with_google_timeout(mut self, timeout: Duration) -> Self {
        self.google_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_sync_settings(mut self, sync: SyncSettings) -> Self {
        self.sync = sync;
        self
    }

    #[must_use]
    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    #[must_use]
    pub fn cookie_prefix(&self) -> &str {
        &self.cookie_prefix
    }

    /// Cookie domain; only applied in production.
    #[must_use]
    pub fn effective_cookie_domain(&self) -> Option<&str> {
        if self.production {
            self.cookie_domain.as_deref()
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        self.production
    }

    #[must_use]
    pub fn cookie_max_age(&self) -> time::Duration {
        self.cookie_max_age
    }

    #[must_use]
    pub fn refresh_margin(&self) -> time::Duration {
        self.refresh_margin
    }

    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    #[must_use]
    pub fn protected_prefixes(&self) -> &[String] {
        &self.protected_prefixes
    }

    #[must_use]
    pub fn anonymous_sentinel(&self) -> &str {
        &self.anonymous_sentinel
    }

    #[must_use]
    pub fn google_timeout(&self) -> Duration {
        self.google_timeout
    }

    #[must_use]
    pub fn sync(&self) -> &SyncSettings {
        &self.sync
    }
}

fn is_local_path(path: &str) -> bool {
    path.starts_with('/') && !path.starts_with("//")
}
