//! Scripted [`AuthBackend`] for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::backend::AuthBackend;
use crate::config::SessionConfig;
use crate::device::DeviceInfo;
use crate::error::Error;
use crate::store::{CredentialStore, MemoryKeyValueStore, SharedCookies};
use crate::types::{DeviceId, TokenGrant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Endpoint {
    Login,
    GoogleSignIn,
    VerifyEmail,
    RefreshToken,
    Logout,
    RegisterDevice,
    RefreshAnonymous,
}

/// Answers each endpoint from a queue of scripted results and counts calls.
/// An empty queue answers `UpstreamUnavailable`.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    scripts: Mutex<HashMap<Endpoint, VecDeque<Result<TokenGrant, Error>>>>,
    calls: Mutex<HashMap<Endpoint, usize>>,
    gates: Mutex<HashMap<Endpoint, Arc<Semaphore>>>,
    seen: Mutex<Vec<(Endpoint, String)>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push(&self, endpoint: Endpoint, result: Result<TokenGrant, Error>) {
        self.scripts
            .lock()
            .entry(endpoint)
            .or_default()
            .push_back(result);
    }

    pub(crate) fn calls(&self, endpoint: Endpoint) -> usize {
        self.calls.lock().get(&endpoint).copied().unwrap_or(0)
    }

    /// Arguments (token, email, device id) each endpoint was called with.
    pub(crate) fn seen(&self, endpoint: Endpoint) -> Vec<String> {
        self.seen
            .lock()
            .iter()
            .filter(|(e, _)| *e == endpoint)
            .map(|(_, arg)| arg.clone())
            .collect()
    }

    /// Holds every call to `endpoint` until [`release`](Self::release).
    pub(crate) fn hold(&self, endpoint: Endpoint) {
        self.gates
            .lock()
            .insert(endpoint, Arc::new(Semaphore::new(0)));
    }

    pub(crate) fn release(&self, endpoint: Endpoint) {
        if let Some(gate) = self.gates.lock().get(&endpoint) {
            // Closing wakes every waiter, present and future.
            gate.close();
        }
    }

    async fn answer(&self, endpoint: Endpoint, arg: &str) -> Result<TokenGrant, Error> {
        *self.calls.lock().entry(endpoint).or_default() += 1;
        self.seen.lock().push((endpoint, arg.to_string()));

        let gate = self.gates.lock().get(&endpoint).cloned();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }

        self.scripts
            .lock()
            .get_mut(&endpoint)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(Error::UpstreamUnavailable("no scripted response".into())))
    }
}

impl AuthBackend for ScriptedBackend {
    async fn login(&self, email: &str, _password: &str) -> Result<TokenGrant, Error> {
        self.answer(Endpoint::Login, email).await
    }

    async fn google_sign_in(&self, id_token: &str) -> Result<TokenGrant, Error> {
        self.answer(Endpoint::GoogleSignIn, id_token).await
    }

    async fn verify_email(&self, email: &str, _code: &str) -> Result<TokenGrant, Error> {
        self.answer(Endpoint::VerifyEmail, email).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, Error> {
        self.answer(Endpoint::RefreshToken, refresh_token).await
    }

    async fn logout(&self, access_token: &str) -> Result<(), Error> {
        self.answer(Endpoint::Logout, access_token).await.map(|_| ())
    }

    async fn register_device(
        &self,
        device_id: &DeviceId,
        _info: &DeviceInfo,
    ) -> Result<TokenGrant, Error> {
        self.answer(Endpoint::RegisterDevice, &device_id.0).await
    }

    async fn refresh_anonymous(&self, refresh_token: &str) -> Result<TokenGrant, Error> {
        self.answer(Endpoint::RefreshAnonymous, refresh_token).await
    }
}

pub(crate) fn config() -> SessionConfig {
    SessionConfig::new("https://api.example.com/".parse().unwrap())
}

/// Carriers of one browser: cookie jar and client store shared by every tab.
pub(crate) struct Browser {
    pub(crate) cookies: Arc<SharedCookies>,
    pub(crate) local: Arc<MemoryKeyValueStore>,
}

impl Browser {
    pub(crate) fn new() -> Self {
        Self {
            cookies: Arc::new(SharedCookies::new()),
            local: Arc::new(MemoryKeyValueStore::new()),
        }
    }

    /// Carriers for one more tab of this browser.
    pub(crate) fn tab(&self) -> Arc<CredentialStore> {
        Arc::new(CredentialStore::new(
            self.cookies.clone(),
            self.local.clone(),
            &config(),
        ))
    }
}
