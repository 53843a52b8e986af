//! Propagation of credential changes between execution contexts.
//!
//! One typed channel carries every change notification. Receivers never trust
//! the message payload for state; they re-read the carriers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backend::AuthBackend;
use crate::config::SyncSettings;
use crate::lifecycle::{SessionManager, SessionState};
use crate::types::{ContextId, CredentialKind};

const CHANNEL_CAPACITY: usize = 64;

/// Wire schema of the cross-context channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncMessage {
    /// The active credential changed; `kind` is `None` after a clear.
    CredentialChanged {
        kind: Option<CredentialKind>,
        origin: ContextId,
    },
}

impl SyncMessage {
    #[must_use]
    pub fn origin(&self) -> ContextId {
        match self {
            Self::CredentialChanged { origin, .. } => *origin,
        }
    }
}

/// Same-origin broadcast channel shared by every context of one browser.
#[derive(Debug, Clone)]
pub struct SyncHub {
    tx: broadcast::Sender<SyncMessage>,
}

impl Default for SyncHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncHub {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Sends to every subscriber. Returns how many received it.
    pub fn publish(&self, message: SyncMessage) -> usize {
        self.tx.send(message).unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.tx.subscribe()
    }
}

/// Foreground state of the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Keeps one context's session in step with the shared carriers.
///
/// Re-reads on foreign notifications (debounced), on a staggered schedule
/// after start, on a fixed poll, and whenever the context becomes visible.
pub struct Synchronizer<B> {
    session: SessionManager<B>,
    hub: SyncHub,
    settings: SyncSettings,
    resyncs: Arc<AtomicUsize>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<B> Drop for Synchronizer<B> {
    fn drop(&mut self) {
        if let Some((token, task)) = self.running.get_mut().take() {
            token.cancel();
            task.abort();
        }
    }
}

impl<B: AuthBackend> Synchronizer<B> {
    #[must_use]
    pub fn new(session: SessionManager<B>, hub: SyncHub, settings: SyncSettings) -> Self {
        Self {
            session,
            hub,
            settings,
            resyncs: Arc::new(AtomicUsize::new(0)),
            running: Mutex::new(None),
        }
    }

    /// Starts the background loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|(_, task)| !task.is_finished()) {
            return;
        }

        let token = self.session.shutdown_token().child_token();
        let task = tokio::spawn(run(
            self.session.clone(),
            self.hub.subscribe(),
            self.settings.clone(),
            Arc::clone(&self.resyncs),
            token.clone(),
        ));
        *running = Some((token, task));
        tracing::debug!(context = %self.session.context(), "Synchronizer started");
    }

    /// Stops the loop and waits for it to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some((token, task)) = running {
            token.cancel();
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Synchronizer task ended abnormally");
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

    /// Forces a re-read when the context comes to the foreground, in case the
    /// credential expired or changed while it was hidden.
    pub fn visibility_changed(&self, visibility: Visibility) -> Option<SessionState> {
        match visibility {
            Visibility::Visible => Some(resync(&self.session, &self.resyncs, "visible")),
            Visibility::Hidden => None,
        }
    }

    /// Re-reads performed so far.
    #[must_use]
    pub fn resyncs(&self) -> usize {
        self.resyncs.load(Ordering::SeqCst)
    }
}

fn resync<B: AuthBackend>(
    session: &SessionManager<B>,
    counter: &AtomicUsize,
    reason: &'static str,
) -> SessionState {
    counter.fetch_add(1, Ordering::SeqCst);
    let state = session.resync();
    tracing::debug!(reason, ?state, "Re-read credential carriers");
    state
}

async fn run<B: AuthBackend>(
    session: SessionManager<B>,
    mut rx: broadcast::Receiver<SyncMessage>,
    settings: SyncSettings,
    resyncs: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    let started = Instant::now();
    let mut mount_delays = settings.mount_delays.clone();
    mount_delays.sort();
    let mut mount_delays = mount_delays.into_iter();
    let mut next_mount = mount_delays.next();
    let mount = tokio::time::sleep_until(started + next_mount.unwrap_or_default());
    tokio::pin!(mount);

    let mut poll = tokio::time::interval_at(started + settings.poll_interval, settings.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            received = rx.recv() => {
                match received {
                    Ok(message) if message.origin() == session.context() => continue,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                // Collapse a burst into one re-read.
                tokio::select! {
                    () = tokio::time::sleep(settings.debounce) => {}
                    () = shutdown.cancelled() => break,
                }
                loop {
                    match rx.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                        Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                    }
                }
                resync(&session, &resyncs, "notification");
            }
            () = &mut mount, if next_mount.is_some() => {
                resync(&session, &resyncs, "mount");
                next_mount = mount_delays.next();
                if let Some(delay) = next_mount {
                    mount.as_mut().reset(started + delay);
                }
            }
            _ = poll.tick() => {
                resync(&session, &resyncs, "poll");
            }
        }
    }
    tracing::debug!(context = %session.context(), "Synchronizer stopped");
}
