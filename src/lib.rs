#![doc = include_str!("../README.md")]

pub mod anonymous;
pub mod backend;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod lease;
pub mod lifecycle;
pub mod middleware;
pub mod store;
pub mod sync;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use anonymous::{AnonymousDecision, AnonymousIdentity};
pub use backend::AuthBackend;
#[cfg(feature = "http")]
pub use backend::HttpBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SessionConfig, SyncSettings};
pub use device::{DeviceFingerprint, DeviceInfo};
pub use error::Error;
pub use lease::RefreshLease;
pub use lifecycle::{SessionManager, SessionState};
pub use store::{
    AnonymousRecord, Carrier, CookieNames, CredentialStore, KeyValueStore, MemoryKeyValueStore,
    SharedCookies, WriteOptions,
};
pub use sync::{SyncHub, SyncMessage, Synchronizer, Visibility};
pub use types::{
    ContextId, Credential, CredentialKind, DeviceId, PartialCredential, Profile, RefreshHandle,
    SubjectId, TokenGrant,
};
