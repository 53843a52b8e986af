use serde::{Deserialize, Serialize};

use crate::types::DeviceId;

/// Coarse user-agent classification sent with anonymous registration and
/// exposed to rendering logic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub os: String,
    pub browser: String,
}

impl DeviceInfo {
    /// Classifies a `User-Agent` header. Unknown agents map to `"unknown"`.
    #[must_use]
    pub fn from_user_agent(user_agent: &str) -> Self {
        Self {
            os: classify_os(user_agent).into(),
            browser: classify_browser(user_agent).into(),
        }
    }

    #[must_use]
    pub fn unknown() -> Self {
        Self {
            os: "unknown".into(),
            browser: "unknown".into(),
        }
    }

    #[must_use]
    pub fn is_mobile(&self) -> bool {
        matches!(self.os.as_str(), "ios" | "android")
    }
}

// Order matters: iOS and Android agents also mention "Mac OS X" / "Linux".
fn classify_os(ua: &str) -> &'static str {
    if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
        "ios"
    } else if ua.contains("Android") {
        "android"
    } else if ua.contains("Windows") {
        "windows"
    } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
        "macos"
    } else if ua.contains("CrOS") {
        "chromeos"
    } else if ua.contains("Linux") {
        "linux"
    } else {
        "unknown"
    }
}

// Chromium derivatives all carry "Chrome/"; Chrome and Edge also carry "Safari/".
fn classify_browser(ua: &str) -> &'static str {
    if ua.contains("Edg/") || ua.contains("EdgA/") || ua.contains("EdgiOS/") {
        "edge"
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        "opera"
    } else if ua.contains("SamsungBrowser/") {
        "samsung"
    } else if ua.contains("Firefox/") || ua.contains("FxiOS/") {
        "firefox"
    } else if ua.contains("Chrome/") || ua.contains("CriOS/") {
        "chrome"
    } else if ua.contains("Safari/") {
        "safari"
    } else {
        "unknown"
    }
}

/// Stable per-browser identity used to scope anonymous credentials.
///
/// Created once per browser install and persisted in the client store; it is
/// never rotated, not even on logout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub device_id: DeviceId,
    pub info: DeviceInfo,
}

impl DeviceFingerprint {
    #[must_use]
    pub fn generate(user_agent: &str) -> Self {
        Self {
            device_id: DeviceId::generate(),
            info: DeviceInfo::from_user_agent(user_agent),
        }
    }
}
