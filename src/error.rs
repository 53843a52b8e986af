/// `Clone` so one in-flight refresh can hand the same outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Invalid input: {0}")]
    InputInvalid(String),
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Credential expired")]
    CredentialExpired,
    #[error("Credential rejected: {0}")]
    CredentialInvalid(String),
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Message shown to the user, or `None` when the failure is handled silently.
    #[must_use]
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            Self::InputInvalid(_) => Some("Please check the highlighted fields."),
            Self::CredentialInvalid(_) => Some("Please sign in again."),
            Self::Timeout { .. } => Some("The request timed out. Please try again."),
            Self::UpstreamUnavailable(_) => Some("Service is temporarily unavailable."),
            Self::CredentialExpired | Self::Cancelled | Self::Config(_) => None,
        }
    }

    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        self.user_message().is_some()
    }
}
