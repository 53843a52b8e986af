use time::OffsetDateTime;

use crate::types::Credential;

/// When a credential expires and when it should be renewed.
///
/// Derived from the credential every time it is needed; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshLease {
    pub expires_at: OffsetDateTime,
    pub refresh_due_at: OffsetDateTime,
}

impl RefreshLease {
    #[must_use]
    pub fn new(expires_at: OffsetDateTime, margin: time::Duration) -> Self {
        Self {
            expires_at,
            refresh_due_at: expires_at
                .checked_sub(margin)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        }
    }

    #[must_use]
    pub fn for_credential(credential: &Credential, margin: time::Duration) -> Self {
        Self::new(credential.expires_at, margin)
    }

    #[must_use]
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.refresh_due_at <= now
    }

    /// Time left until refresh is due; zero when already due.
    #[must_use]
    pub fn delay_from(&self, now: OffsetDateTime) -> std::time::Duration {
        std::time::Duration::try_from(self.refresh_due_at - now).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_epoch_ms;

    fn at(secs: i64) -> OffsetDateTime {
        from_epoch_ms(secs * 1_000).unwrap()
    }

    #[test]
    fn due_time_is_expiry_minus_margin() {
        let lease = RefreshLease::new(at(1_000), time::Duration::seconds(60));
        assert_eq!(lease.refresh_due_at, at(940));
        assert!(!lease.is_due(at(939)));
        assert!(lease.is_due(at(940)));
        assert_eq!(lease.delay_from(at(900)), std::time::Duration::from_secs(40));
    }

    #[test]
    fn past_due_has_zero_delay() {
        // Expired 61 seconds ago with a 60 second margin.
        let lease = RefreshLease::new(at(1_000), time::Duration::seconds(60));
        assert!(lease.is_due(at(1_061)));
        assert_eq!(lease.delay_from(at(1_061)), std::time::Duration::ZERO);
    }
}
