//! Account domain model
//!
//! An [`Account`] is one connected CRM portal: the credential pair used to
//! talk to it and the watermark reached by each entity kind.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OAuth credential pair for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// An unknown expiry counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| now > expires_at)
    }
}

/// Last successful sync instant per entity kind, keyed by watermark key.
pub type Watermarks = BTreeMap<String, DateTime<Utc>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub hub_id: i64,
    pub credentials: Credentials,
    #[serde(default)]
    pub watermarks: Watermarks,
}

impl Account {
    pub fn new(hub_id: i64, credentials: Credentials) -> Self {
        Self {
            hub_id,
            credentials,
            watermarks: Watermarks::new(),
        }
    }

    /// Watermark for `key`; `None` means the kind has never been synced.
    pub fn watermark(&self, key: &str) -> Option<DateTime<Utc>> {
        self.watermarks.get(key).copied()
    }

    /// Move the watermark for `key` to `instant`. Never moves it backwards;
    /// returns whether the stored value changed.
    pub fn advance_watermark(&mut self, key: &str, instant: DateTime<Utc>) -> bool {
        match self.watermarks.get(key) {
            Some(current) if *current >= instant => false,
            _ => {
                self.watermarks.insert(key.to_string(), instant);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn watermark_only_moves_forward() {
        let mut account = Account::new(1, Credentials::new("a", "r"));
        let now = Utc::now();

        assert_eq!(account.watermark("contacts"), None);
        assert!(account.advance_watermark("contacts", now));
        assert!(!account.advance_watermark("contacts", now - Duration::minutes(5)));
        assert_eq!(account.watermark("contacts"), Some(now));
        assert!(account.advance_watermark("contacts", now + Duration::seconds(1)));
    }

    #[test]
    fn unknown_expiry_is_expired() {
        let now = Utc::now();
        assert!(Credentials::new("a", "r").is_expired(now));
        assert!(
            Credentials::new("a", "r")
                .with_expiry(now - Duration::seconds(1))
                .is_expired(now)
        );
        assert!(
            !Credentials::new("a", "r")
                .with_expiry(now + Duration::minutes(30))
                .is_expired(now)
        );
    }
}
