//! The visitor identity record and link authentication states.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Authentication state sent along with a known identifier when linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthState {
    #[default]
    Unknown,
    Authenticated,
    LoggedOut,
}

impl AuthState {
    /// Integer code used on the wire.
    pub fn code(&self) -> i32 {
        match self {
            AuthState::Unknown => 0,
            AuthState::Authenticated => 1,
            AuthState::LoggedOut => 2,
        }
    }

    /// Parse a wire code back into a state.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(AuthState::Unknown),
            1 => Some(AuthState::Authenticated),
            2 => Some(AuthState::LoggedOut),
            _ => None,
        }
    }
}

impl std::str::FromStr for AuthState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" | "0" => Ok(AuthState::Unknown),
            "authenticated" | "1" => Ok(AuthState::Authenticated),
            "logged-out" | "logged_out" | "2" => Ok(AuthState::LoggedOut),
            other => Err(format!("unknown auth state '{}'", other)),
        }
    }
}

/// Externally-issued visitor identity.
///
/// Presence is defined solely by a non-empty `id`. Records are replaced as a
/// whole; there are no partial field updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Opaque visitor identifier issued by the identity service.
    pub id: String,
    /// Data provider the record was linked through, if any.
    pub data_provider_id: Option<i64>,
    /// Seconds until the service expects a refresh.
    pub id_sync_ttl: Option<i64>,
    /// Region hint returned by the service.
    pub region: Option<i32>,
    /// Opaque auxiliary payload carried through unchanged.
    pub blob: String,
    /// Instant after which the record is considered stale.
    pub next_refresh_at: Timestamp,
}

impl IdentityRecord {
    /// Build a record from a service response; the refresh instant is derived
    /// from the sync TTL.
    pub fn from_service(
        id: impl Into<String>,
        id_sync_ttl: i64,
        region: i32,
        blob: impl Into<String>,
    ) -> Self {
        let next_refresh_at = Duration::try_seconds(id_sync_ttl)
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            id: id.into(),
            data_provider_id: None,
            id_sync_ttl: Some(id_sync_ttl),
            region: Some(region),
            blob: blob.into(),
            next_refresh_at,
        }
    }

    /// Synthesize a record from a caller-supplied id. It is stale from the
    /// start so that a background refresh fills in the remaining fields.
    pub fn from_override(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data_provider_id: None,
            id_sync_ttl: None,
            region: None,
            blob: String::new(),
            next_refresh_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Tag the record with the data provider used to link it.
    pub fn with_data_provider(mut self, data_provider_id: i64) -> Self {
        self.data_provider_id = Some(data_provider_id);
        self
    }

    /// Override the refresh instant.
    pub fn with_next_refresh_at(mut self, next_refresh_at: Timestamp) -> Self {
        self.next_refresh_at = next_refresh_at;
        self
    }

    /// Whether this record represents an identity at all.
    pub fn is_present(&self) -> bool {
        !self.id.is_empty()
    }

    /// Whether the refresh instant has passed as of `now`.
    pub fn is_stale_at(&self, now: Timestamp) -> bool {
        self.next_refresh_at < now
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_service_sets_refresh_from_ttl() {
        let before = Utc::now();
        let record = IdentityRecord::from_service("ecid", 100, 6, "blob");

        assert!(record.is_present());
        assert_eq!(record.id_sync_ttl, Some(100));
        assert_eq!(record.region, Some(6));
        assert!(record.next_refresh_at >= before + Duration::seconds(100));
        assert!(!record.is_stale());
    }

    #[test]
    fn test_override_record_is_immediately_stale() {
        let record = IdentityRecord::from_override("my_ecid");
        assert!(record.is_present());
        assert!(record.is_stale());
        assert_eq!(record.data_provider_id, None);
        assert!(record.blob.is_empty());
    }

    #[test]
    fn test_empty_id_is_not_present() {
        let record = IdentityRecord::from_override("");
        assert!(!record.is_present());
    }

    #[test]
    fn test_is_stale_at_boundary() {
        let now = Utc::now();
        let record = IdentityRecord::from_override("x").with_next_refresh_at(now);
        assert!(!record.is_stale_at(now));
        assert!(record.is_stale_at(now + Duration::milliseconds(1)));
    }

    #[test]
    fn test_auth_state_codes() {
        assert_eq!(AuthState::Unknown.code(), 0);
        assert_eq!(AuthState::Authenticated.code(), 1);
        assert_eq!(AuthState::LoggedOut.code(), 2);
        assert_eq!(AuthState::from_code(1), Some(AuthState::Authenticated));
        assert_eq!(AuthState::from_code(7), None);
        assert_eq!(AuthState::default(), AuthState::Unknown);
    }

    #[test]
    fn test_auth_state_parse() {
        assert_eq!("logged-out".parse::<AuthState>(), Ok(AuthState::LoggedOut));
        assert_eq!("Authenticated".parse::<AuthState>(), Ok(AuthState::Authenticated));
        assert!("bogus".parse::<AuthState>().is_err());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Presence depends on nothing but the id.
        #[test]
        fn prop_presence_is_non_empty_id(
            id in ".{0,40}",
            ttl in -1000i64..100_000i64,
            region in 0i32..20i32,
        ) {
            let record = IdentityRecord::from_service(id.clone(), ttl, region, "blob");
            prop_assert_eq!(record.is_present(), !id.is_empty());
        }

        /// Auth state codes survive a round trip through the wire integer.
        #[test]
        fn prop_auth_state_code_round_trip(code in 0i32..3i32) {
            let state = AuthState::from_code(code).unwrap();
            prop_assert_eq!(state.code(), code);
        }
    }
}
