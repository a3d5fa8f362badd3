//! Visitor Core - Identity Types
//!
//! Data structures shared by every visitor crate: the identity record,
//! authentication states, error enums and configuration.
//! This crate contains no I/O beyond reading configuration files.

pub mod config;
pub mod error;
pub mod record;

pub use config::{LinkParams, VisitorConfig};
pub use error::{
    ConfigError, ErrorKind, ServiceError, ServiceResult, StorageError, VisitorError,
    VisitorResult,
};
pub use record::{AuthState, IdentityRecord, Timestamp};

// ============================================================================
// WIRE CONSTANTS
// ============================================================================

/// Version of the identity service protocol.
pub const API_VERSION: u32 = 2;

/// Default identity service endpoint.
pub const DEFAULT_SERVICE_URL: &str = "https://dpm.demdex.net/id";

/// Separator between the parts of a `d_cid` value (decoded `%01`).
pub const DATA_PROVIDER_ID_SEPARATOR: char = '\u{1}';

pub const QP_EXPERIENCE_CLOUD_ID: &str = "d_mid";
pub const QP_ORG_ID: &str = "d_orgid";
pub const QP_DATA_PROVIDER_ID: &str = "d_cid";
pub const QP_REGION: &str = "dcs_region";
pub const QP_ENCRYPTED_META_DATA: &str = "d_blob";
pub const QP_VERSION: &str = "d_ver";
pub const QP_ID_SYNC_TTL: &str = "id_sync_ttl";

// ============================================================================
// OUTBOUND DECORATION
// ============================================================================

/// Query parameter carrying the identity fragment on decorated URLs.
pub const QP_ADOBE_MC: &str = "adobe_mc";
pub const QP_VISITOR_ID: &str = "visitor-id";
pub const QP_DECORATION_ORG_ID: &str = "org-id";
pub const QP_TIMESTAMP: &str = "ts";

/// Key written into outbound dispatch maps.
pub const DISPATCH_IDENTITY_KEY: &str = "identity_id";

/// Defaults applied when configuration omits a value.
pub const DEFAULT_MAX_RETRIES: i32 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1000;
