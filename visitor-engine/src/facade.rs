//! Consumer-facing identity surfaces: URL decoration and outbound record
//! population.
//!
//! Neither surface calls the identity service directly. When no record is
//! present they go through [`IdentityManager::resolve_record`], which joins
//! or starts an acquisition cycle and waits at most
//! [`VisitorConfig::consumer_wait`](visitor_core::VisitorConfig::consumer_wait).

use std::collections::HashMap;

use chrono::Utc;
use reqwest::Url;
use serde_json::Value;
use visitor_core::{
    IdentityRecord, Timestamp, DISPATCH_IDENTITY_KEY, QP_ADOBE_MC, QP_DECORATION_ORG_ID,
    QP_TIMESTAMP, QP_VISITOR_ID,
};

use crate::manager::IdentityManager;

/// Outbound event payload keyed by field name.
pub type DispatchMap = HashMap<String, Value>;

#[derive(Debug, Clone)]
pub struct ConsumerFacade {
    manager: IdentityManager,
}

impl ConsumerFacade {
    pub fn new(manager: IdentityManager) -> Self {
        Self { manager }
    }

    /// Facade over the process-wide manager, if initialized.
    pub fn global() -> Option<Self> {
        IdentityManager::global().map(|manager| Self::new(manager.clone()))
    }

    pub fn manager(&self) -> &IdentityManager {
        &self.manager
    }

    fn resolve(&self) -> Option<IdentityRecord> {
        self.manager
            .resolve_record(self.manager.config().consumer_wait())
    }

    async fn resolve_async(&self) -> Option<IdentityRecord> {
        self.manager
            .resolve_record_async(self.manager.config().consumer_wait())
            .await
    }

    /// The decoration query pair for the current identity at `now`.
    pub fn query_parameter_at(&self, now: Timestamp) -> Option<(&'static str, String)> {
        let record = self.resolve()?;
        Some(decoration_pair(&record, self.manager.org_id(), now))
    }

    pub fn query_parameter(&self) -> Option<(&'static str, String)> {
        self.query_parameter_at(Utc::now())
    }

    /// Append the identity parameter to `url`, keeping existing parameters.
    /// The URL is returned unchanged when no identity is available or it
    /// cannot carry a query.
    ///
    /// A decorated URL comes back in its parsed form, so
    /// `HTTP://Example.COM:80` decorates to `http://example.com/?adobe_mc=...`.
    pub fn decorate_url_at(&self, url: &str, now: Timestamp) -> String {
        match self.resolve() {
            Some(record) => decorate(url, &record, self.manager.org_id(), now),
            None => url.to_string(),
        }
    }

    pub fn decorate_url(&self, url: &str) -> String {
        self.decorate_url_at(url, Utc::now())
    }

    pub async fn decorate_url_async(&self, url: &str) -> String {
        match self.resolve_async().await {
            Some(record) => decorate(url, &record, self.manager.org_id(), Utc::now()),
            None => url.to_string(),
        }
    }

    /// Set the identity key on an outbound record. Existing values are
    /// never replaced and the key is never set without an identity.
    /// Returns whether the map was changed.
    pub fn populate_outbound_record(&self, dispatch: &mut DispatchMap) -> bool {
        if dispatch.contains_key(DISPATCH_IDENTITY_KEY) {
            return false;
        }
        insert_identity(dispatch, self.resolve())
    }

    pub async fn populate_outbound_record_async(&self, dispatch: &mut DispatchMap) -> bool {
        if dispatch.contains_key(DISPATCH_IDENTITY_KEY) {
            return false;
        }
        insert_identity(dispatch, self.resolve_async().await)
    }
}

fn insert_identity(dispatch: &mut DispatchMap, record: Option<IdentityRecord>) -> bool {
    match record {
        Some(record) if record.is_present() => {
            dispatch.insert(DISPATCH_IDENTITY_KEY.to_string(), Value::String(record.id));
            true
        }
        _ => false,
    }
}

fn decoration_pair(record: &IdentityRecord, org_id: &str, now: Timestamp) -> (&'static str, String) {
    let value = format!(
        "{}={}&{}={}&{}={}",
        QP_VISITOR_ID,
        urlencoding::encode(&record.id),
        QP_DECORATION_ORG_ID,
        urlencoding::encode(org_id),
        QP_TIMESTAMP,
        now.timestamp()
    );
    (QP_ADOBE_MC, value)
}

pub(crate) fn decorate(url: &str, record: &IdentityRecord, org_id: &str, now: Timestamp) -> String {
    let mut parsed = match Url::parse(url) {
        Ok(parsed) if !parsed.cannot_be_a_base() => parsed,
        _ => {
            tracing::debug!(url, "Leaving undecoratable URL unchanged");
            return url.to_string();
        }
    };
    let (key, value) = decoration_pair(record, org_id, now);
    parsed.query_pairs_mut().append_pair(key, &value);
    parsed.to_string()
}
