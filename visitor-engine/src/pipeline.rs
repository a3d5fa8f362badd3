//! Ordered handling of a single identity service completion.
//!
//! Every completion, whether from an acquisition attempt, a refresh or a
//! link, passes through the same steps in order:
//!
//! 1. **tag**: reject id-less records and stamp the data provider
//! 2. **apply**: replace and persist the record if its generation is current
//! 3. **signal**: release the attempt gate that is waiting on this call
//! 4. **forward**: hand the outcome to the caller's callback, if any

use std::sync::Arc;

use visitor_core::{IdentityRecord, ServiceError, ServiceResult};

use crate::gate::Gate;
use crate::manager::Shared;

/// Caller callback for a link operation.
pub type LinkCallback = Box<dyn FnOnce(&ServiceResult<IdentityRecord>) + Send + 'static>;

/// Which operation produced the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Acquisition,
    Refresh,
    Link,
}

impl Origin {
    fn as_str(&self) -> &'static str {
        match self {
            Origin::Acquisition => "acquisition",
            Origin::Refresh => "refresh",
            Origin::Link => "link",
        }
    }
}

pub(crate) struct ResponsePipeline<'a> {
    shared: &'a Shared,
    generation: u64,
    origin: Origin,
    data_provider_id: Option<i64>,
    attempt_gate: Option<Arc<Gate>>,
    callback: Option<LinkCallback>,
}

impl<'a> ResponsePipeline<'a> {
    pub(crate) fn new(shared: &'a Shared, generation: u64, origin: Origin) -> Self {
        Self {
            shared,
            generation,
            origin,
            data_provider_id: None,
            attempt_gate: None,
            callback: None,
        }
    }

    pub(crate) fn with_data_provider(mut self, data_provider_id: Option<i64>) -> Self {
        self.data_provider_id = data_provider_id;
        self
    }

    pub(crate) fn with_attempt_gate(mut self, gate: Arc<Gate>) -> Self {
        self.attempt_gate = Some(gate);
        self
    }

    pub(crate) fn with_callback(mut self, callback: Option<LinkCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Run every step. Returns whether the record was applied.
    pub(crate) fn run(self, result: ServiceResult<IdentityRecord>) -> bool {
        let result = self.tag(result);
        let applied = match &result {
            Ok(record) => self.apply(record),
            Err(e) => {
                tracing::debug!(
                    origin = self.origin.as_str(),
                    generation = self.generation,
                    error = %e,
                    "Identity request failed"
                );
                false
            }
        };
        self.signal(&result);
        self.forward(result);
        applied
    }

    fn tag(&self, result: ServiceResult<IdentityRecord>) -> ServiceResult<IdentityRecord> {
        let record = result?;
        if !record.is_present() {
            return Err(ServiceError::InvalidIdentityPayload {
                reason: "service returned an empty identity id".to_string(),
            });
        }
        Ok(match self.data_provider_id {
            Some(data_provider_id) => record.with_data_provider(data_provider_id),
            None => record,
        })
    }

    fn apply(&self, record: &IdentityRecord) -> bool {
        if !self.shared.replace_record(self.generation, record) {
            tracing::warn!(
                origin = self.origin.as_str(),
                generation = self.generation,
                "Discarding identity from a superseded generation"
            );
            return false;
        }
        tracing::info!(
            origin = self.origin.as_str(),
            generation = self.generation,
            "Identity record updated"
        );
        self.shared.drain_cycle(self.generation);
        true
    }

    fn signal(&self, result: &ServiceResult<IdentityRecord>) {
        if let Some(gate) = &self.attempt_gate {
            match result {
                Ok(_) => gate.drain_all(),
                Err(_) => gate.signal_one(),
            }
        }
    }

    fn forward(self, result: ServiceResult<IdentityRecord>) {
        if let Some(callback) = self.callback {
            callback(&result);
        }
    }
}
