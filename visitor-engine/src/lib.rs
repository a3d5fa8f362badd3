//! Visitor Engine - Identity Acquisition and Consumption
//!
//! Keeps one visitor identity per process. The [`IdentityManager`] decides
//! whether to reuse, refresh or acquire the identity and drives a bounded
//! retry loop against the identity service. Concurrent readers wait on a
//! [`Gate`] instead of issuing their own requests. The [`ConsumerFacade`]
//! exposes the identity to outbound URLs and event payloads.

pub mod facade;
pub mod gate;
pub mod manager;
mod pipeline;

pub use facade::{ConsumerFacade, DispatchMap};
pub use gate::{Gate, GateWait};
pub use manager::{AcquisitionState, IdentityManager, IdentityManagerBuilder};
pub use pipeline::LinkCallback;
