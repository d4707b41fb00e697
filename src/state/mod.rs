//! Process-wide correlation state
//!
//! Both structures are cheap to clone handles over `parking_lot` locks and are
//! injected into every driver, so tests can build isolated instances.

pub mod correlation;
pub mod endpoint_index;

pub use correlation::{CorrelationStore, PodMatch, ServiceInfo, ServiceResolution};
pub use endpoint_index::EndpointIndex;
