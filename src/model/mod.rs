//! Value types shared by the index, the store and the controllers

pub mod condition;
pub mod keys;

pub use condition::{ConditionStatus, ReadinessCondition, ReadinessGate};
pub use keys::{Endpoint, ObjectKey, PodRef};
