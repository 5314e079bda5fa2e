//! Rate-limit admission control: the SlotQueue (C3) and RateLimitRegistry (C4).

mod registry;
mod slot_queue;
mod snapshot;

pub use registry::{ExecuteOutcome, Extractors, RateLimitRegistry};
pub use slot_queue::{SlotQueue, SlotQueueConfig};
pub use snapshot::RateLimitSnapshot;

use std::fmt;
use std::hash::Hash;

/// Provider identity for rate-limit purposes: `(id, label)` per `spec.md` §3.
/// Two entries with the same id but different labels are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderId {
    pub id: String,
    pub label: Option<String>,
}

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
        }
    }

    pub fn with_label(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: Some(label.into()),
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{}[{}]", self.id, label),
            None => write!(f, "{}", self.id),
        }
    }
}
