//! Sideline identity and request/payload types.

pub mod controller;
pub mod coordinator;
pub mod factory;
pub mod virtual_source;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::log::OffsetMap;
use crate::messaging::filter::FilterStep;

/// Identifier of one sideline request. Generated when a sideline starts and
/// stable across restarts through its string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SidelineId(String);

impl SidelineId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SidelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SidelineId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Whether a persisted request marks the start or the stop of a sideline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SidelineType {
    Start,
    Stop,
}

/// An operator request to divert (or stop diverting) matching records.
#[derive(Debug, Clone, PartialEq)]
pub struct SidelineRequest {
    pub steps: Vec<FilterStep>,
}

impl SidelineRequest {
    pub fn new(steps: Vec<FilterStep>) -> Self {
        Self { steps }
    }
}

/// Fully reconstituted sideline state for one identifier, assembled from the
/// per-partition records the persistence adapter stores.
#[derive(Debug, Clone, PartialEq)]
pub struct SidelinePayload {
    pub sideline_type: SidelineType,
    pub id: SidelineId,
    pub steps: Vec<FilterStep>,
    pub starting_state: OffsetMap,
    /// Absent while the sideline is still active (START payloads).
    pub ending_state: Option<OffsetMap>,
}
