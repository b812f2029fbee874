use abcnet_core::candidate::{AnyCandidate, PackedCandidate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One input event: candidate collections keyed by name
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub id: u64,
    pub collections: HashMap<String, Vec<AnyCandidate>>,
}

/// Products written for one event
#[derive(Debug, Clone, Serialize)]
pub struct EventProduct {
    pub id: u64,
    /// Pileup weight of every input candidate, in input order
    pub weights: Vec<f32>,
    pub candidates: Vec<PackedCandidate>,
}
