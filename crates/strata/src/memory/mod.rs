//! Core memory domain: entities, decay math, and the rule maturity engine.

pub mod decay;
pub mod maturity;
pub mod types;

pub use decay::{DecayAction, DecayThresholds, decay_action, effective_confidence};
pub use maturity::{Feedback, MaturityChange, apply_feedback, effectiveness};
pub use types::{
    ConsolidationStatus, EntityKind, EntityRef, Episode, Fact, GLOBAL_SCOPE, Maturity,
    MemoryEvent, MemoryLink, Permanence, RelationKind, Rule, Validity,
};
