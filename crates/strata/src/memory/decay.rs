//! Confidence decay for facts and rules
//!
//! Confidence erodes exponentially with time since the last confirmation,
//! at a rate fixed by the item's permanence category. The daily sweep maps
//! effective confidence onto validity transitions through a single
//! decision function so every component ages items identically.

use chrono::{DateTime, Utc};

use crate::memory::types::Validity;

/// Thresholds for decay-driven lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayThresholds {
    /// Below this, items are hidden from recall and marked fading (default: 0.2)
    pub retrieval: f64,
    /// Below this, items reach their terminal decay state (default: 0.05)
    pub expiry: f64,
}

impl Default for DecayThresholds {
    fn default() -> Self {
        Self {
            retrieval: 0.2,
            expiry: 0.05,
        }
    }
}

/// What the sweep should do with an item at a given effective confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayAction {
    /// Confidence is healthy; restore to active if currently fading
    Keep,
    /// Below the retrieval threshold; mark fading
    Fade,
    /// Below the expiry threshold; facts expire, rules demote
    Expire,
}

/// Confidence discounted by elapsed time since last confirmation.
///
/// `confidence * exp(-decay_rate * days_since_confirmed)`. A decay rate of
/// 0.0 (permanent items) returns the stored confidence exactly for any
/// elapsed time. Clock skew producing a negative elapsed time is treated
/// as zero elapsed days.
pub fn effective_confidence(
    confidence: f64,
    decay_rate: f64,
    last_confirmed_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    if decay_rate == 0.0 {
        return confidence;
    }
    let elapsed_days = (now - last_confirmed_at).num_seconds().max(0) as f64 / 86_400.0;
    confidence * (-decay_rate * elapsed_days).exp()
}

/// Single authoritative decay decision used by the sweep and by recall
/// filtering.
pub fn decay_action(effective: f64, thresholds: &DecayThresholds) -> DecayAction {
    if effective >= thresholds.retrieval {
        DecayAction::Keep
    } else if effective >= thresholds.expiry {
        DecayAction::Fade
    } else {
        DecayAction::Expire
    }
}

/// Apply a decay action to a fact validity. Returns the new validity, or
/// `None` when no transition is needed. Only active and fading facts
/// participate in decay; superseded, expired, and retracted are final.
pub fn next_fact_validity(current: Validity, action: DecayAction) -> Option<Validity> {
    match (current, action) {
        (Validity::Fading, DecayAction::Keep) => Some(Validity::Active),
        (Validity::Active, DecayAction::Fade) => Some(Validity::Fading),
        (Validity::Active | Validity::Fading, DecayAction::Expire) => Some(Validity::Expired),
        _ => None,
    }
}
