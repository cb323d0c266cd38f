use crate::models::application::ApplicationStatus;
use crate::store::rules::{evidence_may_reach, is_permitted};

use super::Observation;

/// Picks the observation to act on: a status different from `current` that
/// the state machine allows evidence to reach, highest confidence first,
/// most recent on ties. Anything that would move backward is ignored.
pub fn fuse(current: ApplicationStatus, observations: &[Observation]) -> Option<&Observation> {
    observations
        .iter()
        .filter(|o| {
            o.status
                .map(|s| s != current && evidence_may_reach(s) && is_permitted(current, s))
                .unwrap_or(false)
        })
        .max_by(|a, b| {
            a.confidence
                .total_cmp(&b.confidence)
                .then_with(|| a.observed_at.cmp(&b.observed_at))
        })
}
