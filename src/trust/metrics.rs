use super::TrustLevel;
use crate::shared::ids::UserId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MIN_INTERACTIONS: u64 = 3;
const COLLABORATIVE_MIN_INTERACTIONS: u64 = 10;
const COLLABORATIVE_MIN_SUCCESS_RATE: f64 = 0.8;
const COLLABORATIVE_MIN_FEEDBACK: f64 = 4.0;
const SUGGESTIVE_MIN_INTERACTIONS: u64 = 5;
const SUGGESTIVE_MIN_SUCCESS_RATE: f64 = 0.6;
const SUGGESTIVE_MIN_FEEDBACK: f64 = 3.5;

/// Fixed progression thresholds. `Autonomous` is never computed; it is
/// reserved for levels granted outside the calibrator.
pub fn compute_level(
    total_interactions: u64,
    successful_interactions: u64,
    average_feedback: Option<f64>,
) -> TrustLevel {
    if total_interactions < MIN_INTERACTIONS {
        return TrustLevel::Observational;
    }
    let success_rate = successful_interactions as f64 / total_interactions as f64;
    // No scored interaction yet means no feedback-based progression.
    let feedback = average_feedback.unwrap_or(0.0);

    if success_rate >= COLLABORATIVE_MIN_SUCCESS_RATE
        && feedback >= COLLABORATIVE_MIN_FEEDBACK
        && total_interactions >= COLLABORATIVE_MIN_INTERACTIONS
    {
        TrustLevel::Collaborative
    } else if success_rate >= SUGGESTIVE_MIN_SUCCESS_RATE
        && feedback >= SUGGESTIVE_MIN_FEEDBACK
        && total_interactions >= SUGGESTIVE_MIN_INTERACTIONS
    {
        TrustLevel::Suggestive
    } else {
        TrustLevel::Observational
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionTally {
    pub total: u64,
    pub successful: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustMetrics {
    pub user_id: UserId,
    pub total_interactions: u64,
    pub successful_interactions: u64,
    /// Running average over scored interactions only, within [1, 5].
    #[serde(default)]
    pub average_feedback_score: Option<f64>,
    #[serde(default)]
    pub feedback_count: u64,
    /// Level cached at the last calculation, used to detect changes.
    #[serde(default)]
    pub current_level: TrustLevel,
    pub last_calculated: i64,
    #[serde(default)]
    pub interactions_by_type: BTreeMap<String, InteractionTally>,
}

impl TrustMetrics {
    pub fn new(user_id: UserId, now: i64) -> Self {
        Self {
            user_id,
            total_interactions: 0,
            successful_interactions: 0,
            average_feedback_score: None,
            feedback_count: 0,
            current_level: TrustLevel::Observational,
            last_calculated: now,
            interactions_by_type: BTreeMap::new(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_interactions == 0 {
            return 0.0;
        }
        self.successful_interactions as f64 / self.total_interactions as f64
    }

    pub fn computed_level(&self) -> TrustLevel {
        compute_level(
            self.total_interactions,
            self.successful_interactions,
            self.average_feedback_score,
        )
    }

    /// Fold one outcome into the counters. The cached level is left alone so
    /// the caller can compare it against [`Self::computed_level`].
    pub(crate) fn apply_outcome(
        &mut self,
        success: bool,
        feedback_score: Option<f64>,
        interaction_type: &str,
        now: i64,
    ) {
        self.total_interactions += 1;
        if success {
            self.successful_interactions += 1;
        }
        if let Some(score) = feedback_score {
            self.feedback_count += 1;
            let n = self.feedback_count as f64;
            let previous = self.average_feedback_score.unwrap_or(0.0);
            self.average_feedback_score = Some((previous * (n - 1.0) + score) / n);
        }
        let tally = self
            .interactions_by_type
            .entry(interaction_type.to_string())
            .or_default();
        tally.total += 1;
        if success {
            tally.successful += 1;
        }
        self.last_calculated = now;
    }
}
