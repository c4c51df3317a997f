use super::{
    TrustError, TrustLevel, TrustMetrics, TrustMetricsStore, TrustNotification, TrustNotifier,
};
use crate::shared::clock::Clock;
use crate::shared::ids::UserId;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRecord {
    pub metrics: TrustMetrics,
    pub level_changed: bool,
    pub new_level: TrustLevel,
    pub notification: Option<TrustNotification>,
}

pub struct TrustCalibrator {
    store: Arc<dyn TrustMetricsStore>,
    notifier: Arc<dyn TrustNotifier>,
    clock: Arc<dyn Clock>,
    update_lock: Mutex<()>,
}

impl TrustCalibrator {
    pub fn new(
        store: Arc<dyn TrustMetricsStore>,
        notifier: Arc<dyn TrustNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            update_lock: Mutex::new(()),
        }
    }

    /// Level recomputed from stored metrics; unknown users are `Observational`.
    pub fn current_level(&self, user_id: &UserId) -> Result<TrustLevel, TrustError> {
        Ok(self
            .store
            .load(user_id)?
            .map(|metrics| metrics.computed_level())
            .unwrap_or(TrustLevel::Observational))
    }

    pub fn metrics(&self, user_id: &UserId) -> Result<Option<TrustMetrics>, TrustError> {
        self.store.load(user_id)
    }

    pub fn record_outcome(
        &self,
        user_id: &UserId,
        success: bool,
        feedback_score: Option<f64>,
        interaction_type: &str,
    ) -> Result<OutcomeRecord, TrustError> {
        if let Some(score) = feedback_score {
            if !score.is_finite() || !(1.0..=5.0).contains(&score) {
                return Err(TrustError::InvalidFeedback { score });
            }
        }
        let interaction_type = interaction_type.trim();
        if interaction_type.is_empty() {
            return Err(TrustError::EmptyInteractionType);
        }

        // Load-modify-store must not interleave for one calibrator.
        let _guard = self
            .update_lock
            .lock()
            .map_err(|_| TrustError::LockPoisoned)?;
        let now = self.clock.now_ms();
        let mut metrics = self
            .store
            .load(user_id)?
            .unwrap_or_else(|| TrustMetrics::new(user_id.clone(), now));
        metrics.apply_outcome(success, feedback_score, interaction_type, now);

        let old_level = metrics.current_level;
        let new_level = metrics.computed_level();
        metrics.current_level = new_level;
        self.store.store(&metrics)?;

        let level_changed = old_level != new_level;
        let notification = if level_changed {
            let notification = TrustNotification {
                user_id: user_id.clone(),
                old_level,
                new_level,
                trigger_event: interaction_type.to_string(),
                timestamp: now,
            };
            tracing::info!(
                user_id = %user_id,
                old_level = %old_level,
                new_level = %new_level,
                trigger = interaction_type,
                "trust level changed"
            );
            self.notifier.notify(&notification);
            Some(notification)
        } else {
            None
        };

        Ok(OutcomeRecord {
            metrics,
            level_changed,
            new_level,
            notification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::clock::ManualClock;
    use crate::trust::{MemoryNotifier, MemoryTrustStore};

    fn calibrator() -> (TrustCalibrator, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::new());
        let calibrator = TrustCalibrator::new(
            Arc::new(MemoryTrustStore::new()),
            notifier.clone(),
            Arc::new(ManualClock::new(1_000)),
        );
        (calibrator, notifier)
    }

    #[test]
    fn out_of_range_feedback_is_rejected_without_recording() {
        let (calibrator, _) = calibrator();
        let user = UserId::parse("u-1").expect("user");
        let err = calibrator
            .record_outcome(&user, true, Some(5.5), "assessment")
            .expect_err("score above range");
        assert!(matches!(err, TrustError::InvalidFeedback { .. }));
        assert!(calibrator.metrics(&user).expect("metrics").is_none());
    }

    #[test]
    fn level_change_emits_one_notification() {
        let (calibrator, notifier) = calibrator();
        let user = UserId::parse("u-1").expect("user");
        for _ in 0..4 {
            let record = calibrator
                .record_outcome(&user, true, Some(4.5), "assessment")
                .expect("record");
            assert!(!record.level_changed);
        }
        let record = calibrator
            .record_outcome(&user, true, Some(4.5), "assessment")
            .expect("fifth");
        assert!(record.level_changed);
        assert_eq!(record.new_level, TrustLevel::Suggestive);

        let delivered = notifier.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].old_level, TrustLevel::Observational);
        assert_eq!(delivered[0].new_level, TrustLevel::Suggestive);
        assert_eq!(delivered[0].trigger_event, "assessment");
        assert_eq!(delivered[0].timestamp, 1_000);
    }

    #[test]
    fn worsening_outcomes_regress_the_level() {
        let (calibrator, notifier) = calibrator();
        let user = UserId::parse("u-1").expect("user");
        for _ in 0..5 {
            calibrator
                .record_outcome(&user, true, Some(3.6), "assessment")
                .expect("record");
        }
        assert_eq!(
            calibrator.current_level(&user).expect("level"),
            TrustLevel::Suggestive
        );
        let record = calibrator
            .record_outcome(&user, false, Some(1.0), "assessment")
            .expect("failure");
        assert_eq!(record.new_level, TrustLevel::Observational);
        assert_eq!(notifier.delivered().len(), 2);
    }
}
