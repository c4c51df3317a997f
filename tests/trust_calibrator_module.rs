use complyflow::shared::clock::{Clock, ManualClock};
use complyflow::shared::ids::UserId;
use complyflow::trust::{
    compute_level, MemoryNotifier, MemoryTrustStore, SqliteTrustStore, TrustCalibrator,
    TrustError, TrustLevel, TrustMetricsStore,
};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn user() -> UserId {
    UserId::parse("analyst-1").expect("user id")
}

fn calibrator(store: Arc<dyn TrustMetricsStore>) -> (TrustCalibrator, Arc<MemoryNotifier>) {
    let notifier = Arc::new(MemoryNotifier::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(5_000));
    (
        TrustCalibrator::new(store, notifier.clone(), clock),
        notifier,
    )
}

#[test]
fn level_is_a_pure_function_of_metrics() {
    assert_eq!(compute_level(10, 9, Some(4.2)), TrustLevel::Collaborative);
    assert_eq!(compute_level(10, 9, Some(4.2)), compute_level(10, 9, Some(4.2)));
    assert_eq!(compute_level(2, 2, Some(5.0)), TrustLevel::Observational);
    assert_eq!(compute_level(5, 5, Some(4.5)), TrustLevel::Suggestive);
    assert_eq!(compute_level(5, 5, None), TrustLevel::Observational);
    assert_eq!(compute_level(9, 9, Some(5.0)), TrustLevel::Suggestive);
}

#[test]
fn fifth_good_outcome_promotes_to_suggestive_once() {
    let (calibrator, notifier) = calibrator(Arc::new(MemoryTrustStore::new()));
    for round in 1..=5 {
        let record = calibrator
            .record_outcome(&user(), true, Some(4.5), "assessment")
            .expect("record outcome");
        assert_eq!(record.metrics.total_interactions, round);
        if round < 5 {
            assert_eq!(record.new_level, TrustLevel::Observational);
            assert!(!record.level_changed);
        }
    }

    assert_eq!(
        calibrator.current_level(&user()).expect("level"),
        TrustLevel::Suggestive
    );
    let delivered = notifier.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].old_level, TrustLevel::Observational);
    assert_eq!(delivered[0].new_level, TrustLevel::Suggestive);
    assert_eq!(delivered[0].trigger_event, "assessment");
    assert_eq!(delivered[0].timestamp, 5_000);

    let metrics = calibrator.metrics(&user()).expect("metrics").expect("stored");
    assert_eq!(metrics.average_feedback_score, Some(4.5));
    assert_eq!(metrics.interactions_by_type["assessment"].total, 5);
}

#[test]
fn invalid_inputs_leave_metrics_untouched() {
    let (calibrator, _) = calibrator(Arc::new(MemoryTrustStore::new()));
    let err = calibrator
        .record_outcome(&user(), true, Some(6.0), "assessment")
        .expect_err("score out of range");
    assert!(matches!(err, TrustError::InvalidFeedback { .. }));
    let err = calibrator
        .record_outcome(&user(), true, None, "  ")
        .expect_err("blank type");
    assert!(matches!(err, TrustError::EmptyInteractionType));
    assert!(calibrator.metrics(&user()).expect("metrics").is_none());
}

#[test]
fn concurrent_outcomes_are_all_counted() {
    let (calibrator, _) = calibrator(Arc::new(MemoryTrustStore::new()));
    let calibrator = Arc::new(calibrator);
    let handles = (0..8)
        .map(|_| {
            let calibrator = calibrator.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    calibrator
                        .record_outcome(&user(), true, Some(4.0), "policy_draft")
                        .expect("record");
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().expect("join");
    }

    let metrics = calibrator.metrics(&user()).expect("metrics").expect("stored");
    assert_eq!(metrics.total_interactions, 40);
    assert_eq!(metrics.successful_interactions, 40);
    assert_eq!(metrics.feedback_count, 40);
}

#[test]
fn sqlite_store_keeps_metrics_across_calibrators() {
    let temp = tempdir().expect("temp dir");
    let path = temp.path().join("db/trust.db");
    {
        let store = Arc::new(SqliteTrustStore::open(&path).expect("open"));
        let (calibrator, _) = calibrator(store);
        for _ in 0..5 {
            calibrator
                .record_outcome(&user(), true, Some(4.0), "assessment")
                .expect("record");
        }
    }

    let store = Arc::new(SqliteTrustStore::open(&path).expect("reopen"));
    let (calibrator, _) = calibrator(store);
    assert_eq!(
        calibrator.current_level(&user()).expect("level"),
        TrustLevel::Suggestive
    );
}
