use complyflow::checkpoint::{
    CheckpointError, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore,
};
use complyflow::shared::ids::{StepId, ThreadId, UserId, WorkflowType};
use complyflow::state::{WorkflowState, WorkflowStatus};
use serde_json::json;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

fn thread_id() -> ThreadId {
    ThreadId::parse("thr-audit").expect("thread id")
}

fn initial_state() -> WorkflowState {
    WorkflowState::new(
        thread_id(),
        UserId::parse("analyst-1").expect("user"),
        WorkflowType::parse("assessment").expect("type"),
        StepId::parse("intake").expect("step"),
        json!({"framework": "soc2"}),
        1_000,
    )
}

fn assert_monotonic_versions(store: &dyn CheckpointStore) {
    let mut versions = vec![store.save(&thread_id(), &initial_state()).expect("first save")];
    for _ in 0..4 {
        let (state, version) = store.load(&thread_id()).expect("load");
        assert_eq!(state.version(), version);
        versions.push(store.save(&thread_id(), &state).expect("save"));
    }
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);

    let history = store.history(&thread_id(), 3).expect("history");
    assert_eq!(
        history.iter().map(|meta| meta.version).collect::<Vec<_>>(),
        vec![5, 4, 3]
    );
    assert!(history.iter().all(|meta| meta.status == WorkflowStatus::InProgress));
    assert_eq!(store.load_version(&thread_id(), 2).expect("v2").version(), 2);
    assert_eq!(store.threads().expect("threads"), vec![thread_id()]);
}

fn assert_single_winner(store: Arc<dyn CheckpointStore>) {
    store.save(&thread_id(), &initial_state()).expect("seed");
    let (base, _) = store.load(&thread_id()).expect("load base");

    let barrier = Arc::new(Barrier::new(2));
    let handles = (0..2)
        .map(|_| {
            let store = store.clone();
            let base = base.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                store.save(&thread_id(), &base)
            })
        })
        .collect::<Vec<_>>();
    let results = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .collect::<Vec<_>>();

    let winners = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(winners, 1, "{results:?}");
    assert!(results.iter().any(|result| matches!(
        result,
        Err(CheckpointError::Conflict {
            expected: 1,
            actual: 2,
            ..
        })
    )));
    let (_, latest) = store.load(&thread_id()).expect("load latest");
    assert_eq!(latest, 2);
}

#[test]
fn memory_store_versions_are_strictly_increasing() {
    assert_monotonic_versions(&MemoryCheckpointStore::new());
}

#[test]
fn sqlite_store_versions_are_strictly_increasing() {
    let temp = tempdir().expect("temp dir");
    let store = SqliteCheckpointStore::open(&temp.path().join("db/checkpoints.db")).expect("open");
    assert_monotonic_versions(&store);
}

#[test]
fn memory_store_concurrent_saves_from_one_base_have_one_winner() {
    assert_single_winner(Arc::new(MemoryCheckpointStore::new()));
}

#[test]
fn sqlite_store_concurrent_saves_from_one_base_have_one_winner() {
    let temp = tempdir().expect("temp dir");
    let store = SqliteCheckpointStore::open(&temp.path().join("checkpoints.db")).expect("open");
    assert_single_winner(Arc::new(store));
}

#[test]
fn sqlite_checkpoints_survive_reopen() {
    let temp = tempdir().expect("temp dir");
    let path = temp.path().join("checkpoints.db");
    {
        let store = SqliteCheckpointStore::open(&path).expect("open");
        store.save(&thread_id(), &initial_state()).expect("save");
    }
    let reopened = SqliteCheckpointStore::open(&path).expect("reopen");
    let (state, version) = reopened.load(&thread_id()).expect("load");
    assert_eq!(version, 1);
    assert_eq!(state.input(), &json!({"framework": "soc2"}));
}

#[test]
fn unknown_thread_and_stale_base_are_reported() {
    let store = MemoryCheckpointStore::new();
    assert!(matches!(
        store.load(&thread_id()),
        Err(CheckpointError::NotFound { .. })
    ));

    store.save(&thread_id(), &initial_state()).expect("first save");
    let err = store
        .save(&thread_id(), &initial_state())
        .expect_err("stale base");
    assert!(matches!(
        err,
        CheckpointError::Conflict {
            expected: 0,
            actual: 1,
            ..
        }
    ));
    assert!(matches!(
        store.load_version(&thread_id(), 9),
        Err(CheckpointError::VersionNotFound { version: 9, .. })
    ));
}
