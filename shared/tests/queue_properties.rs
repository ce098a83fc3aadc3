use grocli_shared::capabilities::{BackendCall, BackendError, MemoryBackend, MemoryStore, Row, ScriptedProbe};
use grocli_shared::{
    ActionQueue, ConnectivityMonitor, FlushOutcome, QueueDispatcher, QueueFlusher, QueuedAction,
    SyncConfig,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use serde_json::{json, Value};
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn payload(n: usize, name: &str) -> Row {
    match json!({"seq": n, "name": name}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

struct Harness {
    backend: Arc<MemoryBackend>,
    queue: Arc<ActionQueue<MemoryStore>>,
    dispatcher: QueueDispatcher<MemoryStore>,
    flusher: QueueFlusher<MemoryStore>,
}

async fn harness() -> Harness {
    let config = SyncConfig {
        start_online: false,
        offline_cooldown_ms: 0,
        ..Default::default()
    };
    let backend = Arc::new(MemoryBackend::new());
    let queue = Arc::new(
        ActionQueue::open(Arc::new(MemoryStore::new()), config.queue_store_key().unwrap())
            .await
            .unwrap(),
    );
    let monitor = Arc::new(ConnectivityMonitor::new(Arc::new(ScriptedProbe::new(false)), &config));
    let dispatcher = QueueDispatcher::new(backend.clone(), queue.clone(), monitor.clone());
    let flusher = QueueFlusher::new(backend.clone(), queue.clone(), monitor);
    Harness {
        backend,
        queue,
        dispatcher,
        flusher,
    }
}

fn replayed_payloads(backend: &MemoryBackend) -> Vec<Row> {
    backend
        .write_calls()
        .into_iter()
        .filter_map(|call| match call {
            BackendCall::Insert { payload, .. } => Some(payload),
            _ => None,
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn offline_writes_replay_in_append_order(names in prop::collection::vec("[a-z]{1,8}", 1..24)) {
        let result: Result<(), TestCaseError> = runtime().block_on(async {
            let h = harness().await;
            let mut expected = Vec::new();
            for (n, name) in names.iter().enumerate() {
                let row = payload(n, name);
                expected.push(row.clone());
                h.dispatcher
                    .dispatch(QueuedAction::insert("items", row).unwrap())
                    .await
                    .unwrap();
            }
            prop_assert!(h.backend.calls().is_empty());

            let outcome = h.flusher.flush().await;
            prop_assert!(matches!(outcome, FlushOutcome::Completed(r) if r.replayed == names.len()), "{:?}", outcome);
            prop_assert_eq!(replayed_payloads(&h.backend), expected);
            prop_assert!(h.queue.is_empty().await.unwrap());
            Ok(())
        });
        result?;
    }

    #[test]
    fn failed_replays_are_retained_in_relative_order(
        failures in prop::collection::vec(prop_oneof![Just(None), Just(Some(false)), Just(Some(true))], 1..24)
    ) {
        // None = succeeds, Some(true) = network failure, Some(false) = rejection
        let result: Result<(), TestCaseError> = runtime().block_on(async {
            let h = harness().await;
            let mut actions = Vec::new();
            for n in 0..failures.len() {
                let action = QueuedAction::insert("items", payload(n, "x")).unwrap();
                h.queue.append(action.clone()).await.unwrap();
                actions.push(action);
            }
            h.backend.script(failures.iter().map(|f| match f {
                None => None,
                Some(true) => Some(BackendError::network("reset")),
                Some(false) => Some(BackendError::rejected(400, "bad")),
            }));

            h.flusher.flush().await;

            let expected: Vec<_> = actions
                .iter()
                .zip(&failures)
                .filter(|(_, f)| f.is_some())
                .map(|(a, _)| a.clone())
                .collect();
            prop_assert_eq!(h.queue.read_all().await.unwrap(), expected);
            prop_assert_eq!(h.backend.rows("items").len(), failures.iter().filter(|f| f.is_none()).count());
            Ok(())
        });
        result?;
    }
}
