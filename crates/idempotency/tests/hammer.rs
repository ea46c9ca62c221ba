//! Concurrency test: many submitters, one execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use flux_idempotency::{GateConfig, IdempotencyGate};
use flux_store::{MemoryStore, Store, StoredResponse};

/// 100 concurrent submissions of the same key: exactly one handler
/// execution, 99 byte-identical replays.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn idempotency_hammer() {
    let store = Arc::new(MemoryStore::new());
    let gate = Arc::new(IdempotencyGate::with_config(
        store.clone() as Arc<dyn Store>,
        GateConfig {
            wait_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(20),
            ..GateConfig::default()
        },
    ));
    let executions = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for i in 0..100u32 {
        let gate = gate.clone();
        let executions = executions.clone();
        handles.push(tokio::spawn(async move {
            gate.execute(
                "create-state-abc",
                &format!("req-{i}"),
                1,
                Duration::from_secs(5),
                || async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    // Give the other 99 a chance to pile up behind the lock.
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    Ok(StoredResponse {
                        status: 201,
                        headers: vec![("content-type".into(), "application/json".into())],
                        body: "{\"state_id\":\"abc\"}".into(),
                    })
                },
            )
            .await
        }));
    }

    let mut executed = 0;
    let mut replayed = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.response().status, 201);
        assert_eq!(outcome.response().body, "{\"state_id\":\"abc\"}");
        if outcome.was_executed() {
            executed += 1;
        } else {
            replayed += 1;
        }
    }

    assert_eq!(executions.load(Ordering::SeqCst), 1, "handler ran more than once");
    assert_eq!((executed, replayed), (1, 99));
}
