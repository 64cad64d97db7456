//! Black-box tests of the offline engine: scripted remote API, controllable
//! reachability, virtual time.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use fablink_sync::{
    ActionKind, ActionStatus, ApiError, EngineError, EngineEvent, EntityKey, MemoryActionStore,
    MutationRequest, OfflineEngine, PendingAction, ReachabilityProbe, RemoteApi, SqliteActionStore,
    SubmitError, SyncConfig,
};

/// Remote API stub that replays a scripted list of responses, then a default.
struct ScriptedApi {
    script: Mutex<VecDeque<Result<Option<Value>, ApiError>>>,
    default: Result<Option<Value>, ApiError>,
    calls: Mutex<Vec<(ActionKind, EntityKey, Value)>>,
}

impl ScriptedApi {
    fn always_ok() -> Arc<Self> {
        Self::with_script(Vec::new())
    }

    fn with_script(script: Vec<Result<Option<Value>, ApiError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            default: Ok(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls(&self) -> Vec<(ActionKind, EntityKey, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    async fn submit(&self, action: &PendingAction) -> Result<Option<Value>, ApiError> {
        self.calls.lock().unwrap().push((
            action.kind.clone(),
            action.entity.clone(),
            action.payload.clone(),
        ));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

struct TestProbe(Arc<AtomicBool>);

#[async_trait]
impl ReachabilityProbe for TestProbe {
    async fn reachable(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn test_config() -> SyncConfig {
    SyncConfig::default()
        .with_sync_interval(Duration::from_millis(200))
        .with_backoff(Duration::from_millis(50), Duration::from_millis(400))
        .with_probe_interval(Duration::from_millis(20))
        .with_offline_grace(Duration::from_millis(40))
}

async fn start_engine(
    config: SyncConfig,
    api: Arc<ScriptedApi>,
    initially_reachable: bool,
) -> (OfflineEngine, Arc<AtomicBool>) {
    fablink_observability::init();
    let reachable = Arc::new(AtomicBool::new(initially_reachable));
    let engine = OfflineEngine::start(
        config,
        Arc::new(MemoryActionStore::new()),
        api,
        Arc::new(TestProbe(reachable.clone())),
    )
    .await
    .expect("engine start");
    (engine, reachable)
}

/// Poll a condition under virtual time; panics if it never holds.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn transient(status: u16) -> ApiError {
    ApiError::from_status(status, "simulated")
}

fn indicator_invariant(engine: &OfflineEngine) {
    let expected =
        !engine.is_online() || !engine.pending_actions().is_empty() || engine.is_syncing();
    assert_eq!(
        engine.should_show_offline_indicator(),
        expected,
        "indicator must be an exact derivation of its three inputs"
    );
}

// A bulk operation enqueued offline, three 503s after reconnect, then failed
// but still visible for manual retry.
#[tokio::test(start_paused = true)]
async fn bulk_operation_fails_after_three_transient_errors() {
    let api = ScriptedApi::with_script(vec![
        Err(transient(503)),
        Err(transient(503)),
        Err(transient(503)),
    ]);
    let (engine, reachable) = start_engine(test_config().with_max_retries(3), api.clone(), false).await;

    wait_until(|| !engine.is_online()).await;

    engine
        .submit(MutationRequest::new(
            ActionKind::BulkOperation,
            EntityKey::custom("orders", "bulk"),
            json!({"operation": "accept", "orderIds": ["1", "2"]}),
        ))
        .await
        .expect("submit");

    assert_eq!(engine.pending_actions().len(), 1);
    assert!(engine.should_show_offline_indicator());
    assert_eq!(api.call_count(), 0, "no sync attempt while offline");
    indicator_invariant(&engine);

    reachable.store(true, Ordering::SeqCst);
    wait_until(|| {
        engine
            .pending_actions()
            .first()
            .is_some_and(|a| a.status == ActionStatus::Failed)
    })
    .await;
    wait_until(|| !engine.is_syncing()).await;

    let pending = engine.pending_actions();
    assert_eq!(pending.len(), 1, "failed action stays visible for manual retry");
    assert_eq!(pending[0].attempts, 3);
    assert!(pending[0].last_error.is_some());
    assert_eq!(api.call_count(), 3);
    indicator_invariant(&engine);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn permanent_rejection_abandons_after_exactly_one_attempt() {
    let api = ScriptedApi::with_script(vec![Err(ApiError::from_status(422, "invalid"))]);
    let (engine, _reachable) = start_engine(test_config(), api.clone(), true).await;
    let events = engine.subscribe();

    let entity = EntityKey::custom("order", "5");
    engine.seed_read_model(entity.clone(), json!({"status": "draft"}));

    engine
        .submit(
            MutationRequest::new(ActionKind::UpdateOrder, entity.clone(), json!({"status": "accepted"}))
                .with_optimistic(json!({"status": "accepted"})),
        )
        .await
        .expect("submit");

    // Optimistic effect is visible before confirmation.
    assert_eq!(engine.read_model(&entity), Some(json!({"status": "accepted"})));

    wait_until(|| {
        engine
            .pending_actions()
            .first()
            .is_some_and(|a| a.status == ActionStatus::Abandoned)
    })
    .await;

    let pending = engine.pending_actions();
    assert_eq!(pending[0].attempts, 1, "permanent failures are never retried");
    assert_eq!(api.call_count(), 1);

    // Rolled back to the last server-confirmed state.
    assert_eq!(engine.read_model(&entity), Some(json!({"status": "draft"})));

    let drained = events.drain();
    assert!(drained.iter().any(|e| matches!(
        e,
        EngineEvent::ActionAbandoned { rolled_back: true, .. }
    )));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn same_entity_actions_reach_the_server_in_submission_order() {
    let api = ScriptedApi::always_ok();
    let (engine, reachable) = start_engine(test_config(), api.clone(), false).await;

    wait_until(|| !engine.is_online()).await;

    let order5 = EntityKey::custom("order", "5");
    let order9 = EntityKey::custom("order", "9");
    engine
        .submit(MutationRequest::new(
            ActionKind::UpdateOrder,
            order5.clone(),
            json!({"title": "X"}),
        ))
        .await
        .unwrap();
    engine
        .submit(MutationRequest::new(
            ActionKind::UpdateOrder,
            order5.clone(),
            json!({"title": "Y"}),
        ))
        .await
        .unwrap();
    engine
        .submit(MutationRequest::new(
            ActionKind::UpdateOrder,
            order9.clone(),
            json!({"note": "rush"}),
        ))
        .await
        .unwrap();

    reachable.store(true, Ordering::SeqCst);
    wait_until(|| engine.pending_actions().is_empty()).await;

    let calls = api.calls();
    assert_eq!(calls.len(), 3);
    let order5_payloads: Vec<&Value> = calls
        .iter()
        .filter(|(_, entity, _)| entity == &order5)
        .map(|(_, _, payload)| payload)
        .collect();
    assert_eq!(order5_payloads, vec![&json!({"title": "X"}), &json!({"title": "Y"})]);

    assert!(engine.last_sync_at().is_some());
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_signature_replaces_payload_instead_of_appending() {
    let api = ScriptedApi::always_ok();
    let (engine, _reachable) = start_engine(test_config(), api.clone(), false).await;

    wait_until(|| !engine.is_online()).await;

    let entity = EntityKey::custom("order", "5");
    let first = engine
        .submit(
            MutationRequest::new(ActionKind::UpdateOrder, entity.clone(), json!({"title": "dra"}))
                .with_signature("edit-title:5"),
        )
        .await
        .unwrap();
    let second = engine
        .submit(
            MutationRequest::new(ActionKind::UpdateOrder, entity.clone(), json!({"title": "draft"}))
                .with_signature("edit-title:5"),
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id, "same signature, same pending action");
    let pending = engine.pending_actions();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload, json!({"title": "draft"}));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn no_sync_attempts_while_offline_and_immediate_pass_on_reconnect() {
    let api = ScriptedApi::always_ok();
    let (engine, reachable) = start_engine(test_config(), api.clone(), false).await;

    wait_until(|| !engine.is_online()).await;
    engine
        .submit(MutationRequest::new(
            ActionKind::AcceptQuote,
            EntityKey::custom("quote", "77"),
            json!({}),
        ))
        .await
        .unwrap();

    // Far longer than many sync intervals.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(api.call_count(), 0, "the periodic timer is suspended while offline");

    let reconnect_started = tokio::time::Instant::now();
    reachable.store(true, Ordering::SeqCst);
    wait_until(|| engine.pending_actions().is_empty()).await;
    assert_eq!(api.call_count(), 1);

    // The pass started on the transition, not on the next 200ms tick.
    assert!(reconnect_started.elapsed() < Duration::from_millis(150));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn force_sync_cuts_the_backoff_wait_short() {
    let api = ScriptedApi::with_script(vec![Err(transient(503))]);
    let config = test_config()
        .with_backoff(Duration::from_secs(3_600), Duration::from_secs(7_200))
        .with_max_retries(3);
    let (engine, _reachable) = start_engine(config, api.clone(), true).await;

    let started = tokio::time::Instant::now();
    engine
        .submit(MutationRequest::new(
            ActionKind::CreateOrder,
            EntityKey::custom("order", "new"),
            json!({"sku": "bracket-9"}),
        ))
        .await
        .unwrap();

    // First attempt fails and schedules an hour-long backoff.
    wait_until(|| {
        engine
            .pending_actions()
            .first()
            .is_some_and(|a| a.attempts == 1 && a.status == ActionStatus::Queued)
    })
    .await;

    engine.force_sync();
    wait_until(|| engine.pending_actions().is_empty()).await;

    assert_eq!(api.call_count(), 2);
    assert!(
        started.elapsed() < Duration::from_secs(60),
        "force_sync must not wait out the scheduled backoff"
    );

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn force_sync_restarts_failed_actions_with_a_fresh_budget() {
    let api = ScriptedApi::with_script(vec![Err(transient(500))]);
    let (engine, _reachable) =
        start_engine(test_config().with_max_retries(1), api.clone(), true).await;

    engine
        .submit(MutationRequest::new(
            ActionKind::UpdateOrder,
            EntityKey::custom("order", "5"),
            json!({"qty": 3}),
        ))
        .await
        .unwrap();

    wait_until(|| {
        engine
            .pending_actions()
            .first()
            .is_some_and(|a| a.status == ActionStatus::Failed)
    })
    .await;
    assert_eq!(engine.pending_actions()[0].attempts, 1);

    engine.force_sync();
    wait_until(|| engine.pending_actions().is_empty()).await;
    assert_eq!(api.call_count(), 2);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn clear_pending_actions_empties_queue_and_store() {
    let api = ScriptedApi::always_ok();
    let (engine, _reachable) = start_engine(test_config(), api.clone(), false).await;
    let events = engine.subscribe();

    wait_until(|| !engine.is_online()).await;
    for n in 0..3 {
        engine
            .submit(MutationRequest::new(
                ActionKind::UpdateOrder,
                EntityKey::custom("order", &n.to_string()),
                json!({"n": n}),
            ))
            .await
            .unwrap();
    }
    assert_eq!(engine.storage_info().await.unwrap().action_count, 3);

    let discarded = engine.clear_pending_actions().await.unwrap();
    assert_eq!(discarded, 3);
    assert!(engine.pending_actions().is_empty());
    assert_eq!(engine.storage_info().await.unwrap().action_count, 0);

    assert!(events
        .drain()
        .iter()
        .any(|e| matches!(e, EngineEvent::QueueCleared { discarded: 3 })));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn full_store_rejects_submit_loudly() {
    let api = ScriptedApi::always_ok();
    fablink_observability::init();
    let reachable = Arc::new(AtomicBool::new(false));
    let engine = OfflineEngine::start(
        test_config(),
        Arc::new(MemoryActionStore::with_capacity(1)),
        api,
        Arc::new(TestProbe(reachable)),
    )
    .await
    .expect("engine start");

    wait_until(|| !engine.is_online()).await;

    engine
        .submit(MutationRequest::new(
            ActionKind::CreateOrder,
            EntityKey::custom("order", "a"),
            json!({}),
        ))
        .await
        .expect("first submit fits");

    let err = engine
        .submit(MutationRequest::new(
            ActionKind::CreateOrder,
            EntityKey::custom("order", "b"),
            json!({}),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::StorageFull { capacity: 1 }));
    assert_eq!(engine.pending_actions().len(), 1, "nothing was dropped");

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn abandoned_actions_resolve_by_discard_or_retry() {
    let api = ScriptedApi::with_script(vec![
        Err(ApiError::from_status(409, "conflict")),
        Err(ApiError::from_status(409, "conflict")),
    ]);
    let (engine, _reachable) = start_engine(test_config(), api.clone(), true).await;

    let entity5 = EntityKey::custom("order", "5");
    let entity9 = EntityKey::custom("order", "9");
    let first = engine
        .submit(MutationRequest::new(ActionKind::UpdateOrder, entity5, json!({"qty": 1})))
        .await
        .unwrap();
    let second = engine
        .submit(MutationRequest::new(ActionKind::UpdateOrder, entity9, json!({"qty": 2})))
        .await
        .unwrap();

    wait_until(|| {
        engine
            .pending_actions()
            .iter()
            .filter(|a| a.status == ActionStatus::Abandoned)
            .count()
            == 2
    })
    .await;

    // Discard one; retry the other (script is exhausted, so it succeeds).
    engine.discard_action(first.id).await.expect("discard");
    engine.retry_action(second.id).await.expect("retry");
    engine.force_sync();

    wait_until(|| engine.pending_actions().is_empty()).await;
    assert_eq!(api.call_count(), 3);
    assert_eq!(engine.storage_info().await.unwrap().action_count, 0);

    // Both commands reject unknown ids.
    assert!(matches!(
        engine.discard_action(first.id).await,
        Err(EngineError::UnknownAction(_))
    ));
    assert!(matches!(
        engine.retry_action(first.id).await,
        Err(EngineError::UnknownAction(_))
    ));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retry_action_rejects_actions_not_awaiting_resolution() {
    let api = ScriptedApi::always_ok();
    let (engine, _reachable) = start_engine(test_config(), api, false).await;

    wait_until(|| !engine.is_online()).await;
    let queued = engine
        .submit(MutationRequest::new(
            ActionKind::UpdateOrder,
            EntityKey::custom("order", "5"),
            json!({}),
        ))
        .await
        .unwrap();

    assert!(matches!(
        engine.retry_action(queued.id).await,
        Err(EngineError::NotRestartable(_))
    ));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn indicator_tracks_connectivity_pending_and_syncing() {
    let api = ScriptedApi::always_ok();
    let (engine, reachable) = start_engine(test_config(), api, true).await;

    // Online, nothing pending, idle.
    wait_until(|| engine.is_online() && !engine.is_syncing()).await;
    assert!(!engine.should_show_offline_indicator());
    indicator_invariant(&engine);

    // Offline alone flips it.
    reachable.store(false, Ordering::SeqCst);
    wait_until(|| !engine.is_online()).await;
    assert!(engine.should_show_offline_indicator());
    indicator_invariant(&engine);

    // Pending work keeps it on even after reconnecting, until drained.
    engine
        .submit(MutationRequest::new(
            ActionKind::AcceptQuote,
            EntityKey::custom("quote", "3"),
            json!({}),
        ))
        .await
        .unwrap();
    indicator_invariant(&engine);
    reachable.store(true, Ordering::SeqCst);
    wait_until(|| engine.pending_actions().is_empty() && !engine.is_syncing()).await;
    assert!(!engine.should_show_offline_indicator());
    indicator_invariant(&engine);

    engine.shutdown().await;
}

// Durability through the facade: enqueue, restart the process, drain.
#[tokio::test(start_paused = true)]
async fn queue_survives_an_engine_restart() {
    fablink_observability::init();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("actions.db");

    let offline_probe = Arc::new(AtomicBool::new(false));
    let api = ScriptedApi::always_ok();
    {
        let store = SqliteActionStore::open_at(&path, 100).await.expect("open store");
        let engine = OfflineEngine::start(
            test_config(),
            Arc::new(store),
            api.clone(),
            Arc::new(TestProbe(offline_probe.clone())),
        )
        .await
        .expect("first engine");

        wait_until(|| !engine.is_online()).await;
        for n in 0..2 {
            engine
                .submit(MutationRequest::new(
                    ActionKind::UpdateOrder,
                    EntityKey::custom("order", &n.to_string()),
                    json!({"n": n}),
                ))
                .await
                .unwrap();
        }
        engine.shutdown().await;
    }
    assert_eq!(api.call_count(), 0);

    // "Reboot": fresh store handle, fresh engine, network available.
    let store = SqliteActionStore::open_at(&path, 100).await.expect("reopen store");
    let engine = OfflineEngine::start(
        test_config(),
        Arc::new(store),
        api.clone(),
        Arc::new(TestProbe(Arc::new(AtomicBool::new(true)))),
    )
    .await
    .expect("second engine");

    assert_eq!(engine.pending_actions().len(), 2, "rehydrated before accepting work");
    wait_until(|| engine.pending_actions().is_empty()).await;

    let calls = api.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].2, json!({"n": 0}));
    assert_eq!(calls[1].2, json!({"n": 1}));

    engine.shutdown().await;
}
