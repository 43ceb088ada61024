use admission_gate::admission::{
    AdmissionConfig, AdmissionController, AdmissionMode, AdmissionRequest, BlockReason,
    CounterStore, MemoryStore, StoreError, StoreResult,
};
use async_trait::async_trait;
use futures::future::join_all;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NOW_MS: i64 = 1_700_000_000_250;

type FailRule = Box<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Memory store that fails any operation matching `rule(op, key)`
struct FailingStore {
    inner: MemoryStore,
    rule: FailRule,
    failures: AtomicUsize,
}

impl FailingStore {
    fn new(inner: MemoryStore, rule: impl Fn(&str, &str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner,
            rule: Box::new(rule),
            failures: AtomicUsize::new(0),
        }
    }

    fn check(&self, op: &str, key: &str) -> StoreResult<()> {
        if (self.rule)(op, key) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Transport(format!("injected {} failure", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FailingStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        self.check("get", key)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: i64) -> StoreResult<()> {
        self.check("set", key)?;
        self.inner.set(key, value).await
    }

    async fn del(&self, key: &str) -> StoreResult<u64> {
        self.check("del", key)?;
        self.inner.del(key).await
    }

    async fn incr_by(&self, key: &str, by: i64) -> StoreResult<i64> {
        self.check("incr", key)?;
        self.inner.incr_by(key, by).await
    }

    async fn decr_by(&self, key: &str, by: i64) -> StoreResult<i64> {
        self.check("decr", key)?;
        self.inner.decr_by(key, by).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool> {
        self.check("expire", key)?;
        self.inner.expire(key, ttl_secs).await
    }

    fn name(&self) -> &str {
        "failing"
    }
}

fn enforce_config() -> AdmissionConfig {
    AdmissionConfig {
        mode: AdmissionMode::Enforce,
        user_max_in_flight: 3,
        global_max_in_flight: 100,
        global_max_messages_per_second: 100,
        global_max_tool_calls_per_second: 100,
        key_prefix: "test".to_string(),
        ..AdmissionConfig::default()
    }
}

fn memory_controller(config: AdmissionConfig) -> (Arc<AdmissionController>, MemoryStore) {
    let store = MemoryStore::new();
    let controller = Arc::new(AdmissionController::with_store(config, Arc::new(store.clone())));
    (controller, store)
}

fn enforce(principal: &str, tool_calls: i64) -> AdmissionRequest {
    AdmissionRequest::new(principal)
        .mode(AdmissionMode::Enforce)
        .tool_calls(tool_calls)
        .at(NOW_MS)
}

async fn count(store: &MemoryStore, key: &str) -> i64 {
    store.get(key).await.unwrap().unwrap_or(0)
}

#[tokio::test]
async fn test_user_in_flight_bounds_concurrent_admissions() {
    let (controller, store) = memory_controller(enforce_config());

    let attempts = (0..10).map(|_| {
        let controller = Arc::clone(&controller);
        async move { controller.check_and_acquire(&enforce("alice", 0)).await }
    });
    let results = join_all(attempts).await;

    let admitted: Vec<_> = results.iter().filter(|r| r.allowed).collect();
    assert_eq!(admitted.len(), 3);
    assert!(results
        .iter()
        .filter(|r| !r.allowed)
        .all(|r| r.reason == Some(BlockReason::UserInflight)));

    assert_eq!(count(&store, "test:inflight:user:alice").await, 3);
    assert_eq!(count(&store, "test:inflight:global").await, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_slot_race_admits_exactly_one() {
    let (controller, _store) = memory_controller(AdmissionConfig {
        user_max_in_flight: 1,
        ..enforce_config()
    });

    let a = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.check_and_acquire(&enforce("bob", 0)).await }
    });
    let b = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.check_and_acquire(&enforce("bob", 0)).await }
    });
    let results = [a.await.unwrap(), b.await.unwrap()];

    let admitted: Vec<_> = results.iter().filter(|r| r.allowed).collect();
    assert_eq!(admitted.len(), 1);
    assert!(admitted[0].ticket.is_some());

    let denied: Vec<_> = results.iter().filter(|r| !r.allowed).collect();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].reason, Some(BlockReason::UserInflight));
    assert_eq!(denied[0].retry_after_ms, Some(enforce_config().retry_after_ms));
}

#[tokio::test]
async fn test_principals_have_independent_budgets() {
    let (controller, _store) = memory_controller(AdmissionConfig {
        user_max_in_flight: 1,
        ..enforce_config()
    });

    assert!(controller.check_and_acquire(&enforce("carol", 0)).await.allowed);
    assert!(controller.check_and_acquire(&enforce("dave", 0)).await.allowed);
    let again = controller.check_and_acquire(&enforce("carol", 0)).await;
    assert_eq!(again.reason, Some(BlockReason::UserInflight));
}

#[tokio::test]
async fn test_global_in_flight_shared_across_principals() {
    let (controller, store) = memory_controller(AdmissionConfig {
        global_max_in_flight: 2,
        ..enforce_config()
    });

    assert!(controller.check_and_acquire(&enforce("u1", 0)).await.allowed);
    assert!(controller.check_and_acquire(&enforce("u2", 0)).await.allowed);

    let third = controller.check_and_acquire(&enforce("u3", 0)).await;
    assert!(!third.allowed);
    assert_eq!(third.reason, Some(BlockReason::GlobalInflight));
    // The third principal's own counter was rolled back
    assert_eq!(count(&store, "test:inflight:user:u3").await, 0);
    assert_eq!(count(&store, "test:inflight:global").await, 2);
}

#[tokio::test]
async fn test_release_twice_decrements_once() {
    let (controller, store) = memory_controller(enforce_config());

    let first = controller.check_and_acquire(&enforce("erin", 0)).await;
    let second = controller.check_and_acquire(&enforce("erin", 0)).await;
    let ticket = first.ticket.unwrap();
    assert!(second.allowed);

    controller.release(Some(&ticket)).await;
    controller.release(Some(&ticket)).await;

    assert_eq!(count(&store, &ticket.user_in_flight_key).await, 1);
    assert_eq!(count(&store, &ticket.global_in_flight_key).await, 1);
}

#[tokio::test]
async fn test_tool_rate_violation_rolls_back_everything() {
    let (controller, store) = memory_controller(AdmissionConfig {
        global_max_tool_calls_per_second: 5,
        ..enforce_config()
    });

    let result = controller.check_and_acquire(&enforce("frank", 6)).await;

    assert!(!result.allowed);
    assert_eq!(result.reason, Some(BlockReason::GlobalToolRate));
    assert!(result.ticket.is_none());

    let second = NOW_MS / 1000;
    assert_eq!(count(&store, "test:inflight:user:frank").await, 0);
    assert_eq!(count(&store, "test:inflight:global").await, 0);
    assert_eq!(count(&store, &format!("test:rate:msg:{second}")).await, 0);
    assert_eq!(count(&store, &format!("test:rate:tool:{second}")).await, 0);
}

#[tokio::test]
async fn test_message_rate_bucket_resets_each_second() {
    let (controller, store) = memory_controller(AdmissionConfig {
        global_max_messages_per_second: 2,
        ..enforce_config()
    });
    let at = |principal: &str, now_ms: i64| {
        AdmissionRequest::new(principal)
            .mode(AdmissionMode::Enforce)
            .tool_calls(0)
            .at(now_ms)
    };

    assert!(controller.check_and_acquire(&at("a", 10_100)).await.allowed);
    assert!(controller.check_and_acquire(&at("b", 10_900)).await.allowed);
    let third = controller.check_and_acquire(&at("c", 10_999)).await;
    assert_eq!(third.reason, Some(BlockReason::GlobalMsgRate));
    assert_eq!(count(&store, "test:inflight:global").await, 2);

    // A new second is a new bucket; bursts up to twice the budget straddle the boundary
    assert!(controller.check_and_acquire(&at("c", 11_000)).await.allowed);
    assert!(controller.check_and_acquire(&at("d", 11_001)).await.allowed);
    assert_eq!(count(&store, "test:rate:msg:10").await, 2);
    assert_eq!(count(&store, "test:rate:msg:11").await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_decrement_below_zero_self_heals() {
    let (controller, store) = memory_controller(enforce_config());

    let ticket = controller
        .check_and_acquire(&enforce("gina", 0))
        .await
        .ticket
        .unwrap();
    // Counters lost while the ticket was outstanding
    store.del(&ticket.user_in_flight_key).await.unwrap();

    controller.release(Some(&ticket)).await;

    assert_eq!(store.get(&ticket.user_in_flight_key).await.unwrap(), Some(0));
    let ttl = store.ttl(&ticket.user_in_flight_key).await.unwrap();
    assert!(ttl <= Duration::from_secs(5));
    assert!(ttl > Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_expired_ticket_release_is_noop() {
    let (controller, store) = memory_controller(AdmissionConfig {
        ticket_ttl_ms: 2_000,
        ..enforce_config()
    });

    let ticket = controller
        .check_and_acquire(&enforce("hank", 0))
        .await
        .ticket
        .unwrap();
    assert_eq!(store.ttl(&ticket.ticket_key).await, Some(Duration::from_secs(2)));

    // A later admission by someone else keeps the global counter alive
    tokio::time::advance(Duration::from_millis(1_500)).await;
    assert!(controller.check_and_acquire(&enforce("ivy", 0)).await.allowed);

    tokio::time::advance(Duration::from_millis(1_000)).await;
    assert!(!store.contains(&ticket.ticket_key).await);

    controller.release(Some(&ticket)).await;
    // Nothing decremented: hank's share of the global counter ages out with its TTL
    assert_eq!(count(&store, &ticket.global_in_flight_key).await, 2);
    assert_eq!(count(&store, &ticket.user_in_flight_key).await, 0);
}

#[tokio::test]
async fn test_store_unreachable_enforce_denies() {
    let store = FailingStore::new(MemoryStore::new(), |_, _| true);
    let controller = AdmissionController::with_store(enforce_config(), Arc::new(store));

    let result = controller.check_and_acquire(&enforce("jack", 1)).await;
    assert!(!result.allowed);
    assert_eq!(result.mode, AdmissionMode::Enforce);
    assert_eq!(result.reason, Some(BlockReason::RedisUnavailable));
    assert_eq!(result.retry_after_ms, Some(enforce_config().retry_after_ms));
}

#[tokio::test]
async fn test_store_unreachable_shadow_allows() {
    let store = FailingStore::new(MemoryStore::new(), |_, _| true);
    let controller = AdmissionController::with_store(enforce_config(), Arc::new(store));

    let result = controller
        .check_and_acquire(&AdmissionRequest::new("kate").mode(AdmissionMode::Shadow))
        .await;
    assert!(result.allowed);
    assert_eq!(result.mode, AdmissionMode::Shadow);
    assert_eq!(result.would_block, Some(true));
    assert_eq!(result.reason, Some(BlockReason::RedisUnavailable));
}

#[tokio::test]
async fn test_unconfigured_remote_store() {
    // No store credentials at all
    let controller = AdmissionController::new(enforce_config());
    let result = controller.check_and_acquire(&enforce("liam", 0)).await;
    assert_eq!(result.reason, Some(BlockReason::RedisUnavailable));
}

#[tokio::test]
async fn test_failure_midway_rolls_back_taken_counters() {
    let memory = MemoryStore::new();
    let store = FailingStore::new(memory.clone(), |op, key| op == "expire" && key.contains(":rate:msg:"));
    let controller = AdmissionController::with_store(enforce_config(), Arc::new(store));

    let result = controller.check_and_acquire(&enforce("mia", 2)).await;
    assert!(!result.allowed);
    assert_eq!(result.reason, Some(BlockReason::RedisUnavailable));

    let second = NOW_MS / 1000;
    assert_eq!(count(&memory, "test:inflight:user:mia").await, 0);
    assert_eq!(count(&memory, "test:inflight:global").await, 0);
    // Incremented before the failing expiry, so it is rolled back too
    assert_eq!(count(&memory, &format!("test:rate:msg:{second}")).await, 0);
    // Never reached
    assert!(!memory.contains(&format!("test:rate:tool:{second}")).await);
}

#[tokio::test]
async fn test_ticket_write_failure_releases_reservation() {
    let memory = MemoryStore::new();
    let store = FailingStore::new(memory.clone(), |op, key| op == "set" && key.contains(":ticket:"));
    let controller = AdmissionController::with_store(enforce_config(), Arc::new(store));

    let result = controller.check_and_acquire(&enforce("noah", 3)).await;
    assert_eq!(result.reason, Some(BlockReason::RedisUnavailable));

    let second = NOW_MS / 1000;
    assert_eq!(count(&memory, "test:inflight:user:noah").await, 0);
    assert_eq!(count(&memory, "test:inflight:global").await, 0);
    assert_eq!(count(&memory, &format!("test:rate:msg:{second}")).await, 0);
    assert_eq!(count(&memory, &format!("test:rate:tool:{second}")).await, 0);
}

#[tokio::test]
async fn test_rollback_failure_is_swallowed() {
    let memory = MemoryStore::new();
    let store = Arc::new(FailingStore::new(memory.clone(), |op, _| op == "decr"));
    let controller = AdmissionController::with_store(
        AdmissionConfig {
            global_max_tool_calls_per_second: 1,
            ..enforce_config()
        },
        store.clone(),
    );

    let result = controller.check_and_acquire(&enforce("olga", 4)).await;
    assert!(!result.allowed);
    assert_eq!(result.reason, Some(BlockReason::GlobalToolRate));
    // tool, msg, global and user decrements were all attempted
    assert_eq!(store.failures.load(Ordering::SeqCst), 4);
    // Left for the TTL backstop
    assert_eq!(count(&memory, "test:inflight:user:olga").await, 1);
    assert!(memory.ttl("test:inflight:user:olga").await.is_some());
}

#[tokio::test]
async fn test_release_with_store_failure_is_swallowed() {
    let memory = MemoryStore::new();
    let healthy = AdmissionController::with_store(enforce_config(), Arc::new(memory.clone()));
    let ticket = healthy
        .check_and_acquire(&enforce("pia", 0))
        .await
        .ticket
        .unwrap();

    let broken = AdmissionController::with_store(
        enforce_config(),
        Arc::new(FailingStore::new(memory.clone(), |op, _| op == "del")),
    );
    broken.release(Some(&ticket)).await;

    // Nothing was decremented because the marker could not be removed
    assert_eq!(count(&memory, &ticket.user_in_flight_key).await, 1);
    assert!(memory.contains(&ticket.ticket_key).await);

    healthy.release(Some(&ticket)).await;
    assert_eq!(count(&memory, &ticket.user_in_flight_key).await, 0);
}

#[tokio::test]
async fn test_shadow_reports_without_mutating() {
    let (controller, store) = memory_controller(AdmissionConfig {
        user_max_in_flight: 1,
        ..enforce_config()
    });

    let held = controller.check_and_acquire(&enforce("quinn", 0)).await;
    assert!(held.allowed);
    let before = store.len().await;

    let shadow = controller
        .check_and_acquire(&AdmissionRequest::new("quinn").mode(AdmissionMode::Shadow).at(NOW_MS))
        .await;
    assert!(shadow.allowed);
    assert_eq!(shadow.would_block, Some(true));
    assert_eq!(shadow.reason, Some(BlockReason::UserInflight));
    assert!(shadow.ticket.is_none());
    assert_eq!(store.len().await, before);
    assert_eq!(count(&store, "test:inflight:user:quinn").await, 1);

    let other = controller
        .check_and_acquire(&AdmissionRequest::new("rosa").mode(AdmissionMode::Shadow).at(NOW_MS))
        .await;
    assert_eq!(other.would_block, Some(false));
    assert!(other.reason.is_none());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_shadow_never_denies(
        user_max in 1u32..4,
        global_max in 1u32..4,
        msg_max in 1u32..4,
        tool_max in 1u32..8,
        held in 0i64..6,
        tool_calls in -3i64..12,
        store_down in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let memory = MemoryStore::new();
            memory.set("test:inflight:user:sam", held).await.unwrap();
            memory.set("test:inflight:global", held).await.unwrap();

            let store = FailingStore::new(memory.clone(), move |_, _| store_down);
            let controller = AdmissionController::with_store(
                AdmissionConfig {
                    user_max_in_flight: user_max,
                    global_max_in_flight: global_max,
                    global_max_messages_per_second: msg_max,
                    global_max_tool_calls_per_second: tool_max,
                    ..enforce_config()
                },
                Arc::new(store),
            );

            let result = controller
                .check_and_acquire(
                    &AdmissionRequest::new("sam")
                        .mode(AdmissionMode::Shadow)
                        .tool_calls(tool_calls)
                        .at(NOW_MS),
                )
                .await;

            prop_assert!(result.allowed);
            prop_assert_eq!(result.mode, AdmissionMode::Shadow);
            prop_assert_eq!(result.would_block, Some(result.reason.is_some()));
            prop_assert_eq!(memory.get("test:inflight:user:sam").await.unwrap(), Some(held));
            Ok(())
        })?;
    }
}
