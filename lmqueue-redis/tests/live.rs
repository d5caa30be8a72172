//! Runs against a real server: `LMQUEUE_TEST_REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`.

use lmqueue::store::{ClaimOutcome, ClaimRequest};
use lmqueue::{CasQueueStore, InstanceId, Method, ModelLimits, QueueStore, RequestRecord};
use lmqueue_redis::RedisStateBackend;

async fn store() -> Option<CasQueueStore<RedisStateBackend>> {
    let url = std::env::var("LMQUEUE_TEST_REDIS_URL").ok()?;
    let backend = RedisStateBackend::connect(&url).await.unwrap();
    let prefix = format!("lmqueue-test-{}", uuid::Uuid::new_v4());
    Some(CasQueueStore::new(backend).with_prefix(prefix))
}

#[tokio::test]
#[ignore = "needs LMQUEUE_TEST_REDIS_URL"]
async fn claims_and_releases_through_redis() {
    let Some(store) = store().await else { return };
    let limits = ModelLimits::new("m", 100, 1_000).unwrap();
    let me = InstanceId::new("redis-test");
    let claim = ClaimRequest { instance: me.clone(), policy: limits.budget_policy(), max_concurrent: 1 };

    let first = RequestRecord::pending("m", Method::GenerateText, 100, me.clone(), 0);
    let second = RequestRecord::pending("m", Method::GenerateText, 50, me.clone(), 0);
    store.enqueue(first.clone(), 0).await.unwrap();
    store.enqueue(second.clone(), 0).await.unwrap();

    match store.try_claim_head("m", &claim, 0).await.unwrap() {
        ClaimOutcome::Claimed(record) => assert_eq!(record.id, first.id),
        other => panic!("unexpected claim outcome: {other:?}"),
    }
    // One slot, already taken.
    assert!(matches!(
        store.try_claim_head("m", &claim, 0).await.unwrap(),
        ClaimOutcome::Blocked { .. }
    ));
    assert_eq!(store.budget("m", &limits.budget_policy(), 0).await.unwrap().tokens(), 900);

    store.remove("m", first.id).await.unwrap();
    match store.try_claim_head("m", &claim, 0).await.unwrap() {
        ClaimOutcome::Claimed(record) => assert_eq!(record.id, second.id),
        other => panic!("unexpected claim outcome: {other:?}"),
    }
    store.release("m", second.id, &limits.budget_policy(), 0).await.unwrap();

    let stats = store.stats("m").await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
}
