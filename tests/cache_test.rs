//! Tagged cache behaviour under TTL, invalidation and concurrent misses

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use capacity_engine::cache::keys::workload_key;
use capacity_engine::model::{Project, ProjectId, ProjectState, Worker, WorkerId};
use capacity_engine::source::{CommitmentStore, MemoryStore};
use capacity_engine::{EngineConfig, Percent, TaggedCache, WorkloadService};

const TTL: Duration = Duration::from_secs(30);

fn counted(counter: &Arc<AtomicUsize>, value: u32) -> impl std::future::Future<Output = Result<u32, String>> {
    let counter = counter.clone();
    async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(value)
    }
}

#[tokio::test(start_paused = true)]
async fn test_wrap_caches_until_ttl() {
    let cache: TaggedCache<u32> = TaggedCache::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = cache.wrap("k", TTL, &["t"], || counted(&calls, 1)).await.unwrap();
    let second = cache.wrap("k", TTL, &["t"], || counted(&calls, 2)).await.unwrap();
    assert_eq!((first, second), (1, 1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(TTL + Duration::from_secs(1)).await;
    let third = cache.wrap("k", TTL, &["t"], || counted(&calls, 3)).await.unwrap();
    assert_eq!(third, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_one_second_ttl_expires_without_invalidation() {
    let cache: TaggedCache<u32> = TaggedCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    cache.set("k", 1, Duration::from_secs(1), &["worker:7"]);

    tokio::time::advance(Duration::from_secs(1) + Duration::from_millis(1)).await;
    assert_eq!(cache.get("k"), None);

    let value = cache
        .wrap("k", Duration::from_secs(1), &["worker:7"], || counted(&calls, 2))
        .await
        .unwrap();
    assert_eq!(value, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_errors_are_not_cached() {
    let cache: TaggedCache<u32> = TaggedCache::new();

    let err = cache
        .wrap("k", TTL, &["t"], || async { Err::<u32, _>("backend down".to_string()) })
        .await
        .unwrap_err();
    assert_eq!(err, "backend down");
    assert!(cache.is_empty());

    let value = cache.wrap("k", TTL, &["t"], || async { Ok::<_, String>(7) }).await.unwrap();
    assert_eq!(value, 7);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_misses_coalesce() {
    let cache: TaggedCache<u32> = TaggedCache::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let (a, b, c) = tokio::join!(
        cache.wrap("k", TTL, &["t"], || counted(&calls, 1)),
        cache.wrap("k", TTL, &["t"], || counted(&calls, 2)),
        cache.wrap("k", TTL, &["t"], || counted(&calls, 3)),
    );

    assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 1, 1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().coalesced, 2);
    assert_eq!(cache.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_computes_when_leader_fails() {
    let cache: TaggedCache<u32> = TaggedCache::new();

    let (leader, waiter) = tokio::join!(
        cache.wrap("k", TTL, &["t"], || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<u32, String>("boom".into())
        }),
        cache.wrap("k", TTL, &["t"], || async { Ok::<_, String>(5) }),
    );

    assert!(leader.is_err());
    assert_eq!(waiter.unwrap(), 5);
    assert_eq!(cache.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_leader_releases_slot() {
    let cache: TaggedCache<u32> = TaggedCache::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let slow = cache.wrap("k", TTL, &["t"], || async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok::<_, String>(1)
    });
    assert!(tokio::time::timeout(Duration::from_millis(10), slow).await.is_err());
    assert_eq!(cache.in_flight_count(), 0);
    assert!(cache.is_empty());

    let value = cache.wrap("k", TTL, &["t"], || counted(&calls, 2)).await.unwrap();
    assert_eq!(value, 2);
}

#[tokio::test]
async fn test_invalidation_during_compute_is_not_cached() {
    let cache: TaggedCache<u32> = TaggedCache::new();

    let value = cache
        .wrap("k", TTL, &["worker:1", "fleet"], || async {
            // A mutation lands while the old data is being aggregated
            cache.invalidate_by_tags(&["worker:1"]);
            Ok::<_, String>(1)
        })
        .await
        .unwrap();

    assert_eq!(value, 1);
    assert_eq!(cache.get("k"), None);

    // Unrelated invalidations do not block population
    let value = cache
        .wrap("k", TTL, &["worker:1"], || async {
            cache.invalidate_by_tags(&["worker:2"]);
            Ok::<_, String>(2)
        })
        .await
        .unwrap();
    assert_eq!(value, 2);
    assert_eq!(cache.get("k"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_wrap_after_invalidation_does_not_join_stale_computation() {
    let cache: TaggedCache<u32> = TaggedCache::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let stale = async {
        cache
            .wrap("workload:7", TTL, &["worker:7", "fleet"], || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, String>(60)
            })
            .await
    };
    let fresh = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate_by_tags(&["worker:7"]);
        cache
            .wrap("workload:7", TTL, &["worker:7", "fleet"], || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(0)
            })
            .await
    };

    let (stale, fresh) = tokio::join!(stale, fresh);
    assert_eq!(stale.unwrap(), 60);
    assert_eq!(fresh.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The detached leader finished last but must not overwrite the fresh value
    assert_eq!(cache.get("workload:7"), Some(0));
    assert_eq!(cache.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_of_detached_leader_recomputes() {
    let cache: TaggedCache<u32> = TaggedCache::new();

    let (leader, waiter, _) = tokio::join!(
        cache.wrap("k", TTL, &["worker:1"], || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, String>(1)
        }),
        cache.wrap("k", TTL, &["worker:1"], || async { Ok::<_, String>(2) }),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache.invalidate_by_tags(&["worker:1"]);
        },
    );

    assert_eq!(leader.unwrap(), 1);
    assert_eq!(waiter.unwrap(), 2);
    assert_eq!(cache.get("k"), None);
}

#[tokio::test]
async fn test_dashboard_reads_follow_service_mutations() {
    let store = Arc::new(MemoryStore::new());
    let worker = WorkerId::new(1).unwrap();
    let project = ProjectId::new(1).unwrap();
    store.put_worker(&Worker::new(worker, "Ada")).await.unwrap();
    store
        .put_project(&Project { id: project, name: "Atlas".into(), state: ProjectState::Active })
        .await
        .unwrap();

    let cache = Arc::new(TaggedCache::new());
    let service = WorkloadService::new(store.clone(), cache.clone(), &EngineConfig::default());

    assert_eq!(service.workload(worker).await.unwrap().primary_total, Percent::ZERO);
    assert!(cache.get(&workload_key(worker)).is_some());

    // A write that bypasses the service is invisible until the TTL runs out
    store.upsert_project_commitment(worker, project, Percent::whole(10)).await.unwrap();
    assert_eq!(service.workload(worker).await.unwrap().primary_total, Percent::ZERO);
    assert_eq!(service.live_workload(worker).await.unwrap().primary_total, Percent::whole(10));

    // A write through the service invalidates immediately
    service.update_involvement(worker, project, Percent::whole(25)).await.unwrap();
    assert_eq!(service.workload(worker).await.unwrap().primary_total, Percent::whole(25));

    service.fleet_overview().await.unwrap();
    service.unassign(worker, project).await.unwrap();
    let overview = service.fleet_overview().await.unwrap();
    assert_eq!(overview.snapshots[0].primary_total, Percent::ZERO);
}
