/// Concurrent access tests
///
/// Many tasks driving the same controller at once: per-container commands
/// are serialized, so counters and transitions never race.
/// Run with: cargo test --test concurrent_access_tests

use async_trait::async_trait;
use sandbox_lifecycle::{
    ContainerId, InMemoryLifecycleStore, LifecycleController, LifecycleError, LifecycleRecord,
    LifecycleState, LifecycleStore, SubscriptionTier,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Barrier, Notify};
use tokio::time::timeout;

async fn running(controller: &LifecycleController, raw: &str, tier: SubscriptionTier) -> ContainerId {
    let container_id: ContainerId = raw.parse().unwrap();
    controller
        .provision(container_id.clone(), tier, None)
        .await
        .unwrap();
    controller.mark_running(&container_id).await.unwrap();
    container_id
}

/// Spawns `tasks` copies of `op` released together by a barrier and collects their results.
async fn race<T, F, Fut>(tasks: usize, op: F) -> Vec<Result<T, LifecycleError>>
where
    T: Send + 'static,
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, LifecycleError>> + Send + 'static,
{
    let barrier = Arc::new(Barrier::new(tasks));
    let mut handles = vec![];
    for _ in 0..tasks {
        let barrier = Arc::clone(&barrier);
        let fut = op();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            fut.await
        }));
    }

    let mut results = vec![];
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_heartbeats_across_containers() {
    let controller = Arc::new(LifecycleController::new().unwrap());
    let mut ids = vec![];
    for i in 0..20 {
        ids.push(running(&controller, &format!("ctr-par-{}", i), SubscriptionTier::Basic).await);
    }

    let mut handles = vec![];
    for container_id in ids.clone() {
        let controller = Arc::clone(&controller);
        handles.push(tokio::spawn(async move {
            for _ in 0..25 {
                controller.heartbeat(&container_id).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for container_id in &ids {
        let status = controller.get_status(container_id).await.unwrap();
        assert_eq!(status.state, LifecycleState::Running);
    }
    assert_eq!(controller.container_ids().await.len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_extensions_are_all_counted() {
    let controller = Arc::new(LifecycleController::new().unwrap());
    let container_id = running(&controller, "ctr-ext", SubscriptionTier::Enterprise).await;

    let results = race(10, || {
        let controller = Arc::clone(&controller);
        let container_id = container_id.clone();
        async move { controller.extend_timeout(&container_id, 5).await }
    })
    .await;

    assert!(results.iter().all(Result::is_ok));
    let status = controller.get_status(&container_id).await.unwrap();
    assert_eq!(status.extensions_used, 10);
    assert_eq!(status.extensions_remaining, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_extensions_respect_tier_count() {
    let controller = Arc::new(LifecycleController::new().unwrap());
    let container_id = running(&controller, "ctr-ext-basic", SubscriptionTier::Basic).await;

    let results = race(10, || {
        let controller = Arc::clone(&controller);
        let container_id = container_id.clone();
        async move { controller.extend_timeout(&container_id, 5).await }
    })
    .await;

    let granted = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(granted, 2);
    assert!(
        results
            .iter()
            .filter_map(|result| result.as_ref().err())
            .all(LifecycleError::is_tier_limit)
    );
    let status = controller.get_status(&container_id).await.unwrap();
    assert_eq!(status.extensions_used, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_hibernate_succeeds_once() {
    let controller = Arc::new(LifecycleController::new().unwrap());
    let container_id = running(&controller, "ctr-hib", SubscriptionTier::Pro).await;

    let results = race(10, || {
        let controller = Arc::clone(&controller);
        let container_id = container_id.clone();
        async move { controller.hibernate(&container_id).await }
    })
    .await;

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    let history = controller.history(&container_id).await.unwrap();
    let hibernations = history
        .iter()
        .filter(|entry| entry.to == LifecycleState::Hibernating)
        .count();
    assert_eq!(hibernations, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_provision_of_same_id() {
    let controller = Arc::new(LifecycleController::new().unwrap());
    let container_id: ContainerId = "ctr-dup".parse().unwrap();

    let results = race(10, || {
        let controller = Arc::clone(&controller);
        let container_id = container_id.clone();
        async move {
            controller
                .provision(container_id, SubscriptionTier::Free, None)
                .await
        }
    })
    .await;

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|result| result.as_ref().err())
            .all(|err| matches!(err, LifecycleError::ContainerExists(_)))
    );
    assert_eq!(controller.container_ids().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_races_wake_after_auto_wake() {
    let controller = Arc::new(LifecycleController::new().unwrap());
    let container_id = running(&controller, "ctr-wakers", SubscriptionTier::Pro).await;
    controller.hibernate(&container_id).await.unwrap();

    let results = race(8, || {
        let controller = Arc::clone(&controller);
        let container_id = container_id.clone();
        async move { controller.heartbeat(&container_id).await }
    })
    .await;

    assert!(results.iter().all(Result::is_ok));
    let history = controller.history(&container_id).await.unwrap();
    let wakes = history
        .iter()
        .filter(|entry| entry.to == LifecycleState::Waking)
        .count();
    assert_eq!(wakes, 1);
    assert_eq!(
        controller.get_status(&container_id).await.unwrap().state,
        LifecycleState::Running
    );
}

/// Store whose writes for one container park until released.
struct SlowStore {
    inner: InMemoryLifecycleStore,
    slow_id: ContainerId,
    holding: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl SlowStore {
    fn new(slow_id: &str) -> Self {
        Self {
            inner: InMemoryLifecycleStore::new(),
            slow_id: slow_id.parse().unwrap(),
            holding: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    async fn pause(&self, container_id: &ContainerId) {
        if *container_id == self.slow_id && self.holding.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }
}

#[async_trait]
impl LifecycleStore for SlowStore {
    async fn load(&self, container_id: &ContainerId) -> sandbox_lifecycle::Result<Option<LifecycleRecord>> {
        self.inner.load(container_id).await
    }

    async fn save(&self, container_id: &ContainerId, record: &LifecycleRecord) -> sandbox_lifecycle::Result<()> {
        self.pause(container_id).await;
        self.inner.save(container_id, record).await
    }

    async fn delete(&self, container_id: &ContainerId) -> sandbox_lifecycle::Result<()> {
        self.pause(container_id).await;
        self.inner.delete(container_id).await
    }

    async fn list(&self) -> sandbox_lifecycle::Result<Vec<ContainerId>> {
        self.inner.list().await
    }
}

fn slow_controller(store: &Arc<SlowStore>) -> Arc<LifecycleController> {
    Arc::new(
        LifecycleController::builder()
            .store(store.clone())
            .build()
            .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pending_provision_does_not_block_other_containers() {
    let store = Arc::new(SlowStore::new("ctr-slow"));
    let controller = slow_controller(&store);
    let other = running(&controller, "ctr-other", SubscriptionTier::Basic).await;

    store.holding.store(true, Ordering::SeqCst);
    let provisioning = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            controller
                .provision("ctr-slow".parse().unwrap(), SubscriptionTier::Basic, None)
                .await
        })
    };
    store.entered.notified().await;

    let heartbeat = timeout(Duration::from_secs(2), controller.heartbeat(&other)).await;
    assert!(matches!(heartbeat, Ok(Ok(_))));
    let third = timeout(
        Duration::from_secs(2),
        controller.provision("ctr-third".parse().unwrap(), SubscriptionTier::Free, None),
    )
    .await;
    assert!(matches!(third, Ok(Ok(_))));

    // the pending id is already taken
    assert!(matches!(
        controller
            .provision("ctr-slow".parse().unwrap(), SubscriptionTier::Free, None)
            .await,
        Err(LifecycleError::ContainerExists(_))
    ));

    store.holding.store(false, Ordering::SeqCst);
    store.release.notify_one();
    let status = provisioning.await.unwrap().unwrap();
    assert_eq!(status.state, LifecycleState::Starting);
    assert_eq!(controller.container_ids().await.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pending_remove_does_not_block_other_containers() {
    let store = Arc::new(SlowStore::new("ctr-slow"));
    let controller = slow_controller(&store);
    let other = running(&controller, "ctr-other", SubscriptionTier::Basic).await;
    let slow = running(&controller, "ctr-slow", SubscriptionTier::Basic).await;

    store.holding.store(true, Ordering::SeqCst);
    let removing = {
        let controller = Arc::clone(&controller);
        let slow = slow.clone();
        tokio::spawn(async move { controller.remove(&slow).await })
    };
    store.entered.notified().await;

    let heartbeat = timeout(Duration::from_secs(2), controller.heartbeat(&other)).await;
    assert!(matches!(heartbeat, Ok(Ok(_))));

    store.holding.store(false, Ordering::SeqCst);
    store.release.notify_one();
    removing.await.unwrap().unwrap();
    assert_eq!(controller.container_ids().await, vec![other]);
    assert!(matches!(
        controller.get_status(&slow).await,
        Err(LifecycleError::ContainerNotFound(_))
    ));
}
