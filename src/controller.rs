use crate::error::ReconcileError;
use crate::queue::WorkQueue;
use crate::shipper::ShipperPool;
use crate::store::Store;
use crate::types::{ResourceKey, WatchedObject};
use k8s_openapi::api::core::v1::Pod;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Failed keys are retried this many times before being dropped.
pub const MAX_REQUEUES: u32 = 5;

/// Delay before a key deferred by a full shipping backlog is tried again.
pub const BACKLOG_RETRY: Duration = Duration::from_secs(1);

/// Log an error that could not be handled any other way, with its cause chain.
pub fn handle_error(err: &(dyn Error + 'static)) {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    error!("{}", message);
}

pub struct Controller {
    store: Store<Pod>,
    queue: WorkQueue,
    shippers: ShipperPool,
}

impl Controller {
    pub fn new(store: Store<Pod>, queue: WorkQueue, shippers: ShipperPool) -> Self {
        Self {
            store,
            queue,
            shippers,
        }
    }

    /// Run `workers` reconcile loops until `cancel` fires, then drain the
    /// queue and wait for every loop to exit.
    pub async fn run(self: Arc<Self>, workers: usize, cancel: CancellationToken) {
        info!("Starting pod controller with {} workers", workers);

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let controller = Arc::clone(&self);
                tokio::spawn(async move { while controller.process_next_item().await {} })
            })
            .collect();

        cancel.cancelled().await;
        info!("Stopping pod controller");
        if !self.queue.is_empty() {
            info!("Discarding {} queued pods", self.queue.len());
        }
        self.queue.shut_down_with_drain().await;

        for handle in handles {
            if let Err(e) = handle.await {
                handle_error(&e);
            }
        }
    }

    /// Take one key off the queue and reconcile it. Returns `false` once the
    /// queue is shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = self.sync_pod(&key).await;
        self.handle_result(result, &key);
        self.queue.done(&key);
        true
    }

    /// Resolve `key` against the cache and hand the pod to the shippers.
    ///
    /// The pod seen here may be newer than the event that queued the key.
    /// Shipping outcomes never come back through this path.
    pub async fn sync_pod(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        let Some(pod) = self.store.get_by_key(key) else {
            info!("Pod {} does not exist anymore", key);
            return Ok(());
        };
        self.shippers.dispatch(WatchedObject::from(pod.as_ref())).await
    }

    fn handle_result(&self, result: Result<(), ReconcileError>, key: &ResourceKey) {
        let Err(err) = result else {
            self.queue.forget(key);
            return;
        };

        // Backpressure defers the key without spending its retries.
        if let ReconcileError::BacklogFull(_) = err {
            debug!("Shipping backlog full, retrying pod {} in {:?}", key, BACKLOG_RETRY);
            self.queue.add_after(key.clone(), BACKLOG_RETRY);
            return;
        }

        if self.queue.num_requeues(key) < MAX_REQUEUES {
            info!("Error syncing pod {}: {}", key, err);
            self.queue.add_rate_limited(key.clone());
            return;
        }

        self.queue.forget(key);
        handle_error(&err);
        info!("Dropping pod {} out of the queue: {}", key, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shipper::tests::{FakeLogs, RecordingSink, SlowSink, object};
    use crate::shipper::{NotificationSink, ShipConfig, Shipper};
    use crate::utils::Filters;
    use kube::api::ObjectMeta;
    use tokio::sync::mpsc;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn controller(backlog: usize) -> (Arc<Controller>, mpsc::Receiver<WatchedObject>) {
        let (pool, rx) = ShipperPool::channel(backlog);
        let controller = Controller::new(Store::new(), WorkQueue::default(), pool);
        (Arc::new(controller), rx)
    }

    fn shipper(sink: Arc<dyn NotificationSink>) -> Arc<Shipper> {
        Arc::new(Shipper::new(
            ShipConfig {
                filters: Filters::default(),
                delay: Duration::from_secs(60),
                tail_lines: 10,
                chat_id: 7,
            },
            Arc::new(FakeLogs::default()),
            sink,
        ))
    }

    // A pod whose single container finished two seconds ago.
    fn terminated_pod(name: &str) -> Pod {
        let finished = chrono::Utc::now() - chrono::Duration::seconds(2);
        let started = finished - chrono::Duration::seconds(30);
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "namespace": "default" },
            "status": {
                "containerStatuses": [{
                    "name": "app",
                    "image": "busybox",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 0,
                    "state": { "terminated": {
                        "exitCode": 0,
                        "startedAt": started.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                        "finishedAt": finished.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    }},
                }],
            },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_cache_miss_is_success_without_shipping() {
        let (controller, mut rx) = controller(4);
        let key = ResourceKey::new("default", "gone");
        controller.queue.add(key.clone());

        assert!(controller.process_next_item().await);
        assert_eq!(controller.queue.num_requeues(&key), 0);
        assert!(controller.queue.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cached_pod_is_dispatched() {
        let (controller, mut rx) = controller(4);
        let key = controller.store.apply(pod("worker-1"));
        controller.queue.add(key.clone());

        assert!(controller.process_next_item().await);
        let dispatched = rx.try_recv().unwrap();
        assert_eq!(dispatched.key(), key);
        assert!(controller.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_key_requeued_five_times_then_dropped() {
        let (controller, rx) = controller(1);
        drop(rx);
        let key = controller.store.apply(pod("worker-1"));
        controller.queue.add(key.clone());

        // The first attempt plus five retries.
        for attempt in 0..=MAX_REQUEUES {
            assert_eq!(controller.queue.num_requeues(&key), attempt);
            assert!(controller.process_next_item().await);
        }

        assert_eq!(controller.queue.num_requeues(&key), 0);
        let next = tokio::time::timeout(Duration::from_secs(3600), controller.queue.get()).await;
        assert!(next.is_err(), "dropped key must not come back");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_requeues() {
        let (controller, mut rx) = controller(4);
        let key = controller.store.apply(pod("worker-1"));
        controller.queue.add_rate_limited(key.clone());
        controller.queue.add_rate_limited(key.clone());
        assert_eq!(controller.queue.num_requeues(&key), 2);

        assert!(controller.process_next_item().await);
        assert_eq!(controller.queue.num_requeues(&key), 0);
        assert_eq!(rx.recv().await.unwrap().name, "worker-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_backlog_defers_without_spending_retries() {
        let (controller, mut rx) = controller(1);
        let key = controller.store.apply(pod("worker-1"));
        controller
            .shippers
            .dispatch(object("filler", vec![]))
            .await
            .unwrap();

        controller.queue.add(key.clone());
        for _ in 0..=MAX_REQUEUES {
            assert!(controller.process_next_item().await);
            assert_eq!(controller.queue.num_requeues(&key), 0);
        }

        assert_eq!(rx.recv().await.unwrap().name, "filler");
        assert!(controller.process_next_item().await);
        assert_eq!(rx.recv().await.unwrap().name, "worker-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_beyond_backlog_is_fully_shipped() {
        let sink = Arc::new(SlowSink::new(Duration::from_millis(500)));
        let cancel = CancellationToken::new();
        let (pool, shipper_handles) =
            ShipperPool::spawn(shipper(sink.clone()), 1, 1, cancel.clone());

        let store = Store::new();
        let queue = WorkQueue::default();
        for i in 0..5 {
            queue.add(store.apply(terminated_pod(&format!("job-{}", i))));
        }
        let controller = Arc::new(Controller::new(store, queue.clone(), pool));
        let run = tokio::spawn(Arc::clone(&controller).run(1, cancel.clone()));

        for _ in 0..200 {
            if sink.sent.lock().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let mut sent = sink.sent.lock().clone();
        sent.sort();
        assert_eq!(
            sent,
            vec!["job-0_app", "job-1_app", "job-2_app", "job-3_app", "job-4_app"]
        );

        cancel.cancel();
        run.await.unwrap();
        for handle in shipper_handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_run_ships_and_stops_on_cancel() {
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let (pool, shipper_handles) = ShipperPool::spawn(shipper(sink.clone()), 1, 4, cancel.clone());

        let store = Store::new();
        let key = store.apply(terminated_pod("worker-1"));

        let queue = WorkQueue::default();
        let controller = Arc::new(Controller::new(store, queue.clone(), pool));
        let run = tokio::spawn(Arc::clone(&controller).run(2, cancel.clone()));
        queue.add(key);

        for _ in 0..100 {
            if !sink.sent.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.sent.lock()[0].1, "worker-1_app");

        cancel.cancel();
        run.await.unwrap();
        for handle in shipper_handles {
            handle.await.unwrap();
        }
        assert!(queue.is_shutting_down());
    }
}
