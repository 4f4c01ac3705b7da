use crate::error::{ReconcileError, ShipError, SinkError};
use crate::types::{DeliveryRequest, WatchedObject};
use crate::utils::{Filters, is_container_log_ready};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Source of container logs.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Fetch up to `tail_lines` trailing lines of a container's logs.
    async fn fetch(
        &self,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
        tail_lines: i64,
    ) -> Result<Vec<u8>, ShipError>;
}

/// Destination for collected logs.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, chat_id: i64, buffer: Vec<u8>, label: &str) -> Result<(), SinkError>;
}

/// Settings the shipping path needs, carved out of the process config.
#[derive(Debug, Clone)]
pub struct ShipConfig {
    pub filters: Filters,
    pub delay: Duration,
    pub tail_lines: i64,
    pub chat_id: i64,
}

pub struct Shipper {
    config: ShipConfig,
    logs: Arc<dyn LogSource>,
    sink: Arc<dyn NotificationSink>,
}

impl Shipper {
    pub fn new(config: ShipConfig, logs: Arc<dyn LogSource>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { config, logs, sink }
    }

    /// Names of the containers whose logs should ship at `now`.
    pub fn eligible_containers<'a>(&self, obj: &'a WatchedObject, now: DateTime<Utc>) -> Vec<&'a str> {
        if !self.config.filters.admits_pod(&obj.name) {
            return Vec::new();
        }
        obj.containers
            .iter()
            .filter(|cs| self.config.filters.admits_container(&cs.name))
            .filter(|cs| is_container_log_ready(cs, now, self.config.delay))
            .map(|cs| cs.name.as_str())
            .collect()
    }

    /// Ship every eligible container of `obj`. Each container is independent:
    /// a failure is logged and the remaining containers still ship.
    pub async fn ship(&self, obj: &WatchedObject) {
        debug!("Event from pod: {} (uid {})", obj.name, obj.uid);

        for container in self.eligible_containers(obj, Utc::now()) {
            info!(
                "Send logs from pod: {}, container: {}",
                obj.name, container
            );
            if let Err(e) = self.ship_container(obj, container).await {
                error!(
                    "Failed to send logs of pod {}/{} container {}: {}",
                    obj.namespace, obj.name, container, e
                );
            }
        }
    }

    async fn ship_container(&self, obj: &WatchedObject, container: &str) -> Result<(), ShipError> {
        let buffer = self
            .logs
            .fetch(&obj.namespace, &obj.name, container, self.config.tail_lines)
            .await?;

        let request = DeliveryRequest {
            namespace: obj.namespace.clone(),
            pod_name: obj.name.clone(),
            container_name: container.to_string(),
            buffer,
        };
        if request.buffer.is_empty() {
            debug!(
                "No logs for {}/{} container {}, nothing to send",
                request.namespace, request.pod_name, request.container_name
            );
            return Ok(());
        }

        let label = request.label();
        self.sink
            .send(self.config.chat_id, request.buffer, &label)
            .await?;
        Ok(())
    }
}

/// How long a dispatch waits for room in a full backlog.
pub const DISPATCH_WAIT: Duration = Duration::from_secs(5);

/// Bounded hand-off from the reconciler to the shipper tasks.
#[derive(Clone)]
pub struct ShipperPool {
    tx: mpsc::Sender<WatchedObject>,
    wait: Duration,
}

impl ShipperPool {
    /// Build the hand-off without workers attached.
    pub fn channel(backlog: usize) -> (Self, mpsc::Receiver<WatchedObject>) {
        let (tx, rx) = mpsc::channel(backlog);
        (
            Self {
                tx,
                wait: DISPATCH_WAIT,
            },
            rx,
        )
    }

    /// Start `size` shipper tasks draining a backlog of `backlog` objects.
    ///
    /// Idle shippers exit on `cancel`; a shipper already delivering finishes
    /// that object first.
    pub fn spawn(
        shipper: Arc<Shipper>,
        size: usize,
        backlog: usize,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (pool, rx) = Self::channel(backlog);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..size)
            .map(|id| {
                let shipper = Arc::clone(&shipper);
                let rx = Arc::clone(&rx);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            obj = async { rx.lock().await.recv().await } => obj,
                        };
                        let Some(obj) = next else {
                            break;
                        };
                        shipper.ship(&obj).await;
                    }
                    debug!("Shipper {} stopped", id);
                })
            })
            .collect();

        (pool, handles)
    }

    /// Queue `obj` for shipping, waiting a bounded time for room.
    pub async fn dispatch(&self, obj: WatchedObject) -> Result<(), ReconcileError> {
        let key = obj.key();
        match tokio::time::timeout(self.wait, self.tx.send(obj)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ReconcileError::ShipperClosed(key)),
            Err(_) => Err(ReconcileError::BacklogFull(key)),
        }
    }
}
