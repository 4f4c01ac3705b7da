use crate::error::{ConfigError, ShipError};
use crate::queue::WorkQueue;
use crate::shipper::LogSource;
use crate::store::Store;
use async_trait::async_trait;
use futures::io::AsyncReadExt;
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{Config as WatcherConfig, Event, watcher};
use kube::{Api, Client, api::LogParams};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Build a client from an explicit kubeconfig, or from the in-cluster
/// service account when none is given.
pub async fn build_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|source| ConfigError::Kubeconfig {
                path: path.display().to_string(),
                source,
            })?;
            info!("Using kubeconfig: {}", path.display());
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => {
            info!("Using in-cluster configuration");
            kube::Config::incluster()?
        }
    };
    Ok(Client::try_from(config)?)
}

/// Reads container logs through the pod `log` subresource.
pub struct KubeLogSource {
    client: Client,
}

impl KubeLogSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogSource for KubeLogSource {
    async fn fetch(
        &self,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
        tail_lines: i64,
    ) -> Result<Vec<u8>, ShipError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = LogParams {
            container: Some(container_name.to_string()),
            tail_lines: Some(tail_lines),
            ..Default::default()
        };

        let stream = api.log_stream(pod_name, &lp).await?;
        let mut reader = Box::pin(stream);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

/// Keeps a [`Store`] in step with the cluster and enqueues every key it
/// touches.
pub struct ChangeFeed {
    api: Api<Pod>,
    config: WatcherConfig,
    namespace: String,
    store: Store<Pod>,
    queue: WorkQueue,
    // Objects collected during a (re)list, applied at once on InitDone.
    relist: Option<Vec<Pod>>,
}

impl ChangeFeed {
    pub fn new(
        client: Client,
        namespace: &str,
        label_selector: Option<&str>,
        store: Store<Pod>,
        queue: WorkQueue,
    ) -> Self {
        let mut config = WatcherConfig::default();
        if let Some(selector) = label_selector {
            config = config.labels(selector);
        }
        Self {
            api: Api::namespaced(client, namespace),
            config,
            namespace: namespace.to_string(),
            store,
            queue,
            relist: None,
        }
    }

    /// Watch until `cancel` fires. Stream errors are retried with backoff
    /// and never end the feed.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut stream = watcher(self.api.clone(), self.config.clone())
            .default_backoff()
            .boxed();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => self.apply(event),
                Some(Err(e)) => warn!("Pod watch in namespace {} failed, retrying: {}", self.namespace, e),
                None => {
                    warn!("Pod watch stream for namespace {} ended", self.namespace);
                    break;
                }
            }
        }
        info!("Stopped pod watcher for namespace: {}", self.namespace);
    }

    /// Fold one watch event into the cache, then enqueue the affected keys.
    pub fn apply(&mut self, event: Event<Pod>) {
        match event {
            Event::Init => {
                debug!("Listing pods in namespace: {}", self.namespace);
                self.relist = Some(Vec::new());
            }
            Event::InitApply(pod) => {
                self.relist.get_or_insert_with(Vec::new).push(pod);
            }
            Event::InitDone => {
                let pods = self.relist.take().unwrap_or_default();
                let resync = self.store.has_synced();
                let keys = self.store.replace(pods);
                info!(
                    "Pod cache {} for namespace {}: {} pods",
                    if resync { "resynced" } else { "synced" },
                    self.namespace,
                    self.store.len()
                );
                for key in keys {
                    self.queue.add(key);
                }
                self.store.mark_synced();
            }
            Event::Apply(pod) => {
                let key = self.store.apply(pod);
                self.queue.add(key);
            }
            Event::Delete(pod) => {
                let key = self.store.delete(&pod);
                self.queue.add(key);
            }
        }
    }
}
