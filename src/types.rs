use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerState, Pod};
use kube::{Resource, ResourceExt};
use std::fmt;

/// Canonical `<namespace>/<name>` identity of a watched object.
///
/// Cluster-scoped objects have no namespace and are keyed by name alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        if namespace.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{}/{}", namespace, name))
        }
    }

    pub fn from_object<K: Resource>(obj: &K) -> Self {
        let namespace = obj.meta().namespace.as_deref().unwrap_or_default();
        Self::new(namespace, &obj.name_any())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a single container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Waiting,
    Running,
    Terminated {
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub name: String,
    pub state: State,
}

/// Snapshot of a pod reduced to what shipping decisions need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedObject {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub containers: Vec<ContainerStatus>,
}

impl WatchedObject {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.name)
    }
}

impl From<&Pod> for WatchedObject {
    fn from(pod: &Pod) -> Self {
        let containers = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| {
                statuses
                    .iter()
                    .map(|cs| ContainerStatus {
                        name: cs.name.clone(),
                        state: container_state(cs.state.as_ref()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            namespace: pod.namespace().unwrap_or_default(),
            name: pod.name_any(),
            uid: pod.uid().unwrap_or_default(),
            containers,
        }
    }
}

fn container_state(state: Option<&ContainerState>) -> State {
    match state {
        Some(ContainerState {
            terminated: Some(t),
            ..
        }) => State::Terminated {
            started_at: t.started_at.as_ref().map(|time| time.0),
            finished_at: t.finished_at.as_ref().map(|time| time.0),
        },
        Some(ContainerState {
            running: Some(_), ..
        }) => State::Running,
        _ => State::Waiting,
    }
}

/// One container's log buffer on its way to the notification sink.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub buffer: Vec<u8>,
}

impl DeliveryRequest {
    /// Label the sink shows next to the logs: `<podName>_<containerName>`.
    pub fn label(&self) -> String {
        format!("{}_{}", self.pod_name, self.container_name)
    }
}
