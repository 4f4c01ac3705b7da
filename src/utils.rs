use crate::types::{ContainerStatus, State};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::time::Duration;

/// Pod and container admission filters. An empty list admits everything.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    pod_patterns: Vec<Regex>,
    container_names: Vec<String>,
}

impl Filters {
    pub fn new(pod_patterns: Vec<Regex>, container_names: Vec<String>) -> Self {
        Self {
            pod_patterns,
            container_names,
        }
    }

    /// Compile pod-name patterns, failing on the first invalid one.
    pub fn compile(
        pod_patterns: &[String],
        container_names: &[String],
    ) -> Result<Self, regex::Error> {
        let pod_patterns = pod_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(pod_patterns, container_names.to_vec()))
    }

    /// Any pattern matching anywhere in the name admits the pod.
    pub fn admits_pod(&self, pod_name: &str) -> bool {
        self.pod_patterns.is_empty() || self.pod_patterns.iter().any(|re| re.is_match(pod_name))
    }

    /// Container names are compared verbatim.
    pub fn admits_container(&self, container_name: &str) -> bool {
        self.container_names.is_empty() || self.container_names.iter().any(|n| n == container_name)
    }
}

/// Check whether a container's logs are still worth shipping at `now`.
///
/// Only terminated containers qualify, and only while fewer than `delay`
/// whole seconds have passed since they finished. A start time that is not
/// strictly before the finish time marks a malformed status and never
/// qualifies.
pub fn is_container_log_ready(status: &ContainerStatus, now: DateTime<Utc>, delay: Duration) -> bool {
    let State::Terminated {
        started_at,
        finished_at,
    } = &status.state
    else {
        return false;
    };
    let Some(finished_at) = finished_at else {
        return false;
    };

    let finished = finished_at.timestamp();
    // A missing start time sorts before any finish time.
    let started = started_at.map(|t| t.timestamp()).unwrap_or(i64::MIN);
    let elapsed = now.timestamp() - finished;

    started < finished && elapsed < delay.as_secs() as i64
}
