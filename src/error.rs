use crate::types::ResourceKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pod name pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("telegram bot token is required (--telegram-token or TELEGRAM_BOT_TOKEN)")]
    MissingToken,

    #[error("--{0} must be at least 1")]
    EmptyPool(&'static str),

    #[error("failed to load kubeconfig {path}: {source}")]
    Kubeconfig {
        path: String,
        #[source]
        source: kube::config::KubeconfigError,
    },
}

/// Failure while resolving or dispatching a queued key.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("shipping backlog is full, deferring {0}")]
    BacklogFull(ResourceKey),

    #[error("shipper pool is closed, cannot dispatch {0}")]
    ShipperClosed(ResourceKey),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request to notification sink failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification sink rejected delivery (status {status}): {description}")]
    Rejected { status: u16, description: String },
}

/// Failure while fetching or forwarding one container's logs.
#[derive(Debug, Error)]
pub enum ShipError {
    #[error("failed to open log stream: {0}")]
    Stream(#[from] kube::Error),

    #[error("failed to read log stream: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to deliver logs: {0}")]
    Sink(#[from] SinkError),
}
