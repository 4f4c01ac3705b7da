use crate::telegram::DEFAULT_API_URL;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pod-log-shipper")]
#[command(about = "Ship logs of freshly terminated pod containers to Telegram")]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// Print version and git commit, then exit
    #[arg(long)]
    pub version: bool,

    /// Seconds after container termination during which logs are still shipped
    #[arg(long, default_value_t = 60)]
    pub delay: i64,

    /// Telegram chat id that receives the logs
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub chat_id: i64,

    /// Path to a kubeconfig file; in-cluster credentials are used when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace to watch
    #[arg(short = 'n', long, default_value = "default")]
    pub namespace: String,

    /// Label selector restricting the watched pods
    #[arg(short = 'l', long)]
    pub selector: Option<String>,

    /// Pod name regex; may be repeated, any match admits the pod
    #[arg(long = "pod-name-pattern")]
    pub pod_name_patterns: Vec<String>,

    /// Exact container name; may be repeated
    #[arg(long = "container-name-pattern")]
    pub container_name_patterns: Vec<String>,

    /// Number of trailing log lines to ship per container
    #[arg(long, default_value_t = 100000)]
    pub tail: i64,

    /// Telegram bot token
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub telegram_token: Option<String>,

    /// Telegram Bot API base URL
    #[arg(long, default_value = DEFAULT_API_URL)]
    pub telegram_api_url: String,

    /// Number of reconcile workers
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Number of concurrent log shippers
    #[arg(long, default_value_t = 4)]
    pub shippers: usize,

    /// Pods that may wait for a free shipper before reconciles are retried
    #[arg(long, default_value_t = 64)]
    pub ship_backlog: usize,

    /// Seconds to wait for the initial pod listing
    #[arg(long, default_value_t = 120)]
    pub sync_timeout: u64,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Text printed by `--version`.
pub fn version_info() -> String {
    let version = env!("CARGO_PKG_VERSION");
    let commit = option_env!("GIT_COMMIT").unwrap_or_default();

    let mut rows = Vec::new();
    if !version.is_empty() {
        rows.push(("version:", version));
    }
    rows.push(("git commit:", commit));

    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0) + 2;
    rows.iter()
        .map(|(k, v)| format!("{:<width$}{}\n", k, v, width = width))
        .collect()
}
