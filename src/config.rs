use crate::cli::Cli;
use crate::error::ConfigError;
use crate::shipper::ShipConfig;
use crate::telegram::TelegramConfig;
use crate::utils::Filters;
use std::path::PathBuf;
use std::time::Duration;

/// Validated runtime configuration, built once from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    pub label_selector: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub ship: ShipConfig,
    pub telegram: TelegramConfig,
    pub workers: usize,
    pub shippers: usize,
    pub ship_backlog: usize,
    pub sync_timeout: Duration,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let filters = Filters::compile(&cli.pod_name_patterns, &cli.container_name_patterns)?;

        let token = cli
            .telegram_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken)?;

        for (flag, value) in [
            ("workers", cli.workers),
            ("shippers", cli.shippers),
            ("ship-backlog", cli.ship_backlog),
        ] {
            if value == 0 {
                return Err(ConfigError::EmptyPool(flag));
            }
        }

        Ok(Self {
            namespace: cli.namespace.clone(),
            label_selector: cli.selector.clone().filter(|s| !s.is_empty()),
            kubeconfig: cli.kubeconfig.clone().filter(|p| !p.as_os_str().is_empty()),
            ship: ShipConfig {
                filters,
                // Negative windows are clamped to zero.
                delay: Duration::from_secs(cli.delay.max(0) as u64),
                tail_lines: cli.tail,
                chat_id: cli.chat_id,
            },
            telegram: TelegramConfig {
                token: token.to_string(),
                api_url: cli.telegram_api_url.clone(),
            },
            workers: cli.workers,
            shippers: cli.shippers,
            ship_backlog: cli.ship_backlog,
            sync_timeout: Duration::from_secs(cli.sync_timeout),
        })
    }
}
