use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use clap::Parser;
use lib_andon::{CategoryTable, ReconnectPolicy, StationLayout};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[command(about = "Andon station telemetry server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[arg(long, env = "ANDON_PORT", help = "Port to listen on for dashboard connections.")]
    pub port: Option<u16>,

    #[arg(long, env = "ANDON_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "ANDON_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "ANDON_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "ANDON_BROKER_URL", help = "Redis URL of the pub/sub broker.")]
    pub broker_url: Option<String>,

    #[arg(long, env = "ANDON_TOPIC_PREFIX", help = "Stations publish on {prefix}/{stationId}.")]
    pub topic_prefix: Option<String>,

    #[arg(long, env = "DATABASE_URL", help = "PostgreSQL connection string. Without it, state is kept in memory only.")]
    pub database_url: Option<String>,

    #[arg(long, env = "ANDON_DB_POOL_SIZE", help = "Maximum pooled PostgreSQL connections.")]
    pub db_pool_size: Option<usize>,

    #[arg(long, env = "ANDON_RECONNECT_MAX_ATTEMPTS", help = "Reconnect attempts before the broker connection is declared lost for good.")]
    pub reconnect_max_attempts: Option<u32>,

    #[arg(long, env = "ANDON_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for broker reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[arg(long, env = "ANDON_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for broker reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[arg(long, env = "ANDON_CHANNEL_COUNT", help = "Number of (level, counter) pairs per frame.")]
    pub channel_count: Option<usize>,

    #[arg(long, env = "ANDON_PRODUCTION_CHANNEL", help = "Channel whose counter is the production count.")]
    pub production_channel: Option<usize>,

    /// Channel index (as a string key) to category name. Config file only.
    #[arg(skip)]
    pub categories: Option<BTreeMap<String, String>>,

    #[arg(long, env = "ANDON_TIMEZONE", help = "IANA time zone used to date downtime (e.g. Europe/Athens).")]
    pub timezone: Option<String>,

    #[arg(long, env = "ANDON_PLANNED_COUNT", help = "Planned count given to a station row on first insert.")]
    pub planned_count: Option<u64>,

    #[arg(long, env = "ANDON_SUBSCRIBER_BUFFER", help = "Per-subscriber broadcast queue capacity.")]
    pub subscriber_buffer: Option<usize>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            broker_url: other.broker_url.or(self.broker_url),
            topic_prefix: other.topic_prefix.or(self.topic_prefix),
            database_url: other.database_url.or(self.database_url),
            db_pool_size: other.db_pool_size.or(self.db_pool_size),
            reconnect_max_attempts: other.reconnect_max_attempts.or(self.reconnect_max_attempts),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            channel_count: other.channel_count.or(self.channel_count),
            production_channel: other.production_channel.or(self.production_channel),
            categories: other.categories.or(self.categories),
            timezone: other.timezone.or(self.timezone),
            planned_count: other.planned_count.or(self.planned_count),
            subscriber_buffer: other.subscriber_buffer.or(self.subscriber_buffer),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(5000),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            broker_url: Some("redis://127.0.0.1:6379/".to_string()),
            topic_prefix: Some("devices".to_string()),
            db_pool_size: Some(16),
            reconnect_max_attempts: Some(10),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(60000),
            channel_count: Some(lib_andon::telemetry::DEFAULT_CHANNEL_COUNT),
            production_channel: Some(lib_andon::telemetry::DEFAULT_PRODUCTION_CHANNEL),
            timezone: Some("UTC".to_string()),
            planned_count: Some(100),
            subscriber_buffer: Some(256),
            ..Default::default()
        }
    }

    /// Validates the merged configuration into the values the server runs on.
    pub fn into_settings(self) -> Result<Settings> {
        let defaults = Config::defaults();
        let cfg = defaults.merge(self);

        let categories = match cfg.categories {
            Some(map) => {
                let entries = map
                    .iter()
                    .map(|(channel, name)| {
                        channel
                            .trim()
                            .parse::<usize>()
                            .map(|channel| (channel, name.as_str()))
                            .map_err(|_| anyhow!("category key '{}' is not a channel index", channel))
                    })
                    .collect::<Result<Vec<_>>>()?;
                CategoryTable::new(entries)?
            }
            None => CategoryTable::default(),
        };
        let layout = StationLayout::new(
            cfg.channel_count.unwrap_or(lib_andon::telemetry::DEFAULT_CHANNEL_COUNT),
            cfg.production_channel.unwrap_or(lib_andon::telemetry::DEFAULT_PRODUCTION_CHANNEL),
            categories,
        )
        .context("invalid station layout")?;

        let timezone_name = cfg.timezone.unwrap_or_else(|| "UTC".to_string());
        let timezone: Tz = timezone_name
            .parse()
            .map_err(|e| anyhow!("invalid timezone '{}': {}", timezone_name, e))?;

        Ok(Settings {
            port: cfg.port.unwrap_or(5000),
            log_dir: cfg.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: cfg.log_level.unwrap_or_else(|| "info".to_string()),
            broker_url: cfg.broker_url.unwrap_or_else(|| "redis://127.0.0.1:6379/".to_string()),
            topic_prefix: cfg.topic_prefix.unwrap_or_else(|| "devices".to_string()),
            database_url: cfg.database_url.filter(|url| !url.trim().is_empty()),
            db_pool_size: cfg.db_pool_size.unwrap_or(16).max(1),
            reconnect: ReconnectPolicy::new(
                cfg.reconnect_max_attempts.unwrap_or(10),
                Duration::from_millis(cfg.reconnect_base_delay_ms.unwrap_or(1000)),
                Duration::from_millis(cfg.reconnect_max_delay_ms.unwrap_or(60000)),
            ),
            layout,
            timezone,
            planned_count: cfg.planned_count.unwrap_or(100),
            subscriber_buffer: cfg.subscriber_buffer.unwrap_or(256),
        })
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub broker_url: String,
    pub topic_prefix: String,
    pub database_url: Option<String>,
    pub db_pool_size: usize,
    pub reconnect: ReconnectPolicy,
    pub layout: StationLayout,
    pub timezone: Tz,
    pub planned_count: u64,
    pub subscriber_buffer: usize,
}

/// Reads the optional JSON config file. A missing or unreadable file falls back to the other
/// sources with a warning.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers the sources: defaults, then the config file, then environment variables and CLI
/// arguments (clap reads both).
pub fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_andon.conf"));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}
