use anyhow::Result;
use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::audio::permissions::VoteRule;

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,

    // Nodo de audio
    pub lavalink_host: String,
    pub lavalink_port: u16,
    pub lavalink_password: String,
    pub lavalink_secure: bool,

    // Audio
    pub default_volume: u16,
    pub max_queue_size: usize,
    pub max_playlist_size: usize,

    // Sesiones
    pub idle_timeout: Duration,
    pub empty_channel_timeout: Duration,
    pub sweep_interval: Duration,
    pub session_idle_evict: Duration,
    pub session_inbox_capacity: usize,

    // Reconexión
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub reconnect_backoff_max: Duration,

    // Políticas
    pub min_listen: Duration,
    pub skip_vote_rule: VoteRule,
    pub resolve_cache_ttl: Duration,

    // Paths
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            application_id: std::env::var("APPLICATION_ID")?.parse()?,

            // Nodo de audio
            lavalink_host: env_or("LAVALINK_HOST", defaults.lavalink_host)?,
            lavalink_port: env_or("LAVALINK_PORT", defaults.lavalink_port)?,
            lavalink_password: env_or("LAVALINK_PASSWORD", defaults.lavalink_password)?,
            lavalink_secure: env_or("LAVALINK_SECURE", defaults.lavalink_secure)?,

            // Audio
            default_volume: env_or("DEFAULT_VOLUME", defaults.default_volume)?,
            max_queue_size: env_or("MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            max_playlist_size: env_or("MAX_PLAYLIST_SIZE", defaults.max_playlist_size)?,

            // Sesiones
            idle_timeout: env_secs("IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            empty_channel_timeout: env_secs(
                "EMPTY_CHANNEL_TIMEOUT_SECS",
                defaults.empty_channel_timeout,
            )?,
            sweep_interval: env_secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            session_idle_evict: env_secs("SESSION_IDLE_EVICT_SECS", defaults.session_idle_evict)?,
            session_inbox_capacity: env_or(
                "SESSION_INBOX_CAPACITY",
                defaults.session_inbox_capacity,
            )?,

            // Reconexión
            reconnect_attempts: env_or("RECONNECT_ATTEMPTS", defaults.reconnect_attempts)?,
            reconnect_backoff: env_millis("RECONNECT_BACKOFF_MS", defaults.reconnect_backoff)?,
            reconnect_backoff_max: env_millis(
                "RECONNECT_BACKOFF_MAX_MS",
                defaults.reconnect_backoff_max,
            )?,

            // Políticas
            min_listen: env_secs("MIN_LISTEN_SECS", defaults.min_listen)?,
            skip_vote_rule: env_or("SKIP_VOTE_RULE", defaults.skip_vote_rule)?,
            resolve_cache_ttl: env_secs("RESOLVE_CACHE_TTL_SECS", defaults.resolve_cache_ttl)?,

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
        };

        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// Rejects values that would leave sessions unable to play, reconnect
    /// or ever release their voice connection.
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > 1000 {
            anyhow::bail!("Default volume must be between 0 and 1000, got: {}", self.default_volume);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.max_playlist_size == 0 {
            anyhow::bail!("Max playlist size must be greater than 0");
        }

        if self.reconnect_attempts == 0 {
            anyhow::bail!("Reconnect attempts must be greater than 0");
        }

        if self.reconnect_backoff.is_zero() || self.reconnect_backoff > self.reconnect_backoff_max {
            anyhow::bail!(
                "Reconnect backoff must be positive and not exceed the max ({:?} > {:?})",
                self.reconnect_backoff,
                self.reconnect_backoff_max
            );
        }

        if self.sweep_interval.is_zero() || self.session_idle_evict.is_zero() {
            anyhow::bail!("Sweep interval and idle eviction window must be greater than 0");
        }

        if self.session_inbox_capacity == 0 {
            anyhow::bail!("Session inbox capacity must be greater than 0");
        }

        if self.lavalink_host.trim().is_empty() {
            anyhow::bail!("Lavalink host cannot be empty");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Tokens and passwords are never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {}\n  \
            Node: {}://{}:{}\n  \
            Audio: {}% vol, {} queue, {} playlist\n  \
            Sessions: idle {}, empty channel {}, evict after {}\n  \
            Reconnect: {} attempts, backoff {} (max {})\n  \
            Policy: min listen {}, skip vote {}",
            self.application_id,
            if self.lavalink_secure { "https" } else { "http" },
            self.lavalink_host,
            self.lavalink_port,
            self.default_volume,
            self.max_queue_size,
            self.max_playlist_size,
            humantime::format_duration(self.idle_timeout),
            humantime::format_duration(self.empty_channel_timeout),
            humantime::format_duration(self.session_idle_evict),
            self.reconnect_attempts,
            humantime::format_duration(self.reconnect_backoff),
            humantime::format_duration(self.reconnect_backoff_max),
            humantime::format_duration(self.min_listen),
            self.skip_vote_rule,
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,

            lavalink_host: "127.0.0.1".to_string(),
            lavalink_port: 2333,
            lavalink_password: "youshallnotpass".to_string(),
            lavalink_secure: false,

            default_volume: 100,
            max_queue_size: 1000,
            max_playlist_size: 100,

            idle_timeout: Duration::from_secs(30),
            empty_channel_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            session_idle_evict: Duration::from_secs(300),
            session_inbox_capacity: 64,

            reconnect_attempts: 2,
            reconnect_backoff: Duration::from_millis(1000),
            reconnect_backoff_max: Duration::from_millis(15_000),

            min_listen: Duration::from_secs(30),
            skip_vote_rule: VoteRule::Majority,
            resolve_cache_ttl: Duration::from_secs(600),

            data_dir: "/app/data".into(),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", key, e)),
        _ => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    env_or(key, default.as_millis() as u64).map(Duration::from_millis)
}
