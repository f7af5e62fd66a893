//! Configuration for the ticket job queue.
//!
//! Covers the broker location and reconnect policy, worker tuning, the delays
//! and retry budgets used for ticket jobs, the admin endpoint and logging.
//! Durations are written as human-readable strings ("500ms", "3s", "15m").

use crate::{job::JobOptions, retry::BackoffPolicy};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

/// Module for serializing std::time::Duration as human-readable strings
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(D::Error::custom)
    }

    pub(super) fn format(duration: &Duration) -> String {
        let millis = duration.as_millis();
        if millis == 0 {
            "0s".to_string()
        } else if millis % 1000 != 0 {
            format!("{}ms", millis)
        } else {
            let secs = duration.as_secs();
            if secs % 3600 == 0 {
                format!("{}h", secs / 3600)
            } else if secs % 60 == 0 {
                format!("{}m", secs / 60)
            } else {
                format!("{}s", secs)
            }
        }
    }

    /// Parse a duration string like "250ms", "30s", "5m", "1h", "90", etc.
    pub(super) fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        // Bare numbers are seconds
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(num_str) = s.strip_suffix("ms") {
            let num: u64 = num_str
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
            return Ok(Duration::from_millis(num));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        let unit = match suffix {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            _ => {
                return Err(format!(
                    "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                    suffix
                ));
            }
        };

        num.checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Duration out of range: {}", s))
    }
}

mod duration_str_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&super::duration_str::format(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        Option::<String>::deserialize(deserializer)?
            .map(|s| super::duration_str::parse(&s).map_err(D::Error::custom))
            .transpose()
    }
}

/// Top-level configuration.
///
/// # Examples
///
/// ```rust
/// use ticket_queue::config::TicketQueueConfig;
/// use std::time::Duration;
///
/// let config = TicketQueueConfig::new()
///     .with_broker_host("db.internal", 5432)
///     .with_queue_name("tickets")
///     .with_poll_interval(Duration::from_millis(250));
///
/// assert_eq!(config.worker.queue_name, "tickets");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TicketQueueConfig {
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub scheduling: SchedulingConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

impl TicketQueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a full connection URL instead of host/port.
    pub fn with_broker_url(mut self, url: &str) -> Self {
        self.broker.url = Some(url.to_string());
        self
    }

    pub fn with_broker_host(mut self, host: &str, port: u16) -> Self {
        self.broker.host = host.to_string();
        self.broker.port = port;
        self
    }

    pub fn with_queue_name(mut self, name: &str) -> Self {
        self.worker.queue_name = name.to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.worker.poll_interval = interval;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.worker.concurrency = concurrency;
        self
    }

    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.worker.shutdown_grace_period = grace;
        self
    }

    pub fn with_stalled_after(mut self, lease: Duration) -> Self {
        self.worker.stalled_after = lease;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overridden by `TICKET_QUEUE_*` environment variables.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("TICKET_QUEUE_BROKER_URL") {
            config.broker.url = Some(url);
        }
        if let Ok(host) = std::env::var("TICKET_QUEUE_BROKER_HOST") {
            config.broker.host = host;
        }
        if let Ok(port) = std::env::var("TICKET_QUEUE_BROKER_PORT") {
            config.broker.port = port.parse().map_err(|_| {
                crate::TicketQueueError::Config(format!("Invalid broker port: {}", port))
            })?;
        }
        if let Ok(database) = std::env::var("TICKET_QUEUE_BROKER_DATABASE") {
            config.broker.database = database;
        }
        if let Ok(pool_size) = std::env::var("TICKET_QUEUE_BROKER_POOL_SIZE") {
            config.broker.pool_size = pool_size.parse().map_err(|_| {
                crate::TicketQueueError::Config(format!("Invalid pool size: {}", pool_size))
            })?;
        }

        if let Ok(queue_name) = std::env::var("TICKET_QUEUE_NAME") {
            config.worker.queue_name = queue_name;
        }
        if let Ok(concurrency) = std::env::var("TICKET_QUEUE_WORKER_CONCURRENCY") {
            config.worker.concurrency = concurrency.parse().map_err(|_| {
                crate::TicketQueueError::Config(format!(
                    "Invalid worker concurrency: {}",
                    concurrency
                ))
            })?;
        }

        if let Ok(addr) = std::env::var("TICKET_QUEUE_ADMIN_ADDR") {
            config.admin.bind_address = addr
                .parse()
                .map_err(|_| crate::TicketQueueError::Config(format!("Invalid address: {}", addr)))?;
        }

        if let Ok(level) = std::env::var("TICKET_QUEUE_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }
}

/// How the broker connection is re-established after a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts made before giving up on the initial connection
    pub max_attempts: u32,

    #[serde(with = "duration_str")]
    pub initial_delay: Duration,

    #[serde(with = "duration_str")]
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Broker location and pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Full connection URL; takes precedence over the individual fields
    pub url: Option<String>,

    pub host: String,

    pub port: u16,

    pub database: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Connection pool size
    pub pool_size: u32,

    /// Time allowed to obtain a connection before the call fails
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,

    pub reconnect: ReconnectPolicy,

    /// Create the job table on startup if it doesn't exist
    pub create_tables: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".to_string(),
            port: 5432,
            database: "ticket_queue".to_string(),
            username: None,
            password: None,
            pool_size: 10,
            connect_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            create_tables: true,
        }
    }
}

impl BrokerConfig {
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        let credentials = match (&self.username, &self.password) {
            (Some(user), Some(password)) => format!("{}:{}@", user, password),
            (Some(user), None) => format!("{}@", user),
            _ => String::new(),
        };

        format!(
            "postgresql://{}{}:{}/{}",
            credentials, self.host, self.port, self.database
        )
    }

    /// Connection target without credentials, for logs.
    pub fn display_target(&self) -> String {
        match &self.url {
            Some(url) => match url.rsplit_once('@') {
                Some((_, target)) => target.to_string(),
                None => url.clone(),
            },
            None => format!("{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queue the worker consumes and the default queue for stats
    pub queue_name: String,

    /// Polling interval when no job is ready
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,

    /// Maximum number of handlers running at once
    pub concurrency: usize,

    /// Optional limit on a single handler invocation
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_str_opt")]
    pub job_timeout: Option<Duration>,

    /// How long shutdown waits for in-flight handlers before aborting them
    #[serde(with = "duration_str")]
    pub shutdown_grace_period: Duration,

    /// Claim lease: an active job older than this is assumed abandoned and
    /// handed back to the queue. Must exceed any `job_timeout`.
    #[serde(with = "duration_str")]
    pub stalled_after: Duration,

    /// How often the worker sweeps for stalled jobs
    #[serde(with = "duration_str")]
    pub stall_check_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: crate::DEFAULT_QUEUE_NAME.to_string(),
            poll_interval: Duration::from_millis(500),
            concurrency: 1,
            job_timeout: None,
            shutdown_grace_period: Duration::from_secs(30),
            stalled_after: Duration::from_secs(15 * 60),
            stall_check_interval: Duration::from_secs(30),
        }
    }
}

/// Delays and retry budgets for the jobs scheduled on ticket events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Debounce before the creation notification is sent
    #[serde(with = "duration_str")]
    pub notify_delay: Duration,

    pub notify_attempts: u32,

    /// Base of the exponential backoff between notification attempts
    #[serde(with = "duration_str")]
    pub notify_backoff: Duration,

    /// SLA window after which an unresolved ticket is escalated
    #[serde(with = "duration_str")]
    pub sla_window: Duration,

    pub sla_attempts: u32,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            notify_delay: Duration::from_secs(3),
            notify_attempts: 3,
            notify_backoff: Duration::from_secs(3),
            sla_window: Duration::from_secs(15 * 60),
            sla_attempts: 1,
        }
    }
}

impl SchedulingConfig {
    pub fn notify_options(&self, id: String) -> JobOptions {
        JobOptions::new(id)
            .with_delay(self.notify_delay)
            .with_attempts(self.notify_attempts)
            .with_backoff(BackoffPolicy::exponential(self.notify_backoff))
    }

    pub fn sla_options(&self, id: String) -> JobOptions {
        JobOptions::new(id)
            .with_delay(self.sla_window)
            .with_attempts(self.sla_attempts)
    }
}

/// Admin endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub bind_address: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 3001)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to enable structured JSON logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}
