use std::env;
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_DB_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_PENDING_ORDER_TTL_MINUTES: i64 = 30;
const DEFAULT_OUTBOX_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_CARRIER_NAME: &str = "ViettelPost";
const DEFAULT_TRACKING_URL_TEMPLATE: &str = "https://tracking.viettelpost.vn/?key={code}";

/// Carrier integration settings.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CarrierConfig {
    #[serde(default = "default_carrier_name")]
    pub name: String,

    /// Carrier service/product code sent on shipment creation, if any.
    #[serde(default)]
    pub service_code: Option<String>,

    /// Template for public tracking links, `{code}` replaced with the
    /// tracking code.
    #[serde(default = "default_tracking_url_template")]
    pub tracking_url_template: String,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            name: default_carrier_name(),
            service_code: None,
            tracking_url_template: default_tracking_url_template(),
        }
    }
}

impl CarrierConfig {
    pub fn tracking_url(&self, tracking_code: &str) -> String {
        self.tracking_url_template.replace("{code}", tracking_code)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1, message = "database_url is required"))]
    pub database_url: String,

    /// Fulfillment branch stock falls back to when an order carries no
    /// branch and its items embed no override.
    pub default_branch_id: Uuid,

    /// How long an unconfirmed pending order draft is kept.
    #[serde(default = "default_pending_order_ttl")]
    pub pending_order_ttl_minutes: i64,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Outbox worker polling interval.
    #[serde(default = "default_outbox_poll_interval_ms")]
    pub outbox_poll_interval_ms: u64,

    #[serde(default)]
    #[validate]
    pub carrier: CarrierConfig,
}

fn default_carrier_name() -> String {
    DEFAULT_CARRIER_NAME.to_string()
}

fn default_tracking_url_template() -> String {
    DEFAULT_TRACKING_URL_TEMPLATE.to_string()
}

fn default_pending_order_ttl() -> i64 {
    DEFAULT_PENDING_ORDER_TTL_MINUTES
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    DEFAULT_DB_MAX_CONNECTIONS
}

fn default_db_min_connections() -> u32 {
    DEFAULT_DB_MIN_CONNECTIONS
}

fn default_outbox_poll_interval_ms() -> u64 {
    DEFAULT_OUTBOX_POLL_INTERVAL_MS
}

impl AppConfig {
    /// Minimal constructor used by tests and embedding applications.
    pub fn new(database_url: impl Into<String>, default_branch_id: Uuid) -> Self {
        Self {
            database_url: database_url.into(),
            default_branch_id,
            pending_order_ttl_minutes: default_pending_order_ttl(),
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            outbox_poll_interval_ms: default_outbox_poll_interval_ms(),
            carrier: CarrierConfig::default(),
        }
    }

    /// Loads configuration from layered files and the environment.
    ///
    /// `config/default.toml` is read first, then `config/<env>.toml`, then
    /// `ORDERFLOW__`-prefixed environment variables override everything.
    pub fn load() -> Result<Self, ConfigError> {
        let environment = env::var("APP_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

        let config: AppConfig = Config::builder()
            .add_source(File::from(Path::new(CONFIG_DIR).join("default")).required(false))
            .add_source(File::from(Path::new(CONFIG_DIR).join(&environment)).required(false))
            .add_source(Environment::with_prefix("ORDERFLOW").separator("__"))
            .set_override("environment", environment)?
            .build()?
            .try_deserialize()?;

        config
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;

        Ok(config)
    }
}

/// Initializes the global tracing subscriber. Safe to call more than once;
/// later calls are ignored.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("orderflow={level}");
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);
    let filter = EnvFilter::try_new(filter_directive).unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}
