use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_common::orders::MenuItem;

const DEFAULT_CONFIG_FILE: &str = "server_orders.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Food-ordering backend with real-time restaurant notifications", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "ORDERS_PORT", help = "Port to listen on for HTTP and WebSocket clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "ORDERS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "ORDERS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "ORDERS_LOG_LEVEL", help = "Log filter (trace, debug, info, warn, error, or a full directive).")]
    pub log_level: Option<String>,

    #[clap(long, env = "ORDERS_LOG_JSON", help = "Write logs as JSON lines (true/false).")]
    pub log_json: Option<bool>,

    #[clap(long, env = "DATABASE_URL", help = "PostgreSQL URL. Without it orders are kept in memory.")]
    pub database_url: Option<String>,

    #[clap(long, env = "ORDERS_DB_MAX_CONNECTIONS", help = "Maximum pooled database connections.")]
    pub db_max_connections: Option<usize>,

    #[clap(long, env = "ORDERS_JWT_SECRET", help = "HS256 secret shared with the token issuer.")]
    pub jwt_secret: Option<String>,

    #[clap(long, env = "ORDERS_IDLE_TIMEOUT_SECONDS", help = "Seconds a session waits for traffic before re-checking for shutdown.")]
    pub idle_timeout_seconds: Option<u64>,

    #[clap(long, env = "ORDERS_SEND_TIMEOUT_SECONDS", help = "Seconds a single notification send may take.")]
    pub send_timeout_seconds: Option<u64>,

    #[clap(long, env = "ORDERS_MAX_SESSIONS_PER_RESTAURANT", help = "Live dashboard connections allowed per restaurant.")]
    pub max_sessions_per_restaurant: Option<usize>,

    #[clap(long, env = "ORDERS_MENU_SEED_PATH", help = "JSON file with menu items to load at start-up.")]
    pub menu_seed_path: Option<PathBuf>,

    #[clap(long, env = "ORDERS_ALLOWED_ORIGINS", help = "Comma-separated CORS origins for the dashboard.")]
    pub allowed_origins: Option<String>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_json: other.log_json.or(self.log_json),
            database_url: other.database_url.or(self.database_url),
            db_max_connections: other.db_max_connections.or(self.db_max_connections),
            jwt_secret: other.jwt_secret.or(self.jwt_secret),
            idle_timeout_seconds: other.idle_timeout_seconds.or(self.idle_timeout_seconds),
            send_timeout_seconds: other.send_timeout_seconds.or(self.send_timeout_seconds),
            max_sessions_per_restaurant: other.max_sessions_per_restaurant.or(self.max_sessions_per_restaurant),
            menu_seed_path: other.menu_seed_path.or(self.menu_seed_path),
            allowed_origins: other.allowed_origins.or(self.allowed_origins),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(8000),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            log_json: Some(false),
            db_max_connections: Some(16),
            idle_timeout_seconds: Some(60),
            send_timeout_seconds: Some(10),
            max_sessions_per_restaurant: Some(64),
            allowed_origins: Some("http://localhost:5173".to_string()),
            ..Default::default()
        }
    }
}

/// Fully resolved settings, every default applied.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub log_json: bool,
    pub database_url: Option<String>,
    pub db_max_connections: usize,
    pub jwt_secret: String,
    pub idle_timeout: Duration,
    pub send_timeout: Duration,
    pub max_sessions_per_restaurant: usize,
    pub menu_seed_path: Option<PathBuf>,
    pub allowed_origins: Vec<String>,
    pub tls: Option<(PathBuf, PathBuf)>,
}

impl TryFrom<Config> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(config: Config) -> Result<Self> {
        let defaults = Config::defaults();
        let config = defaults.merge(config);

        let jwt_secret = match config.jwt_secret {
            Some(secret) if !secret.trim().is_empty() => secret,
            _ => bail!("a JWT secret is required (--jwt-secret or ORDERS_JWT_SECRET)"),
        };
        let idle_timeout_seconds = config.idle_timeout_seconds.unwrap_or(60);
        if idle_timeout_seconds == 0 {
            bail!("idle timeout must be at least one second");
        }

        let allowed_origins = config
            .allowed_origins
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();

        let tls = match (config.tls_cert_path, config.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (None, None) => None,
            _ => bail!("TLS needs both a certificate and a key path"),
        };

        Ok(ServerConfig {
            port: config.port.unwrap_or(8000),
            log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
            log_json: config.log_json.unwrap_or(false),
            database_url: config.database_url.filter(|url| !url.trim().is_empty()),
            db_max_connections: config.db_max_connections.unwrap_or(16),
            jwt_secret,
            idle_timeout: Duration::from_secs(idle_timeout_seconds),
            send_timeout: Duration::from_secs(config.send_timeout_seconds.unwrap_or(10)),
            max_sessions_per_restaurant: config.max_sessions_per_restaurant.unwrap_or(64),
            menu_seed_path: config.menu_seed_path,
            allowed_origins,
            tls,
        })
    }
}

/// Reads an optional JSON config file. A missing file is not an error; an
/// unreadable or malformed one is.
fn read_config_file(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        tracing::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return Ok(None);
    }
    let config_str = fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
    let file_config = serde_json::from_str::<Config>(&config_str)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(Some(file_config))
}

/// # Resolve Configuration
///
/// Precedence, highest first: CLI arguments and environment (both carried
/// by `cli`), the JSON file, built-in defaults. When no TLS paths are
/// configured, `~/.letsencrypt/{fullchain,privkey}.pem` is used if both files
/// exist; otherwise the server runs plain HTTP.
pub fn resolve_config(cli: Config) -> Result<ServerConfig> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = Config::default();
    if let Some(file_config) = read_config_file(&config_file_path)? {
        current = current.merge(file_config);
    }
    current = current.merge(cli);

    if current.tls_cert_path.is_none() && current.tls_key_path.is_none() {
        if let Some(home_dir) = dirs::home_dir() {
            let letsencrypt_dir = home_dir.join(".letsencrypt");
            let cert = letsencrypt_dir.join("fullchain.pem");
            let key = letsencrypt_dir.join("privkey.pem");
            if cert.exists() && key.exists() {
                current.tls_cert_path = Some(cert);
                current.tls_key_path = Some(key);
            }
        }
    }

    ServerConfig::try_from(current)
}

/// Parses CLI/environment once and resolves the full configuration.
pub fn load_config() -> Result<ServerConfig> {
    resolve_config(Config::parse())
}

/// Loads the menu seed file: a JSON array of menu items.
pub fn load_menu_seed(path: &Path) -> Result<Vec<MenuItem>> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read menu seed {}", path.display()))?;
    let items: Vec<MenuItem> =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse menu seed {}", path.display()))?;
    Ok(items)
}
