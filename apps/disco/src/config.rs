use std::env;
use std::time::Duration;

const DEFAULT_TOKEN_URL: &str = "https://public-ubiservices.ubi.com/v3/profiles/sessions";
const DEFAULT_PAIRING_INFO_URL: &str = "https://prod.just-dance.com/sessions/v1/pairing-info";
const DEFAULT_PUNCH_PAIRING_URL: &str = "https://prod.just-dance.com/sessions/v1/punch-pairing";

const DEFAULT_APP_ID: &str = "210da0fb-d6a5-4ed1-9808-01e86f0de7fb";
const DEFAULT_SKU_ID: &str = "jdcompanion-android";

/// Application configuration, loaded from `DISCO_*` environment variables
/// with production defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Profile-session endpoint that exchanges the app id for a bearer ticket.
    pub token_url: String,
    /// Pairing-info endpoint; the pairing code is passed as a query parameter.
    pub pairing_info_url: String,
    /// Punch-pairing initiation endpoint.
    pub punch_pairing_url: String,
    /// Application identifier header value.
    pub app_id: String,
    /// SKU identifier header value.
    pub sku_id: String,
    /// Port the console listens on when connecting by IP.
    pub direct_connect_port: u16,
    /// Half-open port range the hole-punch listener binds in.
    pub punch_port_min: u16,
    pub punch_port_max: u16,
    /// How long to wait for the console's reverse connection.
    pub hole_punch_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            token_url: env_or("DISCO_TOKEN_URL", defaults.token_url),
            pairing_info_url: env_or("DISCO_PAIRING_INFO_URL", defaults.pairing_info_url),
            punch_pairing_url: env_or("DISCO_PUNCH_PAIRING_URL", defaults.punch_pairing_url),
            app_id: env_or("DISCO_APP_ID", defaults.app_id),
            sku_id: env_or("DISCO_SKU_ID", defaults.sku_id),
            ..defaults
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token_url: DEFAULT_TOKEN_URL.to_string(),
            pairing_info_url: DEFAULT_PAIRING_INFO_URL.to_string(),
            punch_pairing_url: DEFAULT_PUNCH_PAIRING_URL.to_string(),
            app_id: DEFAULT_APP_ID.to_string(),
            sku_id: DEFAULT_SKU_ID.to_string(),
            direct_connect_port: 8080,
            punch_port_min: 39000,
            punch_port_max: 39999,
            hole_punch_timeout: Duration::from_secs(10),
        }
    }
}

fn env_or(var: &str, default: String) -> String {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default,
    }
}
