use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub credential: CredentialConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Pre-shared credentials for the payment provider. The hash salt signs
/// checkout requests; see gateway::onepay for the exact scheme.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub app_id: String,
    pub app_token: String,
    pub hash_salt: String,
    /// The one currency these provider credentials are scoped to.
    pub currency: String,
    /// Where the provider sends the payer's browser after checkout.
    pub redirect_url: String,
    /// Hard per-request timeout. Keeps a stalled provider call from
    /// eating the whole verification budget.
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CredentialConfig {
    pub signing_secret: String,
    pub qr_prefix: String,
    pub expires_in_days: i64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct EmailConfig {
    pub smtp_host: Option<String>,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub from_address: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

/// Bounds for the active verification loop in the status endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct VerificationConfig {
    pub budget_secs: u64,
    pub interval_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            budget_secs: 60,
            interval_secs: 5,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("database.max_connections", 10)?
            .set_default("gateway.currency", "USD")?
            .set_default("gateway.timeout_secs", 10)?
            .set_default("credential.qr_prefix", "APSC2026")?
            .set_default("credential.expires_in_days", 30)?
            .set_default("email.enabled", false)?
            .set_default("verification.budget_secs", 60)?
            .set_default("verification.interval_secs", 5)?
            // Add config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables (with CONFPAY__ prefix, double underscore separates levels)
            .add_source(Environment::with_prefix("CONFPAY").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite://confpay.db".to_string(),
                max_connections: 10,
            },
            gateway: GatewayConfig {
                base_url: "https://api.onepay.example".to_string(),
                app_id: String::new(),
                app_token: String::new(),
                hash_salt: String::new(),
                currency: "USD".to_string(),
                redirect_url: "http://localhost:8080/payment/return".to_string(),
                timeout_secs: 10,
            },
            credential: CredentialConfig {
                signing_secret: "change-me-in-production".to_string(),
                qr_prefix: "APSC2026".to_string(),
                expires_in_days: 30,
            },
            email: EmailConfig::default(),
            verification: VerificationConfig::default(),
        }
    }
}
