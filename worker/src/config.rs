use std::env;

use config::{Config, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct VerifierConfig {
    pub worker: WorkerConfig,
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    pub chains: ChainsConfig,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub log_format: LogFormat,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Kept low on purpose: every job hits third-party explorer APIs.
    pub verification_workers: usize,
    pub webhook_workers: usize,
    pub scan_interval_secs: u64,
    pub min_donation_age_secs: u64,
    pub scan_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            verification_workers: 2,
            webhook_workers: 5,
            scan_interval_secs: 60,
            min_donation_age_secs: 60,
            scan_batch_size: 100,
        }
    }
}

/// The donation platform's internal API the worker reads donations from and
/// writes outcomes to.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ChainsConfig {
    pub evm: Vec<EvmNetworkConfig>,
    pub solana: Vec<SolanaNetworkConfig>,
    pub stellar: Vec<StellarNetworkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmNetworkConfig {
    pub network_id: u64,
    pub rpc_url: String,
    pub native_symbol: String,
    #[serde(default)]
    pub explorer_url: Option<String>,
    #[serde(default)]
    pub explorer_api_key: Option<String>,
    #[serde(default)]
    pub safe_service_url: Option<String>,
    #[serde(default)]
    pub extra_entry_points: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaNetworkConfig {
    pub network_id: u64,
    pub rpc_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StellarNetworkConfig {
    pub network_id: u64,
    pub horizon_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub network_id: u64,
    pub symbol: String,
    pub address: String,
    pub decimals: u8,
}

pub fn get_config() -> VerifierConfig {
    let base_path = env::current_dir().expect("Failed to determine the current directory");
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("Failed to parse APP_ENVIRONMENT");

    let environment_filename = format!("worker_{}.yaml", environment.as_str());

    let config = Config::builder()
        .add_source(File::from(configuration_directory.join("worker_base.yaml")))
        .add_source(File::from(
            configuration_directory.join(environment_filename),
        ))
        .add_source(config::Environment::with_prefix("app").separator("__"))
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Configuration error: {}", e);
            panic!("Failed to build configuration");
        });

    config
        .try_deserialize::<VerifierConfig>()
        .unwrap_or_else(|e| {
            eprintln!("Configuration error: {}", e);
            eprintln!("Make sure all required fields are set correctly in your configuration files or environment variables.");
            panic!("Failed to deserialize configuration");
        })
}

pub enum Environment {
    Local,
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local`, `development`, or `production`.",
                other
            )),
        }
    }
}
