use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, trace, warn};

use crate::broker::Credentials;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Name of this monitor, shown in alerts
    pub name: String,

    /// Master token, used for every topic without its own token
    pub token: Option<String>,

    /// File containing the master token; takes precedence over `token`
    pub token_file_path: Option<PathBuf>,

    pub trust_store: Option<PathBuf>,

    /// Overrides the built-in default latency budget (0 = unset)
    pub latency_budget_ms: Option<u64>,

    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    #[serde(default)]
    pub alerts: Vec<Alert>,

    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

impl Config {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicConfig {
    pub name: Option<String>,

    /// Broker endpoint, e.g. `wss://useast1.example.com:8443`
    pub pulsar_url: String,

    pub topic_name: String,

    pub token: Option<String>,

    pub trust_store: Option<PathBuf>,

    /// 0 or absent falls back to the default budget
    pub latency_budget_ms: Option<u64>,

    /// Escalation thresholds, evaluated by whoever receives the alerts
    pub alert_policy: Option<AlertPolicy>,
}

impl TopicConfig {
    /// Topic token, else the master token; topic trust store, else the global one
    pub fn credentials(&self, config: &Config) -> Credentials {
        let token = self
            .token
            .clone()
            .filter(|token| !token.is_empty())
            .or_else(|| config.token.clone());
        let trust_store = self.trust_store.clone().or_else(|| config.trust_store.clone());

        Credentials::new(token, trust_store)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertPolicy {
    /// Consecutive failures before an incident
    pub ceiling: u32,
    pub moving_window_seconds: u64,
    pub ceiling_in_moving_window: u32,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alert {
    Discord(Discord),
    Webhook(Webhook),
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Webhook {
    pub url: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Discord {
    pub url: String,
    pub user_id: Option<String>,
}

fn default_interval() -> u64 {
    60
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content =
        std::fs::read_to_string(path).with_context(|| format!("failed to load {path}"))?;
    let config = parse_config(&file_content, crate::util::get_token_from_env())?;
    info!("loaded config {} with {} topics", config.name, config.topics.len());
    Ok(config)
}

/// Parse and validate a configuration, resolving the master token
///
/// Content starting with `{` is read as JSON, anything else as YAML.
/// Token precedence: contents of `tokenFilePath`, then `token`, then `env_token`.
pub fn parse_config(content: &str, env_token: Option<String>) -> anyhow::Result<Config> {
    let mut config: Config = if has_json_prefix(content) {
        serde_json::from_str(content)
            .map_err(|e| anyhow::anyhow!("Invalid JSON configuration provided: {e}"))?
    } else {
        serde_yaml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Invalid YAML configuration provided: {e}"))?
    };

    if config.name.trim().is_empty() {
        anyhow::bail!("a valid `name` must be specified in the configuration");
    }

    if let Some(path) = &config.token_file_path {
        match std::fs::read_to_string(path) {
            Ok(token) => {
                info!("read token from {}", path.display());
                config.token = Some(token);
            }
            Err(e) => warn!("failed to read token from {}: {e}", path.display()),
        }
    }

    config.token = config
        .token
        .take()
        .filter(|token| !token.is_empty())
        .or(env_token)
        .map(|token| token.trim_end_matches('\n').to_string());

    trace!("resolved config: {config:?}");
    Ok(config)
}

fn has_json_prefix(content: &str) -> bool {
    content.trim_start().starts_with('{')
}
