const PULSAR_TOKEN: &str = "PulsarToken";

/// Fallback master token from the environment
pub fn get_token_from_env() -> Option<String> {
    let token_from_env = std::env::var(PULSAR_TOKEN);
    token_from_env.ok().filter(|token| !token.is_empty())
}

const LOG_LEVEL: &str = "LOG_LEVEL";

pub fn get_log_level() -> tracing::Level {
    let level_from_env = std::env::var(LOG_LEVEL);
    level_from_env.map_or(tracing::Level::INFO, |res| {
        res.parse().unwrap_or(tracing::Level::INFO)
    })
}
