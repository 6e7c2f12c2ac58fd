//! Process configuration, read once from the environment at startup.

use std::env;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Hex-encoded private key for the server wallet. When absent an
    /// ephemeral key is generated and logged at startup.
    pub wallet_key: Option<String>,
    /// Environment tag baked into per-address storage file names.
    pub env_tag: String,
    pub cache_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env::var("BRIDGE_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let wallet_key = env::var("BRIDGE_KEY").ok().filter(|key| !key.is_empty());
        let env_tag = env::var("BRIDGE_ENV").unwrap_or_else(|_| "dev".to_string());
        let cache_dir = env::var("BRIDGE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".cache"));
        Config {
            port,
            wallet_key,
            env_tag,
            cache_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        // Uses fresh variable reads, so only assert on the defaults that the
        // test environment does not override.
        let config = Config::from_env();
        if env::var("BRIDGE_PORT").is_err() {
            assert_eq!(config.port, 3000);
        }
        if env::var("BRIDGE_ENV").is_err() {
            assert_eq!(config.env_tag, "dev");
        }
    }
}
