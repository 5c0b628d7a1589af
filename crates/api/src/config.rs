use verdant_pipeline::config::parse;
use verdant_pipeline::ConfigError;

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Connection pool size (default: `10`).
    pub database_max_connections: u32,
    /// Concurrency of the in-process worker used with the in-memory store
    /// (default: `5`).
    pub embedded_worker_concurrency: usize,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default   |
    /// |----------------------------|-----------|
    /// | `HOST`                     | `0.0.0.0` |
    /// | `PORT`                     | `3000`    |
    /// | `REQUEST_TIMEOUT_SECS`     | `30`      |
    /// | `DATABASE_MAX_CONNECTIONS` | `10`      |
    /// | `WORKER_CONCURRENCY`       | `5`       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&lookup, "PORT", "u16", 3000)?,
            request_timeout_secs: parse(&lookup, "REQUEST_TIMEOUT_SECS", "u64", 30)?,
            database_max_connections: parse(&lookup, "DATABASE_MAX_CONNECTIONS", "u32", 10)?,
            embedded_worker_concurrency: parse(&lookup, "WORKER_CONCURRENCY", "usize", 5)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn bad_port_is_an_error() {
        let err = ServerConfig::from_lookup(|name| (name == "PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(err.to_string().starts_with("PORT must be a valid u16"));
    }
}
