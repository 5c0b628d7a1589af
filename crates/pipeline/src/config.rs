//! Pipeline configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use verdant_core::quality::QualityThresholds;
use verdant_core::render::GeneratorProvider;
use verdant_core::scheduling::{RetryPolicy, DEFAULT_LEASE};

use crate::generator::DEFAULT_GENERATION_TIMEOUT;
use crate::review_queue::DuplicatePolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a valid {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("Invalid quality thresholds: {0}")]
    Thresholds(String),
}

/// Endpoint of one image generator provider.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorEndpoint {
    pub provider: GeneratorProvider,
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// PostgreSQL URL; `None` runs on the in-memory store.
    pub database_url: Option<String>,
    pub retry: RetryPolicy,
    pub lease: Duration,
    pub thresholds: QualityThresholds,
    pub duplicates: DuplicatePolicy,
    pub blob_root: PathBuf,
    pub blob_public_url: String,
    pub generators: Vec<GeneratorEndpoint>,
    pub generation_timeout: Duration,
}

impl PipelineConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                          | Default                          |
    /// |----------------------------------|----------------------------------|
    /// | `DATABASE_URL`                   | unset (in-memory store)          |
    /// | `JOB_MAX_ATTEMPTS`               | `3`                              |
    /// | `JOB_BACKOFF_MS`                 | `1000`                           |
    /// | `JOB_LEASE_SECS`                 | `600`                            |
    /// | `QA_MIN_WIDTH` / `QA_MIN_HEIGHT` | `512`                            |
    /// | `QA_MAX_FILE_SIZE_BYTES`         | `10485760`                       |
    /// | `QA_MIN_SCORE`                   | `0.7`                            |
    /// | `DUPLICATE_THRESHOLD`            | `0.95`                           |
    /// | `DUPLICATE_WINDOW`               | `100`                            |
    /// | `BLOB_ROOT`                      | `./data/blobs`                   |
    /// | `BLOB_PUBLIC_URL`                | `http://localhost:3000/blobs`    |
    /// | `GENERATOR_OPEN_AI_URL`          | unset                            |
    /// | `GENERATOR_OPEN_AI_API_KEY`      | unset                            |
    /// | `GENERATOR_GOOGLE_IMAGEN_URL`    | unset                            |
    /// | `GENERATOR_GOOGLE_IMAGEN_API_KEY`| unset                            |
    /// | `GENERATOR_TIMEOUT_SECS`         | `120`                            |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = QualityThresholds::default();
        let duplicate_defaults = DuplicatePolicy::default();
        let retry_defaults = RetryPolicy::default();

        let retry = RetryPolicy {
            max_attempts: parse(
                &lookup,
                "JOB_MAX_ATTEMPTS",
                "u32",
                retry_defaults.max_attempts,
            )?
            .max(1),
            initial_delay: Duration::from_millis(parse(
                &lookup,
                "JOB_BACKOFF_MS",
                "u64",
                retry_defaults.initial_delay.as_millis() as u64,
            )?),
            ..retry_defaults
        };

        let thresholds = QualityThresholds {
            min_width: parse(&lookup, "QA_MIN_WIDTH", "u32", defaults.min_width)?,
            min_height: parse(&lookup, "QA_MIN_HEIGHT", "u32", defaults.min_height)?,
            max_file_size_bytes: parse(
                &lookup,
                "QA_MAX_FILE_SIZE_BYTES",
                "u64",
                defaults.max_file_size_bytes,
            )?,
            min_quality_score: parse(&lookup, "QA_MIN_SCORE", "f64", defaults.min_quality_score)?,
            allowed_formats: defaults.allowed_formats,
        };
        thresholds
            .validate()
            .map_err(|e| ConfigError::Thresholds(e.to_string()))?;

        let duplicates = DuplicatePolicy {
            threshold: parse(&lookup, "DUPLICATE_THRESHOLD", "f64", duplicate_defaults.threshold)?,
            window: parse(&lookup, "DUPLICATE_WINDOW", "usize", duplicate_defaults.window)?,
        };

        let generators = [GeneratorProvider::OpenAi, GeneratorProvider::GoogleImagen]
            .into_iter()
            .filter_map(|provider| {
                let prefix = format!("GENERATOR_{}", provider.as_str().to_ascii_uppercase());
                lookup(&format!("{prefix}_URL")).map(|url| GeneratorEndpoint {
                    provider,
                    url,
                    api_key: lookup(&format!("{prefix}_API_KEY")),
                })
            })
            .collect();

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.is_empty()),
            retry,
            lease: Duration::from_secs(parse(
                &lookup,
                "JOB_LEASE_SECS",
                "u64",
                DEFAULT_LEASE.as_secs(),
            )?),
            thresholds,
            duplicates,
            blob_root: lookup("BLOB_ROOT")
                .unwrap_or_else(|| "./data/blobs".into())
                .into(),
            blob_public_url: lookup("BLOB_PUBLIC_URL")
                .unwrap_or_else(|| "http://localhost:3000/blobs".into()),
            generators,
            generation_timeout: Duration::from_secs(parse(
                &lookup,
                "GENERATOR_TIMEOUT_SECS",
                "u64",
                DEFAULT_GENERATION_TIMEOUT.as_secs(),
            )?),
        })
    }
}

/// Parse `name` if set, otherwise fall back to `default`.
pub fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            expected,
            value,
        }),
    }
}
