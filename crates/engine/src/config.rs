//! Engine configuration and loading.
//!
//! Configuration is layered with `figment`: a base TOML file, an optional
//! profile overlay (`Config.<profile>.toml` next to the base file), then
//! `PAIRQUOTE_`-prefixed environment variables. Nested keys use a double
//! underscore, e.g. `PAIRQUOTE_CIRCUIT_BREAKER__WARNING_THRESHOLD=8`.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::combined_book::CombinedBookBuilder;
use crate::quoting::QuoteConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PAIRQUOTE_";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or did not match the schema.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Values loaded but violate a constraint.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Combined book construction.
    pub book: CombinedBookBuilder,
    /// Quote ladder parameters.
    pub quoting: QuoteConfig,
    /// Imbalance thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Log cancellations instead of sending them.
    pub dry_run: bool,
}

impl EngineConfig {
    /// Checks every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.book.tick_size <= Decimal::ZERO {
            return Err(ConfigError::Invalid("book.tick_size must be positive".to_string()));
        }
        if self.book.balance_tolerance < Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "book.balance_tolerance must not be negative".to_string(),
            ));
        }
        self.quoting.validate().map_err(ConfigError::Invalid)?;
        self.circuit_breaker.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}

/// Loads [`EngineConfig`] from TOML and the environment.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads and validates configuration from `path` plus environment overrides.
    ///
    /// A missing file is not an error; defaults and environment values apply.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Like [`ConfigLoader::load`], with `Config.<profile>.toml` from the same
    /// directory merged over the base file.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load_with_profile(path: impl AsRef<Path>, profile: &str) -> Result<EngineConfig, ConfigError> {
        let path = path.as_ref();
        Self::extract(
            Figment::new()
                .merge(Toml::file(path))
                .merge(Toml::file(profile_path(path, profile))),
        )
    }

    fn extract(figment: Figment) -> Result<EngineConfig, ConfigError> {
        let config: EngineConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }
}

fn profile_path(base: &Path, profile: &str) -> PathBuf {
    base.with_file_name(format!("Config.{profile}.toml"))
}
