use rust_decimal::Decimal;
use serde::Deserialize;

use crate::ledger::DEFAULT_CASHBACK_RATE;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    /// Postgres connection string. The in-memory store is used when unset.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// Fraction of a purchase credited as cashback.
    pub cashback_rate: Decimal,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .set_default("server_port", 8000)?
            .set_default("database_max_connections", 8)?
            .set_default("cashback_rate", DEFAULT_CASHBACK_RATE.to_string())?
            .add_source(config::Environment::default())
            .build()?;
        config.try_deserialize()
    }
}
