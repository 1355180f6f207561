use serde::Deserialize;

use crate::shared::{BatchConfig, IngestConfig, PgConnectionConfig, RefreshConfig, ValidationError};

/// Top-level configuration for the ingestion service.
///
/// This intentionally does not implement [`serde::Serialize`] because the
/// optional connection section carries secrets.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServiceConfig {
    /// Chunk sizing settings.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Pipeline behavior settings.
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Materialized view refresh cadence settings.
    #[serde(default)]
    pub refresh: RefreshConfig,
    /// Warehouse connection, present when running against Postgres.
    #[serde(default)]
    pub pg_connection: Option<PgConnectionConfig>,
}

impl ServiceConfig {
    /// Validates all nested configuration sections.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.batch.validate()?;
        self.ingest.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.batch.max_rows, BatchConfig::DEFAULT_MAX_ROWS);
        assert_eq!(config.ingest.load_fanout, IngestConfig::DEFAULT_LOAD_FANOUT);
        assert_eq!(config.refresh.cooldown_ms, RefreshConfig::DEFAULT_COOLDOWN_MS);
    }

    #[test]
    fn test_zero_fanout_is_rejected() {
        let mut config = ServiceConfig::default();
        config.ingest.load_fanout = 0;

        assert!(config.validate().is_err());
    }
}
