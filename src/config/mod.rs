//! Engine configuration: batch size, pool sizing, statement timeouts.

pub mod duration;

use clap::Args;
use std::time::Duration;

/// Batch size for `overwrite`'s `LIMIT/OFFSET` paging. Spec-fixed at 500;
/// exposed as a named constant rather than silently hardcoded inline so the
/// boundary test (501 rows -> two batches) has one obvious place to read.
pub const OVERWRITE_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Args)]
pub struct EngineConfig {
    /// Maximum pooled connections held per side (source, target) for one job.
    #[arg(long, default_value = "4", env = "MIGRATE_ENGINE_POOL_MAX_SIZE")]
    pub pool_max_size: usize,

    /// Per-statement timeout, e.g. "30s", "5m". Unset means no timeout.
    #[arg(long, env = "MIGRATE_ENGINE_STATEMENT_TIMEOUT")]
    pub statement_timeout: Option<String>,
}

impl EngineConfig {
    pub fn statement_timeout_duration(&self) -> anyhow::Result<Option<Duration>> {
        self.statement_timeout
            .as_deref()
            .map(|s| duration::parse_duration_to_secs(s).map(|secs| Duration::from_secs(secs as u64)))
            .transpose()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            pool_max_size: 4,
            statement_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_statement_timeout() {
        let cfg = EngineConfig::default();
        assert!(cfg.statement_timeout_duration().unwrap().is_none());
    }

    #[test]
    fn parses_statement_timeout() {
        let cfg = EngineConfig {
            pool_max_size: 4,
            statement_timeout: Some("30s".to_string()),
        };
        assert_eq!(
            cfg.statement_timeout_duration().unwrap(),
            Some(Duration::from_secs(30))
        );
    }
}
