use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Advisory lock key shared by every collection run ("pbiscoll" in ASCII).
pub const DEFAULT_LOCK_KEY: i64 = 0x7062_6973_636f_6c6c;

/// Tuning for a collection run. Read-only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ascending lifetime card counts at which a student reaches the next level.
    pub personal_level_thresholds: Vec<u32>,
    /// Cumulative average cards per student needed for each team level.
    pub team_level_divisor: u32,
    pub weekly_winner_count: usize,
    /// How many past collections a drawing winner sits out.
    pub collections_without_repeat_winners: usize,
    /// Card ids sent per `mark_cards_counted` call.
    pub mark_batch_size: usize,
    /// Window start used when no collection has ever run.
    pub fallback_lookback_months: u32,
    pub levels_per_school_wide_level: u32,
    pub lock_key: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            personal_level_thresholds: vec![
                25, 50, 85, 120, 165, 210, 265, 320, 385, 450, 525, 600, 675, 750,
            ],
            team_level_divisor: 24,
            weekly_winner_count: 10,
            collections_without_repeat_winners: 3,
            mark_batch_size: 50,
            fallback_lookback_months: 24,
            levels_per_school_wide_level: 2,
            lock_key: DEFAULT_LOCK_KEY,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("personal level thresholds must not be empty")]
    EmptyThresholds,

    #[error("personal level thresholds must be positive and strictly ascending (at index {0})")]
    UnorderedThresholds(usize),

    #[error("team level divisor must be greater than zero")]
    ZeroDivisor,

    #[error("mark batch size must be greater than zero")]
    ZeroBatchSize,
}

impl EngineConfig {
    /// Load a JSON config file; missing keys fall back to the defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.personal_level_thresholds.is_empty() {
            return Err(ConfigError::EmptyThresholds);
        }
        let mut previous = 0;
        for (index, &threshold) in self.personal_level_thresholds.iter().enumerate() {
            if threshold <= previous {
                return Err(ConfigError::UnorderedThresholds(index));
            }
            previous = threshold;
        }
        if self.team_level_divisor == 0 {
            return Err(ConfigError::ZeroDivisor);
        }
        if self.mark_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }
}
