use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::engine::budget::SpawnBudget;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub brave_api_key: Option<String>,
    pub database_url: Option<String>,
    pub port: Option<u16>,
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Reads an optional TOML file, then lets the environment override it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.openai_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.anthropic_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("BRAVE_API_KEY") {
            self.brave_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(port) = std::env::var("CANOPY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.port = Some(port);
        }
    }
}

/// Tunables for the tick scheduler and the iteration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Hard ceiling after which an agent is forced to complete
    pub max_iterations: u32,
    pub compression_interval: u32,
    /// Trailing messages kept verbatim by compression
    pub compression_window: usize,
    pub sibling_interval: u32,
    pub sibling_findings_limit: usize,
    /// Model turns allowed per iteration when tools are offered
    pub tool_step_limit: usize,
    pub searches_per_iteration: u32,
    pub output_max_chars: usize,
    pub child_preview_chars: usize,
    pub fallback_progress_delta: u8,
    pub working_progress_cap: u8,
    pub mission_time_limit_secs: i64,
    pub claim_lease_secs: i64,
    pub rate_limit_requests: usize,
    pub rate_limit_window_secs: u64,
    pub budget: SpawnBudget,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            compression_interval: 3,
            compression_window: 4,
            sibling_interval: 3,
            sibling_findings_limit: 5,
            tool_step_limit: 6,
            searches_per_iteration: 5,
            output_max_chars: 8000,
            child_preview_chars: 1500,
            fallback_progress_delta: 5,
            working_progress_cap: 95,
            mission_time_limit_secs: 30 * 60,
            claim_lease_secs: 10 * 60,
            rate_limit_requests: 60,
            rate_limit_window_secs: 60,
            budget: SpawnBudget::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_lease_secs)
    }

    pub fn mission_time_limit(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.mission_time_limit_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.compression_window, 4);
        assert_eq!(config.mission_time_limit(), chrono::Duration::minutes(30));
        assert_eq!(config.budget.max_total_agents, 25);
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[scheduler]\nmax_iterations = 4\n\n[scheduler.budget]\nmax_depth = 2\n"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.scheduler.max_iterations, 4);
        assert_eq!(config.scheduler.budget.max_depth, 2);
        assert_eq!(config.scheduler.budget.max_spawns_per_agent, 3);
        assert_eq!(config.scheduler.compression_interval, 3);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/canopy.toml"))).unwrap();
        assert_eq!(config.scheduler.max_iterations, 10);
    }
}
