use crate::engine::Tunables;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration loaded from `~/.config/dman/config.toml`.
///
/// Overrides the compile-time tunables in [`crate::engine::tunables`] so an
/// operator can retune connection counts and timing without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DmanConfig {
    /// Maximum concurrent workers (range requests) for a single download.
    pub max_workers: usize,
    /// Buffered-copy unit in bytes; shapes cancellation granularity.
    pub len_check_bytes: u64,
    /// Minimum remaining eta (seconds) a job must have before it can be split.
    pub min_cut_eta_secs: u64,
    /// Status aggregator tick interval in milliseconds.
    pub stat_interval_ms: u64,
    /// Number of samples kept by the speed moving average.
    pub moving_avg_len: usize,
}

impl Default for DmanConfig {
    fn default() -> Self {
        Self {
            max_workers: crate::engine::tunables::DEFAULT_MAX_WORKERS,
            len_check_bytes: crate::engine::tunables::LEN_CHECK as u64,
            min_cut_eta_secs: crate::engine::tunables::MIN_CUT_ETA.as_secs(),
            stat_interval_ms: crate::engine::tunables::STAT_INTERVAL.as_millis() as u64,
            moving_avg_len: crate::engine::tunables::MOVING_AVG_LEN,
        }
    }
}

impl From<&DmanConfig> for Tunables {
    fn from(cfg: &DmanConfig) -> Self {
        Self {
            max_workers: cfg.max_workers,
            len_check: cfg.len_check_bytes as usize,
            min_cut_eta: Duration::from_secs(cfg.min_cut_eta_secs),
            stat_interval: Duration::from_millis(cfg.stat_interval_ms),
            moving_avg_len: cfg.moving_avg_len,
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("dman")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<DmanConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = DmanConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: DmanConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = DmanConfig::default();
        assert_eq!(cfg.max_workers, 32);
        assert_eq!(cfg.moving_avg_len, 5);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = DmanConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: DmanConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_workers, cfg.max_workers);
        assert_eq!(parsed.len_check_bytes, cfg.len_check_bytes);
        assert_eq!(parsed.min_cut_eta_secs, cfg.min_cut_eta_secs);
    }

    #[test]
    fn config_toml_partial_falls_back_to_defaults() {
        let toml = "max_workers = 8\n";
        let cfg: DmanConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_workers, 8);
        assert_eq!(cfg.moving_avg_len, DmanConfig::default().moving_avg_len);
    }

    #[test]
    fn tunables_reflect_an_edited_config() {
        let cfg = DmanConfig {
            max_workers: 4,
            len_check_bytes: 1024,
            min_cut_eta_secs: 3,
            stat_interval_ms: 250,
            moving_avg_len: 2,
        };
        let tunables = Tunables::from(&cfg);
        assert_eq!(tunables.max_workers, 4);
        assert_eq!(tunables.len_check, 1024);
        assert_eq!(tunables.min_cut_eta, Duration::from_secs(3));
        assert_eq!(tunables.stat_interval, Duration::from_millis(250));
        assert_eq!(tunables.moving_avg_len, 2);
    }
}

