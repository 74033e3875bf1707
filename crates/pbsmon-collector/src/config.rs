use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use pbsmon_core::{EntityKind, PassKind, TerminalStates};
use pbsmon_store::RetentionHorizons;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub database: DatabaseConfig,
    pub pbs: PbsConfig,
    pub collection: CollectionConfig,
    pub retention: RetentionConfig,
    pub policy: PolicyConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "~/.pbsmon/monitor.db".to_string() }
    }
}

impl DatabaseConfig {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).into_owned())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PbsConfig {
    pub command_timeout_secs: u64,
}

impl Default for PbsConfig {
    fn default() -> Self {
        Self { command_timeout_secs: 30 }
    }
}

/// Per-kind polling cadence. Jobs change fastest, queues slowest.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub job_interval_secs: i64,
    pub node_interval_secs: i64,
    pub queue_interval_secs: i64,
    pub utilization_interval_secs: i64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            job_interval_secs: 30,
            node_interval_secs: 60,
            queue_interval_secs: 300,
            utilization_interval_secs: 300,
        }
    }
}

impl CollectionConfig {
    pub fn interval_for(&self, pass: PassKind) -> i64 {
        match pass {
            PassKind::Entities(EntityKind::Job) => self.job_interval_secs,
            PassKind::Entities(EntityKind::Node) => self.node_interval_secs,
            PassKind::Entities(EntityKind::Queue) => self.queue_interval_secs,
            PassKind::Utilization => self.utilization_interval_secs,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub history_days: i64,
    pub snapshot_days: i64,
    pub sweep_interval_secs: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { history_days: 365, snapshot_days: 90, sweep_interval_secs: 3600 }
    }
}

impl RetentionConfig {
    pub fn horizons(&self) -> RetentionHorizons {
        RetentionHorizons { history_days: self.history_days, snapshot_days: self.snapshot_days }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Job states treated as terminal; nodes and queues never finalize.
    pub terminal_job_states: Vec<String>,
    /// When set, jobs absent from both the live and history views for
    /// this long are closed out as `unknown`. Off by default.
    pub stale_job_horizon_hours: Option<i64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { terminal_job_states: vec!["C".to_string(), "F".to_string()], stale_job_horizon_hours: None }
    }
}

impl PolicyConfig {
    pub fn terminal_for(&self, kind: EntityKind) -> TerminalStates {
        match kind {
            EntityKind::Job => TerminalStates::new(self.terminal_job_states.iter().cloned()),
            EntityKind::Node | EntityKind::Queue => TerminalStates::default(),
        }
    }

    pub fn stale_after_secs(&self) -> Option<i64> {
        self.stale_job_horizon_hours.map(|h| h * 3600)
    }
}

impl MonitorConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: MonitorConfig = toml::from_str(&s).with_context(|| "parse monitor config")?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(shellexpand::tilde("~/.pbsmon/config.toml").into_owned())
    }

    /// Load the file when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pbs_cadence() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.collection.interval_for(PassKind::Entities(EntityKind::Job)), 30);
        assert_eq!(cfg.collection.interval_for(PassKind::Entities(EntityKind::Queue)), 300);
        assert_eq!(cfg.pbs.command_timeout_secs, 30);
        let terminal = cfg.policy.terminal_for(EntityKind::Job);
        assert!(terminal.contains(&pbsmon_core::EntityState::new("C")));
        assert!(cfg.policy.terminal_for(EntityKind::Node).is_empty());
        assert_eq!(cfg.policy.stale_after_secs(), None);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let cfg: MonitorConfig = toml::from_str(
            r#"
            [collection]
            job_interval_secs = 10

            [policy]
            stale_job_horizon_hours = 24
            "#,
        )
        .unwrap();
        assert_eq!(cfg.collection.job_interval_secs, 10);
        assert_eq!(cfg.collection.node_interval_secs, 60);
        assert_eq!(cfg.policy.stale_after_secs(), Some(86_400));
        assert_eq!(cfg.retention.history_days, 365);
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = MonitorConfig::default();
        cfg.retention.history_days = 30;
        cfg.save_to(&path).unwrap();
        let loaded = MonitorConfig::load_from(&path).unwrap();
        assert_eq!(loaded.retention.history_days, 30);
    }
}
