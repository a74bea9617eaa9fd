//! Composition root for the piri node: configuration, logging, metrics,
//! and the wiring that assembles the task engine, chain scheduler,
//! transaction watcher, PDP watchers, and the egress loops into one
//! stoppable unit.

pub mod logging;
pub mod metrics;
pub mod node;

pub use node::{ExternalServices, Node};

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_db_path() -> PathBuf {
    PathBuf::from("piri.sqlite")
}

fn default_egress_dir() -> PathBuf {
    PathBuf::from("egress")
}

fn default_batch_size() -> u64 {
    piri_egress::DEFAULT_BATCH_SIZE
}

fn default_rotate_interval_secs() -> u64 {
    300
}

fn default_consolidate_interval_secs() -> u64 {
    3600
}

fn default_epoch_duration_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(name = "piri", about = "PDP storage provider node", long_about = None)]
#[serde(default)]
pub struct Cli {
    /// Path to the node's SQLite store
    #[arg(long, default_value = "piri.sqlite")]
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory holding the egress journal and rotated batches
    #[arg(long, default_value = "egress")]
    #[serde(default = "default_egress_dir")]
    pub egress_dir: PathBuf,

    /// Egress batch rotation threshold in bytes
    #[arg(long, default_value_t = piri_egress::DEFAULT_BATCH_SIZE)]
    #[serde(default = "default_batch_size")]
    pub egress_batch_size: u64,

    /// Seconds between forced egress rotations
    #[arg(long, default_value_t = 300)]
    #[serde(default = "default_rotate_interval_secs")]
    pub rotate_interval_secs: u64,

    /// Seconds between consolidation sweeps
    #[arg(long, default_value_t = 3600)]
    #[serde(default = "default_consolidate_interval_secs")]
    pub consolidate_interval_secs: u64,

    /// Chain epoch duration in seconds (silence timeout = 3 epochs)
    #[arg(long, default_value_t = 30)]
    #[serde(default = "default_epoch_duration_secs")]
    pub epoch_duration_secs: u64,

    /// Address transactions are sent from
    #[arg(long)]
    pub owner: Option<String>,

    /// Optional JSON config file merged under the command line
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log to a rolling file in this directory instead of stderr only
    #[arg(long)]
    pub log_path: Option<PathBuf>,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            egress_dir: default_egress_dir(),
            egress_batch_size: default_batch_size(),
            rotate_interval_secs: default_rotate_interval_secs(),
            consolidate_interval_secs: default_consolidate_interval_secs(),
            epoch_duration_secs: default_epoch_duration_secs(),
            owner: None,
            config_path: None,
            log_level: default_log_level(),
            log_path: None,
        }
    }
}

impl Cli {
    /// Read the config file (if any) and merge it under the current
    /// options; command-line values win.
    pub fn merge_from_file(&mut self) -> anyhow::Result<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut config: Value = serde_json::from_reader(reader)?;
        let this = serde_json::to_value(&self)?;
        merge(&mut config, &this);
        *self = serde_json::from_value(config)?;
        Ok(())
    }

    pub fn owner_address(&self) -> anyhow::Result<alloy_primitives::Address> {
        match self.owner.as_deref() {
            None | Some("") => Ok(alloy_primitives::Address::ZERO),
            Some(owner) => Ok(owner.parse()?),
        }
    }
}

/// Merges two json values, overwriting `a` with the non-null values of
/// `b`.
fn merge(a: &mut Value, b: &Value) {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                merge(a.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (a, b) if !b.is_null() => *a = b.clone(),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_fills_gaps_cli_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"owner": "0x1111111111111111111111111111111111111111", "rotate_interval_secs": 60}"#,
        )
        .unwrap();

        let mut cli = Cli {
            config_path: Some(path),
            rotate_interval_secs: 120,
            ..Default::default()
        };
        cli.merge_from_file().unwrap();

        // CLI value wins over the file...
        assert_eq!(cli.rotate_interval_secs, 120);
        // ...but the file fills fields the CLI left at defaults.
        assert_eq!(
            cli.owner_address().unwrap(),
            alloy_primitives::Address::repeat_byte(0x11)
        );
    }
}
