//! Append-only ledger of submitted sweeps, one JSON object per line.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ethers::types::{Address, TxHash, U256};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A transfer the sweeper broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepRecord {
    pub timestamp: DateTime<Utc>,
    pub network: String,
    pub chain_id: u64,
    pub index: u32,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub gas_limit: u64,
    /// Gas price or max fee per gas, whichever the transaction used.
    pub fee_per_gas: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_fee_per_gas: Option<U256>,
    pub nonce: U256,
    pub tx_hash: TxHash,
}

#[derive(Debug)]
pub struct OperationLog {
    path: PathBuf,
    // Serializes appends from concurrently sweeping networks
    write_lock: Mutex<()>,
}

impl OperationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &SweepRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open sweep log {}", self.path.display()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Every record in the log, oldest first. A missing file reads as empty.
    pub fn read_all(&self) -> Result<Vec<SweepRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Malformed sweep log line"))
            .collect()
    }
}
