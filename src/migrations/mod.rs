//! Numbered repo schema migrations.
//!
//! Each step moves `<repo>/repover` one version forward (or back) and
//! may add or remove side files.

use log::info;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::{Error, Result};

mod migration005;

pub use migration005::{Migration005, SWARM_KEY};

pub const REPOVER_FILE: &str = "repover";

pub trait Migration: Send + Sync {
    /// Schema version `up` starts from.
    fn from_version(&self) -> u32;

    fn up(&self, repo_path: &Path, db_password: &str, testnet: bool) -> Result<()>;

    fn down(&self, repo_path: &Path, db_password: &str, testnet: bool) -> Result<()>;
}

/// Registered steps in ascending order.
pub fn registered() -> Vec<Box<dyn Migration>> {
    vec![Box::new(Migration005)]
}

/// Current schema version; a repo without `repover` is at 0.
pub fn read_version(repo_path: &Path) -> Result<u32> {
    match fs::read_to_string(repo_path.join(REPOVER_FILE)) {
        Ok(text) => text
            .trim()
            .parse()
            .map_err(|_| Error::MigrationFailed(format!("unreadable repover {:?}", text))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(Error::MigrationFailed(format!("read repover: {}", e))),
    }
}

pub fn write_version(repo_path: &Path, version: u32) -> Result<()> {
    fs::write(repo_path.join(REPOVER_FILE), version.to_string())
        .map_err(|e| Error::MigrationFailed(format!("write repover: {}", e)))
}

/// Apply every registered step at or above the repo's version. Returns
/// the version the repo ends at. Stops at the first failing step.
pub fn run_up(repo_path: &Path, db_password: &str, testnet: bool) -> Result<u32> {
    let start = read_version(repo_path)?;
    let mut version = start;
    let mut steps = registered();
    steps.sort_by_key(|m| m.from_version());
    for step in steps.iter().filter(|m| m.from_version() >= start) {
        info!("migrating repo from version {} to {}", step.from_version(), step.from_version() + 1);
        step.up(repo_path, db_password, testnet)?;
        version = step.from_version() + 1;
    }
    Ok(version)
}
