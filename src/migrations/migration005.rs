//! Schema 5 to 6: install the private-network swarm key.

use std::fs;
use std::path::Path;

use super::{write_version, Migration};
use crate::error::{Error, Result};

pub const SWARM_KEY_FILE: &str = "swarm.key";

pub const SWARM_KEY: &[u8] =
    b"/key/swarm/psk/1.0.0/\n/base16/\n59468cfd4d4dc2a61395080513e853434d0313495f34be65c18d643d09eafe6f";

pub struct Migration005;

impl Migration for Migration005 {
    fn from_version(&self) -> u32 {
        5
    }

    fn up(&self, repo_path: &Path, _db_password: &str, _testnet: bool) -> Result<()> {
        fs::write(repo_path.join(SWARM_KEY_FILE), SWARM_KEY)
            .map_err(|e| Error::MigrationFailed(format!("write swarm key: {}", e)))?;
        write_version(repo_path, 6)
    }

    fn down(&self, repo_path: &Path, _db_password: &str, _testnet: bool) -> Result<()> {
        fs::remove_file(repo_path.join(SWARM_KEY_FILE))
            .map_err(|e| Error::MigrationFailed(format!("remove swarm key: {}", e)))?;
        write_version(repo_path, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::REPOVER_FILE;
    use std::collections::BTreeMap;

    fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap())
            .map(|e| (e.file_name().to_string_lossy().into_owned(), fs::read(e.path()).unwrap()))
            .collect()
    }

    #[test]
    fn up_then_down_on_empty_repo() {
        let dir = tempfile::tempdir().unwrap();
        let m = Migration005;
        m.up(dir.path(), "letmein", false).unwrap();
        assert_eq!(fs::read(dir.path().join(REPOVER_FILE)).unwrap(), b"6");
        let key = fs::read(dir.path().join(SWARM_KEY_FILE)).unwrap();
        assert_eq!(key, SWARM_KEY);
        assert_eq!(key.len(), 95);

        m.down(dir.path(), "letmein", false).unwrap();
        assert!(!dir.path().join(SWARM_KEY_FILE).exists());
        assert_eq!(fs::read(dir.path().join(REPOVER_FILE)).unwrap(), b"5");
    }

    #[test]
    fn reversal_restores_repo() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(REPOVER_FILE), "5").unwrap();
        fs::write(dir.path().join("config"), "{\"Identity\": {}}").unwrap();
        let before = snapshot(dir.path());

        let m = Migration005;
        m.up(dir.path(), "letmein", true).unwrap();
        assert_ne!(snapshot(dir.path()), before);
        m.down(dir.path(), "letmein", true).unwrap();
        assert_eq!(snapshot(dir.path()), before);
    }

    #[test]
    fn down_without_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Migration005.down(dir.path(), "", false).unwrap_err();
        assert!(matches!(err, Error::MigrationFailed(_)));
    }
}
