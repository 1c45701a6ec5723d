use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const BOOT_EVIDENCE_FILE: &str = "uart-boot.log";

/// Boot evidence file of one run. Every save replaces the file; nothing is ever appended.
#[derive(Clone, Debug)]
pub struct EvidenceStore {
    results_dir: PathBuf,
}

impl EvidenceStore {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self { results_dir: results_dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.results_dir.join(BOOT_EVIDENCE_FILE)
    }

    pub fn save(&self, bytes: &[u8]) -> Result<PathBuf> {
        save_evidence(&self.results_dir, bytes)
    }

    /// Removes evidence left by an earlier capture. Returns whether a file was removed.
    pub fn discard(&self) -> Result<bool> {
        let path = self.path();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("remove stale evidence {}", path.display())),
        }
    }

    pub fn load(&self) -> Result<Option<Vec<u8>>> {
        load_evidence(&self.path())
    }
}

pub fn save_evidence(results_dir: &Path, bytes: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(results_dir).with_context(|| format!("create results dir {}", results_dir.display()))?;
    let path = results_dir.join(BOOT_EVIDENCE_FILE);
    // fs::write truncates: a shorter capture must not leave the tail of a longer one behind.
    std::fs::write(&path, bytes).with_context(|| format!("write boot evidence {}", path.display()))?;
    Ok(path)
}

pub fn load_evidence(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read boot evidence {}", path.display())),
    }
}
