use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// `~` expansion for paths taken from the config file. `$VAR` is left alone.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).into_owned())
}

pub fn write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(path, text).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_paths_pass_through() {
        assert_eq!(expand_path("/dev/ttyUSB0"), PathBuf::from("/dev/ttyUSB0"));
    }

    #[test]
    fn variables_are_not_expanded() {
        assert_eq!(expand_path("$WORKSPACE/agent/run_tests.sh"), PathBuf::from("$WORKSPACE/agent/run_tests.sh"));
        assert_eq!(expand_path("${RESULTS_DIR}"), PathBuf::from("${RESULTS_DIR}"));
    }
}
