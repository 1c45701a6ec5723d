use std::path::{Path, PathBuf};

/// Where a located port came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortSource {
    Override,
    Candidate,
    Scan,
}

impl PortSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortSource::Override => "override",
            PortSource::Candidate => "candidate",
            PortSource::Scan => "scan",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocatedPort {
    pub path: String,
    pub source: PortSource,
}

/// Finds the board's serial device. Read-only: only checks for existence.
///
/// Order: explicit override (if it exists), then the fixed candidate list in
/// order, then every match of `scan_patterns`, sorted lexicographically.
#[derive(Clone, Debug, Default)]
pub struct PortLocator {
    pub override_port: Option<String>,
    pub candidates: Vec<String>,
    pub scan_patterns: Vec<String>,
}

impl PortLocator {
    pub fn new(override_port: Option<String>, candidates: Vec<String>, scan_patterns: Vec<String>) -> Self {
        Self { override_port, candidates, scan_patterns }
    }

    pub fn locate(&self) -> Option<LocatedPort> {
        if let Some(p) = self.override_port.as_deref().filter(|p| Path::new(p).exists()) {
            return Some(LocatedPort { path: p.to_string(), source: PortSource::Override });
        }

        if let Some(p) = self.candidates.iter().find(|p| Path::new(p.as_str()).exists()) {
            return Some(LocatedPort { path: p.clone(), source: PortSource::Candidate });
        }

        self.scan().into_iter().next().map(|p| LocatedPort { path: p.display().to_string(), source: PortSource::Scan })
    }

    /// All paths matching the scan patterns, sorted. Bad patterns are skipped.
    pub fn scan(&self) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = self
            .scan_patterns
            .iter()
            .filter_map(|pat| match glob::glob(pat) {
                Ok(paths) => Some(paths),
                Err(e) => {
                    tracing::warn!(pattern = %pat, error = %e, "invalid serial scan pattern");
                    None
                }
            })
            .flatten()
            .filter_map(Result::ok)
            .collect();
        found.sort();
        found.dedup();
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) -> String {
        let p = dir.join(name);
        std::fs::write(&p, b"").unwrap();
        p.display().to_string()
    }

    #[test]
    fn override_wins_when_present() {
        let dir = tempdir().unwrap();
        let over = touch(dir.path(), "custom");
        let usb0 = touch(dir.path(), "ttyUSB0");
        let loc = PortLocator::new(Some(over.clone()), vec![usb0], vec![]);
        assert_eq!(loc.locate(), Some(LocatedPort { path: over, source: PortSource::Override }));
    }

    #[test]
    fn missing_override_falls_back_to_candidates_in_order() {
        let dir = tempdir().unwrap();
        let acm0 = touch(dir.path(), "ttyACM0");
        let missing = dir.path().join("ttyUSB0").display().to_string();
        let loc = PortLocator::new(Some(dir.path().join("gone").display().to_string()), vec![missing, acm0.clone()], vec![]);
        assert_eq!(loc.locate().unwrap().path, acm0);
        assert_eq!(loc.locate().unwrap().source, PortSource::Candidate);
    }

    #[test]
    fn scan_is_sorted_across_patterns() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "ttyUSB7");
        let acm3 = touch(dir.path(), "ttyACM3");
        let d = dir.path().display();
        let loc = PortLocator::new(None, vec![], vec![format!("{d}/ttyUSB*"), format!("{d}/ttyACM*")]);
        let got = loc.locate().unwrap();
        assert_eq!(got.path, acm3);
        assert_eq!(got.source, PortSource::Scan);
        assert_eq!(loc.scan().len(), 2);
    }

    #[test]
    fn nothing_found_is_none() {
        let dir = tempdir().unwrap();
        let d = dir.path().display();
        let loc = PortLocator::new(None, vec![format!("{d}/ttyUSB0")], vec![format!("{d}/ttyUSB*")]);
        assert_eq!(loc.locate(), None);
    }
}
