pub mod config;
pub mod doctor;
pub mod invoker;
pub mod orchestrator;
pub mod scenario;
pub mod util;

pub use config::*;
pub use doctor::*;
pub use invoker::*;
pub use orchestrator::*;
pub use util::*;

/// Held by tests that write a script and then exec it. A fork on another thread
/// can briefly hold the write descriptor, making exec fail with ETXTBSY.
#[cfg(test)]
pub(crate) static SPAWN_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod fixture_tests {
    use std::path::Path;

    #[test]
    fn loads_every_scenario_manifest() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/scenarios");
        for dir in ["SC-A-unknown-target", "SC-B-flash-fatal", "SC-C-stale-reconcile"] {
            let m = ats_manifest::load_manifest(&root.join(dir).join("manifest.yaml")).unwrap();
            assert_eq!(m.manifest_version, 1);
            assert!(!m.artifact_name().is_empty());
        }
    }
}
