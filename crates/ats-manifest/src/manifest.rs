use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const SUPPORTED_VERSION: u64 = 1;

const REQUIRED_SECTIONS: [&str; 4] = ["build", "device", "test_plan", "timestamps"];

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest not found: {0}")]
    NotFound(PathBuf),
    #[error("read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest is empty")]
    Empty,
    #[error("parse manifest yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported manifest version: {0}")]
    UnsupportedVersion(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Build numbers show up both as integers and strings in the wild.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum BuildNumber {
    Number(u64),
    Text(String),
}

impl std::fmt::Display for BuildNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildNumber::Number(n) => write!(f, "{n}"),
            BuildNumber::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_version: u64,
    pub build: Build,
    pub device: Device,
    pub test_plan: Vec<String>,
    #[serde(default)]
    pub timestamps: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Build {
    pub build_number: BuildNumber,
    pub artifact: Artifact,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    pub target: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Manifest {
    pub fn artifact_name(&self) -> &str {
        &self.build.artifact.name
    }

    pub fn device_target(&self) -> &str {
        &self.device.target
    }

    pub fn test_plan(&self) -> &[String] {
        &self.test_plan
    }
}

pub fn load_manifest(path: &Path) -> Result<Manifest, ManifestError> {
    if !path.exists() {
        return Err(ManifestError::NotFound(path.to_path_buf()));
    }
    let s = std::fs::read_to_string(path).map_err(|source| ManifestError::Read { path: path.to_path_buf(), source })?;
    parse_manifest(&s)
}

pub fn parse_manifest(s: &str) -> Result<Manifest, ManifestError> {
    if s.trim().is_empty() {
        return Err(ManifestError::Empty);
    }
    let raw: serde_yaml::Value = serde_yaml::from_str(s)?;
    validate_raw(&raw)?;
    Ok(serde_yaml::from_value(raw)?)
}

/// Checks version and required fields before typed decoding so errors name the field.
fn validate_raw(raw: &serde_yaml::Value) -> Result<(), ManifestError> {
    let map = match raw {
        serde_yaml::Value::Null => return Err(ManifestError::Empty),
        serde_yaml::Value::Mapping(m) if m.is_empty() => return Err(ManifestError::Empty),
        serde_yaml::Value::Mapping(m) => m,
        _ => return Err(ManifestError::Empty),
    };

    match map.get("manifest_version") {
        Some(v) if v.as_u64() == Some(SUPPORTED_VERSION) => {}
        Some(v) => return Err(ManifestError::UnsupportedVersion(render(v))),
        None => return Err(ManifestError::UnsupportedVersion("none".into())),
    }

    for field in REQUIRED_SECTIONS {
        if !map.contains_key(field) {
            return Err(ManifestError::MissingField(field));
        }
    }

    let build = &raw["build"];
    if build.get("artifact").and_then(|a| a.get("name")).is_none() {
        return Err(ManifestError::MissingField("build.artifact.name"));
    }
    if build.get("build_number").is_none() {
        return Err(ManifestError::MissingField("build.build_number"));
    }
    if raw["device"].get("target").is_none() {
        return Err(ManifestError::MissingField("device.target"));
    }
    Ok(())
}

fn render(v: &serde_yaml::Value) -> String {
    serde_yaml::to_string(v).map(|s| s.trim().to_string()).unwrap_or_else(|_| "?".into())
}
