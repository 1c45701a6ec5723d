use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;

use crate::{FlashTool, ToolOutput};

/// One canned tool run. Deserializable so fixture scenarios can script flashing.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ScriptedStep {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ScriptedStep {
    pub fn ok() -> Self {
        Self { exit_code: 0, ..Self::default() }
    }

    pub fn fail(stderr: impl Into<String>) -> Self {
        Self { exit_code: 2, stdout: String::new(), stderr: stderr.into() }
    }
}

/// Flash tool double: replays steps in order, then succeeds forever.
#[derive(Default)]
pub struct ScriptedFlashTool {
    steps: Mutex<VecDeque<ScriptedStep>>,
    calls: Mutex<Vec<(String, PathBuf, String)>>,
}

impl ScriptedFlashTool {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self { steps: Mutex::new(steps.into()), calls: Mutex::new(Vec::new()) }
    }

    /// `(operation, image, port)` for every invocation.
    pub fn calls(&self) -> Vec<(String, PathBuf, String)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn write_count(&self) -> usize {
        self.calls().iter().filter(|(op, _, _)| op == "write_flash").count()
    }

    fn next(&self, op: &str, image: &Path, port: &str) -> ToolOutput {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push((op.to_string(), image.to_path_buf(), port.to_string()));
        let step = self.steps.lock().unwrap_or_else(|e| e.into_inner()).pop_front().unwrap_or_else(ScriptedStep::ok);
        ToolOutput { exit_code: Some(step.exit_code), stdout: step.stdout, stderr: step.stderr }
    }
}

impl FlashTool for ScriptedFlashTool {
    fn program(&self) -> &str {
        "scripted-flash"
    }

    fn write_flash(&self, image: &Path, port: &str) -> std::io::Result<ToolOutput> {
        Ok(self.next("write_flash", image, port))
    }

    fn run_app(&self, port: &str) -> std::io::Result<ToolOutput> {
        Ok(self.next("run", Path::new(""), port))
    }
}
