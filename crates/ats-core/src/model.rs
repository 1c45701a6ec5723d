use serde::{Deserialize, Serialize};

/// Status of a single test outcome. Serialized in upper case to match the report formats.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "PASS",
            TestStatus::Fail => "FAIL",
            TestStatus::Skip => "SKIP",
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall verdict of one run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pass,
    Fail,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pass => "PASS",
            RunStatus::Fail => "FAIL",
        }
    }

    /// Process exit status for this verdict.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Pass => 0,
            RunStatus::Fail => 1,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States of the bring-up state machine.
///
/// `Reset` and `Recapture` are optional detours; `Reporting` is reachable from
/// `Start` and `Flashing` as short-circuits.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Start,
    Flashing,
    BootWait,
    Reset,
    StalenessCheck,
    Recapture,
    Testing,
    Reporting,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::Flashing => "flashing",
            Phase::BootWait => "boot_wait",
            Phase::Reset => "reset",
            Phase::StalenessCheck => "staleness_check",
            Phase::Recapture => "recapture",
            Phase::Testing => "testing",
            Phase::Reporting => "reporting",
            Phase::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done)
    }
}

/// Operator-facing hint attached to every failure diagnostic.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Remedy {
    ReplugDevice,
    CheckPermissions,
    PassExplicitPort,
    InstallFlashTool,
    FixManifest,
    CheckFirmwareImage,
    CheckTestProcedure,
}

impl Remedy {
    pub fn hint(&self) -> &'static str {
        match self {
            Remedy::ReplugDevice => "unplug and replug the board's USB cable, then retry",
            Remedy::CheckPermissions => "check that the current user can access the serial device (e.g. member of the dialout group)",
            Remedy::PassExplicitPort => "pass the serial port explicitly with --port or SERIAL_PORT",
            Remedy::InstallFlashTool => "install the flashing tool and make sure it is on PATH",
            Remedy::FixManifest => "fix the manifest fields reported above",
            Remedy::CheckFirmwareImage => "verify the firmware image matches the attached chip",
            Remedy::CheckTestProcedure => "make sure the test procedure exists and is executable",
        }
    }
}
