use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logs::ProjectLog;
use crate::utils::command;

// === Device groups ===

/// Named groups of device serials. A name that is not a group is taken as a
/// serial itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceGroups(BTreeMap<String, Vec<String>>);

impl DeviceGroups {
    pub fn new(groups: BTreeMap<String, Vec<String>>) -> Self {
        DeviceGroups(groups)
    }

    pub fn targets(&self, groups: &BTreeSet<String>) -> BTreeSet<String> {
        groups
            .iter()
            .flat_map(|name| match self.0.get(name) {
                Some(devices) => devices.clone(),
                None => vec![name.clone()],
            })
            .collect()
    }
}

// === Transport ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Ready,
    TimedOut,
    Failed,
}

pub trait DeviceTransport {
    /// Wait until `target` is reachable, giving up after `timeout`.
    fn wait_for_device(&self, target: &str, timeout: Duration, log: &mut ProjectLog) -> Probe;

    /// Install (replacing) an artifact on `target`.
    fn install(&self, target: &str, apk: &Path, log: &mut ProjectLog) -> bool;
}

/// Android platform-tools `adb`.
pub struct Adb;

impl DeviceTransport for Adb {
    fn wait_for_device(&self, target: &str, timeout: Duration, log: &mut ProjectLog) -> Probe {
        log.section(&format!("adb -s {} wait-for-device", target));
        let args = ["-s", target, "wait-for-device"];
        match command::run_with_timeout(Path::new("."), "adb", &args, timeout, log.sink()) {
            Ok(Some(0)) => Probe::Ready,
            Ok(None) => {
                log.note(&format!("no answer within {}s", timeout.as_secs()));
                Probe::TimedOut
            }
            Ok(Some(_)) => Probe::Failed,
            Err(e) => {
                log.note(&e.to_string());
                Probe::Failed
            }
        }
    }

    fn install(&self, target: &str, apk: &Path, log: &mut ProjectLog) -> bool {
        let args = [
            OsStr::new("-s"),
            OsStr::new(target),
            OsStr::new("install"),
            OsStr::new("-r"),
            apk.as_os_str(),
        ];
        log.exec(Path::new("."), "adb", &args, None) == 0
    }
}

// === Engine ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Installed,
    TimedOut,
    Unreachable,
    InstallFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetResult {
    pub target: String,
    pub status: TargetStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeployOutcome {
    NoTargets,
    Completed { results: Vec<TargetResult> },
}

impl DeployOutcome {
    pub fn failed(&self) -> BTreeSet<String> {
        match self {
            DeployOutcome::NoTargets => BTreeSet::new(),
            DeployOutcome::Completed { results } => results
                .iter()
                .filter(|r| r.status != TargetStatus::Installed)
                .map(|r| r.target.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployRecord {
    pub display_name: String,
    pub outcome: DeployOutcome,
}

pub struct DeployEngine<'a> {
    transport: &'a dyn DeviceTransport,
    release_dir: &'a Path,
    probe_timeout: Duration,
}

impl<'a> DeployEngine<'a> {
    pub fn new(transport: &'a dyn DeviceTransport, release_dir: &'a Path, probe_timeout: Duration) -> Self {
        DeployEngine {
            transport,
            release_dir,
            probe_timeout,
        }
    }

    /// Push a released artifact to every target. Unreachable targets are
    /// not pushed to.
    pub fn deploy(
        &self,
        display_name: &str,
        targets: &BTreeSet<String>,
        log: &mut ProjectLog,
    ) -> DeployOutcome {
        if targets.is_empty() {
            return DeployOutcome::NoTargets;
        }

        let apk = self.release_dir.join(display_name);
        let results = targets
            .iter()
            .map(|target| {
                let status = match self.transport.wait_for_device(target, self.probe_timeout, log) {
                    Probe::TimedOut => TargetStatus::TimedOut,
                    Probe::Failed => TargetStatus::Unreachable,
                    Probe::Ready => {
                        log_status!("deploy", "Installing {} on {}", display_name, target);
                        if self.transport.install(target, &apk, log) {
                            TargetStatus::Installed
                        } else {
                            TargetStatus::InstallFailed
                        }
                    }
                };
                if status != TargetStatus::Installed {
                    log_status!("deploy", "{} on {}: {:?}", display_name, target, status);
                }
                TargetResult {
                    target: target.clone(),
                    status,
                }
            })
            .collect();

        DeployOutcome::Completed { results }
    }
}
