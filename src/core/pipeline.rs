//! Per-project release pipeline: sync, build, sign, deploy.
//!
//! Projects run one after another. A failing stage never aborts the run; it
//! flags the ledger keys needed to resume that project, and the ledger is
//! written once all projects are done.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::artifact;
use crate::build::{self, BuildReport, BuildTool};
use crate::config::{RunPlan, TaskDecl};
use crate::defaults;
use crate::deploy::{DeployEngine, DeployRecord, DeviceTransport};
use crate::error::{Error, Result};
use crate::fetch::{self, FetchDetector, RestoreOutcome, SyncOutcome, SyncReport};
use crate::ledger::{Ledger, LedgerEntry, LedgerKey, PendingValues};
use crate::logs::ProjectLog;
use crate::paths;
use crate::resolve::{EffectiveConfig, ProjectConfig};
use crate::sign::{SignEngine, SignRecord, SignRequest, Signer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Syncing,
    Unchanged,
    Updated,
    SyncFailed,
    SyncSkipped,
    Building,
    BuildFailed,
    BuildOk,
    Signing,
    SignPending,
    SignOk,
    Deploying,
    Done,
}

/// External tools the pipeline drives.
pub struct Toolchain<'a> {
    pub fetch: &'a dyn FetchDetector,
    pub build: &'a dyn BuildTool,
    pub signer: &'a dyn Signer,
    pub transport: &'a dyn DeviceTransport,
}

/// Transient state of one project during one run.
#[derive(Debug)]
pub struct ProjectRunState {
    pub name: String,
    pub fetcher: Option<&'static str>,
    pub changed: bool,
    pub force: bool,
    pub build_blocked: bool,
    /// Tasks to carry over if the build has to be retried.
    pub tasks: Vec<TaskDecl>,
    pub sign_worklist: BTreeMap<PathBuf, SignRequest>,
    pub deploy_list: BTreeMap<String, BTreeSet<String>>,
    pub releases: BTreeSet<String>,
    pub trail: Vec<Stage>,
    pub pending: BTreeSet<LedgerKey>,
}

impl ProjectRunState {
    fn new(config: &ProjectConfig, plan: &RunPlan, fetcher: Option<&'static str>) -> Self {
        let source = plan.source(&config.name);
        ProjectRunState {
            name: config.name.clone(),
            fetcher,
            changed: false,
            force: config.project.force_rebuild,
            build_blocked: false,
            tasks: config
                .build_tasks()
                .filter_map(EffectiveConfig::to_task_decl)
                .collect(),
            sign_worklist: source.resign,
            deploy_list: source.deploylist,
            releases: BTreeSet::new(),
            trail: vec![Stage::Idle],
            pending: BTreeSet::new(),
        }
    }

    fn enter(&mut self, stage: Stage) {
        self.trail.push(stage);
    }

    fn flag(&mut self, keys: &[LedgerKey]) {
        self.pending.extend(keys.iter().copied());
    }

    fn values(&self, config: &ProjectConfig) -> PendingValues {
        PendingValues {
            sync: config.project.sync,
            preserve: config.project.preserve_local_changes,
            build: config.builds_anything(),
            force: self.force,
            follow_tags: config.project.follow_tags,
            subdir: config.project.subdir.clone(),
            tasks: self.tasks.clone(),
            keystore: config.project.keystore.clone(),
            keyalias: config.project.keyalias.clone(),
            deploy: config.project.deploy_groups.clone(),
            resign: self.sign_worklist.clone(),
            deploylist: self.deploy_list.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectReport {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetcher: Option<&'static str>,
    pub last_updated: String,
    pub trail: Vec<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub signing: Vec<SignRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deploys: Vec<DeployRecord>,
    pub releases: BTreeSet<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub pending: BTreeSet<LedgerKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub projects: usize,
    pub released: usize,
    pub pending_projects: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub retry: bool,
    pub projects: Vec<ProjectReport>,
    pub summary: RunSummary,
}

pub struct RunOutcome {
    pub report: RunReport,
    pub ledger: Ledger,
}

pub struct Orchestrator<'a> {
    workdir: PathBuf,
    release_dir: PathBuf,
    plan: &'a RunPlan,
    tools: Toolchain<'a>,
    probe_timeout: Duration,
    project_logs: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(workdir: &Path, plan: &'a RunPlan, tools: Toolchain<'a>) -> Self {
        Orchestrator {
            workdir: workdir.to_path_buf(),
            release_dir: paths::releases(workdir),
            plan,
            tools,
            probe_timeout: defaults::DEVICE_PROBE_TIMEOUT,
            project_logs: true,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Keep child process output out of the project directories.
    pub fn without_project_logs(mut self) -> Self {
        self.project_logs = false;
        self
    }

    pub fn run(&self, configs: &[ProjectConfig]) -> RunOutcome {
        let mut ledger = Ledger::new(self.plan.keystores.clone(), self.plan.devices.clone());
        let mut projects = Vec::new();

        for config in configs {
            let (report, entry) = self.run_project(config);
            ledger.record(&config.name, entry);
            projects.push(report);
        }

        let summary = RunSummary {
            projects: projects.len(),
            released: projects.iter().map(|p| p.releases.len()).sum(),
            pending_projects: ledger.projects.keys().cloned().collect(),
        };

        RunOutcome {
            report: RunReport {
                retry: self.plan.retry,
                projects,
                summary,
            },
            ledger,
        }
    }

    pub fn run_project(&self, config: &ProjectConfig) -> (ProjectReport, Option<LedgerEntry>) {
        let name = config.name.as_str();
        let project_dir = self.workdir.join(name);
        let root = config.build_root(&project_dir);

        let mut log = if self.project_logs {
            ProjectLog::create(&project_dir).unwrap_or_else(|e| {
                log_status!("project", "{}: no log file ({})", name, e);
                ProjectLog::disabled()
            })
        } else {
            ProjectLog::disabled()
        };

        let fetcher = self.tools.fetch.detect(&project_dir);
        let mut state = ProjectRunState::new(config, self.plan, fetcher.as_ref().map(|f| f.kind()));
        let last_updated = fetcher
            .as_ref()
            .map(|f| f.last_update_label())
            .unwrap_or_else(|| fetch::AGE_UNKNOWN.to_string());
        log_status!("project", "{} (last updated {})", name, last_updated);

        // Sync
        let mut sync_report = None;
        if config.project.sync {
            state.enter(Stage::Syncing);
            let report = fetch::sync(
                fetcher.as_deref(),
                config.project.preserve_local_changes,
                config.project.follow_tags,
                &mut log,
            );

            match report.outcome {
                SyncOutcome::Skipped => state.enter(Stage::SyncSkipped),
                SyncOutcome::Unchanged => state.enter(Stage::Unchanged),
                SyncOutcome::Updated => {
                    state.changed = true;
                    state.enter(Stage::Updated);
                }
                SyncOutcome::Failed => {
                    log_status!("sync", "{}: sync failed", name);
                    state.flag(LedgerKey::SYNC_FAILURE);
                    state.enter(Stage::SyncFailed);
                }
            }

            if report.restore == RestoreOutcome::Failed {
                log_status!(
                    "sync",
                    "{}: local changes could not be re-applied, build postponed",
                    name
                );
                state.build_blocked = true;
                state.force = true;
                state.flag(LedgerKey::RESTORE_FAILURE);
            }
            sync_report = Some(report);
        }

        // Build
        let mut build_report = None;
        if config.builds_anything() && (state.changed || state.force) && !state.build_blocked {
            state.enter(Stage::Building);

            let mut previous = snapshot(&root);
            let worklist = &mut state.sign_worklist;
            let report = build::run_tasks(self.tools.build, &root, &config.tasks, &mut log, |task| {
                let current = snapshot(&root);
                let produced = artifact::delta(&current, &previous);
                for matched in artifact::match_artifacts(name, &produced) {
                    worklist.insert(matched.path, SignRequest::for_task(task, matched.display_name));
                }
                previous = current;
            });

            if report.failed() {
                state.tasks = report.retry.clone();
                state.force = true;
                state.flag(LedgerKey::BUILD_FAILURE);
                state.enter(Stage::BuildFailed);
            } else {
                state.enter(Stage::BuildOk);
            }
            build_report = Some(report);
        }

        // Sign
        let mut signing = Vec::new();
        if !state.sign_worklist.is_empty() {
            state.enter(Stage::Signing);
            let engine = SignEngine::new(self.tools.signer, &self.plan.keystores, &self.release_dir);
            let batch = engine.sign_worklist(&root, &state.sign_worklist, &mut log);

            for request in &batch.released {
                state.releases.insert(request.display_name.clone());
                state
                    .deploy_list
                    .entry(request.display_name.clone())
                    .or_default()
                    .extend(self.plan.devices.targets(&request.deploy));
            }

            state.sign_worklist = batch.pending;
            if state.sign_worklist.is_empty() {
                state.enter(Stage::SignOk);
            } else {
                state.flag(LedgerKey::SIGN_FAILURE);
                state.enter(Stage::SignPending);
            }
            signing = batch.records;
        }

        // Deploy
        let mut deploys = Vec::new();
        if !state.deploy_list.is_empty() {
            state.enter(Stage::Deploying);
            let engine = DeployEngine::new(self.tools.transport, &self.release_dir, self.probe_timeout);
            let mut remaining = BTreeMap::new();

            for (display_name, targets) in std::mem::take(&mut state.deploy_list) {
                let outcome = engine.deploy(&display_name, &targets, &mut log);
                let failed = outcome.failed();
                if !failed.is_empty() {
                    remaining.insert(display_name.clone(), failed);
                }
                deploys.push(DeployRecord {
                    display_name,
                    outcome,
                });
            }

            if !remaining.is_empty() {
                state.flag(LedgerKey::DEPLOY_FAILURE);
            }
            state.deploy_list = remaining;
        }

        state.enter(Stage::Done);

        let entry = LedgerEntry::capture(&state.pending, &state.values(config));
        let report = ProjectReport {
            name: state.name.clone(),
            fetcher: state.fetcher,
            last_updated,
            trail: state.trail.clone(),
            sync: sync_report,
            build: build_report,
            signing,
            deploys,
            releases: state.releases.clone(),
            pending: state.pending.clone(),
            log: log.path().map(Path::to_path_buf),
        };

        (report, entry)
    }
}

fn snapshot(root: &Path) -> artifact::Snapshot {
    artifact::discover(root).unwrap_or_else(|e| {
        log_status!("build", "Could not list build outputs: {}", e);
        artifact::Snapshot::default()
    })
}

/// Project directories of a workdir, sorted. Hidden directories and the
/// release directory are not projects.
pub fn discover_projects(workdir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(workdir).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("list {}", workdir.display())))
    })?;

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.') && name != defaults::RELEASES_DIR)
        .collect();
    names.sort();

    Ok(names)
}
