//! Retry state.
//!
//! Written once at the end of every run. Each project entry is sparse: it
//! only carries the settings and leftover work a `--retry` run needs to pick
//! up exactly where the failure happened. A retry run reads nothing else.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{ConfigLayer, ProjectSource, RunPlan, TaskDecl};
use crate::defaults;
use crate::deploy::DeviceGroups;
use crate::error::{Error, Result};
use crate::keystore::KeystoreRegistry;
use crate::sign::SignRequest;
use crate::utils::io;

/// A key a ledger entry can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKey {
    Sync,
    Preserve,
    Build,
    Force,
    FollowTags,
    Subdir,
    Tasks,
    Keystore,
    Keyalias,
    Deploy,
    Resign,
    Deploylist,
}

impl LedgerKey {
    /// A failed sync retries the whole pipeline.
    pub const SYNC_FAILURE: &'static [LedgerKey] = &[
        LedgerKey::Sync,
        LedgerKey::Preserve,
        LedgerKey::Build,
        LedgerKey::Force,
        LedgerKey::FollowTags,
        LedgerKey::Subdir,
        LedgerKey::Tasks,
        LedgerKey::Keystore,
        LedgerKey::Keyalias,
        LedgerKey::Deploy,
        LedgerKey::Resign,
        LedgerKey::Deploylist,
    ];

    pub const BUILD_FAILURE: &'static [LedgerKey] = &[
        LedgerKey::Build,
        LedgerKey::Force,
        LedgerKey::Tasks,
        LedgerKey::Subdir,
        LedgerKey::Keystore,
        LedgerKey::Keyalias,
        LedgerKey::Deploy,
        LedgerKey::Resign,
        LedgerKey::Deploylist,
    ];

    pub const SIGN_FAILURE: &'static [LedgerKey] = &[
        LedgerKey::Subdir,
        LedgerKey::Keystore,
        LedgerKey::Keyalias,
        LedgerKey::Deploy,
        LedgerKey::Resign,
        LedgerKey::Deploylist,
    ];

    pub const DEPLOY_FAILURE: &'static [LedgerKey] = &[LedgerKey::Deploy, LedgerKey::Deploylist];

    /// A restore that failed after a merge leaves a tree that must be
    /// rebuilt once repaired.
    pub const RESTORE_FAILURE: &'static [LedgerKey] = &[
        LedgerKey::Build,
        LedgerKey::Force,
        LedgerKey::Tasks,
        LedgerKey::Subdir,
    ];
}

/// Retry state of one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub config: ConfigLayer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resign: Option<BTreeMap<PathBuf, SignRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploylist: Option<BTreeMap<String, BTreeSet<String>>>,
}

/// End-of-run values a ledger entry is cut from.
#[derive(Debug, Clone, Default)]
pub struct PendingValues {
    pub sync: bool,
    pub preserve: bool,
    pub build: bool,
    pub force: bool,
    pub follow_tags: bool,
    pub subdir: Option<PathBuf>,
    pub tasks: Vec<TaskDecl>,
    pub keystore: Option<String>,
    pub keyalias: Option<String>,
    pub deploy: BTreeSet<String>,
    pub resign: BTreeMap<PathBuf, SignRequest>,
    pub deploylist: BTreeMap<String, BTreeSet<String>>,
}

impl LedgerEntry {
    /// Keep only the flagged keys. Returns `None` when nothing is pending.
    pub fn capture(keys: &BTreeSet<LedgerKey>, values: &PendingValues) -> Option<LedgerEntry> {
        let mut entry = LedgerEntry::default();

        for key in keys {
            match key {
                LedgerKey::Sync => entry.config.sync = Some(values.sync),
                LedgerKey::Preserve => entry.config.preserve = Some(values.preserve),
                LedgerKey::Build => entry.config.build = Some(values.build),
                LedgerKey::Force => entry.config.force = Some(values.force),
                LedgerKey::FollowTags => entry.config.follow_tags = Some(values.follow_tags),
                LedgerKey::Subdir => entry.config.subdir = values.subdir.clone(),
                LedgerKey::Tasks => entry.config.tasks = Some(values.tasks.clone()),
                LedgerKey::Keystore => entry.config.keystore = values.keystore.clone(),
                LedgerKey::Keyalias => entry.config.keyalias = values.keyalias.clone(),
                LedgerKey::Deploy => entry.config.deploy = Some(values.deploy.clone()),
                LedgerKey::Resign => {
                    entry.resign = Some(values.resign.clone()).filter(|m| !m.is_empty())
                }
                LedgerKey::Deploylist => {
                    entry.deploylist = Some(values.deploylist.clone()).filter(|m| !m.is_empty())
                }
            }
        }

        (!keys.is_empty() && !entry.is_empty()).then_some(entry)
    }

    pub fn is_empty(&self) -> bool {
        self.config.is_empty() && self.resign.is_none() && self.deploylist.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_at: Option<String>,
    #[serde(default)]
    pub default: ConfigLayer,
    #[serde(default)]
    pub keystores: KeystoreRegistry,
    #[serde(default)]
    pub devices: DeviceGroups,
    #[serde(flatten)]
    pub projects: BTreeMap<String, LedgerEntry>,
}

/// Keys of the ledger itself; a project with one of these names cannot be
/// carried over.
pub const RESERVED_KEYS: &[&str] = &["written_at", "default", "keystores", "devices"];

impl Ledger {
    pub fn new(keystores: KeystoreRegistry, devices: DeviceGroups) -> Self {
        Ledger {
            written_at: Some(chrono::Utc::now().to_rfc3339()),
            default: defaults::retry_layer(),
            keystores,
            devices,
            projects: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, project: &str, entry: Option<LedgerEntry>) {
        let Some(entry) = entry else {
            return;
        };
        if RESERVED_KEYS.contains(&project) {
            log_status!("ledger", "Cannot carry over project named '{}'", project);
            return;
        }
        self.projects.insert(project.to_string(), entry);
    }

    pub fn is_clean(&self) -> bool {
        self.projects.is_empty()
    }

    pub fn load(path: &Path) -> Result<Ledger> {
        if !path.is_file() {
            return Err(Error::retry_state_missing(
                path.display().to_string(),
                "file does not exist",
            ));
        }
        let content = io::read_file(path, "read retry state")?;
        serde_json::from_str(&content)
            .map_err(|e| Error::config_invalid_json(path.display().to_string(), e))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::internal_json(e.to_string(), Some("serialize retry state".to_string())))?;
        io::write_file_atomic(path, &content, "write retry state")
    }

    /// The retry state as the sole configuration of a `--retry` run.
    pub fn into_plan(self) -> RunPlan {
        RunPlan {
            retry: true,
            defaults: self.default,
            forced: BTreeSet::new(),
            projects: self
                .projects
                .into_iter()
                .map(|(name, entry)| {
                    (
                        name,
                        ProjectSource {
                            layer: entry.config,
                            resign: entry.resign.unwrap_or_default(),
                            deploylist: entry.deploylist.unwrap_or_default(),
                        },
                    )
                })
                .collect(),
            keystores: self.keystores,
            devices: self.devices,
        }
    }
}
