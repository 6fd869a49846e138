//! Cascading configuration resolution.
//!
//! Each field resolves as task override, else project override, else global
//! default, else the built-in value. `force` is the exception: it is true
//! when the project is in the forced list or its own layer sets it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{ConfigLayer, TaskDecl};
use crate::defaults;
use crate::error::{Error, KeystoreBindingDetails, Result};
use crate::keystore::{BindingError, KeystoreRegistry};
use crate::sign::SignRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSpec {
    pub name: String,
    pub exec: String,
}

impl From<&TaskDecl> for TaskSpec {
    fn from(decl: &TaskDecl) -> Self {
        TaskSpec {
            name: decl.name.clone(),
            exec: decl.exec().to_string(),
        }
    }
}

/// Fully resolved settings for a project, or for one task of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskSpec>,
    pub sync: bool,
    pub preserve_local_changes: bool,
    pub build: bool,
    pub force_rebuild: bool,
    pub follow_tags: bool,
    pub subdir: Option<PathBuf>,
    pub tasks: Vec<TaskSpec>,
    pub keystore: Option<String>,
    pub keyalias: Option<String>,
    pub deploy_groups: BTreeSet<String>,
}

impl EffectiveConfig {
    /// A self-contained declaration of this task, used to carry it into the
    /// retry state with every override pinned.
    pub fn to_task_decl(&self) -> Option<TaskDecl> {
        let task = self.task.as_ref()?;
        Some(TaskDecl {
            name: task.name.clone(),
            exec: Some(task.exec.clone()),
            build: Some(self.build),
            keystore: self.keystore.clone(),
            keyalias: self.keyalias.clone(),
            deploy: Some(self.deploy_groups.clone()),
        })
    }

    fn task_label(&self) -> String {
        self.task
            .as_ref()
            .map(|t| t.name.clone())
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Resolved configuration for one project: project level plus one entry per
/// declared task, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectConfig {
    pub name: String,
    pub project: EffectiveConfig,
    pub tasks: Vec<EffectiveConfig>,
}

impl ProjectConfig {
    pub fn builds_anything(&self) -> bool {
        self.tasks.iter().any(|t| t.build)
    }

    pub fn build_tasks(&self) -> impl Iterator<Item = &EffectiveConfig> {
        self.tasks.iter().filter(|t| t.build)
    }

    /// Directory the build tool runs in.
    pub fn build_root(&self, project_dir: &Path) -> PathBuf {
        match &self.project.subdir {
            Some(sub) => project_dir.join(sub),
            None => project_dir.to_path_buf(),
        }
    }
}

pub fn resolve(
    project: &str,
    task: Option<&TaskSpec>,
    global_default: &ConfigLayer,
    project_override: &ConfigLayer,
    task_override: &ConfigLayer,
    forced: &BTreeSet<String>,
) -> EffectiveConfig {
    let merged = defaults::builtin_layer()
        .overlay(global_default)
        .overlay(project_override)
        .overlay(task_override);

    EffectiveConfig {
        project: project.to_string(),
        task: task.cloned(),
        sync: merged.sync.unwrap_or(false),
        preserve_local_changes: merged.preserve.unwrap_or(false),
        build: merged.build.unwrap_or(false),
        force_rebuild: forced.contains(project) || project_override.force == Some(true),
        follow_tags: merged.follow_tags.unwrap_or(false),
        subdir: merged.subdir,
        tasks: merged
            .tasks
            .unwrap_or_default()
            .iter()
            .map(TaskSpec::from)
            .collect(),
        keystore: merged.keystore.filter(|s| !s.trim().is_empty()),
        keyalias: merged.keyalias.filter(|s| !s.trim().is_empty()),
        deploy_groups: merged.deploy.unwrap_or_default(),
    }
}

/// A project's task list replaces the inherited one as a whole.
pub fn declared_tasks(global_default: &ConfigLayer, project_override: &ConfigLayer) -> Vec<TaskDecl> {
    project_override
        .tasks
        .clone()
        .or_else(|| global_default.tasks.clone())
        .unwrap_or_else(defaults::default_tasks)
}

pub fn resolve_project(
    name: &str,
    global_default: &ConfigLayer,
    project_override: &ConfigLayer,
    forced: &BTreeSet<String>,
) -> ProjectConfig {
    let project = resolve(
        name,
        None,
        global_default,
        project_override,
        &ConfigLayer::default(),
        forced,
    );

    let tasks = declared_tasks(global_default, project_override)
        .iter()
        .map(|decl| {
            resolve(
                name,
                Some(&TaskSpec::from(decl)),
                global_default,
                project_override,
                &decl.overrides(),
                forced,
            )
        })
        .collect();

    ProjectConfig {
        name: name.to_string(),
        project,
        tasks,
    }
}

/// Check every keystore binding a run depends on.
///
/// Covers each task that builds and each sign request carried over from a
/// previous run. Every problem is collected; the first one never hides the
/// rest.
pub fn validate_bindings(
    configs: &[ProjectConfig],
    carried: &[(String, SignRequest)],
    registry: &mut KeystoreRegistry,
    base: &Path,
) -> Result<()> {
    let mut errors = Vec::new();

    for config in configs.iter().flat_map(|c| c.build_tasks()) {
        if let Err(e) = check_binding(
            &config.project,
            &config.task_label(),
            config.keystore.as_deref(),
            config.keyalias.as_deref(),
            registry,
            base,
        ) {
            errors.push(e);
        }
    }

    for (project, request) in carried {
        if request.keystore.is_none() && request.keyalias.is_none() {
            continue;
        }
        if let Err(e) = check_binding(
            project,
            &request.display_name,
            request.keystore.as_deref(),
            request.keyalias.as_deref(),
            registry,
            base,
        ) {
            errors.push(e);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::validation_multiple_errors(errors))
    }
}

fn check_binding(
    project: &str,
    task: &str,
    keystore: Option<&str>,
    keyalias: Option<&str>,
    registry: &mut KeystoreRegistry,
    base: &Path,
) -> Result<()> {
    let details = |problem: String, path: Option<&Path>| KeystoreBindingDetails {
        project: project.to_string(),
        task: task.to_string(),
        problem,
        keystore: keystore.map(str::to_string),
        keyalias: keyalias.map(str::to_string),
        path: path.map(|p| p.display().to_string()),
    };

    let (Some(store), Some(alias)) = (keystore, keyalias) else {
        return Err(Error::config_keystore_binding(details(
            "build enabled but keystore/keyalias are undefined".to_string(),
            None,
        )));
    };

    match registry.bind(store, alias, base) {
        Ok(_) => Ok(()),
        Err(BindingError::UnknownKeystore) => Err(Error::config_keystore_binding(details(
            format!("keystore '{}' is not declared", store),
            None,
        ))),
        Err(BindingError::UnknownAlias) => Err(Error::config_keystore_binding(details(
            format!("alias '{}' is not declared on keystore '{}'", alias, store),
            None,
        ))),
        Err(BindingError::PathMissing(path)) => Err(Error::config_keystore_not_found(details(
            "keystore file not found".to_string(),
            Some(&path),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{KeyAlias, Keystore};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn layer_with_keystore(keystore: &str) -> ConfigLayer {
        ConfigLayer {
            keystore: Some(keystore.to_string()),
            ..ConfigLayer::default()
        }
    }

    #[test]
    fn task_beats_project_beats_default() {
        let default = layer_with_keystore("d");
        let project = layer_with_keystore("p");
        let task = layer_with_keystore("t");
        let none = BTreeSet::new();

        let both = resolve("App", None, &default, &project, &task, &none);
        assert_eq!(both.keystore.as_deref(), Some("t"));

        let project_only = resolve("App", None, &default, &project, &ConfigLayer::default(), &none);
        assert_eq!(project_only.keystore.as_deref(), Some("p"));

        let default_only = resolve(
            "App",
            None,
            &default,
            &ConfigLayer::default(),
            &ConfigLayer::default(),
            &none,
        );
        assert_eq!(default_only.keystore.as_deref(), Some("d"));
    }

    #[test]
    fn unset_fields_fall_back_to_builtin() {
        let config = resolve(
            "App",
            None,
            &ConfigLayer::default(),
            &ConfigLayer::default(),
            &ConfigLayer::default(),
            &BTreeSet::new(),
        );

        assert!(!config.sync);
        assert!(!config.build);
        assert_eq!(config.keystore, None);
        assert!(config.deploy_groups.is_empty());
        assert_eq!(config.tasks[0].exec, defaults::DEFAULT_TASK_EXEC);
    }

    #[test]
    fn force_is_forced_list_or_project_flag() {
        let forced = BTreeSet::from(["App".to_string()]);
        let flagged = ConfigLayer {
            force: Some(true),
            ..ConfigLayer::default()
        };
        let default_force = ConfigLayer {
            force: Some(true),
            ..ConfigLayer::default()
        };
        let empty = ConfigLayer::default();

        assert!(resolve("App", None, &empty, &empty, &empty, &forced).force_rebuild);
        assert!(resolve("Other", None, &empty, &flagged, &empty, &BTreeSet::new()).force_rebuild);
        assert!(!resolve("Other", None, &empty, &empty, &empty, &forced).force_rebuild);
        assert!(!resolve("Other", None, &default_force, &empty, &empty, &forced).force_rebuild);
    }

    #[test]
    fn project_tasks_replace_inherited_list() {
        let default = ConfigLayer {
            tasks: Some(vec![TaskDecl::named("a"), TaskDecl::named("b")]),
            build: Some(true),
            ..ConfigLayer::default()
        };
        let project = ConfigLayer {
            tasks: Some(vec![TaskDecl {
                build: Some(false),
                ..TaskDecl::named("c")
            }]),
            ..ConfigLayer::default()
        };

        let config = resolve_project("App", &default, &project, &BTreeSet::new());
        assert_eq!(config.tasks.len(), 1);
        assert_eq!(config.tasks[0].task.as_ref().unwrap().name, "c");
        assert!(!config.builds_anything());
        assert!(config.project.build);
    }

    #[test]
    fn task_decl_round_trips_resolved_values() {
        let default = ConfigLayer {
            build: Some(true),
            keystore: Some("main".to_string()),
            keyalias: Some("upload".to_string()),
            deploy: Some(BTreeSet::from(["phones".to_string()])),
            ..ConfigLayer::default()
        };
        let config = resolve_project("App", &default, &ConfigLayer::default(), &BTreeSet::new());
        let pinned: Vec<TaskDecl> = config
            .tasks
            .iter()
            .filter_map(EffectiveConfig::to_task_decl)
            .collect();

        let replay = resolve_project(
            "App",
            &defaults::retry_layer(),
            &ConfigLayer {
                tasks: Some(pinned),
                ..ConfigLayer::default()
            },
            &BTreeSet::new(),
        );

        assert_eq!(replay.tasks[0].keystore, config.tasks[0].keystore);
        assert_eq!(replay.tasks[0].keyalias, config.tasks[0].keyalias);
        assert_eq!(replay.tasks[0].deploy_groups, config.tasks[0].deploy_groups);
        assert_eq!(replay.tasks[0].build, config.tasks[0].build);
        assert_eq!(replay.tasks[0].task, config.tasks[0].task);
    }

    fn registry_with(path: &Path) -> KeystoreRegistry {
        let mut aliases = BTreeMap::new();
        aliases.insert("upload".to_string(), KeyAlias::default());
        let mut registry = KeystoreRegistry::default();
        registry.insert(
            "main",
            Keystore {
                path: path.to_path_buf(),
                password: None,
                aliases,
                used: false,
            },
        );
        registry
    }

    #[test]
    fn validation_collects_every_problem() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry_with(&dir.path().join("missing.jks"));

        let building = ConfigLayer {
            build: Some(true),
            ..ConfigLayer::default()
        };
        let unbound = resolve_project("Alpha", &building, &ConfigLayer::default(), &BTreeSet::new());
        let missing_file = resolve_project(
            "Beta",
            &building,
            &ConfigLayer {
                keystore: Some("main".to_string()),
                keyalias: Some("upload".to_string()),
                ..ConfigLayer::default()
            },
            &BTreeSet::new(),
        );
        let unknown_alias = resolve_project(
            "Gamma",
            &building,
            &ConfigLayer {
                keystore: Some("main".to_string()),
                keyalias: Some("other".to_string()),
                ..ConfigLayer::default()
            },
            &BTreeSet::new(),
        );

        let err = validate_bindings(
            &[unbound, missing_file, unknown_alias],
            &[],
            &mut registry,
            dir.path(),
        )
        .unwrap_err();

        let entries = err.details["errors"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["code"], "config.keystore_binding");
        assert_eq!(entries[1]["code"], "config.keystore_not_found");
        assert_eq!(entries[2]["code"], "config.keystore_binding");
        assert_eq!(entries[2]["details"]["project"], "Gamma");
    }

    #[test]
    fn valid_binding_marks_keystore_used() {
        let dir = TempDir::new().unwrap();
        let keystore_path = dir.path().join("release.jks");
        std::fs::write(&keystore_path, b"jks").unwrap();
        let mut registry = registry_with(Path::new("release.jks"));

        let config = resolve_project(
            "App",
            &ConfigLayer {
                build: Some(true),
                keystore: Some("main".to_string()),
                keyalias: Some("upload".to_string()),
                ..ConfigLayer::default()
            },
            &ConfigLayer::default(),
            &BTreeSet::new(),
        );

        validate_bindings(&[config], &[], &mut registry, dir.path()).unwrap();

        let store = registry.get("main").unwrap();
        assert!(store.used);
        assert!(store.aliases["upload"].used);
        assert_eq!(store.path, keystore_path);
    }

    #[test]
    fn non_building_projects_need_no_keystore() {
        let config = resolve_project(
            "App",
            &ConfigLayer::default(),
            &ConfigLayer::default(),
            &BTreeSet::new(),
        );
        let mut registry = KeystoreRegistry::default();
        assert!(validate_bindings(&[config], &[], &mut registry, Path::new("/")).is_ok());
    }
}
