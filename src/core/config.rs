use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::deploy::DeviceGroups;
use crate::error::{Error, Result};
use crate::keystore::KeystoreRegistry;
use crate::resolve::{self, ProjectConfig};
use crate::sign::SignRequest;
use crate::utils::io;

// ============================================================================
// Layers
// ============================================================================

/// One level of the override chain. Every field is optional; a missing
/// field defers to the layer below.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_tags: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskDecl>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyalias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<BTreeSet<String>>,
}

impl ConfigLayer {
    /// Field-wise overlay: a field present in `upper` wins.
    pub fn overlay(&self, upper: &ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            sync: upper.sync.or(self.sync),
            preserve: upper.preserve.or(self.preserve),
            build: upper.build.or(self.build),
            force: upper.force.or(self.force),
            follow_tags: upper.follow_tags.or(self.follow_tags),
            subdir: upper.subdir.clone().or_else(|| self.subdir.clone()),
            tasks: upper.tasks.clone().or_else(|| self.tasks.clone()),
            keystore: upper.keystore.clone().or_else(|| self.keystore.clone()),
            keyalias: upper.keyalias.clone().or_else(|| self.keyalias.clone()),
            deploy: upper.deploy.clone().or_else(|| self.deploy.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ConfigLayer::default()
    }
}

/// A declared build task. In TOML either a bare string (the task name) or a
/// table carrying per-task overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TaskSource")]
pub struct TaskDecl {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keystore: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyalias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<BTreeSet<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskSource {
    Name(String),
    Table(TaskTable),
}

#[derive(Deserialize)]
struct TaskTable {
    name: String,
    #[serde(default)]
    exec: Option<String>,
    #[serde(default)]
    build: Option<bool>,
    #[serde(default)]
    keystore: Option<String>,
    #[serde(default)]
    keyalias: Option<String>,
    #[serde(default)]
    deploy: Option<BTreeSet<String>>,
}

impl From<TaskSource> for TaskDecl {
    fn from(source: TaskSource) -> Self {
        match source {
            TaskSource::Name(name) => TaskDecl::named(name),
            TaskSource::Table(t) => TaskDecl {
                name: t.name,
                exec: t.exec,
                build: t.build,
                keystore: t.keystore,
                keyalias: t.keyalias,
                deploy: t.deploy,
            },
        }
    }
}

impl TaskDecl {
    pub fn named(name: impl Into<String>) -> Self {
        TaskDecl {
            name: name.into(),
            exec: None,
            build: None,
            keystore: None,
            keyalias: None,
            deploy: None,
        }
    }

    /// Build tool task to invoke; defaults to the task name.
    pub fn exec(&self) -> &str {
        self.exec.as_deref().unwrap_or(&self.name)
    }

    /// The per-task override layer.
    pub fn overrides(&self) -> ConfigLayer {
        ConfigLayer {
            build: self.build,
            keystore: self.keystore.clone(),
            keyalias: self.keyalias.clone(),
            deploy: self.deploy.clone(),
            ..ConfigLayer::default()
        }
    }
}

// ============================================================================
// Config file
// ============================================================================

/// Contents of `droidship.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Projects whose build is forced even without upstream changes.
    #[serde(default)]
    pub force: Vec<String>,
    #[serde(default)]
    pub default: ConfigLayer,
    #[serde(default)]
    pub keystores: KeystoreRegistry,
    #[serde(default)]
    pub devices: DeviceGroups,
    #[serde(default)]
    pub projects: BTreeMap<String, ConfigLayer>,
}

impl FileConfig {
    /// Load a config file. A missing file is an empty config unless it was
    /// named explicitly.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        if !path.exists() {
            if required {
                return Err(Error::config_missing_key(
                    "config",
                    Some(path.display().to_string()),
                )
                .with_hint("Pass an existing file to --config or omit the flag"));
            }
            return Ok(FileConfig::default());
        }

        let content = io::read_file(path, "read config")?;
        Self::parse(&content, &path.display().to_string())
    }

    pub fn parse(content: &str, origin: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config_invalid_toml(origin, e))
    }
}

// ============================================================================
// Command-line overrides
// ============================================================================

/// Value of `--build`: a plain switch, or an ad-hoc keystore binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOverride {
    Enabled(bool),
    WithKeystore { path: PathBuf, alias: String },
}

impl FromStr for BuildOverride {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(flag) = parse_flag(s) {
            return Ok(BuildOverride::Enabled(flag));
        }

        match s.split_once(',') {
            Some((path, alias)) if !path.trim().is_empty() && !alias.trim().is_empty() => {
                Ok(BuildOverride::WithKeystore {
                    path: PathBuf::from(path.trim()),
                    alias: alias.trim().to_string(),
                })
            }
            _ => Err(format!(
                "expected y, n or <keystore-path>,<alias>, got '{}'",
                s
            )),
        }
    }
}

/// Parse a y/n style switch.
pub fn parse_flag(s: &str) -> std::result::Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" | "1" | "on" => Ok(true),
        "n" | "no" | "false" | "0" | "off" => Ok(false),
        other => Err(format!("expected y or n, got '{}'", other)),
    }
}

/// Global-level overrides collected from the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub force: Vec<String>,
    pub sync: Option<bool>,
    pub preserve: Option<bool>,
    pub follow_tags: Option<bool>,
    pub build: Option<BuildOverride>,
    pub deploy: Vec<String>,
}

impl CliOverrides {
    /// The overrides as a layer on top of the file's `[default]`.
    pub fn layer(&self) -> ConfigLayer {
        let mut layer = ConfigLayer {
            sync: self.sync,
            preserve: self.preserve,
            follow_tags: self.follow_tags,
            ..ConfigLayer::default()
        };

        match &self.build {
            Some(BuildOverride::Enabled(flag)) => layer.build = Some(*flag),
            Some(BuildOverride::WithKeystore { path, alias }) => {
                layer.build = Some(true);
                layer.keystore = Some(path.display().to_string());
                layer.keyalias = Some(alias.clone());
            }
            None => {}
        }

        if !self.deploy.is_empty() {
            layer.deploy = Some(self.deploy.iter().cloned().collect());
        }

        layer
    }
}

// ============================================================================
// Run plan
// ============================================================================

/// Per-project input to a run: the project override layer plus work carried
/// over from a previous run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectSource {
    pub layer: ConfigLayer,
    pub resign: BTreeMap<PathBuf, SignRequest>,
    pub deploylist: BTreeMap<String, BTreeSet<String>>,
}

/// Everything a run needs, built either from config file + CLI or from the
/// retry state.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    pub retry: bool,
    pub defaults: ConfigLayer,
    pub forced: BTreeSet<String>,
    pub projects: BTreeMap<String, ProjectSource>,
    pub keystores: KeystoreRegistry,
    pub devices: DeviceGroups,
}

impl RunPlan {
    pub fn from_config(file: FileConfig, cli: &CliOverrides) -> RunPlan {
        let mut keystores = file.keystores;
        if let Some(BuildOverride::WithKeystore { path, alias }) = &cli.build {
            keystores.register_path(path, alias);
        }

        let mut forced: BTreeSet<String> = file.force.into_iter().collect();
        forced.extend(cli.force.iter().cloned());

        RunPlan {
            retry: false,
            defaults: file.default.overlay(&cli.layer()),
            forced,
            projects: file
                .projects
                .into_iter()
                .map(|(name, layer)| {
                    (
                        name,
                        ProjectSource {
                            layer,
                            ..ProjectSource::default()
                        },
                    )
                })
                .collect(),
            keystores,
            devices: file.devices,
        }
    }

    /// A retry run only touches projects carried in the retry state.
    pub fn selects(&self, project: &str) -> bool {
        !self.retry || self.projects.contains_key(project)
    }

    pub fn source(&self, project: &str) -> ProjectSource {
        self.projects.get(project).cloned().unwrap_or_default()
    }

    pub fn project_config(&self, project: &str) -> ProjectConfig {
        let layer = self
            .projects
            .get(project)
            .map(|s| s.layer.clone())
            .unwrap_or_default();
        resolve::resolve_project(project, &self.defaults, &layer, &self.forced)
    }

    /// Resolve every selected project and validate its keystore bindings.
    ///
    /// Keystores touched by a valid binding are marked used. All problems
    /// are reported together.
    pub fn prepare(&mut self, projects: &[String], base: &Path) -> Result<Vec<ProjectConfig>> {
        let configs: Vec<ProjectConfig> = projects
            .iter()
            .filter(|name| self.selects(name))
            .map(|name| self.project_config(name))
            .collect();

        let carried: Vec<(String, SignRequest)> = configs
            .iter()
            .filter_map(|c| self.projects.get(&c.name).map(|s| (c, s)))
            .flat_map(|(c, s)| {
                s.resign
                    .values()
                    .map(move |req| (c.name.clone(), req.clone()))
            })
            .collect();

        resolve::validate_bindings(&configs, &carried, &mut self.keystores, base)?;
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
force = ["App"]

[default]
sync = true
build = true
keystore = "main"
keyalias = "upload"
deploy = ["phones"]
tasks = ["assembleRelease"]

[keystores.main]
path = "~/keys/release.jks"

[keystores.main.aliases.upload]
name = "upload-key"

[devices]
phones = ["emulator-5554", "R58M123"]

[projects.App]
preserve = true

[[projects.App.tasks]]
name = "release"
exec = "assembleRelease"
deploy = ["tablets"]
"#;

    #[test]
    fn parses_sample_config() {
        let config = FileConfig::parse(SAMPLE, "droidship.toml").unwrap();

        assert_eq!(config.force, vec!["App".to_string()]);
        assert_eq!(config.default.sync, Some(true));
        assert_eq!(
            config.default.tasks,
            Some(vec![TaskDecl::named("assembleRelease")])
        );

        let app = &config.projects["App"];
        assert_eq!(app.preserve, Some(true));
        let tasks = app.tasks.as_ref().unwrap();
        assert_eq!(tasks[0].exec(), "assembleRelease");
        assert_eq!(
            tasks[0].deploy,
            Some(BTreeSet::from(["tablets".to_string()]))
        );
        assert!(config.keystores.get("main").is_some());
    }

    #[test]
    fn rejects_broken_toml() {
        let err = FileConfig::parse("[default\nsync = true", "droidship.toml").unwrap_err();
        assert_eq!(err.code.as_str(), "config.invalid_toml");
    }

    #[test]
    fn rejects_unknown_top_level_keys() {
        let err = FileConfig::parse("colour = 'blue'", "droidship.toml").unwrap_err();
        assert_eq!(err.code.as_str(), "config.invalid_toml");
    }

    #[test]
    fn missing_optional_file_is_empty() {
        let config = FileConfig::load(Path::new("/nonexistent/droidship.toml"), false).unwrap();
        assert!(config.projects.is_empty());
        assert!(FileConfig::load(Path::new("/nonexistent/droidship.toml"), true).is_err());
    }

    #[test]
    fn overlay_prefers_upper_fields() {
        let lower = ConfigLayer {
            sync: Some(true),
            keystore: Some("main".to_string()),
            ..ConfigLayer::default()
        };
        let upper = ConfigLayer {
            sync: Some(false),
            ..ConfigLayer::default()
        };

        let merged = lower.overlay(&upper);
        assert_eq!(merged.sync, Some(false));
        assert_eq!(merged.keystore.as_deref(), Some("main"));
    }

    #[test]
    fn build_override_parses_keystore_binding() {
        assert_eq!(
            "y".parse::<BuildOverride>().unwrap(),
            BuildOverride::Enabled(true)
        );
        assert_eq!(
            "n".parse::<BuildOverride>().unwrap(),
            BuildOverride::Enabled(false)
        );
        assert_eq!(
            "/keys/release.jks,upload".parse::<BuildOverride>().unwrap(),
            BuildOverride::WithKeystore {
                path: PathBuf::from("/keys/release.jks"),
                alias: "upload".to_string(),
            }
        );
        assert!("maybe".parse::<BuildOverride>().is_err());
    }

    #[test]
    fn cli_keystore_binding_registers_adhoc_keystore() {
        let cli = CliOverrides {
            build: Some(BuildOverride::WithKeystore {
                path: PathBuf::from("/keys/release.jks"),
                alias: "upload".to_string(),
            }),
            force: vec!["Notes".to_string()],
            ..CliOverrides::default()
        };

        let file = FileConfig::parse(SAMPLE, "droidship.toml").unwrap();
        let plan = RunPlan::from_config(file, &cli);

        assert_eq!(plan.defaults.build, Some(true));
        assert_eq!(plan.defaults.keystore.as_deref(), Some("/keys/release.jks"));
        assert!(plan.keystores.get("/keys/release.jks").is_some());
        assert!(plan.forced.contains("App"));
        assert!(plan.forced.contains("Notes"));
        assert!(plan.selects("Anything"));
    }
}
