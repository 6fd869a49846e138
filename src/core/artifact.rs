//! Build output discovery and matching.
//!
//! Outputs are tracked as (path, modification time) stamps so a task that
//! regenerates an existing file is seen as producing it again. Outputs are
//! grouped by containing directory (the route); siblings in one route are
//! splits of the same build and get a split suffix in their display name.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use crate::defaults;
use crate::error::{Error, Result};

/// Release candidates under a project, keyed by path relative to the project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    stamps: BTreeMap<PathBuf, Option<SystemTime>>,
}

impl Snapshot {
    pub fn insert(&mut self, path: PathBuf, modified: Option<SystemTime>) {
        self.stamps.insert(path, modified);
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}

/// List every `.apk` below a build output directory of the project.
pub fn discover(project_dir: &Path) -> Result<Snapshot> {
    let pattern = format!(
        "{}/**/*.apk",
        glob::Pattern::escape(&project_dir.to_string_lossy())
    );

    let entries = glob::glob(&pattern).map_err(|e| {
        Error::internal_unexpected(format!("Invalid glob pattern '{}': {}", pattern, e))
    })?;

    let mut snapshot = Snapshot::default();
    for path in entries.filter_map(|entry| entry.ok()).filter(|p| p.is_file()) {
        let Ok(relative) = path.strip_prefix(project_dir) else {
            continue;
        };
        if !slashed(relative).contains(defaults::APK_OUTPUT_SEGMENT) {
            continue;
        }
        let modified = path.metadata().and_then(|m| m.modified()).ok();
        snapshot.insert(relative.to_path_buf(), modified);
    }

    Ok(snapshot)
}

/// Outputs that are new or regenerated since `previous`.
///
/// The symmetric difference of the stamps, restricted to paths that exist now.
pub fn delta(current: &Snapshot, previous: &Snapshot) -> Vec<PathBuf> {
    current
        .stamps
        .iter()
        .filter(|(path, modified)| previous.stamps.get(*path) != Some(*modified))
        .map(|(path, _)| path.clone())
        .collect()
}

/// Sibling outputs sharing one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactGroup {
    pub route: PathBuf,
    pub members: Vec<PathBuf>,
}

impl ArtifactGroup {
    pub fn new(route: impl Into<PathBuf>, members: Vec<PathBuf>) -> Self {
        ArtifactGroup {
            route: route.into(),
            members,
        }
    }

    /// Split suffix per member, in member order.
    ///
    /// Each member keeps the tokens of its route-relative name that the
    /// previous member does not have; the first member is compared with the
    /// second. A group of one has no splits.
    pub fn split_names(&self) -> Vec<Option<String>> {
        if self.members.len() < 2 {
            return vec![None; self.members.len()];
        }

        let tokens: Vec<Vec<String>> = self
            .members
            .iter()
            .map(|m| tokenize(m.strip_prefix(&self.route).unwrap_or(m.as_path())))
            .collect();

        (0..tokens.len())
            .map(|i| {
                let other = if i == 0 { 1 } else { i - 1 };
                let theirs: BTreeSet<&str> = tokens[other].iter().map(String::as_str).collect();
                let own: Vec<&str> = tokens[i]
                    .iter()
                    .map(String::as_str)
                    .filter(|t| !theirs.contains(t))
                    .collect();
                (!own.is_empty()).then(|| own.join("-"))
            })
            .collect()
    }
}

fn tokenize(relative: &Path) -> Vec<String> {
    slashed(&relative.with_extension(""))
        .split(['-', '/'])
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn slashed(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Group outputs by route, keeping discovery order.
pub fn classify(paths: &[PathBuf]) -> Vec<ArtifactGroup> {
    let mut groups: Vec<ArtifactGroup> = Vec::new();
    for path in paths {
        let route = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        match groups.iter_mut().find(|g| g.route == route) {
            Some(group) => group.members.push(path.clone()),
            None => groups.push(ArtifactGroup::new(route, vec![path.clone()])),
        }
    }
    groups
}

/// Release file name for an output.
///
/// `<project>[-<module>]-<variant dirs>[-<split>].apk`; the module is left
/// out for the project root and for `app`.
pub fn display_name(project: &str, path: &Path, split: Option<&str>) -> String {
    let text = slashed(path);
    let (prefix, rest) = match text.find(defaults::APK_OUTPUT_SEGMENT) {
        Some(i) => (&text[..i], &text[i + defaults::APK_OUTPUT_SEGMENT.len()..]),
        None => ("", text.as_str()),
    };

    let mut parts = vec![project.to_string()];

    let module = prefix
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|m| !m.is_empty() && *m != "app");
    parts.extend(module.map(str::to_string));

    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    match segments.split_last() {
        Some((_, variants)) if !variants.is_empty() => {
            parts.extend(variants.iter().map(|v| v.to_string()))
        }
        _ => parts.push(
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ),
    }

    parts.extend(split.map(str::to_string));
    format!("{}.apk", parts.join("-"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedArtifact {
    pub path: PathBuf,
    pub display_name: String,
}

/// Classify outputs and name each one for release.
pub fn match_artifacts(project: &str, paths: &[PathBuf]) -> Vec<MatchedArtifact> {
    classify(paths)
        .into_iter()
        .flat_map(|group| {
            let splits = group.split_names();
            group
                .members
                .into_iter()
                .zip(splits)
                .map(|(path, split)| MatchedArtifact {
                    display_name: display_name(project, &path, split.as_deref()),
                    path,
                })
                .collect::<Vec<_>>()
        })
        .collect()
}
