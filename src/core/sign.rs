use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::keystore::{KeystoreRegistry, SigningKey};
use crate::logs::ProjectLog;
use crate::resolve::EffectiveConfig;
use crate::utils::io;

/// What to do with one build output: the key to sign it with and where to
/// deploy the release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyalias: Option<String>,
    #[serde(default)]
    pub deploy: BTreeSet<String>,
}

impl SignRequest {
    /// Bind an output to the settings of the task that produced it.
    pub fn for_task(task: &EffectiveConfig, display_name: impl Into<String>) -> Self {
        SignRequest {
            display_name: display_name.into(),
            keystore: task.keystore.clone(),
            keyalias: task.keyalias.clone(),
            deploy: task.deploy_groups.clone(),
        }
    }
}

pub trait Signer {
    /// Whether the file already carries a valid signature.
    fn verify(&self, apk: &Path, log: &mut ProjectLog) -> bool;

    fn sign(&self, apk: &Path, out: &Path, key: &SigningKey<'_>, log: &mut ProjectLog) -> bool;
}

/// Android build-tools `apksigner`.
pub struct ApkSigner;

impl Signer for ApkSigner {
    fn verify(&self, apk: &Path, log: &mut ProjectLog) -> bool {
        let args = [OsStr::new("verify"), apk.as_os_str()];
        log.exec(parent_of(apk), "apksigner", &args, None) == 0
    }

    fn sign(&self, apk: &Path, out: &Path, key: &SigningKey<'_>, log: &mut ProjectLog) -> bool {
        let args = [
            OsStr::new("sign"),
            OsStr::new("--ks"),
            key.path.as_os_str(),
            OsStr::new("--ks-key-alias"),
            OsStr::new(key.alias),
            OsStr::new("--ks-pass"),
            OsStr::new("stdin"),
            OsStr::new("--key-pass"),
            OsStr::new("stdin"),
            OsStr::new("--out"),
            out.as_os_str(),
            OsStr::new("--in"),
            apk.as_os_str(),
        ];
        let input = format!(
            "{}\n{}\n",
            key.store_password.expose(),
            key.key_password.expose()
        );
        log.exec(parent_of(apk), "apksigner", &args, Some(input.as_bytes())) == 0
    }
}

fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignOutcome {
    /// Signed into the release directory.
    Signed { released_as: PathBuf },
    /// Already signed; moved to the release directory unchanged.
    Unneeded { released_as: PathBuf },
    NeedsRetry { reason: String },
    /// The output disappeared before it could be signed.
    Missing,
}

impl SignOutcome {
    pub fn released(&self) -> bool {
        matches!(
            self,
            SignOutcome::Signed { .. } | SignOutcome::Unneeded { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignRecord {
    pub artifact: PathBuf,
    pub display_name: String,
    pub outcome: SignOutcome,
}

#[derive(Debug, Default)]
pub struct SignBatch {
    pub records: Vec<SignRecord>,
    /// Requests whose artifact reached the release directory.
    pub released: Vec<SignRequest>,
    /// Requests to retry next run.
    pub pending: BTreeMap<PathBuf, SignRequest>,
}

pub struct SignEngine<'a> {
    signer: &'a dyn Signer,
    keystores: &'a KeystoreRegistry,
    release_dir: &'a Path,
}

impl<'a> SignEngine<'a> {
    pub fn new(signer: &'a dyn Signer, keystores: &'a KeystoreRegistry, release_dir: &'a Path) -> Self {
        SignEngine {
            signer,
            keystores,
            release_dir,
        }
    }

    /// Release one output. `apk` is relative to `project_dir`.
    ///
    /// The build output is removed once released; on failure it stays where
    /// it is for the next attempt.
    pub fn sign(
        &self,
        project_dir: &Path,
        apk: &Path,
        request: &SignRequest,
        log: &mut ProjectLog,
    ) -> SignOutcome {
        let source = project_dir.join(apk);
        if !source.is_file() {
            log_status!("sign", "{} no longer exists, dropping it", apk.display());
            return SignOutcome::Missing;
        }

        if let Err(e) = io::ensure_dir(self.release_dir, "create release directory") {
            return SignOutcome::NeedsRetry {
                reason: e.to_string(),
            };
        }
        let dest = self.release_dir.join(&request.display_name);

        if self.signer.verify(&source, log) {
            return match io::move_file(&source, &dest, "release signed artifact") {
                Ok(()) => {
                    log_status!("sign", "{} is already signed", request.display_name);
                    SignOutcome::Unneeded { released_as: dest }
                }
                Err(e) => SignOutcome::NeedsRetry {
                    reason: format!("{}: {}", e.message, e.details),
                },
            };
        }

        let key = match (request.keystore.as_deref(), request.keyalias.as_deref()) {
            (Some(store), Some(alias)) => self.keystores.signing_key(store, alias),
            _ => None,
        };
        let Some(key) = key else {
            return SignOutcome::NeedsRetry {
                reason: "no unlocked signing key for this artifact".to_string(),
            };
        };

        log_status!("sign", "Signing {}", request.display_name);
        if !self.signer.sign(&source, &dest, &key, log) {
            let _ = std::fs::remove_file(&dest);
            return SignOutcome::NeedsRetry {
                reason: "signer exited with an error".to_string(),
            };
        }

        if let Err(e) = std::fs::remove_file(&source) {
            log.note(&format!("could not remove {}: {}", source.display(), e));
        }
        SignOutcome::Signed { released_as: dest }
    }

    /// Release every entry of a worklist. Failures never stop the batch.
    pub fn sign_worklist(
        &self,
        project_dir: &Path,
        worklist: &BTreeMap<PathBuf, SignRequest>,
        log: &mut ProjectLog,
    ) -> SignBatch {
        let mut batch = SignBatch::default();

        for (apk, request) in worklist {
            let outcome = self.sign(project_dir, apk, request, log);
            if outcome.released() {
                batch.released.push(request.clone());
            } else if let SignOutcome::NeedsRetry { reason } = &outcome {
                log_status!("sign", "{}: {}", request.display_name, reason);
                batch.pending.insert(apk.clone(), request.clone());
            }
            batch.records.push(SignRecord {
                artifact: apk.clone(),
                display_name: request.display_name.clone(),
                outcome,
            });
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{KeyAlias, Keystore, Secret};
    use std::cell::RefCell;
    use tempfile::TempDir;

    struct FakeSigner {
        signed: BTreeSet<&'static str>,
        sign_ok: bool,
        signings: RefCell<usize>,
    }

    impl Signer for FakeSigner {
        fn verify(&self, apk: &Path, _: &mut ProjectLog) -> bool {
            let name = apk.file_name().unwrap().to_string_lossy().into_owned();
            self.signed.contains(name.as_str())
        }

        fn sign(&self, apk: &Path, out: &Path, key: &SigningKey<'_>, _: &mut ProjectLog) -> bool {
            *self.signings.borrow_mut() += 1;
            assert_eq!(key.store_password.expose(), "storepw");
            if self.sign_ok {
                std::fs::copy(apk, out).unwrap();
            }
            self.sign_ok
        }
    }

    fn unlocked_registry() -> KeystoreRegistry {
        let mut aliases = BTreeMap::new();
        aliases.insert(
            "upload".to_string(),
            KeyAlias {
                name: None,
                password: Some(Secret::new("keypw")),
                used: true,
            },
        );
        let mut registry = KeystoreRegistry::default();
        registry.insert(
            "main",
            Keystore {
                path: PathBuf::from("/keys/release.jks"),
                password: Some(Secret::new("storepw")),
                aliases,
                used: true,
            },
        );
        registry
    }

    fn request(name: &str) -> SignRequest {
        SignRequest {
            display_name: name.to_string(),
            keystore: Some("main".to_string()),
            keyalias: Some("upload".to_string()),
            deploy: BTreeSet::new(),
        }
    }

    fn output(dir: &Path, name: &str) -> PathBuf {
        let rel = PathBuf::from("app/build/outputs/apk/release").join(name);
        std::fs::create_dir_all(dir.join(rel.parent().unwrap())).unwrap();
        std::fs::write(dir.join(&rel), b"apk").unwrap();
        rel
    }

    #[test]
    fn already_signed_artifact_is_released_without_signing() {
        let project = TempDir::new().unwrap();
        let releases = TempDir::new().unwrap();
        let apk = output(project.path(), "signed.apk");
        let signer = FakeSigner {
            signed: BTreeSet::from(["signed.apk"]),
            sign_ok: false,
            signings: RefCell::new(0),
        };
        let registry = KeystoreRegistry::default();
        let engine = SignEngine::new(&signer, &registry, releases.path());

        let outcome = engine.sign(
            project.path(),
            &apk,
            &request("App-release.apk"),
            &mut ProjectLog::disabled(),
        );

        assert!(matches!(outcome, SignOutcome::Unneeded { .. }));
        assert_eq!(*signer.signings.borrow(), 0);
        assert!(releases.path().join("App-release.apk").is_file());
        assert!(!project.path().join(&apk).exists());
    }

    #[test]
    fn failed_signing_keeps_the_artifact_for_retry() {
        let project = TempDir::new().unwrap();
        let releases = TempDir::new().unwrap();
        let good = output(project.path(), "a.apk");
        let registry = unlocked_registry();
        let signer = FakeSigner {
            signed: BTreeSet::new(),
            sign_ok: false,
            signings: RefCell::new(0),
        };
        let engine = SignEngine::new(&signer, &registry, releases.path());

        let mut worklist = BTreeMap::new();
        worklist.insert(good.clone(), request("App-a.apk"));
        let batch = engine.sign_worklist(project.path(), &worklist, &mut ProjectLog::disabled());

        assert!(batch.released.is_empty());
        assert_eq!(batch.pending.len(), 1);
        assert!(project.path().join(&good).is_file());
        assert!(!releases.path().join("App-a.apk").exists());
    }

    #[test]
    fn batch_continues_past_failures() {
        let project = TempDir::new().unwrap();
        let releases = TempDir::new().unwrap();
        let signed = output(project.path(), "a.apk");
        let unsigned = output(project.path(), "b.apk");
        let registry = KeystoreRegistry::default();
        let signer = FakeSigner {
            signed: BTreeSet::from(["a.apk"]),
            sign_ok: true,
            signings: RefCell::new(0),
        };
        let engine = SignEngine::new(&signer, &registry, releases.path());

        let mut worklist = BTreeMap::new();
        worklist.insert(unsigned.clone(), request("App-b.apk"));
        worklist.insert(signed, request("App-a.apk"));
        worklist.insert(PathBuf::from("gone.apk"), request("App-gone.apk"));
        let batch = engine.sign_worklist(project.path(), &worklist, &mut ProjectLog::disabled());

        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.released.len(), 1);
        assert_eq!(batch.pending.keys().collect::<Vec<_>>(), vec![&unsigned]);
    }

    #[test]
    fn unsigned_artifact_is_signed_into_release_dir() {
        let project = TempDir::new().unwrap();
        let releases = TempDir::new().unwrap();
        let apk = output(project.path(), "app-release-unsigned.apk");
        let registry = unlocked_registry();
        let signer = FakeSigner {
            signed: BTreeSet::new(),
            sign_ok: true,
            signings: RefCell::new(0),
        };
        let engine = SignEngine::new(&signer, &registry, releases.path());

        let outcome = engine.sign(
            project.path(),
            &apk,
            &request("App-release.apk"),
            &mut ProjectLog::disabled(),
        );

        assert_eq!(
            outcome,
            SignOutcome::Signed {
                released_as: releases.path().join("App-release.apk")
            }
        );
        assert!(!project.path().join(&apk).exists());
    }
}
