//! Declared keystores, their secrets and one-shot verification.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths;
use crate::utils::command;

/// A password. Never serialized, never printed.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyAlias {
    /// Alias inside the keystore; defaults to the alias id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<Secret>,
    #[serde(skip)]
    pub used: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keystore {
    pub path: PathBuf,
    #[serde(default, skip_serializing)]
    pub password: Option<Secret>,
    #[serde(default)]
    pub aliases: BTreeMap<String, KeyAlias>,
    #[serde(skip)]
    pub used: bool,
}

/// Why a (keystore, alias) pair could not be bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    UnknownKeystore,
    UnknownAlias,
    PathMissing(PathBuf),
}

/// Everything the signer needs for one key.
#[derive(Debug, Clone, Copy)]
pub struct SigningKey<'a> {
    pub path: &'a Path,
    pub alias: &'a str,
    pub store_password: &'a Secret,
    pub key_password: &'a Secret,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeystoreRegistry {
    stores: BTreeMap<String, Keystore>,
}

impl KeystoreRegistry {
    pub fn get(&self, id: &str) -> Option<&Keystore> {
        self.stores.get(id)
    }

    pub fn insert(&mut self, id: impl Into<String>, keystore: Keystore) {
        self.stores.insert(id.into(), keystore);
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Register a keystore given only by path, as `--build <path>,<alias>` does.
    /// The keystore id is the path as given.
    pub fn register_path(&mut self, path: &Path, alias: &str) -> String {
        let id = path.display().to_string();
        let store = self.stores.entry(id.clone()).or_insert_with(|| Keystore {
            path: path.to_path_buf(),
            password: None,
            aliases: BTreeMap::new(),
            used: false,
        });
        store.aliases.entry(alias.to_string()).or_default();
        id
    }

    /// Bind a (keystore, alias) pair: the path is made absolute and checked,
    /// and both entries are marked used.
    pub fn bind(
        &mut self,
        keystore: &str,
        alias: &str,
        base: &Path,
    ) -> std::result::Result<PathBuf, BindingError> {
        let store = self
            .stores
            .get_mut(keystore)
            .ok_or(BindingError::UnknownKeystore)?;
        let entry = store
            .aliases
            .get_mut(alias)
            .ok_or(BindingError::UnknownAlias)?;

        let path = paths::expand(&store.path, base);
        if !path.is_file() {
            return Err(BindingError::PathMissing(path));
        }

        entry.used = true;
        store.used = true;
        store.path = path.clone();
        Ok(path)
    }

    pub fn any_used(&self) -> bool {
        self.stores.values().any(|s| s.used)
    }

    /// `keystore/alias` for every pair a run will unlock.
    pub fn used_pairs(&self) -> Vec<String> {
        self.stores
            .iter()
            .filter(|(_, s)| s.used)
            .flat_map(|(id, s)| {
                s.aliases
                    .iter()
                    .filter(|(_, a)| a.used)
                    .map(move |(alias, _)| format!("{}/{}", id, alias))
            })
            .collect()
    }

    /// Key material for a pair, once its passwords are known.
    pub fn signing_key<'a>(&'a self, keystore: &str, alias: &'a str) -> Option<SigningKey<'a>> {
        let store = self.stores.get(keystore)?;
        let entry = store.aliases.get(alias)?;
        Some(SigningKey {
            path: &store.path,
            alias: entry.name.as_deref().unwrap_or(alias),
            store_password: store.password.as_ref()?,
            key_password: entry.password.as_ref()?,
        })
    }

    /// Fill in and verify the passwords of every used keystore and alias.
    ///
    /// Passwords from the config file are used as-is; missing ones are
    /// prompted for. An empty key password means "same as the keystore".
    pub fn unlock(&mut self, prompt: &mut dyn SecretPrompt, tool: &dyn KeyTool) -> Result<()> {
        for (id, store) in self.stores.iter_mut().filter(|(_, s)| s.used) {
            let store_password = match &store.password {
                Some(p) => p.clone(),
                None => prompt.secret(&format!("Password for keystore '{}'", id))?,
            };

            for (alias_id, alias) in store.aliases.iter_mut().filter(|(_, a)| a.used) {
                let name = alias.name.clone().unwrap_or_else(|| alias_id.clone());

                if !tool.alias_exists(&store.path, &name, &store_password) {
                    return Err(Error::keystore_auth_failed(
                        id.clone(),
                        store.path.display().to_string(),
                        Some(name.clone()),
                        format!(
                            "Keystore '{}' rejected its password or has no alias '{}'",
                            id, name
                        ),
                    ));
                }

                let key_password = match &alias.password {
                    Some(p) => p.clone(),
                    None => {
                        let entered = prompt.secret(&format!(
                            "Password for key '{}' (empty: same as keystore)",
                            name
                        ))?;
                        if entered.is_empty() {
                            store_password.clone()
                        } else {
                            entered
                        }
                    }
                };

                if !tool.key_password_valid(&store.path, &name, &store_password, &key_password) {
                    return Err(Error::keystore_auth_failed(
                        id.clone(),
                        store.path.display().to_string(),
                        Some(name.clone()),
                        format!("Wrong password for key '{}' in keystore '{}'", name, id),
                    ));
                }

                alias.password = Some(key_password);
            }

            log_status!("keystore", "Unlocked {}", id);
            store.password = Some(store_password);
        }

        Ok(())
    }
}

/// Source of passwords that are not in the config file.
pub trait SecretPrompt {
    fn secret(&mut self, label: &str) -> Result<Secret>;
}

/// Keystore inspection used to verify passwords before any signing.
pub trait KeyTool {
    fn alias_exists(&self, keystore: &Path, alias: &str, store_password: &Secret) -> bool;

    fn key_password_valid(
        &self,
        keystore: &Path,
        alias: &str,
        store_password: &Secret,
        key_password: &Secret,
    ) -> bool;
}

/// JDK `keytool`.
pub struct Keytool;

const PROBE_STORE_PASSWORD: &str = "droidship-probe";

impl KeyTool for Keytool {
    fn alias_exists(&self, keystore: &Path, alias: &str, store_password: &Secret) -> bool {
        let args = [
            OsStr::new("-list"),
            OsStr::new("-keystore"),
            keystore.as_os_str(),
            OsStr::new("-alias"),
            OsStr::new(alias),
        ];
        let input = format!("{}\n", store_password.expose());
        matches!(
            command::run_status(working_dir(keystore), "keytool", &args, Some(input.as_bytes()), None),
            Ok(0)
        )
    }

    fn key_password_valid(
        &self,
        keystore: &Path,
        alias: &str,
        store_password: &Secret,
        key_password: &Secret,
    ) -> bool {
        // Exporting the key into a scratch store fails unless the key password is right.
        let Ok(scratch) = tempfile::TempDir::new() else {
            return false;
        };
        let dest = scratch.path().join("probe.p12");
        let args = [
            OsStr::new("-importkeystore"),
            OsStr::new("-srckeystore"),
            keystore.as_os_str(),
            OsStr::new("-srcalias"),
            OsStr::new(alias),
            OsStr::new("-destkeystore"),
            dest.as_os_str(),
            OsStr::new("-deststoretype"),
            OsStr::new("pkcs12"),
            OsStr::new("-deststorepass"),
            OsStr::new(PROBE_STORE_PASSWORD),
            OsStr::new("-destkeypass"),
            OsStr::new(PROBE_STORE_PASSWORD),
            OsStr::new("-noprompt"),
        ];
        let input = format!("{}\n{}\n", store_password.expose(), key_password.expose());
        matches!(
            command::run_status(scratch.path(), "keytool", &args, Some(input.as_bytes()), None),
            Ok(0)
        )
    }
}

fn working_dir(keystore: &Path) -> &Path {
    keystore
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::TempDir;

    struct ScriptedPrompt {
        answers: Vec<&'static str>,
        asked: Vec<String>,
    }

    impl SecretPrompt for ScriptedPrompt {
        fn secret(&mut self, label: &str) -> Result<Secret> {
            self.asked.push(label.to_string());
            if self.answers.is_empty() {
                return Err(Error::internal_unexpected("no more answers"));
            }
            Ok(Secret::new(self.answers.remove(0)))
        }
    }

    struct FakeKeyTool {
        store_password: &'static str,
        key_password: &'static str,
        calls: RefCell<usize>,
    }

    impl KeyTool for FakeKeyTool {
        fn alias_exists(&self, _: &Path, _: &str, store_password: &Secret) -> bool {
            *self.calls.borrow_mut() += 1;
            store_password.expose() == self.store_password
        }

        fn key_password_valid(&self, _: &Path, _: &str, _: &Secret, key: &Secret) -> bool {
            *self.calls.borrow_mut() += 1;
            key.expose() == self.key_password
        }
    }

    fn registry(dir: &TempDir) -> KeystoreRegistry {
        std::fs::write(dir.path().join("release.jks"), b"jks").unwrap();
        let mut registry = KeystoreRegistry::default();
        registry.register_path(Path::new("release.jks"), "upload");
        registry.register_path(Path::new("other.jks"), "unused");
        registry
    }

    #[test]
    fn bind_reports_unknown_pairs() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);

        assert_eq!(
            registry.bind("nope", "upload", dir.path()),
            Err(BindingError::UnknownKeystore)
        );
        assert_eq!(
            registry.bind("release.jks", "nope", dir.path()),
            Err(BindingError::UnknownAlias)
        );
        assert!(matches!(
            registry.bind("other.jks", "unused", dir.path()),
            Err(BindingError::PathMissing(_))
        ));
        assert!(!registry.any_used());
    }

    #[test]
    fn unlock_prompts_only_for_used_keystores() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);
        registry.bind("release.jks", "upload", dir.path()).unwrap();

        let mut prompt = ScriptedPrompt {
            answers: vec!["storepw", ""],
            asked: Vec::new(),
        };
        let tool = FakeKeyTool {
            store_password: "storepw",
            key_password: "storepw",
            calls: RefCell::new(0),
        };

        registry.unlock(&mut prompt, &tool).unwrap();

        assert_eq!(prompt.asked.len(), 2);
        let key = registry.signing_key("release.jks", "upload").unwrap();
        assert_eq!(key.store_password.expose(), "storepw");
        assert_eq!(key.key_password.expose(), "storepw");
        assert!(registry.signing_key("other.jks", "unused").is_none());
    }

    #[test]
    fn unnamed_alias_signs_under_its_id_after_unlock() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);
        registry.bind("release.jks", "upload", dir.path()).unwrap();

        let alias = String::from("upload");
        assert!(registry.signing_key("release.jks", &alias).is_none());

        let mut prompt = ScriptedPrompt {
            answers: vec!["storepw", "keypw"],
            asked: Vec::new(),
        };
        let tool = FakeKeyTool {
            store_password: "storepw",
            key_password: "keypw",
            calls: RefCell::new(0),
        };
        registry.unlock(&mut prompt, &tool).unwrap();

        let key = registry.signing_key("release.jks", &alias).unwrap();
        assert_eq!(key.alias, "upload");
        assert_eq!(key.key_password.expose(), "keypw");
        assert!(key.path.is_absolute());
    }

    #[test]
    fn unlock_fails_on_wrong_store_password() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);
        registry.bind("release.jks", "upload", dir.path()).unwrap();

        let mut prompt = ScriptedPrompt {
            answers: vec!["wrong"],
            asked: Vec::new(),
        };
        let tool = FakeKeyTool {
            store_password: "storepw",
            key_password: "keypw",
            calls: RefCell::new(0),
        };

        let err = registry.unlock(&mut prompt, &tool).unwrap_err();
        assert_eq!(err.code.as_str(), "keystore.auth_failed");
    }

    #[test]
    fn configured_passwords_skip_the_prompt() {
        let config = r#"
            path = "release.jks"
            password = "storepw"
            [aliases.upload]
            name = "upload-key"
            password = "keypw"
        "#;
        let store: Keystore = toml::from_str(config).unwrap();
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("release.jks"), b"jks").unwrap();

        let mut registry = KeystoreRegistry::default();
        registry.insert("main", store);
        registry.bind("main", "upload", dir.path()).unwrap();

        let mut prompt = ScriptedPrompt {
            answers: Vec::new(),
            asked: Vec::new(),
        };
        let tool = FakeKeyTool {
            store_password: "storepw",
            key_password: "keypw",
            calls: RefCell::new(0),
        };

        registry.unlock(&mut prompt, &tool).unwrap();
        assert!(prompt.asked.is_empty());
        assert_eq!(registry.signing_key("main", "upload").unwrap().alias, "upload-key");
    }

    #[test]
    fn serialized_registry_has_no_passwords() {
        let mut registry = KeystoreRegistry::default();
        let mut store = Keystore {
            path: PathBuf::from("/keys/release.jks"),
            password: Some(Secret::new("storepw")),
            aliases: BTreeMap::new(),
            used: true,
        };
        store.aliases.insert(
            "upload".to_string(),
            KeyAlias {
                name: None,
                password: Some(Secret::new("keypw")),
                used: true,
            },
        );
        registry.insert("main", store);

        let json = serde_json::to_string(&registry).unwrap();
        assert!(!json.contains("storepw"));
        assert!(!json.contains("keypw"));
        assert!(!json.contains("used"));
        assert!(format!("{:?}", registry).contains("Secret(***)"));
    }
}
