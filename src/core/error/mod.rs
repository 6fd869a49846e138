use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingKey,
    ConfigInvalidToml,
    ConfigInvalidJson,
    ConfigKeystoreBinding,
    ConfigKeystoreNotFound,

    ValidationInvalidArgument,
    ValidationMultipleErrors,

    KeystoreAuthFailed,
    RetryStateMissing,
    DependencyMissing,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingKey => "config.missing_key",
            ErrorCode::ConfigInvalidToml => "config.invalid_toml",
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigKeystoreBinding => "config.keystore_binding",
            ErrorCode::ConfigKeystoreNotFound => "config.keystore_not_found",

            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",
            ErrorCode::ValidationMultipleErrors => "validation.multiple_errors",

            ErrorCode::KeystoreAuthFailed => "keystore.auth_failed",
            ErrorCode::RetryStateMissing => "retry.state_missing",
            ErrorCode::DependencyMissing => "dependency.missing",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMissingKeyDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigParseDetails {
    pub path: String,
    pub error: String,
}

/// Identifies the (project, task) pair a configuration problem belongs to.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystoreBindingDetails {
    pub project: String,
    pub task: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keystore: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyalias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystoreAuthDetails {
    pub keystore: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyMissingDetails {
    pub tools: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalJsonErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
        }
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.into(),
            id,
            tried,
        });

        Self::new(
            ErrorCode::ValidationInvalidArgument,
            "Invalid argument",
            details,
        )
    }

    /// Bundle several errors into one so they can be reported together.
    pub fn validation_multiple_errors(errors: Vec<Error>) -> Self {
        let count = errors.len();
        let items: Vec<Value> = errors
            .iter()
            .map(|e| {
                serde_json::json!({
                    "code": e.code.as_str(),
                    "message": e.message,
                    "details": e.details,
                })
            })
            .collect();

        Self::new(
            ErrorCode::ValidationMultipleErrors,
            format!("{} configuration problem(s) found", count),
            serde_json::json!({ "errors": items }),
        )
        .with_hint("Review droidship.toml and fix every listed problem before running again")
    }

    pub fn config_missing_key(key: impl Into<String>, path: Option<String>) -> Self {
        let details = to_details(ConfigMissingKeyDetails {
            key: key.into(),
            path,
        });

        Self::new(
            ErrorCode::ConfigMissingKey,
            "Missing required configuration key",
            details,
        )
    }

    pub fn config_invalid_toml(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        let details = to_details(ConfigParseDetails {
            path: path.into(),
            error: err.to_string(),
        });

        Self::new(
            ErrorCode::ConfigInvalidToml,
            "Invalid TOML in configuration",
            details,
        )
    }

    pub fn config_invalid_json(path: impl Into<String>, err: serde_json::Error) -> Self {
        let details = to_details(ConfigParseDetails {
            path: path.into(),
            error: err.to_string(),
        });

        Self::new(
            ErrorCode::ConfigInvalidJson,
            "Invalid JSON in retry state",
            details,
        )
    }

    pub fn config_keystore_binding(details: KeystoreBindingDetails) -> Self {
        let message = format!(
            "{}: {}: {}",
            details.project, details.task, details.problem
        );
        Self::new(
            ErrorCode::ConfigKeystoreBinding,
            message,
            to_details(details),
        )
    }

    pub fn config_keystore_not_found(details: KeystoreBindingDetails) -> Self {
        let message = format!(
            "{}: {}: {}",
            details.project, details.task, details.problem
        );
        Self::new(
            ErrorCode::ConfigKeystoreNotFound,
            message,
            to_details(details),
        )
    }

    pub fn keystore_auth_failed(
        keystore: impl Into<String>,
        path: impl Into<String>,
        alias: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        let details = to_details(KeystoreAuthDetails {
            keystore: keystore.into(),
            path: path.into(),
            alias,
        });

        Self::new(ErrorCode::KeystoreAuthFailed, message, details)
    }

    pub fn retry_state_missing(path: impl Into<String>, reason: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            ErrorCode::RetryStateMissing,
            format!("Failed to load retry state from {}", path),
            serde_json::json!({ "path": path, "error": reason.into() }),
        )
        .with_hint("Run without --retry first; the retry state is written at the end of every run")
    }

    pub fn dependency_missing(tools: Vec<String>) -> Self {
        let message = format!("Required tool(s) not found in PATH: {}", tools.join(", "));
        Self::new(
            ErrorCode::DependencyMissing,
            message,
            to_details(DependencyMissingDetails { tools }),
        )
        .with_hint("Install the Android SDK build-tools/platform-tools and a JDK, then retry")
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalIoErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalIoError, "IO error", details)
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalJsonErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalJsonError, "JSON error", details)
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_errors_keeps_every_entry() {
        let err = Error::validation_multiple_errors(vec![
            Error::config_keystore_binding(KeystoreBindingDetails {
                project: "Notes".to_string(),
                task: "release".to_string(),
                problem: "build enabled but keystore/keyalias are undefined".to_string(),
                keystore: None,
                keyalias: None,
                path: None,
            }),
            Error::config_missing_key("path", Some("keystores.main".to_string())),
        ]);

        assert_eq!(err.code, ErrorCode::ValidationMultipleErrors);
        let entries = err.details["errors"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["code"], "config.keystore_binding");
        assert!(entries[0]["message"]
            .as_str()
            .unwrap()
            .starts_with("Notes: release:"));
    }

    #[test]
    fn dependency_missing_lists_tools() {
        let err = Error::dependency_missing(vec!["adb".to_string(), "keytool".to_string()]);
        assert!(err.message.contains("adb, keytool"));
        assert_eq!(err.details["tools"][1], "keytool");
        assert_eq!(err.hints.len(), 1);
    }
}
