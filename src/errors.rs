use pty_host::PtyHostError;
use serde::Serialize;
use std::fmt;

/// Why a path failed the workdir authorization proof.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NotAuthorizedReason {
    NotFound,
    NotADirectory,
    NotARepository,
}

impl NotAuthorizedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotAuthorizedReason::NotFound => "not-found",
            NotAuthorizedReason::NotADirectory => "not-a-directory",
            NotAuthorizedReason::NotARepository => "not-a-repository",
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ArborError {
    NotAuthorized {
        path: String,
        reason: NotAuthorizedReason,
    },
    NotFound {
        kind: String,
        id: String,
    },
    InvalidState {
        id: String,
        current: String,
        expected: String,
    },
    Timeout {
        command: String,
        timeout_ms: u64,
    },
    SpawnError {
        command: String,
        message: String,
    },
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    ParseError {
        command: String,
        message: String,
        raw: String,
    },
    Io {
        operation: String,
        path: String,
        message: String,
    },
    InvalidInput {
        field: String,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, ArborError>;

impl ArborError {
    pub fn not_found(kind: &str, id: impl ToString) -> Self {
        ArborError::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn invalid_state(id: impl ToString, current: impl ToString, expected: &str) -> Self {
        ArborError::InvalidState {
            id: id.to_string(),
            current: current.to_string(),
            expected: expected.to_string(),
        }
    }

    pub fn spawn(command: impl ToString, error: impl ToString) -> Self {
        ArborError::SpawnError {
            command: command.to_string(),
            message: error.to_string(),
        }
    }

    pub fn parse(command: &str, message: impl ToString, raw: impl ToString) -> Self {
        ArborError::ParseError {
            command: command.to_string(),
            message: message.to_string(),
            raw: raw.to_string(),
        }
    }

    pub fn io(operation: &str, path: impl ToString, error: impl ToString) -> Self {
        ArborError::Io {
            operation: operation.to_string(),
            path: path.to_string(),
            message: error.to_string(),
        }
    }

    pub fn invalid_input(field: &str, message: impl ToString) -> Self {
        ArborError::InvalidInput {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    /// Stable kind string used by transports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ArborError::NotAuthorized { .. } => "NotAuthorized",
            ArborError::NotFound { .. } => "NotFound",
            ArborError::InvalidState { .. } => "InvalidState",
            ArborError::Timeout { .. } => "Timeout",
            ArborError::SpawnError { .. } => "SpawnError",
            ArborError::CommandFailed { .. } => "CommandFailed",
            ArborError::ParseError { .. } => "ParseError",
            ArborError::Io { .. } => "Io",
            ArborError::InvalidInput { .. } => "InvalidInput",
        }
    }

    /// Maps a pty host failure for terminal `id` into the crate taxonomy.
    pub fn from_pty(id: &str, error: PtyHostError) -> Self {
        match error {
            PtyHostError::TerminalNotFound(term_id) => ArborError::not_found("terminal", term_id),
            PtyHostError::TerminalExists(term_id) => {
                ArborError::invalid_state(term_id, "exists", "absent")
            }
            PtyHostError::Spawn(message) => ArborError::spawn("pty", message),
            PtyHostError::IoError(err) => ArborError::io("terminal", id, err),
            PtyHostError::Internal(message) => ArborError::spawn("pty", message),
        }
    }
}

impl fmt::Display for ArborError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotAuthorized { path, reason } => {
                write!(f, "Path '{path}' is not an authorized workdir: {}", reason.as_str())
            }
            Self::NotFound { kind, id } => write!(f, "{kind} '{id}' not found"),
            Self::InvalidState {
                id,
                current,
                expected,
            } => write!(f, "'{id}' is in state '{current}', expected '{expected}'"),
            Self::Timeout {
                command,
                timeout_ms,
            } => write!(f, "Command '{command}' timed out after {timeout_ms}ms"),
            Self::SpawnError { command, message } => {
                write!(f, "Failed to spawn '{command}': {message}")
            }
            Self::CommandFailed {
                command,
                exit_code,
                stderr,
            } => match exit_code {
                Some(code) => write!(f, "Command '{command}' failed with exit code {code}: {stderr}"),
                None => write!(f, "Command '{command}' was terminated by a signal: {stderr}"),
            },
            Self::ParseError {
                command, message, ..
            } => write!(f, "Failed to parse output of '{command}': {message}"),
            Self::Io {
                operation,
                path,
                message,
            } => write!(f, "I/O error during '{operation}' on '{path}': {message}"),
            Self::InvalidInput { field, message } => {
                write!(f, "Invalid input for field '{field}': {message}")
            }
        }
    }
}

impl std::error::Error for ArborError {}

impl From<ArborError> for String {
    fn from(error: ArborError) -> Self {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_and_data_tags() {
        let error = ArborError::NotAuthorized {
            path: "/tmp/nowhere".to_string(),
            reason: NotAuthorizedReason::NotARepository,
        };
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["type"], "NotAuthorized");
        assert_eq!(value["data"]["path"], "/tmp/nowhere");
        assert_eq!(value["data"]["reason"], "not-a-repository");
    }

    #[test]
    fn command_failed_keeps_raw_stderr_in_message() {
        let error = ArborError::CommandFailed {
            command: "git commit".to_string(),
            exit_code: Some(1),
            stderr: "nothing to commit, working tree clean".to_string(),
        };
        let text: String = error.into();
        assert!(text.contains("git commit"));
        assert!(text.contains("nothing to commit"));
    }

    #[test]
    fn pty_errors_map_into_taxonomy() {
        let missing = ArborError::from_pty("t1", PtyHostError::TerminalNotFound("t1".into()));
        assert_eq!(missing.kind(), "NotFound");

        let spawn = ArborError::from_pty("t1", PtyHostError::Spawn("no such file".into()));
        assert_eq!(spawn.kind(), "SpawnError");
    }
}
