//! Workdir authorization and the per-workdir git session cache.
//!
//! A path may be used for git operations when it was explicitly registered (opened as a
//! workspace or worktree) or when it passes the fallback proof: it exists, is a
//! directory, and carries a `.git` marker. Registration state and the session cache
//! share one lock so that unregistering a key and dropping its session is atomic.

use crate::errors::{ArborError, NotAuthorizedReason, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Canonicalized absolute path identifying a workdir.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct WorkdirKey(PathBuf);

impl WorkdirKey {
    pub fn resolve(path: &Path) -> Result<Self> {
        if path.as_os_str().is_empty() {
            return Err(ArborError::invalid_input("path", "path must not be empty"));
        }

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| ArborError::io("current_dir", path.display(), e))?
                .join(path)
        };

        let resolved = match std::fs::canonicalize(&absolute) {
            Ok(canonical) => canonical,
            Err(_) => normalize_lexically(&absolute),
        };
        Ok(Self(resolved))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for WorkdirKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// A validated workdir reused across git operations. Holds no OS resources.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSession {
    pub key: WorkdirKey,
    pub created: DateTime<Utc>,
}

impl GitSession {
    fn new(key: WorkdirKey) -> Self {
        Self {
            key,
            created: Utc::now(),
        }
    }

    pub fn path(&self) -> &Path {
        self.key.as_path()
    }
}

#[derive(Default)]
struct GateState {
    authorized: HashSet<WorkdirKey>,
    sessions: HashMap<WorkdirKey, Arc<GitSession>>,
}

#[derive(Default)]
pub struct AuthorizationGate {
    state: Mutex<GateState>,
}

impl AuthorizationGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `path` as in use. Registering twice is a no-op.
    pub fn register(&self, path: &Path) -> Result<WorkdirKey> {
        let key = WorkdirKey::resolve(path)?;
        if self.lock().authorized.insert(key.clone()) {
            log::info!("Registered workdir {key}");
        }
        Ok(key)
    }

    /// Removes `path` from the registration set and drops its cached session.
    /// Unregistering an unknown path is a no-op.
    pub fn unregister(&self, path: &Path) -> Result<WorkdirKey> {
        let key = WorkdirKey::resolve(path)?;
        let mut state = self.lock();
        let was_registered = state.authorized.remove(&key);
        let had_session = state.sessions.remove(&key).is_some();
        drop(state);
        if was_registered || had_session {
            log::info!("Unregistered workdir {key} (cached session dropped: {had_session})");
        }
        Ok(key)
    }

    pub fn is_registered(&self, path: &Path) -> bool {
        WorkdirKey::resolve(path)
            .map(|key| self.lock().authorized.contains(&key))
            .unwrap_or(false)
    }

    pub fn registered(&self) -> Vec<WorkdirKey> {
        let mut keys: Vec<_> = self.lock().authorized.iter().cloned().collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        keys
    }

    /// Checks whether `path` may be operated on as a git workdir.
    pub fn authorize(&self, path: &Path) -> Result<WorkdirKey> {
        let key = WorkdirKey::resolve(path)?;
        if self.lock().authorized.contains(&key) {
            return Ok(key);
        }
        prove_repository(&key)?;
        Ok(key)
    }

    /// Returns the cached session for `path`, authorizing and creating it on first use.
    pub fn session(&self, path: &Path) -> Result<Arc<GitSession>> {
        let key = WorkdirKey::resolve(path)?;
        if let Some(existing) = self.lock().sessions.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let key = self.authorize(key.as_path())?;
        let mut state = self.lock();
        let session = state
            .sessions
            .entry(key.clone())
            .or_insert_with(|| {
                log::debug!("Created git session for {key}");
                Arc::new(GitSession::new(key.clone()))
            });
        Ok(Arc::clone(session))
    }

    /// Drops any cached session for `key`; the next operation re-validates.
    pub fn invalidate(&self, key: &WorkdirKey) {
        if self.lock().sessions.remove(key).is_some() {
            log::debug!("Invalidated git session for {key}");
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

fn prove_repository(key: &WorkdirKey) -> Result<()> {
    let denied = |reason| {
        Err(ArborError::NotAuthorized {
            path: key.to_string(),
            reason,
        })
    };

    let metadata = match std::fs::metadata(key.as_path()) {
        Ok(metadata) => metadata,
        Err(_) => return denied(NotAuthorizedReason::NotFound),
    };
    if !metadata.is_dir() {
        return denied(NotAuthorizedReason::NotADirectory);
    }
    if std::fs::symlink_metadata(key.as_path().join(".git")).is_err() {
        return denied(NotAuthorizedReason::NotARepository);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn reason_of(err: ArborError) -> NotAuthorizedReason {
        match err {
            ArborError::NotAuthorized { reason, .. } => reason,
            other => panic!("expected NotAuthorized, got {other:?}"),
        }
    }

    #[test]
    fn fallback_proof_reports_specific_reasons() {
        let gate = AuthorizationGate::new();
        let tmp = TempDir::new().unwrap();

        let missing = tmp.path().join("missing");
        assert_eq!(
            reason_of(gate.authorize(&missing).unwrap_err()),
            NotAuthorizedReason::NotFound
        );

        let file = tmp.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        assert_eq!(
            reason_of(gate.authorize(&file).unwrap_err()),
            NotAuthorizedReason::NotADirectory
        );

        assert_eq!(
            reason_of(gate.authorize(tmp.path()).unwrap_err()),
            NotAuthorizedReason::NotARepository
        );

        std::fs::create_dir(tmp.path().join(".git")).unwrap();
        assert!(gate.authorize(tmp.path()).is_ok());
    }

    #[test]
    fn git_file_marker_counts_as_repository() {
        let gate = AuthorizationGate::new();
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(".git"), "gitdir: /elsewhere").unwrap();
        assert!(gate.authorize(tmp.path()).is_ok());
    }

    #[test]
    fn registered_paths_skip_the_marker_check() {
        let gate = AuthorizationGate::new();
        let tmp = TempDir::new().unwrap();

        gate.register(tmp.path()).unwrap();
        gate.register(tmp.path()).unwrap();
        assert!(gate.authorize(tmp.path()).is_ok());
        assert_eq!(gate.registered().len(), 1);

        gate.unregister(tmp.path()).unwrap();
        gate.unregister(tmp.path()).unwrap();
        assert!(gate.authorize(tmp.path()).is_err());
    }

    #[test]
    fn equivalent_paths_share_one_session() {
        let gate = AuthorizationGate::new();
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join(".git")).unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();

        let direct = gate.session(tmp.path()).unwrap();
        let dotted = gate.session(&tmp.path().join("sub/..")).unwrap();
        assert!(Arc::ptr_eq(&direct, &dotted));
        assert_eq!(gate.session_count(), 1);
    }

    #[test]
    fn unregister_drops_cached_session() {
        let gate = AuthorizationGate::new();
        let tmp = TempDir::new().unwrap();

        gate.register(tmp.path()).unwrap();
        let first = gate.session(tmp.path()).unwrap();
        gate.unregister(tmp.path()).unwrap();
        assert_eq!(gate.session_count(), 0);

        gate.register(tmp.path()).unwrap();
        let second = gate.session(tmp.path()).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn invalidate_forces_revalidation() {
        let gate = AuthorizationGate::new();
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join(".git")).unwrap();

        let session = gate.session(tmp.path()).unwrap();
        std::fs::remove_dir(tmp.path().join(".git")).unwrap();
        assert!(gate.session(tmp.path()).is_ok());

        gate.invalidate(&session.key);
        assert!(gate.session(tmp.path()).is_err());
    }

    #[test]
    fn lexical_normalization_handles_missing_paths() {
        let key = WorkdirKey::resolve(Path::new("/nonexistent-arbor/a/./b/../c")).unwrap();
        assert_eq!(key.as_path(), Path::new("/nonexistent-arbor/a/c"));
        assert!(WorkdirKey::resolve(Path::new("")).is_err());
    }
}
