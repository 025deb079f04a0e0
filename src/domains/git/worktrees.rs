use super::parse;
use super::service::GitService;
use super::types::{Worktree, WorktreeAddOptions, WorktreeRemoveOptions};
use crate::domains::workdir::WorkdirKey;
use crate::errors::{ArborError, Result};
use std::path::{Path, PathBuf};

fn worktree_target(session_path: &Path, requested: &str) -> Result<PathBuf> {
    if requested.trim().is_empty() {
        return Err(ArborError::invalid_input("path", "worktree path must not be empty"));
    }
    let requested = Path::new(requested);
    Ok(if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        session_path.join(requested)
    })
}

fn same_location(listed: &str, key: &WorkdirKey) -> bool {
    WorkdirKey::resolve(Path::new(listed))
        .map(|listed| &listed == key)
        .unwrap_or(false)
}

impl GitService {
    pub async fn worktree_list(&self, workdir: &Path) -> Result<Vec<Worktree>> {
        let session = self.session(workdir)?;
        let raw = self
            .run_git(
                &session,
                &["worktree", "list", "--porcelain"],
                self.local_timeout(),
            )
            .await?;
        parse::parse_worktrees(&raw)
    }

    /// Adds a worktree and registers its directory so later operations there are
    /// authorized without the `.git` marker check.
    pub async fn worktree_add(&self, workdir: &Path, options: &WorktreeAddOptions) -> Result<Worktree> {
        let session = self.session(workdir)?;
        let target = worktree_target(session.path(), &options.path)?;
        let target_arg = target.to_string_lossy().into_owned();

        let mut args = vec!["worktree", "add"];
        match (&options.new_branch, &options.branch) {
            (Some(new_branch), _) => {
                if new_branch.is_empty() || new_branch.starts_with('-') {
                    return Err(ArborError::invalid_input("newBranch", "invalid branch name"));
                }
                args.extend(["-b", new_branch.as_str(), target_arg.as_str()]);
                if let Some(base) = &options.base {
                    args.push(base.as_str());
                }
            }
            (None, Some(branch)) => {
                if branch.is_empty() || branch.starts_with('-') {
                    return Err(ArborError::invalid_input("branch", "invalid branch name"));
                }
                args.extend([target_arg.as_str(), branch.as_str()]);
            }
            (None, None) => args.push(target_arg.as_str()),
        }
        if options.base.as_deref().is_some_and(|base| base.starts_with('-')) {
            return Err(ArborError::invalid_input("base", "invalid base revision"));
        }

        self.run_git(&session, &args, self.local_timeout()).await?;
        let key = self.gate().register(&target)?;
        log::info!("Created worktree {key} from {}", session.key);

        let listed = self.worktree_list(workdir).await?;
        Ok(listed
            .into_iter()
            .find(|worktree| same_location(&worktree.path, &key))
            .unwrap_or_else(|| Worktree {
                path: key.to_string(),
                branch: options.new_branch.clone().or_else(|| options.branch.clone()),
                ..Worktree::default()
            }))
    }

    pub async fn worktree_remove(&self, workdir: &Path, options: &WorktreeRemoveOptions) -> Result<()> {
        let session = self.session(workdir)?;
        let target = worktree_target(session.path(), &options.path)?;
        let target_arg = target.to_string_lossy().into_owned();

        let mut args = vec!["worktree", "remove"];
        if options.force {
            args.push("--force");
        }
        args.push(target_arg.as_str());
        self.run_git(&session, &args, self.local_timeout()).await?;

        let key = self.gate().unregister(&target)?;
        log::info!("Removed worktree {key}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::runner::mock::MockRunner;
    use crate::domains::git::service::GitTimeouts;
    use crate::domains::workdir::AuthorizationGate;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn add_registers_and_remove_unregisters_the_worktree() {
        let runner = MockRunner::default();
        let gate = Arc::new(AuthorizationGate::new());
        let repo = TempDir::new().unwrap();
        gate.register(repo.path()).unwrap();
        let service = GitService::new(gate.clone(), Arc::new(runner.clone()), GitTimeouts::default());

        let target = repo.path().join("wt-feature");
        runner.push_ok("");
        runner.push_ok(&format!(
            "worktree {}\nHEAD abc\nbranch refs/heads/main\n\nworktree {}\nHEAD def\nbranch refs/heads/feature\n\n",
            repo.path().display(),
            target.display()
        ));

        let created = service
            .worktree_add(
                repo.path(),
                &WorktreeAddOptions {
                    path: "wt-feature".to_string(),
                    new_branch: Some("feature".to_string()),
                    base: Some("main".to_string()),
                    ..WorktreeAddOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(created.branch.as_deref(), Some("feature"));
        assert!(gate.is_registered(&target));

        let add_args = &runner.calls()[0].args;
        assert_eq!(add_args[..4], ["worktree", "add", "-b", "feature"].map(String::from));
        assert_eq!(add_args.last().map(String::as_str), Some("main"));

        runner.push_ok("");
        service
            .worktree_remove(
                repo.path(),
                &WorktreeRemoveOptions {
                    path: target.to_string_lossy().into_owned(),
                    force: true,
                },
            )
            .await
            .unwrap();
        assert!(!gate.is_registered(&target));
        assert!(runner.calls()[2].args.contains(&"--force".to_string()));
    }

    #[tokio::test]
    async fn empty_worktree_path_is_rejected() {
        let gate = Arc::new(AuthorizationGate::new());
        let repo = TempDir::new().unwrap();
        gate.register(repo.path()).unwrap();
        let service = GitService::new(gate, Arc::new(MockRunner::default()), GitTimeouts::default());

        let err = service
            .worktree_add(repo.path(), &WorktreeAddOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
    }
}
