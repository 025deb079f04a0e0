use arbor::infrastructure::config::ArborConfig;
use arbor::SessionRegistry;
use std::path::Path;
use std::process::Command;

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git should be installed");
    assert!(status.success(), "git {args:?} failed");
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "--quiet"]);
    git(dir, &["config", "user.name", "Arbor Test"]);
    git(dir, &["config", "user.email", "arbor@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

#[tokio::test]
async fn unmarked_paths_are_rejected_until_registered() {
    let registry = SessionRegistry::new(ArborConfig::default());
    let dir = tempfile::tempdir().unwrap();

    let err = registry.gate().authorize(dir.path()).unwrap_err();
    assert_eq!(err.kind(), "NotAuthorized");
    assert_eq!(registry.git().status(dir.path()).await.unwrap_err().kind(), "NotAuthorized");

    let missing = dir.path().join("missing");
    assert_eq!(registry.gate().authorize(&missing).unwrap_err().kind(), "NotAuthorized");

    registry.register_workdir(dir.path()).unwrap();
    registry.register_workdir(dir.path()).unwrap();
    assert!(registry.gate().authorize(dir.path()).is_ok());
    assert_eq!(registry.gate().registered().len(), 1);

    registry.unregister_workdir(dir.path()).unwrap();
    registry.unregister_workdir(dir.path()).unwrap();
    assert_eq!(registry.gate().authorize(dir.path()).unwrap_err().kind(), "NotAuthorized");
    registry.shutdown().await;
}

#[tokio::test]
async fn re_registration_sees_fresh_repository_state() {
    let registry = SessionRegistry::new(ArborConfig::default());
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    registry.register_workdir(dir.path()).unwrap();
    let before = registry.git().status(dir.path()).await.unwrap();
    registry.unregister_workdir(dir.path()).unwrap();
    assert_eq!(registry.gate().session_count(), 0);

    git(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/arbor-fresh"]);

    registry.register_workdir(dir.path()).unwrap();
    let after = registry.git().status(dir.path()).await.unwrap();
    assert_ne!(before.branch, after.branch);
    assert_eq!(after.branch.as_deref(), Some("arbor-fresh"));
    registry.shutdown().await;
}

#[tokio::test]
async fn init_drops_the_cached_session() {
    let registry = SessionRegistry::new(ArborConfig::default());
    let dir = tempfile::tempdir().unwrap();
    registry.register_workdir(dir.path()).unwrap();

    registry.git().init(dir.path()).await.unwrap();
    assert!(dir.path().join(".git").exists());
    assert_eq!(registry.gate().session_count(), 0);

    registry.unregister_workdir(dir.path()).unwrap();
    assert!(registry.git().status(dir.path()).await.is_ok());
    registry.shutdown().await;
}

#[tokio::test]
async fn stage_then_commit_leaves_a_clean_status() {
    let registry = SessionRegistry::new(ArborConfig::default());
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let file = dir.path().join("notes.txt");
    std::fs::write(&file, "first\n").unwrap();
    let files = vec!["notes.txt".to_string()];

    let git = registry.git();
    git.stage(dir.path(), &files).await.unwrap();
    git.commit(dir.path(), "Add notes", &[]).await.unwrap();

    std::fs::write(&file, "first\nsecond\n").unwrap();
    let dirty = git.status(dir.path()).await.unwrap();
    assert_eq!(dirty.entries.len(), 1);
    let stats = git.diff_stats(dir.path()).await.unwrap();
    assert_eq!(stats.insertions, 1);

    git.stage(dir.path(), &files).await.unwrap();
    let hash = git.commit(dir.path(), "Extend notes", &files).await.unwrap();
    assert_eq!(hash.len(), 40);

    let clean = git.status(dir.path()).await.unwrap();
    assert!(clean.entries.iter().all(|entry| entry.path != "notes.txt"));

    let log = git.log(dir.path(), Some(10), None).await.unwrap();
    let subjects: Vec<_> = log.iter().map(|entry| entry.subject.as_str()).collect();
    assert_eq!(subjects, ["Extend notes", "Add notes"]);
    registry.shutdown().await;
}

#[tokio::test]
async fn failed_commands_keep_git_diagnostics() {
    let registry = SessionRegistry::new(ArborConfig::default());
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());

    let err = registry
        .git()
        .checkout(dir.path(), "no-such-branch")
        .await
        .unwrap_err();
    match err {
        arbor::ArborError::CommandFailed { stderr, .. } => assert!(!stderr.is_empty()),
        other => panic!("expected CommandFailed, got {other:?}"),
    }
    registry.shutdown().await;
}

#[tokio::test]
async fn worktrees_are_authorized_while_they_exist() {
    use arbor::domains::git::{WorktreeAddOptions, WorktreeRemoveOptions};

    let registry = SessionRegistry::new(ArborConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir(&repo).unwrap();
    init_repo(&repo);
    std::fs::write(repo.join("README"), "hi\n").unwrap();
    git(&repo, &["add", "README"]);
    git(&repo, &["commit", "--quiet", "-m", "init"]);

    let tree = dir.path().join("feature");
    let added = registry
        .git()
        .worktree_add(
            &repo,
            &WorktreeAddOptions {
                path: tree.to_string_lossy().into_owned(),
                new_branch: Some("feature".to_string()),
                ..WorktreeAddOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(added.branch.as_deref(), Some("feature"));
    assert!(registry.gate().is_registered(&tree));
    assert_eq!(registry.git().worktree_list(&repo).await.unwrap().len(), 2);

    registry
        .git()
        .worktree_remove(
            &repo,
            &WorktreeRemoveOptions {
                path: tree.to_string_lossy().into_owned(),
                force: false,
            },
        )
        .await
        .unwrap();
    assert!(!tree.exists());
    assert_eq!(registry.git().worktree_list(&repo).await.unwrap().len(), 1);
    registry.shutdown().await;
}

#[tokio::test]
async fn merge_conflicts_show_up_in_diffs() {
    let registry = SessionRegistry::new(ArborConfig::default());
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    git(dir.path(), &["config", "diff.noprefix", "true"]);
    let file = dir.path().join("notes.txt");
    std::fs::write(&file, "base\n").unwrap();
    git(dir.path(), &["add", "notes.txt"]);
    git(dir.path(), &["commit", "--quiet", "-m", "base"]);

    git(dir.path(), &["checkout", "--quiet", "-b", "feature"]);
    std::fs::write(&file, "theirs\n").unwrap();
    git(dir.path(), &["commit", "--quiet", "-am", "theirs"]);
    git(dir.path(), &["checkout", "--quiet", "-"]);
    std::fs::write(&file, "ours\n").unwrap();
    git(dir.path(), &["commit", "--quiet", "-am", "ours"]);

    let merged = Command::new("git")
        .args(["merge", "--quiet", "feature"])
        .current_dir(dir.path())
        .output()
        .unwrap();
    assert!(!merged.status.success(), "merge should conflict");

    registry.register_workdir(dir.path()).unwrap();
    let git = registry.git();

    let status = git.status(dir.path()).await.unwrap();
    assert_eq!(status.entries.len(), 1);
    assert_eq!(
        status.entries[0].unstaged,
        Some(arbor::domains::git::ChangeKind::Unmerged)
    );

    let files = git.diff(dir.path(), false).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, "notes.txt");
    assert!(files[0].is_conflicted);
    let lines: Vec<_> = files[0].hunks[0]
        .lines
        .iter()
        .map(|line| line.content.as_str())
        .collect();
    assert!(lines.contains(&"ours"));
    assert!(lines.contains(&"theirs"));

    let single = git.file_diff(dir.path(), "notes.txt", false).await.unwrap();
    assert!(single.is_conflicted);
    assert_eq!(single.path, "notes.txt");
    registry.shutdown().await;
}
