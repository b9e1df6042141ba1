//! Working copies driven through the `git` binary.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use super::auth::build_auth_env;
use super::parse::{changed_paths, format_git_error, is_missing_ref};
use crate::config::GitConfig;
use crate::error::{classify_git_error, HydrosError, Result};
use crate::process::{run_with_timeout, CommandOutput};
use crate::resource::GitHubRepo;

/// Expands `{org}` and `{repo}` in a clone URL template.
pub fn remote_url(template: &str, repo: &GitHubRepo) -> String {
    template
        .replace("{org}", &repo.org)
        .replace("{repo}", &repo.repo)
}

/// One local checkout. Every command runs with the configured timeout.
#[derive(Debug, Clone)]
pub struct GitRepository {
    path: PathBuf,
    config: GitConfig,
}

impl GitRepository {
    pub fn new(path: impl Into<PathBuf>, config: &GitConfig) -> Self {
        Self {
            path: path.into(),
            config: config.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_git_repo(&self) -> bool {
        self.path.join(".git").exists()
    }

    pub fn has_commits(&self) -> bool {
        self.is_git_repo()
            && self
                .run_git(&["rev-parse", "--verify", "--quiet", "HEAD"])
                .map(|output| output.success())
                .unwrap_or(false)
    }

    /// Creates the working copy on first use and points `origin` at `url`.
    pub fn ensure_initialized(&self, url: &str) -> Result<()> {
        if !self.is_git_repo() {
            std::fs::create_dir_all(&self.path).map_err(|e| HydrosError::WriteFile {
                path: self.path.clone(),
                source: e,
            })?;
            self.git(&["init", "--quiet"])?;
            log::debug!("Initialized working copy at {}", self.path.display());
        }
        self.set_remote("origin", url)
    }

    pub fn set_remote(&self, name: &str, url: &str) -> Result<()> {
        let exists = self
            .run_git(&["remote", "get-url", name])
            .map(|output| output.success())
            .unwrap_or(false);

        if exists {
            self.git(&["remote", "set-url", name, url])?;
        } else {
            self.git(&["remote", "add", name, url])?;
        }
        Ok(())
    }

    /// Fetches one branch. Returns false when the remote has no such branch.
    pub fn fetch(&self, remote: &str, branch: &str) -> Result<bool> {
        self.require_repo()?;
        let refspec = format!("+refs/heads/{0}:refs/remotes/{1}/{0}", branch, remote);
        let output = self.run_git(&["fetch", "--quiet", remote, &refspec])?;
        if output.success() {
            Ok(true)
        } else if is_missing_ref(&output.stderr) {
            Ok(false)
        } else {
            Err(classify_git_error(&format_git_error(&output)))
        }
    }

    /// Throws away anything a previous interrupted run left behind.
    pub fn discard_local_changes(&self) -> Result<()> {
        self.require_repo()?;
        if !self.has_commits() {
            self.git(&["clean", "-fdx", "--quiet"])?;
            return Ok(());
        }

        self.git(&["stash", "push", "--include-untracked", "--quiet"])?;
        let stashed = self
            .run_git(&["rev-parse", "--verify", "--quiet", "refs/stash"])
            .map(|output| output.success())
            .unwrap_or(false);
        if stashed {
            self.git(&["stash", "drop", "--quiet"])?;
        }
        self.git(&["reset", "--hard", "--quiet"])?;
        self.git(&["clean", "-fdx", "--quiet"])?;
        Ok(())
    }

    /// Points `local` at `remote/branch` and checks it out, discarding local state.
    pub fn checkout_remote_branch(&self, remote: &str, branch: &str, local: &str) -> Result<()> {
        self.require_repo()?;
        let remote_ref = format!("{}/{}", remote, branch);
        self.git(&["checkout", "--quiet", "--force", "-B", local, &remote_ref])?;
        Ok(())
    }

    /// Fetch, reset and check out `branch` from `origin`.
    pub fn sync_branch(&self, branch: &str) -> Result<()> {
        if !self.fetch("origin", branch)? {
            return Err(HydrosError::GitOperation(format!(
                "branch '{}' not found on origin of {}",
                branch,
                self.path.display()
            )));
        }
        self.discard_local_changes()?;
        self.checkout_remote_branch("origin", branch, branch)
    }

    pub fn head_commit(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Working-tree paths that differ from HEAD, including untracked files.
    pub fn changed_files(&self) -> Result<Vec<String>> {
        let porcelain = self.git(&["status", "--porcelain", "--untracked-files=all"])?;
        Ok(changed_paths(&porcelain))
    }

    pub fn has_changes(&self) -> Result<bool> {
        Ok(!self.changed_files()?.is_empty())
    }

    /// Stages everything and commits. Returns `None` when there was nothing to commit.
    pub fn commit_all(&self, message: &str) -> Result<Option<String>> {
        self.require_repo()?;
        self.git(&["add", "--all"])?;

        let staged = self.run_git(&["diff", "--cached", "--quiet"])?;
        if staged.success() {
            return Ok(None);
        }

        self.git(&["commit", "--quiet", "-m", message])?;

        let hash = self.head_commit()?;
        log::info!("Committed {} in {}", &hash[..hash.len().min(12)], self.path.display());
        Ok(Some(hash))
    }

    pub fn push_force(&self, remote: &str, local: &str, branch: &str) -> Result<()> {
        let refspec = format!("{}:refs/heads/{}", local, branch);
        self.git(&["push", "--quiet", "--force", remote, &refspec])?;
        Ok(())
    }

    fn require_repo(&self) -> Result<()> {
        if self.is_git_repo() {
            Ok(())
        } else {
            Err(HydrosError::GitNotInitialized(self.path.clone()))
        }
    }

    /// Runs git and returns stdout, mapping failures onto git error variants.
    fn git(&self, args: &[&str]) -> Result<String> {
        let output = self.run_git(args)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify_git_error(&format_git_error(&output)))
        }
    }

    fn run_git(&self, args: &[&str]) -> Result<CommandOutput> {
        let auth = build_auth_env(&self.config.auth)?;
        let mut cmd = Command::new("git");
        // Commits and stashes need an identity even where no global config exists.
        cmd.current_dir(&self.path)
            .arg("-c")
            .arg(format!("user.name={}", self.config.user_name))
            .arg("-c")
            .arg(format!("user.email={}", self.config.user_email))
            .args(args)
            .envs(auth.env_vars.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match run_with_timeout(&cmd, None, timeout) {
            Ok(output) => Ok(output),
            Err(HydrosError::ProcessTimeout { secs, .. }) => Err(HydrosError::GitTimeout(secs)),
            Err(HydrosError::BuildTool { message, .. }) => Err(HydrosError::GitOperation(message)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn bare_remote(root: &Path, name: &str) -> String {
        let path = root.join(format!("{}.git", name));
        let status = Command::new("git")
            .args(["init", "--bare", "--quiet"])
            .arg(&path)
            .status()
            .unwrap();
        assert!(status.success());
        path.to_string_lossy().into_owned()
    }

    fn seeded(root: &Path) -> (GitRepository, String) {
        let url = bare_remote(root, "remote");
        let repo = GitRepository::new(root.join("seed"), &GitConfig::default());
        repo.ensure_initialized(&url).unwrap();
        fs::write(repo.path().join("a.yaml"), "a: 1\n").unwrap();
        repo.commit_all("seed").unwrap().unwrap();
        repo.push_force("origin", "HEAD", "main").unwrap();
        (repo, url)
    }

    #[test]
    fn test_remote_url_template() {
        let repo = GitHubRepo::new("acme", "manifests", "main");
        assert_eq!(
            remote_url("https://github.com/{org}/{repo}.git", &repo),
            "https://github.com/acme/manifests.git"
        );
    }

    #[test]
    fn test_not_initialized() {
        let dir = TempDir::new().unwrap();
        let repo = GitRepository::new(dir.path(), &GitConfig::default());
        assert!(!repo.is_git_repo());
        assert!(matches!(
            repo.fetch("origin", "main"),
            Err(HydrosError::GitNotInitialized(_))
        ));
    }

    #[test]
    fn test_commit_nothing_returns_none() {
        let dir = TempDir::new().unwrap();
        let (repo, _) = seeded(dir.path());
        assert!(!repo.has_changes().unwrap());
        assert_eq!(repo.commit_all("empty").unwrap(), None);
    }

    #[test]
    fn test_sync_branch_discards_local_changes() {
        let dir = TempDir::new().unwrap();
        let (seed, url) = seeded(dir.path());
        let head = seed.head_commit().unwrap();

        let clone = GitRepository::new(dir.path().join("clone"), &GitConfig::default());
        clone.ensure_initialized(&url).unwrap();
        clone.sync_branch("main").unwrap();
        assert_eq!(clone.head_commit().unwrap(), head);

        fs::write(clone.path().join("a.yaml"), "a: 2\n").unwrap();
        fs::write(clone.path().join("junk.yaml"), "junk\n").unwrap();
        assert_eq!(clone.changed_files().unwrap().len(), 2);

        clone.sync_branch("main").unwrap();
        assert!(!clone.has_changes().unwrap());
        assert_eq!(
            fs::read_to_string(clone.path().join("a.yaml")).unwrap(),
            "a: 1\n"
        );
    }

    #[test]
    fn test_fetch_missing_branch() {
        let dir = TempDir::new().unwrap();
        let (seed, _) = seeded(dir.path());
        assert!(!seed.fetch("origin", "does-not-exist").unwrap());
        assert!(seed.fetch("origin", "main").unwrap());
    }

    #[test]
    fn test_force_push_new_branch() {
        let dir = TempDir::new().unwrap();
        let (seed, url) = seeded(dir.path());

        assert!(seed.fetch("origin", "main").unwrap());
        seed.checkout_remote_branch("origin", "main", "hydros/dev").unwrap();
        fs::write(seed.path().join("b.yaml"), "b: 1\n").unwrap();
        let hash = seed.commit_all("add b").unwrap().unwrap();
        seed.push_force("origin", "hydros/dev", "hydros/dev").unwrap();

        let other = GitRepository::new(dir.path().join("other"), &GitConfig::default());
        other.ensure_initialized(&url).unwrap();
        other.sync_branch("hydros/dev").unwrap();
        assert_eq!(other.head_commit().unwrap(), hash);
    }
}
