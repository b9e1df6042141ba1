//! Git fixture for end-to-end syncer tests.
//!
//! Every `{org}/{repo}` lives as a bare repository under `remotes/`, seeded
//! from a private working copy that tests can keep committing to.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use hydros::config::{EngineConfig, GitConfig};

pub struct GitFixture {
    temp_dir: TempDir,
    /// Root of the bare remotes.
    pub remotes: PathBuf,
    /// Engine work directory.
    pub work_dir: PathBuf,
    seeds: PathBuf,
}

impl GitFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();
        let remotes = base.join("remotes");
        let work_dir = base.join("work");
        let seeds = base.join("seeds");
        for dir in [&remotes, &work_dir, &seeds] {
            fs::create_dir_all(dir).expect("Failed to create fixture directory");
        }
        Self {
            temp_dir,
            remotes,
            work_dir,
            seeds,
        }
    }

    pub fn url_template(&self) -> String {
        format!("{}/{{org}}/{{repo}}.git", self.remotes.display())
    }

    pub fn bare_path(&self, org: &str, repo: &str) -> PathBuf {
        self.remotes.join(org).join(format!("{}.git", repo))
    }

    /// An engine configuration pointed at this fixture's remotes.
    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            work_dir: self.work_dir.clone(),
            workers: 1,
            merge_timeout_secs: 1,
            existing_pr_timeout_secs: 1,
            git: GitConfig {
                url_template: self.url_template(),
                timeout_secs: 30,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Creates `org/repo` with `files` committed on `branch`. Returns the commit.
    pub fn create_repo(&self, org: &str, repo: &str, branch: &str, files: &[(&str, &str)]) -> String {
        let bare = self.bare_path(org, repo);
        fs::create_dir_all(&bare).expect("Failed to create bare repo dir");
        git(&bare, &["init", "--bare", "--quiet"]);

        let seed = self.seed_path(org, repo);
        fs::create_dir_all(&seed).expect("Failed to create seed dir");
        git(&seed, &["init", "--quiet"]);
        self.commit_files(org, repo, branch, files)
    }

    /// Commits `files` on top of the seed working copy and pushes to `branch`.
    pub fn commit_files(&self, org: &str, repo: &str, branch: &str, files: &[(&str, &str)]) -> String {
        let seed = self.seed_path(org, repo);
        for (path, content) in files {
            let path = seed.join(path);
            fs::create_dir_all(path.parent().expect("file has a parent"))
                .expect("Failed to create parent dir");
            fs::write(path, content).expect("Failed to write seed file");
        }
        git(&seed, &["add", "--all"]);
        git(&seed, &["commit", "--quiet", "--allow-empty", "-m", "seed"]);
        let bare = self.bare_path(org, repo);
        let bare = bare.to_string_lossy();
        git(&seed, &["push", "--quiet", "--force", &bare, &format!("HEAD:refs/heads/{}", branch)]);
        git(&seed, &["rev-parse", "HEAD"]).trim().to_string()
    }

    /// The commit `branch` points at in the remote, if it exists.
    pub fn branch_commit(&self, org: &str, repo: &str, branch: &str) -> Option<String> {
        let output = Command::new("git")
            .current_dir(self.bare_path(org, repo))
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .output()
            .expect("Failed to run git");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Content of `path` on `branch` of the remote.
    pub fn read_file(&self, org: &str, repo: &str, branch: &str, path: &str) -> Option<String> {
        let output = Command::new("git")
            .current_dir(self.bare_path(org, repo))
            .args(["show", &format!("{}:{}", branch, path)])
            .output()
            .expect("Failed to run git");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn seed_path(&self, org: &str, repo: &str) -> PathBuf {
        self.seeds.join(format!("{}-{}", org, repo))
    }
}

/// Runs git in `dir` with a fixed identity and panics on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args(["-c", "user.name=fixture", "-c", "user.email=fixture@localhost"])
        .args(args)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed in {}: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}
