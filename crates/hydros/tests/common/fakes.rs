//! In-process stand-ins for the registry, kustomize and the hosting platform.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_yaml::Value;

use hydros::error::{HydrosError, Result};
use hydros::github::{
    CheckConclusion, CheckRun, MergeState, NewPullRequest, PullRequest, PullRequestService,
};
use hydros::image::{DockerImageRef, Resolver, ResolverSet, Strategy};
use hydros::kustomize::Hydrator;
use hydros::resource::GitHubRepo;
use hydros::sync::Collaborators;

use super::harness::git;

/// Resolves every reference to the same digest.
pub struct FixedDigest(pub String);

impl Resolver for FixedDigest {
    fn resolve(&self, image: &DockerImageRef, _strategy: Strategy) -> Result<DockerImageRef> {
        Ok(image.with_sha(self.0.clone()))
    }
}

/// Renders an overlay into one Deployment using the overlay's first image entry.
pub struct DeploymentHydrator;

impl Hydrator for DeploymentHydrator {
    fn build(&self, overlay_dir: &Path, output_dir: &Path) -> Result<()> {
        let content = fs::read_to_string(overlay_dir.join("kustomization.yaml"))?;
        let document: Value = serde_yaml::from_str(&content)?;
        let name = overlay_dir
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let image = document
            .get("images")
            .and_then(Value::as_sequence)
            .and_then(|images| images.first())
            .map(|entry| {
                let field = |key: &str| entry.get(key).and_then(Value::as_str).unwrap_or_default();
                let mut image = format!("{}:{}", field("newName"), field("newTag"));
                if !field("digest").is_empty() {
                    image.push('@');
                    image.push_str(field("digest"));
                }
                image
            })
            .unwrap_or_else(|| "none".to_string());

        fs::write(
            output_dir.join("deployment.yaml"),
            format!(
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {}\nspec:\n  template:\n    spec:\n      containers:\n        - name: app\n          image: {}\n",
                name, image
            ),
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CreatedPullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Default)]
struct PlatformState {
    next_number: u64,
    open: Vec<(PullRequest, GitHubRepo, GitHubRepo)>,
    created: Vec<CreatedPullRequest>,
    checks: Vec<(String, Option<CheckConclusion>)>,
}

/// Merging fast-forwards the destination branch of the bare remote to the
/// fork branch, so the next pass sees the published tree.
pub struct FakePlatform {
    remotes: PathBuf,
    merges: bool,
    state: Mutex<PlatformState>,
}

impl FakePlatform {
    pub fn new(remotes: &Path, merges: bool) -> Self {
        Self {
            remotes: remotes.to_path_buf(),
            merges,
            state: Mutex::new(PlatformState {
                next_number: 1,
                ..Default::default()
            }),
        }
    }

    /// Records an open pull request as if an earlier pass had left it.
    pub fn leave_open(&self, dest: &GitHubRepo, fork: &GitHubRepo) -> PullRequest {
        let mut state = self.state.lock().unwrap();
        let pr = next_pr(&mut state);
        state.open.push((pr.clone(), dest.clone(), fork.clone()));
        pr
    }

    pub fn created(&self) -> Vec<CreatedPullRequest> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn checks(&self) -> Vec<(String, Option<CheckConclusion>)> {
        self.state.lock().unwrap().checks.clone()
    }
}

fn next_pr(state: &mut PlatformState) -> PullRequest {
    let number = state.next_number;
    state.next_number += 1;
    PullRequest {
        number,
        url: format!("https://github.test/pull/{}", number),
    }
}

impl PullRequestService for FakePlatform {
    fn find_open(&self, dest: &GitHubRepo, fork: &GitHubRepo) -> Result<Option<PullRequest>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .open
            .iter()
            .find(|(_, d, f)| d == dest && f == fork)
            .map(|(pr, _, _)| pr.clone()))
    }

    fn create(&self, request: &NewPullRequest<'_>) -> Result<PullRequest> {
        let mut state = self.state.lock().unwrap();
        let pr = next_pr(&mut state);
        state.created.push(CreatedPullRequest {
            number: pr.number,
            title: request.title.to_string(),
            body: request.body.to_string(),
            labels: request.labels.to_vec(),
        });
        state
            .open
            .push((pr.clone(), request.dest.clone(), request.fork.clone()));
        Ok(pr)
    }

    fn merge_and_wait(
        &self,
        repo: &GitHubRepo,
        pr: &PullRequest,
        _timeout: Duration,
    ) -> Result<MergeState> {
        if !self.merges {
            return Ok(MergeState::Open);
        }
        let mut state = self.state.lock().unwrap();
        let Some(index) = state.open.iter().position(|(open, _, _)| open == pr) else {
            return Ok(MergeState::Closed);
        };
        let (_, dest, fork) = state.open.remove(index);
        if fork.org != repo.org || fork.repo != repo.repo {
            return Err(HydrosError::Platform("cross-repository merge".to_string()));
        }

        let bare = self.remotes.join(&repo.org).join(format!("{}.git", repo.repo));
        git(
            &bare,
            &[
                "update-ref",
                &format!("refs/heads/{}", dest.branch),
                &format!("refs/heads/{}", fork.branch),
            ],
        );
        Ok(MergeState::Merged)
    }

    fn create_check(&self, _repo: &GitHubRepo, head_sha: &str, name: &str) -> Result<CheckRun> {
        let mut state = self.state.lock().unwrap();
        state.checks.push((head_sha.to_string(), None));
        Ok(CheckRun {
            id: state.checks.len() as u64,
            name: name.to_string(),
            head_sha: head_sha.to_string(),
        })
    }

    fn complete_check(
        &self,
        _repo: &GitHubRepo,
        check: &CheckRun,
        conclusion: CheckConclusion,
        _summary: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.checks.get_mut(check.id as usize - 1) {
            entry.1 = Some(conclusion);
        }
        Ok(())
    }
}

/// Collaborators wired to the fakes, sharing `platform` with the caller.
pub fn fake_collaborators(platform: Arc<FakePlatform>, digest: &str) -> Collaborators {
    let digest = digest.to_string();
    Collaborators {
        resolvers: Arc::new(move || -> Result<ResolverSet> {
            ResolverSet::new().with(".*", Box::new(FixedDigest(digest.clone())))
        }),
        hydrator: Arc::new(DeploymentHydrator),
        pull_requests: platform,
        builder: None,
    }
}
