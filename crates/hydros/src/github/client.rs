//! GitHub REST client for pull requests and check runs.

use std::time::{Duration, Instant};

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use super::{CheckConclusion, CheckRun, MergeState, NewPullRequest, PullRequest, PullRequestService};
use crate::config::{GitHubConfig, MergeMethod};
use crate::error::{HydrosError, Result};
use crate::resource::GitHubRepo;

const API_ACCEPT: &str = "application/vnd.github+json";
const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Deserialize)]
struct PullRequestState {
    state: String,
    #[serde(default)]
    merged: bool,
}

#[derive(Debug, Deserialize)]
struct CheckRunResponse {
    id: u64,
}

pub struct GitHubClient {
    client: Client,
    api_url: String,
    token: Option<SecretString>,
    merge_method: MergeMethod,
    poll_interval: Duration,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("hydros/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HydrosError::Platform(format!("failed to build HTTP client: {}", e)))?;

        let token = config.token.resolve_optional()?;
        if token.is_none() {
            log::warn!("No GitHub token configured; API calls are unauthenticated");
        }

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token,
            merge_method: config.merge_method,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        })
    }

    fn repo_url(&self, repo: &GitHubRepo, rest: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_url, repo.org, repo.repo, rest)
    }

    fn request(&self, builder: RequestBuilder) -> Result<Response> {
        let mut builder = builder
            .header(ACCEPT, API_ACCEPT)
            .header(API_VERSION_HEADER, API_VERSION);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        builder.send().map_err(platform_error)
    }

    /// Sends and requires a 2xx, reporting the body otherwise.
    fn expect_success(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
        let response = self.request(builder)?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().unwrap_or_default();
        Err(HydrosError::Platform(format!(
            "{} returned {}: {}",
            what,
            status,
            body.trim()
        )))
    }

    fn pull_state(&self, repo: &GitHubRepo, number: u64) -> Result<PullRequestState> {
        let url = self.repo_url(repo, &format!("pulls/{}", number));
        self.expect_success(self.client.get(&url), "get pull request")?
            .json()
            .map_err(platform_error)
    }

    /// One merge attempt. `Ok(false)` means not mergeable yet.
    fn try_merge(&self, repo: &GitHubRepo, number: u64) -> Result<bool> {
        let url = self.repo_url(repo, &format!("pulls/{}/merge", number));
        let response = self.request(
            self.client
                .put(&url)
                .json(&json!({ "merge_method": self.merge_method.as_str() })),
        )?;
        match response.status() {
            s if s.is_success() => Ok(true),
            // Not mergeable (checks pending, conflicts) or head moved.
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::CONFLICT => {
                log::debug!("Pull request #{} not mergeable yet", number);
                Ok(false)
            }
            status => Err(HydrosError::Platform(format!(
                "merge pull request #{} returned {}",
                number, status
            ))),
        }
    }
}

impl PullRequestService for GitHubClient {
    fn find_open(&self, dest: &GitHubRepo, fork: &GitHubRepo) -> Result<Option<PullRequest>> {
        let url = self.repo_url(dest, "pulls");
        let head = head_ref(fork);
        let pulls: Vec<PullRequest> = self
            .expect_success(
                self.client.get(&url).query(&[
                    ("state", "open"),
                    ("head", head.as_str()),
                    ("base", dest.branch.as_str()),
                ]),
                "list pull requests",
            )?
            .json()
            .map_err(platform_error)?;
        Ok(pulls.into_iter().next())
    }

    fn create(&self, request: &NewPullRequest<'_>) -> Result<PullRequest> {
        let url = self.repo_url(request.dest, "pulls");
        let pr: PullRequest = self
            .expect_success(
                self.client.post(&url).json(&json!({
                    "title": request.title,
                    "body": request.body,
                    "head": head_ref(request.fork),
                    "base": request.dest.branch,
                    "maintainer_can_modify": true,
                })),
                "create pull request",
            )?
            .json()
            .map_err(platform_error)?;

        if !request.labels.is_empty() {
            let labels_url = self.repo_url(request.dest, &format!("issues/{}/labels", pr.number));
            self.expect_success(
                self.client
                    .post(&labels_url)
                    .json(&json!({ "labels": request.labels })),
                "add labels",
            )?;
        }

        log::info!("Opened pull request #{} {}", pr.number, pr.url);
        Ok(pr)
    }

    fn merge_and_wait(
        &self,
        repo: &GitHubRepo,
        pr: &PullRequest,
        timeout: Duration,
    ) -> Result<MergeState> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.pull_state(repo, pr.number)?;
            if state.merged {
                return Ok(MergeState::Merged);
            }
            if state.state == "closed" {
                return Ok(MergeState::Closed);
            }
            if self.try_merge(repo, pr.number)? {
                log::info!("Merged pull request #{}", pr.number);
                return Ok(MergeState::Merged);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(MergeState::Open);
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn create_check(&self, repo: &GitHubRepo, head_sha: &str, name: &str) -> Result<CheckRun> {
        let url = self.repo_url(repo, "check-runs");
        let created: CheckRunResponse = self
            .expect_success(
                self.client.post(&url).json(&json!({
                    "name": name,
                    "head_sha": head_sha,
                    "status": "queued",
                })),
                "create check run",
            )?
            .json()
            .map_err(platform_error)?;
        Ok(CheckRun {
            id: created.id,
            name: name.to_string(),
            head_sha: head_sha.to_string(),
        })
    }

    fn complete_check(
        &self,
        repo: &GitHubRepo,
        check: &CheckRun,
        conclusion: CheckConclusion,
        summary: &str,
    ) -> Result<()> {
        let url = self.repo_url(repo, &format!("check-runs/{}", check.id));
        self.expect_success(
            self.client.patch(&url).json(&json!({
                "status": "completed",
                "conclusion": conclusion.as_str(),
                "output": { "title": check.name, "summary": summary },
            })),
            "update check run",
        )?;
        Ok(())
    }
}

/// `org:branch`, the head filter GitHub expects for cross-repository pull requests.
fn head_ref(fork: &GitHubRepo) -> String {
    format!("{}:{}", fork.org, fork.branch)
}

fn platform_error(e: reqwest::Error) -> HydrosError {
    HydrosError::Platform(e.to_string())
}
