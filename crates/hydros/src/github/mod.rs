//! Pull requests and check runs on the hosting platform.

pub mod client;
pub mod message;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::resource::GitHubRepo;

pub use client::GitHubClient;
pub use message::{hydration_message, render_message, split_message};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(rename = "html_url")]
    pub url: String,
}

/// Where a pull request ended up after waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    Merged,
    Closed,
    /// Still open when the deadline passed.
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckConclusion {
    Success,
    Failure,
}

impl CheckConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckConclusion::Success => "success",
            CheckConclusion::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRun {
    pub id: u64,
    pub name: String,
    pub head_sha: String,
}

/// A pull request from `fork` into `dest`.
#[derive(Debug, Clone)]
pub struct NewPullRequest<'a> {
    pub dest: &'a GitHubRepo,
    pub fork: &'a GitHubRepo,
    pub title: &'a str,
    pub body: &'a str,
    pub labels: &'a [String],
}

pub trait PullRequestService: Send + Sync {
    /// The open pull request from `fork.branch` into `dest.branch`, if any.
    fn find_open(&self, dest: &GitHubRepo, fork: &GitHubRepo) -> Result<Option<PullRequest>>;

    fn create(&self, request: &NewPullRequest<'_>) -> Result<PullRequest>;

    /// Tries to merge until merged, closed or `timeout` elapses.
    fn merge_and_wait(
        &self,
        repo: &GitHubRepo,
        pr: &PullRequest,
        timeout: Duration,
    ) -> Result<MergeState>;

    /// Opens a queued check run on `head_sha`.
    fn create_check(&self, repo: &GitHubRepo, head_sha: &str, name: &str) -> Result<CheckRun>;

    fn complete_check(
        &self,
        repo: &GitHubRepo,
        check: &CheckRun,
        conclusion: CheckConclusion,
        summary: &str,
    ) -> Result<()>;
}
