//! Commit, force-push and pull request steps shared by the reconcilers.

use std::time::Duration;

use log::{info, warn};

use crate::error::{HydrosError, Result};
use crate::git::GitRepository;
use crate::github::{split_message, MergeState, NewPullRequest, PullRequest, PullRequestService};
use crate::resource::GitHubRepo;

/// What publishing a working tree produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publication {
    /// The tree matched the branch; nothing was pushed.
    NoChanges,
    Opened(PullRequest),
    Merged(PullRequest),
}

/// Where and how a working tree is published.
#[derive(Debug, Clone)]
pub struct PublishTarget<'a> {
    pub dest: &'a GitHubRepo,
    pub fork: &'a GitHubRepo,
    pub labels: &'a [String],
    /// Wait this long for the merge; `None` leaves the pull request open.
    pub merge_timeout: Option<Duration>,
}

/// Resolves a pull request an earlier pass left open.
///
/// Merged or closed lets the pass continue; still open after `timeout`
/// blocks it.
pub fn settle_existing(
    pulls: &dyn PullRequestService,
    dest: &GitHubRepo,
    fork: &GitHubRepo,
    timeout: Duration,
) -> Result<()> {
    let Some(pr) = pulls.find_open(dest, fork)? else {
        return Ok(());
    };

    info!("Found open pull request #{}, trying to merge it", pr.number);
    match pulls.merge_and_wait(dest, &pr, timeout)? {
        MergeState::Merged => {
            info!("Pull request #{} merged", pr.number);
            Ok(())
        }
        MergeState::Closed => {
            info!("Pull request #{} was closed", pr.number);
            Ok(())
        }
        MergeState::Open => Err(HydrosError::PullRequestBlocked {
            number: pr.number,
            url: pr.url,
        }),
    }
}

/// Commits every change in `checkout` and proposes it as a pull request.
///
/// The fork branch is force-pushed: it only ever carries generated commits.
pub fn publish(
    checkout: &GitRepository,
    pulls: &dyn PullRequestService,
    target: &PublishTarget<'_>,
    message: &str,
) -> Result<Publication> {
    let Some(commit) = checkout.commit_all(message)? else {
        info!("Nothing to commit in {}", checkout.path().display());
        return Ok(Publication::NoChanges);
    };

    checkout.push_force("origin", &target.fork.branch, &target.fork.branch)?;
    info!(
        "Pushed {} to {}:{}",
        &commit[..commit.len().min(12)],
        target.fork.full_name(),
        target.fork.branch
    );

    let (title, body) = split_message(message);
    let pr = pulls.create(&NewPullRequest {
        dest: target.dest,
        fork: target.fork,
        title,
        body,
        labels: target.labels,
    })?;
    info!("Opened pull request #{} {}", pr.number, pr.url);

    let Some(timeout) = target.merge_timeout else {
        return Ok(Publication::Opened(pr));
    };

    match pulls.merge_and_wait(target.dest, &pr, timeout)? {
        MergeState::Merged => {
            info!("Pull request #{} merged", pr.number);
            Ok(Publication::Merged(pr))
        }
        MergeState::Closed => {
            warn!("Pull request #{} was closed without merging", pr.number);
            Ok(Publication::Opened(pr))
        }
        MergeState::Open => Err(HydrosError::PullRequestNotMerged {
            number: pr.number,
            url: pr.url,
            timeout_secs: timeout.as_secs(),
        }),
    }
}
