//! End-to-end syncer passes against local bare repositories.

#![cfg(unix)]

mod common;

use std::sync::Arc;

use common::{fake_collaborators, FakePlatform, GitFixture};
use hydros::error::HydrosError;
use hydros::resource::{GitHubRepo, ManifestSync, PAUSE_ANNOTATION, TAKEOVER_ANNOTATION};
use hydros::{SyncOutcome, Syncer};

const DIGEST: &str = "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

const KUSTOMIZATION: &str = r#"apiVersion: kustomize.config.k8s.io/v1beta1
kind: Kustomization
metadata:
  labels:
    env: dev
resources:
  - ../base
images:
  - name: api
    newName: registry.io/acme/api
    newTag: latest
"#;

const SET_LABELS: &str = r#"apiVersion: fns.hydros.dev/v1alpha1
kind: SetLabels
metadata:
  name: team
spec:
  labels:
    team: platform
"#;

const MANIFEST_SYNC: &str = r#"
apiVersion: hydros.dev/v1alpha1
kind: ManifestSync
metadata:
  name: acme-dev
spec:
  sourceRepo: {org: acme, repo: manifests, branch: main}
  forkRepo: {org: acme, repo: hydrated, branch: hydros/dev}
  destRepo: {org: acme, repo: hydrated, branch: main}
  sourcePath: apps
  destPath: clusters/dev
  selector:
    matchLabels:
      env: dev
  imageTagsToPin:
    - tags: [latest]
      strategy: mutableTag
  functions:
    - path: fns
"#;

struct Scenario {
    fixture: GitFixture,
    platform: Arc<FakePlatform>,
    source_commit: String,
}

impl Scenario {
    fn new(merges: bool) -> Self {
        let fixture = GitFixture::new();
        let source_commit = fixture.create_repo(
            "acme",
            "manifests",
            "main",
            &[
                ("apps/api/dev/kustomization.yaml", KUSTOMIZATION),
                ("apps/api/base/deployment.yaml", "kind: Deployment\n"),
                ("fns/labels.yaml", SET_LABELS),
            ],
        );
        fixture.create_repo("acme", "hydrated", "main", &[("README.md", "hydrated\n")]);
        let platform = Arc::new(FakePlatform::new(&fixture.remotes, merges));
        Self {
            fixture,
            platform,
            source_commit,
        }
    }

    fn syncer(&self, manifest: ManifestSync) -> Syncer {
        Syncer::new(
            manifest,
            Arc::new(self.fixture.config()),
            fake_collaborators(self.platform.clone(), DIGEST),
        )
        .expect("Failed to create syncer")
    }

    fn dest_main(&self) -> Option<String> {
        self.fixture.branch_commit("acme", "hydrated", "main")
    }
}

fn manifest() -> ManifestSync {
    serde_yaml::from_str(MANIFEST_SYNC).expect("Failed to parse ManifestSync")
}

fn dest() -> GitHubRepo {
    GitHubRepo::new("acme", "hydrated", "main")
}

fn fork() -> GitHubRepo {
    GitHubRepo::new("acme", "hydrated", "hydros/dev")
}

#[test]
fn test_first_pass_publishes_and_merges() {
    let scenario = Scenario::new(true);
    let syncer = scenario.syncer(manifest());

    let outcome = syncer.run_once(false).expect("First pass failed");
    assert!(matches!(outcome, SyncOutcome::Merged { .. }), "got {:?}", outcome);

    let created = scenario.platform.created();
    assert_eq!(created.len(), 1);
    assert_eq!(
        created[0].title,
        format!(
            "[Auto] Hydrate main with acme/manifests@{}; 1 images changed",
            scenario.source_commit
        )
    );
    assert!(created[0]
        .body
        .contains(&format!("* registry.io/acme/api:latest@{}", DIGEST)));

    let rendered = scenario
        .fixture
        .read_file("acme", "hydrated", "main", "clusters/dev/api/deployment.yaml")
        .expect("Hydrated deployment missing on the destination branch");
    assert!(rendered.contains(&format!("image: registry.io/acme/api:latest@{}", DIGEST)));
    assert!(rendered.contains("team: platform"));

    let status = scenario
        .fixture
        .read_file("acme", "hydrated", "main", "clusters/dev/.lastsync.yaml")
        .expect("Status file missing on the destination branch");
    assert!(status.contains(&scenario.source_commit));
    assert!(status.contains(DIGEST));
    assert!(!status.contains("pauseUntil"), "{}", status);

    // Untouched content outside the destination path survives.
    assert!(scenario
        .fixture
        .read_file("acme", "hydrated", "main", "README.md")
        .is_some());
}

#[test]
fn test_second_pass_is_up_to_date() {
    let scenario = Scenario::new(true);
    let syncer = scenario.syncer(manifest());

    syncer.run_once(false).expect("First pass failed");
    let fork_head = scenario.fixture.branch_commit("acme", "hydrated", "hydros/dev");

    let outcome = syncer.run_once(false).expect("Second pass failed");
    assert_eq!(outcome, SyncOutcome::UpToDate);
    assert_eq!(scenario.platform.created().len(), 1);
    assert_eq!(
        scenario.fixture.branch_commit("acme", "hydrated", "hydros/dev"),
        fork_head
    );
}

#[test]
fn test_fresh_syncer_reads_published_status() {
    let scenario = Scenario::new(true);
    scenario
        .syncer(manifest())
        .run_once(false)
        .expect("First pass failed");

    // A new syncer over the same work dir only has the status file to go by.
    let outcome = scenario
        .syncer(manifest())
        .run_once(false)
        .expect("Second pass failed");
    assert_eq!(outcome, SyncOutcome::UpToDate);
}

#[test]
fn test_forced_pass_without_changes_publishes_nothing() {
    let scenario = Scenario::new(true);
    let syncer = scenario.syncer(manifest());
    syncer.run_once(false).expect("First pass failed");
    let before = scenario.dest_main();

    let outcome = syncer.run_once(true).expect("Forced pass failed");
    assert_eq!(outcome, SyncOutcome::NoChanges);
    assert_eq!(scenario.dest_main(), before);
    assert_eq!(scenario.platform.created().len(), 1);
}

#[test]
fn test_new_source_commit_publishes_again() {
    let scenario = Scenario::new(true);
    let syncer = scenario.syncer(manifest());
    syncer.run_once(false).expect("First pass failed");

    let next = scenario.fixture.commit_files(
        "acme",
        "manifests",
        "main",
        &[("apps/api/base/service.yaml", "kind: Service\n")],
    );
    let outcome = syncer.run_once(false).expect("Second pass failed");
    assert!(matches!(outcome, SyncOutcome::Merged { .. }), "got {:?}", outcome);

    let created = scenario.platform.created();
    assert_eq!(created.len(), 2);
    assert_eq!(
        created[1].title,
        format!("[Auto] Hydrate main with acme/manifests@{}; 0 images changed", next)
    );
    assert!(created[1].body.contains("Changed ImageList: None"));
}

#[test]
fn test_pause_annotation_stops_the_pass() {
    let scenario = Scenario::new(true);
    let mut paused = manifest();
    paused
        .metadata
        .annotations
        .insert(PAUSE_ANNOTATION.to_string(), "1h".to_string());
    let syncer = scenario.syncer(paused);
    let before = scenario.dest_main();

    let outcome = syncer.run_once(false).expect("Paused pass failed");
    assert!(matches!(outcome, SyncOutcome::Paused { .. }), "got {:?}", outcome);
    assert!(scenario.platform.created().is_empty());
    assert_eq!(scenario.dest_main(), before);
}

#[test]
fn test_takeover_publishes_through_an_active_pause() {
    let scenario = Scenario::new(true);
    let mut manifest = manifest();
    let annotations = &mut manifest.metadata.annotations;
    annotations.insert(PAUSE_ANNOTATION.to_string(), "1h".to_string());
    annotations.insert(TAKEOVER_ANNOTATION.to_string(), "true".to_string());
    let syncer = scenario.syncer(manifest);

    let outcome = syncer.run_once(false).expect("Takeover pass failed");
    assert!(matches!(outcome, SyncOutcome::Merged { .. }), "got {:?}", outcome);
    assert_eq!(scenario.platform.created().len(), 1);

    // The pause window is still recorded on the destination.
    let status = scenario
        .fixture
        .read_file("acme", "hydrated", "main", "clusters/dev/.lastsync.yaml")
        .expect("Status file missing on the destination branch");
    assert!(status.contains("pauseUntil:"), "{}", status);
}

#[test]
fn test_open_pull_request_blocks_the_pass() {
    let scenario = Scenario::new(false);
    let left = scenario.platform.leave_open(&dest(), &fork());
    let syncer = scenario.syncer(manifest());

    let err = syncer.run_once(false).unwrap_err();
    match err {
        HydrosError::PullRequestBlocked { number, .. } => assert_eq!(number, left.number),
        other => panic!("Expected PullRequestBlocked, got {:?}", other),
    }
    assert!(scenario.platform.created().is_empty());
}

#[test]
fn test_unmerged_pull_request_is_reported() {
    let scenario = Scenario::new(false);
    let syncer = scenario.syncer(manifest());

    let err = syncer.run_once(false).unwrap_err();
    assert!(
        matches!(err, HydrosError::PullRequestNotMerged { .. }),
        "got {:?}",
        err
    );
    // The fork branch carries the hydrated commit for review.
    assert!(scenario
        .fixture
        .read_file("acme", "hydrated", "hydros/dev", "clusters/dev/api/deployment.yaml")
        .is_some());
}

#[test]
fn test_overlay_collision_leaves_destination_untouched() {
    let scenario = Scenario::new(true);
    scenario.fixture.commit_files(
        "acme",
        "manifests",
        "main",
        &[("apps/api/prod/kustomization.yaml", KUSTOMIZATION)],
    );
    let before = scenario.dest_main();
    let syncer = scenario.syncer(manifest());

    let err = syncer.run_once(false).unwrap_err();
    assert!(matches!(err, HydrosError::OverlayCollision { .. }), "got {:?}", err);
    assert_eq!(scenario.dest_main(), before);
    assert!(scenario
        .fixture
        .branch_commit("acme", "hydrated", "hydros/dev")
        .is_none());
    assert!(scenario.platform.created().is_empty());
}

#[test]
fn test_missing_destination_branch_fails() {
    let scenario = Scenario::new(true);
    let mut sync = manifest();
    sync.spec.dest_repo.branch = "release".to_string();
    let syncer = scenario.syncer(sync);

    let err = syncer.run_once(false).unwrap_err();
    assert!(matches!(err, HydrosError::GitOperation(_)), "got {:?}", err);
}
