//! Pure pipeline rules: target paths, pinning precedence, change detection,
//! function ordering and the pull request message.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use hydros::functions::{discover_functions, function_target_dir, order_functions};
use hydros::github::hydration_message;
use hydros::image::resolve_strategy;
use hydros::resource::{FunctionRef, GitHubRepo};
use hydros::sync::changed_images;
use hydros::{generate_target_path, DockerImageRef, PinningRule, Strategy, TargetPath};

#[test]
fn test_target_path_table() {
    let base = Path::new("/src/apps");
    let cases = [
        ("/src/apps/api/kustomization.yaml", "api", ""),
        ("/src/apps/api/dev/kustomization.yaml", "api", "dev"),
        ("/src/apps/backends/billing/prod/kustomization.yaml", "backends/billing", "prod"),
    ];
    for (kustomization, dir, overlay) in cases {
        let target = generate_target_path(base, Path::new(kustomization)).unwrap();
        assert_eq!(
            target,
            TargetPath {
                dir: dir.to_string(),
                overlay_name: overlay.to_string(),
            },
            "{}",
            kustomization
        );
    }

    assert!(generate_target_path(base, Path::new("/src/apps/kustomization.yaml")).is_err());
    assert!(generate_target_path(base, Path::new("/elsewhere/a/kustomization.yaml")).is_err());
}

#[test]
fn test_first_matching_rule_wins() {
    let rules: Vec<PinningRule> = serde_yaml::from_str(
        r#"
- tags: [latest]
  strategy: sourceCommit
  imageRepoMatch:
    repos: [acme/api]
    type: include
- tags: [latest, main]
  strategy: mutableTag
"#,
    )
    .unwrap();

    let image = |s: &str| DockerImageRef::parse(s).unwrap();
    assert_eq!(
        resolve_strategy(&rules, &image("ghcr.io/acme/api:latest")),
        Strategy::SourceCommit
    );
    assert_eq!(
        resolve_strategy(&rules, &image("ghcr.io/acme/web:latest")),
        Strategy::MutableTag
    );
    assert_eq!(
        resolve_strategy(&rules, &image("ghcr.io/acme/api:main")),
        Strategy::MutableTag
    );
    assert_eq!(
        resolve_strategy(&rules, &image("ghcr.io/acme/api:v1.2.0")),
        Strategy::Unknown
    );
}

#[test]
fn test_changed_images_only_reports_new_or_moved_pins() {
    let map = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    };
    let last = map(&[
        ("r.io/a:latest", "r.io/a:latest@sha256:1"),
        ("r.io/b:latest", "r.io/b:latest@sha256:2"),
        ("r.io/gone:latest", "r.io/gone:latest@sha256:9"),
    ]);
    let current = map(&[
        ("r.io/a:latest", "r.io/a:latest@sha256:1"),
        ("r.io/b:latest", "r.io/b:latest@sha256:3"),
        ("r.io/c:latest", "r.io/c:latest@sha256:4"),
    ]);

    assert_eq!(
        changed_images(&last, &current),
        vec!["r.io/b:latest@sha256:3", "r.io/c:latest@sha256:4"]
    );
    assert!(changed_images(&current, &current).is_empty());
}

#[test]
fn test_hydration_message_golden() {
    let source = GitHubRepo::new("acme", "manifests", "main");
    let message = hydration_message(
        "env/dev",
        &source,
        "0a1b2c3",
        &["ghcr.io/acme/api:v2@sha256:aa".to_string()],
    );
    assert_eq!(
        message,
        "[Auto] Hydrate env/dev with acme/manifests@0a1b2c3; 1 images changed\n\
         \n\
         Source: https://github.com/acme/manifests\n\
         Commit: https://github.com/acme/manifests/commit/0a1b2c3\n\
         \n\
         Changed ImageList:\n\
         * ghcr.io/acme/api:v2@sha256:aa"
    );
}

#[test]
fn test_functions_run_deepest_declaration_first() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let write = |path: &str, label: &str| {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            path,
            format!(
                "apiVersion: fns.hydros.dev/v1alpha1\nkind: SetLabels\nmetadata:\n  name: {0}\nspec:\n  labels:\n    by: {0}\n",
                label
            ),
        )
        .unwrap();
    };
    write("apps/fns/top.yaml", "top");
    write("apps/api/fns/api.yaml", "api");
    write("apps/api/dev/fns/dev.yaml", "dev");

    let refs = vec![FunctionRef {
        path: "apps".to_string(),
    }];
    let mut functions = discover_functions(root, &refs).unwrap();
    order_functions(&mut functions);

    let order: Vec<PathBuf> = functions.iter().map(|f| f.source_dir.clone()).collect();
    assert_eq!(
        order,
        vec![
            PathBuf::from("apps/api/dev/fns"),
            PathBuf::from("apps/api/fns"),
            PathBuf::from("apps/fns"),
        ]
    );
}

#[test]
fn test_function_lands_in_longest_enclosing_hydrated_dir() {
    let hydrated = vec![
        TargetPath {
            dir: "backends".to_string(),
            overlay_name: String::new(),
        },
        TargetPath {
            dir: "backends/billing".to_string(),
            overlay_name: "dev".to_string(),
        },
    ];
    assert_eq!(
        function_target_dir(Path::new("backends/billing/dev/fns"), &hydrated),
        PathBuf::from("backends/billing")
    );
    assert_eq!(
        function_target_dir(Path::new("backends/fns"), &hydrated),
        PathBuf::from("backends")
    );
    assert_eq!(
        function_target_dir(Path::new("frontends/fns"), &hydrated),
        PathBuf::from("frontends/fns")
    );
}
