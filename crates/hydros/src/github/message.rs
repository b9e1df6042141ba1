//! Commit and pull request message for a hydration.

use crate::resource::GitHubRepo;

/// Full message; the first line doubles as the pull request title.
pub fn hydration_message(
    dest_branch: &str,
    source: &GitHubRepo,
    commit: &str,
    changed_images: &[String],
) -> String {
    let mut lines = vec![
        format!(
            "[Auto] Hydrate {} with {}@{}; {} images changed",
            dest_branch,
            source.full_name(),
            commit,
            changed_images.len()
        ),
        String::new(),
        format!("Source: {}", source.web_url()),
        format!("Commit: {}/commit/{}", source.web_url(), commit),
        String::new(),
    ];

    if changed_images.is_empty() {
        lines.push("Changed ImageList: None".to_string());
    } else {
        lines.push("Changed ImageList:".to_string());
        lines.extend(changed_images.iter().map(|image| format!("* {}", image)));
    }

    lines.join("\n")
}

/// Message for a Renderer pass over `path` of `repo`.
pub fn render_message(repo: &GitHubRepo, path: &str, commit: &str) -> String {
    let target = if path.is_empty() { "/" } else { path };
    [
        format!("[Auto] Render {} in {}@{}", target, repo.full_name(), commit),
        String::new(),
        format!("Source: {}", repo.web_url()),
        format!("Commit: {}/commit/{}", repo.web_url(), commit),
    ]
    .join("\n")
}

/// Splits a message into title and body.
pub fn split_message(message: &str) -> (&str, &str) {
    match message.split_once('\n') {
        Some((title, body)) => (title, body.trim_start_matches('\n')),
        None => (message, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_message() {
        let message = render_message(&GitHubRepo::new("org", "repo", "main"), "", "abc");
        let (title, body) = split_message(&message);
        assert_eq!(title, "[Auto] Render / in org/repo@abc");
        assert!(body.starts_with("Source: https://github.com/org/repo\n"));
    }

    #[test]
    fn test_golden_message() {
        let message = hydration_message(
            "env/dev",
            &GitHubRepo::new("org", "repo", "main"),
            "abcdef",
            &["registry/repo/image:latest@sha123".to_string()],
        );
        assert_eq!(
            message,
            "[Auto] Hydrate env/dev with org/repo@abcdef; 1 images changed\n\
             \n\
             Source: https://github.com/org/repo\n\
             Commit: https://github.com/org/repo/commit/abcdef\n\
             \n\
             Changed ImageList:\n\
             * registry/repo/image:latest@sha123"
        );
    }

    #[test]
    fn test_no_changed_images() {
        let message = hydration_message(
            "main",
            &GitHubRepo::new("org", "repo", "main"),
            "abcdef",
            &[],
        );
        assert!(message.starts_with("[Auto] Hydrate main with org/repo@abcdef; 0 images changed\n"));
        assert!(message.ends_with("\nChanged ImageList: None"));
    }

    #[test]
    fn test_split_message() {
        let (title, body) = split_message("title\n\nSource: x");
        assert_eq!(title, "title");
        assert_eq!(body, "Source: x");
        assert_eq!(split_message("only"), ("only", ""));
    }
}
