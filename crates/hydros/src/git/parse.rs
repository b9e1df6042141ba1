//! Git output parsing helpers.

use crate::process::CommandOutput;

/// Joins stderr and stdout of a failed command, whichever are present.
pub fn format_git_error(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    let stdout = output.stdout.trim();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "Command failed with exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout.to_string(),
        (false, true) => stderr.to_string(),
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

/// Paths listed by `git status --porcelain`, renames reported by their new name.
pub fn changed_paths(porcelain: &str) -> Vec<String> {
    porcelain
        .lines()
        .filter(|line| line.len() > 3 && !line.starts_with("##"))
        .map(|line| {
            let path = line[3..].trim();
            match path.split_once(" -> ") {
                Some((_, new)) => new.to_string(),
                None => path.to_string(),
            }
        })
        .collect()
}

/// True when `git fetch` failed only because the branch does not exist remotely.
pub fn is_missing_ref(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("couldn't find remote ref") || lower.contains("could not find remote ref")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_paths() {
        let porcelain = "## main\n M a.yaml\n?? dir/b.yaml\nR  old.yaml -> new.yaml\n";
        assert_eq!(
            changed_paths(porcelain),
            vec!["a.yaml", "dir/b.yaml", "new.yaml"]
        );
        assert!(changed_paths("").is_empty());
    }

    #[test]
    fn test_missing_ref() {
        assert!(is_missing_ref(
            "fatal: couldn't find remote ref hydros/dev"
        ));
        assert!(!is_missing_ref("fatal: unable to access"));
    }

    #[cfg(unix)]
    mod unix_tests {
        use super::*;
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;

        fn output(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
            CommandOutput {
                status: ExitStatus::from_raw(code << 8),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }
        }

        #[test]
        fn test_format_git_error_empty_output() {
            assert_eq!(
                format_git_error(&output(1, "", "")),
                "Command failed with exit code 1"
            );
        }

        #[test]
        fn test_format_git_error_both() {
            assert_eq!(
                format_git_error(&output(1, "some output", "some error")),
                "some error\nsome output"
            );
        }
    }
}
