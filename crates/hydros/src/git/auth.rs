//! Credentials passed to git through its environment.

use std::path::PathBuf;

use secrecy::ExposeSecret;

use crate::config::{GitAuthConfig, GitAuthType};
use crate::error::{HydrosError, Result};

/// Escapes a token for use inside single quotes in a shell script.
pub fn shell_escape_token(token: &str) -> String {
    token.replace('\'', "'\\''")
}

/// Deletes the askpass script when dropped so tokens don't outlive the command.
#[derive(Debug)]
pub struct AskpassCleanup {
    path: Option<PathBuf>,
}

impl AskpassCleanup {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn empty() -> Self {
        Self { path: None }
    }
}

impl Drop for AskpassCleanup {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to remove askpass script: {}", e);
            }
        }
    }
}

/// Environment for one git invocation. Keep it alive until the command exits.
#[derive(Debug)]
pub struct AuthEnv {
    pub env_vars: Vec<(String, String)>,
    _cleanup: AskpassCleanup,
}

impl AuthEnv {
    fn plain(env_vars: Vec<(String, String)>) -> Self {
        Self {
            env_vars,
            _cleanup: AskpassCleanup::empty(),
        }
    }
}

pub fn build_auth_env(auth: &GitAuthConfig) -> Result<AuthEnv> {
    let mut env = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];

    match auth.auth_type {
        GitAuthType::None => Ok(AuthEnv::plain(env)),
        GitAuthType::Token => {
            let token = auth.token.resolve().map_err(|e| {
                HydrosError::GitAuthFailed(format!("cannot resolve git token: {}", e))
            })?;
            let askpass_path = write_askpass(token.expose_secret())?;
            let cleanup = AskpassCleanup::new(askpass_path.clone());

            let askpass = askpass_path
                .to_str()
                .ok_or_else(|| {
                    HydrosError::GitAuthFailed("temp directory path is not UTF-8".to_string())
                })?
                .to_string();
            env.push(("GIT_ASKPASS".to_string(), askpass));

            Ok(AuthEnv {
                env_vars: env,
                _cleanup: cleanup,
            })
        }
        GitAuthType::SshKey => {
            let key_path = ssh_key_path(auth.ssh_key_path.as_deref());
            if !key_path.exists() {
                return Err(HydrosError::GitAuthFailed(format!(
                    "SSH key file not found: {}",
                    key_path.display()
                )));
            }

            let display = key_path.display().to_string().replace('\'', "'\\''");
            let quoted = if display.starts_with('-') {
                format!("'./{}'", display)
            } else {
                format!("'{}'", display)
            };
            env.push((
                "GIT_SSH_COMMAND".to_string(),
                format!("ssh -i {} -o StrictHostKeyChecking=accept-new", quoted),
            ));
            Ok(AuthEnv::plain(env))
        }
    }
}

fn ssh_key_path(configured: Option<&str>) -> PathBuf {
    match configured.filter(|p| !p.is_empty()) {
        None => dirs::home_dir()
            .map(|h| h.join(".ssh").join("id_ed25519"))
            .unwrap_or_else(|| PathBuf::from(".ssh/id_ed25519")),
        Some("~") => dirs::home_dir().unwrap_or_default(),
        Some(path) => match path.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|h| h.join(rest))
                .unwrap_or_else(|| PathBuf::from(path)),
            None => PathBuf::from(path),
        },
    }
}

#[cfg(unix)]
fn write_askpass(token: &str) -> Result<PathBuf> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let path = std::env::temp_dir().join(format!(".hydros-askpass-{}.sh", uuid::Uuid::new_v4()));
    let script = format!("#!/bin/sh\necho '{}'\n", shell_escape_token(token));

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o700)
        .open(&path)?;
    file.write_all(script.as_bytes())?;
    Ok(path)
}

#[cfg(not(unix))]
fn write_askpass(token: &str) -> Result<PathBuf> {
    let path = std::env::temp_dir().join(format!(".hydros-askpass-{}.bat", uuid::Uuid::new_v4()));
    std::fs::write(&path, format!("@echo off\r\necho {}\r\n", token))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::SecretSource;

    #[test]
    fn test_no_auth_disables_prompt_only() {
        let auth = build_auth_env(&GitAuthConfig::default()).unwrap();
        assert_eq!(
            auth.env_vars,
            vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())]
        );
    }

    #[test]
    fn test_token_askpass_removed_on_drop() {
        let config = GitAuthConfig {
            auth_type: GitAuthType::Token,
            token: SecretSource {
                value: Some("s3cr'et".to_string()),
                ..Default::default()
            },
            ssh_key_path: None,
        };
        let auth = build_auth_env(&config).unwrap();
        let (_, path) = auth
            .env_vars
            .iter()
            .find(|(k, _)| k == "GIT_ASKPASS")
            .cloned()
            .unwrap();
        let path = PathBuf::from(path);
        assert!(path.exists());
        let script = std::fs::read_to_string(&path).unwrap();
        assert!(script.contains("s3cr'\\''et"));

        drop(auth);
        assert!(!path.exists());
    }

    #[test]
    fn test_token_without_source_fails() {
        let config = GitAuthConfig {
            auth_type: GitAuthType::Token,
            ..Default::default()
        };
        let err = build_auth_env(&config).unwrap_err();
        assert!(matches!(err, HydrosError::GitAuthFailed(_)));
    }

    #[test]
    fn test_missing_ssh_key() {
        let config = GitAuthConfig {
            auth_type: GitAuthType::SshKey,
            ssh_key_path: Some("~/hydros-nonexistent-key".to_string()),
            ..Default::default()
        };
        let err = build_auth_env(&config).unwrap_err().to_string();
        assert!(err.contains("SSH key file not found"));
        assert!(!err.contains("~/"));
    }

    #[test]
    fn test_shell_escape_token() {
        assert_eq!(shell_escape_token("simple"), "simple");
        assert_eq!(shell_escape_token("a'b'c"), "a'\\''b'\\''c");
    }
}
