//! Engine configuration.
//!
//! Loaded from a YAML file with camelCase keys. Every field has a default, so
//! an empty document is a valid configuration.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{HydrosError, Result};
use crate::secrets::SecretSource;

/// Overrides `workDir` when set.
pub const WORK_DIR_ENV_VAR: &str = "HYDROS_WORK_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Root under which every reconciler keeps its clones.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Number of manager worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_resync_period")]
    pub resync_period_secs: u64,

    #[serde(default)]
    pub failure_policy: FailurePolicyKind,

    /// Delay before a failed reconciler runs again. Defaults to the resync period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_backoff_secs: Option<u64>,

    #[serde(default = "default_true")]
    pub auto_merge: bool,

    #[serde(default = "default_merge_timeout")]
    pub merge_timeout_secs: u64,

    /// Bound on waiting for a pull request left open by an earlier pass.
    #[serde(default = "default_merge_timeout")]
    pub existing_pr_timeout_secs: u64,

    #[serde(default)]
    pub report_checks: bool,

    #[serde(default)]
    pub git: GitConfig,

    #[serde(default)]
    pub github: GitHubConfig,

    #[serde(default)]
    pub kustomize: KustomizeConfig,

    #[serde(default)]
    pub builder: BuilderConfig,

    #[serde(default)]
    pub functions: FunctionsConfig,

    #[serde(default)]
    pub registries: Vec<RegistryCredential>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicyKind {
    #[default]
    Requeue,
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    /// Remote URL template; `{org}` and `{repo}` are substituted.
    #[serde(default = "default_url_template")]
    pub url_template: String,

    #[serde(default = "default_user_name")]
    pub user_name: String,

    #[serde(default = "default_user_email")]
    pub user_email: String,

    #[serde(default)]
    pub auth: GitAuthConfig,

    #[serde(default = "default_git_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitAuthConfig {
    #[serde(default, rename = "type")]
    pub auth_type: GitAuthType,

    #[serde(flatten)]
    pub token: SecretSource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GitAuthType {
    #[default]
    None,
    Token,
    SshKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_github_token")]
    pub token: SecretSource,

    #[serde(default)]
    pub merge_method: MergeMethod,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Merge,
    #[default]
    Squash,
    Rebase,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMethod::Merge => "merge",
            MergeMethod::Squash => "squash",
            MergeMethod::Rebase => "rebase",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizeConfig {
    #[serde(default = "default_kustomize_command")]
    pub command: String,

    #[serde(default = "default_kustomize_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_builder_command")]
    pub command: String,

    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    #[serde(default = "default_floating_tag")]
    pub floating_tag: String,

    #[serde(default = "default_build_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionsConfig {
    /// Exec functions run arbitrary binaries from the source repo.
    #[serde(default)]
    pub allow_exec: bool,

    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,
}

/// Registry credentials, selected by matching `pattern` against the hostname.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCredential {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_env_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_file: Option<String>,
}

fn default_work_dir() -> PathBuf {
    dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
        .unwrap_or_else(std::env::temp_dir)
        .join("hydros")
        .join("work")
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_resync_period() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_merge_timeout() -> u64 {
    180
}

fn default_url_template() -> String {
    "https://github.com/{org}/{repo}.git".to_string()
}

fn default_user_name() -> String {
    "hydros".to_string()
}

fn default_user_email() -> String {
    "hydros@localhost".to_string()
}

fn default_git_timeout() -> u64 {
    300
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_github_token() -> SecretSource {
    SecretSource::from_env_var("GITHUB_TOKEN")
}

fn default_poll_interval() -> u64 {
    10
}

fn default_kustomize_command() -> String {
    "kustomize".to_string()
}

fn default_kustomize_timeout() -> u64 {
    120
}

fn default_builder_command() -> String {
    "docker".to_string()
}

fn default_parallelism() -> usize {
    4
}

fn default_floating_tag() -> String {
    "latest".to_string()
}

fn default_build_timeout() -> u64 {
    1800
}

fn default_exec_timeout() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            workers: default_workers(),
            resync_period_secs: default_resync_period(),
            failure_policy: FailurePolicyKind::default(),
            failure_backoff_secs: None,
            auto_merge: true,
            merge_timeout_secs: default_merge_timeout(),
            existing_pr_timeout_secs: default_merge_timeout(),
            report_checks: false,
            git: GitConfig::default(),
            github: GitHubConfig::default(),
            kustomize: KustomizeConfig::default(),
            builder: BuilderConfig::default(),
            functions: FunctionsConfig::default(),
            registries: Vec::new(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            url_template: default_url_template(),
            user_name: default_user_name(),
            user_email: default_user_email(),
            auth: GitAuthConfig::default(),
            timeout_secs: default_git_timeout(),
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: default_github_token(),
            merge_method: MergeMethod::default(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for KustomizeConfig {
    fn default() -> Self {
        Self {
            command: default_kustomize_command(),
            timeout_secs: default_kustomize_timeout(),
        }
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_builder_command(),
            parallelism: default_parallelism(),
            floating_tag: default_floating_tag(),
            timeout_secs: default_build_timeout(),
        }
    }
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            allow_exec: false,
            exec_timeout_secs: default_exec_timeout(),
        }
    }
}

impl EngineConfig {
    /// Reads, env-overrides and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| HydrosError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config = Self::from_yaml(&content).map_err(|e| match e {
            HydrosError::ParseYaml { message, .. } => HydrosError::ParseYaml {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = std::env::var_os(WORK_DIR_ENV_VAR).filter(|d| !d.is_empty()) {
            log::debug!("Work directory overridden by {}", WORK_DIR_ENV_VAR);
            self.work_dir = PathBuf::from(dir);
        }
    }

    /// Checks every field and reports all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.workers == 0 {
            problems.push("workers must be at least 1".to_string());
        }
        if self.resync_period_secs == 0 {
            problems.push("resyncPeriodSecs must be greater than 0".to_string());
        }
        if self.builder.parallelism == 0 {
            problems.push("builder.parallelism must be at least 1".to_string());
        }
        if self.builder.floating_tag.trim().is_empty() {
            problems.push("builder.floatingTag must not be empty".to_string());
        }
        if self.github.poll_interval_secs == 0 {
            problems.push("github.pollIntervalSecs must be greater than 0".to_string());
        }
        if !self.git.url_template.contains("{repo}") {
            problems.push("git.urlTemplate must contain '{repo}'".to_string());
        }
        if self.git.auth.auth_type == GitAuthType::Token && !self.git.auth.token.is_configured() {
            problems.push(
                "git.auth type 'token' needs one of value, file or envVar".to_string(),
            );
        }
        for credential in &self.registries {
            if let Err(e) = Regex::new(&credential.pattern) {
                problems.push(format!(
                    "registries: invalid pattern '{}': {}",
                    credential.pattern, e
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(HydrosError::Validation(problems.join("; ")))
        }
    }

    pub fn failure_backoff_secs(&self) -> u64 {
        self.failure_backoff_secs.unwrap_or(self.resync_period_secs)
    }
}
