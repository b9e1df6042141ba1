//! Resolver for registries speaking the OCI distribution API.
//!
//! Digests come from the `Docker-Content-Digest` header of a manifest `HEAD`.
//! Anonymous or basic-auth bearer tokens are fetched on a `401` challenge.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use base64::Engine;
use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::policy::Strategy;
use super::reference::DockerImageRef;
use super::resolver::{registry_host, Resolver, DEFAULT_REGISTRY};
use crate::config::RegistryCredential;
use crate::error::{HydrosError, Result};
use crate::secrets::resolve_secret_optional;

const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
const DIGEST_HEADER: &str = "Docker-Content-Digest";
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";

/// Upper bound on manifest lookups when looking for tags sharing a digest.
const MAX_TAG_LOOKUPS: usize = 50;

static CHALLENGE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).unwrap());

#[derive(Debug, Clone)]
struct Credentials {
    username: String,
    password: SecretString,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

pub struct OciResolver {
    client: Client,
    credentials: Vec<(Regex, RegistryCredential)>,
    tokens: Mutex<HashMap<String, String>>,
    digests: Mutex<HashMap<String, String>>,
}

impl OciResolver {
    pub fn new(credentials: &[RegistryCredential]) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("hydros/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HydrosError::Registry(format!("failed to build HTTP client: {}", e)))?;

        let credentials = credentials
            .iter()
            .map(|c| {
                Regex::new(&c.pattern)
                    .map(|r| (r, c.clone()))
                    .map_err(|e| {
                        HydrosError::Validation(format!(
                            "invalid registry pattern '{}': {}",
                            c.pattern, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            client,
            credentials,
            tokens: Mutex::new(HashMap::new()),
            digests: Mutex::new(HashMap::new()),
        })
    }

    fn digest(&self, image: &DockerImageRef, reference: &str) -> Result<String> {
        let (host, repo) = api_location(image);
        let url = format!("{}/v2/{}/manifests/{}", base_url(&host), repo, reference);

        if let Some(digest) = lock(&self.digests).get(&url) {
            return Ok(digest.clone());
        }

        let response = self.send(&host, &repo, |c| c.head(&url).header(ACCEPT, MANIFEST_ACCEPT))?;
        if !response.status().is_success() {
            return Err(HydrosError::Registry(format!(
                "{}:{}: manifest lookup returned {}",
                image.name(),
                reference,
                response.status()
            )));
        }

        let digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                HydrosError::Registry(format!(
                    "{}:{}: registry did not return {}",
                    image.name(),
                    reference,
                    DIGEST_HEADER
                ))
            })?;

        lock(&self.digests).insert(url, digest.clone());
        Ok(digest)
    }

    fn list_tags(&self, image: &DockerImageRef) -> Result<Vec<String>> {
        let (host, repo) = api_location(image);
        let url = format!("{}/v2/{}/tags/list", base_url(&host), repo);
        let response = self.send(&host, &repo, |c| c.get(&url))?;
        if !response.status().is_success() {
            return Err(HydrosError::Registry(format!(
                "{}: tag listing returned {}",
                image.name(),
                response.status()
            )));
        }
        let list: TagList = response
            .json()
            .map_err(|e| HydrosError::Registry(format!("{}: bad tag list: {}", image.name(), e)))?;
        Ok(list.tags.unwrap_or_default())
    }

    /// Sends a request, answering one bearer challenge if the registry asks.
    fn send<F>(&self, host: &str, repo: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let scope = format!("repository:{}:pull", repo);
        let cached = lock(&self.tokens).get(&scope).cloned();

        let mut request = build(&self.client);
        if let Some(token) = &cached {
            request = request.bearer_auth(token);
        }
        let response = request.send().map_err(registry_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| HydrosError::Registry(format!("{}: unauthorized", host)))?;

        let token = self.fetch_token(host, &challenge, &scope)?;
        lock(&self.tokens).insert(scope, token.clone());

        build(&self.client)
            .bearer_auth(token)
            .send()
            .map_err(registry_error)
    }

    fn fetch_token(&self, host: &str, challenge: &str, scope: &str) -> Result<String> {
        let params = parse_challenge(challenge).ok_or_else(|| {
            HydrosError::Registry(format!("{}: unsupported auth challenge '{}'", host, challenge))
        })?;
        let realm = params
            .get("realm")
            .ok_or_else(|| HydrosError::Registry(format!("{}: challenge without realm", host)))?;

        let mut query = vec![("scope", params.get("scope").map(String::as_str).unwrap_or(scope))];
        if let Some(service) = params.get("service") {
            query.push(("service", service.as_str()));
        }

        let mut request = self.client.get(realm.as_str()).query(&query);
        if let Some(creds) = self.credentials_for(host)? {
            request = request.basic_auth(creds.username, Some(creds.password.expose_secret()));
        }

        let response = request.send().map_err(registry_error)?;
        if !response.status().is_success() {
            return Err(HydrosError::Registry(format!(
                "{}: token endpoint returned {}",
                host,
                response.status()
            )));
        }
        let body: TokenResponse = response
            .json()
            .map_err(|e| HydrosError::Registry(format!("{}: bad token response: {}", host, e)))?;

        body.token
            .or(body.access_token)
            .ok_or_else(|| HydrosError::Registry(format!("{}: token response without token", host)))
    }

    fn credentials_for(&self, host: &str) -> Result<Option<Credentials>> {
        if let Some((_, cred)) = self.credentials.iter().find(|(r, _)| r.is_match(host)) {
            let password = resolve_secret_optional(
                None,
                cred.password_file.as_deref(),
                cred.password_env_var.as_deref(),
            )?;
            let username = match cred.username_env_var.as_deref() {
                Some(var) => std::env::var(var).unwrap_or_default(),
                None => String::new(),
            };
            return Ok(password.map(|password| Credentials {
                username: if username.is_empty() {
                    "oauth2accesstoken".to_string()
                } else {
                    username
                },
                password,
            }));
        }
        Ok(docker_config_credentials(host))
    }
}

impl Resolver for OciResolver {
    fn resolve(&self, image: &DockerImageRef, strategy: Strategy) -> Result<DockerImageRef> {
        match strategy {
            Strategy::MutableTag | Strategy::SourceCommit => {}
            other => {
                return Err(HydrosError::UnsupportedStrategy {
                    strategy: other.to_string(),
                    registry: registry_host(image).to_string(),
                })
            }
        }
        let tag = if image.tag.is_empty() {
            "latest"
        } else {
            image.tag.as_str()
        };
        let digest = self.digest(image, tag)?;
        Ok(image.with_tag(tag).with_sha(digest))
    }

    fn tags_for_digest(&self, image: &DockerImageRef) -> Result<Vec<String>> {
        if image.sha.is_empty() {
            return Ok(Vec::new());
        }
        let mut matching = Vec::new();
        for tag in self.list_tags(image)?.into_iter().take(MAX_TAG_LOOKUPS) {
            if self.digest(image, &tag)? == image.sha {
                matching.push(tag);
            }
        }
        Ok(matching)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn registry_error(e: reqwest::Error) -> HydrosError {
    HydrosError::Registry(e.to_string())
}

/// API host and repository path, with Docker Hub's aliases expanded.
fn api_location(image: &DockerImageRef) -> (String, String) {
    let host = registry_host(image);
    if host == DEFAULT_REGISTRY || host == "index.docker.io" {
        let repo = if image.repo.contains('/') {
            image.repo.clone()
        } else {
            format!("library/{}", image.repo)
        };
        (DOCKER_HUB_API_HOST.to_string(), repo)
    } else {
        (host.to_string(), image.repo.clone())
    }
}

fn base_url(host: &str) -> String {
    let plain = host.starts_with("localhost") || host.starts_with("127.0.0.1");
    format!("{}://{}", if plain { "http" } else { "https" }, host)
}

fn parse_challenge(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let params: HashMap<String, String> = CHALLENGE_PARAM
        .captures_iter(rest)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();
    (!params.is_empty()).then_some(params)
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
}

/// Credentials from `~/.docker/config.json`, if the host has an inline entry.
fn docker_config_credentials(host: &str) -> Option<Credentials> {
    let path = dirs::home_dir()?.join(".docker").join("config.json");
    let content = std::fs::read_to_string(path).ok()?;
    credentials_from_docker_config(&content, host)
}

fn credentials_from_docker_config(content: &str, host: &str) -> Option<Credentials> {
    let config: DockerConfig = serde_json::from_str(content).ok()?;
    let encoded = config
        .auths
        .iter()
        .find(|(key, _)| {
            let key = key.trim_start_matches("https://").trim_start_matches("http://");
            key == host || key.starts_with(&format!("{}/", host))
        })
        .and_then(|(_, auth)| auth.auth.clone())?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials {
        username: username.to_string(),
        password: SecretString::from(password.to_string()),
    })
}
