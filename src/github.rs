use std::env;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

const USER_AGENT: &str = "respawnboard-proxy";
const REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BRANCH: &str = "main";

// Writable files live under public/ and must be JSON; a bare "name.json"
// is accepted and prefixed. Everything else, including traversal, is refused.
static ALLOWED_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^public/[A-Za-z0-9._\-/]+\.json$").expect("allowed path pattern"));
static BARE_JSON_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._\-/]+\.json$").expect("bare path pattern"));

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("path not allowed: {path}")]
    PathNotAllowed { path: String },

    #[error("missing configuration: {missing}")]
    MissingConfig { missing: String },

    #[error("github {step} failed: HTTP {status}: {detail}")]
    Upstream {
        step: &'static str,
        status: u16,
        detail: String,
    },

    #[error("github request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub token: String,
}

impl GitHubConfig {
    /// Read GH_OWNER / GH_REPO / GH_TOKEN (required) and GH_BRANCH
    /// (default "main") from the environment, reporting every missing
    /// variable at once.
    pub fn from_env() -> Result<Self, GitHubError> {
        let mut missing = Vec::new();
        let token = env_nonempty("GH_TOKEN");
        if token.is_none() {
            missing.push("GH_TOKEN");
        }
        let owner = env_nonempty("GH_OWNER");
        if owner.is_none() {
            missing.push("GH_OWNER");
        }
        let repo = env_nonempty("GH_REPO");
        if repo.is_none() {
            missing.push("GH_REPO");
        }
        if !missing.is_empty() {
            return Err(GitHubError::MissingConfig {
                missing: missing.join(", "),
            });
        }

        Ok(Self {
            owner: owner.unwrap_or_default(),
            repo: repo.unwrap_or_default(),
            branch: env_nonempty("GH_BRANCH").unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            token: token.unwrap_or_default(),
        })
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EnvPresence {
    pub owner: bool,
    pub repo: bool,
    pub branch: bool,
    pub token_present: bool,
}

pub fn env_presence() -> EnvPresence {
    EnvPresence {
        owner: env_nonempty("GH_OWNER").is_some(),
        repo: env_nonempty("GH_REPO").is_some(),
        branch: env_nonempty("GH_BRANCH").is_some(),
        token_present: env_nonempty("GH_TOKEN").is_some_and(|token| token.len() > 10),
    }
}

/// Comma-separated ALLOWED_ORIGIN list; empty means "any origin".
pub fn allowed_origins_from_env() -> Vec<String> {
    parse_allowed_origins(&env::var("ALLOWED_ORIGIN").unwrap_or_default())
}

pub fn parse_allowed_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn is_allowed_path(path: &str) -> bool {
    !path.contains("..") && ALLOWED_PATH.is_match(path)
}

/// Validate a save path, auto-prefixing a bare "name.json" with "public/".
pub fn normalize_save_path(path: &str) -> Result<String, GitHubError> {
    let trimmed = path.trim();
    if is_allowed_path(trimmed) {
        return Ok(trimmed.to_string());
    }
    let bare = trimmed.trim_start_matches('/');
    if !bare.contains("..") && BARE_JSON_PATH.is_match(bare) {
        let prefixed = format!("public/{bare}");
        if is_allowed_path(&prefixed) {
            return Ok(prefixed);
        }
    }
    Err(GitHubError::PathNotAllowed {
        path: trimmed.to_string(),
    })
}

/// Commit messages carry a " [skip ci]" marker so roster saves never spend
/// CI minutes; already-marked messages pass through unchanged.
pub fn ensure_skip_ci(message: &str) -> String {
    if message.to_ascii_lowercase().contains("[skip ci]") {
        message.to_string()
    } else {
        format!("{message} [skip ci]")
    }
}

/// Fine-grained tokens want the Bearer scheme; classic PATs use the legacy
/// token scheme.
pub fn auth_header(token: &str) -> String {
    let token = token.trim();
    let scheme = if token.starts_with("github_pat_") {
        "Bearer"
    } else {
        "token"
    };
    format!("{scheme} {token}")
}

#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub path: String,
    pub commit: Option<String>,
}

pub struct GitHubClient {
    config: GitHubConfig,
    http: reqwest::blocking::Client,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig) -> Result<Self, GitHubError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> Result<Self, GitHubError> {
        Self::new(GitHubConfig::from_env()?)
    }

    fn contents_url(&self, path: &str) -> String {
        format!(
            "https://api.github.com/repos/{}/{}/contents/{}",
            self.config.owner, self.config.repo, path
        )
    }

    /// Raw text of a repository file on the configured branch.
    pub fn read(&self, path: &str) -> Result<String, GitHubError> {
        if !is_allowed_path(path) {
            return Err(GitHubError::PathNotAllowed {
                path: path.to_string(),
            });
        }

        let response = self
            .http
            .get(format!(
                "{}?ref={}",
                self.contents_url(path),
                self.config.branch
            ))
            .header("Authorization", auth_header(&self.config.token))
            .header("Accept", "application/vnd.github.v3.raw")
            .send()?;

        let status = response.status();
        let body = response.text().unwrap_or_default();
        if !status.is_success() {
            return Err(GitHubError::Upstream {
                step: "read",
                status: status.as_u16(),
                detail: body,
            });
        }
        Ok(body)
    }

    fn blob_sha(&self, path: &str) -> Result<Option<String>, GitHubError> {
        let response = self
            .http
            .get(format!(
                "{}?ref={}",
                self.contents_url(path),
                self.config.branch
            ))
            .header("Authorization", auth_header(&self.config.token))
            .header("Accept", "application/vnd.github+json")
            .send()?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // The file does not exist yet; the save becomes a create.
            return Ok(None);
        }
        let body = response.text().unwrap_or_default();
        if !status.is_success() {
            return Err(GitHubError::Upstream {
                step: "get sha",
                status: status.as_u16(),
                detail: body,
            });
        }
        let meta = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
        Ok(meta
            .get("sha")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Read-modify-write against the Contents API: fetch the current blob
    /// sha (absent for new files), then PUT base64 content. The storage
    /// system rejects the PUT when the sha is stale, which surfaces as an
    /// upstream error; there is no client-side retry or merge.
    pub fn save(
        &self,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<SaveOutcome, GitHubError> {
        let path = normalize_save_path(path)?;
        let sha = self.blob_sha(&path)?;

        let mut payload = json!({
            "message": ensure_skip_ci(message),
            "content": BASE64.encode(content),
            "branch": self.config.branch,
        });
        if let Some(sha) = sha {
            payload["sha"] = Value::String(sha);
        }

        let response = self
            .http
            .put(self.contents_url(&path))
            .header("Authorization", auth_header(&self.config.token))
            .header("Accept", "application/vnd.github+json")
            .json(&payload)
            .send()?;

        let status = response.status();
        let body = response.text().unwrap_or_default();
        if !status.is_success() {
            return Err(GitHubError::Upstream {
                step: "put content",
                status: status.as_u16(),
                detail: body,
            });
        }

        let result = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
        let commit = result
            .pointer("/commit/sha")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(SaveOutcome { path, commit })
    }

    /// Committer date of the newest commit touching the path, or None when
    /// the history cannot be read (the caller degrades its display).
    pub fn last_commit_time(&self, path: &str) -> Result<Option<String>, GitHubError> {
        let url = format!(
            "https://api.github.com/repos/{}/{}/commits?path={}&page=1&per_page=1",
            self.config.owner, self.config.repo, path
        );
        let response = self
            .http
            .get(url)
            .header("Authorization", auth_header(&self.config.token))
            .header("Accept", "application/vnd.github+json")
            .send()?;

        if !response.status().is_success() {
            return Ok(None);
        }
        let commits = response.json::<Value>().unwrap_or(Value::Null);
        Ok(commits
            .get(0)
            .and_then(|commit| commit.pointer("/commit/committer/date"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_paths_are_public_json_only() {
        assert!(is_allowed_path("public/data.json"));
        assert!(is_allowed_path("public/nested/dir/list.json"));
        assert!(!is_allowed_path("data.json"));
        assert!(!is_allowed_path("public/data.txt"));
        assert!(!is_allowed_path("public/../secrets.json"));
        assert!(!is_allowed_path("src/main.rs"));
        assert!(!is_allowed_path(""));
    }

    #[test]
    fn bare_json_paths_gain_the_public_prefix() {
        assert_eq!(
            normalize_save_path("data.json").expect("allowed"),
            "public/data.json"
        );
        assert_eq!(
            normalize_save_path("/boss-list.json").expect("allowed"),
            "public/boss-list.json"
        );
        assert_eq!(
            normalize_save_path(" public/data.json ").expect("allowed"),
            "public/data.json"
        );
    }

    #[test]
    fn traversal_and_non_json_paths_are_refused() {
        assert!(normalize_save_path("../public/data.json").is_err());
        assert!(normalize_save_path("public/../../etc/passwd.json").is_err());
        assert!(normalize_save_path("notes.txt").is_err());
        assert!(normalize_save_path("").is_err());
    }

    #[test]
    fn skip_ci_marker_is_appended_once() {
        assert_eq!(ensure_skip_ci("update roster"), "update roster [skip ci]");
        assert_eq!(
            ensure_skip_ci("update roster [skip ci]"),
            "update roster [skip ci]"
        );
        assert_eq!(
            ensure_skip_ci("update roster [SKIP CI]"),
            "update roster [SKIP CI]"
        );
    }

    #[test]
    fn token_scheme_depends_on_token_flavor() {
        assert_eq!(
            auth_header("github_pat_abc123"),
            "Bearer github_pat_abc123"
        );
        assert_eq!(auth_header("ghp_classic"), "token ghp_classic");
        assert_eq!(auth_header("  ghp_classic  "), "token ghp_classic");
    }

    #[test]
    fn allowed_origin_list_parses_and_trims() {
        assert!(parse_allowed_origins("").is_empty());
        assert_eq!(
            parse_allowed_origins("https://a.example, https://b.example ,"),
            vec!["https://a.example", "https://b.example"]
        );
    }
}
