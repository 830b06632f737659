//! `GitHost` over the GitHub REST Git data API.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::error::GitHubError;
use crate::git_data::*;
use crate::token::{DEFAULT_GITHUB_API_BASE_URL, GITHUB_API_VERSION};

/// Git data client. One instance serves any repository; access is scoped
/// by the token carried in each `RepoSession`.
pub struct GitHubGitHost {
    api_base_url: String,
    http_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ShaOnly {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: ShaOnly,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    tree: ShaOnly,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<WireTreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireTreeEntry {
    path: String,
    mode: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
}

impl GitHubGitHost {
    pub fn new(timeout: Duration) -> Result<Self, GitHubError> {
        Self::new_with_api_base_url(DEFAULT_GITHUB_API_BASE_URL, timeout)
    }

    pub fn new_with_api_base_url(
        api_base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GitHubError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15).min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| GitHubError::from_reqwest("build http client", e))?;
        Ok(Self {
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn request(
        &self,
        session: &RepoSession,
        method: Method,
        path: &str,
    ) -> reqwest::RequestBuilder {
        let url = format!(
            "{}/repos/{}/{}/{}",
            self.api_base_url, session.repo.owner, session.repo.name, path
        );
        self.http_client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", concat!("batchpub/", env!("CARGO_PKG_VERSION")))
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .bearer_auth(session.token.expose_secret())
    }

    async fn send(
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> GitResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| GitHubError::from_reqwest(operation, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unable to read response body".to_string());
        Err(GitHubError::Http {
            status: Some(status.as_u16()),
            message: format!("{operation}: {message}"),
        })
    }

    async fn json<T: DeserializeOwned>(
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> GitResult<T> {
        Self::send(operation, request)
            .await?
            .json()
            .await
            .map_err(|e| GitHubError::Decode {
                operation: operation.to_string(),
                message: e.to_string(),
            })
    }

    async fn created_sha(operation: &str, request: reqwest::RequestBuilder) -> GitResult<ObjectId> {
        let created: ShaOnly = Self::json(operation, request).await?;
        ObjectId::try_from(created.sha)
    }
}

#[async_trait]
impl GitHost for GitHubGitHost {
    #[instrument(skip(self, session), fields(repo = %session.repo))]
    async fn branch_head(&self, session: &RepoSession, branch: &str) -> GitResult<ObjectId> {
        let request = self.request(session, Method::GET, &format!("git/ref/heads/{branch}"));
        match Self::json::<RefResponse>("read branch head", request).await {
            Ok(r) => ObjectId::try_from(r.object.sha),
            // 409 is returned for an empty repository.
            Err(GitHubError::Http {
                status: Some(404 | 409),
                ..
            }) => Err(GitHubError::BranchNotFound {
                branch: branch.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn commit_tree(&self, session: &RepoSession, commit: &ObjectId) -> GitResult<ObjectId> {
        let request = self.request(session, Method::GET, &format!("git/commits/{commit}"));
        let response: CommitResponse = Self::json("read commit", request).await?;
        ObjectId::try_from(response.tree.sha)
    }

    async fn read_tree(&self, session: &RepoSession, tree: &ObjectId) -> GitResult<Vec<TreeEntry>> {
        let request = self.request(session, Method::GET, &format!("git/trees/{tree}"));
        let response: TreeResponse = Self::json("read tree", request).await?;
        if response.truncated {
            // Only possible for recursive listings; a single level is never cut.
            warn!(tree = %tree, "tree listing reported as truncated");
        }
        response
            .tree
            .into_iter()
            .map(|e| {
                Ok(TreeEntry {
                    name: e.path,
                    mode: EntryMode::parse(&e.mode)?,
                    sha: ObjectId::try_from(e.sha)?,
                })
            })
            .collect()
    }

    async fn create_blob(&self, session: &RepoSession, content: &[u8]) -> GitResult<ObjectId> {
        debug!(bytes = content.len(), "creating blob");
        let request = self
            .request(session, Method::POST, "git/blobs")
            .json(&json!({ "content": STANDARD.encode(content), "encoding": "base64" }));
        Self::created_sha("create blob", request).await
    }

    async fn create_tree(
        &self,
        session: &RepoSession,
        entries: &[TreeEntry],
    ) -> GitResult<ObjectId> {
        let tree: Vec<WireTreeEntry> = entries
            .iter()
            .map(|e| WireTreeEntry {
                path: e.name.clone(),
                mode: e.mode.as_str().to_string(),
                kind: e.mode.object_type().to_string(),
                sha: e.sha.to_string(),
            })
            .collect();
        let request = self
            .request(session, Method::POST, "git/trees")
            .json(&json!({ "tree": tree }));
        Self::created_sha("create tree", request).await
    }

    async fn create_commit(
        &self,
        session: &RepoSession,
        commit: &NewCommit,
    ) -> GitResult<ObjectId> {
        let identity = json!({
            "name": commit.author.name,
            "email": commit.author.email,
            "date": chrono::Utc::now().to_rfc3339(),
        });
        let request = self
            .request(session, Method::POST, "git/commits")
            .json(&json!({
                "message": commit.message,
                "tree": commit.tree,
                "parents": commit.parents,
                "author": identity,
                "committer": identity,
            }));
        Self::created_sha("create commit", request).await
    }

    #[instrument(skip(self, session), fields(repo = %session.repo))]
    async fn fast_forward(
        &self,
        session: &RepoSession,
        branch: &str,
        expected: &ObjectId,
        new: &ObjectId,
    ) -> GitResult<()> {
        let actual = self.branch_head(session, branch).await?;
        if &actual != expected {
            return Err(GitHubError::RefConflict {
                branch: branch.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        // force=false: the host refuses anything that is not a fast-forward,
        // which covers a push landing between the read above and this write.
        let request = self
            .request(session, Method::PATCH, &format!("git/refs/heads/{branch}"))
            .json(&json!({ "sha": new, "force": false }));
        match Self::send("update branch", request).await {
            Ok(_) => Ok(()),
            Err(GitHubError::Http {
                status: Some(code),
                message,
            }) if code == StatusCode::UNPROCESSABLE_ENTITY.as_u16()
                || code == StatusCode::CONFLICT.as_u16() =>
            {
                debug!(%message, "branch update rejected as non-fast-forward");
                Err(GitHubError::RefConflict {
                    branch: branch.to_string(),
                    expected: expected.to_string(),
                    actual: "unknown (moved concurrently)".to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let host =
            GitHubGitHost::new_with_api_base_url("https://ghe.example.com/api/v3/", Duration::from_secs(5))
                .unwrap();
        assert_eq!(host.api_base_url, "https://ghe.example.com/api/v3");
    }

    #[test]
    fn wire_tree_entry_uses_type_key() {
        let entry = WireTreeEntry {
            path: "docs".into(),
            mode: "040000".into(),
            kind: "tree".into(),
            sha: "a".repeat(40),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "tree");
        assert!(value.get("kind").is_none());
    }
}
