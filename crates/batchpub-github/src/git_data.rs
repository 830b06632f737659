//! Git data model and the `GitHost` seam.
//!
//! `GitHost` covers exactly what a single "update these paths on this
//! branch" commit needs: read the head, read trees, write blobs, trees and
//! commits, and fast-forward the branch.

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::GitHubError;
use crate::token::InstallationToken;

/// Result type for Git host operations
pub type GitResult<T> = std::result::Result<T, GitHubError>;

/// Hex object id (40 chars for SHA-1 repositories, 64 for SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ObjectId {
    type Error = GitHubError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if !(s.len() == 40 || s.len() == 64) || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(GitHubError::InvalidObjectId(s));
        }
        Ok(ObjectId(s.to_ascii_lowercase()))
    }
}

impl TryFrom<&str> for ObjectId {
    type Error = GitHubError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        ObjectId::try_from(s.to_string())
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `owner/repo`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoName {
    pub owner: String,
    pub name: String,
}

impl RepoName {
    pub fn parse(full_name: &str) -> GitResult<Self> {
        let invalid = || GitHubError::InvalidInput {
            field: "repo_full_name".to_string(),
            reason: format!("expected owner/repo, got {full_name:?}"),
        };
        let (owner, name) = full_name.split_once('/').ok_or_else(invalid)?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for RepoName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A repository plus the installation token that grants access to it.
#[derive(Debug, Clone)]
pub struct RepoSession {
    pub repo: RepoName,
    pub(crate) token: SecretString,
}

impl RepoSession {
    pub fn new(repo: RepoName, token: &InstallationToken) -> Self {
        Self {
            repo,
            token: token.token.clone(),
        }
    }
}

/// File mode of a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryMode {
    File,
    Executable,
    Symlink,
    Tree,
    Submodule,
}

impl EntryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryMode::File => "100644",
            EntryMode::Executable => "100755",
            EntryMode::Symlink => "120000",
            EntryMode::Tree => "040000",
            EntryMode::Submodule => "160000",
        }
    }

    /// Object type the entry points at.
    pub fn object_type(&self) -> &'static str {
        match self {
            EntryMode::File | EntryMode::Executable | EntryMode::Symlink => "blob",
            EntryMode::Tree => "tree",
            EntryMode::Submodule => "commit",
        }
    }

    pub fn parse(mode: &str) -> GitResult<Self> {
        match mode {
            "100644" => Ok(EntryMode::File),
            "100755" => Ok(EntryMode::Executable),
            "120000" => Ok(EntryMode::Symlink),
            "040000" | "40000" => Ok(EntryMode::Tree),
            "160000" => Ok(EntryMode::Submodule),
            other => Err(GitHubError::Decode {
                operation: "parse tree entry".to_string(),
                message: format!("unknown mode {other}"),
            }),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, EntryMode::Tree)
    }

    /// Regular or executable file content (symlinks excluded).
    pub fn is_file(&self) -> bool {
        matches!(self, EntryMode::File | EntryMode::Executable)
    }
}

/// One entry of a single tree level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Single path segment
    pub name: String,
    pub mode: EntryMode,
    pub sha: ObjectId,
}

/// Author/committer identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// A commit to create. The identity is used as both author and committer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCommit {
    pub message: String,
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Identity,
}

/// Git data operations on one repository.
///
/// Guarantees:
/// - `create_blob` is idempotent by content: the same bytes always yield
///   the same id, and re-creating an existing blob succeeds.
/// - Trees and commits are immutable once created.
/// - `fast_forward` only moves `branch` from `expected` to `new`; if the
///   branch points anywhere else it fails with `GitHubError::RefConflict`
///   and leaves the branch untouched.
#[async_trait]
pub trait GitHost: Send + Sync {
    /// Commit the branch currently points at.
    async fn branch_head(&self, session: &RepoSession, branch: &str) -> GitResult<ObjectId>;

    /// Root tree of a commit.
    async fn commit_tree(&self, session: &RepoSession, commit: &ObjectId) -> GitResult<ObjectId>;

    /// Entries of one tree level (not recursive).
    async fn read_tree(&self, session: &RepoSession, tree: &ObjectId) -> GitResult<Vec<TreeEntry>>;

    async fn create_blob(&self, session: &RepoSession, content: &[u8]) -> GitResult<ObjectId>;

    /// Create a tree level holding exactly `entries`.
    async fn create_tree(&self, session: &RepoSession, entries: &[TreeEntry])
        -> GitResult<ObjectId>;

    async fn create_commit(&self, session: &RepoSession, commit: &NewCommit)
        -> GitResult<ObjectId>;

    async fn fast_forward(
        &self,
        session: &RepoSession,
        branch: &str,
        expected: &ObjectId,
        new: &ObjectId,
    ) -> GitResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_accepts_sha1_and_sha256_lengths() {
        assert!(ObjectId::try_from("a".repeat(40)).is_ok());
        assert!(ObjectId::try_from("b".repeat(64)).is_ok());
        assert!(ObjectId::try_from("c".repeat(39)).is_err());
        assert!(ObjectId::try_from("z".repeat(40)).is_err());
    }

    #[test]
    fn object_id_normalizes_case() {
        let id = ObjectId::try_from("ABCDEF0123456789ABCDEF0123456789ABCDEF01").unwrap();
        assert_eq!(id.as_str(), "abcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(id.short(), "abcdef012345");
    }

    #[test]
    fn repo_name_requires_owner_and_name() {
        let repo = RepoName::parse("acme/site").unwrap();
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.name, "site");
        assert_eq!(repo.to_string(), "acme/site");

        assert!(RepoName::parse("acme").is_err());
        assert!(RepoName::parse("/site").is_err());
        assert!(RepoName::parse("acme/site/extra").is_err());
    }

    #[test]
    fn entry_modes_map_to_object_types() {
        for mode in ["100644", "100755", "120000", "040000", "160000"] {
            let parsed = EntryMode::parse(mode).unwrap();
            assert_eq!(parsed.as_str(), mode);
        }
        assert_eq!(EntryMode::parse("40000").unwrap(), EntryMode::Tree);
        assert_eq!(EntryMode::Submodule.object_type(), "commit");
        assert_eq!(EntryMode::Symlink.object_type(), "blob");
        assert!(!EntryMode::Symlink.is_file());
        assert!(EntryMode::parse("100664").is_err());
    }
}
