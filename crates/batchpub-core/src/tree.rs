//! Non-destructive tree merge.
//!
//! Staged files are grouped into a [`TreeOverlay`] (a nested map of path
//! segments to blob ids). [`merge_tree`] walks the overlay alongside the
//! branch's current tree, one level at a time:
//!
//! ```text
//! head tree            overlay                 merged tree
//! ├── a.txt            ├── b.txt  (v2)         ├── a.txt  (unchanged sha)
//! ├── b.txt            └── docs/               ├── b.txt  (v2)
//! └── docs/                └── new.md          └── docs/  (new tree)
//!     └── guide.md                                 ├── guide.md
//!                                                  └── new.md
//! ```
//!
//! Only levels that contain a staged path are read and rewritten; every
//! other subtree keeps its existing id.

use std::collections::BTreeMap;

use batchpub_github::{EntryMode, GitHost, ObjectId, RepoSession, TreeEntry};
use futures::future::{BoxFuture, FutureExt};

use crate::error::{CommitError, CommitResult};

/// A validated destination path inside the repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoPath {
    raw: String,
}

impl RepoPath {
    /// Accepts relative `/`-separated paths without empty, `.` or `..`
    /// segments.
    pub fn parse(raw: &str) -> CommitResult<Self> {
        let reject = |reason: &str| Err(CommitError::asset_integrity(Some(raw), reason));
        if raw.is_empty() {
            return reject("repository path is empty");
        }
        if raw.starts_with('/') {
            return reject("repository path must be relative");
        }
        if raw.contains('\0') || raw.contains('\\') {
            return reject("repository path contains a forbidden character");
        }
        for segment in raw.split('/') {
            match segment {
                "" => return reject("repository path has an empty segment"),
                "." | ".." => return reject("repository path has a relative segment"),
                ".git" => return reject("repository path points into .git"),
                _ => {}
            }
        }
        Ok(Self {
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw.split('/')
    }
}

impl std::fmt::Display for RepoPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Blob(ObjectId),
    Dir(BTreeMap<String, Node>),
}

/// Staged paths grouped by directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeOverlay {
    root: BTreeMap<String, Node>,
    files: usize,
}

impl TreeOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `blob` at `path`. Two staged files at the same path, or one
    /// staged file nested under another, are rejected.
    pub fn insert(&mut self, path: &RepoPath, blob: ObjectId) -> CommitResult<()> {
        let segments: Vec<&str> = path.segments().collect();
        let (leaf, parents) = segments
            .split_last()
            .ok_or_else(|| CommitError::asset_integrity(Some(path.as_str()), "empty path"))?;

        let mut level = &mut self.root;
        for segment in parents {
            let node = level
                .entry(segment.to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            level = match node {
                Node::Dir(children) => children,
                Node::Blob(_) => {
                    return Err(CommitError::asset_integrity(
                        Some(path.as_str()),
                        "another staged file occupies a parent directory",
                    ))
                }
            };
        }

        match level.get(*leaf) {
            Some(Node::Blob(_)) => Err(CommitError::asset_integrity(
                Some(path.as_str()),
                "path is staged more than once in this batch",
            )),
            Some(Node::Dir(_)) => Err(CommitError::asset_integrity(
                Some(path.as_str()),
                "other staged files live under this path",
            )),
            None => {
                level.insert(leaf.to_string(), Node::Blob(blob));
                self.files += 1;
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files == 0
    }
}

/// Write the trees for `base` with `overlay` applied and return the new
/// root tree id. Returns `base` itself when nothing changes.
pub async fn merge_tree(
    host: &dyn GitHost,
    session: &RepoSession,
    base: &ObjectId,
    overlay: &TreeOverlay,
) -> CommitResult<ObjectId> {
    merge_level(host, session, Some(base.clone()), &overlay.root, String::new()).await
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn merge_level<'a>(
    host: &'a dyn GitHost,
    session: &'a RepoSession,
    base: Option<ObjectId>,
    overlay: &'a BTreeMap<String, Node>,
    prefix: String,
) -> BoxFuture<'a, CommitResult<ObjectId>> {
    async move {
        let mut entries: BTreeMap<String, TreeEntry> = match &base {
            Some(tree) => host
                .read_tree(session, tree)
                .await?
                .into_iter()
                .map(|e| (e.name.clone(), e))
                .collect(),
            None => BTreeMap::new(),
        };
        let mut changed = base.is_none();

        for (name, node) in overlay {
            let path = join(&prefix, name);
            let existing = entries.get(name);
            let entry = match node {
                Node::Blob(sha) => {
                    let mode = match existing.map(|e| e.mode) {
                        Some(EntryMode::Tree) => {
                            return Err(CommitError::asset_integrity(
                                Some(&path),
                                "an existing directory occupies this path",
                            ))
                        }
                        Some(EntryMode::Submodule) => {
                            return Err(CommitError::asset_integrity(
                                Some(&path),
                                "an existing submodule occupies this path",
                            ))
                        }
                        Some(EntryMode::Executable) => EntryMode::Executable,
                        _ => EntryMode::File,
                    };
                    TreeEntry {
                        name: name.clone(),
                        mode,
                        sha: sha.clone(),
                    }
                }
                Node::Dir(children) => {
                    let child_base = match existing {
                        Some(e) if e.mode.is_tree() => Some(e.sha.clone()),
                        Some(_) => {
                            return Err(CommitError::asset_integrity(
                                Some(&path),
                                "an existing file occupies a parent directory",
                            ))
                        }
                        None => None,
                    };
                    let sha = merge_level(host, session, child_base, children, path).await?;
                    TreeEntry {
                        name: name.clone(),
                        mode: EntryMode::Tree,
                        sha,
                    }
                }
            };
            if entries.get(name) != Some(&entry) {
                changed = true;
                entries.insert(name.clone(), entry);
            }
        }

        match base {
            Some(tree) if !changed => Ok(tree),
            _ => {
                let level: Vec<TreeEntry> = entries.into_values().collect();
                Ok(host.create_tree(session, &level).await?)
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchpub_github::fake::FakeGitHost;
    use batchpub_github::{InstallationToken, RepoName};
    use secrecy::SecretString;

    const REPO: &str = "acme/site";

    fn session() -> RepoSession {
        let token = InstallationToken {
            token: SecretString::from("ghs_test"),
            expires_at: chrono::Utc::now(),
            installation_id: 1,
        };
        RepoSession::new(RepoName::parse(REPO).unwrap(), &token)
    }

    async fn overlay_of(host: &FakeGitHost, files: &[(&str, &[u8])]) -> TreeOverlay {
        let mut overlay = TreeOverlay::new();
        for (path, content) in files {
            let blob = host.create_blob(&session(), content).await.unwrap();
            overlay.insert(&RepoPath::parse(path).unwrap(), blob).unwrap();
        }
        overlay
    }

    async fn root_tree(host: &FakeGitHost) -> ObjectId {
        let head = host.head_of(REPO, "main").unwrap();
        host.commit_tree(&session(), &head).await.unwrap()
    }

    #[test]
    fn repo_path_rejects_unsafe_forms() {
        for bad in ["", "/abs.txt", "a//b", "a/./b", "../up", "dir/", ".git/config", "a\\b"] {
            assert!(RepoPath::parse(bad).is_err(), "{bad:?} should be rejected");
        }
        let ok = RepoPath::parse("static/img/logo.png").unwrap();
        assert_eq!(ok.segments().collect::<Vec<_>>(), ["static", "img", "logo.png"]);
    }

    #[test]
    fn overlay_rejects_duplicates_and_file_dir_clashes() {
        let blob = ObjectId::try_from("a".repeat(40)).unwrap();
        let mut overlay = TreeOverlay::new();
        overlay
            .insert(&RepoPath::parse("docs/a.md").unwrap(), blob.clone())
            .unwrap();
        assert!(overlay
            .insert(&RepoPath::parse("docs/a.md").unwrap(), blob.clone())
            .is_err());
        assert!(overlay
            .insert(&RepoPath::parse("docs").unwrap(), blob.clone())
            .is_err());
        assert!(overlay
            .insert(&RepoPath::parse("docs/a.md/b").unwrap(), blob)
            .is_err());
        assert_eq!(overlay.len(), 1);
    }

    #[tokio::test]
    async fn merge_keeps_unstaged_paths() {
        let host = FakeGitHost::new();
        host.seed_branch(REPO, "main", &[("a.txt", b"a"), ("b.txt", b"b")]);
        let base = root_tree(&host).await;
        let overlay = overlay_of(&host, &[("b.txt", b"v2"), ("c.txt", b"new")]).await;

        let merged = merge_tree(&host, &session(), &base, &overlay).await.unwrap();
        let names: Vec<String> = host
            .read_tree(&session(), &merged)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["a.txt", "b.txt", "c.txt"]);
    }

    #[tokio::test]
    async fn merge_synthesizes_intermediate_directories() {
        let host = FakeGitHost::new();
        host.seed_branch(REPO, "main", &[("docs/guide.md", b"guide")]);
        let base = root_tree(&host).await;
        let overlay = overlay_of(
            &host,
            &[("docs/new.md", b"new"), ("static/img/logo.png", b"png")],
        )
        .await;

        let merged = merge_tree(&host, &session(), &base, &overlay).await.unwrap();
        let root = host.read_tree(&session(), &merged).await.unwrap();
        let docs = root.iter().find(|e| e.name == "docs").unwrap();
        let docs_entries: Vec<String> = host
            .read_tree(&session(), &docs.sha)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(docs_entries, ["guide.md", "new.md"]);
        assert!(root
            .iter()
            .any(|e| e.name == "static" && e.mode == EntryMode::Tree));
    }

    #[tokio::test]
    async fn untouched_subtrees_keep_their_ids() {
        let host = FakeGitHost::new();
        host.seed_branch(REPO, "main", &[("vendor/lib.js", b"lib"), ("index.html", b"v1")]);
        let base = root_tree(&host).await;
        let before = host.read_tree(&session(), &base).await.unwrap();
        let overlay = overlay_of(&host, &[("index.html", b"v2")]).await;

        let merged = merge_tree(&host, &session(), &base, &overlay).await.unwrap();
        let after = host.read_tree(&session(), &merged).await.unwrap();
        let vendor = |entries: &[TreeEntry]| {
            entries
                .iter()
                .find(|e| e.name == "vendor")
                .map(|e| e.sha.clone())
        };
        assert_eq!(vendor(&before), vendor(&after));
    }

    #[tokio::test]
    async fn identical_content_yields_the_base_tree() {
        let host = FakeGitHost::new();
        host.seed_branch(REPO, "main", &[("a.txt", b"same")]);
        let base = root_tree(&host).await;
        let overlay = overlay_of(&host, &[("a.txt", b"same")]).await;
        let merged = merge_tree(&host, &session(), &base, &overlay).await.unwrap();
        assert_eq!(merged, base);
    }

    #[tokio::test]
    async fn executable_bit_is_preserved() {
        let host = FakeGitHost::new();
        host.seed_branch_with_modes(REPO, "main", &[("run.sh", b"#!/bin/sh\n", EntryMode::Executable)]);
        let base = root_tree(&host).await;
        let overlay = overlay_of(&host, &[("run.sh", b"#!/bin/sh\necho hi\n")]).await;
        let merged = merge_tree(&host, &session(), &base, &overlay).await.unwrap();
        let entries = host.read_tree(&session(), &merged).await.unwrap();
        assert_eq!(entries[0].mode, EntryMode::Executable);
    }

    #[tokio::test]
    async fn staging_under_an_existing_file_is_rejected() {
        let host = FakeGitHost::new();
        host.seed_branch(REPO, "main", &[("docs", b"not a dir")]);
        let base = root_tree(&host).await;
        let overlay = overlay_of(&host, &[("docs/a.md", b"a")]).await;
        let err = merge_tree(&host, &session(), &base, &overlay)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::AssetIntegrity { path: Some(p), .. } if p == "docs"));
    }

    #[tokio::test]
    async fn staging_over_an_existing_directory_is_rejected() {
        let host = FakeGitHost::new();
        host.seed_branch(REPO, "main", &[("docs/a.md", b"a")]);
        let base = root_tree(&host).await;
        let overlay = overlay_of(&host, &[("docs", b"file")]).await;
        assert!(matches!(
            merge_tree(&host, &session(), &base, &overlay).await,
            Err(CommitError::AssetIntegrity { .. })
        ));
    }
}
