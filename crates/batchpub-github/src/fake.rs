//! In-memory Git host and token minter (testing only)
//!
//! `FakeGitHost` keeps a content-addressed object database per repository
//! and enforces the same `GitHost` contract as the real client: blobs are
//! deduplicated by content, trees may only reference existing objects, and
//! `fast_forward` is conditioned on the expected head. Tests can schedule
//! concurrent pushes and inject failures per operation.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use sha2::{Digest, Sha256};

use crate::error::GitHubError;
use crate::git_data::*;
use crate::token::{InstallationToken, TokenMinter};

/// Operations of the fake host that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    BranchHead,
    CommitTree,
    ReadTree,
    CreateBlob,
    CreateTree,
    CreateCommit,
    FastForward,
}

/// A commit stored by the fake host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCommit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub message: String,
    pub author: Identity,
}

#[derive(Debug, Default)]
struct RepoObjects {
    refs: HashMap<String, ObjectId>,
    blobs: HashMap<ObjectId, Vec<u8>>,
    trees: HashMap<ObjectId, Vec<TreeEntry>>,
    commits: HashMap<ObjectId, FakeCommit>,
}

#[derive(Debug, Default)]
struct FakeState {
    repos: HashMap<String, RepoObjects>,
    /// Pushes to land right before the next `fast_forward` calls
    pending_pushes: HashMap<(String, String), u32>,
    failures: HashMap<FakeOp, VecDeque<GitHubError>>,
}

#[derive(Debug, Default)]
struct Calls {
    create_blob: AtomicUsize,
    create_commit: AtomicUsize,
    fast_forward: AtomicUsize,
}

/// In-memory `GitHost`.
#[derive(Debug, Default)]
pub struct FakeGitHost {
    state: Mutex<FakeState>,
    calls: Calls,
}

fn object_id(kind: &str, body: &[u8]) -> ObjectId {
    let mut hasher = Sha256::new();
    hasher.update(format!("{kind} {}\0", body.len()).as_bytes());
    hasher.update(body);
    // Truncate to SHA-1 width so ids look like ordinary git ids.
    let hex = hex::encode(hasher.finalize());
    ObjectId::try_from(hex[..40].to_string()).expect("hex digest is a valid object id")
}

fn tree_body(entries: &[TreeEntry]) -> Vec<u8> {
    let mut body = Vec::new();
    for e in entries {
        body.extend_from_slice(format!("{} {}\0{}\n", e.mode.as_str(), e.name, e.sha).as_bytes());
    }
    body
}

fn commit_body(commit: &FakeCommit) -> Vec<u8> {
    let parents: Vec<&str> = commit.parents.iter().map(ObjectId::as_str).collect();
    format!(
        "tree {}\nparents {}\nauthor {} <{}>\n\n{}",
        commit.tree,
        parents.join(" "),
        commit.author.name,
        commit.author.email,
        commit.message
    )
    .into_bytes()
}

impl RepoObjects {
    fn put_blob(&mut self, content: &[u8]) -> ObjectId {
        let id = object_id("blob", content);
        self.blobs.entry(id.clone()).or_insert_with(|| content.to_vec());
        id
    }

    fn put_tree(&mut self, entries: &[TreeEntry]) -> ObjectId {
        let mut sorted = entries.to_vec();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        let id = object_id("tree", &tree_body(&sorted));
        self.trees.entry(id.clone()).or_insert(sorted);
        id
    }

    fn put_commit(&mut self, commit: FakeCommit) -> ObjectId {
        let id = object_id("commit", &commit_body(&commit));
        self.commits.entry(id.clone()).or_insert(commit);
        id
    }

    /// Build nested trees for a flat `path -> (content, mode)` listing.
    fn write_files(&mut self, files: &BTreeMap<String, (Vec<u8>, EntryMode)>) -> ObjectId {
        let mut here: Vec<TreeEntry> = Vec::new();
        let mut dirs: BTreeMap<String, BTreeMap<String, (Vec<u8>, EntryMode)>> = BTreeMap::new();
        for (path, (content, mode)) in files {
            match path.split_once('/') {
                Some((dir, rest)) => {
                    dirs.entry(dir.to_string())
                        .or_default()
                        .insert(rest.to_string(), (content.clone(), *mode));
                }
                None => {
                    let sha = self.put_blob(content);
                    here.push(TreeEntry {
                        name: path.clone(),
                        mode: *mode,
                        sha,
                    });
                }
            }
        }
        for (dir, children) in dirs {
            let sha = self.write_files(&children);
            here.push(TreeEntry {
                name: dir,
                mode: EntryMode::Tree,
                sha,
            });
        }
        self.put_tree(&here)
    }

    fn collect_files(&self, tree: &ObjectId, prefix: &str, out: &mut BTreeMap<String, Vec<u8>>) {
        let Some(entries) = self.trees.get(tree) else {
            return;
        };
        for e in entries {
            let path = format!("{prefix}{}", e.name);
            if e.mode.is_tree() {
                self.collect_files(&e.sha, &format!("{path}/"), out);
            } else if let Some(content) = self.blobs.get(&e.sha) {
                out.insert(path, content.clone());
            }
        }
    }

    fn has_object(&self, entry: &TreeEntry) -> bool {
        match entry.mode {
            EntryMode::Tree => self.trees.contains_key(&entry.sha),
            // Submodule commits live in another repository.
            EntryMode::Submodule => true,
            _ => self.blobs.contains_key(&entry.sha),
        }
    }
}

impl FakeGitHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) `branch` of `repo` with a single root commit holding
    /// `files` as regular files.
    pub fn seed_branch(&self, repo: &str, branch: &str, files: &[(&str, &[u8])]) -> ObjectId {
        let files: Vec<(&str, &[u8], EntryMode)> =
            files.iter().map(|(p, c)| (*p, *c, EntryMode::File)).collect();
        self.seed_branch_with_modes(repo, branch, &files)
    }

    /// Like `seed_branch`, with an explicit mode per file.
    pub fn seed_branch_with_modes(
        &self,
        repo: &str,
        branch: &str,
        files: &[(&str, &[u8], EntryMode)],
    ) -> ObjectId {
        let listing: BTreeMap<String, (Vec<u8>, EntryMode)> = files
            .iter()
            .map(|(p, c, m)| (p.to_string(), (c.to_vec(), *m)))
            .collect();
        let mut state = self.state.lock().unwrap();
        let objects = state.repos.entry(repo.to_string()).or_default();
        let tree = objects.write_files(&listing);
        let commit = objects.put_commit(FakeCommit {
            tree,
            parents: Vec::new(),
            message: "Initial commit".to_string(),
            author: Identity::new("seed", "seed@example.com"),
        });
        objects.refs.insert(branch.to_string(), commit.clone());
        commit
    }

    /// Current head of `branch`, bypassing the trait.
    pub fn head_of(&self, repo: &str, branch: &str) -> Option<ObjectId> {
        let state = self.state.lock().unwrap();
        state.repos.get(repo)?.refs.get(branch).cloned()
    }

    pub fn commit(&self, repo: &str, id: &ObjectId) -> Option<FakeCommit> {
        let state = self.state.lock().unwrap();
        state.repos.get(repo)?.commits.get(id).cloned()
    }

    /// Every file reachable from the head of `branch`, keyed by full path.
    pub fn files_at(&self, repo: &str, branch: &str) -> BTreeMap<String, Vec<u8>> {
        let state = self.state.lock().unwrap();
        let mut out = BTreeMap::new();
        if let Some(objects) = state.repos.get(repo) {
            if let Some(commit) = objects
                .refs
                .get(branch)
                .and_then(|head| objects.commits.get(head))
            {
                objects.collect_files(&commit.tree, "", &mut out);
            }
        }
        out
    }

    /// Mode of the entry at `path` under the head of `branch`.
    pub fn mode_at(&self, repo: &str, branch: &str, path: &str) -> Option<EntryMode> {
        let state = self.state.lock().unwrap();
        let objects = state.repos.get(repo)?;
        let head = objects.refs.get(branch)?;
        let mut tree = objects.commits.get(head)?.tree.clone();
        let segments: Vec<&str> = path.split('/').collect();
        for (i, segment) in segments.iter().enumerate() {
            let entry = objects
                .trees
                .get(&tree)?
                .iter()
                .find(|e| e.name == *segment)?
                .clone();
            if i + 1 == segments.len() {
                return Some(entry.mode);
            }
            tree = entry.sha;
        }
        None
    }

    /// Distinct blob objects stored for `repo`.
    pub fn blob_count(&self, repo: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.repos.get(repo).map_or(0, |r| r.blobs.len())
    }

    /// Distinct commit objects stored for `repo`.
    pub fn commit_count(&self, repo: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.repos.get(repo).map_or(0, |r| r.commits.len())
    }

    pub fn create_blob_calls(&self) -> usize {
        self.calls.create_blob.load(Ordering::SeqCst)
    }

    pub fn create_commit_calls(&self) -> usize {
        self.calls.create_commit.load(Ordering::SeqCst)
    }

    pub fn fast_forward_calls(&self) -> usize {
        self.calls.fast_forward.load(Ordering::SeqCst)
    }

    /// Land `count` foreign pushes on `branch`, one right before each of the
    /// next `count` `fast_forward` calls.
    pub fn schedule_concurrent_pushes(&self, repo: &str, branch: &str, count: u32) {
        let mut state = self.state.lock().unwrap();
        *state
            .pending_pushes
            .entry((repo.to_string(), branch.to_string()))
            .or_default() += count;
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: FakeOp, error: GitHubError) {
        let mut state = self.state.lock().unwrap();
        state.failures.entry(op).or_default().push_back(error);
    }

    fn take_failure(state: &mut FakeState, op: FakeOp) -> GitResult<()> {
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn with_repo<T>(
        &self,
        session: &RepoSession,
        op: FakeOp,
        f: impl FnOnce(&mut RepoObjects) -> GitResult<T>,
    ) -> GitResult<T> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, op)?;
        let objects = state
            .repos
            .get_mut(&session.repo.to_string())
            .ok_or_else(|| GitHubError::Http {
                status: Some(404),
                message: r#"{"message":"Not Found"}"#.to_string(),
            })?;
        f(objects)
    }

    fn land_foreign_push(objects: &mut RepoObjects, branch: &str) {
        let Some(head) = objects.refs.get(branch).cloned() else {
            return;
        };
        let Some(tree) = objects.commits.get(&head).map(|c| c.tree.clone()) else {
            return;
        };
        let pushed = objects.put_commit(FakeCommit {
            tree,
            parents: vec![head],
            message: format!("Concurrent push {}", Utc::now().timestamp_nanos_opt().unwrap_or(0)),
            author: Identity::new("someone-else", "someone@example.com"),
        });
        objects.refs.insert(branch.to_string(), pushed);
    }
}

#[async_trait]
impl GitHost for FakeGitHost {
    async fn branch_head(&self, session: &RepoSession, branch: &str) -> GitResult<ObjectId> {
        self.with_repo(session, FakeOp::BranchHead, |objects| {
            objects
                .refs
                .get(branch)
                .cloned()
                .ok_or_else(|| GitHubError::BranchNotFound {
                    branch: branch.to_string(),
                })
        })
    }

    async fn commit_tree(&self, session: &RepoSession, commit: &ObjectId) -> GitResult<ObjectId> {
        self.with_repo(session, FakeOp::CommitTree, |objects| {
            objects
                .commits
                .get(commit)
                .map(|c| c.tree.clone())
                .ok_or_else(|| GitHubError::Http {
                    status: Some(404),
                    message: format!("commit {commit} not found"),
                })
        })
    }

    async fn read_tree(&self, session: &RepoSession, tree: &ObjectId) -> GitResult<Vec<TreeEntry>> {
        self.with_repo(session, FakeOp::ReadTree, |objects| {
            objects
                .trees
                .get(tree)
                .cloned()
                .ok_or_else(|| GitHubError::Http {
                    status: Some(404),
                    message: format!("tree {tree} not found"),
                })
        })
    }

    async fn create_blob(&self, session: &RepoSession, content: &[u8]) -> GitResult<ObjectId> {
        self.calls.create_blob.fetch_add(1, Ordering::SeqCst);
        self.with_repo(session, FakeOp::CreateBlob, |objects| {
            Ok(objects.put_blob(content))
        })
    }

    async fn create_tree(
        &self,
        session: &RepoSession,
        entries: &[TreeEntry],
    ) -> GitResult<ObjectId> {
        self.with_repo(session, FakeOp::CreateTree, |objects| {
            let mut names = HashSet::new();
            for entry in entries {
                if entry.name.is_empty() || entry.name.contains('/') {
                    return Err(GitHubError::Http {
                        status: Some(422),
                        message: format!("invalid tree entry name {:?}", entry.name),
                    });
                }
                if !names.insert(entry.name.as_str()) {
                    return Err(GitHubError::Http {
                        status: Some(422),
                        message: format!("duplicate tree entry {:?}", entry.name),
                    });
                }
                if !objects.has_object(entry) {
                    return Err(GitHubError::Http {
                        status: Some(422),
                        message: format!("object {} does not exist", entry.sha),
                    });
                }
            }
            Ok(objects.put_tree(entries))
        })
    }

    async fn create_commit(
        &self,
        session: &RepoSession,
        commit: &NewCommit,
    ) -> GitResult<ObjectId> {
        self.calls.create_commit.fetch_add(1, Ordering::SeqCst);
        self.with_repo(session, FakeOp::CreateCommit, |objects| {
            if !objects.trees.contains_key(&commit.tree) {
                return Err(GitHubError::Http {
                    status: Some(422),
                    message: format!("tree {} does not exist", commit.tree),
                });
            }
            Ok(objects.put_commit(FakeCommit {
                tree: commit.tree.clone(),
                parents: commit.parents.clone(),
                message: commit.message.clone(),
                author: commit.author.clone(),
            }))
        })
    }

    async fn fast_forward(
        &self,
        session: &RepoSession,
        branch: &str,
        expected: &ObjectId,
        new: &ObjectId,
    ) -> GitResult<()> {
        self.calls.fast_forward.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, FakeOp::FastForward)?;

        let key = (session.repo.to_string(), branch.to_string());
        let push_now = match state.pending_pushes.get_mut(&key) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        };

        let objects = state
            .repos
            .get_mut(&key.0)
            .ok_or_else(|| GitHubError::Http {
                status: Some(404),
                message: r#"{"message":"Not Found"}"#.to_string(),
            })?;
        if push_now {
            Self::land_foreign_push(objects, branch);
        }

        let actual = objects
            .refs
            .get(branch)
            .cloned()
            .ok_or_else(|| GitHubError::BranchNotFound {
                branch: branch.to_string(),
            })?;
        if &actual != expected {
            return Err(GitHubError::RefConflict {
                branch: branch.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        let descends = objects
            .commits
            .get(new)
            .is_some_and(|c| c.parents.contains(expected));
        if !descends {
            return Err(GitHubError::Http {
                status: Some(422),
                message: "Update is not a fast forward".to_string(),
            });
        }
        objects.refs.insert(branch.to_string(), new.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeTokenMinter
// ---------------------------------------------------------------------------

/// Token minter that hands out predictable tokens and can revoke
/// installations.
#[derive(Debug, Default)]
pub struct FakeTokenMinter {
    revoked: Mutex<HashSet<u64>>,
    mints: AtomicUsize,
}

impl FakeTokenMinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later mint for `installation_id` fail as the host does for
    /// a removed installation.
    pub fn revoke(&self, installation_id: u64) {
        self.revoked.lock().unwrap().insert(installation_id);
    }

    /// Mint attempts so far, successful or not.
    pub fn mints(&self) -> usize {
        self.mints.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenMinter for FakeTokenMinter {
    async fn mint(&self, installation_id: u64) -> Result<InstallationToken, GitHubError> {
        let n = self.mints.fetch_add(1, Ordering::SeqCst);
        if self.revoked.lock().unwrap().contains(&installation_id) {
            return Err(GitHubError::Http {
                status: Some(404),
                message: r#"{"message":"Not Found","documentation_url":"https://docs.github.com/rest/apps/apps#create-an-installation-access-token-for-an-app"}"#
                    .to_string(),
            });
        }
        Ok(InstallationToken {
            token: SecretString::from(format!("ghs_fake_{installation_id}_{n}")),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            installation_id,
        })
    }
}
