//! Tree/commit builder: lands a set of staged files on a branch as one
//! commit.
//!
//! [`CommitBuilder::prepare`] runs steps 1-4 and
//! [`CommitBuilder::advance`] runs step 5:
//!
//! 1. read the branch head and its root tree
//! 2. create a blob per staged file (bounded fan-out)
//! 3. merge the blobs into the head tree ([`crate::tree::merge_tree`])
//! 4. create a commit on top of the head
//! 5. fast-forward the branch, conditioned on the head from step 1
//!
//! The sequence is not atomic at the host, but it is safe to re-run from
//! step 1: blobs are content addressed and an abandoned tree or commit is
//! never referenced.

use std::sync::Arc;

use batchpub_github::{GitHost, GitHubError, Identity, NewCommit, ObjectId, RepoSession};
use batchpub_state::BatchId;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::error::{CommitError, CommitResult};
use crate::metrics::METRICS;
use crate::resolver::StagedFile;
use crate::tree::{merge_tree, TreeOverlay};

pub const DEFAULT_BOT_NAME: &str = "batchpub[bot]";
pub const DEFAULT_BOT_EMAIL: &str = "batchpub[bot]@users.noreply.github.com";

/// Message used when the batch has none.
pub fn default_commit_message(batch_id: &BatchId, files: usize) -> String {
    let noun = if files == 1 { "file" } else { "files" };
    format!("Batch {batch_id} — {files} {noun}")
}

/// Result of a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedCommit {
    pub commit: ObjectId,
    pub parent: ObjectId,
    pub tree: ObjectId,
}

pub struct CommitBuilder {
    host: Arc<dyn GitHost>,
    identity: Identity,
    blob_concurrency: usize,
}

impl CommitBuilder {
    pub fn new(host: Arc<dyn GitHost>) -> Self {
        Self {
            host,
            identity: Identity::new(DEFAULT_BOT_NAME, DEFAULT_BOT_EMAIL),
            blob_concurrency: 4,
        }
    }

    /// Author and committer of every commit.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_blob_concurrency(mut self, n: usize) -> Self {
        self.blob_concurrency = n.max(1);
        self
    }

    /// Steps 1-4: a commit on top of the current head that the branch does
    /// not reference yet.
    pub async fn prepare(
        &self,
        session: &RepoSession,
        branch: &str,
        files: &[StagedFile],
        message: &str,
    ) -> CommitResult<PushedCommit> {
        let host = self.host.as_ref();

        let head = host.branch_head(session, branch).await?;
        let base_tree = host.commit_tree(session, &head).await?;
        debug!(head = %head.short(), "branch head resolved");

        let blobs: Vec<ObjectId> = stream::iter(files)
            .map(|file| host.create_blob(session, &file.content))
            .buffered(self.blob_concurrency)
            .boxed()
            .try_collect()
            .await?;
        METRICS.add_blobs_created(blobs.len() as u64);

        let mut overlay = TreeOverlay::new();
        for (file, blob) in files.iter().zip(blobs) {
            overlay.insert(&file.path, blob)?;
        }
        let tree = merge_tree(host, session, &base_tree, &overlay).await?;

        let commit = host
            .create_commit(
                session,
                &NewCommit {
                    message: message.to_string(),
                    tree: tree.clone(),
                    parents: vec![head.clone()],
                    author: self.identity.clone(),
                },
            )
            .await?;

        Ok(PushedCommit {
            commit,
            parent: head,
            tree,
        })
    }

    /// Step 5: fast-forward `branch` from `prepared.parent` to
    /// `prepared.commit`. A branch that moved underneath us yields
    /// [`CommitError::ConcurrentUpdate`]; the caller decides whether to
    /// re-run from step 1.
    pub async fn advance(
        &self,
        session: &RepoSession,
        branch: &str,
        prepared: &PushedCommit,
    ) -> CommitResult<()> {
        let head = &prepared.parent;
        match self
            .host
            .fast_forward(session, branch, head, &prepared.commit)
            .await
        {
            Ok(()) => {}
            Err(GitHubError::RefConflict { actual, .. }) => {
                debug!(expected = %head.short(), %actual, "branch moved during build");
                return Err(CommitError::ConcurrentUpdate {
                    branch: branch.to_string(),
                    attempts: 1,
                    expected_head: head.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            branch,
            commit = %prepared.commit.short(),
            parent = %head.short(),
            "branch fast-forwarded"
        );
        Ok(())
    }

    /// Whether `branch` currently points at `commit`.
    pub async fn points_at(
        &self,
        session: &RepoSession,
        branch: &str,
        commit: &ObjectId,
    ) -> CommitResult<bool> {
        Ok(self.host.branch_head(session, branch).await? == *commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_message_pluralizes() {
        let id = BatchId::parse("7b0cfa54-3d4c-4a8f-9d55-0a4f0e0b1c11").unwrap();
        assert_eq!(
            default_commit_message(&id, 1),
            "Batch 7b0cfa54-3d4c-4a8f-9d55-0a4f0e0b1c11 — 1 file"
        );
        assert_eq!(
            default_commit_message(&id, 3),
            "Batch 7b0cfa54-3d4c-4a8f-9d55-0a4f0e0b1c11 — 3 files"
        );
    }
}
