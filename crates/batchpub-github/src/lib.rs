//! batchpub-github: GitHub App credentials and Git data access
//!
//! ## Layer 1 - Remote
//!
//! Focus: short-lived installation tokens and the handful of Git data
//! operations needed to land one commit on one branch.
//!
//! ## Key Components
//!
//! - `TokenMinter` / `GitHubAppTokenMinter`: app assertion to installation token
//! - `GitHost` / `GitHubGitHost`: refs, trees, blobs, commits, fast-forward
//! - `fake`: in-memory host and minter for tests

mod client;
mod error;
pub mod fake;
mod git_data;
mod token;

pub use client::GitHubGitHost;
pub use error::GitHubError;
pub use git_data::{
    EntryMode, GitHost, GitResult, Identity, NewCommit, ObjectId, RepoName, RepoSession,
    TreeEntry,
};
pub use token::{AppCredentials, GitHubAppTokenMinter, InstallationToken, TokenMinter};
