//! batchpub-core: publish a batch of staged assets as one commit
//!
//! ## Layer 2 - Domain
//!
//! Sequences the persistence layer (`batchpub-state`) and the remote layer
//! (`batchpub-github`) under the batch state machine.
//!
//! ## Key Components
//!
//! - `Orchestrator`: load, claim, mint, resolve, build, complete/fail
//! - `AssetResolver`: staged rows and verified bytes
//! - `CommitBuilder` / `merge_tree`: non-destructive single-commit push
//! - `InstallationSync`: bind a site to an app installation
//! - `Runtime`: production wiring from `ServiceConfig`

pub mod builder;
pub mod config;
pub mod error;
pub mod installation;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod resolver;
pub mod runtime;
pub mod telemetry;
pub mod tree;

pub use builder::{default_commit_message, CommitBuilder, PushedCommit};
pub use config::{ConfigError, ServiceConfig};
pub use error::{CommitError, CommitResult, SyncError};
pub use installation::{InstallationSync, InstallationSyncRequest};
pub use metrics::METRICS;
pub use orchestrator::{CommitReceipt, CommitRequest, Orchestrator, RetryPolicy, Services};
pub use resolver::{AssetResolver, StagedFile};
pub use runtime::Runtime;
pub use telemetry::init_tracing;
pub use tree::{merge_tree, RepoPath, TreeOverlay};
