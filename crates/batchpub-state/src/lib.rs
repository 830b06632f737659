//! batchpub-state: persistence for the batch commit orchestrator
//!
//! This crate owns the row types and storage seams the commit path reads and
//! writes. It handles all I/O with the row store and the blob store.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: compare-and-swap state transitions and lossless metadata merges.
//!
//! ## Key Components
//!
//! - `BatchState` / `Transition`: the batch lifecycle as a transition table
//! - `ErrorDetail`: typed diagnostics stored in batch metadata
//! - `PostgrestStore`: batch/asset/site tables over PostgREST
//! - `StorageBlobStore`, `FsBlobStore`: staged asset bytes

pub mod blob;
mod detail;
mod error;
pub mod fakes;
mod model;
pub mod postgrest;
mod state;
pub mod storage_traits;

pub use blob::{FsBlobStore, StorageBlobStore};
pub use detail::ErrorDetail;
pub use error::StorageError;
pub use model::{
    merge_metadata, AssetId, AssetStatus, AssetVersion, BatchId, BatchPatch, ChangeBatch, Site,
    SiteId, SiteIntegration, ERROR_METADATA_KEY, TOKEN_EXPIRY_SETTING,
};
pub use postgrest::{PostgrestConfig, PostgrestStore};
pub use state::{BatchState, Transition};
pub use storage_traits::{AssetStore, BatchStore, BlobStore, SiteStore, StorageResult};
