//! ClubMerge - two-sided club merge requests backed by SQLite
//! Library shared by the `clubmerge` CLI and HTTP server

pub mod engine;

pub use engine::merge::{MergeEngine, MergeError};
