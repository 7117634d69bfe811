//! Club Merge Protocol
//!
//! Two-sided acceptance of club merge requests, with idempotent finalization
//! into a combined club and a per-club presentation of each request.

pub mod model;
pub mod error;
pub mod store;
pub mod projector;
pub mod engine;

pub use engine::{MergeEngine, DEFAULT_MAX_WRITE_RETRIES};
pub use error::MergeError;
pub use model::{ClubId, ClubPair, MergeRequest, MergeRequestId, MergeSide, MergeState, NewMergeRequest, UserId};
pub use projector::{project, DisplayStatus, MergeRequestView};
pub use store::{DeleteOutcome, InsertOutcome, MergeStore, SqliteMergeStore};
