//! Presentation Projector
//!
//! Turns a stored merge request into the status one club should see. Pure:
//! the same record and viewing club always give the same answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::model::{ClubId, MergeRequest, MergeRequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    /// Both clubs accepted and the merged club exists.
    MergeComplete,
    /// Both clubs accepted, merged club not created yet.
    ReadyToMerge,
    /// The viewing club still has to accept.
    ActionRequired,
    /// The viewing club accepted and is waiting on the other club.
    Pending,
}

impl DisplayStatus {
    /// Badge text.
    pub fn label(&self) -> &'static str {
        match self {
            DisplayStatus::MergeComplete => "Merge Complete",
            DisplayStatus::ReadyToMerge => "Ready to Merge",
            DisplayStatus::ActionRequired => "Action Required",
            DisplayStatus::Pending => "Pending",
        }
    }

    pub fn message(&self, other_club_name: &str) -> String {
        match self {
            DisplayStatus::MergeComplete => format!("Successfully merged with {}!", other_club_name),
            DisplayStatus::ReadyToMerge => format!(
                "Both clubs have accepted. Merge with {} will be completed when processed.",
                other_club_name
            ),
            DisplayStatus::ActionRequired => format!(
                "{} wants to merge with your club. Please review and accept.",
                other_club_name
            ),
            DisplayStatus::Pending => format!(
                "Waiting for {} to accept your merge request.",
                other_club_name
            ),
        }
    }
}

/// Status of `request` as seen by `viewing_club`, or `None` if that club is not a party.
pub fn project(request: &MergeRequest, viewing_club: ClubId) -> Option<DisplayStatus> {
    let side = request.side_of(viewing_club)?;

    let status = if request.merged_club_id.is_some() {
        DisplayStatus::MergeComplete
    } else if request.both_accepted() {
        DisplayStatus::ReadyToMerge
    } else if !request.accepted(side) {
        DisplayStatus::ActionRequired
    } else {
        DisplayStatus::Pending
    };
    Some(status)
}

/// One merge request annotated for a viewing club.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MergeRequestView {
    pub merge_request_id: MergeRequestId,
    pub club_id: ClubId,
    pub club_name: String,
    pub other_club_id: ClubId,
    pub other_club_name: String,
    pub we_accepted: bool,
    pub they_accepted: bool,
    pub merged_club_id: Option<ClubId>,
    pub status: DisplayStatus,
    pub label: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl MergeRequestView {
    /// Build the view; `None` if `viewing_club` is not a party to `request`.
    pub fn build(
        request: &MergeRequest,
        viewing_club: ClubId,
        club_name: &str,
        other_club_name: &str,
    ) -> Option<Self> {
        let side = request.side_of(viewing_club)?;
        let status = project(request, viewing_club)?;

        Some(Self {
            merge_request_id: request.id,
            club_id: viewing_club,
            club_name: club_name.to_string(),
            other_club_id: request.club_on(side.other()),
            other_club_name: other_club_name.to_string(),
            we_accepted: request.accepted(side),
            they_accepted: request.accepted(side.other()),
            merged_club_id: request.merged_club_id,
            status,
            label: status.label().to_string(),
            message: status.message(other_club_name),
            created_at: request.created_at,
        })
    }
}
