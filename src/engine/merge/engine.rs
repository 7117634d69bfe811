//! Merge Protocol Engine
//!
//! State transitions for club merge requests:
//!
//! ```text
//! create            : none             -> PendingOneSide (initiator pre-accepted)
//! accept(other side): PendingOneSide   -> Ready -> Merged (same call)
//! accept(same side) : no transition
//! finalize          : Ready            -> Merged (retry after a failed aggregation)
//! cancel            : PendingOneSide | Ready -> deleted
//! ```
//!
//! Every write is a compare-and-set against the stored version. A lost race
//! re-reads the record and re-evaluates the transition, up to
//! `max_write_retries` attempts, after which the caller gets `Conflict`.

use std::sync::Arc;

use super::error::{MergeError, Result};
use super::model::{ClubId, ClubPair, MergeRequest, MergeRequestId, NewMergeRequest, UserId};
use super::projector::MergeRequestView;
use super::store::{DeleteOutcome, InsertOutcome, MergeStore, SqliteMergeStore};
use crate::engine::aggregation::{AggregationError, ClubAggregator, SqliteClubAggregator};
use crate::engine::audit::{AuditAction, AuditEntry, AuditLog};
use crate::engine::database::Database;
use crate::engine::directory::{ClubDirectory, SqliteClubDirectory};
use crate::engine::rbac::{AuthContext, Capability, Enforcer};

pub const DEFAULT_MAX_WRITE_RETRIES: u32 = 3;

const UNKNOWN_CLUB_NAME: &str = "Unknown Club";

pub struct MergeEngine {
    store: Arc<dyn MergeStore>,
    directory: Arc<dyn ClubDirectory>,
    aggregator: Arc<dyn ClubAggregator>,
    audit: Option<Arc<AuditLog>>,
    max_write_retries: u32,
}

impl MergeEngine {
    pub fn new(
        store: Arc<dyn MergeStore>,
        directory: Arc<dyn ClubDirectory>,
        aggregator: Arc<dyn ClubAggregator>,
    ) -> Self {
        Self {
            store,
            directory,
            aggregator,
            audit: None,
            max_write_retries: DEFAULT_MAX_WRITE_RETRIES,
        }
    }

    /// Engine wired to the SQLite store, directory and aggregator.
    pub fn sqlite(db: &Database) -> Self {
        Self::new(
            Arc::new(SqliteMergeStore::new(db.clone())),
            Arc::new(SqliteClubDirectory::new(db.clone())),
            Arc::new(SqliteClubAggregator::new(db.clone())),
        )
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(Arc::new(audit));
        self
    }

    pub fn with_max_write_retries(mut self, retries: u32) -> Self {
        self.max_write_retries = retries.max(1);
        self
    }

    pub fn directory(&self) -> &dyn ClubDirectory {
        self.directory.as_ref()
    }

    fn record(&self, entry: AuditEntry) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(&entry) {
                tracing::warn!(error = %e, path = %audit.path().display(), "failed to write audit entry");
            }
        }
    }

    fn load(&self, id: MergeRequestId) -> Result<MergeRequest> {
        self.store.get(id)?.ok_or_else(|| MergeError::request_not_found(id))
    }

    fn too_many_retries(&self, id: MergeRequestId) -> MergeError {
        MergeError::Conflict(format!(
            "merge request {} changed concurrently; gave up after {} attempts",
            id, self.max_write_retries
        ))
    }

    fn forbidden_for(&self, actor: UserId, request: &MergeRequest) -> MergeError {
        MergeError::Forbidden {
            user: actor,
            scope: format!("club {} or club {}", request.club_a_id, request.club_b_id),
        }
    }

    pub fn get(&self, id: MergeRequestId) -> Result<MergeRequest> {
        self.load(id)
    }

    /// Propose merging `initiator` with `target`. The initiator side starts accepted.
    pub fn create(&self, initiator: ClubId, target: ClubId, actor: UserId) -> Result<MergeRequest> {
        if initiator == target {
            return Err(MergeError::InvalidPair(initiator));
        }
        for club in [initiator, target] {
            if !self.directory.club_exists(club)? {
                return Err(MergeError::club_not_found(club));
            }
        }

        let context = AuthContext::for_user(actor);
        let auth = Enforcer::new(self.directory.as_ref()).authorize(&context, initiator, Capability::ManageMerges)?;
        if !auth.allowed {
            tracing::debug!(user = %actor, club = %initiator, reason = ?auth.reason, "merge create denied");
            return Err(MergeError::Forbidden {
                user: actor,
                scope: format!("club {}", initiator),
            });
        }

        let pair = ClubPair::new(initiator, target);
        if let Some(existing) = self.store.find_active(pair)? {
            return Err(MergeError::Conflict(format!(
                "merge request {} between clubs {} and {} is already open",
                existing.id, existing.club_a_id, existing.club_b_id
            )));
        }

        match self.store.insert(&NewMergeRequest::proposed(initiator, target))? {
            InsertOutcome::Inserted(request) => {
                tracing::info!(
                    merge_request = %request.id,
                    initiator = %initiator,
                    target = %target,
                    user = %actor,
                    "merge request created"
                );
                self.record(
                    AuditEntry::new(AuditAction::Created, request.id)
                        .with_actor(actor)
                        .with_record(&request),
                );
                Ok(request)
            }
            // Lost the race against another create for the same pair
            InsertOutcome::DuplicatePair => Err(MergeError::Conflict(format!(
                "a merge request between clubs {} and {} is already open",
                initiator, target
            ))),
        }
    }

    /// Accept on behalf of the side `actor` organizes. Finalizes once both sides accepted.
    pub fn accept(&self, id: MergeRequestId, actor: UserId) -> Result<MergeRequest> {
        let context = AuthContext::for_user(actor);

        for attempt in 1..=self.max_write_retries {
            let current = self.load(id)?;
            if current.is_merged() {
                return Err(MergeError::AlreadyMerged(id));
            }

            let sides = Enforcer::new(self.directory.as_ref()).managed_sides(&context, &current)?;
            if sides.is_empty() {
                return Err(self.forbidden_for(actor, &current));
            }

            let Some(side) = sides.into_iter().find(|side| !current.accepted(*side)) else {
                tracing::debug!(merge_request = %id, user = %actor, "side already accepted");
                return Ok(current);
            };

            let next = current.with_accepted(side);
            match self.store.compare_and_set(&current, &next)? {
                Some(stored) => {
                    tracing::info!(merge_request = %id, side = ?side, state = ?stored.state(), user = %actor, "merge request accepted");
                    self.record(
                        AuditEntry::new(AuditAction::Accepted, id)
                            .with_actor(actor)
                            .with_record(&stored),
                    );
                    if stored.both_accepted() {
                        return self.complete(stored, actor);
                    }
                    return Ok(stored);
                }
                None => {
                    tracing::debug!(merge_request = %id, attempt, "accept lost a concurrent write, retrying");
                }
            }
        }

        Err(self.too_many_retries(id))
    }

    /// Retry finalization of a request both clubs already accepted.
    pub fn finalize(&self, id: MergeRequestId, actor: UserId) -> Result<MergeRequest> {
        let current = self.load(id)?;

        let context = AuthContext::for_user(actor);
        if Enforcer::new(self.directory.as_ref())
            .managed_sides(&context, &current)?
            .is_empty()
        {
            return Err(self.forbidden_for(actor, &current));
        }
        if current.is_merged() {
            return Ok(current);
        }
        if !current.both_accepted() {
            return Err(MergeError::NotReady(id));
        }

        self.complete(current, actor)
    }

    /// Aggregate the clubs, then record the merged club on the request.
    ///
    /// The aggregator is keyed on the request id, so running this again after
    /// a failure or a lost race yields the same merged club.
    fn complete(&self, ready: MergeRequest, actor: UserId) -> Result<MergeRequest> {
        let id = ready.id;
        let merged_club = match self.aggregator.aggregate(&ready) {
            Ok(club) => club,
            Err(AggregationError::Closed(_)) => {
                tracing::info!(merge_request = %id, "request closed before aggregation");
                return match self.store.get(id)? {
                    Some(latest) if latest.is_merged() => Ok(latest),
                    _ => Err(withdrawn_while_finalizing(id)),
                };
            }
            Err(source) => {
                tracing::warn!(merge_request = %id, error = %source, "aggregation failed; request left ready for retry");
                self.record(
                    AuditEntry::new(AuditAction::FinalizationFailed, id)
                        .with_actor(actor)
                        .with_record(&ready)
                        .with_detail(source.to_string()),
                );
                return Err(MergeError::AggregationFailed { id, source });
            }
        };

        let mut current = ready;
        for attempt in 1..=self.max_write_retries {
            let next = MergeRequest {
                merged_club_id: Some(merged_club),
                ..current.clone()
            };
            if let Some(stored) = self.store.compare_and_set(&current, &next)? {
                tracing::info!(merge_request = %id, merged_club = %merged_club, "merge finalized");
                self.record(
                    AuditEntry::new(AuditAction::Finalized, id)
                        .with_actor(actor)
                        .with_record(&stored),
                );
                return Ok(stored);
            }

            tracing::debug!(merge_request = %id, attempt, "finalize lost a concurrent write, re-reading");
            current = match self.store.get(id)? {
                Some(latest) if latest.is_merged() => return Ok(latest),
                Some(latest) => latest,
                None => return Err(withdrawn_while_finalizing(id)),
            };
        }

        Err(self.too_many_retries(id))
    }

    /// Withdraw an unmerged request. Removal is unconditional; there is no soft-cancel state.
    /// Once the clubs have been combined the request can only be finalized.
    pub fn cancel(&self, id: MergeRequestId, actor: UserId) -> Result<()> {
        let context = AuthContext::for_user(actor);

        for attempt in 1..=self.max_write_retries {
            let current = self.load(id)?;
            if current.is_merged() {
                return Err(MergeError::AlreadyMerged(id));
            }
            if Enforcer::new(self.directory.as_ref())
                .managed_sides(&context, &current)?
                .is_empty()
            {
                return Err(self.forbidden_for(actor, &current));
            }

            match self.store.delete_if_current(&current)? {
                DeleteOutcome::Deleted => {
                    tracing::info!(merge_request = %id, user = %actor, "merge request cancelled");
                    self.record(
                        AuditEntry::new(AuditAction::Cancelled, id)
                            .with_actor(actor)
                            .with_record(&current),
                    );
                    return Ok(());
                }
                DeleteOutcome::Finalizing => {
                    tracing::info!(merge_request = %id, user = %actor, "cancel refused; clubs already combined");
                    return Err(MergeError::Conflict(format!(
                        "merge request {} is being finalized and can no longer be cancelled",
                        id
                    )));
                }
                DeleteOutcome::Stale => {
                    tracing::debug!(merge_request = %id, attempt, "cancel lost a concurrent write, retrying");
                }
            }
        }

        Err(self.too_many_retries(id))
    }

    pub fn list_for_club(&self, club: ClubId) -> Result<Vec<MergeRequest>> {
        Ok(self.store.list_for_club(club)?)
    }

    /// Every request `club` is party to, projected for that club.
    pub fn views_for_club(&self, club: ClubId) -> Result<Vec<MergeRequestView>> {
        let club_name = self
            .directory
            .club_name(club)?
            .ok_or_else(|| MergeError::club_not_found(club))?;

        let mut views = Vec::new();
        for request in self.store.list_for_club(club)? {
            let Some(side) = request.side_of(club) else {
                continue;
            };
            let other_name = self
                .directory
                .club_name(request.club_on(side.other()))?
                .unwrap_or_else(|| UNKNOWN_CLUB_NAME.to_string());
            if let Some(view) = MergeRequestView::build(&request, club, &club_name, &other_name) {
                views.push(view);
            }
        }
        Ok(views)
    }
}

fn withdrawn_while_finalizing(id: MergeRequestId) -> MergeError {
    MergeError::Conflict(format!("merge request {} was withdrawn while it was being finalized", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::aggregation::AggregationError;
    use crate::engine::database::DatabaseError;
    use crate::engine::merge::projector::{project, DisplayStatus};
    use crate::engine::rbac::Role;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::tempdir;

    const CHESS: ClubId = ClubId(1);
    const GO: ClubId = ClubId(2);
    const CHESS_ORGANIZER: UserId = UserId(10);
    const GO_ORGANIZER: UserId = UserId(20);
    const GO_MEMBER: UserId = UserId(30);
    const STRANGER: UserId = UserId(99);

    /// Aggregator that can be switched into failure mode and counts successful runs.
    struct FlakyAggregator {
        inner: SqliteClubAggregator,
        failing: AtomicBool,
        successes: AtomicUsize,
    }

    impl ClubAggregator for FlakyAggregator {
        fn aggregate(&self, request: &MergeRequest) -> std::result::Result<ClubId, AggregationError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(AggregationError::Unavailable("aggregation offline".to_string()));
            }
            let club = self.inner.aggregate(request)?;
            self.successes.fetch_add(1, Ordering::SeqCst);
            Ok(club)
        }
    }

    /// Store that lets another writer bump the row right before our write.
    struct RacingStore {
        inner: SqliteMergeStore,
        interference: AtomicUsize,
    }

    impl MergeStore for RacingStore {
        fn insert(&self, new: &NewMergeRequest) -> std::result::Result<InsertOutcome, DatabaseError> {
            self.inner.insert(new)
        }

        fn get(&self, id: MergeRequestId) -> std::result::Result<Option<MergeRequest>, DatabaseError> {
            self.inner.get(id)
        }

        fn find_active(&self, pair: ClubPair) -> std::result::Result<Option<MergeRequest>, DatabaseError> {
            self.inner.find_active(pair)
        }

        fn list_for_club(&self, club: ClubId) -> std::result::Result<Vec<MergeRequest>, DatabaseError> {
            self.inner.list_for_club(club)
        }

        fn compare_and_set(
            &self,
            current: &MergeRequest,
            next: &MergeRequest,
        ) -> std::result::Result<Option<MergeRequest>, DatabaseError> {
            if self.interference.load(Ordering::SeqCst) > 0 {
                self.interference.fetch_sub(1, Ordering::SeqCst);
                self.inner.compare_and_set(current, current)?;
            }
            self.inner.compare_and_set(current, next)
        }

        fn delete_if_current(&self, current: &MergeRequest) -> std::result::Result<DeleteOutcome, DatabaseError> {
            if self.interference.load(Ordering::SeqCst) > 0 {
                self.interference.fetch_sub(1, Ordering::SeqCst);
                self.inner.compare_and_set(current, current)?;
            }
            self.inner.delete_if_current(current)
        }
    }

    /// Aggregator whose request is withdrawn just before the clubs are combined.
    struct WithdrawingAggregator {
        store: SqliteMergeStore,
        inner: SqliteClubAggregator,
    }

    impl ClubAggregator for WithdrawingAggregator {
        fn aggregate(&self, request: &MergeRequest) -> std::result::Result<ClubId, AggregationError> {
            assert_eq!(self.store.delete_if_current(request)?, DeleteOutcome::Deleted);
            self.inner.aggregate(request)
        }
    }

    struct Fixture {
        db: Database,
        engine: MergeEngine,
        directory: Arc<SqliteClubDirectory>,
        aggregator: Arc<FlakyAggregator>,
        store: Arc<RacingStore>,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let directory = Arc::new(SqliteClubDirectory::new(db.clone()));
        assert_eq!(directory.create_club("Chess", "").unwrap().id, CHESS);
        assert_eq!(directory.create_club("Go", "").unwrap().id, GO);
        directory.add_membership(CHESS_ORGANIZER, CHESS, Role::Organizer).unwrap();
        directory.add_membership(GO_ORGANIZER, GO, Role::Organizer).unwrap();
        directory.add_membership(GO_MEMBER, GO, Role::Member).unwrap();

        let aggregator = Arc::new(FlakyAggregator {
            inner: SqliteClubAggregator::new(db.clone()),
            failing: AtomicBool::new(false),
            successes: AtomicUsize::new(0),
        });
        let store = Arc::new(RacingStore {
            inner: SqliteMergeStore::new(db.clone()),
            interference: AtomicUsize::new(0),
        });
        let engine = MergeEngine::new(store.clone(), directory.clone(), aggregator.clone());

        Fixture {
            db,
            engine,
            directory,
            aggregator,
            store,
        }
    }

    #[test]
    fn test_create_pre_accepts_initiator() {
        let fx = fixture();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        assert_eq!(req.club_a_id, CHESS);
        assert_eq!(req.club_b_id, GO);
        assert!(req.initiator_accepted);
        assert!(!req.target_accepted);
        assert_eq!(req.merged_club_id, None);
    }

    #[test]
    fn test_create_rejects_self_merge() {
        let fx = fixture();
        assert!(matches!(
            fx.engine.create(CHESS, CHESS, CHESS_ORGANIZER),
            Err(MergeError::InvalidPair(CHESS))
        ));
    }

    #[test]
    fn test_create_unknown_club() {
        let fx = fixture();
        assert!(matches!(
            fx.engine.create(CHESS, ClubId(404), CHESS_ORGANIZER),
            Err(MergeError::NotFound(_))
        ));
    }

    #[test]
    fn test_create_requires_initiator_organizer() {
        let fx = fixture();
        assert!(matches!(
            fx.engine.create(GO, CHESS, GO_MEMBER),
            Err(MergeError::Forbidden { .. })
        ));
        // Organizing the target club is not enough
        assert!(matches!(
            fx.engine.create(CHESS, GO, GO_ORGANIZER),
            Err(MergeError::Forbidden { .. })
        ));
    }

    #[test]
    fn test_duplicate_create_conflicts_in_both_directions() {
        let fx = fixture();
        fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        assert!(matches!(
            fx.engine.create(CHESS, GO, CHESS_ORGANIZER),
            Err(MergeError::Conflict(_))
        ));
        assert!(matches!(
            fx.engine.create(GO, CHESS, GO_ORGANIZER),
            Err(MergeError::Conflict(_))
        ));
        assert_eq!(fx.engine.list_for_club(CHESS).unwrap().len(), 1);
    }

    #[test]
    fn test_end_to_end_merge() {
        let fx = fixture();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        let merged = fx.engine.accept(req.id, GO_ORGANIZER).unwrap();
        assert!(merged.initiator_accepted);
        assert!(merged.target_accepted);
        assert_eq!(merged.merged_club_id, Some(ClubId(3)));
        assert_eq!(fx.aggregator.successes.load(Ordering::SeqCst), 1);
        assert_eq!(fx.directory.club_name(ClubId(3)).unwrap().as_deref(), Some("Chess x Go"));

        assert!(matches!(
            fx.engine.accept(req.id, GO_ORGANIZER),
            Err(MergeError::AlreadyMerged(_))
        ));
        assert!(matches!(
            fx.engine.accept(req.id, CHESS_ORGANIZER),
            Err(MergeError::AlreadyMerged(_))
        ));
        assert!(matches!(
            fx.engine.cancel(req.id, CHESS_ORGANIZER),
            Err(MergeError::AlreadyMerged(_))
        ));
        assert_eq!(fx.engine.get(req.id).unwrap(), merged);
    }

    #[test]
    fn test_reaccept_same_side_is_noop() {
        let fx = fixture();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        let again = fx.engine.accept(req.id, CHESS_ORGANIZER).unwrap();
        assert_eq!(again, req);
        assert_eq!(fx.aggregator.successes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_accept_permissions() {
        let fx = fixture();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        assert!(matches!(
            fx.engine.accept(req.id, GO_MEMBER),
            Err(MergeError::Forbidden { .. })
        ));
        assert!(matches!(
            fx.engine.accept(req.id, STRANGER),
            Err(MergeError::Forbidden { .. })
        ));
        assert!(matches!(
            fx.engine.accept(MergeRequestId(404), GO_ORGANIZER),
            Err(MergeError::NotFound(_))
        ));
        assert!(!fx.engine.get(req.id).unwrap().target_accepted);
    }

    #[test]
    fn test_organizer_of_both_accepts_missing_side() {
        let fx = fixture();
        fx.directory.add_membership(CHESS_ORGANIZER, GO, Role::Admin).unwrap();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        let merged = fx.engine.accept(req.id, CHESS_ORGANIZER).unwrap();
        assert!(merged.target_accepted);
        assert!(merged.is_merged());
    }

    #[test]
    fn test_failed_aggregation_leaves_ready_then_finalize_retries() {
        let fx = fixture();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        fx.aggregator.failing.store(true, Ordering::SeqCst);
        let err = fx.engine.accept(req.id, GO_ORGANIZER).unwrap_err();
        assert!(matches!(err, MergeError::AggregationFailed { .. }));
        assert_eq!(err.kind(), "aggregation_failed");

        let ready = fx.engine.get(req.id).unwrap();
        assert!(ready.both_accepted());
        assert_eq!(ready.merged_club_id, None);
        assert_eq!(project(&ready, CHESS), Some(DisplayStatus::ReadyToMerge));
        assert_eq!(project(&ready, GO), Some(DisplayStatus::ReadyToMerge));

        // Re-accepting does not re-run finalization
        fx.aggregator.failing.store(false, Ordering::SeqCst);
        assert_eq!(fx.engine.accept(req.id, GO_ORGANIZER).unwrap(), ready);
        assert_eq!(fx.aggregator.successes.load(Ordering::SeqCst), 0);

        assert!(matches!(
            fx.engine.finalize(req.id, STRANGER),
            Err(MergeError::Forbidden { .. })
        ));
        let merged = fx.engine.finalize(req.id, CHESS_ORGANIZER).unwrap();
        assert_eq!(merged.merged_club_id, Some(ClubId(3)));

        // Finalizing a merged request hands it back untouched
        assert_eq!(fx.engine.finalize(req.id, GO_ORGANIZER).unwrap(), merged);
        assert_eq!(fx.aggregator.successes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalize_pending_request_not_ready() {
        let fx = fixture();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();
        assert!(matches!(
            fx.engine.finalize(req.id, CHESS_ORGANIZER),
            Err(MergeError::NotReady(_))
        ));
    }

    #[test]
    fn test_cancel_removes_from_both_listings() {
        let fx = fixture();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        assert!(matches!(
            fx.engine.cancel(req.id, GO_MEMBER),
            Err(MergeError::Forbidden { .. })
        ));
        fx.engine.cancel(req.id, GO_ORGANIZER).unwrap();

        assert!(fx.engine.list_for_club(CHESS).unwrap().is_empty());
        assert!(fx.engine.list_for_club(GO).unwrap().is_empty());
        assert!(matches!(
            fx.engine.cancel(req.id, GO_ORGANIZER),
            Err(MergeError::NotFound(_))
        ));

        // The pair is free again
        fx.engine.create(GO, CHESS, GO_ORGANIZER).unwrap();
    }

    #[test]
    fn test_cancel_ready_request_after_failed_aggregation() {
        let fx = fixture();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        fx.aggregator.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            fx.engine.accept(req.id, GO_ORGANIZER),
            Err(MergeError::AggregationFailed { .. })
        ));
        assert!(fx.engine.get(req.id).unwrap().both_accepted());

        fx.aggregator.failing.store(false, Ordering::SeqCst);
        fx.engine.cancel(req.id, GO_ORGANIZER).unwrap();

        assert!(fx.engine.views_for_club(CHESS).unwrap().is_empty());
        assert!(fx.engine.views_for_club(GO).unwrap().is_empty());
        assert!(matches!(
            fx.engine.finalize(req.id, CHESS_ORGANIZER),
            Err(MergeError::NotFound(_))
        ));
        assert_eq!(fx.aggregator.successes.load(Ordering::SeqCst), 0);
        assert_eq!(fx.directory.list_clubs().unwrap().len(), 2);
    }

    #[test]
    fn test_withdrawn_request_is_not_aggregated() {
        let fx = fixture();
        let aggregator = SqliteClubAggregator::new(fx.db.clone());
        let engine = MergeEngine::new(
            fx.store.clone(),
            fx.directory.clone(),
            Arc::new(WithdrawingAggregator {
                store: SqliteMergeStore::new(fx.db.clone()),
                inner: aggregator.clone(),
            }),
        );
        let req = engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        assert!(matches!(engine.accept(req.id, GO_ORGANIZER), Err(MergeError::Conflict(_))));

        let names: Vec<String> = fx.directory.list_clubs().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Chess".to_string(), "Go".to_string()]);
        assert_eq!(aggregator.recorded(req.id).unwrap(), None);
        assert!(matches!(engine.get(req.id), Err(MergeError::NotFound(_))));
    }

    #[test]
    fn test_cancel_refused_once_clubs_combined() {
        let fx = fixture();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        fx.aggregator.failing.store(true, Ordering::SeqCst);
        fx.engine.accept(req.id, GO_ORGANIZER).unwrap_err();
        let ready = fx.engine.get(req.id).unwrap();

        // Clubs combined, merged-club write still outstanding
        let combined = SqliteClubAggregator::new(fx.db.clone()).aggregate(&ready).unwrap();

        assert!(matches!(
            fx.engine.cancel(req.id, CHESS_ORGANIZER),
            Err(MergeError::Conflict(_))
        ));
        assert!(fx.engine.get(req.id).is_ok());

        fx.aggregator.failing.store(false, Ordering::SeqCst);
        let merged = fx.engine.finalize(req.id, CHESS_ORGANIZER).unwrap();
        assert_eq!(merged.merged_club_id, Some(combined));
        assert_eq!(fx.directory.list_clubs().unwrap().len(), 3);
    }

    #[test]
    fn test_accept_retries_after_lost_race() {
        let fx = fixture();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        fx.store.interference.store(1, Ordering::SeqCst);
        let merged = fx.engine.accept(req.id, GO_ORGANIZER).unwrap();
        assert!(merged.is_merged());
        assert_eq!(fx.aggregator.successes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_accept_gives_up_after_bounded_retries() {
        let fx = fixture();
        let engine = MergeEngine::new(fx.store.clone(), fx.directory.clone(), fx.aggregator.clone())
            .with_max_write_retries(2);
        let req = engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        fx.store.interference.store(2, Ordering::SeqCst);
        assert!(matches!(engine.accept(req.id, GO_ORGANIZER), Err(MergeError::Conflict(_))));

        let stored = engine.get(req.id).unwrap();
        assert!(!stored.target_accepted);
        assert!(stored.initiator_accepted);
    }

    #[test]
    fn test_cancel_retries_after_lost_race() {
        let fx = fixture();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        fx.store.interference.store(1, Ordering::SeqCst);
        fx.engine.cancel(req.id, CHESS_ORGANIZER).unwrap();
        assert!(fx.engine.list_for_club(CHESS).unwrap().is_empty());
    }

    #[test]
    fn test_views_for_each_side() {
        let fx = fixture();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        let chess = fx.engine.views_for_club(CHESS).unwrap();
        assert_eq!(chess.len(), 1);
        assert_eq!(chess[0].merge_request_id, req.id);
        assert_eq!(chess[0].other_club_name, "Go");
        assert_eq!(chess[0].status, DisplayStatus::Pending);

        let go = fx.engine.views_for_club(GO).unwrap();
        assert_eq!(go[0].club_name, "Go");
        assert_eq!(go[0].other_club_id, CHESS);
        assert_eq!(go[0].status, DisplayStatus::ActionRequired);

        assert!(matches!(
            fx.engine.views_for_club(ClubId(404)),
            Err(MergeError::NotFound(_))
        ));
    }

    #[test]
    fn test_club_deletion_blocked_by_active_request() {
        let fx = fixture();
        let req = fx.engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();

        assert!(fx.directory.delete_club(GO).is_err());
        fx.engine.cancel(req.id, CHESS_ORGANIZER).unwrap();
        fx.directory.delete_club(GO).unwrap();
    }

    #[test]
    fn test_audit_trail() {
        let dir = tempdir().unwrap();
        let fx = fixture();
        let engine = MergeEngine::new(fx.store.clone(), fx.directory.clone(), fx.aggregator.clone())
            .with_audit(AuditLog::new(dir.path()).unwrap());

        let req = engine.create(CHESS, GO, CHESS_ORGANIZER).unwrap();
        engine.accept(req.id, GO_ORGANIZER).unwrap();

        let log = AuditLog::new(dir.path()).unwrap();
        let actions: Vec<AuditAction> = log
            .query_by_request(req.id)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![AuditAction::Created, AuditAction::Accepted, AuditAction::Finalized]
        );
    }
}
