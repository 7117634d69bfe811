use chrono::{TimeZone, Utc};
use clubmerge_lib::engine::audit::{AuditAction, AuditLog};
use clubmerge_lib::engine::database::Database;
use clubmerge_lib::engine::directory::{ClubDirectory, SqliteClubDirectory};
use clubmerge_lib::engine::merge::{project, ClubId, DisplayStatus, MergeError, UserId};
use clubmerge_lib::engine::rbac::Role;
use clubmerge_lib::MergeEngine;
use std::sync::Arc;
use std::thread;

const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);
const CAROL: UserId = UserId(3);

struct Clubs {
    db: Database,
    directory: SqliteClubDirectory,
    chess: ClubId,
    go: ClubId,
}

fn setup(root: &std::path::Path) -> Result<Clubs, Box<dyn std::error::Error>> {
    let db = Database::new(&root.join("data").join("clubmerge.db"))?;
    let directory = SqliteClubDirectory::new(db.clone());

    let chess = directory.create_club("Chess", "Tuesday blitz")?.id;
    let go = directory.create_club("Go", "Board games on 19x19")?.id;
    directory.add_membership(ALICE, chess, Role::Organizer)?;
    directory.add_membership(BOB, go, Role::Organizer)?;
    directory.add_membership(CAROL, chess, Role::Member)?;
    directory.add_membership(CAROL, go, Role::Member)?;
    directory.add_meeting(chess, "Blitz night", Utc.with_ymd_and_hms(2026, 11, 3, 18, 0, 0).unwrap())?;
    directory.add_document(go, "Handicap table", "https://example.org/handicap.pdf")?;

    Ok(Clubs {
        db,
        directory,
        chess,
        go,
    })
}

#[test]
fn test_two_sided_merge_flow() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let clubs = setup(root.path())?;
    let engine = MergeEngine::sqlite(&clubs.db).with_audit(AuditLog::new(&root.path().join("audit"))?);

    // 1. Alice proposes; Chess is implicitly on board
    let proposed = engine.create(clubs.chess, clubs.go, ALICE)?;
    assert_eq!(project(&proposed, clubs.chess), Some(DisplayStatus::Pending));
    assert_eq!(project(&proposed, clubs.go), Some(DisplayStatus::ActionRequired));

    // 2. Carol is only a member and cannot act for Go
    assert!(matches!(
        engine.accept(proposed.id, CAROL),
        Err(MergeError::Forbidden { .. })
    ));

    // 3. Bob accepts for Go, which finalizes the merge in the same call
    let merged = engine.accept(proposed.id, BOB)?;
    let merged_club = merged.merged_club_id.expect("merged club recorded");
    assert_eq!(clubs.directory.club_name(merged_club)?.as_deref(), Some("Chess x Go"));

    let members = clubs.directory.list_members(merged_club)?;
    assert_eq!(members.len(), 3);
    assert_eq!(clubs.directory.get_membership(ALICE, merged_club)?, Some(Role::Organizer));
    assert_eq!(clubs.directory.get_membership(CAROL, merged_club)?, Some(Role::Member));
    assert_eq!(clubs.directory.list_meetings(merged_club)?.len(), 1);
    assert_eq!(clubs.directory.list_documents(merged_club)?.len(), 1);

    // 4. Both clubs see the completed merge
    for (club, other) in [(clubs.chess, "Go"), (clubs.go, "Chess")] {
        let views = engine.views_for_club(club)?;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].status, DisplayStatus::MergeComplete);
        assert_eq!(views[0].message, format!("Successfully merged with {}!", other));
    }

    // 5. Terminal state is frozen
    assert!(matches!(engine.accept(proposed.id, ALICE), Err(MergeError::AlreadyMerged(_))));
    assert!(matches!(engine.cancel(proposed.id, BOB), Err(MergeError::AlreadyMerged(_))));

    // 6. The pair can start over once the earlier request is merged
    let again = engine.create(clubs.go, clubs.chess, BOB)?;
    assert_ne!(again.id, proposed.id);

    let audit = AuditLog::new(&root.path().join("audit"))?;
    let actions: Vec<AuditAction> = audit
        .query_by_request(proposed.id)?
        .into_iter()
        .map(|entry| entry.action)
        .collect();
    assert_eq!(
        actions,
        vec![AuditAction::Created, AuditAction::Accepted, AuditAction::Finalized]
    );

    Ok(())
}

#[test]
fn test_concurrent_accepts_merge_once() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let clubs = setup(root.path())?;
    let engine = Arc::new(MergeEngine::sqlite(&clubs.db));
    let request = engine.create(clubs.chess, clubs.go, ALICE)?;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.accept(request.id, BOB))
        })
        .collect();

    for handle in handles {
        match handle.join().expect("accept thread panicked") {
            Ok(_) | Err(MergeError::AlreadyMerged(_)) => {}
            Err(other) => panic!("unexpected accept outcome: {}", other),
        }
    }

    let stored = engine.get(request.id)?;
    assert!(stored.is_merged());
    // Chess, Go and exactly one merged club
    assert_eq!(clubs.directory.list_clubs()?.len(), 3);
    Ok(())
}

#[test]
fn test_cancelled_request_disappears_and_frees_clubs() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let clubs = setup(root.path())?;
    let engine = MergeEngine::sqlite(&clubs.db);

    let request = engine.create(clubs.chess, clubs.go, ALICE)?;
    assert!(clubs.directory.delete_club(clubs.go).is_err());

    engine.cancel(request.id, BOB)?;
    assert!(engine.views_for_club(clubs.chess)?.is_empty());
    assert!(engine.views_for_club(clubs.go)?.is_empty());
    assert!(matches!(engine.get(request.id), Err(MergeError::NotFound(_))));

    clubs.directory.delete_club(clubs.go)?;
    assert!(!clubs.directory.club_exists(clubs.go)?);
    Ok(())
}
