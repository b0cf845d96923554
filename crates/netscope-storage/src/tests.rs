//! Durability tests for the database

use super::*;
use chrono::{Duration, TimeZone};
use netscope_core::{NodeAttributes, NodeDetails};
use tempfile::tempdir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
}

fn attributes(ip: &str) -> NodeAttributes {
    NodeAttributes {
        ip: ip.to_string(),
        port: 11625,
        quorum_set: None,
        quorum_set_hash: None,
        details: NodeDetails::default(),
        geo: None,
        organization: None,
        ip_change: false,
    }
}

/// Create identity and first snapshot for `key`.
fn seed(db: &Database, key: &str, time: DateTime<Utc>) -> Snapshot<NodeKind> {
    IdentityStore::<NodeKind>::find_or_create(db, &key.to_string(), time).unwrap();
    let first = Snapshot::open(key.to_string(), time, attributes("10.0.0.1"));
    db.save(std::slice::from_ref(&first)).unwrap();
    first
}

#[test]
fn test_committed_writes_survive_reopen() {
    let dir = tempdir().unwrap();
    let (first, successor) = {
        let db = Database::open(dir.path()).unwrap();
        let first = seed(&db, "GA", t0());

        let t1 = t0() + Duration::days(1);
        let successor = Snapshot::open("GA".to_string(), t1, attributes("10.0.0.2"));
        db.save(&[first.closed_at(t1), successor.clone()]).unwrap();
        db.record_activity([&"GA".to_string()], t1).unwrap();
        (first, successor)
    };

    let db = Database::open(dir.path()).unwrap();
    let history = db.history::<NodeKind>("GA");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, first.id);
    assert_eq!(history[0].end_time, successor.start_time);
    assert_eq!(history[1], successor);

    let identity = IdentityStore::<NodeKind>::find(&db, &"GA".to_string())
        .unwrap()
        .unwrap();
    assert_eq!(identity.first_observed_at, t0());
    assert!(db
        .find_identities_inactive_since(t0() + Duration::days(2))
        .unwrap()
        .contains(&"GA".to_string()));
    assert!(db.verify().is_empty());
}

#[test]
fn test_rejected_batch_is_not_logged() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(dir.path()).unwrap();
        seed(&db, "GA", t0());

        // second active snapshot for the same identity
        let rogue = Snapshot::<NodeKind>::open("GA".to_string(), t0() + Duration::hours(1), attributes("10.0.0.9"));
        let err = db.save(std::slice::from_ref(&rogue)).unwrap_err();
        assert!(matches!(err, StoreError::ActiveConflict { .. }));
        assert!(!err.is_fatal());
    }

    let db = Database::open(dir.path()).unwrap();
    assert_eq!(db.history::<NodeKind>("GA").len(), 1);
}

#[test]
fn test_closed_snapshot_cannot_change() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    let first = seed(&db, "GA", t0());
    let t1 = t0() + Duration::days(1);
    db.save(&[first.closed_at(t1)]).unwrap();

    let moved = first.closed_at(t1 + Duration::hours(1));
    assert!(matches!(
        db.save(&[moved]),
        Err(StoreError::AppendOnly { .. })
    ));

    let mut rewritten = first.closed_at(t1);
    rewritten.payload.port = 1;
    assert!(matches!(
        db.save(&[rewritten]),
        Err(StoreError::AppendOnly { .. })
    ));
}

#[test]
fn test_snapshot_without_identity_is_rejected() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    let orphan = Snapshot::<NodeKind>::open("GX".to_string(), t0(), attributes("10.0.0.1"));
    assert!(matches!(
        db.save(&[orphan]),
        Err(StoreError::MissingIdentity { .. })
    ));
}

#[test]
fn test_checkpoint_truncates_wal_and_restores_state() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(dir.path()).unwrap();
        let first = seed(&db, "GA", t0());
        seed(&db, "GB", t0());
        let cycle = db.begin_cycle(t0()).unwrap();
        db.complete_cycle(cycle.sequence).unwrap();

        db.checkpoint().unwrap();
        assert_eq!(db.stats().unwrap().wal_bytes, 0);
        assert!(dir.path().join(STATE_FILE).exists());

        // written after the checkpoint, lives only in the WAL
        db.save(&[first.closed_at(t0() + Duration::days(1))]).unwrap();
    }

    let db = Database::open(dir.path()).unwrap();
    let stats = db.stats().unwrap();
    assert_eq!(stats.node_snapshots, 2);
    assert_eq!(stats.node_identities, 2);
    assert_eq!(stats.cycles, 1);
    assert!(db.latest_cycle().unwrap().unwrap().completed);

    let history = db.history::<NodeKind>("GA");
    assert!(!history[0].is_active());
    assert!(db.history::<NodeKind>("GB")[0].is_active());
}

#[test]
fn test_replay_after_interrupted_checkpoint_is_idempotent() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(dir.path()).unwrap();
        seed(&db, "GA", t0());
        db.checkpoint().unwrap();
    }
    // state.bin written but WAL not truncated: rewrite the same transaction
    {
        let wal = WriteAheadLog::open(&dir.path().join(WAL_FILE)).unwrap();
        let identity = Identity::<NodeKind> {
            key: "GA".to_string(),
            first_observed_at: t0(),
        };
        wal.append_tx(1, vec![WalOp::PutNodeIdentity(identity)]).unwrap();
    }

    let db = Database::open(dir.path()).unwrap();
    assert_eq!(db.stats().unwrap().node_identities, 1);
    assert_eq!(db.history::<NodeKind>("GA").len(), 1);

    // new transactions get fresh ids
    seed(&db, "GB", t0());
    drop(db);
    let db = Database::open(dir.path()).unwrap();
    assert_eq!(db.stats().unwrap().node_snapshots, 2);
}

#[test]
fn test_point_in_time_queries() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    let first = seed(&db, "GA", t0());
    let t1 = t0() + Duration::days(3);
    db.save(&[
        first.closed_at(t1),
        Snapshot::open("GA".to_string(), t1, attributes("10.0.0.2")),
    ])
    .unwrap();

    let store: &dyn SnapshotStore<NodeKind> = &db;
    let before = store.find_active_at(t0() + Duration::days(1)).unwrap();
    assert_eq!(before[0].payload.ip, "10.0.0.1");
    let after = store.find_active_at(t1).unwrap();
    assert_eq!(after[0].payload.ip, "10.0.0.2");

    let key = "GA".to_string();
    assert_eq!(
        store
            .find_for_identity_between(&key, t0(), t0() + Duration::days(10))
            .unwrap()
            .len(),
        2
    );
    assert!(store
        .find_latest_archived_for_identity(&key)
        .unwrap()
        .is_some_and(|s| s.id == first.id));
}
