//! Cycle-level scenarios against the in-memory store

use super::*;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct CollectingReporter {
    failures: Mutex<Vec<EntityFailure>>,
}

impl FailureReporter for CollectingReporter {
    fn report(&self, failure: &EntityFailure) {
        self.failures.lock().push(failure.clone());
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    config: SnapshotConfig,
    reporter: Arc<CollectingReporter>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(SnapshotConfig::default())
    }

    fn with_config(config: SnapshotConfig) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            config,
            reporter: Arc::new(CollectingReporter::default()),
        }
    }

    fn orchestrator(&self, time: DateTime<Utc>) -> SnapshotOrchestrator {
        SnapshotOrchestrator::new(
            &self.config,
            Stores::shared(self.store.clone()),
            Arc::new(FixedClock(time)),
            self.reporter.clone(),
        )
    }

    /// Record activity for every observed node and run one cycle.
    fn cycle(
        &self,
        time: DateTime<Utc>,
        nodes: Vec<ObservedNode>,
        organizations: Vec<ObservedOrganization>,
    ) -> CycleReport {
        self.store
            .record_activity(nodes.iter().map(|n| &n.public_key), time);
        self.orchestrator(time)
            .run_cycle(&nodes, &organizations)
            .unwrap()
    }

    fn nodes(&self, key: &str) -> Vec<Snapshot<NodeKind>> {
        self.store.history::<NodeKind>(key)
    }

    fn organizations(&self, key: &str) -> Vec<Snapshot<OrganizationKind>> {
        self.store.history::<OrganizationKind>(key)
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()
}

fn watcher(key: &str) -> ObservedNode {
    ObservedNode {
        public_key: key.to_string(),
        ip: "10.0.0.1".to_string(),
        port: 11625,
        quorum_set: None,
        details: NodeDetails::default(),
        geo: None,
        organization_id: None,
    }
}

fn validator(key: &str) -> ObservedNode {
    ObservedNode {
        quorum_set: Some(QuorumSet {
            threshold: 2,
            validators: vec!["GA".to_string(), "GB".to_string(), "GC".to_string()],
            inner_quorum_sets: vec![],
        }),
        ..watcher(key)
    }
}

fn organization(id: &str, members: &[&str]) -> ObservedOrganization {
    ObservedOrganization {
        id: id.to_string(),
        name: Some(format!("{} foundation", id)),
        url: Some("https://example.org".to_string()),
        description: None,
        horizon_url: None,
        contact: ContactInfo::default(),
        members: members.iter().map(|m| m.to_string()).collect(),
    }
}

// ============================================================================
// Node lifecycle
// ============================================================================

#[test]
fn test_first_observation_then_quorum_set() {
    let harness = Harness::new();

    harness.cycle(t0(), vec![watcher("N1")], vec![]);
    let history = harness.nodes("N1");
    assert_eq!(history.len(), 1);
    assert!(history[0].is_active());
    assert_eq!(history[0].end_time, max_sentinel());
    assert_eq!(history[0].payload.ip, "10.0.0.1");
    assert_eq!(history[0].payload.port, 11625);
    assert!(history[0].payload.quorum_set.is_none());

    let t1 = t0() + Duration::days(2);
    let report = harness.cycle(t1, vec![validator("N1")], vec![]);
    assert_eq!(report.nodes.updated, 1);

    let history = harness.nodes("N1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].end_time, t1);
    assert_eq!(history[1].start_time, t1);
    assert!(history[1].is_active());
    assert!(history[1].payload.is_validator());
    assert_eq!(history[0].identity, history[1].identity);
    assert!(harness.store.verify().is_empty());
}

#[test]
fn test_ip_flap_damping() {
    let harness = Harness::new();
    harness.cycle(t0(), vec![watcher("N1")], vec![]);

    let mut moved = watcher("N1");
    moved.ip = "10.0.0.2".to_string();

    let report = harness.cycle(t0() + Duration::hours(1), vec![moved.clone()], vec![]);
    assert_eq!(report.nodes.suppressed, 1);
    assert_eq!(harness.nodes("N1").len(), 1);

    let report = harness.cycle(t0() + Duration::hours(25), vec![moved], vec![]);
    assert_eq!(report.nodes.updated, 1);
    let history = harness.nodes("N1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].payload.ip, "10.0.0.2");
    assert!(history[1].payload.ip_change);
}

#[test]
fn test_flap_with_other_change_is_versioned() {
    let harness = Harness::new();
    harness.cycle(t0(), vec![watcher("N1")], vec![]);

    let mut moved = validator("N1");
    moved.ip = "10.0.0.2".to_string();
    let report = harness.cycle(t0() + Duration::hours(1), vec![moved], vec![]);
    assert_eq!(report.nodes.updated, 1);
    assert_eq!(harness.nodes("N1").len(), 2);
}

#[test]
fn test_unchanged_observation_is_idempotent() {
    let harness = Harness::new();
    let nodes = vec![validator("N1"), watcher("N2")];
    let organizations = vec![organization("O1", &["N1", "N2"])];

    harness.cycle(t0(), nodes.clone(), organizations.clone());
    let before = (
        harness.store.snapshot_count::<NodeKind>(),
        harness.store.snapshot_count::<OrganizationKind>(),
    );

    let report = harness.cycle(t0() + Duration::hours(1), nodes, organizations);
    assert_eq!(report.nodes.unchanged, 2);
    assert_eq!(report.organizations.unchanged, 1);
    assert_eq!(report.nodes.created + report.nodes.updated, 0);
    assert_eq!(
        before,
        (
            harness.store.snapshot_count::<NodeKind>(),
            harness.store.snapshot_count::<OrganizationKind>(),
        )
    );
}

#[test]
fn test_absent_node_is_retained() {
    let harness = Harness::new();
    harness.cycle(t0(), vec![watcher("N1")], vec![]);

    let report = harness.cycle(t0() + Duration::hours(2), vec![], vec![]);
    assert_eq!(report.nodes.retained_absent, 1);
    assert_eq!(report.active_nodes, 1);
    assert!(harness.nodes("N1")[0].is_active());
}

// ============================================================================
// Organizations
// ============================================================================

#[test]
fn test_member_order_does_not_version() {
    let harness = Harness::new();
    let nodes = vec![watcher("A"), watcher("B"), watcher("C")];

    harness.cycle(t0(), nodes.clone(), vec![organization("O1", &["A", "B", "C"])]);
    let report = harness.cycle(
        t0() + Duration::hours(1),
        nodes,
        vec![organization("O1", &["C", "B", "A"])],
    );

    assert_eq!(report.organizations.unchanged, 1);
    assert_eq!(harness.organizations("O1").len(), 1);
}

#[test]
fn test_organization_without_active_members_is_not_created() {
    let harness = Harness::new();
    let report = harness.cycle(t0(), vec![], vec![organization("O1", &["N1"])]);
    assert_eq!(report.organizations.created, 0);
    assert!(harness.organizations("O1").is_empty());
}

#[test]
fn test_new_member_versions_organization() {
    let harness = Harness::new();
    harness.cycle(t0(), vec![watcher("A")], vec![organization("O1", &["A", "B"])]);
    assert_eq!(harness.organizations("O1")[0].payload.members.len(), 1);

    harness.cycle(
        t0() + Duration::hours(1),
        vec![watcher("A"), watcher("B")],
        vec![organization("O1", &["A", "B"])],
    );
    let history = harness.organizations("O1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].payload.members.len(), 2);
}

#[test]
fn test_absent_organization_archived_when_configured() {
    let mut config = SnapshotConfig::default();
    config.organization.archive_when_absent = true;
    let harness = Harness::with_config(config);

    harness.cycle(t0(), vec![watcher("A")], vec![organization("O1", &["A"])]);
    let report = harness.cycle(t0() + Duration::hours(1), vec![watcher("A")], vec![]);

    assert_eq!(report.organizations.archived, 1);
    let history = harness.organizations("O1");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].end_time, t0() + Duration::hours(1));
}

// ============================================================================
// Archival and demotion
// ============================================================================

#[test]
fn test_demotion_then_archival() {
    let harness = Harness::new();
    harness.cycle(t0(), vec![validator("N1")], vec![organization("O1", &["N1"])]);

    // inactive for two days: demoted, still active
    let t1 = t0() + Duration::days(2);
    let report = harness.cycle(t1, vec![], vec![organization("O1", &["N1"])]);
    assert_eq!(report.archival.demoted_nodes, 1);
    assert_eq!(report.archival.archived_nodes, 0);
    let history = harness.nodes("N1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].end_time, t1);
    assert!(history[1].is_active());
    assert!(history[1].payload.quorum_set.is_none());
    assert!(history[1].payload.quorum_set_hash.is_none());
    assert!(harness.organizations("O1")[0].is_active());

    // demotion is not repeated
    let report = harness.cycle(t1 + Duration::days(1), vec![], vec![]);
    assert_eq!(report.archival.demoted_nodes, 0);

    // inactive for eight days: archived, and the organization with it
    let t2 = t0() + Duration::days(8);
    let report = harness.cycle(t2, vec![], vec![organization("O1", &["N1"])]);
    assert_eq!(report.archival.archived_nodes, 1);
    assert_eq!(report.archival.archived_organizations, 1);
    assert_eq!(report.active_nodes, 0);
    assert_eq!(report.active_organizations, 0);

    let history = harness.nodes("N1");
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|s| !s.is_active()));
    assert_eq!(history[1].end_time, t2);

    let organizations = harness.organizations("O1");
    assert_eq!(organizations.len(), 1);
    assert_eq!(organizations[0].end_time, t2);
    assert!(harness.store.verify().is_empty());
}

#[test]
fn test_demotion_at_exact_threshold() {
    let harness = Harness::new();
    harness.cycle(t0(), vec![validator("N1")], vec![]);

    let t1 = t0() + harness.config.archival.demote_after();
    let report = harness.cycle(t1, vec![], vec![]);
    assert_eq!(report.archival.demoted_nodes, 1);
    assert_eq!(report.archival.archived_nodes, 0);
    assert!(harness.nodes("N1")[1].payload.quorum_set.is_none());
}

#[test]
fn test_archival_at_exact_threshold() {
    let harness = Harness::new();
    harness.cycle(t0(), vec![watcher("N1")], vec![]);

    let one_short = t0() + harness.config.archival.archive_after() - Duration::seconds(1);
    let report = harness.cycle(one_short, vec![], vec![]);
    assert_eq!(report.archival.archived_nodes, 0);

    let t1 = t0() + harness.config.archival.archive_after();
    let report = harness.cycle(t1, vec![], vec![]);
    assert_eq!(report.archival.archived_nodes, 1);
    assert_eq!(report.active_nodes, 0);
    assert_eq!(harness.nodes("N1")[0].end_time, t1);
}

#[test]
fn test_archived_organization_not_recreated_while_members_archived() {
    let harness = Harness::new();
    harness.cycle(t0(), vec![watcher("N1")], vec![organization("O1", &["N1"])]);
    harness.cycle(t0() + Duration::days(8), vec![], vec![organization("O1", &["N1"])]);

    let report = harness.cycle(
        t0() + Duration::days(9),
        vec![],
        vec![organization("O1", &["N1"])],
    );
    assert_eq!(report.organizations.rediscovered, 0);
    assert_eq!(report.organizations.created, 0);
    assert!(harness.organizations("O1").iter().all(|s| !s.is_active()));
}

#[test]
fn test_rediscovery_reuses_identity() {
    let harness = Harness::new();
    harness.cycle(t0(), vec![validator("N1")], vec![organization("O1", &["N1"])]);
    harness.cycle(t0() + Duration::days(8), vec![], vec![]);
    assert!(harness.nodes("N1").iter().all(|s| !s.is_active()));

    let t3 = t0() + Duration::days(9);
    let report = harness.cycle(t3, vec![validator("N1")], vec![organization("O1", &["N1"])]);
    assert_eq!(report.nodes.rediscovered, 1);
    assert_eq!(report.organizations.rediscovered, 1);
    assert_eq!(report.nodes.created, 0);

    let history = harness.nodes("N1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].start_time, t3);
    assert!(history[1].is_active());

    let identity = IdentityStore::<NodeKind>::find(harness.store.as_ref(), &"N1".to_string())
        .unwrap()
        .unwrap();
    assert_eq!(identity.first_observed_at, t0());

    let organizations = harness.organizations("O1");
    assert_eq!(organizations.len(), 2);
    assert_eq!(organizations[0].payload, organizations[1].payload);
    assert!(organizations[1].is_active());
}

// ============================================================================
// Failure isolation
// ============================================================================

#[test]
fn test_bad_records_do_not_abort_batch() {
    let harness = Harness::new();
    let mut broken = watcher("N3");
    broken.port = 0;

    let report = harness.cycle(
        t0(),
        vec![watcher("N1"), watcher("N2"), watcher("N2"), broken],
        vec![organization("", &["N1"])],
    );

    assert_eq!(report.nodes.created, 1);
    assert_eq!(harness.nodes("N1").len(), 1);
    assert!(harness.nodes("N2").is_empty());
    assert!(harness.nodes("N3").is_empty());

    assert_eq!(report.failures.len(), 3);
    assert!(report
        .failures
        .iter()
        .all(|f| f.class == FailureClass::Processing));
    assert_eq!(harness.reporter.failures.lock().len(), 3);
}

#[test]
fn test_double_active_identity_is_skipped() {
    let harness = Harness::new();
    let strategy = NodeStrategy::new(&NodeConfig::default());
    let payload = strategy.build(&watcher("GDUP"), None);
    harness.store.insert_unchecked::<NodeKind>(vec![
        Snapshot::open("GDUP".to_string(), t0(), payload.clone()),
        Snapshot::open("GDUP".to_string(), t0(), payload),
    ]);

    let mut changed = validator("GDUP");
    changed.ip = "10.9.9.9".to_string();
    let report = harness.cycle(
        t0() + Duration::days(1),
        vec![changed, watcher("N1")],
        vec![],
    );

    assert_eq!(report.nodes.created, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].class, FailureClass::Integrity);
    assert_eq!(report.failures[0].key, "GDUP");
    assert_eq!(harness.nodes("GDUP").len(), 2);
    // still active in the store, so still counted
    assert_eq!(report.active_nodes, 2);

    let violations = harness.store.verify();
    assert!(!violations.is_empty());
    assert!(violations.iter().all(|v| v.key == "GDUP"));
}

#[test]
fn test_double_active_member_keeps_organization() {
    let harness = Harness::new();
    harness.cycle(
        t0(),
        vec![watcher("A"), watcher("B")],
        vec![organization("O1", &["A", "B"])],
    );
    let strategy = NodeStrategy::new(&NodeConfig::default());
    harness.store.insert_unchecked::<NodeKind>(vec![Snapshot::open(
        "A".to_string(),
        t0() + Duration::minutes(5),
        strategy.build(&watcher("A"), None),
    )]);

    let report = harness.cycle(
        t0() + Duration::hours(1),
        vec![watcher("A"), watcher("B")],
        vec![organization("O1", &["A", "B"])],
    );
    assert_eq!(report.organizations.unchanged, 1);
    assert_eq!(report.organizations.updated, 0);
    assert_eq!(report.active_nodes, 2);
    assert_eq!(report.active_organizations, 1);

    let organizations = harness.organizations("O1");
    assert_eq!(organizations.len(), 1);
    assert!(organizations[0].payload.members.contains("A"));
}

#[test]
fn test_clock_skew_is_integrity_failure() {
    let harness = Harness::new();
    harness.cycle(t0() + Duration::days(1), vec![watcher("N1")], vec![]);

    let report = harness.cycle(t0(), vec![validator("N1")], vec![]);
    assert_eq!(report.nodes.updated, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].class, FailureClass::Integrity);
    assert_eq!(harness.nodes("N1").len(), 1);
    assert_eq!(report.active_nodes, 1);

    // the skipped node is still reported as active to organizations
    let snapshotter = NodeSnapshotter::new(
        Reconciler::new(
            harness.store.clone(),
            harness.store.clone(),
            harness.reporter.clone(),
        ),
        &NodeConfig::default(),
    );
    let outcome = snapshotter.reconcile(&[validator("N1")], t0()).unwrap();
    assert!(outcome.active.is_empty());
    assert_eq!(outcome.skipped.len(), 1);
    assert!(outcome.active_keys().contains("N1"));
}

struct UnavailableStore;

impl SnapshotStore<NodeKind> for UnavailableStore {
    fn find_active(&self) -> Result<Vec<Snapshot<NodeKind>>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
    fn find_active_for_identity(
        &self,
        _key: &PublicKey,
    ) -> Result<Option<Snapshot<NodeKind>>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
    fn find_latest_archived_for_identity(
        &self,
        _key: &PublicKey,
    ) -> Result<Option<Snapshot<NodeKind>>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
    fn find_active_at(&self, _time: DateTime<Utc>) -> Result<Vec<Snapshot<NodeKind>>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
    fn find_for_identity_between(
        &self,
        _key: &PublicKey,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<Snapshot<NodeKind>>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
    fn save(&self, _batch: &[Snapshot<NodeKind>]) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[test]
fn test_unavailable_store_aborts_cycle() {
    let store = Arc::new(MemoryStore::new());
    let mut stores = Stores::shared(store.clone());
    stores.node_snapshots = Arc::new(UnavailableStore);

    let orchestrator = SnapshotOrchestrator::new(
        &SnapshotConfig::default(),
        stores,
        Arc::new(FixedClock(t0())),
        Arc::new(TracingReporter),
    );
    let result = orchestrator.run_cycle(&vec![watcher("N1")], &vec![organization("O1", &["N1"])]);

    assert!(matches!(result, Err(CycleError::Nodes(StoreError::Unavailable(_)))));
    assert_eq!(store.snapshot_count::<OrganizationKind>(), 0);
    let cycle = store.latest_cycle().unwrap().unwrap();
    assert!(!cycle.completed);
}

// ============================================================================
// Read side
// ============================================================================

#[test]
fn test_point_in_time_and_range_queries() {
    let harness = Harness::new();
    harness.cycle(t0(), vec![watcher("N1")], vec![]);
    harness.cycle(t0() + Duration::days(2), vec![validator("N1")], vec![]);

    let store: &dyn SnapshotStore<NodeKind> = harness.store.as_ref();
    let at_day_one = store.find_active_at(t0() + Duration::days(1)).unwrap();
    assert_eq!(at_day_one.len(), 1);
    assert!(at_day_one[0].payload.quorum_set.is_none());

    let at_day_three = store.find_active_at(t0() + Duration::days(3)).unwrap();
    assert!(at_day_three[0].payload.quorum_set.is_some());

    assert!(store.find_active_at(t0() - Duration::days(1)).unwrap().is_empty());

    let key = "N1".to_string();
    let range = store
        .find_for_identity_between(&key, t0(), t0() + Duration::days(1))
        .unwrap();
    assert_eq!(range.len(), 1);
    let range = store
        .find_for_identity_between(&key, t0(), t0() + Duration::days(5))
        .unwrap();
    assert_eq!(range.len(), 2);
}

#[test]
fn test_cycle_journal_records_completion() {
    let harness = Harness::new();
    let report = harness.cycle(t0(), vec![watcher("N1")], vec![]);
    let cycle = harness.store.latest_cycle().unwrap().unwrap();
    assert_eq!(cycle.sequence, report.sequence);
    assert_eq!(cycle.observed_at, t0());
    assert!(cycle.completed);
}
