//! End-to-end isolation guarantees of branches, unions and connections.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use branchstore::branch::{Branch, UnionSource};
use branchstore::db::{Database, DatabaseConfig};
use branchstore::model::{Pattern, Statement, Term};
use branchstore::storage::{Dataset, MemoryStore, Source, StoreError, StoreResult};
use branchstore::transaction::IsolationLevel;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn st(subject: &str) -> Statement {
    Statement::triple(subject, "ex:p", "ex:o")
}

fn all(dataset: &dyn Dataset) -> Vec<Statement> {
    dataset
        .statements(&Pattern::any())
        .unwrap()
        .collect::<StoreResult<Vec<_>>>()
        .unwrap()
}

fn fresh_branch() -> Branch {
    Branch::new(Arc::new(MemoryStore::new()))
}

// ---------------------------------------------------------------------------
// Branch-level properties
// ---------------------------------------------------------------------------

#[test]
fn read_your_writes_at_every_isolated_level() {
    for level in [
        IsolationLevel::ReadCommitted,
        IsolationLevel::SnapshotRead,
        IsolationLevel::Snapshot,
        IsolationLevel::Serializable,
    ] {
        let branch = fresh_branch();
        let sink = branch.sink(level).unwrap();
        sink.approve(st("ex:a")).unwrap();
        sink.flush().unwrap();

        let dataset = branch.dataset(level).unwrap();
        assert_eq!(all(dataset.as_ref()), vec![st("ex:a")], "level {}", level);
        dataset.close().unwrap();
        sink.close().unwrap();
    }
}

#[test]
fn snapshot_never_sees_later_flush() {
    let branch = fresh_branch();
    let dataset = branch.dataset(IsolationLevel::Snapshot).unwrap();

    let sink = branch.sink(IsolationLevel::Snapshot).unwrap();
    sink.approve(st("ex:a")).unwrap();
    assert!(all(dataset.as_ref()).is_empty());
    sink.flush().unwrap();
    sink.close().unwrap();

    assert!(all(dataset.as_ref()).is_empty());
    assert!(!dataset.has_statement(&Pattern::exact(&st("ex:a"))).unwrap());
}

#[test]
fn delete_wins_within_one_delta() {
    let branch = fresh_branch();
    let sink = branch.sink(IsolationLevel::Snapshot).unwrap();
    sink.approve(st("ex:a")).unwrap();
    sink.deprecate(st("ex:a")).unwrap();
    sink.flush().unwrap();
    sink.close().unwrap();

    let dataset = branch.dataset(IsolationLevel::Snapshot).unwrap();
    assert!(all(dataset.as_ref()).is_empty());
}

#[test]
fn serializable_prepare_fails_on_matching_sibling() {
    let branch = fresh_branch();
    let sink_a = branch.sink(IsolationLevel::Serializable).unwrap();
    sink_a
        .observe(&Pattern::new(
            Some(Term::new("ex:s")),
            Some(Term::new("ex:p")),
            Some(Term::new("ex:o")),
        ))
        .unwrap();

    let sink_b = branch.sink(IsolationLevel::Serializable).unwrap();
    sink_b.approve(Statement::triple("ex:s", "ex:p", "ex:o")).unwrap();
    sink_b.flush().unwrap();

    match sink_a.prepare() {
        Err(StoreError::Conflict { pattern }) => {
            assert_eq!(pattern.subject, Some(Term::new("ex:s")));
        }
        other => panic!("expected conflict, got {:?}", other),
    }
}

#[test]
fn serializable_prepare_passes_on_unrelated_sibling() {
    let branch = fresh_branch();
    let sink_a = branch.sink(IsolationLevel::Serializable).unwrap();
    sink_a
        .observe(&Pattern::new(Some(Term::new("ex:s")), None, None))
        .unwrap();

    let sink_b = branch.sink(IsolationLevel::Serializable).unwrap();
    sink_b.approve(st("ex:other")).unwrap();
    sink_b.flush().unwrap();

    sink_a.prepare().unwrap();
    sink_a.flush().unwrap();
}

#[test]
fn observations_ignored_below_serializable() {
    let branch = fresh_branch();
    let sink_a = branch.sink(IsolationLevel::Snapshot).unwrap();
    sink_a.observe(&Pattern::any()).unwrap();

    let sink_b = branch.sink(IsolationLevel::Snapshot).unwrap();
    sink_b.approve(st("ex:a")).unwrap();
    sink_b.flush().unwrap();

    sink_a.prepare().unwrap();
}

#[test]
fn union_keeps_cross_partition_duplicates() {
    let explicit = fresh_branch();
    let inferred = fresh_branch();
    for branch in [&explicit, &inferred] {
        let sink = branch.sink(IsolationLevel::Snapshot).unwrap();
        sink.approve(st("ex:a")).unwrap();
        // approved twice within one partition still yields one copy
        sink.approve(st("ex:a")).unwrap();
        sink.approve(st("ex:gone")).unwrap();
        sink.deprecate(st("ex:gone")).unwrap();
        sink.flush().unwrap();
        sink.close().unwrap();
    }

    let union = UnionSource::new(Arc::new(explicit.clone()), Arc::new(inferred.clone()));
    let dataset = union.dataset(IsolationLevel::Snapshot).unwrap();
    assert_eq!(all(dataset.as_ref()), vec![st("ex:a"), st("ex:a")]);

    let explicit_only = explicit.dataset(IsolationLevel::Snapshot).unwrap();
    assert_eq!(all(explicit_only.as_ref()), vec![st("ex:a")]);
}

#[test]
fn end_to_end_example() {
    let branch = fresh_branch();
    let s1 = Statement::new("ex:s1", "ex:p1", "ex:o1", None);

    let sink1 = branch.sink(IsolationLevel::Snapshot).unwrap();
    sink1.approve(s1.clone()).unwrap();
    sink1.flush().unwrap();

    let dataset1 = branch.dataset(IsolationLevel::Snapshot).unwrap();
    assert_eq!(all(dataset1.as_ref()), vec![s1.clone()]);

    let sink2 = branch.sink(IsolationLevel::Snapshot).unwrap();
    sink2.deprecate(s1.clone()).unwrap();
    sink2.flush().unwrap();

    assert_eq!(all(dataset1.as_ref()), vec![s1]);

    let dataset2 = branch.dataset(IsolationLevel::Snapshot).unwrap();
    assert!(all(dataset2.as_ref()).is_empty());
}

#[test]
fn context_clear_with_later_approval() {
    let store = MemoryStore::new();
    let g = Some(Term::new("ex:g"));
    let seed = store.sink(IsolationLevel::None).unwrap();
    seed.approve(st("ex:old").with_context(g.clone())).unwrap();
    seed.approve(st("ex:keep")).unwrap();
    seed.flush().unwrap();

    let branch = Branch::new(Arc::new(store.clone()));
    let sink = branch.sink(IsolationLevel::Snapshot).unwrap();
    sink.clear(&[g.clone()]).unwrap();
    sink.approve(st("ex:new").with_context(g.clone())).unwrap();
    sink.flush().unwrap();
    sink.close().unwrap();

    let dataset = branch.dataset(IsolationLevel::ReadCommitted).unwrap();
    let visible: BTreeSet<Statement> = all(dataset.as_ref()).into_iter().collect();
    let expected: BTreeSet<Statement> = [st("ex:keep"), st("ex:new").with_context(g)]
        .into_iter()
        .collect();
    assert_eq!(visible, expected);
    dataset.close().unwrap();

    branch.flush().unwrap();
    assert_eq!(store.len(), 2);
}

// ---------------------------------------------------------------------------
// Connection-level properties
// ---------------------------------------------------------------------------

#[test]
fn connection_snapshot_is_stable_across_commits() {
    let db = Database::in_memory();
    let mut reader = db.connect();
    let mut writer = db.connect();

    reader.begin_with(IsolationLevel::Snapshot).unwrap();
    assert_eq!(reader.size(&[]).unwrap(), 0);

    writer.add_statement(st("ex:a")).unwrap();
    assert_eq!(reader.size(&[]).unwrap(), 0);

    reader.commit().unwrap();
    assert_eq!(reader.size(&[]).unwrap(), 1);
    assert_eq!(db.stats().explicit_statements, 1);
}

#[test]
fn read_committed_sees_commits_between_reads() {
    let db = Database::in_memory();
    let mut reader = db.connect();
    let mut writer = db.connect();

    reader.begin_with(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(reader.size(&[]).unwrap(), 0);
    writer.add_statement(st("ex:a")).unwrap();
    assert_eq!(reader.size(&[]).unwrap(), 1);
    reader.rollback().unwrap();
}

#[test]
fn write_skew_is_rejected_under_serializable() {
    let db = Database::in_memory();
    let on_call = |who: &str| Statement::triple(who, "ex:onCall", "true");
    let mut setup = db.connect();
    setup.add_statement(on_call("ex:alice")).unwrap();
    setup.add_statement(on_call("ex:bob")).unwrap();

    let pattern = Pattern::new(None, Some(Term::new("ex:onCall")), None);
    let mut alice = db.connect();
    let mut bob = db.connect();
    alice.begin_with(IsolationLevel::Serializable).unwrap();
    bob.begin_with(IsolationLevel::Serializable).unwrap();

    assert_eq!(alice.statements(&pattern, true).unwrap().len(), 2);
    assert_eq!(bob.statements(&pattern, true).unwrap().len(), 2);
    alice.remove_statements(&Pattern::exact(&on_call("ex:alice"))).unwrap();
    bob.remove_statements(&Pattern::exact(&on_call("ex:bob"))).unwrap();

    alice.commit().unwrap();
    let err = bob.commit().unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {}", err);
    assert!(bob.is_active());
    bob.rollback().unwrap();

    // retry sees alice's commit
    bob.begin_with(IsolationLevel::Serializable).unwrap();
    assert_eq!(bob.statements(&pattern, true).unwrap(), vec![on_call("ex:bob")]);
    bob.commit().unwrap();

    assert_eq!(db.stats().explicit_statements, 1);
}

#[test]
fn snapshot_isolation_allows_write_skew() {
    let db = Database::in_memory();
    let mut a = db.connect();
    let mut b = db.connect();
    a.begin_with(IsolationLevel::Snapshot).unwrap();
    b.begin_with(IsolationLevel::Snapshot).unwrap();
    assert_eq!(a.size(&[]).unwrap(), 0);
    assert_eq!(b.size(&[]).unwrap(), 0);

    a.add_statement(st("ex:a")).unwrap();
    b.add_statement(st("ex:b")).unwrap();
    a.commit().unwrap();
    b.commit().unwrap();

    assert_eq!(db.connect().size(&[]).unwrap(), 2);
}

#[test]
fn concurrent_writers_all_land() {
    let db = Database::in_memory();
    thread::scope(|scope| {
        for worker in 0..4 {
            let db = db.clone();
            scope.spawn(move || {
                let mut conn = db.connect();
                conn.with_transaction(IsolationLevel::Snapshot, |conn| {
                    for i in 0..10 {
                        conn.add_statement(st(&format!("ex:w{}-{}", worker, i)))?;
                    }
                    Ok(())
                })
                .unwrap();
            });
        }
    });

    assert_eq!(db.connect().size(&[]).unwrap(), 40);
    assert_eq!(db.stats().explicit_statements, 40);
    assert_eq!(db.stats().active_transactions, 0);
}

#[test]
fn snapshot_reader_stable_under_concurrent_writer() {
    let db = Database::open(DatabaseConfig::new().default_isolation(IsolationLevel::SnapshotRead))
        .unwrap();
    let mut reader = db.connect();
    reader.begin_with(IsolationLevel::Snapshot).unwrap();
    let before = reader.size(&[]).unwrap();

    let writer_db = db.clone();
    thread::spawn(move || {
        let mut writer = writer_db.connect();
        for i in 0..5 {
            writer.add_statement(st(&format!("ex:n{}", i))).unwrap();
        }
    })
    .join()
    .unwrap();

    assert_eq!(reader.size(&[]).unwrap(), before);
    reader.rollback().unwrap();
    assert_eq!(reader.size(&[]).unwrap(), 5);
}
