//! Concurrent connections against one store.
//!
//! The core creates no threads of its own but must be safe under concurrent
//! connection use: commits into one source are totally ordered, snapshots
//! stay stable while siblings flush, and every committed write is visible to
//! snapshots taken after its commit returns.

use std::sync::Arc;
use std::thread;
use stratum_db_connection::Connection;
use stratum_db_core::{Iri, IsolationLevel, Resource, StoreConfig, Value};
use stratum_db_memory::MemoryStore;

fn iri(s: &str) -> Iri {
    Iri::new(format!("http://example.org/{}", s))
}

fn res(s: &str) -> Resource {
    Resource::Iri(iri(s))
}

fn val(s: &str) -> Value {
    Value::Iri(iri(s))
}

fn connect(store: &Arc<MemoryStore>) -> Connection {
    Connection::new(store.clone(), StoreConfig::default()).unwrap()
}

/// Writers on separate threads each commit their own statements; every
/// commit survives and the total is exact.
#[test]
fn test_parallel_writers_all_commit() {
    let store = Arc::new(MemoryStore::new());
    let threads = 4;
    let per_thread = 25;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                let conn = connect(&store);
                for i in 0..per_thread {
                    conn.begin().unwrap();
                    conn.add_statement(
                        res(&format!("w{}s{}", t, i)),
                        iri("p"),
                        val("o"),
                        &[],
                    )
                    .unwrap();
                    conn.commit().unwrap();
                }
                conn.close().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let reader = connect(&store);
    assert_eq!(reader.size(&[]).unwrap(), threads * per_thread);
}

/// A snapshot-isolated reader sees a frozen count while writers commit
/// around it, and the final state afterwards.
#[test]
fn test_reader_stability_during_commits() {
    let store = Arc::new(MemoryStore::new());
    let seeder = connect(&store);
    seeder.begin().unwrap();
    seeder.add_statement(res("seed"), iri("p"), val("o"), &[]).unwrap();
    seeder.commit().unwrap();

    let reader = connect(&store);
    reader.begin_with(IsolationLevel::Snapshot).unwrap();
    assert_eq!(reader.size(&[]).unwrap(), 1);

    let writer = {
        let store = store.clone();
        thread::spawn(move || {
            let conn = connect(&store);
            for i in 0..20 {
                conn.begin().unwrap();
                conn.add_statement(res(&format!("s{}", i)), iri("p"), val("o"), &[])
                    .unwrap();
                conn.commit().unwrap();
            }
        })
    };
    writer.join().unwrap();

    // Still the snapshot taken before the writer ran.
    assert_eq!(reader.size(&[]).unwrap(), 1);
    reader.rollback().unwrap();
    assert_eq!(reader.size(&[]).unwrap(), 21);
}

/// Serializable writers racing on the same observed pattern: at most one of
/// a conflicting pair commits, and the store never shows partial state.
#[test]
fn test_serializable_race_first_committer_wins() {
    let store = Arc::new(MemoryStore::new());

    let c1 = connect(&store);
    let c2 = connect(&store);
    for conn in [&c1, &c2] {
        conn.begin_with(IsolationLevel::Serializable).unwrap();
        let rdf_type = iri("rdfType");
        let mut observed = conn
            .statements(None, Some(&rdf_type), None, false, &[])
            .unwrap();
        observed.collect_all().unwrap();
    }
    c1.add_statement(res("a"), iri("rdfType"), val("A"), &[]).unwrap();
    c2.add_statement(res("b"), iri("rdfType"), val("B"), &[]).unwrap();

    let first = c1.commit();
    let second = c2.commit();

    assert!(first.is_ok());
    assert!(second.is_err());
    assert!(second.unwrap_err().is_conflict());

    let reader = connect(&store);
    assert_eq!(reader.size(&[]).unwrap(), 1);
    assert!(reader
        .has_statement(Some(&res("a")), None, None, false, &[])
        .unwrap());
}

/// Closing a connection from the owning thread while its iterator is held
/// elsewhere interrupts the iterator cleanly.
#[test]
fn test_cross_thread_iterator_interruption() {
    let store = Arc::new(MemoryStore::new());
    let conn = connect(&store);
    conn.begin().unwrap();
    for i in 0..100 {
        conn.add_statement(res(&format!("s{}", i)), iri("p"), val("o"), &[])
            .unwrap();
    }
    conn.commit().unwrap();

    let mut iter = conn.statements(None, None, None, false, &[]).unwrap();
    assert!(iter.next().unwrap().is_some());

    let closer = thread::spawn(move || {
        conn.close().unwrap();
    });
    closer.join().unwrap();

    assert!(iter.next().is_err());
}
