mod fixtures;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use datamapper::prelude::*;
use datamapper::{TransactionError, TransactionErrorKind};
use datamapper_memory::MemoryDriver;
use fixtures::*;

fn names(driver: &MemoryDriver, table: &str) -> Vec<Value> {
    datamapper_memory::column_values(&driver.rows(table).unwrap(), "name")
}

fn text_value(s: &str) -> Value {
    Value::Text(s.to_string())
}

#[test]
fn nested_rollback_keeps_outer_work() {
    let (manager, driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        let mut session = manager.session();
        let outcome = session
            .transactional(&cx, Propagation::Required, async |s: &mut Session<MemoryDriver>| {
                s.create(Entity::new("Author").with("name", "Outer")).unwrap();

                let inner = s
                    .transactional(&cx, Propagation::Nested, async |s: &mut Session<MemoryDriver>| {
                        s.create(Entity::new("Author").with("name", "Inner")).unwrap();
                        unwrap_outcome(s.flush(&cx).await);
                        Outcome::<(), Error>::Err(Error::Custom("abandon inner work".into()))
                    })
                    .await;
                assert!(matches!(inner, Outcome::Err(Error::Custom(_))));
                assert!(s.in_transaction());
                assert_eq!(s.pending_counts().new, 1);
                Outcome::Ok(())
            })
            .await;
        unwrap_outcome(outcome);

        assert_eq!(names(&driver, "author"), vec![text_value("Outer")]);
        let transcript = driver.transcript();
        assert_eq!(count(&transcript, "SAVEPOINT sp_1"), 1);
        assert_eq!(count(&transcript, "ROLLBACK TO sp_1"), 1);
        assert_eq!(count(&transcript, "COMMIT"), 1);
        assert!(!session.in_transaction());
        assert_eq!(session.scope_depth(), 0);
    });
}

#[test]
fn requires_new_commits_independently_of_the_outer_scope() {
    let (manager, driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        let mut session = manager.session();
        let outcome = session
            .transactional(&cx, Propagation::Required, async |s: &mut Session<MemoryDriver>| {
                s.create(Entity::new("Author").with("name", "Flushed")).unwrap();
                unwrap_outcome(s.flush(&cx).await);
                // Left pending: it belongs to the outer transaction only.
                s.create(Entity::new("Author").with("name", "Pending")).unwrap();

                let audit = s
                    .transactional(&cx, Propagation::RequiresNew, async |s: &mut Session<MemoryDriver>| {
                        s.create(Entity::new("Author").with("name", "Audit")).unwrap();
                        Outcome::<(), Error>::Ok(())
                    })
                    .await;
                unwrap_outcome(audit);
                assert!(s.in_transaction());
                assert_eq!(s.pending_counts().new, 1);
                Outcome::<(), Error>::Err(Error::Custom("outer fails".into()))
            })
            .await;
        assert!(matches!(outcome, Outcome::Err(Error::Custom(_))));

        assert_eq!(names(&driver, "author"), vec![text_value("Audit")]);
        assert!(!session.in_transaction());
    });
}

#[test]
fn requires_new_work_stays_committed_after_the_outer_rollback() {
    let (manager, driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        let mut session = manager.session();
        let draft = session
            .create(Entity::new("Author").with("name", "Draft"))
            .unwrap();
        unwrap_outcome(session.flush(&cx).await);

        let outcome = session
            .transactional(&cx, Propagation::Required, async |s: &mut Session<MemoryDriver>| {
                let inner = s
                    .transactional(&cx, Propagation::RequiresNew, async |s: &mut Session<MemoryDriver>| {
                        s.create(Entity::new("Author").with("name", "Audit")).unwrap();
                        s.set(draft, "name", "Final").unwrap();
                        Outcome::<(), Error>::Ok(())
                    })
                    .await;
                unwrap_outcome(inner);
                Outcome::<(), Error>::Err(Error::Custom("outer fails".into()))
            })
            .await;
        assert!(matches!(outcome, Outcome::Err(Error::Custom(_))));

        // The outer rollback keeps what the independent transaction committed.
        assert_eq!(
            names(&driver, "author"),
            vec![text_value("Final"), text_value("Audit")]
        );
        assert_eq!(session.state(draft).unwrap(), EntityState::Managed);
        assert_eq!(
            session.get(draft).unwrap().scalar("name"),
            Some(&text_value("Final"))
        );
        assert!(session.changed_fields(draft).unwrap().is_empty());
        let audit = unwrap_outcome(
            session
                .find_by(&cx, "Author", Filter::eq(["name"], vec![text_value("Audit")]))
                .await,
        );
        assert_eq!(audit.len(), 1);
        assert_eq!(session.state(audit[0]).unwrap(), EntityState::Managed);
        assert_eq!(session.pending_counts().total(), 0);

        driver.clear_log();
        let again = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(again.statements, 0);
        assert_eq!(driver.row_count("author"), 2);
    });
}

#[test]
fn not_supported_scope_leaves_outer_work_to_the_transaction() {
    let (manager, driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        let mut session = manager.session();
        let outcome = session
            .transactional(&cx, Propagation::Required, async |s: &mut Session<MemoryDriver>| {
                s.create(Entity::new("Author").with("name", "Outer")).unwrap();
                let outside = s
                    .transactional(&cx, Propagation::NotSupported, async |s: &mut Session<MemoryDriver>| {
                        assert!(!s.in_transaction());
                        s.create(Entity::new("Author").with("name", "Log")).unwrap();
                        unwrap_outcome(s.flush(&cx).await);
                        Outcome::<(), Error>::Ok(())
                    })
                    .await;
                unwrap_outcome(outside);
                Outcome::<(), Error>::Err(Error::Custom("outer fails".into()))
            })
            .await;
        assert!(matches!(outcome, Outcome::Err(Error::Custom(_))));

        assert_eq!(names(&driver, "author"), vec![text_value("Log")]);
        assert_eq!(session.debug_state().managed, 1);
        assert_eq!(session.pending_counts().total(), 0);
    });
}

#[test]
fn failed_joined_scope_dooms_the_transaction() {
    let (manager, driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        let mut session = manager.session();
        let outcome = session
            .transactional(&cx, Propagation::Required, async |s: &mut Session<MemoryDriver>| {
                s.create(Entity::new("Author").with("name", "Outer")).unwrap();
                let joined = s
                    .transactional(&cx, Propagation::Required, async |_: &mut Session<MemoryDriver>| {
                        Outcome::<(), Error>::Err(Error::Custom("inner fails".into()))
                    })
                    .await;
                assert!(matches!(joined, Outcome::Err(Error::Custom(_))));
                assert!(s.is_rollback_only());
                Outcome::Ok(())
            })
            .await;

        let err = expect_err(outcome);
        assert!(matches!(
            err,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::RollbackOnly,
                ..
            })
        ));
        assert_eq!(driver.row_count("author"), 0);
        assert!(!session.in_transaction());
    });
}

#[test]
fn failed_flush_inside_a_transaction_can_be_retried() {
    let (manager, driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        let mut session = manager.session();
        let guard = unwrap_outcome(session.begin_scope(&cx, Propagation::Required).await);

        let first = session
            .create(Entity::new("Tag").with("label", "poetry"))
            .unwrap();
        let second = session
            .create(Entity::new("Tag").with("label", "poetry"))
            .unwrap();
        let err = expect_err(session.flush(&cx).await);
        assert_eq!(err.conflicting_entity(), Some(second));
        assert!(session.in_transaction());
        assert_eq!(driver.row_count("tag"), 0);
        assert_eq!(count(&driver.transcript(), "ROLLBACK TO flush_1"), 1);

        session.set(second, "label", "essays").unwrap();
        unwrap_outcome(session.commit_scope(&cx, guard).await);

        assert_eq!(driver.row_count("tag"), 2);
        assert_eq!(session.state(first).unwrap(), EntityState::Managed);
        assert_eq!(session.state(second).unwrap(), EntityState::Managed);
    });
}

#[test]
fn propagation_rules_are_enforced() {
    let (manager, _driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        let mut session = manager.session();
        let err = expect_err(session.begin_scope(&cx, Propagation::Mandatory).await);
        assert!(matches!(
            err,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NoActiveTransaction,
                ..
            })
        ));

        let root = unwrap_outcome(session.begin_scope(&cx, Propagation::Required).await);
        let err = expect_err(session.begin_scope(&cx, Propagation::Never).await);
        assert!(matches!(
            err,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::ExistingTransaction,
                ..
            })
        ));

        let outside = unwrap_outcome(session.begin_scope(&cx, Propagation::NotSupported).await);
        assert!(!session.in_transaction());
        unwrap_outcome(session.commit_scope(&cx, outside).await);
        assert!(session.in_transaction());

        unwrap_outcome(session.rollback_scope(&cx, root).await);
        assert!(!session.in_transaction());
    });
}

#[test]
fn scope_events_fire_on_commit_and_rollback() {
    let (manager, driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        let commits = Arc::new(AtomicUsize::new(0));
        let rollbacks = Arc::new(AtomicUsize::new(0));

        let mut session = manager.session();
        let seen = Arc::clone(&commits);
        session.on_after_commit(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let seen = Arc::clone(&rollbacks);
        session.on_after_rollback(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let guard = unwrap_outcome(session.begin_scope(&cx, Propagation::Required).await);
        session
            .create(Entity::new("Author").with("name", "Kept"))
            .unwrap();
        unwrap_outcome(session.commit_scope(&cx, guard).await);

        let guard = unwrap_outcome(session.begin_scope(&cx, Propagation::Required).await);
        session
            .create(Entity::new("Author").with("name", "Dropped"))
            .unwrap();
        unwrap_outcome(session.rollback_scope(&cx, guard).await);

        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(names(&driver, "author"), vec![text_value("Kept")]);
        assert_eq!(session.pending_counts().total(), 0);
    });
}

#[test]
fn before_commit_failure_rolls_back() {
    let (manager, driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        let mut session = manager.session();
        session.on_before_commit(|| Err(Error::Custom("vetoed".into())));

        let guard = unwrap_outcome(session.begin_scope(&cx, Propagation::Required).await);
        let author = session
            .create(Entity::new("Author").with("name", "Vetoed"))
            .unwrap();
        let err = expect_err(session.commit_scope(&cx, guard).await);
        assert!(matches!(err, Error::Custom(_)));

        assert_eq!(driver.row_count("author"), 0);
        assert!(!session.in_transaction());
        assert!(session.get(author).is_err());
    });
}
