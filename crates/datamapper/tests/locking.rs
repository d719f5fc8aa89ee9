mod fixtures;

use datamapper::prelude::*;
use datamapper::OptimisticLockError;
use datamapper_memory::MemoryDriver;
use fixtures::*;

async fn seed(cx: &Cx, manager: &EntityManager<MemoryDriver>) {
    let mut session = manager.session();
    session
        .create(Entity::new("Document").with("title", "Draft"))
        .unwrap();
    unwrap_outcome(session.flush(cx).await);
}

#[test]
fn new_versioned_entity_starts_at_version_one() {
    let (manager, driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        seed(&cx, &manager).await;
        let rows = driver.rows("document").unwrap();
        assert_eq!(int_column(&rows[0], "rev"), Some(1));
    });
}

#[test]
fn concurrent_update_loses_and_keeps_its_changes() {
    let (manager, driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        seed(&cx, &manager).await;

        let mut first = manager.session();
        let mut second = manager.session();
        let d1 = unwrap_outcome(first.find(&cx, "Document", vec![Value::BigInt(1)]).await)
            .expect("document");
        let d2 = unwrap_outcome(second.find(&cx, "Document", vec![Value::BigInt(1)]).await)
            .expect("document");

        first.set(d1, "title", "First").unwrap();
        let result = unwrap_outcome(first.flush(&cx).await);
        assert_eq!(result.updated, 1);
        assert_eq!(first.get(d1).unwrap().scalar("rev"), Some(&Value::Int(2)));

        second.set(d2, "title", "Second").unwrap();
        let err = expect_err(second.flush(&cx).await);
        assert!(err.requires_reload());
        assert_eq!(err.conflicting_entity(), Some(d2));
        assert!(matches!(err, Error::OptimisticLock(OptimisticLockError { .. })));

        // The losing session is untouched.
        assert_eq!(second.changed_fields(d2).unwrap(), vec!["title".to_string()]);
        assert_eq!(second.get(d2).unwrap().scalar("rev"), Some(&Value::Int(1)));

        let rows = driver.rows("document").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get_by_name("title"),
            Some(&Value::Text("First".to_string()))
        );
        assert_eq!(int_column(&rows[0], "rev"), Some(2));
    });
}

#[test]
fn refresh_recovers_from_a_stale_version() {
    let (manager, driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        seed(&cx, &manager).await;

        let mut stale = manager.session();
        let doc = unwrap_outcome(stale.find(&cx, "Document", vec![Value::BigInt(1)]).await)
            .expect("document");
        unwrap_outcome(stale.check_version(&cx, doc).await);

        let mut other = manager.session();
        let theirs = unwrap_outcome(other.find(&cx, "Document", vec![Value::BigInt(1)]).await)
            .expect("document");
        other.set(theirs, "title", "Theirs").unwrap();
        unwrap_outcome(other.flush(&cx).await);

        let err = expect_err(stale.check_version(&cx, doc).await);
        assert!(err.requires_reload());

        unwrap_outcome(stale.refresh(&cx, doc).await);
        assert_eq!(
            stale.get(doc).unwrap().scalar("title"),
            Some(&Value::Text("Theirs".to_string()))
        );
        assert!(stale.changed_fields(doc).unwrap().is_empty());

        stale.set(doc, "title", "Mine").unwrap();
        unwrap_outcome(stale.flush(&cx).await);

        let rows = driver.rows("document").unwrap();
        assert_eq!(int_column(&rows[0], "rev"), Some(3));
        assert_eq!(
            rows[0].get_by_name("title"),
            Some(&Value::Text("Mine".to_string()))
        );
    });
}

#[test]
fn versioned_delete_loses_to_a_concurrent_update() {
    let (manager, driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        seed(&cx, &manager).await;

        let mut editor = manager.session();
        let mut remover = manager.session();
        let edited = unwrap_outcome(editor.find(&cx, "Document", vec![Value::BigInt(1)]).await)
            .expect("document");
        let removed = unwrap_outcome(remover.find(&cx, "Document", vec![Value::BigInt(1)]).await)
            .expect("document");

        editor.set(edited, "title", "Edited").unwrap();
        unwrap_outcome(editor.flush(&cx).await);

        driver.clear_log();
        remover.remove(removed).unwrap();
        let err = expect_err(remover.flush(&cx).await);
        assert!(matches!(err, Error::OptimisticLock(OptimisticLockError { .. })));
        assert!(err.requires_reload());
        assert_eq!(err.conflicting_entity(), Some(removed));

        // The delete was checked against the version it loaded, and undone.
        assert_eq!(count(&driver.statements(), "DELETE document"), 1);
        assert!(driver.transcript().contains(&"ROLLBACK".to_string()));
        let rows = driver.rows("document").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(int_column(&rows[0], "rev"), Some(2));

        // The removal stays scheduled until the caller reloads.
        assert_eq!(remover.state(removed).unwrap(), EntityState::Removed);
        assert_eq!(remover.pending_counts().deleted, 1);
    });
}
