mod fixtures;

use datamapper::prelude::*;
use datamapper::CascadeCycleError;
use fixtures::*;

#[test]
fn mutual_references_insert_with_a_deferred_update() {
    let (manager, driver) = library_manager();
    let cx = Cx::for_testing();

    block_on(async {
        let mut session = manager.session();
        let grace = session
            .create(Entity::new("Employee").with("name", "Grace"))
            .unwrap();
        let compilers = session
            .create(
                Entity::new("Department")
                    .with("name", "Compilers")
                    .with_ref("manager", grace),
            )
            .unwrap();
        session
            .set_reference(grace, "department", Some(compilers))
            .unwrap();

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 2);

        // Employee goes in with a null department, then gets patched.
        let statements = driver.statements();
        assert_eq!(statements.len(), 3, "{statements:?}");
        assert!(statements[0].starts_with("INSERT employee"));
        assert!(statements[1].starts_with("INSERT department"));
        assert!(statements[2].starts_with("UPDATE employee"));

        let employees = driver.rows("employee").unwrap();
        assert_eq!(
            int_column(&employees[0], "department_id"),
            Some(key_value(&session, compilers))
        );
        let departments = driver.rows("department").unwrap();
        assert_eq!(
            int_column(&departments[0], "manager_id"),
            Some(key_value(&session, grace))
        );

        driver.clear_log();
        let again = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(again.statements, 0);
        assert!(driver.statements().is_empty());
    });
}

#[test]
fn cycle_without_a_nullable_edge_is_rejected_before_io() {
    let registry = MetadataRegistry::builder()
        .entity(
            EntityMeta::new("Left")
                .field(id())
                .relation(RelationMeta::many_to_one("right", "Right").nullable(false)),
        )
        .entity(
            EntityMeta::new("Right")
                .field(id())
                .relation(RelationMeta::many_to_one("left", "Left").nullable(false)),
        )
        .build()
        .expect("registry");
    let (manager, driver) = manager_with(registry, SessionConfig::default(), &[None]);
    let cx = Cx::for_testing();

    block_on(async {
        let mut session = manager.session();
        let left = session.create(Entity::new("Left")).unwrap();
        let right = session
            .create(Entity::new("Right").with_ref("left", left))
            .unwrap();
        session.set_reference(left, "right", Some(right)).unwrap();

        let err = expect_err(session.flush(&cx).await);
        match err {
            Error::CascadeCycle(CascadeCycleError { types }) => {
                assert_eq!(types, vec!["Left".to_string(), "Right".to_string()]);
            }
            other => panic!("expected a cascade cycle, got {other}"),
        }
        assert!(driver.transcript().is_empty());
        assert_eq!(session.state(left).unwrap(), EntityState::New);
        assert_eq!(session.state(right).unwrap(), EntityState::New);
    });
}

#[test]
fn self_referencing_tree_inserts_one_level_at_a_time() {
    let registry = MetadataRegistry::builder()
        .entity(
            EntityMeta::new("Node")
                .field(id())
                .field(text("name"))
                .relation(RelationMeta::many_to_one("parent", "Node")),
        )
        .build()
        .expect("registry");
    let (manager, driver) = manager_with(registry, SessionConfig::default(), &[None]);
    let cx = Cx::for_testing();

    block_on(async {
        let mut session = manager.session();
        let root = session
            .create(Entity::new("Node").with("name", "root"))
            .unwrap();
        let left = session
            .create(Entity::new("Node").with("name", "left").with_ref("parent", root))
            .unwrap();
        let right = session
            .create(Entity::new("Node").with("name", "right").with_ref("parent", root))
            .unwrap();
        let leaf = session
            .create(Entity::new("Node").with("name", "leaf").with_ref("parent", left))
            .unwrap();

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 4);
        assert_eq!(result.updated, 0);

        // Siblings share a statement; each level waits for the one above.
        let statements = driver.statements();
        assert_eq!(statements.len(), 3, "{statements:?}");
        assert!(statements[0].starts_with("INSERT node") && statements[0].ends_with("x1"));
        assert!(statements[1].starts_with("INSERT node") && statements[1].ends_with("x2"));
        assert!(statements[2].starts_with("INSERT node") && statements[2].ends_with("x1"));

        let rows = driver.rows("node").unwrap();
        let parent_of = |name: &str| {
            let row = rows
                .iter()
                .find(|r| r.get_by_name("name") == Some(&Value::Text(name.to_string())))
                .unwrap_or_else(|| panic!("no row for {name}"));
            int_column(row, "parent_id")
        };
        assert_eq!(parent_of("root"), None);
        assert_eq!(parent_of("left"), Some(key_value(&session, root)));
        assert_eq!(parent_of("right"), Some(key_value(&session, root)));
        assert_eq!(parent_of("leaf"), Some(key_value(&session, left)));
        for node in [root, left, right, leaf] {
            assert_eq!(session.state(node).unwrap(), EntityState::Managed);
        }
    });
}
