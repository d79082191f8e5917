use loris::config::AppConfig;
use loris::core::{Restriction, Row, Value};
use loris::declare::declare;
use loris::permission::PermissionWalker;
use loris::schema::AdapterRegistry;
use loris::storage::{Database, ForeignKey, Tier};
use std::collections::BTreeMap;

fn row(values: &[(&str, Value)]) -> Row {
    values.iter().map(|(attr, value)| (attr.to_string(), value.clone())).collect()
}

/// Rig and Setup reference each other; Setup is owned through Experimenter.
fn cyclic_db() -> Database {
    let adapters = AdapterRegistry::default();
    let mut db = Database::new();
    declare(&mut db, "lab.Experimenter", Tier::Manual, "experimenter : varchar(31)", &adapters).unwrap();
    declare(
        &mut db,
        "lab.Rig",
        Tier::Manual,
        "rig_id : int\n---\nsetup_ref = null : int",
        &adapters,
    )
    .unwrap();
    declare(
        &mut db,
        "lab.Setup",
        Tier::Manual,
        "setup_id : int\n---\n-> Rig\n-> Experimenter",
        &adapters,
    )
    .unwrap();
    db.add_foreign_key(
        ForeignKey::new(
            "lab.Rig",
            "lab.Setup",
            BTreeMap::from([("setup_ref".to_string(), "setup_id".to_string())]),
        )
        .nullable(true),
    )
    .unwrap();

    for name in ["alice", "bob"] {
        db.insert1("lab.Experimenter", row(&[("experimenter", Value::from(name))])).unwrap();
    }
    db.insert1("lab.Rig", row(&[("rig_id", Value::Integer(1))])).unwrap();
    db.insert1(
        "lab.Setup",
        row(&[
            ("setup_id", Value::Integer(1)),
            ("rig_id", Value::Integer(1)),
            ("experimenter", Value::from("alice")),
        ]),
    )
    .unwrap();
    db.update1(
        "lab.Rig",
        &Restriction::from([("rig_id".to_string(), Value::Integer(1))]),
        row(&[("setup_ref", Value::Integer(1))]),
    )
    .unwrap();
    db
}

#[test]
fn test_walk_terminates_on_cycle() {
    let db = cyclic_db();
    let config = AppConfig::default();
    let walker = PermissionWalker::new(&db, &config);
    let rig = Restriction::from([("rig_id".to_string(), Value::Integer(1))]);

    assert!(walker.user_has_permission("lab.Rig", &rig, "alice").unwrap());
    assert!(!walker.user_has_permission("lab.Rig", &rig, "bob").unwrap());
}

#[test]
fn test_owned_row_checked_directly() {
    let db = cyclic_db();
    let config = AppConfig::default();
    let walker = PermissionWalker::new(&db, &config);
    let setup = Restriction::from([("setup_id".to_string(), Value::Integer(1))]);

    assert!(walker.user_has_permission("lab.Setup", &setup, "alice").unwrap());
    assert!(!walker.user_has_permission("lab.Setup", &setup, "bob").unwrap());
    assert!(walker.user_has_permission("lab.Setup", &setup, "admin").unwrap());
}

#[test]
fn test_group_membership_grants_permission() {
    let adapters = AdapterRegistry::default();
    let mut db = cyclic_db();
    declare(
        &mut db,
        "lab.Membership",
        Tier::Manual,
        "group_name : varchar(31)\nexperimenter : varchar(31)",
        &adapters,
    )
    .unwrap();
    db.insert1(
        "lab.Membership",
        row(&[("group_name", Value::from("alice")), ("experimenter", Value::from("bob"))]),
    )
    .unwrap();

    let config = AppConfig {
        group_table: Some("lab.Membership".to_string()),
        ..AppConfig::default()
    };
    let walker = PermissionWalker::new(&db, &config);
    assert_eq!(walker.groups_of("bob").unwrap(), vec![Value::from("alice")]);

    let setup = Restriction::from([("setup_id".to_string(), Value::Integer(1))]);
    assert!(walker.user_has_permission("lab.Setup", &setup, "bob").unwrap());
}
