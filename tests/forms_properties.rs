use loris::config::AppConfig;
use loris::core::{Row, Value};
use loris::declare::declare;
use loris::forms::{FieldNode, FormCache, FormFactory, build_config_form};
use loris::schema::AdapterRegistry;
use loris::storage::{Database, Tier};
use serde_json::json;
use std::sync::Arc;

fn db_with_rigs(rigs: usize) -> Database {
    let adapters = AdapterRegistry::default();
    let mut db = Database::new();
    declare(
        &mut db,
        "lab.Rig",
        Tier::Manual,
        "rig : varchar(31)\n---\nroom : varchar(15)\nbuilt : date",
        &adapters,
    )
    .unwrap();
    declare(
        &mut db,
        "lab.Session",
        Tier::Manual,
        "session_id : int auto_increment\n---\n-> Rig\nnotes = null : varchar(255)\nrating = 3 : int\nlabel : varchar(15)",
        &adapters,
    )
    .unwrap();

    for i in 0..rigs {
        db.insert1(
            "lab.Rig",
            Row::from([
                ("rig".to_string(), Value::from(format!("rig{:03}", i))),
                ("room".to_string(), Value::from("B2")),
                ("built".to_string(), Value::from(chrono::NaiveDate::from_ymd_opt(2021, 3, 1).unwrap())),
            ]),
        )
        .unwrap();
    }
    db
}

#[test]
fn test_required_follows_nullability_and_defaults() {
    let db = db_with_rigs(3);
    let config = AppConfig::default();
    let form = FormFactory::new(&db, &config).build("lab.Session").unwrap();

    let required = |name: &str| form.field(name).unwrap().meta().required;
    assert!(!required("session_id"), "auto_increment keys are optional");
    assert!(!required("notes"), "nullable attributes are optional");
    assert!(!required("rating"), "attributes with a default are optional");
    assert!(required("label"));
    assert!(required("rig"));
    assert_eq!(form.field("rating").unwrap().meta().default, Some(json!(3)));
}

#[test]
fn test_dropdown_limit_straddle() {
    let config = AppConfig::default();
    assert_eq!(config.fk_dropdown_limit, 200);

    let below = db_with_rigs(199);
    let form = FormFactory::new(&below, &config).build("lab.Session").unwrap();
    let rig = form.field("rig").unwrap();
    assert!(matches!(rig.node, FieldNode::Select { .. }));
    assert_eq!(rig.choices().unwrap().len(), 199);

    let above = db_with_rigs(201);
    let form = FormFactory::new(&above, &config).build("lab.Session").unwrap();
    let rig = form.field("rig").unwrap();
    assert!(matches!(rig.node, FieldNode::Input { .. }));
    assert!(rig.choices().is_none());
}

#[test]
fn test_json_list_and_dict_round_trip() {
    let config = AppConfig::default();
    let spec = json!({
        "channels": "list",
        "params": "dict",
        "labels": "set",
        "gain": ["float", 1.0],
    });
    let form = build_config_form("analysis", &spec, &config).unwrap();
    let submission = json!({
        "channels": "[1, 2, 3]",
        "params": "{\"window\": 5, \"method\": \"mean\"}",
        "labels": "[\"a\", \"b\", \"a\"]",
        "gain": "2.5",
    });

    form.validate(&submission).unwrap();
    let values = form
        .process(&json!(form.extract(&submission)), &AdapterRegistry::default())
        .unwrap();
    assert_eq!(values["channels"], json!([1, 2, 3]));
    assert_eq!(values["params"], json!({"window": 5, "method": "mean"}));
    assert_eq!(values["labels"], json!(["a", "b"]));
    assert_eq!(values["gain"], json!(2.5));
}

#[test]
fn test_malformed_json_reported_by_field() {
    let config = AppConfig::default();
    let form = build_config_form("analysis", &json!({"params": "dict"}), &config).unwrap();
    let errors = form.validate(&json!({"params": "[1, 2]"})).unwrap_err();
    assert!(errors.get("params").is_some());
}

#[test]
fn test_cache_returns_same_form_until_invalidated() {
    let db = db_with_rigs(2);
    let config = AppConfig::default();
    let cache = FormCache::new();

    let first = cache.get_or_build(&db, &config, "lab.Session").unwrap();
    let second = cache.get_or_build(&db, &config, "lab.Session").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.len(), 1);

    cache.invalidate_all().unwrap();
    assert!(cache.is_empty());
    let rebuilt = cache.get_or_build(&db, &config, "lab.Session").unwrap();
    assert!(!Arc::ptr_eq(&first, &rebuilt));
}

#[test]
fn test_cached_form_sees_new_parent_rows() {
    let mut db = db_with_rigs(1);
    let config = AppConfig::default();
    let cache = FormCache::new();
    let form = cache.get_or_build(&db, &config, "lab.Session").unwrap();
    assert_eq!(form.read().unwrap().field("rig").unwrap().choices().unwrap().len(), 1);

    db.insert1(
        "lab.Rig",
        Row::from([
            ("rig".to_string(), Value::from("extra")),
            ("room".to_string(), Value::from("C1")),
            ("built".to_string(), Value::from(chrono::NaiveDate::from_ymd_opt(2022, 1, 1).unwrap())),
        ]),
    )
    .unwrap();
    let form = cache.get_or_build(&db, &config, "lab.Session").unwrap();
    assert_eq!(form.read().unwrap().field("rig").unwrap().choices().unwrap().len(), 2);
}

#[test]
fn test_empty_parent_disables_field_until_rows_exist() {
    let mut db = db_with_rigs(0);
    let config = AppConfig::default();
    let cache = FormCache::new();

    let form = cache.get_or_build(&db, &config, "lab.Session").unwrap();
    match &form.read().unwrap().field("rig").unwrap().node {
        FieldNode::Disabled { error, .. } => assert!(error.contains("lab.Rig"), "unexpected label: {}", error),
        other => panic!("expected a disabled field, got {:?}", other),
    }

    db.insert1(
        "lab.Rig",
        Row::from([
            ("rig".to_string(), Value::from("first")),
            ("room".to_string(), Value::from("A1")),
            ("built".to_string(), Value::from(chrono::NaiveDate::from_ymd_opt(2023, 5, 2).unwrap())),
        ]),
    )
    .unwrap();
    let form = cache.get_or_build(&db, &config, "lab.Session").unwrap();
    let form = form.read().unwrap();
    let rig = form.field("rig").unwrap();
    assert!(matches!(rig.node, FieldNode::Select { .. }));
    assert!(rig.choices().unwrap().iter().any(|choice| choice.value == "first"));
}
