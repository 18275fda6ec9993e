mod helpers;

use serde_json::json;
use strata::memory::types::{FactFilter, Scope};
use strata::MemoryError;

#[test]
fn upsert_is_idempotent_per_scope_and_key() {
    let (_tmp, engine) = helpers::test_engine();

    let first = engine
        .put_fact(Scope::Project, "build_tool", json!("make"), None, None)
        .unwrap();
    let second = engine
        .put_fact(Scope::Project, "build_tool", json!("cargo"), None, None)
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.value, json!("cargo"));
    assert_eq!(engine.symbolic().count().unwrap(), 1);

    let all = engine.symbolic().query(&FactFilter::default()).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].value, json!("cargo"));
}

#[test]
fn same_key_in_different_scopes_is_two_facts() {
    let (_tmp, engine) = helpers::test_engine();
    engine
        .put_fact(Scope::User, "editor", json!("vim"), None, None)
        .unwrap();
    engine
        .put_fact(Scope::Org, "editor", json!("vscode"), None, None)
        .unwrap();

    assert_eq!(engine.symbolic().count().unwrap(), 2);
    let user = engine
        .symbolic()
        .query(&FactFilter {
            scope: Some(Scope::User),
            ..FactFilter::default()
        })
        .unwrap();
    assert_eq!(user.len(), 1);
    assert_eq!(user[0].value, json!("vim"));
}

#[test]
fn query_filters_and_orders_by_recency() {
    let (_tmp, engine) = helpers::test_engine();
    engine
        .put_fact(Scope::Project, "lint", json!("clippy"), Some("tooling"), None)
        .unwrap();
    engine
        .put_fact(Scope::Project, "fmt", json!("rustfmt"), Some("tooling"), None)
        .unwrap();
    engine
        .put_fact(Scope::Project, "owner", json!("platform team"), Some("people"), None)
        .unwrap();
    // touching `lint` moves it to the front
    engine
        .put_fact(Scope::Project, "lint", json!("clippy pedantic"), None, None)
        .unwrap();

    let tooling = engine
        .symbolic()
        .query(&FactFilter {
            category: Some("tooling".into()),
            ..FactFilter::default()
        })
        .unwrap();
    let keys: Vec<&str> = tooling.iter().map(|f| f.key.as_str()).collect();
    assert_eq!(keys, ["lint", "fmt"]);

    let confident = engine
        .symbolic()
        .query(&FactFilter {
            confidence_min: Some(1.0),
            ..FactFilter::default()
        })
        .unwrap();
    assert_eq!(confident.len(), 3);
    assert!(confident.iter().all(|f| f.confidence == 1.0));
}

#[test]
fn structured_values_round_trip() {
    let (_tmp, engine) = helpers::test_engine();
    let value = json!({"host": "db.internal", "port": 5432, "replicas": ["a", "b"]});
    let fact = engine
        .put_fact(Scope::Project, "database", value.clone(), Some("infra"), Some("ops.md"))
        .unwrap();

    let fetched = engine.symbolic().get(&fact.id).unwrap();
    assert_eq!(fetched.value, value);
    assert_eq!(fetched.source.as_deref(), Some("ops.md"));
}

#[test]
fn invalid_facts_are_rejected() {
    let (_tmp, engine) = helpers::test_engine();
    assert!(matches!(
        engine.put_fact(Scope::Project, "  ", json!("x"), None, None),
        Err(MemoryError::Validation(_))
    ));
    assert!(matches!(
        engine.put_fact(Scope::Project, "empty", json!(""), None, None),
        Err(MemoryError::Validation(_))
    ));
    assert_eq!(engine.symbolic().count().unwrap(), 0);
}

#[test]
fn delete_fact_then_missing() {
    let (_tmp, engine) = helpers::test_engine();
    let fact = engine
        .put_fact(Scope::Session, "branch", json!("main"), None, None)
        .unwrap();

    engine.delete_fact(&fact.id).unwrap();
    assert!(matches!(
        engine.symbolic().get(&fact.id),
        Err(MemoryError::NotFound { .. })
    ));
    assert!(matches!(
        engine.delete_fact(&fact.id),
        Err(MemoryError::NotFound { .. })
    ));
}

#[test]
fn writes_are_audited() {
    let (_tmp, engine) = helpers::test_engine();
    let fact = engine
        .put_fact(Scope::Project, "ci", json!("github"), None, None)
        .unwrap();
    engine
        .put_fact(Scope::Project, "ci", json!("buildkite"), None, None)
        .unwrap();
    engine.delete_fact(&fact.id).unwrap();

    let conn = rusqlite::Connection::open(engine.symbolic().path()).unwrap();
    let ops: Vec<String> = conn
        .prepare("SELECT operation FROM memory_log WHERE record_id = ?1 ORDER BY id")
        .unwrap()
        .query_map([&fact.id], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(ops, ["create", "update", "delete"]);
}
