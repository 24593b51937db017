//! Integration tests for docbridge
//!
//! Tests full statement execution flows from parsing through translation,
//! the in-memory store and the result cursor.

use docbridge::native::{Document, NativeKind, NativeValue};
use docbridge::script::ScriptConfig;
use docbridge::store::{loader, MemoryStore};
use docbridge::{CanonicalType, Cell, Engine, EngineConfig, Error, ExecuteResult, Params, ResultCursor};
use std::sync::Arc;
use tempfile::TempDir;

fn doc(pairs: &[(&str, NativeValue)]) -> Document {
    pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
}

/// Helper to create an engine over a few users and orders
fn setup_engine() -> (Arc<MemoryStore>, Engine) {
    setup_engine_with(EngineConfig::default())
}

fn setup_engine_with(config: EngineConfig) -> (Arc<MemoryStore>, Engine) {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_many(
            "admin",
            "users",
            vec![
                doc(&[("_id", 1.into()), ("name", "A".into()), ("age", 25.into()), ("city", "Oslo".into())]),
                doc(&[("_id", 2.into()), ("name", "B".into()), ("age", 40.into()), ("city", "Rome".into())]),
                doc(&[("_id", 3.into()), ("name", "C".into()), ("age", 35.into()), ("city", "Oslo".into())]),
            ],
        )
        .expect("Failed to seed users");
    store
        .insert_many(
            "admin",
            "orders",
            vec![
                doc(&[("_id", 10.into()), ("user_id", 1.into()), ("total", 9.5.into())]),
                doc(&[("_id", 11.into()), ("user_id", 2.into()), ("total", 20.0.into())]),
            ],
        )
        .expect("Failed to seed orders");
    let engine = Engine::new(store.clone(), config);
    (store, engine)
}

/// Helper to run a query and return its cursor
fn query(engine: &Engine, sql: &str) -> ResultCursor {
    query_with(engine, sql, &Params::new())
}

fn query_with(engine: &Engine, sql: &str, params: &Params) -> ResultCursor {
    match engine.execute(sql, params) {
        Ok(ExecuteResult::Rows(cursor)) => cursor,
        other => panic!("Query failed: {}: {:?}", sql, other),
    }
}

fn update(engine: &Engine, sql: &str) -> u64 {
    match engine.execute(sql, &Params::new()) {
        Ok(ExecuteResult::UpdateCount(n)) => n,
        other => panic!("Write failed: {}: {:?}", sql, other),
    }
}

fn rows(cursor: &mut ResultCursor) -> Vec<Vec<Cell>> {
    cursor
        .collect_rows()
        .expect("Failed to read rows")
        .into_iter()
        .map(|row| row.into_cells())
        .collect()
}

fn text(s: &str) -> Cell {
    Cell::String(s.to_string())
}

// =============================================================================
// SELECT Tests
// =============================================================================

#[test]
fn test_select_where_order_limit() {
    let (_store, engine) = setup_engine();

    let mut cursor = query(&engine, "SELECT name, age FROM users WHERE age > 30 ORDER BY age LIMIT 2");
    let names: Vec<_> = cursor.columns().iter().map(|c| c.name.clone()).collect();
    assert_eq!(names, ["name", "age"]);
    assert_eq!(
        rows(&mut cursor),
        vec![vec![text("C"), Cell::Integer(35)], vec![text("B"), Cell::Integer(40)]]
    );
}

#[test]
fn test_select_with_parameters() {
    let (_store, engine) = setup_engine();

    let params = Params::new().push(30i64).bind("city", "Oslo");
    let mut cursor = query_with(&engine, "SELECT name FROM users WHERE age > ? AND city = :city", &params);
    assert_eq!(rows(&mut cursor), vec![vec![text("C")]]);
}

#[test]
fn test_select_missing_column_is_null() {
    let (_store, engine) = setup_engine();

    let mut cursor = query(&engine, "SELECT name, nickname FROM users ORDER BY name LIMIT 1");
    assert_eq!(rows(&mut cursor), vec![vec![text("A"), Cell::Null]]);
}

#[test]
fn test_null_checks_match_missing_fields() {
    let (store, engine) = setup_engine();
    store
        .insert_many("admin", "users", vec![doc(&[("_id", 4.into()), ("name", "D".into())])])
        .unwrap();

    let mut cursor = query(&engine, "SELECT COUNT(age) AS n, COUNT(*) AS total FROM users");
    assert_eq!(rows(&mut cursor), vec![vec![Cell::Integer(3), Cell::Integer(4)]]);

    let mut cursor = query(&engine, "SELECT name FROM users WHERE age IS NULL");
    assert_eq!(rows(&mut cursor), vec![vec![text("D")]]);

    let mut cursor = query(&engine, "SELECT name FROM users WHERE COALESCE(age, nickname) IS NULL");
    assert_eq!(rows(&mut cursor), vec![vec![text("D")]]);

    let mut cursor = query(&engine, "SELECT name FROM users WHERE COALESCE(age, nickname) IS NOT NULL ORDER BY name");
    assert_eq!(rows(&mut cursor), vec![vec![text("A")], vec![text("B")], vec![text("C")]]);
}

#[test]
fn test_select_not_like() {
    let (_store, engine) = setup_engine();

    let mut cursor = query(&engine, "SELECT name FROM users WHERE city NOT LIKE 'O%' ORDER BY name");
    assert_eq!(rows(&mut cursor), vec![vec![text("B")]]);
}

#[test]
fn test_select_group_by() {
    let (_store, engine) = setup_engine();

    let mut cursor = query(&engine, "SELECT city, COUNT(*) AS n FROM users GROUP BY city ORDER BY city");
    assert_eq!(
        rows(&mut cursor),
        vec![vec![text("Oslo"), Cell::Integer(2)], vec![text("Rome"), Cell::Integer(1)]]
    );
}

#[test]
fn test_ungrouped_aggregate_over_empty_collection() {
    let (_store, engine) = setup_engine();

    let mut cursor = query(&engine, "SELECT COUNT(*) FROM nothing");
    assert_eq!(rows(&mut cursor), vec![vec![Cell::Integer(0)]]);
}

#[test]
fn test_left_join_preserves_left_rows() {
    let (_store, engine) = setup_engine();

    let mut left = query(
        &engine,
        "SELECT u.name, o.total FROM users u LEFT JOIN orders o ON u._id = o.user_id ORDER BY u.name",
    );
    let left = rows(&mut left);
    assert_eq!(left.len(), 3);
    assert_eq!(left[2], vec![text("C"), Cell::Null]);

    let mut inner = query(
        &engine,
        "SELECT u.name, o.total FROM users u JOIN orders o ON u._id = o.user_id ORDER BY u.name",
    );
    let inner = rows(&mut inner);
    assert!(inner.len() <= left.len());
    assert_eq!(inner.len(), 2);
    assert_eq!(inner[1], vec![text("B"), Cell::Float(20.0)]);
}

#[test]
fn test_select_star_columns_are_stable() {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_many(
            "admin",
            "events",
            vec![
                doc(&[("_id", 1.into()), ("a", 1.into())]),
                doc(&[("_id", 2.into()), ("b", "late".into())]),
            ],
        )
        .unwrap();
    let config = EngineConfig {
        batch_size: 1,
        schema_hints: false,
        ..EngineConfig::default()
    };
    let engine = Engine::new(store, config);

    let mut cursor = query(&engine, "SELECT * FROM events ORDER BY _id");
    let first = cursor.next().unwrap().unwrap();
    let columns: Vec<_> = cursor.columns().iter().map(|c| c.name.clone()).collect();
    assert_eq!(columns, ["_id", "a", "_overflow"]);
    assert_eq!(first.cells(), &[Cell::Integer(1), Cell::Integer(1), Cell::Null]);

    let second = cursor.next().unwrap().unwrap();
    assert_eq!(cursor.columns().len(), 3);
    assert_eq!(second.get(1), Some(&Cell::Null));
    assert_eq!(
        second.get(2),
        Some(&Cell::Document(doc(&[("b", "late".into())])))
    );
    assert!(cursor.next().unwrap().is_none());
}

#[test]
fn test_scrollable_cursor() {
    let (_store, engine) = setup_engine();

    let Ok(ExecuteResult::Rows(mut cursor)) =
        engine.execute_scrollable("SELECT name FROM users ORDER BY name", &Params::new())
    else {
        panic!("expected rows");
    };
    assert!(cursor.is_scrollable());
    assert_eq!(cursor.last_row().unwrap().unwrap().cells(), &[text("C")]);
    assert_eq!(cursor.previous().unwrap().unwrap().cells(), &[text("B")]);
    assert_eq!(cursor.first_row().unwrap().unwrap().cells(), &[text("A")]);
    assert_eq!(cursor.absolute(-2).unwrap().unwrap().cells(), &[text("B")]);
}

#[test]
fn test_shell_find() {
    let (_store, engine) = setup_engine();

    let mut cursor = query(&engine, "db.users.find({ age: { $gte: 35 } }, { name: 1, _id: 0 }).sort({ name: -1 })");
    let result = rows(&mut cursor);
    let columns: Vec<_> = cursor.columns().iter().map(|c| c.name.clone()).collect();
    assert_eq!(columns, ["name", "_overflow"]);
    assert_eq!(result, vec![vec![text("C"), Cell::Null], vec![text("B"), Cell::Null]]);
}

// =============================================================================
// Write Tests
// =============================================================================

#[test]
fn test_insert_update_delete() {
    let (store, engine) = setup_engine();

    assert_eq!(update(&engine, "INSERT INTO users (name, age) VALUES ('D', 50), ('E', 19)"), 2);
    assert_eq!(store.count("admin", "users"), Some(5));

    assert_eq!(update(&engine, "UPDATE users SET age = age + 1 WHERE name = 'A'"), 1);
    let mut cursor = query(&engine, "SELECT age FROM users WHERE name = 'A'");
    assert_eq!(rows(&mut cursor), vec![vec![Cell::Integer(26)]]);

    assert_eq!(update(&engine, "DELETE FROM users WHERE age < 30"), 2);
    assert_eq!(store.count("admin", "users"), Some(3));
}

#[test]
fn test_shell_writes() {
    let (store, engine) = setup_engine();

    assert_eq!(update(&engine, "db.orders.insertOne({ user_id: 3, total: 1.5 })"), 1);
    assert_eq!(update(&engine, "db.orders.deleteMany({ total: { $lt: 10 } })"), 2);
    assert_eq!(store.count("admin", "orders"), Some(1));
}

#[test]
fn test_failed_coercion_writes_nothing() {
    let (store, engine) = setup_engine();
    engine.describe_table("users").unwrap();

    let result = engine.execute("INSERT INTO users (name, age) VALUES ('F', 'old')", &Params::new());
    assert!(matches!(result, Err(Error::TypeCoercion(_))));
    assert_eq!(store.count("admin", "users"), Some(3));
}

// =============================================================================
// Statement Error Tests
// =============================================================================

#[test]
fn test_fragment_timeout_reaches_no_store() {
    let config = EngineConfig {
        script: ScriptConfig {
            timeout_ms: 50,
            ..ScriptConfig::default()
        },
        ..EngineConfig::default()
    };
    let (store, engine) = setup_engine_with(config);
    let trips = store.round_trips();

    let result = engine.execute("SELECT * FROM users WHERE $$while (true) {}$$", &Params::new());
    match result {
        Err(Error::ScriptEvaluation(err)) => assert!(err.is_timeout()),
        other => panic!("expected a script timeout, got {:?}", other),
    }
    assert_eq!(store.round_trips(), trips);
}

#[test]
fn test_translation_errors_reach_no_store() {
    let (store, engine) = setup_engine();

    let result = engine.execute("SELECT name, COUNT(*) FROM users", &Params::new());
    let err = result.unwrap_err();
    assert!(matches!(err, Error::Translation(_)));
    assert!(err.is_statement_error());
    assert!(err.suggestion().is_some());

    assert!(matches!(
        engine.execute("SELECT name FROM users WHERE age > ?", &Params::new()),
        Err(Error::Translation(_))
    ));
    assert_eq!(store.round_trips(), 0);
}

#[test]
fn test_explain_is_deterministic() {
    let (store, engine) = setup_engine();

    let sql = "SELECT city, AVG(age) FROM users WHERE age > 20 GROUP BY city HAVING COUNT(*) > 1";
    let first = engine.explain(sql, &Params::new()).unwrap();
    let second = engine.explain(sql, &Params::new()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first["aggregate"], "users");
    assert_eq!(first["pipeline"][0], serde_json::json!({ "$match": { "age": { "$gt": 20 } } }));
    assert_eq!(store.round_trips(), 0);
}

// =============================================================================
// Catalog Tests
// =============================================================================

#[test]
fn test_list_tables_hides_system_collections() {
    let (store, engine) = setup_engine();
    store.create_collection("admin", "system.users");
    store.create_collection("admin", "system.views");

    assert_eq!(engine.list_tables().unwrap(), ["orders", "users"]);
}

#[test]
fn test_describe_table_widens_numbers() {
    let store = Arc::new(MemoryStore::new());
    let mut docs: Vec<Document> = (0..9)
        .map(|i| doc(&[("_id", i.into()), ("score", (i * 10).into())]))
        .collect();
    docs.push(doc(&[("_id", 9.into()), ("score", 7.5.into())]));
    store.insert_many("admin", "scores", docs).unwrap();
    let engine = Engine::new(store.clone(), EngineConfig::default());

    let schema = engine.describe_table("scores").unwrap();
    let score = schema.column("score").unwrap();
    assert_eq!(score.canonical_type, CanonicalType::Float);
    assert_eq!(score.native_kind, Some(NativeKind::Double));
    assert!(!score.nullable);

    // a fractional value fits the widened column
    assert_eq!(update(&engine, "INSERT INTO scores (_id, score) VALUES (10, 2.5)"), 1);
    assert_eq!(store.count("admin", "scores"), Some(11));
    let mut cursor = query(&engine, "SELECT score FROM scores WHERE _id = 10");
    assert_eq!(rows(&mut cursor), vec![vec![Cell::Float(2.5)]]);

    let id = &schema.columns[0];
    assert_eq!(id.name, "_id");
    assert!(id.primary_key);
    assert!(!id.nullable);
}

#[test]
fn test_describe_table_rejects_bad_names() {
    let (_store, engine) = setup_engine();
    assert!(matches!(
        engine.describe_table("bad$name"),
        Err(Error::InvalidIdentifier { .. })
    ));
}

#[tokio::test]
async fn test_loader_feeds_engine() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    std::fs::write(
        tmp.path().join("people.json"),
        r#"[{"_id": 1, "name": "Ada", "born": {"$date": "1815-12-10T00:00:00Z"}}, {"_id": 2, "name": "Alan"}]"#,
    )
    .unwrap();
    std::fs::write(tmp.path().join("notes.jsonl"), "{\"text\": \"a\"}\n{\"text\": \"b\"}\n").unwrap();

    let store = Arc::new(MemoryStore::new());
    let loaded = loader::load_dir(&store, "admin", tmp.path()).await.unwrap();
    assert_eq!(loaded, 4);

    let engine = Engine::new(store, EngineConfig::default());
    assert_eq!(engine.list_tables().unwrap(), ["notes", "people"]);

    let mut cursor = query(&engine, "SELECT name, born FROM people WHERE born IS NOT NULL");
    let result = rows(&mut cursor);
    assert_eq!(result.len(), 1);
    assert_eq!(result[0][0], text("Ada"));
    assert!(matches!(result[0][1], Cell::DateTime(_)));
}
