//! End-to-end tests against a real PostgreSQL server.
//!
//! Run with: DATABASE_URL=postgres://... cargo test -p dbaccess-core -- --ignored
//!
//! Each test works on a TEMP table, which lives as long as the single
//! connection the `Database` owns.

use std::sync::Arc;

use dbaccess_core::{
    blocking, params, BulkData, CancellationToken, ColumnValues, ConnectionState, Database,
    DbError, Model, ModelRegistry, Params, Value,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
struct Planner {
    pid: i32,
    gcc4: Option<String>,
    name_id: i32,
}

impl Model for Planner {
    const MODEL_NAME: &'static str = "planner";
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
struct Pair {
    a: String,
    b: String,
    n: i32,
}

impl Model for Pair {
    const MODEL_NAME: &'static str = "pair";
}

const CREATE_PLANNER: &str =
    "CREATE TEMP TABLE PLANNER (PID int4 PRIMARY KEY, GCC4 varchar(10), NAME_ID int4 NOT NULL)";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL required")
}

fn registry() -> Arc<ModelRegistry> {
    let mut registry = ModelRegistry::new();
    registry.register::<Planner>().unwrap();
    registry.register::<Pair>().unwrap();
    Arc::new(registry)
}

async fn setup() -> (Database, CancellationToken) {
    init_tracing();
    let mut db = Database::from_url(&database_url(), registry()).unwrap();
    let cancel = CancellationToken::new();
    db.custom_bulk_update(CREATE_PLANNER, &Params::new(), &cancel)
        .await
        .unwrap();
    (db, cancel)
}

async fn seed(db: &mut Database, cancel: &CancellationToken) {
    for (pid, gcc4, name_id) in [(1, "SCS", 68), (2, "ABC", 69), (3, "XYZ", 70)] {
        let params = params! { "PID" => pid, "GCC4" => gcc4, "NAME_ID" => name_id };
        assert_eq!(db.insert("PLANNER", &params, cancel).await.unwrap(), 1);
    }
}

#[tokio::test]
#[ignore = "requires database"]
async fn null_parameter_round_trips() {
    let (mut db, cancel) = setup().await;

    let params = params! { "PID" => 1, "GCC4" => Option::<String>::None, "NAME_ID" => 68 };
    assert_eq!(db.insert("PLANNER", &params, &cancel).await.unwrap(), 1);

    let value = db
        .scalar("SELECT GCC4 FROM PLANNER WHERE PID = :PID", &params! { "PID" => 1 }, &cancel)
        .await
        .unwrap();
    assert_eq!(value, Some(Value::Null));

    let gcc4: Option<String> = db
        .scalar_as("SELECT GCC4 FROM PLANNER WHERE PID = :PID", &params! { "PID" => 1 }, &cancel)
        .await
        .unwrap();
    assert_eq!(gcc4, None);
}

#[tokio::test]
#[ignore = "requires database"]
async fn scalar_without_rows_is_none() {
    let (mut db, cancel) = setup().await;
    let value = db
        .scalar("SELECT PID FROM PLANNER WHERE PID = :PID", &params! { "PID" => 42 }, &cancel)
        .await
        .unwrap();
    assert_eq!(value, None);
}

#[tokio::test]
#[ignore = "requires database"]
async fn object_returns_first_row_and_drains() {
    let (mut db, cancel) = setup().await;
    seed(&mut db, &cancel).await;

    let first: Option<Planner> = db
        .object_as("SELECT PID, GCC4, NAME_ID FROM PLANNER ORDER BY PID", &Params::new(), &cancel)
        .await
        .unwrap();
    assert_eq!(
        first,
        Some(Planner { pid: 1, gcc4: Some("SCS".into()), name_id: 68 })
    );

    // the connection is immediately usable for the next command
    let count: Option<i64> = db
        .scalar_as("SELECT count(*) FROM PLANNER", &Params::new(), &cancel)
        .await
        .unwrap();
    assert_eq!(count, Some(3));
    assert_eq!(db.open_count(), 1);

    let none = db
        .object("SELECT PID, GCC4, NAME_ID FROM PLANNER WHERE PID < 0", "planner", &Params::new(), &cancel)
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
#[ignore = "requires database"]
async fn object_list_and_scalar_list_keep_result_order() {
    let (mut db, cancel) = setup().await;
    seed(&mut db, &cancel).await;

    let planners: Vec<Planner> = db
        .object_list_as("SELECT PID, GCC4, NAME_ID FROM PLANNER ORDER BY PID DESC", &Params::new(), &cancel)
        .await
        .unwrap();
    assert_eq!(planners.iter().map(|p| p.pid).collect::<Vec<_>>(), [3, 2, 1]);

    let names = db
        .scalar_list(
            "SELECT GCC4 FROM PLANNER WHERE NAME_ID >= :MIN ORDER BY PID",
            &params! { "MIN" => 69 },
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(names, ["ABC", "XYZ"]);
}

#[tokio::test]
#[ignore = "requires database"]
async fn keyed_object_list_last_row_wins() {
    let (mut db, cancel) = setup().await;

    let map = db
        .keyed_object_list(
            "SELECT * FROM (VALUES ('x', 'y', 1), ('x', 'y', 2), ('x', 'z', 3)) AS v(a, b, n)",
            &["a", "b"],
            "pair",
            &Params::new(),
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(map.len(), 2);
    let pair = map["x_y"].downcast_ref::<Pair>().unwrap();
    assert_eq!(pair.n, 2);
    assert_eq!(map.keys().collect::<Vec<_>>(), ["x_y", "x_z"]);
}

#[tokio::test]
#[ignore = "requires database"]
async fn bulk_insert_three_rows_in_one_statement() {
    let (mut db, cancel) = setup().await;

    let data = BulkData::new()
        .with("PID", vec![10i32, 11, 12])
        .with("GCC4", ColumnValues::Varchar(vec![Some("A".into()), None, Some("C".into())]))
        .with("NAME_ID", vec![100i32, 101, 102]);
    let inserted = db.bulk_insert("PLANNER", 3, data, &cancel).await.unwrap();
    assert_eq!(inserted, 3);

    let nulls: Option<i64> = db
        .scalar_as("SELECT count(*) FROM PLANNER WHERE GCC4 IS NULL", &Params::new(), &cancel)
        .await
        .unwrap();
    assert_eq!(nulls, Some(1));
}

#[tokio::test]
#[ignore = "requires database"]
async fn bulk_insert_length_mismatch_fails_before_execution() {
    let (mut db, cancel) = setup().await;

    let data = BulkData::new()
        .with("PID", vec![10i32, 11, 12])
        .with("NAME_ID", vec![100i32, 101]);
    let err = db.bulk_insert("PLANNER", 3, data, &cancel).await.unwrap_err();
    assert!(matches!(err, DbError::BulkLengthMismatch { expected: 3, actual: 2, .. }));

    let count: Option<i64> = db
        .scalar_as("SELECT count(*) FROM PLANNER", &Params::new(), &cancel)
        .await
        .unwrap();
    assert_eq!(count, Some(0));
}

#[tokio::test]
#[ignore = "requires database"]
async fn insert_update_delete_report_row_counts() {
    let (mut db, cancel) = setup().await;
    seed(&mut db, &cancel).await;

    let updated = db
        .update("PLANNER", &params! { "GCC4" => "SCS" }, &params! { "PID" => 2 }, &cancel)
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let updated = db
        .custom_bulk_update(
            "UPDATE PLANNER SET NAME_ID = NAME_ID + 1 WHERE GCC4 = :GCC4",
            &params! { "GCC4" => "SCS" },
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(updated, 2);

    let deleted = db
        .delete("PLANNER", &params! { "GCC4" => "SCS" }, &cancel)
        .await
        .unwrap();
    assert_eq!(deleted, 2);

    let deleted = db
        .delete("PLANNER", &params! { "PID" => 999 }, &cancel)
        .await
        .unwrap();
    assert_eq!(deleted, 0);
}

#[tokio::test]
#[ignore = "requires database"]
async fn unique_violation_is_surfaced_raw() {
    let (mut db, cancel) = setup().await;
    seed(&mut db, &cancel).await;

    let err = db
        .insert("PLANNER", &params! { "PID" => 1, "NAME_ID" => 1 }, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Driver(_)));
    assert!(err.is_unique_violation());
    assert_eq!(err.database_code().as_deref(), Some("23505"));

    // server-side errors leave the connection open
    assert_eq!(db.state(), ConnectionState::Open);
    assert_eq!(db.open_count(), 1);
}

#[tokio::test]
#[ignore = "requires database"]
async fn cancellation_marks_connection_broken_and_next_call_reopens() {
    init_tracing();
    let mut db = Database::from_url(&database_url(), registry()).unwrap();
    let live = CancellationToken::new();
    db.ensure_open(&live).await.unwrap();

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let err = db
        .scalar("SELECT pg_sleep(5)", &Params::new(), &cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Cancelled));
    assert_eq!(db.state(), ConnectionState::Broken);

    let one: Option<i32> = db.scalar_as("SELECT 1", &Params::new(), &live).await.unwrap();
    assert_eq!(one, Some(1));
    assert_eq!(db.open_count(), 2);

    db.close().await.unwrap();
    db.close().await.unwrap();
    assert_eq!(db.state(), ConnectionState::Closed);
}

#[test]
#[ignore = "requires database"]
fn blocking_facade_matches_async_semantics() {
    init_tracing();
    let mut db = blocking::Database::from_url(&database_url(), registry()).unwrap();
    db.custom_bulk_update(CREATE_PLANNER, &Params::new()).unwrap();

    let params = params! { "PID" => 1, "GCC4" => "SCS", "NAME_ID" => 68 };
    assert_eq!(db.insert("PLANNER", &params).unwrap(), 1);

    let planner: Option<Planner> = db
        .object_as("SELECT PID, GCC4, NAME_ID FROM PLANNER", &Params::new())
        .unwrap();
    assert_eq!(planner.map(|p| p.name_id), Some(68));

    let err = db.process_transition().unwrap_err();
    assert!(matches!(err, DbError::Unsupported { .. }));
    assert_eq!(db.open_count(), 1);
}

#[tokio::test]
#[ignore = "requires database"]
async fn same_sql_accepts_different_value_kinds() {
    let (mut db, cancel) = setup().await;
    let sql = "SELECT :v::text";

    for (value, expected) in [
        (Value::from(5), "5"),
        (Value::from("abc"), "abc"),
        (Value::from(rust_decimal::Decimal::new(1050, 2)), "10.50"),
        (Value::from(1.5f64), "1.5"),
        (Value::Null, ""),
        (Value::from(7), "7"),
    ] {
        let rendered = db
            .scalar_list(sql, &Params::new().with("v", value), &cancel)
            .await
            .unwrap();
        assert_eq!(rendered, [expected]);
    }
    assert_eq!(db.state(), ConnectionState::Open);
    assert_eq!(db.open_count(), 1);
}

#[tokio::test]
#[ignore = "requires database"]
async fn less_common_column_types_decode_to_text() {
    let (mut db, cancel) = setup().await;

    for (sql, expected) in [
        (r#"SELECT '{"a": 1}'::jsonb"#, r#"{"a":1}"#),
        ("SELECT '12:30'::time", "12:30:00"),
        (r#"SELECT 'x'::"char""#, "x"),
        ("SELECT 'ab'::char(3)", "ab "),
        ("SELECT interval '1 day'", "1 day"),
        ("SELECT interval '1 year 2 months 04:05:06.5'", "1 year 2 mons 04:05:06.5"),
        (r"SELECT '\x0102'::bytea", r"\x0102"),
        ("SELECT ARRAY[1, NULL, 3]", "{1,NULL,3}"),
    ] {
        let rendered = db.scalar_list(sql, &Params::new(), &cancel).await.unwrap();
        assert_eq!(rendered, [expected], "{sql}");
    }

    let value = db
        .scalar("SELECT ARRAY['a', 'b']::text[]", &Params::new(), &cancel)
        .await
        .unwrap();
    assert_eq!(
        value,
        Some(Value::Array(ColumnValues::Varchar(vec![Some("a".into()), Some("b".into())])))
    );
}
