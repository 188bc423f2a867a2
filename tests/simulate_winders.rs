mod common;

use bqlite::error::BqlError;
use bqlite::output::Bindings;
use rusqlite::types::Value;

use common::{setup, temp_tables};

fn integers(rows: Vec<Vec<Value>>) -> Vec<Vec<i64>> {
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|v| match v {
                    Value::Integer(i) => i,
                    other => panic!("expected an integer, got {other:?}"),
                })
                .collect()
        })
        .collect()
}

#[test]
fn simulate_compiles_to_winders_and_one_unwinder() {
    let (bql, _) = setup(1);
    let compiled = bql.compile("SIMULATE x FROM p LIMIT 3", Bindings::None).unwrap();
    assert_eq!(compiled.sql, "SELECT * FROM temp.\"bql_sim_0\"");
    assert_eq!(compiled.winders.len(), 4);
    assert_eq!(compiled.winders[0].sql, "CREATE TEMP TABLE \"bql_sim_0\" (\"x\")");
    assert_eq!(compiled.winders[2].bindings, vec![Value::Integer(1)]);
    assert_eq!(compiled.unwinders.len(), 1);
    assert!(compiled.unwinders[0].sql.starts_with("DROP TABLE"));
    assert!(temp_tables(&bql).is_empty());
}

#[test]
fn draws_are_returned_then_cleaned_up() {
    let (bql, _) = setup(1);
    let rows: Vec<Vec<Value>> = bql.execute("SIMULATE x, y FROM p LIMIT 3").unwrap().collect();
    assert_eq!(integers(rows), vec![vec![0, 10], vec![1, 11], vec![2, 12]]);
    assert!(temp_tables(&bql).is_empty());
}

#[test]
fn the_table_lives_until_the_cursor_is_done() {
    let (bql, _) = setup(1);
    let mut cursor = bql.execute("SIMULATE x FROM p LIMIT 2").unwrap();
    assert_eq!(cursor.columns(), ["x"]);
    assert!(cursor.next().is_some());
    assert_eq!(temp_tables(&bql), vec!["bql_sim_0".to_string()]);
    assert!(cursor.next().is_some());
    assert!(cursor.next().is_none());
    assert!(temp_tables(&bql).is_empty());
}

#[test]
fn abandoning_a_cursor_drops_its_table() {
    let (bql, _) = setup(1);
    let mut cursor = bql.execute("SIMULATE x FROM p LIMIT 5").unwrap();
    assert!(cursor.next().is_some());
    drop(cursor);
    assert!(temp_tables(&bql).is_empty());

    let cursor = bql.execute("SIMULATE x FROM p LIMIT 5").unwrap();
    assert_eq!(cursor.remaining(), 5);
    cursor.close();
    assert!(temp_tables(&bql).is_empty());
}

#[test]
fn limit_and_givens_take_parameters() {
    let (bql, _) = setup(2);
    let rows: Vec<Vec<Value>> = bql
        .execute_with(
            "SIMULATE x FROM p GIVEN y = ?1 LIMIT ?2",
            vec![Value::Text("a".into()), Value::Integer(2)],
        )
        .unwrap()
        .collect();
    assert_eq!(integers(rows), vec![vec![0], vec![1]]);
    assert!(matches!(
        bql.execute("SIMULATE x FROM p LIMIT -1"),
        Err(BqlError::Bind(_))
    ));
}

#[test]
fn nested_simulations_are_lifted_to_the_outer_query() {
    let (bql, _) = setup(1);
    let compiled = bql
        .compile(
            "SELECT COUNT(*) FROM (SIMULATE x FROM p LIMIT 4), (SIMULATE y FROM p LIMIT 2)",
            Bindings::None,
        )
        .unwrap();
    assert_eq!(compiled.unwinders.len(), 2);
    assert!(compiled.sql.contains("bql_sim_0"));
    assert!(compiled.sql.contains("bql_sim_1"));

    let rows: Vec<Vec<Value>> = bql
        .execute("SELECT COUNT(*) FROM (SIMULATE x FROM p LIMIT 4), (SIMULATE y FROM p LIMIT 2)")
        .unwrap()
        .collect();
    assert_eq!(rows, vec![vec![Value::Integer(8)]]);
    assert!(temp_tables(&bql).is_empty());
}

#[test]
fn a_failing_statement_still_unwinds() {
    let (bql, _) = setup(1);
    let outcome = bql.execute("SELECT nosuchcolumn FROM (SIMULATE x FROM p LIMIT 2)");
    assert!(matches!(outcome, Err(BqlError::Sql(_))));
    assert!(temp_tables(&bql).is_empty());
}

#[test]
fn misspelled_columns_are_errors_not_text() {
    let (bql, _) = setup(1);
    let err = bql.execute("SELECT nosuchcolumn FROM t").err().unwrap();
    assert!(err.to_string().contains("no such column"), "{err}");
    assert!(bql.execute("ESTIMATE nosuchcolumn FROM p").is_err());
}

#[test]
fn create_table_as_simulate_keeps_the_draws() {
    let (bql, _) = setup(1);
    bql.execute_script("CREATE TABLE s AS SIMULATE x FROM p LIMIT 5;").unwrap();
    let count: i64 = bql
        .connection()
        .query_row("select count(*) from s", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 5);
    assert!(temp_tables(&bql).is_empty());
}

#[test]
fn simulate_from_models_yields_one_row_per_model() {
    let (bql, _) = setup(3);
    let rows: Vec<Vec<Value>> = bql
        .execute("SIMULATE x FROM MODELS OF p")
        .unwrap()
        .collect();
    assert_eq!(rows.len(), 3);
}
