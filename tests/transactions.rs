mod common;

use bqlite::error::BqlError;

use common::{setup, temp_tables};

#[test]
fn begin_does_not_nest() {
    let (bql, _) = setup(1);
    bql.execute("BEGIN").unwrap();
    assert!(bql.in_transaction());
    assert!(matches!(bql.execute("BEGIN"), Err(BqlError::Transaction(_))));
    bql.execute("COMMIT").unwrap();
    assert!(!bql.in_transaction());
}

#[test]
fn commit_and_rollback_need_begin() {
    let (bql, _) = setup(1);
    assert!(matches!(bql.execute("COMMIT"), Err(BqlError::Transaction(_))));
    assert!(matches!(bql.execute("ROLLBACK"), Err(BqlError::Transaction(_))));
}

#[test]
fn rollback_undoes_catalog_changes() {
    let (bql, _) = setup(1);
    bql.execute_script(
        "BEGIN;
         CREATE GENERATOR h FOR p;
         INITIALIZE 3 MODELS FOR h;
         DROP MODELS 0 FROM g;",
    )
    .unwrap();
    assert!(bql.catalog().generator("h").unwrap().is_some());
    bql.execute("ROLLBACK").unwrap();
    let catalog = bql.catalog();
    assert!(catalog.generator("h").unwrap().is_none());
    let g = catalog.generator("g").unwrap().unwrap();
    assert_eq!(catalog.modelnos(g.id).unwrap(), vec![0]);
}

#[test]
fn committed_changes_stay() {
    let (bql, _) = setup(1);
    bql.execute_script("BEGIN TRANSACTION; ALTER GENERATOR g RENAME TO h; COMMIT TRANSACTION;")
        .unwrap();
    assert!(bql.catalog().generator("h").unwrap().is_some());
}

#[test]
fn a_failing_command_leaves_the_transaction_open() {
    let (bql, _) = setup(1);
    bql.execute("BEGIN").unwrap();
    bql.execute("INITIALIZE 2 MODELS IF NOT EXISTS FOR g").unwrap();
    assert!(bql.execute("CREATE GENERATOR h FOR p USING scripted (FAIL)").is_err());
    assert!(bql.in_transaction());
    bql.execute("COMMIT").unwrap();
    let catalog = bql.catalog();
    let g = catalog.generator("g").unwrap().unwrap();
    assert_eq!(catalog.modelnos(g.id).unwrap(), vec![0, 1]);
    assert!(catalog.generator("h").unwrap().is_none());
}

#[test]
fn queries_inside_a_transaction_clean_up() {
    let (bql, _) = setup(1);
    bql.execute("BEGIN").unwrap();
    let drawn = bql.execute("SIMULATE x FROM p LIMIT 3").unwrap().count();
    assert_eq!(drawn, 3);
    assert!(temp_tables(&bql).is_empty());
    bql.execute("ROLLBACK").unwrap();
}

#[test]
fn an_open_cursor_does_not_block_commit() {
    let (bql, _) = setup(1);
    bql.execute("BEGIN").unwrap();
    let mut cursor = bql.execute("SIMULATE x FROM p LIMIT 2").unwrap();
    assert!(cursor.next().is_some());
    bql.execute("COMMIT").unwrap();
    drop(cursor);
    assert!(temp_tables(&bql).is_empty());
}

#[test]
fn savepoints_nest_and_roll_back_alone() {
    let (bql, _) = setup(1);
    let outer = bql.savepoint().unwrap();
    bql.sql_execute("insert into t values (9.0, 'c', 9)").unwrap();
    {
        let inner = bql.savepoint().unwrap();
        bql.sql_execute("insert into t values (10.0, 'd', 10)").unwrap();
        inner.rollback().unwrap();
    }
    outer.commit().unwrap();
    let count: i64 = bql
        .connection()
        .query_row("select count(*) from t", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 5);
}
