mod common;

use std::collections::{BTreeMap, HashMap};

use bqlite::engine::Bql;
use rusqlite::types::Value;

use common::setup;

fn rows(bql: &Bql, text: &str) -> Vec<Vec<Value>> {
    bql.execute(text).unwrap().collect()
}

fn real(value: &Value) -> f64 {
    match value {
        Value::Real(r) => *r,
        Value::Integer(i) => *i as f64,
        other => panic!("expected a number, got {other:?}"),
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::Text(t) => t.clone(),
        other => panic!("expected text, got {other:?}"),
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn dependence_probability_averages_the_models() {
    let (bql, _) = setup(1);
    assert_eq!(
        rows(&bql, "ESTIMATE DEPENDENCE PROBABILITY OF x WITH y BY p"),
        vec![vec![Value::Real(0.5)]]
    );
    assert_eq!(
        rows(&bql, "ESTIMATE DEPENDENCE PROBABILITY OF x WITH x BY p"),
        vec![vec![Value::Real(1.0)]]
    );

    let (bql, _) = setup(2);
    let found = rows(&bql, "ESTIMATE DEPENDENCE PROBABILITY OF x WITH y BY p");
    assert!(close(real(&found[0][0]), 0.55));
    let found = rows(
        &bql,
        "ESTIMATE DEPENDENCE PROBABILITY OF x WITH y BY p MODELED BY g USING MODEL 1",
    );
    assert!(close(real(&found[0][0]), 0.6));
}

#[test]
fn pairwise_columns_cover_every_ordered_pair() {
    let (bql, _) = setup(1);
    let found: BTreeMap<(String, String), f64> = rows(
        &bql,
        "ESTIMATE DEPENDENCE PROBABILITY AS d FROM PAIRWISE COLUMNS OF p",
    )
    .iter()
    .map(|row| ((text(&row[0]), text(&row[1])), real(&row[2])))
    .collect();
    assert_eq!(found.len(), 4);
    assert_eq!(found[&("x".to_string(), "x".to_string())], 1.0);
    assert_eq!(found[&("x".to_string(), "y".to_string())], 0.5);
    assert_eq!(found[&("y".to_string(), "x".to_string())], 0.5);
}

#[test]
fn one_column_context_names_each_variable() {
    let (bql, _) = setup(1);
    let found = rows(
        &bql,
        "ESTIMATE name, DEPENDENCE PROBABILITY WITH y AS d FROM COLUMNS OF p ORDER BY name",
    );
    assert_eq!(
        found,
        vec![
            vec![Value::Text("x".into()), Value::Real(0.5)],
            vec![Value::Text("y".into()), Value::Real(1.0)],
        ]
    );
    let found = rows(&bql, "ESTIMATE name FROM COLUMNS OF p FOR (y)");
    assert_eq!(found, vec![vec![Value::Text("y".into())]]);
}

#[test]
fn mutual_information_by_population_and_as_a_table() {
    let (bql, _) = setup(2);
    let found = rows(&bql, "ESTIMATE MUTUAL INFORMATION OF x WITH y BY p");
    // per model 0.2 and 1.2
    assert!(close(real(&found[0][0]), 0.7));

    let found = rows(
        &bql,
        "SELECT COUNT(*), MIN(mi), MAX(mi) FROM bql_mutinf
            WHERE population_id = 1 AND target_vars = '[0]' AND reference_vars = '[1]'",
    );
    assert_eq!(found[0][0], Value::Integer(2));
    assert!(close(real(&found[0][1]), 0.2));
    assert!(close(real(&found[0][2]), 1.2));

    let found = rows(
        &bql,
        "SELECT AVG(mi) FROM bql_mutinf
            WHERE population_id = 1 AND generator_id = 1 AND target_vars = '[0]'
            AND reference_vars = '[1]' AND conditions = '{\"1\": \"a\"}'",
    );
    assert!(close(real(&found[0][0]), 0.71));

    let unplanned = bql.execute("SELECT mi FROM bql_mutinf WHERE population_id = 1");
    assert!(unplanned.is_err());

    let oversampled = bql.execute(
        "SELECT mi FROM bql_mutinf
            WHERE population_id = 1 AND target_vars = '[0]' AND reference_vars = '[1]'
            AND nsamples = 4294967296",
    );
    assert!(oversampled.is_err());
}

#[test]
fn row_primitives_see_the_current_row() {
    let (bql, _) = setup(1);
    let found = rows(
        &bql,
        "ESTIMATE z, PREDICTIVE PROBABILITY OF x FROM p ORDER BY z",
    );
    assert_eq!(found.len(), 4);
    for row in &found[..3] {
        assert!(close(real(&row[1]), (-1.0f64).exp()));
    }
    assert_eq!(found[3][1], Value::Null);

    let found = rows(
        &bql,
        "ESTIMATE SIMILARITY TO (z = 1) IN THE CONTEXT OF x FROM p ORDER BY z",
    );
    let similarities: Vec<f64> = found.iter().map(|row| real(&row[0])).collect();
    assert!(close(similarities[0], 1.0));
    assert!(close(similarities[1], 0.5));
    assert!(close(similarities[3], 0.25));
}

#[test]
fn pairwise_rows_cross_the_table() {
    let (bql, _) = setup(1);
    let found = rows(
        &bql,
        "ESTIMATE SIMILARITY IN THE CONTEXT OF x AS s FROM PAIRWISE p WHERE r0.z = 1",
    );
    assert_eq!(found.len(), 4);
    for row in &found {
        let distance = (real(&row[1]) - real(&row[0])).abs();
        assert!(close(real(&row[2]), 1.0 / (1.0 + distance)));
    }
}

#[test]
fn infer_fills_only_missing_values() {
    let (bql, _) = setup(1);
    let found = rows(&bql, "INFER x FROM p ORDER BY z");
    let values: Vec<f64> = found.iter().map(|row| real(&row[0])).collect();
    assert_eq!(values, vec![1.0, 2.0, 3.0, 100.0]);

    let found = rows(&bql, "INFER x WITH CONFIDENCE 0.9 FROM p ORDER BY z");
    assert_eq!(found[3][0], Value::Null);
}

#[test]
fn infer_explicit_reports_value_and_confidence() {
    let (bql, _) = setup(1);
    let mut cursor = bql
        .execute("INFER EXPLICIT z, PREDICT x AS px CONFIDENCE cx FROM p WHERE x IS NULL")
        .unwrap();
    assert_eq!(cursor.columns(), ["z", "px", "cx"]);
    let row = cursor.next().unwrap();
    assert_eq!(row[0], Value::Integer(4));
    assert!(close(real(&row[1]), 100.0));
    assert!(close(real(&row[2]), 0.75));
    assert!(cursor.next().is_none());
}

#[test]
fn named_parameters_reach_estimates() {
    let (bql, _) = setup(1);
    let bindings = HashMap::from([("row".to_string(), Value::Integer(2))]);
    let found: Vec<Vec<Value>> = bql
        .execute_with(
            "ESTIMATE PREDICTIVE PROBABILITY OF x FROM p WHERE z = :row",
            bindings,
        )
        .unwrap()
        .collect();
    assert_eq!(found.len(), 1);
    assert!(close(real(&found[0][0]), (-1.0f64).exp()));
}

#[test]
fn predictive_relevance_counts_the_query_rows() {
    let (bql, _) = setup(1);
    let found = rows(
        &bql,
        "ESTIMATE PREDICTIVE RELEVANCE TO EXISTING ROWS (z < 3) AND HYPOTHETICAL ROWS WITH VALUES ((x = 1.5)) IN THE CONTEXT OF x FROM p LIMIT 1",
    );
    assert!(close(real(&found[0][0]), 3.0));
}
