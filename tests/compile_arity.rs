mod common;

use std::collections::HashMap;

use bqlite::error::BqlError;
use bqlite::output::Bindings;
use rusqlite::types::Value;

use common::setup;

/// Query shapes and how many columns each supplies implicitly.
const CONTEXTS: [(&str, usize); 5] = [
    ("ESTIMATE {} BY p", 0),
    ("ESTIMATE {} FROM p", 0),
    ("ESTIMATE {} FROM PAIRWISE p", 0),
    ("ESTIMATE {} FROM COLUMNS OF p", 1),
    ("ESTIMATE {} FROM PAIRWISE COLUMNS OF p", 2),
];

/// Column-pair primitives by how many columns they name.
const FORMS: [(&str, usize); 6] = [
    ("CORRELATION", 0),
    ("CORRELATION WITH y", 1),
    ("CORRELATION OF x WITH y", 2),
    ("DEPENDENCE PROBABILITY", 0),
    ("DEPENDENCE PROBABILITY WITH y", 1),
    ("DEPENDENCE PROBABILITY OF x WITH y", 2),
];

#[test]
fn column_pairs_compile_only_with_exactly_two_columns() {
    let (bql, _) = setup(1);
    for (shape, implicit) in CONTEXTS {
        for (form, explicit) in FORMS {
            let text = shape.replace("{}", form);
            let outcome = bql.compile(&text, Bindings::None);
            if implicit + explicit == 2 {
                assert!(outcome.is_ok(), "{text} should compile: {outcome:?}");
            } else {
                match outcome {
                    Err(BqlError::Compile(_)) => {}
                    other => panic!("{text} should be an arity error, got {other:?}"),
                }
            }
        }
    }
}

#[test]
fn dependence_probability_by_population_is_a_single_call() {
    let (bql, _) = setup(2);
    let compiled = bql
        .compile("ESTIMATE DEPENDENCE PROBABILITY OF x WITH y BY p", Bindings::None)
        .unwrap();
    assert_eq!(
        compiled.sql,
        "SELECT bql_column_dependence_probability(1, NULL, NULL, 0, 1)"
    );
    let compiled = bql
        .compile(
            "ESTIMATE DEPENDENCE PROBABILITY OF x WITH y BY p MODELED BY g USING MODELS 0-1",
            Bindings::None,
        )
        .unwrap();
    assert!(
        compiled
            .sql
            .contains("bql_column_dependence_probability(1, 1, '[0,1]', 0, 1)"),
        "{}",
        compiled.sql
    );
}

#[test]
fn pairwise_columns_fill_both_positions() {
    let (bql, _) = setup(1);
    let compiled = bql
        .compile(
            "ESTIMATE DEPENDENCE PROBABILITY AS d FROM PAIRWISE COLUMNS OF p",
            Bindings::None,
        )
        .unwrap();
    assert!(compiled.sql.contains(
        "bql_column_dependence_probability(1, NULL, NULL, \"v0\".colno, \"v1\".colno) AS \"d\""
    ));
    assert!(compiled.winders.is_empty());
}

#[test]
fn compiling_twice_gives_the_same_output() {
    let (bql, _) = setup(1);
    for text in [
        "ESTIMATE PREDICTIVE PROBABILITY OF x GIVEN (y) FROM p WHERE y = 'a'",
        "ESTIMATE MUTUAL INFORMATION WITH y USING 10 SAMPLES FROM COLUMNS OF p",
        "ESTIMATE SIMILARITY IN THE CONTEXT OF x FROM PAIRWISE p LIMIT 3",
        "INFER x, y WITH CONFIDENCE 0.5 FROM p",
        "SIMULATE x FROM p LIMIT 2",
    ] {
        let first = bql.compile(text, Bindings::None).unwrap();
        let second = bql.compile(text, Bindings::None).unwrap();
        assert_eq!(first, second, "{text}");
    }
}

#[test]
fn numbered_parameters_are_renumbered_in_order_of_use() {
    let (bql, _) = setup(1);
    let compiled = bql
        .compile(
            "SELECT ?2, ?1 FROM t",
            vec![Value::Integer(10), Value::Integer(20)],
        )
        .unwrap();
    assert_eq!(compiled.sql, "SELECT ?1, ?2 FROM \"t\"");
    assert_eq!(compiled.bindings, vec![Value::Integer(20), Value::Integer(10)]);
}

#[test]
fn a_repeated_name_binds_one_slot() {
    let (bql, _) = setup(1);
    let text = "SELECT * FROM t WHERE x > :lo AND x < :hi OR x = :lo";
    let named = HashMap::from([
        ("lo".to_string(), Value::Real(1.0)),
        (":hi".to_string(), Value::Real(3.0)),
    ]);
    let compiled = bql.compile(text, named).unwrap();
    assert_eq!(compiled.sql.matches("?1").count(), 2);
    assert_eq!(compiled.sql.matches("?2").count(), 1);
    assert_eq!(compiled.bindings, vec![Value::Real(1.0), Value::Real(3.0)]);

    let missing = HashMap::from([("lo".to_string(), Value::Real(1.0))]);
    assert!(matches!(bql.compile(text, missing), Err(BqlError::Bind(_))));
    let unknown = HashMap::from([
        ("lo".to_string(), Value::Real(1.0)),
        ("hi".to_string(), Value::Real(3.0)),
        ("mid".to_string(), Value::Real(2.0)),
    ]);
    assert!(matches!(bql.compile(text, unknown), Err(BqlError::Bind(_))));
    assert!(matches!(
        bql.compile(text, vec![Value::Integer(1)]),
        Err(BqlError::Bind(_))
    ));
}

#[test]
fn bad_references_are_compile_errors() {
    let (bql, _) = setup(2);
    let cases = [
        ("ESTIMATE * FROM q", "no such population: q"),
        ("ESTIMATE DEPENDENCE PROBABILITY OF x WITH w BY p", "no such variable w"),
        ("ESTIMATE DEPENDENCE PROBABILITY OF x WITH y BY p MODELED BY h", "no such generator: h"),
        (
            "ESTIMATE DEPENDENCE PROBABILITY OF x WITH y BY p MODELED BY g USING MODEL 7",
            "has no model 7",
        ),
        (
            "ESTIMATE PREDICTIVE PROBABILITY OF x GIVEN (x) FROM p",
            "both a target and a constraint",
        ),
        ("ESTIMATE MUTUAL INFORMATION OF * WITH * BY p", "at most one position"),
        ("SIMULATE x, x FROM p LIMIT 1", "simulated twice"),
        ("SELECT DEPENDENCE PROBABILITY OF x WITH y FROM t", "not in plain SQL"),
        ("SELECT CORRELATION OF x WITH y FROM t", "not in plain SQL"),
        ("SELECT MUTUAL INFORMATION OF x WITH y FROM t", "not in plain SQL"),
        ("SELECT SIMILARITY TO (z = 1) IN THE CONTEXT OF x FROM t", "not in plain SQL"),
        (
            "SELECT PREDICTIVE RELEVANCE TO EXISTING ROWS (z < 3) IN THE CONTEXT OF x FROM t",
            "not in plain SQL",
        ),
        ("SELECT PREDICTIVE PROBABILITY OF x FROM t", "not in plain SQL"),
        ("CREATE TABLE u AS SELECT 1", "only queries compile"),
    ];
    for (text, message) in cases {
        let err = bql.compile(text, Bindings::None).unwrap_err();
        assert!(
            err.to_string().contains(message),
            "{text}: expected {message:?}, got {err}"
        );
    }
}
