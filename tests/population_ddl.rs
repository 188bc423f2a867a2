mod common;

use bqlite::engine::Bql;
use bqlite::error::BqlError;

use common::setup;

/// Adds table `w(id, n, k, c)`: a text key, a spread-out real, a small
/// integer code and a two-valued label.
fn with_wide_table(bql: &Bql) {
    bql.sql_execute("create table w (id text, n real, k integer, c text)")
        .unwrap();
    for i in 0..30 {
        bql.connection()
            .execute(
                "insert into w values (?, ?, ?, ?)",
                rusqlite::params![format!("row{i}"), i as f64 / 3.0, i % 3, ["a", "b"][i % 2]],
            )
            .unwrap();
    }
}

fn stattypes(bql: &Bql, population: &str) -> Vec<(String, String)> {
    let catalog = bql.catalog();
    let population = catalog.population(population).unwrap().unwrap();
    catalog
        .manifest_variables(population.id)
        .unwrap()
        .into_iter()
        .map(|v| (v.name, v.stattype))
        .collect()
}

fn pairs(expected: &[(&str, &str)]) -> Vec<(String, String)> {
    expected
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
}

#[test]
fn guessing_models_what_the_data_supports() {
    let (bql, _) = setup(1);
    with_wide_table(&bql);
    bql.execute_script("CREATE POPULATION q FOR w (GUESS STATTYPES OF (*));")
        .unwrap();
    assert_eq!(
        stattypes(&bql, "q"),
        pairs(&[("n", "numerical"), ("k", "nominal"), ("c", "nominal")])
    );
}

#[test]
fn explicit_types_win_over_guessing_the_rest() {
    let (bql, _) = setup(1);
    with_wide_table(&bql);
    bql.execute_script("CREATE POPULATION q FOR w (k NUMERICAL; IGNORE c; GUESS *);")
        .unwrap();
    assert_eq!(
        stattypes(&bql, "q"),
        pairs(&[("n", "numerical"), ("k", "numerical")])
    );
}

#[test]
fn every_column_must_be_accounted_for_once() {
    let (bql, _) = setup(1);
    with_wide_table(&bql);
    let cases = [
        (
            "CREATE POPULATION q FOR w (n NUMERICAL; MODEL n AS NOMINAL; IGNORE id, k, c)",
            "appears twice",
        ),
        (
            "CREATE POPULATION q FOR w (n NUMERICAL; IGNORE id, k; GUESS (n, c))",
            "appears twice",
        ),
        ("CREATE POPULATION q FOR w (n NUMERICAL)", "has no statistical type"),
        (
            "CREATE POPULATION q FOR w (MODEL n AS banana; IGNORE id, k, c)",
            "unknown statistical type",
        ),
        ("CREATE POPULATION q FOR w (nosuch NUMERICAL; IGNORE id)", "no such column"),
        ("CREATE POPULATION q FOR nosuch (GUESS *)", "no such table"),
        ("CREATE POPULATION p FOR w (GUESS *)", "already exists"),
    ];
    for (text, message) in cases {
        let err = bql.execute(text).err().unwrap();
        assert!(
            err.to_string().contains(message),
            "{text}: expected {message:?}, got {err}"
        );
    }
    assert!(bql.catalog().population("q").unwrap().is_none());
    bql.execute("CREATE POPULATION IF NOT EXISTS p FOR w (GUESS *)")
        .unwrap();
}

#[test]
fn a_rejected_generator_leaves_no_trace() {
    let (bql, backend) = setup(1);
    let err = bql
        .execute("CREATE GENERATOR h FOR p USING scripted (FAIL)")
        .err()
        .unwrap();
    assert!(matches!(err, BqlError::Backend(_)));
    assert!(bql.catalog().generator("h").unwrap().is_none());
    assert_eq!(backend.calls().iter().filter(|c| c.starts_with("create")).count(), 1);

    bql.execute("CREATE GENERATOR h FOR p").unwrap();
    let generator = bql.catalog().generator("h").unwrap().unwrap();
    assert_eq!(generator.backend, "scripted");
    bql.execute("CREATE GENERATOR IF NOT EXISTS h FOR p").unwrap();
    assert!(bql.execute("CREATE GENERATOR h FOR p").is_err());
    assert!(bql.execute("CREATE GENERATOR k FOR p USING nosuch").is_err());
}

#[test]
fn modeled_populations_are_fixed() {
    let (bql, backend) = setup(1);
    let err = bql.execute("DROP POPULATION p").err().unwrap();
    assert!(err.to_string().contains("still modeled by generator g"));
    let err = bql.execute("ALTER POPULATION p SET STATTYPES OF y TO NOMINAL").err().unwrap();
    assert!(err.to_string().contains("variables are fixed"));
    let err = bql.execute("DROP TABLE t").err().unwrap();
    assert!(err.to_string().contains("base of a population"));

    bql.execute_script("DROP GENERATOR g; DROP POPULATION p; DROP TABLE t;")
        .unwrap();
    assert_eq!(backend.calls()[2..], ["drop models 1 None", "drop 1"]);
    assert!(bql.catalog().population("p").unwrap().is_none());
    bql.execute("DROP POPULATION IF EXISTS p").unwrap();
    assert!(bql.execute("DROP GENERATOR g").is_err());
}

#[test]
fn unmodeled_populations_can_be_altered() {
    let (bql, _) = setup(1);
    with_wide_table(&bql);
    bql.execute_script(
        "CREATE POPULATION q FOR w (n NUMERICAL; IGNORE id, k, c);
         ALTER POPULATION q ADD VARIABLE k, SET STATTYPES OF n TO NOMINAL;",
    )
    .unwrap();
    assert_eq!(
        stattypes(&bql, "q"),
        pairs(&[("n", "nominal"), ("k", "nominal")])
    );
    let err = bql.execute("ALTER POPULATION q ADD VARIABLE c NUMERICAL").err().unwrap();
    assert!(err.to_string().contains("not numbers"));
    let err = bql.execute("ALTER POPULATION q ADD VARIABLE k NOMINAL").err().unwrap();
    assert!(err.to_string().contains("already has variable k"));
    let err = bql.execute("ALTER POPULATION q ADD VARIABLE id").err().unwrap();
    assert!(err.to_string().contains("looks like a key"));
    let err = bql.execute("ALTER POPULATION q ADD VARIABLE nosuch NOMINAL").err().unwrap();
    assert!(err.to_string().contains("no such column"));

    bql.execute("ALTER POPULATION q ADD VARIABLE C NOMINAL").unwrap();
    assert_eq!(
        stattypes(&bql, "q").last().unwrap(),
        &("c".to_string(), "nominal".to_string())
    );
}

#[test]
fn model_lifecycle() {
    let (bql, backend) = setup(2);
    let generator = bql.catalog().generator("g").unwrap().unwrap();
    let err = bql.execute("INITIALIZE 2 MODELS FOR g").err().unwrap();
    assert!(err.to_string().contains("already has model 0"));

    bql.execute("INITIALIZE 4 MODELS IF NOT EXISTS FOR g").unwrap();
    assert_eq!(bql.catalog().modelnos(generator.id).unwrap(), vec![0, 1, 2, 3]);
    assert!(backend.calls().contains(&"initialize 1 [2, 3]".to_string()));

    bql.execute("ANALYZE g MODELS 1-2 FOR 5 ITERATIONS WAIT").unwrap();
    assert_eq!(
        backend.calls().last().unwrap(),
        "analyze 1 Some([1, 2]) Some(5) None"
    );
    assert_eq!(bql.catalog().iterations(generator.id, 1).unwrap(), Some(5));
    assert_eq!(bql.catalog().iterations(generator.id, 0).unwrap(), Some(0));

    bql.execute("ANALYZE g FOR 1 MINUTE").unwrap();
    assert_eq!(backend.calls().last().unwrap(), "analyze 1 None None Some(60)");

    let err = bql.execute("ANALYZE g").err().unwrap();
    assert!(err.to_string().contains("needs a budget"));
    let err = bql.execute("ANALYZE g MODELS 9 FOR 1 ITERATION").err().unwrap();
    assert!(err.to_string().contains("has no model 9"));

    bql.execute("DROP MODELS 0 FROM g").unwrap();
    assert_eq!(bql.catalog().modelnos(generator.id).unwrap(), vec![1, 2, 3]);
    assert!(bql.execute("DROP MODELS 0 FROM g").is_err());
    bql.execute("DROP MODELS FROM g").unwrap();
    assert!(bql.catalog().modelnos(generator.id).unwrap().is_empty());
    let err = bql.execute("ANALYZE g FOR 1 ITERATION").err().unwrap();
    assert!(err.to_string().contains("no models to analyze"));
}

#[test]
fn renamed_generators_answer_to_the_new_name() {
    let (bql, backend) = setup(1);
    bql.execute("ALTER GENERATOR g RENAME TO h").unwrap();
    assert!(bql.catalog().generator("g").unwrap().is_none());
    assert!(bql.catalog().generator("h").unwrap().is_some());
    assert!(backend.calls().contains(&"rename g h".to_string()));
    bql.execute("ESTIMATE DEPENDENCE PROBABILITY OF x WITH y BY p MODELED BY h")
        .unwrap();
    assert!(
        bql.execute("ESTIMATE DEPENDENCE PROBABILITY OF x WITH y BY p MODELED BY g")
            .is_err()
    );
}

#[test]
fn generators_declare_latent_variables() {
    let (bql, _) = setup(1);
    bql.execute_script(
        "CREATE GENERATOR h FOR p USING scripted (LATENT u NUMERICAL, LATENT v NOMINAL);
         INITIALIZE 1 MODELS FOR h;",
    )
    .unwrap();
    let population = bql.catalog().population("p").unwrap().unwrap();
    let h = bql.catalog().generator("h").unwrap().unwrap();
    let latent: Vec<(i64, String)> = bql
        .catalog()
        .variables(population.id, Some(h.id))
        .unwrap()
        .into_iter()
        .filter(|v| v.is_latent())
        .map(|v| (v.colno, v.name))
        .collect();
    assert_eq!(latent, vec![(-1, "u".to_string()), (-2, "v".to_string())]);
    assert_eq!(bql.catalog().manifest_variables(population.id).unwrap().len(), 2);

    let err = bql
        .execute("ESTIMATE DEPENDENCE PROBABILITY OF x WITH u BY p")
        .err()
        .unwrap();
    assert!(err.to_string().contains("is latent"), "{err}");
    let found: Vec<Vec<rusqlite::types::Value>> = bql
        .execute("ESTIMATE DEPENDENCE PROBABILITY OF x WITH u BY p MODELED BY h")
        .unwrap()
        .collect();
    assert_eq!(found, vec![vec![rusqlite::types::Value::Real(0.5)]]);

    bql.execute("DROP GENERATOR h").unwrap();
    assert!(
        bql.catalog()
            .variables(population.id, Some(h.id))
            .unwrap()
            .iter()
            .all(|v| !v.is_latent())
    );
}

#[test]
fn latent_variables_must_be_new_and_typed() {
    let (bql, _) = setup(1);
    let err = bql
        .execute("CREATE GENERATOR h FOR p USING scripted (LATENT x NUMERICAL)")
        .err()
        .unwrap();
    assert!(err.to_string().contains("already exists"), "{err}");
    let err = bql
        .execute("CREATE GENERATOR h FOR p USING scripted (LATENT w banana)")
        .err()
        .unwrap();
    assert!(err.to_string().contains("unknown statistical type"), "{err}");
    assert!(bql.catalog().generator("h").unwrap().is_none());
}
