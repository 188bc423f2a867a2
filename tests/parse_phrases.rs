use bqlite::ast::{Command, Phrase, Query};
use bqlite::error::{BqlError, DiagnosticKind};
use bqlite::parser::{is_complete, parse_bql_phrase, parse_bql_string, phrases};

#[test]
fn phrases_split_at_top_level_semicolons() {
    let parsed = parse_bql_string("SELECT 1; SELECT (SELECT 2); ; BEGIN").unwrap();
    assert_eq!(parsed.len(), 3);
    assert!(matches!(parsed[0].phrase(), Phrase::Query(Query::Select(_))));
    assert!(matches!(parsed[2].phrase(), Phrase::Command(Command::Begin)));
}

#[test]
fn diagnostics_are_collected_and_raised_once() {
    let mut scan = phrases("SELECT 1; SELECT FROM; SELECT x'abc'; SELECT 2");
    assert!(matches!(scan.next(), Some(Ok(_))));
    let Some(Err(BqlError::Parse { diagnostics })) = scan.next() else {
        panic!("expected the collected parse error");
    };
    assert_eq!(diagnostics.len(), 2);
    assert_eq!(diagnostics[0].kind, DiagnosticKind::Syntax);
    assert_eq!(diagnostics[1].kind, DiagnosticKind::Lexical);
    assert_eq!(diagnostics[0].line, 1);
    assert!(scan.next().is_none());
}

#[test]
fn a_single_phrase_is_required() {
    assert!(parse_bql_phrase("SELECT 1; SELECT 2").is_err());
    assert!(parse_bql_phrase("  ").is_err());
    assert!(parse_bql_phrase("SELECT 1;").is_ok());
}

#[test]
fn parameters_are_numbered_across_the_phrase() {
    let phrase = parse_bql_phrase("SELECT ?, :a, ?5, :a, @b").unwrap();
    assert_eq!(phrase.n_numpar(), 6);
    let names = phrase.nampar_map().unwrap();
    assert_eq!(names.get_by_left(":a"), Some(&2));
    assert_eq!(names.get_by_left("@b"), Some(&6));
    assert!(parse_bql_phrase("SELECT 1").unwrap().nampar_map().is_none());
}

#[test]
fn parameter_zero_is_out_of_range() {
    let err = parse_bql_phrase("SELECT ?0").unwrap_err();
    assert!(matches!(err, BqlError::Parse { .. }));
}

#[test]
fn completeness_for_interactive_input() {
    assert!(is_complete("SELECT 1;"));
    assert!(is_complete("SELECT 1; SELECT 2;"));
    assert!(!is_complete("SELECT 1"));
    assert!(!is_complete("SELECT 1 +"));
    assert!(!is_complete("SELECT 'abc"));
    assert!(!is_complete("SELECT 1; SELECT (2"));
    assert!(is_complete("SELECT ) 1"));
    assert!(!is_complete(""));
}
