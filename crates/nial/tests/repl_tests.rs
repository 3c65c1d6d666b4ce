//! Top-level session behavior: prefixes, recovery, the deferred undefined
//! error, workspace snapshots and the stack-height invariant.

use nial::{CollectStringPrint, HeapLimits, Session, SessionOutcome, TopRequest};
use pretty_assertions::assert_eq;

fn session() -> Session {
    Session::new(HeapLimits::default())
}

fn eval(session: &mut Session, src: &str) -> String {
    let mut out = CollectStringPrint::new();
    session.execute(src, &mut out);
    out.into_output().trim_end().to_owned()
}

// ============================================================================
// Line prefixes
// ============================================================================

#[test]
fn remark_lines_are_ignored() {
    let mut s = session();
    assert_eq!(eval(&mut s, "# this is a remark"), "");
    assert_eq!(eval(&mut s, "   "), "");
}

#[test]
fn bracket_prefix_names_the_previous_result() {
    let mut s = session();
    assert_eq!(eval(&mut s, "2 + 3"), "5");
    assert_eq!(eval(&mut s, "]keep"), "");
    assert_eq!(eval(&mut s, "keep * 2"), "10");
}

#[test]
fn bye_ends_the_session() {
    let mut s = session();
    let mut out = CollectStringPrint::new();
    assert_eq!(s.execute("bye", &mut out), SessionOutcome::Bye);
}

// ============================================================================
// Errors and recovery
// ============================================================================

#[test]
fn deferred_undefined_reports_at_the_identifier() {
    let mut s = session();
    // The assignment form succeeds even though the name is new.
    assert_eq!(eval(&mut s, "undef := 5"), "5");
    assert_eq!(eval(&mut s, "undef"), "5");
    // A use of an unbound name fails with the deferred error at the name.
    let report = eval(&mut s, "undef2 + 5");
    assert!(report.contains("undefined identifier"), "{report}");
    assert!(report.contains("UNDEF2"), "{report}");
}

#[test]
fn parse_errors_are_reported_with_context() {
    let mut s = session();
    let report = eval(&mut s, "IF l THEN 1");
    assert!(report.contains("expecting"), "{report}");
    // The session survives and continues.
    assert_eq!(eval(&mut s, "1 + 1"), "2");
}

#[test]
fn scan_errors_are_reported_as_faults() {
    let mut s = session();
    let report = eval(&mut s, "x := 'unterminated");
    assert!(report.starts_with("?SCAN"), "{report}");
    assert_eq!(eval(&mut s, "2 + 2"), "4");
}

#[test]
fn operand_stack_returns_to_pre_prompt_height() {
    let mut s = session();
    for src in ["1 + 2", "a := [1,2,3]", "a@1", "EACH opposite a", "bad +", "IF 5 THEN 1 ENDIF"] {
        let _ = eval(&mut s, src);
        assert_eq!(s.operand_depth(), 0, "after {src}");
    }
}

#[test]
fn triggered_fault_prints_call_stack() {
    let mut s = session();
    s.set_triggering(true);
    eval(&mut s, "inner IS OP x (second x)");
    eval(&mut s, "outer IS OP x (inner x)");
    let report = eval(&mut s, "outer 1");
    assert!(report.contains("?address"), "{report}");
    assert!(report.contains("in INNER"), "{report}");
    assert!(report.contains("in OUTER"), "{report}");
}

#[test]
fn fault_constants_trigger_only_when_enabled() {
    let mut s = session();
    assert_eq!(eval(&mut s, "?boom"), "?boom");
    s.set_triggering(true);
    // Inside parentheses, constant triggering is suppressed.
    assert_eq!(eval(&mut s, "(?boom)"), "?boom");
    // The sentinels never trigger.
    assert_eq!(eval(&mut s, "?noexpr"), "");
}

// ============================================================================
// Multi-line units and definition scripts
// ============================================================================

#[test]
fn multi_line_units_parse_as_one_action() {
    let mut s = session();
    let mut out = CollectStringPrint::new();
    let outcome = s.execute_unit(
        &["triple IS OP a", "   (a + a + a)"],
        &mut out,
    );
    assert_eq!(outcome, SessionOutcome::Continue(TopRequest::None));
    assert_eq!(eval(&mut s, "triple 4"), "12");
}

#[test]
fn loaddefs_executes_blank_line_separated_units() {
    let mut s = session();
    let dir = std::env::temp_dir();
    let path = dir.join("nial_test_defs.ndf");
    std::fs::write(
        &path,
        "half IS OP a (a / 2)\n\nquarter IS OP a\n   (half half a)\n\nstart := quarter 100\n",
    )
    .unwrap();
    let mut out = CollectStringPrint::new();
    s.loaddefs(&path, &mut out).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(eval(&mut s, "start"), "25.");
}

// ============================================================================
// Workspace snapshots
// ============================================================================

#[test]
fn workspace_round_trips_through_a_snapshot() {
    let mut s = session();
    eval(&mut s, "stock := [3, 1, 4, 1, 5]");
    eval(&mut s, "restock IS OP n (stock + n)");
    let path = std::env::temp_dir().join("nial_test_ws.nws");
    s.save_workspace(&path).unwrap();

    // Mutate, then load the snapshot back: the old bindings return.
    eval(&mut s, "stock := 0");
    s.load_workspace(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(eval(&mut s, "stock"), "3 1 4 1 5");
    assert_eq!(eval(&mut s, "restock 1"), "4 2 5 2 6");
}
