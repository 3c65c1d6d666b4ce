//! Evaluator integration tests driven through a persistent session.
//!
//! Covers arithmetic and the binop fast path, strands and lists, control
//! structures, assignment, definitions, named expressions and fault
//! passthrough.

use nial::{CollectStringPrint, HeapLimits, Session, SessionOutcome, TopRequest};
use pretty_assertions::assert_eq;

fn session() -> Session {
    Session::new(HeapLimits::default())
}

fn eval(session: &mut Session, src: &str) -> String {
    let mut out = CollectStringPrint::new();
    let outcome = session.execute(src, &mut out);
    assert_eq!(outcome, SessionOutcome::Continue(TopRequest::None), "input: {src}");
    out.into_output().trim_end().to_owned()
}

// ============================================================================
// Arithmetic and atoms
// ============================================================================

#[test]
fn infix_arithmetic() {
    let mut s = session();
    assert_eq!(eval(&mut s, "1 + 2"), "3");
    assert_eq!(eval(&mut s, "2 * 3 + 4"), "10"); // infix groups to the left
    assert_eq!(eval(&mut s, "10 - 4"), "6");
    assert_eq!(eval(&mut s, "7 / 2"), "3.5");
}

#[test]
fn comparisons_and_logic() {
    let mut s = session();
    assert_eq!(eval(&mut s, "2 < 3"), "l");
    assert_eq!(eval(&mut s, "2 >= 3"), "o");
    assert_eq!(eval(&mut s, "[1,2] = [1,2]"), "l");
    assert_eq!(eval(&mut s, "[1,2] ~= [1,2]"), "o");
    assert_eq!(eval(&mut s, "l and o"), "o");
    assert_eq!(eval(&mut s, "not o"), "l");
}

#[test]
fn pervasive_ops_distribute_over_items() {
    let mut s = session();
    assert_eq!(eval(&mut s, "[1,2,3] + 10"), "11 12 13");
    assert_eq!(eval(&mut s, "[1,2] + [10,20]"), "11 21");
    assert_eq!(eval(&mut s, "opposite [1,-2]"), "-1 2");
}

#[test]
fn fault_passthrough_for_pervasive_ops() {
    let mut s = session();
    assert_eq!(eval(&mut s, "opposite ?err"), "?err");
    assert_eq!(eval(&mut s, "1 + ?err"), "?err");
    assert_eq!(eval(&mut s, "abs ?err"), "?err");
}

#[test]
fn unary_plus_reduces() {
    let mut s = session();
    assert_eq!(eval(&mut s, "+ [1,2,3]"), "6");
    assert_eq!(eval(&mut s, "* [2,3,4]"), "24");
}

// ============================================================================
// Strands, lists, structural ops
// ============================================================================

#[test]
fn strands_and_lists_package_values() {
    let mut s = session();
    assert_eq!(eval(&mut s, "1 2 3"), "1 2 3");
    assert_eq!(eval(&mut s, "[1, 2, 3]"), "1 2 3");
    assert_eq!(eval(&mut s, "tally [4,5,6]"), "3");
    assert_eq!(eval(&mut s, "shape (2 3 reshape count 6)"), "2 3");
    assert_eq!(eval(&mut s, "first [7,8]"), "7");
    assert_eq!(eval(&mut s, "rest [7,8,9]"), "8 9");
    assert_eq!(eval(&mut s, "reverse [1,2,3]"), "3 2 1");
    assert_eq!(eval(&mut s, "link [[1,2],[3]]"), "1 2 3");
    assert_eq!(eval(&mut s, "tell 4"), "0 1 2 3");
    assert_eq!(eval(&mut s, "count 4"), "1 2 3 4");
}

#[test]
fn reshape_cycles_items() {
    let mut s = session();
    assert_eq!(eval(&mut s, "2 3 reshape count 6"), "2 3 reshape 1 2 3 4 5 6");
    assert_eq!(eval(&mut s, "[5] reshape [1,2,3]"), "1 2 3 1 2");
}

// ============================================================================
// Assignment and persistence
// ============================================================================

#[test]
fn variables_persist_across_inputs() {
    let mut s = session();
    assert_eq!(eval(&mut s, "a := 5"), "5");
    assert_eq!(eval(&mut s, "a + 1"), "6");
    assert_eq!(eval(&mut s, "a := a + 10"), "15");
    assert_eq!(eval(&mut s, "a"), "15");
}

#[test]
fn multiple_assignment_distributes_pairwise() {
    let mut s = session();
    assert_eq!(eval(&mut s, "x y := [7, 8]"), "7 8");
    assert_eq!(eval(&mut s, "x"), "7");
    assert_eq!(eval(&mut s, "y"), "8");
    // Arity mismatch is the assignment fault.
    assert_eq!(eval(&mut s, "p q := [1, 2, 3]"), "?assignment");
}

#[test]
fn assignment_with_self_reference_is_safe() {
    let mut s = session();
    eval(&mut s, "v := [1, [2, 3]]");
    assert_eq!(eval(&mut s, "v := 1 pick v"), "2 3");
    assert_eq!(eval(&mut s, "v"), "2 3");
}

// ============================================================================
// Control structures
// ============================================================================

#[test]
fn if_expression_with_elseif_chain() {
    let mut s = session();
    eval(&mut s, "n := 3");
    assert_eq!(
        eval(&mut s, "IF n = 1 THEN 'one' ELSEIF n = 3 THEN 'three' ELSE 'other' ENDIF"),
        "'three'"
    );
    // A non-boolean test produces the ?L fault.
    assert_eq!(eval(&mut s, "IF 5 THEN 1 ENDIF"), "?L");
    // A false test without an else yields no value (nothing printed).
    assert_eq!(eval(&mut s, "IF o THEN 1 ENDIF"), "");
}

#[test]
fn while_loop_runs_to_completion() {
    let mut s = session();
    eval(&mut s, "i := 0");
    assert_eq!(eval(&mut s, "WHILE i < 5 DO i := i + 1 ENDWHILE"), "5");
    assert_eq!(eval(&mut s, "i"), "5");
}

#[test]
fn repeat_loop_tests_after_body() {
    let mut s = session();
    eval(&mut s, "i := 10");
    assert_eq!(eval(&mut s, "REPEAT i := i + 1 UNTIL i > 3 ENDREPEAT"), "11");
}

#[test]
fn for_loop_iterates_items() {
    let mut s = session();
    eval(&mut s, "acc := 0");
    assert_eq!(eval(&mut s, "FOR x WITH count 4 DO acc := acc + x ENDFOR"), "10");
    assert_eq!(eval(&mut s, "x"), "4");
}

#[test]
fn exit_unwinds_exactly_one_level() {
    let mut s = session();
    eval(&mut s, "total := 0");
    eval(
        &mut s,
        "FOR i WITH count 5 DO (FOR j WITH count 5 DO IF j = 3 THEN EXIT 0 ENDIF; total := total + 1 ENDFOR) ENDFOR",
    );
    // The inner loop stops at j = 3 each time; the outer loop continues.
    assert_eq!(eval(&mut s, "total"), "10");
}

#[test]
fn case_selects_by_equality() {
    let mut s = session();
    eval(&mut s, "x := 2");
    assert_eq!(
        eval(&mut s, "CASE x FROM 1 : 'one' END 2 : 'two' END ELSE 'many' ENDCASE"),
        "'two'"
    );
    eval(&mut s, "x := 9");
    assert_eq!(
        eval(&mut s, "CASE x FROM 1 : 'one' END 2 : 'two' END ELSE 'many' ENDCASE"),
        "'many'"
    );
    // No else clause and no match: no value.
    assert_eq!(eval(&mut s, "CASE x FROM 1 : 'one' END ENDCASE"), "");
}

// ============================================================================
// Definitions
// ============================================================================

#[test]
fn defined_operation_applies_and_recurses() {
    let mut s = session();
    assert_eq!(eval(&mut s, "double IS OP a (a + a)"), "");
    assert_eq!(eval(&mut s, "double 21"), "42");
    eval(&mut s, "fact IS OP n (IF n <= 1 THEN 1 ELSE n * (fact (n - 1)) ENDIF)");
    assert_eq!(eval(&mut s, "fact 5"), "120");
}

#[test]
fn defined_expression_reevaluates_its_body() {
    let mut s = session();
    eval(&mut s, "base := 10");
    eval(&mut s, "offset IS { base + 1 }");
    assert_eq!(eval(&mut s, "offset"), "11");
    eval(&mut s, "base := 20");
    assert_eq!(eval(&mut s, "offset"), "21");
}

#[test]
fn opform_with_two_parameters_destructures_argument() {
    let mut s = session();
    eval(&mut s, "addpair IS OP a b (a + b)");
    assert_eq!(eval(&mut s, "addpair [3, 4]"), "7");
    assert_eq!(eval(&mut s, "3 addpair 4"), "7"); // infix call forms the pair
    assert_eq!(eval(&mut s, "addpair [1, 2, 3]"), "?op_parameter");
}

#[test]
fn block_scope_is_closed() {
    let mut s = session();
    eval(&mut s, "g := 1");
    // A local hides nothing and disappears after the block.
    assert_eq!(eval(&mut s, "{ LOCAL t; t := 42; t + 1 }"), "43");
    // Assigning a global from inside a block requires NONLOCAL.
    assert_eq!(eval(&mut s, "{ NONLOCAL g; g := 9; g }"), "9");
    assert_eq!(eval(&mut s, "g"), "9");
}

#[test]
fn composition_applies_right_to_left() {
    let mut s = session();
    assert_eq!(eval(&mut s, "opposite abs -7"), "-7");
    assert_eq!(eval(&mut s, "abs opposite 7"), "7");
}

// ============================================================================
// Atlases
// ============================================================================

#[test]
fn atlas_applies_each_branch_to_the_argument() {
    let mut s = session();
    assert_eq!(eval(&mut s, "[opposite, abs] -3"), "3 3");
}

#[test]
fn atlas_keeps_left_to_right_order_and_fault_items() {
    let mut s = session();
    // second of an atom faults; the fault becomes the corresponding item.
    assert_eq!(eval(&mut s, "[second, first] 5"), "?address 5");
}

// ============================================================================
// Quoted programs
// ============================================================================

#[test]
fn quoted_program_is_a_value() {
    let mut s = session();
    eval(&mut s, "q := !(1 + 2)");
    assert_eq!(eval(&mut s, "execute '1 + 2'"), "3");
}
