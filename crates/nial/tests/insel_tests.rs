//! Indexed selection and insertion through the language surface: the four
//! notations, copy-on-write, ordering and abort guarantees, and the
//! update/updateall/deepupdate primitives that mirror them.

use nial::{CollectStringPrint, HeapLimits, Session};
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
// Selection
// ============================================================================

#[test]
fn pick_selects_one_item() {
    let mut s = session();
    eval(&mut s, "v := [10, 20, 30]");
    assert_eq!(eval(&mut s, "v@1"), "20");
    assert_eq!(eval(&mut s, "1 pick v"), "20");
    assert_eq!(eval(&mut s, "v@9"), "?address");
}

#[test]
fn multi_axis_pick_collapses_by_horner_rule() {
    let mut s = session();
    eval(&mut s, "t := 2 3 reshape count 6");
    assert_eq!(eval(&mut s, "t@[1, 2]"), "6");
    assert_eq!(eval(&mut s, "t@[2, 0]"), "?address");
    // Valence mismatch is an address failure.
    assert_eq!(eval(&mut s, "t@1"), "?address");
}

#[test]
fn reach_picks_through_nesting() {
    let mut s = session();
    eval(&mut s, "n := [[1, 2], [3, [4, 5]]]");
    assert_eq!(eval(&mut s, "n@@[0, 1]"), "2");
    assert_eq!(eval(&mut s, "n@@[1, 1, 0]"), "4");
    assert_eq!(eval(&mut s, "n@@[1, 9]"), "?path");
}

#[test]
fn choose_returns_shaped_selection() {
    let mut s = session();
    eval(&mut s, "v := [10, 20, 30]");
    assert_eq!(eval(&mut s, "v#[2, 0]"), "30 10");
    assert_eq!(eval(&mut s, "[2, 0] choose v"), "30 10");
    assert_eq!(eval(&mut s, "v#[0, 9]"), "?addresses");
}

#[test]
fn choose_equals_each_left_pick() {
    let mut s = session();
    eval(&mut s, "v := [10, 20, 30]");
    eval(&mut s, "i := [2, 0, 1]");
    assert_eq!(eval(&mut s, "(i choose v) = (EACHLEFT pick [i, v])"), "l");
}

#[test]
fn slice_selects_rows_and_columns() {
    let mut s = session();
    eval(&mut s, "t := 2 3 reshape count 6");
    // Row and column slices (the optimized paths).
    assert_eq!(eval(&mut s, "t|[0, ]"), "1 2 3");
    assert_eq!(eval(&mut s, "t|[1, ]"), "4 5 6");
    assert_eq!(eval(&mut s, "t|[, 1]"), "2 5");
    // General slice: kept axes keep their extent.
    assert_eq!(eval(&mut s, "t|[[0, 1], [0, 2]]"), "2 2 reshape 1 3 4 6");
    assert_eq!(eval(&mut s, "t|[0, 9]"), "?slice");
}

// ============================================================================
// Insertion
// ============================================================================

#[test]
fn indexed_assign_updates_and_returns_value() {
    let mut s = session();
    eval(&mut s, "v := [1, 2, 3]");
    assert_eq!(eval(&mut s, "v@1 := 99"), "1 99 3");
    assert_eq!(eval(&mut s, "v"), "1 99 3");
}

#[test]
fn copy_on_write_preserves_other_bindings() {
    let mut s = session();
    eval(&mut s, "a := [[1, 2], [3, 4]]");
    eval(&mut s, "b := a");
    eval(&mut s, "a@@[0, 0] := 99");
    assert_eq!(eval(&mut s, "a"), "[99,2] [3,4]");
    assert_eq!(eval(&mut s, "b"), "[1,2] [3,4]");
}

#[test]
fn kind_mismatch_explodes_and_restores() {
    let mut s = session();
    eval(&mut s, "v := [1, 2, 3]");
    assert_eq!(eval(&mut s, "v@0 := `x"), "`x 2 3");
    assert_eq!(eval(&mut s, "v@0 := 7"), "7 2 3");
}

#[test]
fn placeall_notation_applies_in_address_order() {
    let mut s = session();
    eval(&mut s, "v := count 5");
    assert_eq!(eval(&mut s, "v#[1, 1, 2] := [9, 8, 7]"), "1 8 7 4 5");
}

#[test]
fn invalid_address_aborts_without_committing() {
    let mut s = session();
    eval(&mut s, "v := [0, 0, 0]");
    assert_eq!(eval(&mut s, "v#[0, 9] := [5, 6]"), "?addresses");
    assert_eq!(eval(&mut s, "v"), "0 0 0");
}

#[test]
fn slice_insert_replicates_rank_zero_values() {
    let mut s = session();
    eval(&mut s, "t := 2 3 reshape count 6");
    assert_eq!(eval(&mut s, "t|[0, ] := 0"), "2 3 reshape 0 0 0 4 5 6");
    eval(&mut s, "t := 2 3 reshape count 6");
    assert_eq!(eval(&mut s, "t|[, 2] := [9, 9]"), "2 3 reshape 1 2 9 4 5 9");
    eval(&mut s, "t := 2 3 reshape count 6");
    assert_eq!(eval(&mut s, "t|[1, ] := [7, 8, 9]"), "2 3 reshape 1 2 3 7 8 9");
}

#[test]
fn pick_place_inverse_through_the_notation() {
    let mut s = session();
    eval(&mut s, "v := [5, 6, 7]");
    eval(&mut s, "v@2 := 42");
    assert_eq!(eval(&mut s, "v@2"), "42");
}

// ============================================================================
// The update primitives delegate to the same engine
// ============================================================================

#[test]
fn update_mirrors_indexed_assignment() {
    let mut s = session();
    eval(&mut s, "v := [1, 2, 3]");
    assert_eq!(eval(&mut s, "update [\"v, 1, 42]"), "1 42 3");
    assert_eq!(eval(&mut s, "v"), "1 42 3");
}

#[test]
fn updateall_mirrors_choose_assignment() {
    let mut s = session();
    eval(&mut s, "v := [0, 0, 0]");
    assert_eq!(eval(&mut s, "updateall [\"v, [0, 2], [7, 8]]"), "7 0 8");
    assert_eq!(eval(&mut s, "v"), "7 0 8");
}

#[test]
fn deepupdate_mirrors_reach_assignment() {
    let mut s = session();
    eval(&mut s, "n := [[1, 2], [3, 4]]");
    assert_eq!(eval(&mut s, "deepupdate [\"n, [1, 0], 99]"), "[1,2] [99,4]");
    assert_eq!(eval(&mut s, "n"), "[1,2] [99,4]");
}

#[test]
fn place_primitive_returns_updated_container() {
    let mut s = session();
    assert_eq!(eval(&mut s, "place [[99, 1], [1, 2, 3]]"), "1 99 3");
    assert_eq!(eval(&mut s, "place [[99, 9], [1, 2, 3]]"), "?address");
    assert_eq!(eval(&mut s, "placeall [[[9, 8], [0, 1]], [1, 2, 3]]"), "9 8 3");
    assert_eq!(eval(&mut s, "deepplace [[99, [0, 1]], [[1, 2], [3, 4]]]"), "[1,99] [3,4]");
}
