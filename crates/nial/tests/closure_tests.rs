//! Closure construction and transformer semantics: environment capture for
//! deferred application, atlas transparency, and the trivial-op shortcuts.

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

#[test]
fn each_applies_an_operation_to_every_item() {
    let mut s = session();
    assert_eq!(eval(&mut s, "EACH opposite [1, 2, 3]"), "-1 -2 -3");
    eval(&mut s, "double IS OP a (a + a)");
    assert_eq!(eval(&mut s, "EACH double [1, 2, 3]"), "2 4 6");
}

#[test]
fn closure_captures_the_enclosing_activation() {
    let mut s = session();
    eval(&mut s, "apply2 IS TR f OP x (f (f x))");
    // The opform passed to apply2 refers to the enclosing opform's local n;
    // its closure must capture the live activation.
    eval(&mut s, "addn IS OP n a (apply2 (OP b (b + n)) a)");
    assert_eq!(eval(&mut s, "addn [2, 5]"), "9");
    assert_eq!(eval(&mut s, "addn [10, 1]"), "21");
}

#[test]
fn closure_captures_each_call_independently() {
    let mut s = session();
    eval(&mut s, "apply2 IS TR f OP x (f (f x))");
    eval(&mut s, "scalen IS OP n a (apply2 (OP b (b * n)) a)");
    // Recursion through distinct activations: each call sees its own n.
    eval(&mut s, "nest IS OP n (IF n = 0 THEN 1 ELSE scalen [n, nest (n - 1)] ENDIF)");
    // nest 3 = 3*3 * (2*2 * (1*1 * 1))
    assert_eq!(eval(&mut s, "nest 3"), "36");
}

#[test]
fn transformer_binds_an_atlas_to_several_parameters() {
    let mut s = session();
    eval(&mut s, "dual IS TR f g OP a (g (f a))");
    assert_eq!(eval(&mut s, "dual [opposite, abs] 5"), "5");
    assert_eq!(eval(&mut s, "dual [abs, opposite] 5"), "-5");
    // A non-atlas argument of the wrong arity is the parameter fault.
    assert_eq!(eval(&mut s, "dual opposite 5"), "?tr_parameter");
}

#[test]
fn atlas_of_captured_operations_stays_an_atlas() {
    let mut s = session();
    eval(&mut s, "dual IS TR f g OP a (g (f a))");
    // The atlas components capture the local n, yet the transformer still
    // sees an atlas and can destructure it.
    eval(&mut s, "juggle IS OP n a (dual [OP x (x + n), OP x (x * n)] a)");
    // (a + n) * n with n = 3, a = 4 -> 21
    assert_eq!(eval(&mut s, "juggle [3, 4]"), "21");
}

#[test]
fn basic_and_global_operations_need_no_capture() {
    let mut s = session();
    eval(&mut s, "inc IS OP a (a + 1)");
    eval(&mut s, "applyit IS OP z (EACH inc z)");
    // A globally named operation passed through a transformer inside a local
    // scope works without capturing anything.
    assert_eq!(eval(&mut s, "applyit [1, 2]"), "2 3");
    assert_eq!(eval(&mut s, "EACH abs [-1, 2]"), "1 2");
}

#[test]
fn catch_rewinds_to_its_recovery_record() {
    let mut s = session();
    s.set_triggering(true);
    eval(&mut s, "risky IS OP x (throw 'oops'; 1)");
    assert_eq!(eval(&mut s, "CATCH risky 0"), "?oops");
    assert_eq!(s.operand_depth(), 0, "operand stack height restored");
    // Execution continues normally afterwards.
    assert_eq!(eval(&mut s, "1 + 1"), "2");
}

#[test]
fn triggered_fault_without_catch_reaches_top_level() {
    let mut s = session();
    s.set_triggering(true);
    let out = eval(&mut s, "deep IS OP x (second x)");
    assert_eq!(out, "");
    let report = eval(&mut s, "deep 5");
    assert!(report.starts_with("?address"), "triggered fault reported: {report}");
    assert_eq!(s.operand_depth(), 0);
    assert_eq!(eval(&mut s, "2 + 2"), "4");
}
