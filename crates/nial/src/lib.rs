//! An interactive array-language interpreter core.
//!
//! Every value in the language is an *array* with a kind, a valence (rank)
//! and a shape. Three semantic categories exist at the language level:
//! arrays (first-class data), operations (functions over arrays) and
//! transformers (higher-order functions from operations to operations).
//!
//! The crate is organised as a classic interpreter pipeline:
//! raw text -> [`scan`] tokens -> [`parse`] parse tree -> [`eval`] values,
//! with the refcounted [`heap`] underneath everything, [`symtab`] consulted
//! by parser and evaluator, and [`deparse`] as the display-side inverse of
//! scanning and parsing. [`session`] ties the pieces into a persistent
//! top-level loop with per-prompt recovery.
//!
//! All interpreter state (heap, interning tables, symbol tables, operand
//! stack, debug flags) lives in a single [`interp::Interpreter`] value;
//! nothing is kept in statics.
#![expect(dead_code, reason = "hook surfaces keep some currently-unused APIs")]

mod arrays;
mod deparse;
mod error;
mod eval;
mod heap;
mod insel;
mod intern;
mod interp;
mod io;
mod parse;
mod parsetree;
mod primops;
mod resource;
mod scan;
mod session;
mod symtab;
mod token;
mod tracer;
mod value;

pub use crate::{
    error::{RunError, RunResult},
    heap::HeapStats,
    interp::Interpreter,
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    resource::{parse_size, HeapLimits},
    session::{Session, SessionOutcome, TopRequest},
    tracer::{EvalTracer, NoopTracer, StderrTracer},
};
