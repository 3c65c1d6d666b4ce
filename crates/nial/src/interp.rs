//! The interpreter state: one value owning every global of the engine.
//!
//! Heap, interning tables, symbol tables, parse-tree store, operand stack,
//! activation stack, call stack, current environment and the debug/trigger
//! flags all live here and are passed explicitly; nothing is static.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    arrays::{FlatArray, Shape},
    error::{RunError, RunResult},
    heap::{Heap, HeapStats},
    intern::{self, Interns, PhraseId},
    parse,
    parsetree::{Literal, Node, TreeStore},
    primops::{BasicOp, BasicTr},
    resource::HeapLimits,
    scan,
    symtab::{
        lookup_env, ActivationStack, EntryId, EntryValue, LookupPolicy, Role, SymtabId, Symtabs, GLOBAL_SYMTAB,
    },
    tracer::{EvalTracer, NoopTracer},
    value::Value,
};

/// The reserved words of the language, installed in the global symbol table
/// at startup; the scanner detects them by lookup.
pub(crate) const RESERVED_WORDS: &[&str] = &[
    "IS", ".", "(", ")", "[", "<<", "]", ">>", ";", "IF", "THEN", "ELSE", "GETS", ":=", "WHILE", "DO", "ENDWHILE",
    "REPEAT", "UNTIL", "ENDREPEAT", "FOR", "WITH", "ENDFOR", "CASE", "FROM", ":", "BEGIN", "END", "ENDCASE", "ENDIF",
    "VARIABLE", "EXPRESSION", "OP", "OPERATION", "TR", "TRANSFORMER", "EXTERNAL", "{", "}", ",", "LOCAL", "NONLOCAL",
    "!", "@", "|", "#", "EXIT", "ELSEIF",
];

/// Default bound on the operand stack; exceeding it is the recoverable
/// stack-overflow warning.
const OPERAND_STACK_LIMIT: usize = 1 << 16;

/// Bound on eval/apply recursion depth.
pub(crate) const CALL_DEPTH_LIMIT: usize = 2_000;

/// The engine: all interpreter state plus the evaluator entry points
/// implemented in `eval.rs`.
pub struct Interpreter {
    pub(crate) heap: Heap,
    pub(crate) interns: Interns,
    pub(crate) symtabs: Symtabs,
    pub(crate) trees: TreeStore,
    /// The operand stack shared by the evaluator and the primitives.
    pub(crate) stack: Vec<Value>,
    pub(crate) activation: ActivationStack,
    /// Current environment: local symbol tables, innermost first. The
    /// global table is implicit at the end.
    pub(crate) current_env: Vec<SymtabId>,
    /// Call stack of active named definitions, for fault reports.
    pub(crate) call_stack: Vec<(SymtabId, EntryId)>,
    /// Fault triggering flag: when set, creating a non-sentinel fault atom
    /// performs a non-local return to the nearest catch.
    pub(crate) triggered: bool,
    /// Set by `exit`; consumed by exactly one enclosing loop or sequence.
    pub(crate) exit_flag: bool,
    /// Current eval/apply recursion depth.
    pub(crate) depth: usize,
    interrupt: Arc<AtomicBool>,
    stack_limit: usize,
    pub(crate) tracer: Box<dyn EvalTracer>,
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("stack_depth", &self.stack.len())
            .field("env_depth", &self.current_env.len())
            .field("triggered", &self.triggered)
            .finish_non_exhaustive()
    }
}

impl Interpreter {
    /// Creates an interpreter with reserved words and the basic operation
    /// registry installed in the global symbol table.
    #[must_use]
    pub fn new(limits: HeapLimits) -> Self {
        let mut interns = Interns::new();
        let symtabs = Symtabs::new(&mut interns);
        let mut interp = Self {
            heap: Heap::new(limits),
            interns,
            symtabs,
            trees: TreeStore::new(),
            stack: Vec::new(),
            activation: ActivationStack::default(),
            current_env: Vec::new(),
            call_stack: Vec::new(),
            triggered: false,
            exit_flag: false,
            depth: 0,
            interrupt: Arc::new(AtomicBool::new(false)),
            stack_limit: OPERAND_STACK_LIMIT,
            tracer: Box::new(NoopTracer),
        };
        interp.install_reserved();
        interp.install_basics();
        interp
    }

    /// Installs a tracer, switching between the fast and debug evaluator
    /// flavors at runtime.
    pub fn set_tracer(&mut self, tracer: Box<dyn EvalTracer>) {
        self.tracer = tracer;
    }

    /// The shared interrupt flag; a host sets it to request cancellation,
    /// observed at the next `checksignal` point.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    fn install_reserved(&mut self) {
        for word in RESERVED_WORDS {
            let name = self.interns.phrase(word);
            self.symtabs
                .global_mut()
                .install(name, Role::Reserved, EntryValue::Empty, true, &self.interns);
        }
    }

    fn install_basics(&mut self) {
        for op in BasicOp::all() {
            let tree = self.trees.push(Node::BasicOp { op });
            let word = op.word_name().to_uppercase();
            let name = self.interns.phrase(&word);
            self.symtabs
                .global_mut()
                .install(name, Role::Optn, EntryValue::Tree(tree), true, &self.interns);
            if let Some(symbol) = op.symbol() {
                let alias = self.interns.phrase(symbol);
                self.symtabs
                    .global_mut()
                    .install(alias, Role::Optn, EntryValue::Tree(tree), true, &self.interns);
            }
        }
        for tr in BasicTr::all() {
            let tree = self.trees.push(Node::BasicTr { tr });
            let name = self.interns.phrase(tr.name());
            self.symtabs
                .global_mut()
                .install(name, Role::Trans, EntryValue::Tree(tree), true, &self.interns);
        }
    }

    // ---- operand stack --------------------------------------------------

    /// Pushes a value, taking ownership of its reference.
    pub(crate) fn push(&mut self, value: Value) -> RunResult<()> {
        if self.stack.len() >= self.stack_limit {
            value.drop_with_heap(&mut self.heap);
            return Err(RunError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pops the top value, transferring its reference to the caller.
    ///
    /// # Panics
    /// Panics when the stack is empty; callers maintain the stack protocol.
    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    /// Current operand stack depth, recorded by recovery records.
    #[must_use]
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Rewinds the operand stack and call stack to a recovery record,
    /// releasing every unwound value.
    pub(crate) fn unwind_to(&mut self, stack_height: usize, call_depth: usize) {
        while self.stack.len() > stack_height {
            let v = self.stack.pop().expect("unwind height checked");
            v.drop_with_heap(&mut self.heap);
        }
        self.call_stack.truncate(call_depth);
    }

    /// Full top-level recovery: empties the operand stack, the call stack
    /// and all activation records, and clears transient flags.
    pub(crate) fn recover_to_top(&mut self) {
        self.unwind_to(0, 0);
        self.activation.clear(&mut self.heap);
        for id in 0..u32::try_from(self.symtab_count()).expect("symtab count fits u32") {
            let sym = SymtabId::from_index(id);
            if sym != GLOBAL_SYMTAB {
                self.symtabs.get_mut(sym).current_sp = -1;
            }
        }
        self.current_env.clear();
        self.exit_flag = false;
        self.depth = 0;
        self.interrupt.store(false, Ordering::Relaxed);
    }

    fn symtab_count(&self) -> usize {
        // The arena has no public len; count via probe from the global table.
        self.symtabs.len()
    }

    // ---- faults ---------------------------------------------------------

    /// Creates a fault atom. With triggering on, creation of a non-sentinel
    /// fault performs a non-local return to the nearest catch instead.
    pub(crate) fn fault(&mut self, text: &str) -> RunResult<Value> {
        let id = self.interns.fault(text);
        if self.triggered && !intern::is_sentinel(id) {
            Err(RunError::Fault(id))
        } else {
            Ok(Value::Fault(id))
        }
    }

    // ---- signals --------------------------------------------------------

    /// Interrupt poll point; called at `apply` entry, sequence steps,
    /// formfinder steps and loop iterations.
    pub(crate) fn checksignal(&self) -> RunResult<()> {
        if self.interrupt.load(Ordering::Relaxed) {
            return Err(RunError::Interrupt);
        }
        Ok(())
    }

    // ---- variables ------------------------------------------------------

    /// Fetches a variable or named code object from its value cell: the
    /// symbol table for globals, the activation record for locals.
    pub(crate) fn fetch_var(&mut self, sym: SymtabId, entry: EntryId) -> RunResult<Value> {
        enum Cell {
            Fetched(Value),
            Local(i64, u32),
        }
        let cell = {
            let table = self.symtabs.get(sym);
            match &table.entry(entry).value {
                EntryValue::Array(v) => Cell::Fetched(v.clone_with_heap(&self.heap)),
                EntryValue::Tree(t) => Cell::Fetched(Value::Tree(*t)),
                EntryValue::Empty => Cell::Fetched(Value::Fault(intern::NO_VALUE)),
                EntryValue::Local(offset) => Cell::Local(table.current_sp, *offset),
            }
        };
        match cell {
            Cell::Fetched(v) => Ok(v),
            Cell::Local(-1, _) => self.fault("?variable out of context"),
            Cell::Local(sp, offset) => Ok(self.activation.fetch(sp, offset, &self.heap)),
        }
    }

    /// Stores a value into a name, taking ownership of one reference.
    /// The previous occupant is released after the new store. Returns false
    /// when a local's scope has no live activation.
    pub(crate) fn store_var(&mut self, sym: SymtabId, entry: EntryId, value: Value) -> bool {
        let local = {
            let table = self.symtabs.get(sym);
            match &table.entry(entry).value {
                EntryValue::Local(offset) => Some((table.current_sp, *offset)),
                _ => None,
            }
        };
        match local {
            Some((-1, _)) => {
                value.drop_with_heap(&mut self.heap);
                false
            }
            Some((sp, offset)) => {
                self.activation.store(sp, offset, value, &mut self.heap);
                true
            }
            None => {
                let old = std::mem::replace(
                    &mut self.symtabs.get_mut(sym).entry_mut(entry).value,
                    EntryValue::Array(value),
                );
                if let EntryValue::Array(v) = old {
                    v.drop_with_heap(&mut self.heap);
                }
                true
            }
        }
    }

    /// The `update`/`updateall`/`deepupdate` engine: looks up the named
    /// variable, runs the given placement and rebinds on identity change.
    pub(crate) fn update_variable(
        &mut self,
        name: PhraseId,
        addr: Value,
        x: Value,
        place_fn: fn(&mut Self, Value, Value, Value) -> RunResult<(Value, bool)>,
    ) -> RunResult<Value> {
        let upper = self.interns.phrase_text(name).to_uppercase();
        let name = self.interns.phrase(&upper);
        let Some((sym, entry)) = lookup_env(
            &self.symtabs,
            &self.current_env,
            LookupPolicy::Passive,
            name,
            &[],
            &self.interns,
        ) else {
            addr.drop_with_heap(&mut self.heap);
            x.drop_with_heap(&mut self.heap);
            return self.fault("?invalid name");
        };
        if self.symtabs.get(sym).entry(entry).role != Role::Var {
            addr.drop_with_heap(&mut self.heap);
            x.drop_with_heap(&mut self.heap);
            return self.fault("?not a variable");
        }
        let target = self.fetch_var(sym, entry)?;
        let (result, changed) = place_fn(self, target, addr, x)?;
        if matches!(result, Value::Fault(_)) {
            return Ok(result);
        }
        if changed {
            let stored = result.clone_with_heap(&self.heap);
            self.store_var(sym, entry, stored);
        }
        Ok(result)
    }

    // ---- literals -------------------------------------------------------

    /// Materializes a parse-time literal as a runtime value.
    pub(crate) fn literal_value(&mut self, literal: &Literal) -> RunResult<Value> {
        match literal {
            Literal::Bool(b) => Ok(Value::Bool(*b)),
            Literal::Int(n) => Ok(Value::Int(*n)),
            Literal::Real(r) => Ok(Value::Real(*r)),
            Literal::Char(c) => Ok(Value::Char(*c)),
            Literal::Phrase(p) => Ok(Value::Phrase(*p)),
            Literal::Fault(f) => Ok(Value::Fault(*f)),
            Literal::Bits(bits) => {
                let shape = Shape::from_slice(&[bits.len()]);
                let id = self
                    .heap
                    .allocate(crate::arrays::ArrayData::Bools(FlatArray::new(shape, bits.clone())))?;
                Ok(Value::Ref(id))
            }
            Literal::Str(text) => crate::arrays::make_string(&mut self.heap, text),
        }
    }

    // ---- embedded execution --------------------------------------------

    /// Scans, parses and evaluates source text, returning its value.
    /// Used by the `execute` primitive; parse and scan failures come back
    /// as fault values, not errors.
    pub(crate) fn execute_text(&mut self, text: &str) -> RunResult<Value> {
        let stream = match scan::scan_lines(std::iter::once(text), &self.symtabs, &self.interns) {
            Ok(stream) => stream,
            Err(scan_error) => {
                let id = self.interns.fault(&scan_error.message);
                return Ok(Value::Fault(id));
            }
        };
        let tree = match parse::parse(self, &stream, true) {
            Ok(tree) => tree,
            Err(parse_error) => {
                let id = self.interns.fault(&parse_error.message);
                return Ok(Value::Fault(id));
            }
        };
        self.eval(tree)?;
        Ok(self.pop())
    }

    // ---- diagnostics ----------------------------------------------------

    /// Snapshot of heap state, for tests and the session.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Convenience constructor for a list of integer atoms, used by tests.
    #[cfg(test)]
    pub(crate) fn int_list(&mut self, ints: &[i64]) -> Value {
        let items: Vec<Value> = ints.iter().map(|&n| Value::Int(n)).collect();
        crate::arrays::make_array(&mut self.heap, Shape::from_slice(&[ints.len()]), items).expect("test allocation")
    }
}
