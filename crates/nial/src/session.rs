//! The persistent top-level session.
//!
//! A `Session` keeps interpreter state across `execute()` calls so
//! definitions and variables persist between inputs. Every prompt resets the
//! single top-level recovery record: faults, interrupts and warnings unwind
//! here, the operand stack returns to its pre-prompt height, and the session
//! continues.
//!
//! Line prefixes: `#` remark (ignored), `!` host command (passed to the
//! operating system), `]name` binds the previous result value to `name`.

use std::{fs, path::Path, process::Command};

use serde::{Deserialize, Serialize};

use crate::{
    deparse::{deparse_to_text, DESCAN_WIDTH},
    error::RunError,
    heap::Heap,
    intern::{Interns, NOEXPR},
    interp::Interpreter,
    io::PrintWriter,
    parse,
    parsetree::{Node, TreeStore},
    resource::HeapLimits,
    scan,
    symtab::{EntryValue, Role, Symtabs, GLOBAL_SYMTAB},
    value::{format_value, Value},
};

/// Maximum call-stack depth shown in a fault report.
const FAULT_STACK_DEPTH: usize = 10;

/// What the host should do after an input was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopRequest {
    /// Continue reading input.
    None,
    /// Save the workspace to the named `.nws` file.
    SaveWs(String),
    /// Load the workspace from the named `.nws` file.
    LoadWs(String),
}

/// Outcome of executing one top-level input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The input was handled; keep going (possibly with a request).
    Continue(TopRequest),
    /// Clean exit was requested.
    Bye,
    /// An internal invariant was violated; the host should exit non-zero.
    Fatal(String),
}

/// Serialized form of a workspace snapshot (`.nws`).
#[derive(Serialize)]
struct WorkspaceImageRef<'a> {
    heap: &'a Heap,
    interns: &'a Interns,
    symtabs: &'a Symtabs,
    trees: &'a TreeStore,
    triggered: bool,
}

#[derive(Deserialize)]
struct WorkspaceImage {
    heap: Heap,
    interns: Interns,
    symtabs: Symtabs,
    trees: TreeStore,
    triggered: bool,
}

/// A persistent interactive session.
pub struct Session {
    interp: Interpreter,
    last_value: Option<Value>,
}

impl Session {
    /// Creates a session with a fresh interpreter.
    #[must_use]
    pub fn new(limits: HeapLimits) -> Self {
        Self {
            interp: Interpreter::new(limits),
            last_value: None,
        }
    }

    /// Access to the engine, for embedding hosts.
    pub fn interpreter_mut(&mut self) -> &mut Interpreter {
        &mut self.interp
    }

    /// Turns fault triggering on or off (interactive sessions run with it
    /// on). Returns the previous setting.
    pub fn set_triggering(&mut self, on: bool) -> bool {
        std::mem::replace(&mut self.interp.triggered, on)
    }

    /// Executes one top-level input line.
    pub fn execute(&mut self, line: &str, out: &mut impl PrintWriter) -> SessionOutcome {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return SessionOutcome::Continue(TopRequest::None);
        }
        if let Some(command) = trimmed.strip_prefix('!') {
            return self.host_command(command, out);
        }
        if let Some(name) = trimmed.strip_prefix(']') {
            return self.bind_last_value(name.trim(), out);
        }
        if trimmed.eq_ignore_ascii_case("bye") {
            return SessionOutcome::Bye;
        }
        self.execute_unit(&[line], out)
    }

    /// Executes one unit of source, possibly spanning several lines.
    pub fn execute_unit(&mut self, lines: &[&str], out: &mut impl PrintWriter) -> SessionOutcome {
        let pre_depth = self.interp.stack_depth();

        let stream = match scan::scan_lines(lines.iter().copied(), &self.interp.symtabs, &self.interp.interns) {
            Ok(stream) => stream,
            Err(scan_error) => {
                out.write_line(&scan_error.message);
                return SessionOutcome::Continue(TopRequest::None);
            }
        };
        if stream.is_empty() {
            return SessionOutcome::Continue(TopRequest::None);
        }
        let tree = match parse::parse(&mut self.interp, &stream, false) {
            Ok(tree) => tree,
            Err(parse_error) => {
                out.write_line(&parse_error.message);
                return SessionOutcome::Continue(TopRequest::None);
            }
        };

        // A bare operation or transformer form has no value; show its
        // canonical text instead of evaluating it.
        if matches!(
            self.interp.trees.node(tree),
            Node::Opform { .. } | Node::Trform { .. } | Node::Atlas { .. } | Node::Composition { .. }
        ) {
            out.write_line(&deparse_to_text(&self.interp, tree, DESCAN_WIDTH));
            return SessionOutcome::Continue(TopRequest::None);
        }

        match self.interp.eval(tree) {
            Ok(()) => {
                let value = self.interp.pop();
                debug_assert_eq!(
                    self.interp.stack_depth(),
                    pre_depth,
                    "operand stack must return to its pre-prompt height"
                );
                if !matches!(value, Value::Fault(NOEXPR)) {
                    out.write_line(&format_value(&value, &self.interp.heap, &self.interp.interns));
                }
                if let Some(previous) = self.last_value.take() {
                    previous.drop_with_heap(&mut self.interp.heap);
                }
                self.last_value = Some(value);
                SessionOutcome::Continue(TopRequest::None)
            }
            Err(err) => self.recover(err, out),
        }
    }

    /// The single top-level recovery record: report, rewind, continue.
    fn recover(&mut self, err: RunError, out: &mut impl PrintWriter) -> SessionOutcome {
        let outcome = match err {
            RunError::Fault(id) => {
                let text = self.interp.interns.fault_text(id).to_owned();
                out.write_line(&text);
                for &(sym, entry) in self.interp.call_stack.iter().rev().take(FAULT_STACK_DEPTH) {
                    let name = self.interp.interns.phrase_text(self.interp.symtabs.get(sym).entry(entry).name);
                    out.write_line(&format!("   in {name}"));
                }
                SessionOutcome::Continue(TopRequest::None)
            }
            RunError::Interrupt => {
                out.write_line("interrupted");
                SessionOutcome::Continue(TopRequest::None)
            }
            RunError::StackOverflow => {
                out.write_line("?stack overflow");
                SessionOutcome::Continue(TopRequest::None)
            }
            RunError::HeapExhausted => {
                out.write_line("?heap exhausted");
                SessionOutcome::Continue(TopRequest::None)
            }
            RunError::WsSave(name) => SessionOutcome::Continue(TopRequest::SaveWs(name)),
            RunError::WsLoad(name) => SessionOutcome::Continue(TopRequest::LoadWs(name)),
            RunError::Bye => SessionOutcome::Bye,
            RunError::Fatal(message) => SessionOutcome::Fatal(message),
        };
        self.interp.recover_to_top();
        outcome
    }

    fn host_command(&mut self, command: &str, out: &mut impl PrintWriter) -> SessionOutcome {
        match Command::new("sh").arg("-c").arg(command).output() {
            Ok(output) => {
                for line in String::from_utf8_lossy(&output.stdout).lines() {
                    out.write_line(line);
                }
                for line in String::from_utf8_lossy(&output.stderr).lines() {
                    out.write_line(line);
                }
            }
            Err(err) => out.write_line(&format!("host command failed: {err}")),
        }
        SessionOutcome::Continue(TopRequest::None)
    }

    /// `]name`: binds the previous result value to a global variable.
    fn bind_last_value(&mut self, name: &str, out: &mut impl PrintWriter) -> SessionOutcome {
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            out.write_line("?invalid name");
            return SessionOutcome::Continue(TopRequest::None);
        }
        let Some(value) = self.last_value.as_ref() else {
            out.write_line("?no value to name");
            return SessionOutcome::Continue(TopRequest::None);
        };
        let value = value.clone_with_heap(&self.interp.heap);
        let phrase = self.interp.interns.phrase(&name.to_uppercase());
        let entry = self.interp.symtabs.get_mut(GLOBAL_SYMTAB).install(
            phrase,
            Role::Var,
            EntryValue::Empty,
            false,
            &self.interp.interns,
        );
        let info = self.interp.symtabs.get_mut(GLOBAL_SYMTAB).entry_mut(entry);
        if info.system {
            out.write_line("?name already defined");
            value.drop_with_heap(&mut self.interp.heap);
            return SessionOutcome::Continue(TopRequest::None);
        }
        info.role = Role::Var;
        self.interp.store_var(GLOBAL_SYMTAB, entry, value);
        SessionOutcome::Continue(TopRequest::None)
    }

    /// Reads a `.ndf` definition script and silently executes it: units are
    /// separated by blank lines, each unit may span several lines. Values
    /// are suppressed; fault and error reports are forwarded to `out`.
    pub fn loaddefs(&mut self, path: &Path, out: &mut impl PrintWriter) -> Result<(), String> {
        let source = fs::read_to_string(path).map_err(|err| format!("cannot read {}: {err}", path.display()))?;
        let mut unit: Vec<&str> = Vec::new();
        for line in source.lines() {
            if line.trim().is_empty() {
                if !unit.is_empty() {
                    self.execute_script_unit(&unit, out)?;
                    unit.clear();
                }
            } else if line.trim_start().starts_with('#') {
                // remark lines are ignored inside scripts too
            } else {
                unit.push(line);
            }
        }
        if !unit.is_empty() {
            self.execute_script_unit(&unit, out)?;
        }
        Ok(())
    }

    fn execute_script_unit(&mut self, unit: &[&str], out: &mut impl PrintWriter) -> Result<(), String> {
        let mut captured = crate::io::CollectStringPrint::new();
        let outcome = self.execute_unit(unit, &mut captured);
        for line in captured.output().lines() {
            if line.starts_with('?') {
                out.write_line(line);
            }
        }
        match outcome {
            SessionOutcome::Fatal(message) => Err(message),
            _ => Ok(()),
        }
    }

    /// Saves the workspace as an opaque binary snapshot.
    pub fn save_workspace(&self, path: &Path) -> Result<(), String> {
        let image = WorkspaceImageRef {
            heap: &self.interp.heap,
            interns: &self.interp.interns,
            symtabs: &self.interp.symtabs,
            trees: &self.interp.trees,
            triggered: self.interp.triggered,
        };
        let bytes = postcard::to_allocvec(&image).map_err(|err| format!("snapshot failed: {err}"))?;
        fs::write(path, bytes).map_err(|err| format!("cannot write {}: {err}", path.display()))
    }

    /// Replaces the workspace from a binary snapshot.
    pub fn load_workspace(&mut self, path: &Path) -> Result<(), String> {
        let bytes = fs::read(path).map_err(|err| format!("cannot read {}: {err}", path.display()))?;
        let image: WorkspaceImage =
            postcard::from_bytes(&bytes).map_err(|err| format!("snapshot corrupt: {err}"))?;
        // The previous heap is discarded wholesale, so the cached result
        // value must not be released against the new one.
        if let Some(previous) = self.last_value.take() {
            previous.drop_with_heap(&mut self.interp.heap);
        }
        self.interp.recover_to_top();
        self.interp.heap = image.heap;
        self.interp.interns = image.interns;
        self.interp.symtabs = image.symtabs;
        self.interp.trees = image.trees;
        self.interp.triggered = image.triggered;
        Ok(())
    }

    /// Current operand-stack depth; zero between prompts.
    #[must_use]
    pub fn operand_depth(&self) -> usize {
        self.interp.stack_depth()
    }

    /// Heap statistics, for invariant checks and diagnostics.
    #[must_use]
    pub fn heap_stats(&self) -> crate::heap::HeapStats {
        self.interp.heap_stats()
    }
}
