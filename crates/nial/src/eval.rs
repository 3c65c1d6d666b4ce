//! The tree-walking evaluator: `eval`, `apply` and `apply_transform`.
//!
//! The three entry points are mutually recursive and communicate through the
//! operand stack: `eval` leaves one value on top, `apply` consumes the top
//! (the argument) and leaves the result, `apply_transform` consumes the
//! top-of-stack operation and the array below it.
//!
//! Interrupts are polled at `apply` entry, at each expression-sequence step
//! and at each loop iteration. `exit` sets a flag consumed by exactly one
//! enclosing loop or sequence. Activation records opened here are closed on
//! every path, including error unwinding, so catch/throw always observes
//! consistent stack pointers.

use crate::{
    arrays::{make_array, Closure, OpList, OpListKind, Shape},
    error::{RunError, RunResult},
    insel,
    intern::{self, NOEXPR},
    interp::{Interpreter, CALL_DEPTH_LIMIT},
    parsetree::{Literal, Node, TreeId},
    primops::{self, item_of},
    symtab::{EntryId, Role, SymtabId, GLOBAL_SYMTAB},
    value::{values_equal, Value},
};

/// Short tag name of a node, for the tracer.
fn tag_name(node: &Node) -> &'static str {
    match node {
        Node::Nulltree => "nulltree",
        Node::Constant { .. } => "constant",
        Node::Variable { .. } => "variable",
        Node::Expression { .. } => "expression",
        Node::Identifier { .. } => "identifier",
        Node::BasicOp { .. } => "basic",
        Node::BasicTr { .. } => "basic-tr",
        Node::Opcall { .. } => "opcall",
        Node::BasicBinop { .. } => "basic-binopcall",
        Node::Curried { .. } => "curried",
        Node::Vcurried { .. } => "vcurried",
        Node::Composition { .. } => "composition",
        Node::Atlas { .. } => "atlas",
        Node::Strand { .. } => "strand",
        Node::List { .. } => "list",
        Node::ExprSeq { .. } => "exprseq",
        Node::DefnSeq { .. } => "defnseq",
        Node::Action { .. } => "action",
        Node::Definition { .. } => "definition",
        Node::ExtDeclaration { .. } => "ext-declaration",
        Node::AssignExpr { .. } => "assignexpr",
        Node::IfExpr { .. } => "ifexpr",
        Node::WhileExpr { .. } => "whileexpr",
        Node::RepeatExpr { .. } => "repeatexpr",
        Node::ForExpr { .. } => "forexpr",
        Node::CaseExpr { .. } => "caseexpr",
        Node::ExitExpr { .. } => "exitexpr",
        Node::Block { .. } => "block",
        Node::BlockBody { .. } => "blockbody",
        Node::Opform { .. } => "opform",
        Node::Trform { .. } => "trform",
        Node::Transform { .. } => "transform",
        Node::Idlist { .. } => "idlist",
        Node::CommentExpr { .. } => "commentexpr",
        Node::Parendobj { .. } => "parendobj",
        Node::Dottedobj { .. } => "dottedobj",
        Node::ScopedVar { .. } => "scoped-var",
        Node::IndexedAssign { .. } => "indexedassign",
        Node::PickPlace { .. } => "pickplace",
        Node::ReachPut { .. } => "reachput",
        Node::SliceSel { .. } => "slice",
        Node::ChooseSel { .. } => "choose",
        Node::Cast { .. } => "parsetree",
    }
}

impl Interpreter {
    /// Evaluates an array-yielding expression, leaving one value on the
    /// operand stack.
    pub(crate) fn eval(&mut self, tree: TreeId) -> RunResult<()> {
        self.enter_depth()?;
        let result = self.eval_inner(tree);
        self.depth -= 1;
        result
    }

    fn enter_depth(&mut self) -> RunResult<()> {
        self.depth += 1;
        if self.depth > CALL_DEPTH_LIMIT {
            self.depth -= 1;
            return Err(RunError::StackOverflow);
        }
        Ok(())
    }

    fn eval_inner(&mut self, tree: TreeId) -> RunResult<()> {
        let node = self.trees.node(tree);
        self.tracer.on_eval(tag_name(&node));
        match node {
            Node::Nulltree => self.push(Value::Fault(NOEXPR)),
            Node::Cast { tree } => self.push(Value::Tree(tree)),
            Node::Constant { value, .. } => {
                let v = self.constant_value(&value, true)?;
                self.push(v)
            }
            Node::Variable { sym, entry } => {
                let v = self.fetch_var(sym, entry)?;
                self.push(v)
            }
            Node::Expression { sym, entry } => {
                let body = self.fetch_var(sym, entry)?;
                match body {
                    Value::Tree(t) => {
                        let named = self.enter_named(sym, entry);
                        let result = self.eval(t);
                        // The call stack survives unwinding so fault reports
                        // can show it; top-level recovery clears it.
                        if result.is_ok() {
                            self.exit_named(named);
                        }
                        result
                    }
                    other => self.push(other),
                }
            }
            Node::BasicBinop { op, left, right } => {
                self.eval(left)?;
                self.eval(right)?;
                primops::apply_basic_binary(self, op)
            }
            Node::Opcall { op, arg } => {
                match self.trees.node(op) {
                    Node::BasicOp { op: basic } => {
                        self.eval(arg)?;
                        primops::apply_basic(self, basic)
                    }
                    Node::Curried { op: inner, arg: curried_arg } => {
                        // The curried left argument evaluates before the
                        // opcall argument.
                        self.eval(curried_arg)?;
                        self.eval(arg)?;
                        let right = self.pop();
                        let left = self.pop();
                        let pair = make_array(&mut self.heap, Shape::from_slice(&[2]), vec![left, right])?;
                        self.push(pair)?;
                        self.apply(Value::Tree(inner))
                    }
                    _ => {
                        self.eval(arg)?;
                        self.apply(Value::Tree(op))
                    }
                }
            }
            Node::Strand { items } | Node::List { items } => {
                if items.is_empty() {
                    let empty = crate::arrays::empty_list(&mut self.heap)?;
                    return self.push(empty);
                }
                for &item in &items {
                    self.eval(item)?;
                }
                let mut collected: Vec<Value> = (0..items.len()).map(|_| self.pop()).collect();
                collected.reverse();
                let list = make_array(&mut self.heap, Shape::from_slice(&[items.len()]), collected)?;
                self.push(list)
            }
            Node::ExprSeq { items } | Node::DefnSeq { items } => {
                if items.len() == 1 {
                    return self.eval(items[0]);
                }
                self.push(Value::Fault(NOEXPR))?;
                for &item in &items {
                    if self.exit_flag {
                        break;
                    }
                    let prev = self.pop();
                    prev.drop_with_heap(&mut self.heap);
                    self.eval(item)?;
                    self.checksignal()?;
                }
                Ok(())
            }
            Node::Action { defs, exprs } => {
                self.eval(defs)?;
                let discarded = self.pop();
                discarded.drop_with_heap(&mut self.heap);
                self.eval(exprs)
            }
            Node::Definition { idlist, value, .. } => {
                self.assign(idlist, Value::Tree(value), false, false)?;
                self.push(Value::Fault(NOEXPR))
            }
            Node::ExtDeclaration { .. } | Node::CommentExpr { .. } => self.push(Value::Fault(NOEXPR)),
            Node::AssignExpr { idlist, expr } => {
                self.eval(expr)?;
                let val = self.pop();
                if self.assign(idlist, val, false, true)? {
                    Ok(())
                } else {
                    let fault = self.fault("?assignment")?;
                    self.push(fault)
                }
            }
            Node::IfExpr { arms, else_expr } => {
                for (test, body) in arms {
                    self.eval(test)?;
                    let tval = self.pop();
                    match tval.as_bool() {
                        Some(true) => {
                            return self.eval(body);
                        }
                        Some(false) => {}
                        None => {
                            tval.drop_with_heap(&mut self.heap);
                            return self.push(Value::Fault(intern::LOGICAL));
                        }
                    }
                }
                match else_expr {
                    Some(body) => self.eval(body),
                    None => self.push(Value::Fault(NOEXPR)),
                }
            }
            Node::WhileExpr { test, body } => {
                self.exit_flag = false;
                self.push(Value::Fault(NOEXPR))?;
                loop {
                    self.eval(test)?;
                    let tval = self.pop();
                    match tval.as_bool() {
                        Some(true) => {}
                        Some(false) => break,
                        None => {
                            tval.drop_with_heap(&mut self.heap);
                            let prev = self.pop();
                            prev.drop_with_heap(&mut self.heap);
                            return self.push(Value::Fault(intern::LOGICAL));
                        }
                    }
                    let prev = self.pop();
                    prev.drop_with_heap(&mut self.heap);
                    self.eval(body)?;
                    if self.exit_flag {
                        self.exit_flag = false;
                        break;
                    }
                    self.checksignal()?;
                }
                Ok(())
            }
            Node::RepeatExpr { body, test } => {
                self.exit_flag = false;
                self.push(Value::Fault(NOEXPR))?;
                loop {
                    let prev = self.pop();
                    prev.drop_with_heap(&mut self.heap);
                    self.eval(body)?;
                    if self.exit_flag {
                        self.exit_flag = false;
                        break;
                    }
                    self.eval(test)?;
                    let tval = self.pop();
                    match tval.as_bool() {
                        Some(true) => break,
                        Some(false) => {}
                        None => {
                            tval.drop_with_heap(&mut self.heap);
                            let prev = self.pop();
                            prev.drop_with_heap(&mut self.heap);
                            return self.push(Value::Fault(intern::LOGICAL));
                        }
                    }
                    self.checksignal()?;
                }
                Ok(())
            }
            Node::ForExpr { idlist, iter, body } => {
                self.exit_flag = false;
                self.eval(iter)?;
                let ival = self.pop();
                let count = ival.tally(&self.heap);
                self.push(Value::Fault(NOEXPR))?;
                for i in 0..count {
                    let prev = self.pop();
                    prev.drop_with_heap(&mut self.heap);
                    let item = item_of(&self.heap, &ival, i);
                    self.assign(idlist, item, false, false)?;
                    if let Err(err) = self.eval(body) {
                        ival.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                    if self.exit_flag {
                        break;
                    }
                    if let Err(err) = self.checksignal() {
                        ival.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                }
                self.exit_flag = false;
                ival.drop_with_heap(&mut self.heap);
                Ok(())
            }
            Node::CaseExpr {
                selector,
                values,
                bodies,
                ..
            } => {
                self.eval(selector)?;
                let selected = self.pop();
                let mut index = values.len();
                for (i, literal) in values.iter().enumerate() {
                    let candidate = self.literal_value(literal)?;
                    let matched = values_equal(&candidate, &selected, &self.heap);
                    candidate.drop_with_heap(&mut self.heap);
                    if matched {
                        index = i;
                        break;
                    }
                }
                selected.drop_with_heap(&mut self.heap);
                self.eval(bodies[index])
            }
            Node::ExitExpr { expr } => {
                self.exit_flag = true;
                self.eval(expr)
            }
            Node::Block { sym, env, nvars, body } => {
                let Node::BlockBody { defs, seq, .. } = self.trees.node(body) else {
                    return Err(RunError::Fatal("block body node expected".into()));
                };
                let save_env = std::mem::replace(&mut self.current_env, env);
                self.activation.prologue(self.symtabs.get_mut(sym), nvars as usize);
                let result = (|| -> RunResult<()> {
                    if let Some(defs) = defs {
                        self.eval(defs)?;
                        let discarded = self.pop();
                        discarded.drop_with_heap(&mut self.heap);
                    }
                    self.eval(seq)
                })();
                self.close_activation(sym, save_env, result)
            }
            Node::ScopedVar { fun, var } => self.eval_scoped_var(fun, var),
            Node::PickPlace { var, index } => insel::eval_select(self, insel::Selection::Pick, var, index),
            Node::ReachPut { var, index } => insel::eval_select(self, insel::Selection::Reach, var, index),
            Node::SliceSel { var, index } => insel::eval_select(self, insel::Selection::Slice, var, index),
            Node::ChooseSel { var, index } => insel::eval_select(self, insel::Selection::Choose, var, index),
            Node::IndexedAssign { target, expr } => insel::eval_insert(self, target, expr),
            Node::Parendobj { expr } => {
                // Triggering of constants directly inside parentheses is
                // suppressed. The parser wraps a lone expression in a
                // one-item sequence, so look through that wrapper.
                let mut inner = expr;
                if let Node::ExprSeq { items } = self.trees.node(inner) {
                    if items.len() == 1 {
                        inner = items[0];
                    }
                }
                if let Node::Constant { value, .. } = self.trees.node(inner) {
                    let v = self.constant_value(&value, false)?;
                    return self.push(v);
                }
                self.eval(expr)
            }
            Node::Dottedobj { expr } => self.eval(expr),
            _ => {
                let fault = self.fault("?invalid case in eval")?;
                self.push(fault)
            }
        }
    }

    /// Evaluates a constant node. With `trigger` set and triggering enabled,
    /// a non-sentinel fault constant performs a non-local return.
    fn constant_value(&mut self, literal: &Literal, trigger: bool) -> RunResult<Value> {
        let v = self.literal_value(literal)?;
        if trigger && self.triggered {
            if let Value::Fault(f) = v {
                if !intern::is_sentinel(f) {
                    return Err(RunError::Fault(f));
                }
            }
        }
        Ok(v)
    }

    /// `fn:var`: locates a local of a currently active call of `fn`.
    fn eval_scoped_var(&mut self, fun: TreeId, var: crate::intern::PhraseId) -> RunResult<()> {
        let Node::Variable { sym, entry } = self.trees.node(fun) else {
            let fault = self.fault("?no_scope")?;
            return self.push(fault);
        };
        let body = self.fetch_var(sym, entry)?;
        let body_tree = match body {
            Value::Tree(t) => t,
            other => {
                other.drop_with_heap(&mut self.heap);
                let fault = self.fault("?no_scope")?;
                return self.push(fault);
            }
        };
        let local_sym = match self.trees.node(body_tree) {
            Node::Opform { sym, .. } | Node::Block { sym, .. } => sym,
            Node::Trform { sym: Some(sym), .. } => sym,
            _ => {
                let fault = self.fault("?no_scope")?;
                return self.push(fault);
            }
        };
        let sp = self.symtabs.get(local_sym).current_sp;
        if sp == -1 {
            let name = {
                let entry = self.symtabs.get(sym).entry(entry);
                self.interns.phrase_text(entry.name).to_owned()
            };
            let fault = self.fault(&format!("?{name} is not active"))?;
            return self.push(fault);
        }
        let upper = self.interns.phrase_text(var).to_uppercase();
        let var_name = self.interns.phrase(&upper);
        let table = self.symtabs.get(local_sym);
        match table.lookup(var_name, &self.interns) {
            Some(var_entry) => {
                let entry = table.entry(var_entry);
                if entry.role == Role::Var {
                    if let crate::symtab::EntryValue::Local(offset) = entry.value {
                        let v = self.activation.fetch(sp, offset, &self.heap);
                        return self.push(v);
                    }
                }
                let text = self.interns.phrase_text(var_name).to_owned();
                let fault = self.fault(&format!("?{text} not a variable"))?;
                self.push(fault)
            }
            None => {
                let text = self.interns.phrase_text(var_name).to_owned();
                let fault = self.fault(&format!("?{text} is not accessible"))?;
                self.push(fault)
            }
        }
    }

    /// Applies an operation value to the argument on top of the stack.
    pub(crate) fn apply(&mut self, op: Value) -> RunResult<()> {
        if let Err(err) = self.checksignal() {
            op.drop_with_heap(&mut self.heap);
            return Err(err);
        }
        match op {
            Value::Tree(id) => self.apply_tree(id),
            Value::Ref(id) => {
                enum OpClass {
                    Closure,
                    OpList,
                    Other,
                }
                let class = match self.heap.get(id) {
                    crate::arrays::ArrayData::Closure(_) => OpClass::Closure,
                    crate::arrays::ArrayData::OpList(_) => OpClass::OpList,
                    _ => OpClass::Other,
                };
                let result = match class {
                    OpClass::Closure => self.apply_closure(id),
                    OpClass::OpList => self.apply_oplist(id),
                    OpClass::Other => {
                        let arg = self.pop();
                        arg.drop_with_heap(&mut self.heap);
                        let fault = self.fault("?invalid case in apply")?;
                        self.push(fault)
                    }
                };
                self.heap.dec_ref(id);
                result
            }
            other => {
                other.drop_with_heap(&mut self.heap);
                let arg = self.pop();
                arg.drop_with_heap(&mut self.heap);
                let fault = self.fault("?invalid case in apply")?;
                self.push(fault)
            }
        }
    }

    fn apply_tree(&mut self, op: TreeId) -> RunResult<()> {
        self.enter_depth()?;
        let result = self.apply_tree_inner(op);
        self.depth -= 1;
        result
    }

    fn apply_tree_inner(&mut self, op: TreeId) -> RunResult<()> {
        let node = self.trees.node(op);
        self.tracer.on_apply(tag_name(&node));
        match node {
            Node::Variable { sym, entry } => {
                let code = self.fetch_var(sym, entry)?;
                let named = self.enter_named(sym, entry);
                let result = self.apply(code);
                if result.is_ok() {
                    self.exit_named(named);
                }
                result
            }
            Node::BasicOp { op } => primops::apply_basic(self, op),
            Node::Opform {
                sym,
                env,
                nvars,
                args,
                body,
            } => self.apply_opform(sym, env, nvars, args, body),
            Node::Composition { items } => {
                for &item in items.iter().rev() {
                    self.apply(Value::Tree(item))?;
                }
                Ok(())
            }
            Node::Atlas { items } => {
                let arg = self.pop();
                let mut results: Vec<Value> = Vec::with_capacity(items.len());
                for &item in &items {
                    let dup = arg.clone_with_heap(&self.heap);
                    if let Err(err) = self.push(dup).and_then(|()| self.apply(Value::Tree(item))) {
                        arg.drop_with_heap(&mut self.heap);
                        for r in results {
                            r.drop_with_heap(&mut self.heap);
                        }
                        return Err(err);
                    }
                    results.push(self.pop());
                }
                arg.drop_with_heap(&mut self.heap);
                let len = results.len();
                let list = make_array(&mut self.heap, Shape::from_slice(&[len]), results)?;
                self.push(list)
            }
            Node::Curried { op: inner, arg } => {
                self.eval(arg)?;
                let left = self.pop();
                let right = self.pop();
                let pair = make_array(&mut self.heap, Shape::from_slice(&[2]), vec![left, right])?;
                self.push(pair)?;
                self.apply(Value::Tree(inner))
            }
            Node::Vcurried { op: inner, value } => {
                let left = self.literal_value(&value)?;
                let right = self.pop();
                let pair = make_array(&mut self.heap, Shape::from_slice(&[2]), vec![left, right])?;
                self.push(pair)?;
                self.apply(Value::Tree(inner))
            }
            Node::Transform { tr, op } => {
                let coerced = self.coerce_op(Value::Tree(op))?;
                let (closed, _changed) = self.close_op(coerced)?;
                self.push(closed)?;
                self.apply_transform(Value::Tree(tr))
            }
            Node::Parendobj { expr } | Node::Dottedobj { expr } => self.apply_tree(expr),
            _ => {
                let arg = self.pop();
                arg.drop_with_heap(&mut self.heap);
                let fault = self.fault("?invalid case in apply")?;
                self.push(fault)
            }
        }
    }

    fn apply_opform(
        &mut self,
        sym: SymtabId,
        env: Vec<SymtabId>,
        nvars: u32,
        args: TreeId,
        body: TreeId,
    ) -> RunResult<()> {
        let val = self.pop();
        let save_env = std::mem::replace(&mut self.current_env, env);
        self.activation.prologue(self.symtabs.get_mut(sym), nvars as usize);
        let result = (|| -> RunResult<()> {
            let (body_expr, defs) = match self.trees.node(body) {
                Node::BlockBody { defs, seq, .. } => (seq, defs),
                _ => (body, None),
            };
            if let Some(defs) = defs {
                self.eval(defs)?;
                let discarded = self.pop();
                discarded.drop_with_heap(&mut self.heap);
            }
            if self.assign(args, val, false, false)? {
                self.eval(body_expr)
            } else {
                let fault = self.fault("?op_parameter")?;
                self.push(fault)
            }
        })();
        self.close_activation(sym, save_env, result)
    }

    /// Shared epilogue: restores the environment and closes the activation
    /// record whether the body succeeded or unwound.
    fn close_activation(&mut self, sym: SymtabId, save_env: Vec<SymtabId>, result: RunResult<()>) -> RunResult<()> {
        match result {
            Ok(()) => {
                let value = self.pop();
                self.activation.epilogue(self.symtabs.get_mut(sym), &mut self.heap);
                self.current_env = save_env;
                self.push(value)
            }
            Err(err) => {
                self.activation.epilogue(self.symtabs.get_mut(sym), &mut self.heap);
                self.current_env = save_env;
                Err(err)
            }
        }
    }

    /// Applies a transformer value to the operation on top of the stack and
    /// the array argument below it.
    pub(crate) fn apply_transform(&mut self, tr: Value) -> RunResult<()> {
        match tr {
            Value::Tree(id) => match self.trees.node(id) {
                Node::Variable { sym, entry } => {
                    let trf = self.fetch_var(sym, entry)?;
                    let named = self.enter_named(sym, entry);
                    let result = self.apply_transform(trf);
                    if result.is_ok() {
                        self.exit_named(named);
                    }
                    result
                }
                Node::BasicTr { tr } => primops::apply_basic_tr(self, tr),
                Node::Trform { sym, env, opargs, body } => self.apply_trform(sym, env, opargs, body),
                Node::Parendobj { expr } | Node::Dottedobj { expr } => self.apply_transform(Value::Tree(expr)),
                _ => self.transform_fault(),
            },
            other => {
                other.drop_with_heap(&mut self.heap);
                self.transform_fault()
            }
        }
    }

    fn transform_fault(&mut self) -> RunResult<()> {
        let op = self.pop();
        op.drop_with_heap(&mut self.heap);
        let arg = self.pop();
        arg.drop_with_heap(&mut self.heap);
        let fault = self.fault("?invalid case in transform apply")?;
        self.push(fault)
    }

    fn apply_trform(
        &mut self,
        sym: Option<SymtabId>,
        env: Vec<SymtabId>,
        opargs: TreeId,
        body: TreeId,
    ) -> RunResult<()> {
        let mut fval = self.pop();
        let val = self.pop();
        let nargs = match self.trees.node(opargs) {
            Node::Idlist { ids } => ids.len(),
            _ => 0,
        };
        if nargs == 0 {
            // No operation parameters: the body stands alone.
            fval.drop_with_heap(&mut self.heap);
            self.push(val)?;
            return self.apply_tree(body);
        }
        // Binding an atlas to several parameters must see the atlas, so a
        // closure built over one is rebuilt around its closed components.
        if nargs > 1 {
            fval = self.reveal_atlas(fval)?;
        }
        let sym = sym.expect("trform with parameters has a parameter table");
        let save_env = std::mem::replace(&mut self.current_env, env);
        self.activation.prologue(self.symtabs.get_mut(sym), nargs);
        let result = (|| -> RunResult<()> {
            if self.assign(opargs, fval, true, false)? {
                self.push(val)?;
                self.apply_tree(body)
            } else {
                val.drop_with_heap(&mut self.heap);
                let fault = self.fault("?tr_parameter")?;
                self.push(fault)
            }
        })();
        self.close_activation(sym, save_env, result)
    }

    /// Unwraps a closure hiding an atlas: coerces the inner operation and
    /// re-closes each component so parameter binding can destructure it.
    fn reveal_atlas(&mut self, fval: Value) -> RunResult<Value> {
        let Some(id) = fval.ref_id() else {
            return Ok(fval);
        };
        let inner = match self.heap.get(id) {
            crate::arrays::ArrayData::Closure(closure) => closure.op.clone_with_heap(&self.heap),
            _ => return Ok(fval),
        };
        fval.drop_with_heap(&mut self.heap);
        let coerced = self.coerce_op(inner)?;
        let (closed, _) = self.close_op(coerced)?;
        Ok(closed)
    }

    /// Applies an operation captured in a closure: installs the snapshotted
    /// stack pointers, applies the inner operation, restores the saved
    /// pointers in reverse order.
    fn apply_closure(&mut self, id: crate::heap::ArrayId) -> RunResult<()> {
        let (op, env, sps) = match self.heap.get(id) {
            crate::arrays::ArrayData::Closure(Closure { op, env, sps }) => {
                (op.clone_with_heap(&self.heap), env.clone(), sps.clone())
            }
            _ => unreachable!("apply_closure on non-closure"),
        };
        let mut saved = Vec::with_capacity(env.len());
        for (i, &sym) in env.iter().enumerate() {
            let table = self.symtabs.get_mut(sym);
            saved.push(table.current_sp);
            table.current_sp = sps[i];
        }
        let save_env = std::mem::replace(&mut self.current_env, env.clone());
        let result = self.apply(op);
        self.current_env = save_env;
        for (i, &sym) in env.iter().enumerate().rev() {
            self.symtabs.get_mut(sym).current_sp = saved[i];
        }
        result
    }

    /// Applies a rewritten atlas or composition whose components are op
    /// values (closures or bare trees).
    fn apply_oplist(&mut self, id: crate::heap::ArrayId) -> RunResult<()> {
        let (kind, items) = match self.heap.get(id) {
            crate::arrays::ArrayData::OpList(OpList { kind, items }) => {
                let cloned: Vec<Value> = items.iter().map(|v| v.clone_with_heap(&self.heap)).collect();
                (*kind, cloned)
            }
            _ => unreachable!("apply_oplist on non-oplist"),
        };
        match kind {
            OpListKind::Composition => {
                for item in items.into_iter().rev() {
                    self.apply(item)?;
                }
                Ok(())
            }
            OpListKind::Atlas => {
                let arg = self.pop();
                let mut results = Vec::with_capacity(items.len());
                let mut iter = items.into_iter();
                let outcome = loop {
                    let Some(item) = iter.next() else {
                        break Ok(());
                    };
                    let dup = arg.clone_with_heap(&self.heap);
                    match self.push(dup).and_then(|()| self.apply(item)) {
                        Ok(()) => results.push(self.pop()),
                        Err(err) => break Err(err),
                    }
                };
                for rest in iter {
                    rest.drop_with_heap(&mut self.heap);
                }
                arg.drop_with_heap(&mut self.heap);
                match outcome {
                    Ok(()) => {
                        let len = results.len();
                        let list = make_array(&mut self.heap, Shape::from_slice(&[len]), results)?;
                        self.push(list)
                    }
                    Err(err) => {
                        for r in results {
                            r.drop_with_heap(&mut self.heap);
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    /// Dereferences a transformer's operation argument so atlases are
    /// visible through names and parentheses.
    pub(crate) fn coerce_op(&mut self, op: Value) -> RunResult<Value> {
        let mut current = op;
        loop {
            let Value::Tree(id) = current else {
                return Ok(current);
            };
            match self.trees.node(id) {
                Node::Parendobj { expr } | Node::Dottedobj { expr } => current = Value::Tree(expr),
                Node::Variable { sym, entry } => {
                    if self.symtabs.get(sym).entry(entry).trace {
                        return Ok(current);
                    }
                    let fetched = self.fetch_var(sym, entry)?;
                    match fetched {
                        Value::Tree(_) | Value::Ref(_) => current = fetched,
                        other => {
                            other.drop_with_heap(&mut self.heap);
                            return Ok(current);
                        }
                    }
                }
                _ => return Ok(current),
            }
        }
    }

    /// Closure construction: decides whether an operation needs its
    /// environment captured for deferred application, and builds the
    /// capture when it does. Returns the (possibly rewritten) operation and
    /// whether anything changed.
    pub(crate) fn close_op(&mut self, op: Value) -> RunResult<(Value, bool)> {
        if self.current_env.is_empty() {
            return Ok((op, false));
        }
        // Heap operation values are already closed.
        let id = match &op {
            Value::Tree(id) => *id,
            _ => return Ok((op, false)),
        };
        match self.trees.node(id) {
            Node::BasicOp { .. } | Node::BasicTr { .. } => Ok((op, false)),
            Node::Variable { sym, entry } => {
                if sym == GLOBAL_SYMTAB {
                    return Ok((op, false));
                }
                let fetched = self.fetch_var(sym, entry)?;
                if let Value::Tree(t) = fetched {
                    if self.is_trivial_op(t) {
                        // A renaming of a basic or global op needs no
                        // capture; strip the extra layer.
                        return Ok((Value::Tree(t), true));
                    }
                }
                fetched.drop_with_heap(&mut self.heap);
                self.build_closure(op)
            }
            Node::Atlas { items } => self.close_op_list(op, OpListKind::Atlas, items),
            Node::Composition { items } => self.close_op_list(op, OpListKind::Composition, items),
            Node::Vcurried { op: inner, .. } => {
                if self.is_trivial_op(inner) {
                    Ok((op, false))
                } else {
                    self.build_closure(op)
                }
            }
            _ => self.build_closure(op),
        }
    }

    fn is_trivial_op(&self, tree: TreeId) -> bool {
        matches!(
            self.trees.node(tree),
            Node::BasicOp { .. } | Node::Variable { sym: GLOBAL_SYMTAB, .. }
        )
    }

    fn close_op_list(&mut self, original: Value, kind: OpListKind, items: Vec<TreeId>) -> RunResult<(Value, bool)> {
        let mut closed = Vec::with_capacity(items.len());
        let mut changed = false;
        for &item in &items {
            let (component, component_changed) = self.close_op(Value::Tree(item))?;
            changed = changed || component_changed;
            closed.push(component);
        }
        if !changed {
            for component in closed {
                component.drop_with_heap(&mut self.heap);
            }
            return Ok((original, false));
        }
        let id = self
            .heap
            .allocate(crate::arrays::ArrayData::OpList(OpList { kind, items: closed }))?;
        Ok((Value::Ref(id), true))
    }

    fn build_closure(&mut self, op: Value) -> RunResult<(Value, bool)> {
        let env = self.current_env.clone();
        let sps: Vec<i64> = env.iter().map(|&sym| self.symtabs.get(sym).current_sp).collect();
        let id = self
            .heap
            .allocate(crate::arrays::ArrayData::Closure(Closure { op, env, sps }))?;
        Ok((Value::Ref(id), true))
    }

    /// Binds one or more identifiers to a value.
    ///
    /// With a single target the value binds directly. With several targets
    /// either the value's tally matches the target count (items bind
    /// pairwise), or — during transformer parameter binding (`tr_binding`)
    /// — the value is an atlas destructured component-wise. When
    /// `value_needed` the binding takes an extra reference and the value is
    /// pushed back as the expression's result.
    ///
    /// Returns false (releasing the value) on an arity mismatch.
    pub(crate) fn assign(
        &mut self,
        idlist: TreeId,
        val: Value,
        tr_binding: bool,
        value_needed: bool,
    ) -> RunResult<bool> {
        let ids = match self.trees.node(idlist) {
            Node::Idlist { ids } => ids,
            _ => return Err(RunError::Fatal("assign target is not an idlist".into())),
        };
        let target_of = |interp: &Self, tree: TreeId| -> Option<(SymtabId, EntryId)> {
            match interp.trees.node(tree) {
                Node::Variable { sym, entry } => Some((sym, entry)),
                _ => None,
            }
        };
        if ids.len() == 1 {
            let Some((sym, entry)) = target_of(self, ids[0]) else {
                val.drop_with_heap(&mut self.heap);
                return Ok(false);
            };
            if value_needed {
                let stored = val.clone_with_heap(&self.heap);
                let ok = self.store_var(sym, entry, stored);
                if ok {
                    self.push(val)?;
                } else {
                    val.drop_with_heap(&mut self.heap);
                }
                return Ok(ok);
            }
            return Ok(self.store_var(sym, entry, val));
        }

        let components: Option<Vec<Value>> = if tr_binding {
            match &val {
                Value::Tree(t) => match self.trees.node(*t) {
                    Node::Atlas { items } if items.len() == ids.len() => {
                        Some(items.iter().map(|&i| Value::Tree(i)).collect())
                    }
                    _ => None,
                },
                Value::Ref(id) => match self.heap.get(*id) {
                    crate::arrays::ArrayData::OpList(OpList {
                        kind: OpListKind::Atlas,
                        items,
                    }) if items.len() == ids.len() => {
                        Some(items.iter().map(|v| v.clone_with_heap(&self.heap)).collect())
                    }
                    _ => None,
                },
                _ => None,
            }
        } else if val.tally(&self.heap) == ids.len() {
            Some((0..ids.len()).map(|i| item_of(&self.heap, &val, i)).collect())
        } else {
            None
        };
        let Some(components) = components else {
            val.drop_with_heap(&mut self.heap);
            return Ok(false);
        };
        for (&id_tree, component) in ids.iter().zip(components) {
            let Some((sym, entry)) = target_of(self, id_tree) else {
                component.drop_with_heap(&mut self.heap);
                val.drop_with_heap(&mut self.heap);
                return Ok(false);
            };
            self.store_var(sym, entry, component);
        }
        if value_needed {
            self.push(val)?;
        } else {
            val.drop_with_heap(&mut self.heap);
        }
        Ok(true)
    }

    /// Pushes a named definition onto the call stack for fault reports,
    /// unless it is a system name.
    fn enter_named(&mut self, sym: SymtabId, entry: EntryId) -> bool {
        let info = self.symtabs.get(sym).entry(entry);
        if info.system {
            return false;
        }
        let name = self.interns.phrase_text(info.name).to_owned();
        self.call_stack.push((sym, entry));
        self.tracer.on_enter(&name, self.call_stack.len());
        true
    }

    fn exit_named(&mut self, was_pushed: bool) {
        if was_pushed {
            self.call_stack.pop();
            self.tracer.on_exit(self.call_stack.len());
        }
    }
}
