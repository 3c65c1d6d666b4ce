//! The parser: recursive descent for actions, definitions and control
//! structures, with a bottom-up shift/reduce `formfinder` for the atomic or
//! mixed units that may be an expression, an operation or a transformer.
//!
//! The reduction table is indexed by the top two states of the parse stack
//! and never makes a non-deterministic choice: on a miss it shifts, and when
//! neither applies a context-sensitive error is emitted. The parser may
//! reset the token index and retry; a definition's right-hand side is tried
//! as each role in turn. An `undefined identifier` error found while
//! speculatively parsing an expression is recorded, not emitted, so the
//! assignment form can still be tried; the deferred error surfaces with the
//! remembered token position only when every fallback fails.

use crate::{
    intern::PhraseId,
    interp::Interpreter,
    parsetree::{Literal, Node, TreeId, NULLTREE},
    symtab::{
        lookup_env, EntryId, EntryValue, LookupPolicy, Role, ScopeProperty, SymtabId, GLOBAL_SYMTAB,
    },
    token::{ConstKind, Token, TokenProp, TokenStream},
};

/// Amount of token context shown in parse error messages.
const ERROR_CONTEXT: usize = 3;

/// A parse failure, surfaced to the caller as a fault value carrying the
/// message plus context around the failure point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParseError {
    pub message: String,
    pub position: usize,
}

/// Outcome of a parsing routine: the desired form was found, or a
/// legitimate form was found but not the desired one (the caller may retry
/// another production from a saved token position).
enum P<T> {
    Done(T),
    Fail,
}

type PResult<T> = Result<P<T>, Failure>;

/// Internal error carrier. `undefined` errors are deferred: recorded with
/// their position but only turned into a message when every fallback has
/// failed.
#[derive(Debug, Clone)]
struct Failure {
    message: String,
    position: usize,
    undefined: bool,
}

/// Shift/reduce states of the bottom-up parse stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SR {
    /// primary
    Pr,
    /// strand
    St,
    /// array
    Ar,
    /// operation
    Op,
    /// operation composition
    Oc,
    /// transformer
    Tr,
    /// transformer composition
    Tc,
    /// left end marker
    Le,
    /// right end marker
    Re,
    /// null form
    Nu,
}

/// Reductions selected by the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reduce {
    /// Extend a strand (PP -> S, SP -> S).
    StrandItem,
    /// Back up the top token; the item below becomes an array.
    ToArray,
    /// A O -> O (curried construction).
    Curry,
    /// O A -> A (operation application).
    OpCall,
    /// O O -> OC (composition collection).
    Compose,
    /// OC P -> O P (finish the composition, put the primary back).
    FinishComposeP,
    /// OC T -> O T.
    FinishComposeT,
    /// T O -> O (transform construction).
    Transform,
    /// Back up the top token; the transformer below becomes a composition
    /// head.
    ToTrCompose,
    /// LE x RE -> done with the given result state.
    Finish(SR),
    /// LE RE -> N (empty form).
    EmptyForm,
    /// N _ -> N (discard after a null form).
    NullDiscard,
    /// _ N -> N.
    NullSwallow,
    /// Illegal null form.
    Cant,
    /// No reduction: shift another token.
    Shift,
}

/// The reduction table, indexed by (state below top, state on top).
fn reduction(below: SR, top: SR) -> Reduce {
    use Reduce::*;
    use SR::*;
    match (below, top) {
        (Pr, Pr) | (St, Pr) => StrandItem,
        (Pr | St, Op | Tr | Tc | Re) => ToArray,
        (Pr | St, Le) => Shift,
        (Pr | St, Nu) => NullSwallow,
        (Pr | St, _) => Cant,
        (Ar, Op) => Curry,
        (Ar, Tr | Tc | Le) => Shift,
        (Ar, Re) => Finish(Pr),
        (Ar, Nu) => NullSwallow,
        (Ar, _) => Cant,
        (Op, Ar) => OpCall,
        (Op, Op) => Compose,
        (Op, Oc) => Cant,
        (Op, Re) => Finish(Op),
        (Op, Nu) => NullSwallow,
        (Op, _) => Shift,
        (Oc, Pr) => FinishComposeP,
        (Oc, Op) => Compose,
        (Oc, Tr) => FinishComposeT,
        (Oc, Le) => Shift,
        (Oc, Re) => Finish(Op),
        (Oc, Nu) => NullSwallow,
        (Oc, _) => Cant,
        (Tr, Op) => Transform,
        (Tr, Oc) => Cant,
        (Tr, Re) => ToTrCompose,
        (Tr, Nu) => NullSwallow,
        (Tr, _) => Shift,
        (Tc, Re) => Finish(Tr),
        (Tc, _) => Cant,
        (Le, Re) => EmptyForm,
        (Le, _) => Shift,
        (Re, _) => Cant,
        (Nu, Le) => Shift,
        (Nu, Re) => Finish(Nu),
        (Nu, Nu) => NullSwallow,
        (Nu, _) => NullDiscard,
    }
}

/// Parses a token stream into a tree. With `act_only`, only actions are
/// accepted; otherwise a bare operation or transformer form also parses.
pub(crate) fn parse(interp: &mut Interpreter, stream: &TokenStream, act_only: bool) -> Result<TreeId, ParseError> {
    let tokens: Vec<Token> = stream
        .tokens
        .iter()
        .filter(|t| !matches!(t.prop, TokenProp::Eol | TokenProp::Indent | TokenProp::Exdent))
        .cloned()
        .collect();
    if tokens.is_empty() {
        return Ok(NULLTREE);
    }
    let mut parser = Parser {
        interp,
        tokens,
        pos: 0,
        localcnt: 0,
        nonlocals: Vec::new(),
        referred: Vec::new(),
        loopcount: 0,
        deferred_pos: 0,
    };
    parser.parse_top(act_only).map_err(|failure| parser.surface(failure))
}

struct Parser<'a> {
    interp: &'a mut Interpreter,
    tokens: Vec<Token>,
    pos: usize,
    /// Number of local slots used in the scope being parsed.
    localcnt: u32,
    /// NONLOCAL declarations of the innermost block.
    nonlocals: Vec<PhraseId>,
    /// Names referred to inside the innermost closed scope before any LOCAL
    /// declaration or assignment.
    referred: Vec<PhraseId>,
    /// Loop nesting depth, for validating EXIT.
    loopcount: u32,
    /// Position of the most recent deferred `undefined` error.
    deferred_pos: usize,
}

impl<'a> Parser<'a> {
    // ---- token plumbing -------------------------------------------------

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next_is(&self, text: &str) -> bool {
        self.current().is_some_and(|t| t.is_delim(text))
    }

    fn next_is_any(&self, texts: &[&str]) -> bool {
        texts.iter().any(|t| self.next_is(t))
    }

    fn accept(&mut self) {
        self.pos += 1;
    }

    fn reset(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn context(&self, at: usize) -> String {
        let start = at.saturating_sub(ERROR_CONTEXT);
        let end = (at + ERROR_CONTEXT + 1).min(self.tokens.len());
        let mut out = String::new();
        for token in &self.tokens[start..end] {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&token.text);
        }
        out
    }

    fn error<T>(&self, message: &str) -> PResult<T> {
        Err(Failure {
            message: format!("{message}: {}", self.context(self.pos)),
            position: self.pos,
            undefined: false,
        })
    }

    /// Defers an `undefined identifier` error so assignment fallbacks can
    /// still be tried.
    fn undefined<T>(&mut self) -> PResult<T> {
        self.deferred_pos = self.pos;
        Err(Failure {
            message: String::new(),
            position: self.pos,
            undefined: true,
        })
    }

    fn surface(&self, failure: Failure) -> ParseError {
        if failure.undefined {
            ParseError {
                message: format!("?undefined identifier: {}", self.context(self.deferred_pos)),
                position: self.deferred_pos,
            }
        } else {
            ParseError {
                message: format!("?{}", failure.message),
                position: failure.position,
            }
        }
    }

    fn push_node(&mut self, node: Node) -> TreeId {
        self.interp.trees.push(node)
    }

    // ---- entry ----------------------------------------------------------

    fn parse_top(&mut self, act_only: bool) -> Result<TreeId, Failure> {
        match self.action()? {
            P::Done(tree) => {
                if self.at_end() {
                    return Ok(tree);
                }
                return Err(self.plain_failure("tokens left"));
            }
            P::Fail => {}
        }
        if !act_only {
            self.reset(0);
            if let P::Done((_, tree)) = self.formfinder()? {
                if self.at_end() {
                    return Ok(tree);
                }
                return Err(self.plain_failure("tokens left"));
            }
        }
        Err(self.plain_failure("expecting an action"))
    }

    fn plain_failure(&self, message: &str) -> Failure {
        Failure {
            message: format!("{message}: {}", self.context(self.pos)),
            position: self.pos,
            undefined: false,
        }
    }

    // ---- actions and definitions ---------------------------------------

    /// action = definition-sequence [';' [expression-sequence]]
    ///        | expression-sequence
    fn action(&mut self) -> PResult<TreeId> {
        let looks_like_defn = self.tokens.get(self.pos + 1).is_some_and(|t| t.is_delim("IS"))
            || self.current().is_some_and(|t| t.prop == TokenProp::Comment);
        if looks_like_defn {
            if let P::Done(defs) = self.defn_seq(false)? {
                if self.at_end() {
                    return Ok(P::Done(defs));
                }
                if self.next_is(";") {
                    self.accept();
                    if self.at_end() {
                        return Ok(P::Done(defs));
                    }
                    if let P::Done(exprs) = self.expr_seq()? {
                        let node = self.push_node(Node::Action { defs, exprs });
                        return Ok(P::Done(node));
                    }
                }
                return Ok(P::Done(defs));
            }
            return Ok(P::Fail);
        }
        self.expr_seq()
    }

    fn defn_seq(&mut self, inblock: bool) -> PResult<TreeId> {
        let P::Done(first) = self.defn(inblock)? else {
            return Ok(P::Fail);
        };
        let mut items = vec![first];
        let mut last_good = self.pos;
        while self.next_is(";") {
            self.accept();
            match self.defn(inblock)? {
                P::Done(next) => {
                    items.push(next);
                    last_good = self.pos;
                }
                P::Fail => break,
            }
        }
        self.reset(last_good); // the last semicolon is not used up
        let tree = if items.len() == 1 {
            items[0]
        } else {
            self.push_node(Node::DefnSeq { items })
        };
        Ok(P::Done(tree))
    }

    /// definition = identifier IS (opform | block | trform | any-form)
    ///            | comment
    fn defn(&mut self, inblock: bool) -> PResult<TreeId> {
        if let Some(node) = self.comment_node()? {
            return Ok(P::Done(node));
        }
        let start = self.pos;
        let policy = if inblock { LookupPolicy::Statics } else { LookupPolicy::Dynamic };
        let idlist = self.idlist(policy)?;
        let ids = self.idlist_ids(idlist);
        if ids.len() != 1 || !self.next_is("IS") {
            self.reset(start);
            return Ok(P::Fail);
        }
        self.accept(); // IS

        // Resolve or install the name being defined.
        let (sym, entry, old_role) = match self.interp.trees.node(ids[0]) {
            Node::Variable { sym, entry } => {
                let info = self.interp.symtabs.get(sym).entry(entry);
                if info.system {
                    return self.error("name already defined");
                }
                (sym, entry, info.role)
            }
            Node::Identifier { name, .. } => {
                let target = self.definition_symtab(inblock);
                let entry = self.install_var(target, name, Role::Ident);
                let var = self.push_node(Node::Variable { sym: target, entry });
                self.replace_idlist_entry(idlist, 0, var);
                (target, entry, Role::Ident)
            }
            _ => return self.error("expecting a definition"),
        };

        // EXTERNAL declaration.
        if self.next_is("EXTERNAL") {
            self.accept();
            if inblock {
                return self.error("invalid external declaration");
            }
            let role = if self.next_is("EXPRESSION") {
                Role::Expr
            } else if self.next_is_any(&["OP", "OPERATION"]) {
                Role::Optn
            } else if self.next_is_any(&["TR", "TRANSFORMER"]) {
                Role::Trans
            } else if self.next_is("VARIABLE") {
                Role::Var
            } else {
                return self.error("expecting external definition");
            };
            self.accept();
            if old_role == Role::Ident {
                self.set_role(sym, entry, role);
            } else if old_role != role {
                return self.error("external declaration conflicts with existing role");
            }
            let node = self.push_node(Node::ExtDeclaration { idlist, role });
            return Ok(P::Done(node));
        }

        let value = if self.next_is_any(&["OP", "OPERATION"]) {
            self.check_role(sym, entry, old_role, Role::Optn)?;
            match self.op_form()? {
                P::Done(tree) => tree,
                P::Fail => return self.error("expecting operation form"),
            }
        } else if self.next_is_any(&["{", "BEGIN"]) {
            self.check_role(sym, entry, old_role, Role::Expr)?;
            match self.block()? {
                P::Done(tree) => tree,
                P::Fail => return self.error("expecting block"),
            }
        } else if self.next_is_any(&["TR", "TRANSFORMER"]) {
            self.check_role(sym, entry, old_role, Role::Trans)?;
            match self.tr_form()? {
                P::Done(tree) => tree,
                P::Fail => return self.error("expecting transformer form"),
            }
        } else {
            // Any of the three object kinds may follow; each role is tried in
            // turn (the role must be installed during the try so recursive
            // definitions parse).
            self.defn_retry(sym, entry, old_role)?
        };

        let role = self.interp.symtabs.get(sym).entry(entry).role;
        let node = self.push_node(Node::Definition {
            idlist,
            value,
            is_code: role != Role::Expr,
        });
        Ok(P::Done(node))
    }

    fn defn_retry(&mut self, sym: SymtabId, entry: EntryId, old_role: Role) -> Result<TreeId, Failure> {
        let tries: &[Role] = if old_role == Role::Ident {
            &[Role::Expr, Role::Optn, Role::Trans]
        } else {
            std::slice::from_ref(match old_role {
                Role::Expr => &Role::Expr,
                Role::Optn => &Role::Optn,
                Role::Trans => &Role::Trans,
                _ => &Role::Var,
            })
        };
        let start = self.pos;
        let mut last_failure: Option<Failure> = None;
        for (i, &role) in tries.iter().enumerate() {
            self.set_role(sym, entry, role);
            match self.formfinder() {
                Ok(P::Done((state, tree))) => {
                    let found = match state {
                        SR::Pr | SR::St | SR::Ar => Role::Expr,
                        SR::Op => Role::Optn,
                        SR::Tr => Role::Trans,
                        _ => {
                            self.set_role(sym, entry, old_role);
                            return Err(self.plain_failure("expecting a definition"));
                        }
                    };
                    if tries.len() == 1 && found != role {
                        self.set_role(sym, entry, old_role);
                        return Err(self.plain_failure("definition does not match the name's role"));
                    }
                    if found == role {
                        return Ok(tree);
                    }
                    // Parsed, but not as the assumed role: try again.
                }
                Ok(P::Fail) => {}
                Err(failure) => {
                    if i + 1 == tries.len() {
                        self.set_role(sym, entry, old_role);
                        return Err(failure);
                    }
                    last_failure = Some(failure);
                }
            }
            self.reset(start);
        }
        self.set_role(sym, entry, old_role);
        Err(last_failure.unwrap_or_else(|| self.plain_failure("expecting a definition")))
    }

    fn check_role(&mut self, sym: SymtabId, entry: EntryId, old_role: Role, wanted: Role) -> Result<(), Failure> {
        if old_role == Role::Ident {
            self.set_role(sym, entry, wanted);
            Ok(())
        } else if old_role == wanted {
            Ok(())
        } else {
            Err(self.plain_failure("name already matched to another role"))
        }
    }

    fn set_role(&mut self, sym: SymtabId, entry: EntryId, role: Role) {
        self.interp.symtabs.get_mut(sym).entry_mut(entry).role = role;
    }

    /// The table a definition's name installs into: the innermost table for
    /// static (in-block) definitions, the global table for dynamic ones.
    fn definition_symtab(&self, inblock: bool) -> SymtabId {
        if inblock {
            self.interp.current_env.first().copied().unwrap_or(GLOBAL_SYMTAB)
        } else {
            GLOBAL_SYMTAB
        }
    }

    /// Installs a fresh name with the given role; a non-global table also
    /// assigns the next local slot offset.
    fn install_var(&mut self, sym: SymtabId, name: PhraseId, role: Role) -> EntryId {
        let value = if sym == GLOBAL_SYMTAB {
            EntryValue::Empty
        } else {
            let offset = self.localcnt;
            self.localcnt += 1;
            EntryValue::Local(offset)
        };
        let interns = &self.interp.interns;
        self.interp.symtabs.get_mut(sym).install(name, role, value, false, interns)
    }

    // ---- expression sequences ------------------------------------------

    fn expr_seq(&mut self) -> PResult<TreeId> {
        let P::Done(first) = self.stmt_expr()? else {
            return Ok(P::Fail);
        };
        let mut items = vec![first];
        while self.next_is(";") {
            self.accept();
            match self.stmt_expr()? {
                P::Done(next) => items.push(next),
                P::Fail => {
                    items.push(NULLTREE); // trailing semicolon
                    break;
                }
            }
        }
        let node = self.push_node(Node::ExprSeq { items });
        Ok(P::Done(node))
    }

    /// statement-expression: assignment, control structure, comment or
    /// expression. An expression is tried first; when it is followed by an
    /// assignment arrow, or failed with a deferred undefined error, the
    /// assignment forms are tried from the saved position.
    fn stmt_expr(&mut self) -> PResult<TreeId> {
        if self.at_end() {
            return Ok(P::Fail);
        }
        let start = self.pos;
        let saved_referred = self.referred.clone();
        let mut error_on_first_try = false;

        match self.expression() {
            Ok(P::Done(tree)) => {
                if !self.next_is_any(&["GETS", ":="]) {
                    return Ok(P::Done(tree));
                }
                self.referred = saved_referred;
            }
            Ok(P::Fail) => {
                self.referred = saved_referred;
            }
            Err(failure) => {
                if !failure.undefined {
                    return Err(failure);
                }
                error_on_first_try = true;
                self.referred = saved_referred;
            }
        }
        self.reset(start);

        match self.assign_expr()? {
            P::Done(tree) => return Ok(P::Done(tree)),
            P::Fail => {}
        }
        match self.ix_assign_expr()? {
            P::Done(tree) => return Ok(P::Done(tree)),
            P::Fail => {
                if error_on_first_try {
                    self.pos = self.deferred_pos;
                    return self.undefined();
                }
                self.reset(start);
            }
        }

        if self.next_is("IF") {
            return self.if_expr();
        }
        if self.next_is("WHILE") {
            return self.while_expr();
        }
        if self.next_is("FOR") {
            return self.for_expr();
        }
        if self.next_is("CASE") {
            return self.case_expr();
        }
        if self.next_is("REPEAT") {
            return self.repeat_expr();
        }
        if self.next_is("EXIT") {
            return self.exit_expr();
        }
        if let Some(node) = self.comment_node()? {
            return Ok(P::Done(node));
        }
        self.reset(start);
        Ok(P::Fail)
    }

    /// Accepts a comment token, when one is next.
    fn comment_node(&mut self) -> Result<Option<TreeId>, Failure> {
        let comment = match self.current() {
            Some(token) if token.prop == TokenProp::Comment => token.text.clone(),
            _ => return Ok(None),
        };
        self.accept();
        let text = self.interp.interns.phrase(&comment);
        Ok(Some(self.push_node(Node::CommentExpr { text })))
    }

    /// Uses the bottom-up parser expecting an array form.
    fn expression(&mut self) -> PResult<TreeId> {
        let start = self.pos;
        match self.formfinder()? {
            P::Done((SR::Pr | SR::St | SR::Ar, tree)) => Ok(P::Done(tree)),
            P::Done(_) => {
                self.reset(start);
                Ok(P::Fail)
            }
            P::Fail => Ok(P::Fail),
        }
    }

    /// Uses the bottom-up parser expecting an operation.
    fn operation(&mut self) -> PResult<TreeId> {
        match self.formfinder()? {
            P::Done((SR::Op, tree)) => Ok(P::Done(tree)),
            P::Done(_) | P::Fail => Ok(P::Fail),
        }
    }

    // ---- assignment -----------------------------------------------------

    fn assign_expr(&mut self) -> PResult<TreeId> {
        let start = self.pos;
        let idlist = self.idlist(LookupPolicy::Active)?;
        let ids = self.idlist_ids(idlist);
        if ids.is_empty() || !self.next_is_any(&["GETS", ":="]) {
            self.reset(start);
            return Ok(P::Fail);
        }
        self.accept();
        for (i, &id_tree) in ids.iter().enumerate() {
            match self.interp.trees.node(id_tree) {
                Node::Identifier { name, .. } => {
                    let target = self.assignment_target_symtab(name)?;
                    let entry = self.install_var(target, name, Role::Var);
                    let var = self.push_node(Node::Variable { sym: target, entry });
                    self.replace_idlist_entry(idlist, i, var);
                }
                Node::Variable { sym, entry } => {
                    let role = self.interp.symtabs.get(sym).entry(entry).role;
                    match role {
                        Role::Var => {}
                        Role::Ident => self.set_role(sym, entry, Role::Var),
                        _ => return self.error("invalid assignment target"),
                    }
                }
                _ => return self.error("invalid assignment target"),
            }
        }
        match self.stmt_expr()? {
            P::Done(expr) => {
                let node = self.push_node(Node::AssignExpr { idlist, expr });
                Ok(P::Done(node))
            }
            P::Fail => self.error("expecting expression"),
        }
    }

    /// Chooses the table a fresh assignment target installs into, enforcing
    /// the closed-scope discipline (no assignment to an outer name, no
    /// assignment after a bare reference).
    fn assignment_target_symtab(&mut self, name: PhraseId) -> Result<SymtabId, Failure> {
        let Some(&innermost) = self.interp.current_env.first() else {
            return Ok(GLOBAL_SYMTAB);
        };
        if self.interp.symtabs.get(innermost).property == ScopeProperty::Closed {
            if self.referred.contains(&name) {
                return Err(self.plain_failure("reference before assignment"));
            }
            return Ok(innermost);
        }
        Ok(GLOBAL_SYMTAB)
    }

    fn ix_assign_expr(&mut self) -> PResult<TreeId> {
        let start = self.pos;
        let P::Done(id_tree) = self.id(LookupPolicy::Passive)? else {
            return Ok(P::Fail);
        };
        let is_var = matches!(
            self.interp.trees.node(id_tree),
            Node::Variable { sym, entry } if self.interp.symtabs.get(sym).entry(entry).role == Role::Var
        );
        if !is_var {
            self.reset(start);
            return Ok(P::Fail);
        }
        let target = match self.ix_var(id_tree)? {
            P::Done(tree) => tree,
            P::Fail => {
                self.reset(start);
                return Ok(P::Fail);
            }
        };
        if !self.next_is_any(&["GETS", ":="]) {
            return self.error("tokens left");
        }
        self.accept();
        match self.stmt_expr()? {
            P::Done(expr) => {
                let node = self.push_node(Node::IndexedAssign { target, expr });
                Ok(P::Done(node))
            }
            P::Fail => self.error("expecting expression"),
        }
    }

    /// Indexed variable: `id@expr`, `id@@expr`, `id|expr`, `id#expr`.
    fn ix_var(&mut self, id_tree: TreeId) -> PResult<TreeId> {
        enum Notation {
            Pick,
            Reach,
            Slice,
            Choose,
        }
        let notation = if self.next_is("@") {
            self.accept();
            if self.next_is("@") {
                self.accept();
                Notation::Reach
            } else {
                Notation::Pick
            }
        } else if self.next_is("|") {
            self.accept();
            Notation::Slice
        } else if self.next_is("#") {
            self.accept();
            Notation::Choose
        } else {
            return Ok(P::Fail);
        };
        match self.primary()? {
            P::Done(index) => {
                let node = match notation {
                    Notation::Pick => Node::PickPlace { var: id_tree, index },
                    Notation::Reach => Node::ReachPut { var: id_tree, index },
                    Notation::Slice => Node::SliceSel { var: id_tree, index },
                    Notation::Choose => Node::ChooseSel { var: id_tree, index },
                };
                let tree = self.push_node(node);
                Ok(P::Done(tree))
            }
            P::Fail => self.error("expecting expression"),
        }
    }

    /// Scoped variable: `fn:var`.
    fn scoped_var(&mut self, id_tree: TreeId) -> PResult<TreeId> {
        let Node::Variable { sym, entry } = self.interp.trees.node(id_tree) else {
            return Ok(P::Fail);
        };
        let info = self.interp.symtabs.get(sym).entry(entry);
        if !matches!(info.role, Role::Optn | Role::Expr | Role::Trans) || !self.next_is(":") {
            return Ok(P::Fail);
        }
        if info.system {
            return self.error("system names have no accessible scope");
        }
        let valid = matches!(info.value, EntryValue::Tree(_) | EntryValue::Array(_));
        if !valid {
            return self.error("definition has no scope");
        }
        self.accept(); // ':'
        match self.id_formal()? {
            P::Done(name) => {
                let node = self.push_node(Node::ScopedVar { fun: id_tree, var: name });
                Ok(P::Done(node))
            }
            P::Fail => self.error("expecting variable"),
        }
    }

    // ---- identifiers ----------------------------------------------------

    fn idlist(&mut self, policy: LookupPolicy) -> Result<TreeId, Failure> {
        let mut ids = Vec::new();
        loop {
            match self.id(policy)? {
                P::Done(tree) => ids.push(tree),
                P::Fail => break,
            }
        }
        Ok(self.push_node(Node::Idlist { ids }))
    }

    fn idlist_formal(&mut self) -> Result<TreeId, Failure> {
        let mut ids = Vec::new();
        loop {
            match self.id_formal()? {
                P::Done(name) => {
                    let node = self.push_node(Node::Identifier {
                        sym: GLOBAL_SYMTAB,
                        name,
                    });
                    ids.push(node);
                }
                P::Fail => break,
            }
        }
        Ok(self.push_node(Node::Idlist { ids }))
    }

    fn idlist_ids(&self, idlist: TreeId) -> Vec<TreeId> {
        match self.interp.trees.node(idlist) {
            Node::Idlist { ids } => ids,
            _ => Vec::new(),
        }
    }

    fn replace_idlist_entry(&mut self, idlist: TreeId, index: usize, tree: TreeId) {
        let mut ids = self.idlist_ids(idlist);
        ids[index] = tree;
        *self.interp.trees.get_mut(idlist) = Node::Idlist { ids };
    }

    /// Parses one identifier under a lookup policy, producing a `Variable`
    /// node when found and an `Identifier` node otherwise.
    fn id(&mut self, policy: LookupPolicy) -> PResult<TreeId> {
        let text = match self.current() {
            Some(token) if token.prop == TokenProp::Identifier => token.text.clone(),
            _ => return Ok(P::Fail),
        };
        let name = self.interp.interns.phrase(&text);
        self.accept();
        let found = lookup_env(
            &self.interp.symtabs,
            &self.interp.current_env,
            policy,
            name,
            &self.nonlocals,
            &self.interp.interns,
        );
        let node = match found {
            Some((sym, entry)) => Node::Variable { sym, entry },
            None => Node::Identifier {
                sym: GLOBAL_SYMTAB,
                name,
            },
        };
        Ok(P::Done(self.push_node(node)))
    }

    /// Parses one identifier without lookup, returning its phrase.
    fn id_formal(&mut self) -> PResult<PhraseId> {
        let text = match self.current() {
            Some(token) if token.prop == TokenProp::Identifier => token.text.clone(),
            _ => return Ok(P::Fail),
        };
        let name = self.interp.interns.phrase(&text);
        self.accept();
        Ok(P::Done(name))
    }

    fn role_of(&self, tree: TreeId) -> Role {
        match self.interp.trees.node(tree) {
            Node::Variable { sym, entry } => self.interp.symtabs.get(sym).entry(entry).role,
            _ => Role::Ident,
        }
    }

    /// Records a bare reference inside a closed scope.
    fn note_referred(&mut self, tree: TreeId) {
        let Some(&innermost) = self.interp.current_env.first() else {
            return;
        };
        if self.interp.symtabs.get(innermost).property != ScopeProperty::Closed {
            return;
        }
        let name = match self.interp.trees.node(tree) {
            Node::Variable { sym, entry } => self.interp.symtabs.get(sym).entry(entry).name,
            Node::Identifier { name, .. } => name,
            _ => return,
        };
        if !self.referred.contains(&name) {
            self.referred.push(name);
        }
    }

    // ---- constants ------------------------------------------------------

    fn constant_literal(&mut self, kind: ConstKind, text: &str) -> Result<Literal, Failure> {
        let literal = match kind {
            ConstKind::Int => match text.parse::<i64>() {
                Ok(n) => Literal::Int(n),
                // Integer literal overflow widens to real.
                Err(_) => match text.parse::<f64>() {
                    Ok(r) => Literal::Real(r),
                    Err(_) => return Err(self.plain_failure("expecting expression")),
                },
            },
            ConstKind::Real => match text.parse::<f64>() {
                Ok(r) => Literal::Real(r),
                Err(_) => return Err(self.plain_failure("expecting expression")),
            },
            ConstKind::Bool => {
                let bits: Vec<bool> = text.chars().map(|c| matches!(c, 'l' | 'L')).collect();
                if bits.len() == 1 {
                    Literal::Bool(bits[0])
                } else {
                    Literal::Bits(bits)
                }
            }
            ConstKind::Char => Literal::Char(text.chars().nth(1).unwrap_or(' ')),
            ConstKind::Str => {
                // Strip the outer quotes and collapse doubled quotes.
                let inner = &text[1..text.len().saturating_sub(1)];
                let mut out = String::with_capacity(inner.len());
                let mut chars = inner.chars();
                while let Some(c) = chars.next() {
                    out.push(c);
                    if c == '\'' {
                        chars.next(); // skip the doubled quote
                    }
                }
                Literal::Str(out)
            }
            ConstKind::Phrase => Literal::Phrase(self.interp.interns.phrase(&text[1..])),
            ConstKind::Fault => Literal::Fault(self.interp.interns.fault(text)),
        };
        Ok(literal)
    }

    fn constant_node(&mut self) -> Result<Option<TreeId>, Failure> {
        let Some(token) = self.current() else {
            return Ok(None);
        };
        let TokenProp::Const(kind) = token.prop else {
            return Ok(None);
        };
        let text = token.text.clone();
        let literal = self.constant_literal(kind, &text)?;
        self.accept();
        let token_phrase = self.interp.interns.phrase(&text);
        Ok(Some(self.push_node(Node::Constant {
            value: literal,
            token: token_phrase,
        })))
    }

    // ---- the bottom-up formfinder ---------------------------------------

    fn formfinder(&mut self) -> PResult<(SR, TreeId)> {
        self.interp.checksignal().map_err(|_| Failure {
            message: "interrupted".into(),
            position: self.pos,
            undefined: false,
        })?;
        let mut stack = SRStack::default();
        stack.push(SR::Le, NULLTREE);
        self.shift(&mut stack)?;
        loop {
            let below = stack.state(1);
            let top = stack.state(0);
            match reduction(below, top) {
                Reduce::Shift => self.shift(&mut stack)?,
                Reduce::StrandItem => stack.add_item(SR::St),
                Reduce::ToArray => {
                    stack.backup();
                    stack.set_top_state(SR::Ar);
                }
                Reduce::ToTrCompose => {
                    stack.backup();
                    stack.set_top_state(SR::Tc);
                }
                Reduce::Curry => {
                    let op = stack.pop(self);
                    let arg = stack.pop(self);
                    // An atomic constant left argument is stored evaluated.
                    let node = match self.interp.trees.node(arg) {
                        Node::Constant { value, .. }
                            if matches!(
                                value,
                                Literal::Bool(_)
                                    | Literal::Int(_)
                                    | Literal::Real(_)
                                    | Literal::Char(_)
                                    | Literal::Phrase(_)
                            ) =>
                        {
                            Node::Vcurried { op, value }
                        }
                        _ => Node::Curried { op, arg },
                    };
                    let node = self.push_node(node);
                    stack.push(SR::Op, node);
                }
                Reduce::OpCall => {
                    let arg = stack.pop(self);
                    let op = stack.pop(self);
                    let node = self.opcall_node(op, arg);
                    let tree = self.push_node(node);
                    stack.push(SR::Ar, tree);
                }
                Reduce::Compose => stack.add_item(SR::Oc),
                Reduce::FinishComposeP => {
                    let primary = stack.pop(self);
                    let composition = stack.pop(self);
                    stack.push(SR::Op, composition);
                    stack.push(SR::Pr, primary);
                }
                Reduce::FinishComposeT => {
                    let tr = stack.pop(self);
                    let composition = stack.pop(self);
                    stack.push(SR::Op, composition);
                    stack.push(SR::Tr, tr);
                }
                Reduce::Transform => {
                    let op = stack.pop(self);
                    let tr = stack.pop(self);
                    let node = self.push_node(Node::Transform { tr, op });
                    stack.push(SR::Op, node);
                }
                Reduce::Finish(result_state) => {
                    if stack.state(2) != SR::Le {
                        return self.error("unexpected token or eol");
                    }
                    stack.pop(self); // RE
                    let tree = stack.pop(self);
                    stack.pop(self); // LE
                    return Ok(P::Done((result_state, tree)));
                }
                Reduce::EmptyForm => {
                    stack.pop(self); // RE
                    stack.pop(self); // LE
                    stack.push(SR::Nu, NULLTREE);
                    return Ok(P::Done((SR::Nu, NULLTREE)));
                }
                Reduce::NullDiscard => {
                    stack.pop(self);
                }
                Reduce::NullSwallow => {
                    stack.pop(self); // N
                    stack.pop(self);
                    stack.push(SR::Nu, NULLTREE);
                }
                Reduce::Cant => return self.error("unexpected token or eol"),
            }
        }
    }

    /// Constructs an operation call, rewriting an infix call of a basic
    /// binary operation into a single `basic-binopcall` node.
    fn opcall_node(&mut self, op: TreeId, arg: TreeId) -> Node {
        match self.interp.trees.node(op) {
            Node::Curried { op: inner, arg: left } => {
                if let Node::BasicOp { op: basic } = self.interp.trees.node(inner) {
                    if basic.is_binary() {
                        return Node::BasicBinop {
                            op: basic,
                            left,
                            right: arg,
                        };
                    }
                }
            }
            Node::Vcurried { op: inner, value } => {
                if let Node::BasicOp { op: basic } = self.interp.trees.node(inner) {
                    if basic.is_binary() {
                        let token = self.interp.interns.phrase(&literal_text(&value, &self.interp.interns));
                        let left = self.push_node(Node::Constant { value, token });
                        return Node::BasicBinop {
                            op: basic,
                            left,
                            right: arg,
                        };
                    }
                }
            }
            _ => {}
        }
        Node::Opcall { op, arg }
    }

    /// Obtains the next bottom-up token and places it on the parse stack.
    fn shift(&mut self, stack: &mut SRStack) -> Result<(), Failure> {
        if stack.take_backup() {
            return Ok(());
        }
        if self.at_end() || self.next_is(";") {
            stack.push(SR::Re, NULLTREE);
            return Ok(());
        }
        if let Some(tree) = self.constant_node()? {
            stack.push(SR::Pr, tree);
            return Ok(());
        }
        let Some(token) = self.current() else {
            stack.push(SR::Re, NULLTREE);
            return Ok(());
        };
        match token.prop {
            TokenProp::Identifier => {
                let P::Done(mut tree) = self.id(LookupPolicy::Passive)? else {
                    unreachable!("identifier token parses");
                };
                if self.role_of(tree) == Role::Ident || matches!(self.interp.trees.node(tree), Node::Identifier { .. })
                {
                    self.pos -= 1; // point the deferred error at the identifier
                    return match self.undefined::<()>() {
                        Err(failure) => Err(failure),
                        Ok(_) => unreachable!(),
                    };
                }
                if let P::Done(indexed) = self.ix_var(tree)? {
                    stack.push(SR::Pr, indexed);
                    return Ok(());
                }
                if let P::Done(scoped) = self.scoped_var(tree)? {
                    stack.push(SR::Pr, scoped);
                    return Ok(());
                }
                self.note_referred(tree);
                match self.role_of(tree) {
                    Role::Expr => {
                        let Node::Variable { sym, entry } = self.interp.trees.node(tree) else {
                            unreachable!("named expression resolves to a variable node");
                        };
                        tree = self.push_node(Node::Expression { sym, entry });
                        stack.push(SR::Pr, tree);
                    }
                    Role::Constant | Role::Var => stack.push(SR::Pr, tree),
                    Role::Optn => {
                        let tree = self.deref_sys(tree);
                        stack.push(SR::Op, tree);
                    }
                    Role::Trans => {
                        let tree = self.deref_sys(tree);
                        stack.push(SR::Tr, tree);
                    }
                    Role::Reserved | Role::Ident => {
                        return Err(self.plain_failure("unexpected token or eol"));
                    }
                }
                Ok(())
            }
            TokenProp::Delim => {
                if self.next_is_any(&["{", "BEGIN"]) {
                    return match self.block()? {
                        P::Done(tree) => {
                            stack.push(SR::Pr, tree);
                            Ok(())
                        }
                        P::Fail => Err(self.plain_failure("expecting block")),
                    };
                }
                if self.next_is("(") {
                    return self.rec_form(stack, false);
                }
                if self.next_is_any(&["OP", "OPERATION"]) {
                    return match self.op_form()? {
                        P::Done(tree) => {
                            stack.push(SR::Op, tree);
                            stack.push(SR::Re, NULLTREE); // nothing can follow
                            Ok(())
                        }
                        P::Fail => Err(self.plain_failure("expecting operation form")),
                    };
                }
                if self.next_is_any(&["TR", "TRANSFORMER"]) {
                    return match self.tr_form()? {
                        P::Done(tree) => {
                            stack.push(SR::Tr, tree);
                            stack.push(SR::Re, NULLTREE);
                            Ok(())
                        }
                        P::Fail => Err(self.plain_failure("expecting transformer form")),
                    };
                }
                if self.next_is("!") {
                    return self.quotepgm(stack);
                }
                if self.next_is_any(&["[", "<<"]) {
                    return self.brackets(stack);
                }
                stack.push(SR::Re, NULLTREE);
                Ok(())
            }
            _ => {
                stack.push(SR::Re, NULLTREE);
                Ok(())
            }
        }
    }

    /// Static lookup of system constants: a variable bound to a basic
    /// operation or transformer stands for that basic directly.
    fn deref_sys(&mut self, tree: TreeId) -> TreeId {
        if let Node::Variable { sym, entry } = self.interp.trees.node(tree) {
            let info = self.interp.symtabs.get(sym).entry(entry);
            if info.system {
                if let EntryValue::Tree(t) = info.value {
                    if matches!(self.interp.trees.node(t), Node::BasicOp { .. } | Node::BasicTr { .. }) {
                        return t;
                    }
                }
            }
        }
        tree
    }

    /// Quoted programs: `!ident` and `!( expression )`.
    fn quotepgm(&mut self, stack: &mut SRStack) -> Result<(), Failure> {
        self.accept(); // '!'
        if self.current().is_some_and(|t| t.prop == TokenProp::Identifier) {
            let P::Done(tree) = self.id(LookupPolicy::Passive)? else {
                unreachable!("identifier token parses");
            };
            if matches!(self.interp.trees.node(tree), Node::Identifier { .. }) || self.role_of(tree) == Role::Ident {
                return match self.undefined::<()>() {
                    Err(failure) => Err(failure),
                    Ok(_) => unreachable!(),
                };
            }
            if let P::Done(indexed) = self.ix_var(tree)? {
                let node = self.push_node(Node::Cast { tree: indexed });
                stack.push(SR::Pr, node);
                return Ok(());
            }
            if let P::Done(scoped) = self.scoped_var(tree)? {
                let node = self.push_node(Node::Cast { tree: scoped });
                stack.push(SR::Pr, node);
                return Ok(());
            }
            let quoted = if self.role_of(tree) == Role::Expr {
                let Node::Variable { sym, entry } = self.interp.trees.node(tree) else {
                    unreachable!("named expression resolves to a variable node");
                };
                self.push_node(Node::Expression { sym, entry })
            } else {
                tree
            };
            let node = self.push_node(Node::Cast { tree: quoted });
            stack.push(SR::Pr, node);
            return Ok(());
        }
        if !self.next_is("(") {
            return Err(self.plain_failure("expecting quoted program"));
        }
        self.accept();
        let inner = match self.action()? {
            P::Done(tree) => tree,
            P::Fail => match self.formfinder()? {
                P::Done((_, tree)) => tree,
                P::Fail => return Err(self.plain_failure("expecting quoted program")),
            },
        };
        if !self.next_is(")") {
            return Err(self.plain_failure("expecting right parenthesis"));
        }
        self.accept();
        let node = self.push_node(Node::Cast { tree: inner });
        stack.push(SR::Pr, node);
        Ok(())
    }

    /// Parenthesized forms for shift and primary.
    fn rec_form(&mut self, stack: &mut SRStack, expr_only: bool) -> Result<(), Failure> {
        self.accept(); // '('
        if self.next_is(")") {
            return Err(self.plain_failure("expecting expression"));
        }
        let start = self.pos;
        match self.expr_seq()? {
            P::Done(tree) => {
                if !self.next_is(")") {
                    return Err(self.plain_failure("expecting right parenthesis"));
                }
                self.accept();
                let node = self.push_node(Node::Parendobj { expr: tree });
                stack.push(SR::Pr, node);
                return Ok(());
            }
            P::Fail => {}
        }
        self.reset(start);
        if expr_only {
            return Err(self.plain_failure("expecting expression"));
        }
        match self.formfinder()? {
            P::Done((state, tree)) => {
                if !self.next_is(")") {
                    return Err(self.plain_failure("unexpected token or eol"));
                }
                if state == SR::Nu {
                    return Err(self.plain_failure("illegal null form"));
                }
                self.accept();
                let node = self.push_node(Node::Parendobj { expr: tree });
                stack.push(state, node);
                Ok(())
            }
            P::Fail => Err(self.plain_failure("expecting expression")),
        }
    }

    /// General list forms: `[a, b, ...]` lists and `[f, g, ...]` atlases.
    fn brackets(&mut self, stack: &mut SRStack) -> Result<(), Failure> {
        self.accept(); // '[' or '<<'
        if self.next_is_any(&["]", ">>"]) {
            self.accept();
            let node = self.push_node(Node::List { items: Vec::new() });
            stack.push(SR::Pr, node);
            return Ok(());
        }
        let mut items = Vec::new();
        let mut list_kind: Option<SR> = None;
        loop {
            if !items.is_empty() {
                self.accept(); // ','
            }
            let (state, tree) = match self.formfinder()? {
                P::Done(pair) => pair,
                P::Fail => return Err(self.plain_failure("expecting expression")),
            };
            let item_kind = match state {
                SR::Nu | SR::Pr | SR::St | SR::Ar => SR::Pr,
                SR::Op => SR::Op,
                _ => return Err(self.plain_failure("invalid operation in list")),
            };
            let tree = if state == SR::Nu { NULLTREE } else { tree };
            match list_kind {
                None => list_kind = Some(item_kind),
                Some(kind) if kind == item_kind => {}
                Some(SR::Pr) => return Err(self.plain_failure("expecting expression")),
                Some(_) => return Err(self.plain_failure("expecting operation")),
            }
            items.push(tree);
            if !self.next_is(",") {
                break;
            }
        }
        if !self.next_is_any(&["]", ">>"]) {
            return Err(self.plain_failure("expecting right bracket"));
        }
        self.accept();
        match list_kind {
            Some(SR::Op) => {
                let node = self.push_node(Node::Atlas { items });
                stack.push(SR::Op, node);
            }
            _ => {
                let node = self.push_node(Node::List { items });
                stack.push(SR::Pr, node);
            }
        }
        Ok(())
    }

    /// Like shift, but returns a primary form directly. Used by `ix_var`.
    fn primary(&mut self) -> PResult<TreeId> {
        if self.at_end() || self.next_is(";") {
            return Ok(P::Fail);
        }
        if let Some(tree) = self.constant_node()? {
            return Ok(P::Done(tree));
        }
        let Some(token) = self.current() else {
            return Ok(P::Fail);
        };
        match token.prop {
            TokenProp::Identifier => {
                let P::Done(tree) = self.id(LookupPolicy::Passive)? else {
                    unreachable!("identifier token parses");
                };
                if matches!(self.interp.trees.node(tree), Node::Identifier { .. }) || self.role_of(tree) == Role::Ident
                {
                    self.pos -= 1;
                    return self.undefined();
                }
                if let P::Done(indexed) = self.ix_var(tree)? {
                    return Ok(P::Done(indexed));
                }
                if let P::Done(scoped) = self.scoped_var(tree)? {
                    return Ok(P::Done(scoped));
                }
                self.note_referred(tree);
                match self.role_of(tree) {
                    Role::Expr => {
                        let Node::Variable { sym, entry } = self.interp.trees.node(tree) else {
                            unreachable!("named expression resolves to a variable node");
                        };
                        Ok(P::Done(self.push_node(Node::Expression { sym, entry })))
                    }
                    Role::Constant | Role::Var => Ok(P::Done(tree)),
                    _ => self.error("expecting primary expression"),
                }
            }
            TokenProp::Delim => {
                if self.next_is_any(&["{", "BEGIN"]) {
                    return match self.block()? {
                        P::Done(tree) => Ok(P::Done(tree)),
                        P::Fail => self.error("expecting block"),
                    };
                }
                let mut stack = SRStack::default();
                if self.next_is("(") {
                    self.rec_form(&mut stack, true)?;
                    return Ok(P::Done(stack.pop(self)));
                }
                if self.next_is("!") {
                    self.quotepgm(&mut stack)?;
                    return Ok(P::Done(stack.pop(self)));
                }
                if self.next_is_any(&["[", "<<"]) {
                    self.brackets(&mut stack)?;
                    return Ok(P::Done(stack.pop(self)));
                }
                Ok(P::Fail)
            }
            _ => Ok(P::Fail),
        }
    }

    // ---- control structures ---------------------------------------------

    fn if_expr(&mut self) -> PResult<TreeId> {
        self.accept(); // IF
        let mut arms = Vec::new();
        let test = self.expect_expression()?;
        if !self.next_is("THEN") {
            return self.error("expecting then");
        }
        self.accept();
        let body = self.expect_expr_seq()?;
        arms.push((test, body));
        while self.next_is("ELSEIF") {
            self.accept();
            let test = self.expect_expression()?;
            if !self.next_is("THEN") {
                return self.error("expecting then");
            }
            self.accept();
            let body = self.expect_expr_seq()?;
            arms.push((test, body));
        }
        let else_expr = if self.next_is("ELSE") {
            self.accept();
            Some(self.expect_expr_seq()?)
        } else {
            None
        };
        if !self.next_is("ENDIF") {
            return self.error("expecting endif, elseif, or else");
        }
        self.accept();
        Ok(P::Done(self.push_node(Node::IfExpr { arms, else_expr })))
    }

    fn while_expr(&mut self) -> PResult<TreeId> {
        self.accept(); // WHILE
        let test = self.expect_expression()?;
        if !self.next_is("DO") {
            return self.error("expecting do");
        }
        self.accept();
        self.loopcount += 1;
        let body = self.expect_expr_seq();
        self.loopcount -= 1;
        let body = body?;
        if !self.next_is("ENDWHILE") {
            return self.error("expecting endwhile");
        }
        self.accept();
        Ok(P::Done(self.push_node(Node::WhileExpr { test, body })))
    }

    fn repeat_expr(&mut self) -> PResult<TreeId> {
        self.accept(); // REPEAT
        self.loopcount += 1;
        let body = self.expect_expr_seq();
        self.loopcount -= 1;
        let body = body?;
        if !self.next_is("UNTIL") {
            return self.error("expecting until");
        }
        self.accept();
        let test = self.expect_expression()?;
        if !self.next_is("ENDREPEAT") {
            return self.error("expecting endrepeat");
        }
        self.accept();
        Ok(P::Done(self.push_node(Node::RepeatExpr { body, test })))
    }

    fn for_expr(&mut self) -> PResult<TreeId> {
        self.accept(); // FOR
        let P::Done(id_tree) = self.id(LookupPolicy::Active)? else {
            return self.error("expecting identifier");
        };
        if !self.next_is("WITH") {
            return self.error("expecting with");
        }
        self.accept();
        let target = match self.interp.trees.node(id_tree) {
            Node::Identifier { name, .. } => {
                let sym = self.assignment_target_symtab(name)?;
                let entry = self.install_var(sym, name, Role::Var);
                self.push_node(Node::Variable { sym, entry })
            }
            Node::Variable { sym, entry } => {
                let role = self.interp.symtabs.get(sym).entry(entry).role;
                match role {
                    Role::Var => id_tree,
                    Role::Ident => {
                        self.set_role(sym, entry, Role::Var);
                        id_tree
                    }
                    _ => return self.error("invalid assignment target"),
                }
            }
            _ => return self.error("expecting identifier"),
        };
        let idlist = self.push_node(Node::Idlist { ids: vec![target] });
        let iter = self.expect_expression()?;
        if !self.next_is("DO") {
            return self.error("expecting do");
        }
        self.accept();
        self.loopcount += 1;
        let body = self.expect_expr_seq();
        self.loopcount -= 1;
        let body = body?;
        if !self.next_is("ENDFOR") {
            return self.error("expecting endfor");
        }
        self.accept();
        Ok(P::Done(self.push_node(Node::ForExpr { idlist, iter, body })))
    }

    fn case_expr(&mut self) -> PResult<TreeId> {
        self.accept(); // CASE
        let selector = self.expect_expression()?;
        if !self.next_is("FROM") {
            return self.error("expecting from");
        }
        self.accept();
        let mut values = Vec::new();
        let mut labels = Vec::new();
        let mut bodies = Vec::new();
        loop {
            let Some(token) = self.current() else { break };
            let TokenProp::Const(kind) = token.prop else { break };
            let text = token.text.clone();
            let literal = self.constant_literal(kind, &text)?;
            let token_phrase = self.interp.interns.phrase(&text);
            self.accept();
            if !self.next_is(":") {
                return self.error("expecting colon");
            }
            self.accept();
            let body = self.expect_expr_seq()?;
            if !self.next_is("END") {
                return self.error("expecting end");
            }
            self.accept();
            labels.push(self.push_node(Node::Constant {
                value: literal.clone(),
                token: token_phrase,
            }));
            values.push(literal);
            bodies.push(body);
        }
        if self.next_is("ELSE") {
            self.accept();
            let body = self.expect_expr_seq()?;
            bodies.push(body);
        } else {
            bodies.push(NULLTREE);
        }
        if !self.next_is("ENDCASE") {
            return self.error("expecting constant or endcase");
        }
        self.accept();
        Ok(P::Done(self.push_node(Node::CaseExpr {
            selector,
            values,
            labels,
            bodies,
        })))
    }

    fn exit_expr(&mut self) -> PResult<TreeId> {
        self.accept(); // EXIT
        if self.loopcount == 0 {
            return self.error("exit not inside a loop");
        }
        match self.expression()? {
            P::Done(expr) => Ok(P::Done(self.push_node(Node::ExitExpr { expr }))),
            P::Fail => self.error("expecting expression"),
        }
    }

    fn expect_expression(&mut self) -> Result<TreeId, Failure> {
        match self.expression() {
            Ok(P::Done(tree)) => Ok(tree),
            Ok(P::Fail) => Err(self.plain_failure("expecting expression")),
            Err(failure) => {
                if failure.undefined {
                    Err(self.surface_undefined())
                } else {
                    Err(failure)
                }
            }
        }
    }

    fn expect_expr_seq(&mut self) -> Result<TreeId, Failure> {
        match self.expr_seq() {
            Ok(P::Done(tree)) => Ok(tree),
            Ok(P::Fail) => Err(self.plain_failure("expecting expression sequence")),
            Err(failure) => {
                if failure.undefined {
                    Err(self.surface_undefined())
                } else {
                    Err(failure)
                }
            }
        }
    }

    /// Turns the deferred undefined error into a real one (used inside
    /// control structures, where no assignment fallback exists).
    fn surface_undefined(&self) -> Failure {
        Failure {
            message: format!("undefined identifier: {}", self.context(self.deferred_pos)),
            position: self.deferred_pos,
            undefined: false,
        }
    }

    // ---- scoped constructs ----------------------------------------------

    /// block = '{' [LOCAL idlist ';'] [NONLOCAL idlist ';'] [defnseq ';']
    ///         exprseq '}'
    fn block(&mut self) -> PResult<TreeId> {
        self.accept(); // '{' or BEGIN
        let anon = self.interp.interns.phrase("ANONYMOUS");
        let sym = self.interp.symtabs.add(ScopeProperty::Closed, anon);
        self.interp.current_env.insert(0, sym);
        let saved_localcnt = std::mem::replace(&mut self.localcnt, 0);

        let result = self.blockbody(sym, None);

        let tree = match result {
            Ok(P::Done(body)) => {
                let node = Node::Block {
                    sym,
                    env: self.interp.current_env.clone(),
                    nvars: self.localcnt,
                    body,
                };
                Ok(P::Done(self.push_node(node)))
            }
            other => other,
        };
        self.interp.current_env.remove(0);
        self.localcnt = saved_localcnt;
        tree
    }

    fn blockbody(&mut self, sym: SymtabId, args: Option<TreeId>) -> PResult<TreeId> {
        let saved_nonlocals = std::mem::take(&mut self.nonlocals);
        let saved_referred = std::mem::take(&mut self.referred);
        let result = self.blockbody_inner(sym, args);
        self.nonlocals = saved_nonlocals;
        self.referred = saved_referred;
        result
    }

    fn blockbody_inner(&mut self, sym: SymtabId, args: Option<TreeId>) -> PResult<TreeId> {
        // LOCAL declarations precede NONLOCAL ones.
        let locals = if self.next_is("LOCAL") {
            self.accept();
            let list = self.idlist_formal()?;
            if !self.next_is(";") {
                return self.error("expecting semicolon");
            }
            self.accept();
            let names: Vec<PhraseId> = self
                .idlist_ids(list)
                .iter()
                .filter_map(|&id| match self.interp.trees.node(id) {
                    Node::Identifier { name, .. } => Some(name),
                    _ => None,
                })
                .collect();
            for (i, name) in names.into_iter().enumerate() {
                let entry = self.install_var(sym, name, Role::Var);
                let var = self.push_node(Node::Variable { sym, entry });
                self.replace_idlist_entry(list, i, var);
            }
            list
        } else {
            self.push_node(Node::Idlist { ids: Vec::new() })
        };

        let nonlocals = if self.next_is("NONLOCAL") {
            self.accept();
            let list = self.idlist(LookupPolicy::Nonlocal)?;
            let entries = self.idlist_ids(list);
            let arg_names: Vec<PhraseId> = args
                .map(|a| {
                    self.idlist_ids(a)
                        .iter()
                        .filter_map(|&id| match self.interp.trees.node(id) {
                            Node::Variable { sym, entry } => {
                                Some(self.interp.symtabs.get(sym).entry(entry).name)
                            }
                            Node::Identifier { name, .. } => Some(name),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();
            for (i, &var) in entries.iter().enumerate() {
                let name = match self.interp.trees.node(var) {
                    Node::Variable { sym, entry } => self.interp.symtabs.get(sym).entry(entry).name,
                    Node::Identifier { name, .. } => name,
                    _ => continue,
                };
                if arg_names.contains(&name) {
                    return self.error("argument name reused in nonlocal list");
                }
                if self.interp.symtabs.get(sym).lookup(name, &self.interp.interns).is_some() {
                    return self.error("local name reused in nonlocal list");
                }
                self.nonlocals.push(name);
                if let Node::Identifier { .. } = self.interp.trees.node(var) {
                    // An unresolved nonlocal installs in the global table.
                    let entry = self.install_var(GLOBAL_SYMTAB, name, Role::Var);
                    let resolved = self.push_node(Node::Variable {
                        sym: GLOBAL_SYMTAB,
                        entry,
                    });
                    self.replace_idlist_entry(list, i, resolved);
                }
            }
            if !self.next_is(";") {
                return self.error("expecting semicolon");
            }
            self.accept();
            list
        } else {
            self.push_node(Node::Idlist { ids: Vec::new() })
        };

        let defs = match self.defn_seq(true)? {
            P::Done(defs) => {
                if !self.next_is(";") {
                    return self.error("expecting semicolon");
                }
                self.accept();
                Some(defs)
            }
            P::Fail => None,
        };

        let seq = self.expect_expr_seq()?;
        if !self.next_is_any(&["}", "END"]) {
            return self.error("expecting right curly brace");
        }
        self.accept();
        // After parsing, the table opens so dynamically created names do not
        // land in the local scope.
        self.interp.symtabs.get_mut(sym).property = ScopeProperty::Open;
        Ok(P::Done(self.push_node(Node::BlockBody {
            locals,
            nonlocals,
            defs,
            seq,
        })))
    }

    /// opform = OP idlist ( '(' exprseq ')' | block-body )
    fn op_form(&mut self) -> PResult<TreeId> {
        if !self.next_is_any(&["OP", "OPERATION"]) {
            return Ok(P::Fail);
        }
        self.accept();
        let args = self.idlist_formal()?;
        let arg_names: Vec<PhraseId> = self
            .idlist_ids(args)
            .iter()
            .filter_map(|&id| match self.interp.trees.node(id) {
                Node::Identifier { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        if arg_names.is_empty() {
            return self.error("expecting identifier");
        }
        let saved_localcnt = std::mem::replace(&mut self.localcnt, 0);
        let anon = self.interp.interns.phrase("ANONYMOUS");
        let sym = self.interp.symtabs.add(ScopeProperty::Open, anon);
        self.interp.current_env.insert(0, sym);

        for (i, name) in arg_names.into_iter().enumerate() {
            let entry = self.install_var(sym, name, Role::Var);
            let var = self.push_node(Node::Variable { sym, entry });
            self.replace_idlist_entry(args, i, var);
        }

        let result = (|| -> PResult<TreeId> {
            if self.next_is("(") {
                match self.expression() {
                    Ok(P::Done(body)) => Ok(P::Done(body)),
                    Ok(P::Fail) => self.error("expecting operation body"),
                    Err(failure) => Err(failure),
                }
            } else if self.next_is_any(&["{", "BEGIN"]) {
                self.accept();
                self.interp.symtabs.get_mut(sym).property = ScopeProperty::Closed;
                self.blockbody(sym, Some(args))
            } else {
                self.error("expecting operation body")
            }
        })();

        let tree = match result {
            Ok(P::Done(body)) => {
                let node = Node::Opform {
                    sym,
                    env: self.interp.current_env.clone(),
                    nvars: self.localcnt,
                    args,
                    body,
                };
                Ok(P::Done(self.push_node(node)))
            }
            Ok(P::Fail) => self.error("expecting operation body"),
            Err(failure) => Err(failure),
        };
        self.interp.current_env.remove(0);
        self.localcnt = saved_localcnt;
        tree
    }

    /// trform = TR idlist operation
    fn tr_form(&mut self) -> PResult<TreeId> {
        if !self.next_is_any(&["TR", "TRANSFORMER"]) {
            return Ok(P::Fail);
        }
        self.accept();
        let args = self.idlist_formal()?;
        let arg_names: Vec<PhraseId> = self
            .idlist_ids(args)
            .iter()
            .filter_map(|&id| match self.interp.trees.node(id) {
                Node::Identifier { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        if arg_names.is_empty() {
            return self.error("expecting identifier");
        }
        let anon = self.interp.interns.phrase("ANONYMOUS");
        let sym = self.interp.symtabs.add(ScopeProperty::Parameter, anon);
        self.interp.current_env.insert(0, sym);
        for (i, name) in arg_names.into_iter().enumerate() {
            let interns = &self.interp.interns;
            let entry = self
                .interp
                .symtabs
                .get_mut(sym)
                .install(name, Role::Optn, EntryValue::Local(i as u32), false, interns);
            let var = self.push_node(Node::Variable { sym, entry });
            self.replace_idlist_entry(args, i, var);
        }

        let result = match self.operation() {
            Ok(P::Done(body)) => {
                let node = Node::Trform {
                    sym: Some(sym),
                    env: self.interp.current_env.clone(),
                    opargs: args,
                    body,
                };
                Ok(P::Done(self.push_node(node)))
            }
            Ok(P::Fail) => self.error("expecting operation"),
            Err(failure) => Err(failure),
        };
        self.interp.current_env.remove(0);
        result
    }
}

/// Renders a parse-time literal as source text, for synthesized constant
/// nodes and the deparser.
pub(crate) fn literal_text(literal: &Literal, interns: &crate::intern::Interns) -> String {
    match literal {
        Literal::Bool(b) => (if *b { "l" } else { "o" }).to_owned(),
        Literal::Int(n) => n.to_string(),
        Literal::Real(r) => {
            if r.fract() == 0.0 && r.is_finite() {
                format!("{r:.1}")
            } else {
                r.to_string()
            }
        }
        Literal::Char(c) => format!("`{c}"),
        Literal::Phrase(p) => format!("\"{}", interns.phrase_text(*p)),
        Literal::Fault(f) => interns.fault_text(*f).to_owned(),
        Literal::Bits(bits) => bits.iter().map(|&b| if b { 'l' } else { 'o' }).collect(),
        Literal::Str(text) => format!("'{}'", text.replace('\'', "''")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{interp::Interpreter, primops::BasicOp, resource::HeapLimits, scan};

    fn parse_src(interp: &mut Interpreter, src: &str) -> Result<TreeId, ParseError> {
        let stream = scan::scan_lines(std::iter::once(src), &interp.symtabs, &interp.interns)
            .expect("test source scans");
        parse(interp, &stream, false)
    }

    fn first_expr(interp: &Interpreter, tree: TreeId) -> TreeId {
        match interp.trees.node(tree) {
            Node::ExprSeq { items } => items[0],
            _ => tree,
        }
    }

    #[test]
    fn infix_basic_binary_call_is_rewritten() {
        let mut interp = Interpreter::new(HeapLimits::default());
        let tree = parse_src(&mut interp, "1 + 2").unwrap();
        let expr = first_expr(&interp, tree);
        let Node::BasicBinop { op, left, right } = interp.trees.node(expr) else {
            panic!("expected basic-binopcall, got {:?}", interp.trees.node(expr));
        };
        assert_eq!(op, BasicOp::Plus);
        assert!(matches!(interp.trees.node(left), Node::Constant { .. }));
        assert!(matches!(interp.trees.node(right), Node::Constant { .. }));
    }

    #[test]
    fn non_binary_ops_stay_ordinary_calls() {
        let mut interp = Interpreter::new(HeapLimits::default());
        let tree = parse_src(&mut interp, "tally [1,2]").unwrap();
        let expr = first_expr(&interp, tree);
        assert!(matches!(interp.trees.node(expr), Node::Opcall { .. }));
    }

    #[test]
    fn assignment_form_installs_a_fresh_name() {
        let mut interp = Interpreter::new(HeapLimits::default());
        let tree = parse_src(&mut interp, "undef := 5").unwrap();
        let expr = first_expr(&interp, tree);
        assert!(matches!(interp.trees.node(expr), Node::AssignExpr { .. }));
    }

    #[test]
    fn deferred_undefined_error_points_at_the_identifier() {
        let mut interp = Interpreter::new(HeapLimits::default());
        let err = parse_src(&mut interp, "undef2 + 5").unwrap_err();
        assert!(err.message.contains("undefined identifier"), "{}", err.message);
        assert_eq!(err.position, 0, "error reported at the identifier, not at +");
    }

    #[test]
    fn definition_retry_assigns_the_operation_role() {
        let mut interp = Interpreter::new(HeapLimits::default());
        // No OP keyword: the right-hand side is discovered to be an
        // operation (a curried plus) by the role-retry discipline.
        let tree = parse_src(&mut interp, "bump IS 1 +").unwrap();
        let Node::Definition { value, .. } = interp.trees.node(first_expr(&interp, tree)) else {
            panic!("expected a definition");
        };
        assert!(matches!(interp.trees.node(value), Node::Vcurried { .. } | Node::Curried { .. }));
        let name = interp.interns.lookup_phrase("BUMP").unwrap();
        let entry = interp.symtabs.global().lookup(name, &interp.interns).unwrap();
        assert_eq!(interp.symtabs.global().entry(entry).role, Role::Optn);
    }

    #[test]
    fn exit_outside_a_loop_is_rejected() {
        let mut interp = Interpreter::new(HeapLimits::default());
        let err = parse_src(&mut interp, "EXIT 5").unwrap_err();
        assert!(err.message.contains("exit"), "{}", err.message);
    }

    #[test]
    fn reference_before_local_assignment_is_rejected() {
        let mut interp = Interpreter::new(HeapLimits::default());
        parse_src(&mut interp, "g := 1").unwrap();
        // g is referred to inside the closed block before being assigned
        // there, so the late assignment cannot make it local.
        let err = parse_src(&mut interp, "{ t := g + 1; g := 2; t }").unwrap_err();
        assert!(err.message.contains("reference before assignment"), "{}", err.message);
    }
}

/// The bottom-up parse stack: parallel state and tree stacks, with strand
/// and composition items collected by count.
#[derive(Default)]
struct SRStack {
    states: Vec<(SR, usize)>,
    trees: Vec<TreeId>,
    backup: Option<(SR, TreeId)>,
}

impl SRStack {
    fn push(&mut self, state: SR, tree: TreeId) {
        self.states.push((state, 1));
        self.trees.push(tree);
    }

    /// State at `depth` below the top; `Re` when the stack is shorter.
    fn state(&self, depth: usize) -> SR {
        if self.states.len() > depth {
            self.states[self.states.len() - 1 - depth].0
        } else {
            SR::Re
        }
    }

    fn set_top_state(&mut self, state: SR) {
        if let Some(top) = self.states.last_mut() {
            top.0 = state;
        }
    }

    /// Combines the top two items into a counted collection (strands and
    /// compositions); the trees stay on the tree stack.
    fn add_item(&mut self, state: SR) {
        self.states.pop();
        let top = self.states.last_mut().expect("collection below top");
        top.0 = state;
        top.1 += 1;
    }

    /// Pops one item, finishing a pending collection into a single node.
    fn pop(&mut self, parser: &mut Parser<'_>) -> TreeId {
        let &(state, count) = self.states.last().expect("parse stack underflow");
        if count > 1 {
            let at = self.trees.len() - count;
            let items: Vec<TreeId> = self.trees.drain(at..).collect();
            let node = match state {
                SR::Oc => Node::Composition { items },
                _ => Node::Strand { items },
            };
            let tree = parser.push_node(node);
            self.trees.push(tree);
            let top = self.states.last_mut().expect("parse stack underflow");
            top.0 = if state == SR::Oc { SR::Op } else { SR::Ar };
            top.1 = 1;
        }
        self.states.pop();
        self.trees.pop().expect("parse stack underflow")
    }

    /// Saves the top item so the next shift can put it back.
    fn backup(&mut self) {
        let state = self.state(0);
        let &(_, count) = self.states.last().expect("backup on empty stack");
        debug_assert_eq!(count, 1, "backed-up items are never collections");
        self.states.pop();
        let tree = self.trees.pop().expect("backup on empty stack");
        self.backup = Some((state, tree));
    }

    /// Restores a backed-up item; true when one existed.
    fn take_backup(&mut self) -> bool {
        if let Some((state, tree)) = self.backup.take() {
            self.push(state, tree);
            true
        } else {
            false
        }
    }
}
