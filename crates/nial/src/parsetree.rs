//! Parse-tree nodes and their arena.
//!
//! Node tags of the original tagged-array encoding are lifted into one sum
//! type with per-variant fields; the fixed slot layouts become named fields.
//! Programs may still treat code as data: a quoted program is a
//! `Value::Tree` carrying a [`TreeId`].
//!
//! Trees are *permanent*: the evaluator never frees a node it walks, and the
//! store only grows. Operations synthesized at runtime (closures, rewritten
//! atlases) are refcounted heap values instead, so their release is
//! automatic.

use serde::{Deserialize, Serialize};

use crate::{
    intern::{FaultId, PhraseId},
    primops::{BasicOp, BasicTr},
    symtab::{EntryId, Role, SymtabId},
};

/// Index of a node in the [`TreeStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeId(u32);

impl TreeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The shared null tree, seeded at index 0 of every store.
pub const NULLTREE: TreeId = TreeId(0);

/// A literal constant as the parser stores it: immediates plus the two
/// literal forms that allocate on evaluation. Carrying no heap references
/// keeps nodes freely cloneable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Real(f64),
    Char(char),
    Phrase(PhraseId),
    Fault(FaultId),
    /// A boolean bit-sequence literal such as `llo`.
    Bits(Vec<bool>),
    /// A string literal; evaluates to a character list.
    Str(String),
}

/// A parse-tree node. Variant fields mirror the fixed slot layouts of the
/// tagged-array encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    /// Placeholder in case expressions, empty list positions and atlases.
    Nulltree,
    /// A constant evaluated by the parser, with its printable token.
    Constant { value: Literal, token: PhraseId },
    /// A resolved variable reference.
    Variable { sym: SymtabId, entry: EntryId },
    /// A resolved named-expression reference.
    Expression { sym: SymtabId, entry: EntryId },
    /// An identifier not (yet) bound in any table. `sym` records the last
    /// table searched.
    Identifier { sym: SymtabId, name: PhraseId },
    /// A primitive operation.
    BasicOp { op: BasicOp },
    /// A primitive transformer.
    BasicTr { tr: BasicTr },
    /// Prefix application of an operation to an argument expression.
    Opcall { op: TreeId, arg: TreeId },
    /// Infix call of a basic binary operation, rewritten from
    /// `(curried op left) right` by the node constructor.
    BasicBinop { op: BasicOp, left: TreeId, right: TreeId },
    /// An operation curried with an unevaluated left argument expression.
    Curried { op: TreeId, arg: TreeId },
    /// An operation curried with a left argument evaluated at parse time.
    Vcurried { op: TreeId, value: Literal },
    /// Operations applied right-to-left to one argument.
    Composition { items: Vec<TreeId> },
    /// Operations applied to a common argument, results packaged in order.
    Atlas { items: Vec<TreeId> },
    /// Adjacent expressions packaged as a list.
    Strand { items: Vec<TreeId> },
    /// A bracketed list form.
    List { items: Vec<TreeId> },
    /// Expressions evaluated in order; the last value remains.
    ExprSeq { items: Vec<TreeId> },
    /// Definitions evaluated in order (each yields `?noexpr`).
    DefnSeq { items: Vec<TreeId> },
    /// A definition sequence glued to a trailing expression sequence.
    Action { defs: TreeId, exprs: TreeId },
    /// `name IS value`.
    Definition { idlist: TreeId, value: TreeId, is_code: bool },
    /// `EXTERNAL` declaration; all work happens at parse time.
    ExtDeclaration { idlist: TreeId, role: Role },
    /// `idlist := expr`.
    AssignExpr { idlist: TreeId, expr: TreeId },
    /// IF test THEN body {ELSEIF test THEN body} [ELSE body] ENDIF.
    IfExpr {
        arms: Vec<(TreeId, TreeId)>,
        else_expr: Option<TreeId>,
    },
    /// WHILE test DO body ENDWHILE.
    WhileExpr { test: TreeId, body: TreeId },
    /// REPEAT body UNTIL test ENDREPEAT.
    RepeatExpr { body: TreeId, test: TreeId },
    /// FOR id WITH iter DO body ENDFOR.
    ForExpr { idlist: TreeId, iter: TreeId, body: TreeId },
    /// CASE selector FROM label: body END ... [ELSE body] ENDCASE.
    ///
    /// `values` are the labels pre-evaluated at parse time; `bodies` has one
    /// entry per label plus a final else body (`NULLTREE` when absent).
    CaseExpr {
        selector: TreeId,
        values: Vec<Literal>,
        labels: Vec<TreeId>,
        bodies: Vec<TreeId>,
    },
    /// EXIT expr: terminate the innermost loop or sequence with a value.
    ExitExpr { expr: TreeId },
    /// A block with its own closed namespace.
    Block {
        sym: SymtabId,
        env: Vec<SymtabId>,
        nvars: u32,
        body: TreeId,
    },
    /// The body of a block: declarations, definitions and the sequence.
    BlockBody {
        locals: TreeId,
        nonlocals: TreeId,
        defs: Option<TreeId>,
        seq: TreeId,
    },
    /// OP args (expr | block).
    Opform {
        sym: SymtabId,
        env: Vec<SymtabId>,
        nvars: u32,
        args: TreeId,
        body: TreeId,
    },
    /// TR opargs operation-body.
    Trform {
        sym: Option<SymtabId>,
        env: Vec<SymtabId>,
        opargs: TreeId,
        body: TreeId,
    },
    /// Application of a transformer to an operation argument.
    Transform { tr: TreeId, op: TreeId },
    /// A list of identifiers (assignment targets, parameters).
    Idlist { ids: Vec<TreeId> },
    /// A comment carried through the parse.
    CommentExpr { text: PhraseId },
    /// Parenthesized object; fault triggering of wrapped constants is
    /// suppressed.
    Parendobj { expr: TreeId },
    /// Dotted object; transparent.
    Dottedobj { expr: TreeId },
    /// `fn:var` reference to a local of a currently active call of `fn`.
    ScopedVar { fun: TreeId, var: PhraseId },
    /// `var@i := e`, `var@@p := e`, `var#i := e`, `var|i := e`.
    IndexedAssign { target: TreeId, expr: TreeId },
    /// Selection `var @ index` (pick) or its update left-hand side.
    PickPlace { var: TreeId, index: TreeId },
    /// Selection `var @@ path` (reach) or its update left-hand side.
    ReachPut { var: TreeId, index: TreeId },
    /// Selection `var | spec` (slice) or its update left-hand side.
    SliceSel { var: TreeId, index: TreeId },
    /// Selection `var # addrs` (choose) or its update left-hand side.
    ChooseSel { var: TreeId, index: TreeId },
    /// A quoted program (`!ident` or `!(expr)`): evaluates to itself.
    Cast { tree: TreeId },
}

/// Append-only arena of parse-tree nodes.
#[derive(Debug, Serialize, Deserialize)]
pub struct TreeStore {
    nodes: Vec<Node>,
}

impl TreeStore {
    /// Creates the store with [`NULLTREE`] seeded at index 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::Nulltree],
        }
    }

    /// Adds a node, returning its permanent id.
    pub fn push(&mut self, node: Node) -> TreeId {
        let id = TreeId(u32::try_from(self.nodes.len()).expect("tree store overflow"));
        self.nodes.push(node);
        id
    }

    /// Borrows a node.
    #[must_use]
    pub fn get(&self, id: TreeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Mutably borrows a node.
    #[must_use]
    pub fn get_mut(&mut self, id: TreeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Clones a node for dispatch; nodes carry ids and literals only, so
    /// this never touches reference counts.
    #[must_use]
    pub fn node(&self, id: TreeId) -> Node {
        self.nodes[id.index()].clone()
    }
}

impl Default for TreeStore {
    fn default() -> Self {
        Self::new()
    }
}
