//! The basic operation registry.
//!
//! The concrete primitive library is an external collaborator; this module
//! carries the registry the evaluator dispatches through plus a compact core
//! set (arithmetic, comparison, structural operations, the indexed
//! selection/update surface, catch/throw). Hosts extend the language by
//! installing further entries in the global symbol table that reference
//! their own `BasicOp` dispatch.
//!
//! Pervasive primitives distribute over items and pass faults through
//! unchanged ("fault in, fault out").

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::{
    arrays::{make_array, Shape},
    error::{RunError, RunResult},
    heap::Heap,
    insel,
    interp::Interpreter,
    value::{values_equal, Value},
};

/// Identity of a basic (primitive) operation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::IntoStaticStr,
    strum::EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum BasicOp {
    // arithmetic
    Plus,
    Minus,
    Times,
    Divide,
    Mod,
    Min,
    Max,
    Opposite,
    Abs,
    // comparison (whole-array)
    Equal,
    Unequal,
    // comparison (pervasive, atoms)
    Lt,
    Lte,
    Gt,
    Gte,
    // logic
    And,
    Or,
    Not,
    // structural
    Tally,
    Shape,
    Valence,
    First,
    Second,
    Third,
    Rest,
    Single,
    List,
    Link,
    Reverse,
    Tell,
    Count,
    Pair,
    Reshape,
    // indexed selection / update surface
    Pick,
    Choose,
    Reach,
    Place,
    Placeall,
    Deepplace,
    Update,
    Updateall,
    Deepupdate,
    // control / session
    Throw,
    Settrigger,
    Execute,
}

impl BasicOp {
    /// All registered basics, for symbol-table installation.
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }

    /// The lowercase word name under which the operation is installed.
    #[must_use]
    pub fn word_name(self) -> &'static str {
        self.into()
    }

    /// The infix symbol alias, when one exists.
    #[must_use]
    pub fn symbol(self) -> Option<&'static str> {
        Some(match self {
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Times => "*",
            Self::Divide => "/",
            Self::Equal => "=",
            Self::Unequal => "~=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            _ => return None,
        })
    }

    /// True for operations with a binary (infix) implementation; these are
    /// the targets of the parser's basic-binopcall rewrite.
    #[must_use]
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Self::Plus
                | Self::Minus
                | Self::Times
                | Self::Divide
                | Self::Mod
                | Self::Min
                | Self::Max
                | Self::Equal
                | Self::Unequal
                | Self::Lt
                | Self::Lte
                | Self::Gt
                | Self::Gte
                | Self::And
                | Self::Or
                | Self::Pair
                | Self::Reshape
                | Self::Pick
                | Self::Choose
                | Self::Reach
        )
    }

    /// True for operations that distribute over items.
    #[must_use]
    pub fn is_pervasive(self) -> bool {
        matches!(
            self,
            Self::Plus
                | Self::Minus
                | Self::Times
                | Self::Divide
                | Self::Mod
                | Self::Min
                | Self::Max
                | Self::Opposite
                | Self::Abs
                | Self::Lt
                | Self::Lte
                | Self::Gt
                | Self::Gte
                | Self::And
                | Self::Or
                | Self::Not
        )
    }

    /// True for the binary ops whose unary form reduces over all items
    /// instead of requiring a pair.
    fn reduces(self) -> bool {
        matches!(self, Self::Plus | Self::Times | Self::Min | Self::Max | Self::And | Self::Or)
    }
}

/// Identity of a basic (primitive) transformer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::IntoStaticStr,
    strum::EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum BasicTr {
    Each,
    Eachleft,
    Eachright,
    Catch,
}

impl BasicTr {
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Fetches item `i` of any value; atoms act as their own only item.
pub(crate) fn item_of(heap: &Heap, value: &Value, i: usize) -> Value {
    match value.ref_id() {
        Some(id) => heap.get(id).item(i, heap),
        None => {
            debug_assert_eq!(i, 0, "atom has exactly one item");
            value.clone_with_heap(heap)
        }
    }
}

/// Splits a pair into its two items, releasing the container.
/// Returns `None` (and releases the value) when the tally is not 2.
fn split_pair(interp: &mut Interpreter, value: Value) -> Option<(Value, Value)> {
    if value.tally(&interp.heap) != 2 {
        value.drop_with_heap(&mut interp.heap);
        return None;
    }
    let a = item_of(&interp.heap, &value, 0);
    let b = item_of(&interp.heap, &value, 1);
    value.drop_with_heap(&mut interp.heap);
    Some((a, b))
}

/// Unary application of a basic operation: argument on top of the operand
/// stack, result left in its place.
pub(crate) fn apply_basic(interp: &mut Interpreter, op: BasicOp) -> RunResult<()> {
    let arg = interp.pop();
    let result = eval_basic(interp, op, arg)?;
    interp.push(result)
}

/// Binary fast path: right argument on top, left below. Used by the
/// `basic-binopcall` node so no intermediate pair is built.
pub(crate) fn apply_basic_binary(interp: &mut Interpreter, op: BasicOp) -> RunResult<()> {
    let right = interp.pop();
    let left = interp.pop();
    let result = binary_values(interp, op, left, right)?;
    interp.push(result)
}

fn eval_basic(interp: &mut Interpreter, op: BasicOp, arg: Value) -> RunResult<Value> {
    if op.is_binary() {
        // Fault passthrough applies before pair splitting.
        if let Value::Fault(f) = arg {
            return Ok(Value::Fault(f));
        }
        if op.reduces() {
            return reduce_items(interp, op, arg);
        }
        return match split_pair(interp, arg) {
            Some((a, b)) => binary_values(interp, op, a, b),
            None => interp.fault("?op_parameter"),
        };
    }
    match op {
        BasicOp::Opposite | BasicOp::Abs | BasicOp::Not => pervade_unary(interp, op, arg),
        BasicOp::Tally => {
            let n = arg.tally(&interp.heap) as i64;
            arg.drop_with_heap(&mut interp.heap);
            Ok(Value::Int(n))
        }
        BasicOp::Valence => {
            let v = arg.valence(&interp.heap) as i64;
            arg.drop_with_heap(&mut interp.heap);
            Ok(Value::Int(v))
        }
        BasicOp::Shape => {
            let shape = arg.shape(&interp.heap);
            arg.drop_with_heap(&mut interp.heap);
            let items: Vec<Value> = shape.iter().map(|&e| Value::Int(e as i64)).collect();
            let len = items.len();
            make_array(&mut interp.heap, Shape::from_slice(&[len]), items)
        }
        BasicOp::First => nth_item(interp, arg, 0),
        BasicOp::Second => nth_item(interp, arg, 1),
        BasicOp::Third => nth_item(interp, arg, 2),
        BasicOp::Rest => {
            let n = arg.tally(&interp.heap);
            if n == 0 {
                arg.drop_with_heap(&mut interp.heap);
                return crate::arrays::empty_list(&mut interp.heap);
            }
            let items: Vec<Value> = (1..n).map(|i| item_of(&interp.heap, &arg, i)).collect();
            arg.drop_with_heap(&mut interp.heap);
            let len = items.len();
            make_array(&mut interp.heap, Shape::from_slice(&[len]), items)
        }
        BasicOp::Single => make_array(&mut interp.heap, Shape::new(), vec![arg]),
        BasicOp::List => {
            let n = arg.tally(&interp.heap);
            let items: Vec<Value> = (0..n).map(|i| item_of(&interp.heap, &arg, i)).collect();
            arg.drop_with_heap(&mut interp.heap);
            make_array(&mut interp.heap, Shape::from_slice(&[n]), items)
        }
        BasicOp::Link => {
            let n = arg.tally(&interp.heap);
            let mut items = Vec::new();
            for i in 0..n {
                let part = item_of(&interp.heap, &arg, i);
                let pn = part.tally(&interp.heap);
                if part.is_atom() {
                    items.push(part);
                } else {
                    for j in 0..pn {
                        items.push(item_of(&interp.heap, &part, j));
                    }
                    part.drop_with_heap(&mut interp.heap);
                }
            }
            arg.drop_with_heap(&mut interp.heap);
            let len = items.len();
            make_array(&mut interp.heap, Shape::from_slice(&[len]), items)
        }
        BasicOp::Reverse => {
            let n = arg.tally(&interp.heap);
            let mut items: Vec<Value> = (0..n).map(|i| item_of(&interp.heap, &arg, i)).collect();
            items.reverse();
            let shape = if arg.is_atom() {
                Shape::from_slice(&[n])
            } else {
                arg.shape(&interp.heap)
            };
            arg.drop_with_heap(&mut interp.heap);
            make_array(&mut interp.heap, shape, items)
        }
        BasicOp::Tell => iota(interp, arg, 0),
        BasicOp::Count => iota(interp, arg, 1),
        BasicOp::Place => place_like(interp, arg, PlaceKind::Place),
        BasicOp::Placeall => place_like(interp, arg, PlaceKind::PlaceAll),
        BasicOp::Deepplace => place_like(interp, arg, PlaceKind::DeepPlace),
        BasicOp::Update => update_like(interp, arg, PlaceKind::Place),
        BasicOp::Updateall => update_like(interp, arg, PlaceKind::PlaceAll),
        BasicOp::Deepupdate => update_like(interp, arg, PlaceKind::DeepPlace),
        BasicOp::Throw => {
            let id = match arg {
                Value::Fault(f) => f,
                Value::Phrase(p) => {
                    let text = interp.interns.phrase_text(p).to_owned();
                    interp.interns.fault(&text)
                }
                other => {
                    let text = value_as_text(interp, &other);
                    other.drop_with_heap(&mut interp.heap);
                    interp.interns.fault(&text)
                }
            };
            Err(RunError::Fault(id))
        }
        BasicOp::Settrigger => {
            let old = interp.triggered;
            match arg.as_bool() {
                Some(flag) => {
                    interp.triggered = flag;
                    Ok(Value::Bool(old))
                }
                None => {
                    arg.drop_with_heap(&mut interp.heap);
                    interp.fault("?settrigger expects a truth-value")
                }
            }
        }
        BasicOp::Execute => {
            let text = value_as_text(interp, &arg);
            arg.drop_with_heap(&mut interp.heap);
            interp.execute_text(&text)
        }
        // Binary-only ops are handled above; reaching here is a dispatch bug.
        _ => Err(RunError::Fatal(format!("unary dispatch missing for {op}"))),
    }
}

/// Kinds of placement delegating to the single engine in `insel`.
enum PlaceKind {
    Place,
    PlaceAll,
    DeepPlace,
}

/// `place`, `placeall` and `deepplace`: argument is `[[X, Addr], A]`.
fn place_like(interp: &mut Interpreter, arg: Value, kind: PlaceKind) -> RunResult<Value> {
    if let Value::Fault(f) = arg {
        return Ok(Value::Fault(f));
    }
    let Some((x_addr, target)) = split_pair(interp, arg) else {
        return interp.fault("?argument of place must be a pair");
    };
    let Some((x, addr)) = split_pair(interp, x_addr) else {
        target.drop_with_heap(&mut interp.heap);
        return interp.fault("?first argument of place must be a pair");
    };
    let (result, _changed) = match kind {
        PlaceKind::Place => insel::place(interp, target, addr, x)?,
        PlaceKind::PlaceAll => insel::place_all(interp, target, addr, x)?,
        PlaceKind::DeepPlace => insel::deep_place(interp, target, addr, x)?,
    };
    Ok(result)
}

/// `update`, `updateall` and `deepupdate`: argument is `[Nm, I, A]` where
/// `Nm` names a variable. Mirrors the indexed-assignment notations.
fn update_like(interp: &mut Interpreter, arg: Value, kind: PlaceKind) -> RunResult<Value> {
    if arg.tally(&interp.heap) != 3 || arg.is_atom() {
        arg.drop_with_heap(&mut interp.heap);
        return interp.fault("?bad parameter list in update");
    }
    let name = item_of(&interp.heap, &arg, 0);
    let addr = item_of(&interp.heap, &arg, 1);
    let x = item_of(&interp.heap, &arg, 2);
    arg.drop_with_heap(&mut interp.heap);
    let phrase = match name {
        Value::Phrase(p) => p,
        other => {
            other.drop_with_heap(&mut interp.heap);
            addr.drop_with_heap(&mut interp.heap);
            x.drop_with_heap(&mut interp.heap);
            return interp.fault("?invalid name");
        }
    };
    let kind_fn = match kind {
        PlaceKind::Place => insel::place,
        PlaceKind::PlaceAll => insel::place_all,
        PlaceKind::DeepPlace => insel::deep_place,
    };
    interp.update_variable(phrase, addr, x, kind_fn)
}

fn nth_item(interp: &mut Interpreter, arg: Value, i: usize) -> RunResult<Value> {
    if let Value::Fault(f) = arg {
        return Ok(Value::Fault(f));
    }
    if arg.tally(&interp.heap) > i {
        let item = item_of(&interp.heap, &arg, i);
        arg.drop_with_heap(&mut interp.heap);
        Ok(item)
    } else {
        arg.drop_with_heap(&mut interp.heap);
        interp.fault("?address")
    }
}

fn iota(interp: &mut Interpreter, arg: Value, base: i64) -> RunResult<Value> {
    match arg.as_int() {
        Some(n) if n >= 0 => {
            let items: Vec<Value> = (0..n).map(|i| Value::Int(i + base)).collect();
            make_array(&mut interp.heap, Shape::from_slice(&[n as usize]), items)
        }
        _ => {
            arg.drop_with_heap(&mut interp.heap);
            interp.fault("?not a number")
        }
    }
}

/// Reduction form of the associative binaries: `+ [1,2,3]` sums the items.
fn reduce_items(interp: &mut Interpreter, op: BasicOp, arg: Value) -> RunResult<Value> {
    let n = arg.tally(&interp.heap);
    if n == 0 {
        arg.drop_with_heap(&mut interp.heap);
        let identity = match op {
            BasicOp::Plus => Value::Int(0),
            BasicOp::Times => Value::Int(1),
            BasicOp::And => Value::Bool(true),
            BasicOp::Or => Value::Bool(false),
            _ => return interp.fault("?empty"),
        };
        return Ok(identity);
    }
    let mut acc = item_of(&interp.heap, &arg, 0);
    for i in 1..n {
        let next = item_of(&interp.heap, &arg, i);
        acc = binary_values(interp, op, acc, next)?;
    }
    arg.drop_with_heap(&mut interp.heap);
    Ok(acc)
}

/// Binary application with pervasive distribution where the op pervades.
fn binary_values(interp: &mut Interpreter, op: BasicOp, left: Value, right: Value) -> RunResult<Value> {
    match op {
        BasicOp::Equal => {
            let eq = values_equal(&left, &right, &interp.heap);
            left.drop_with_heap(&mut interp.heap);
            right.drop_with_heap(&mut interp.heap);
            Ok(Value::Bool(eq))
        }
        BasicOp::Unequal => {
            let eq = values_equal(&left, &right, &interp.heap);
            left.drop_with_heap(&mut interp.heap);
            right.drop_with_heap(&mut interp.heap);
            Ok(Value::Bool(!eq))
        }
        BasicOp::Pair => {
            let shape = Shape::from_slice(&[2]);
            make_array(&mut interp.heap, shape, vec![left, right])
        }
        BasicOp::Reshape => reshape(interp, left, right),
        BasicOp::Pick => insel::pick(interp, right, left),
        BasicOp::Choose => insel::choose(interp, right, left),
        BasicOp::Reach => insel::reach(interp, right, left),
        _ => pervade_binary(interp, op, left, right),
    }
}

fn pervade_binary(interp: &mut Interpreter, op: BasicOp, left: Value, right: Value) -> RunResult<Value> {
    // fault in, fault out
    if let Value::Fault(f) = left {
        right.drop_with_heap(&mut interp.heap);
        return Ok(Value::Fault(f));
    }
    if let Value::Fault(f) = right {
        left.drop_with_heap(&mut interp.heap);
        return Ok(Value::Fault(f));
    }
    if left.is_atom() && right.is_atom() {
        return scalar_binary(interp, op, left, right);
    }
    let ln = left.tally(&interp.heap);
    let rn = right.tally(&interp.heap);
    let (count, shape) = if left.is_atom() {
        (rn, right.shape(&interp.heap))
    } else if right.is_atom() {
        (ln, left.shape(&interp.heap))
    } else if left.shape(&interp.heap) == right.shape(&interp.heap) {
        (ln, left.shape(&interp.heap))
    } else {
        left.drop_with_heap(&mut interp.heap);
        right.drop_with_heap(&mut interp.heap);
        return interp.fault("?A");
    };
    let mut items = Vec::with_capacity(count);
    for i in 0..count {
        let a = if left.is_atom() {
            left.clone_with_heap(&interp.heap)
        } else {
            item_of(&interp.heap, &left, i)
        };
        let b = if right.is_atom() {
            right.clone_with_heap(&interp.heap)
        } else {
            item_of(&interp.heap, &right, i)
        };
        items.push(pervade_binary(interp, op, a, b)?);
    }
    left.drop_with_heap(&mut interp.heap);
    right.drop_with_heap(&mut interp.heap);
    make_array(&mut interp.heap, shape, items)
}

fn scalar_binary(interp: &mut Interpreter, op: BasicOp, left: Value, right: Value) -> RunResult<Value> {
    use Value::{Bool, Char, Int, Real};
    let out = match (op, &left, &right) {
        (BasicOp::Plus, Int(a), Int(b)) => match a.checked_add(*b) {
            Some(n) => Int(n),
            None => Real(*a as f64 + *b as f64),
        },
        (BasicOp::Minus, Int(a), Int(b)) => match a.checked_sub(*b) {
            Some(n) => Int(n),
            None => Real(*a as f64 - *b as f64),
        },
        (BasicOp::Times, Int(a), Int(b)) => match a.checked_mul(*b) {
            Some(n) => Int(n),
            None => Real(*a as f64 * *b as f64),
        },
        (BasicOp::Mod, Int(a), Int(b)) => {
            if *b == 0 {
                return interp.fault("?division by zero");
            }
            Int(a.rem_euclid(*b))
        }
        (BasicOp::Min, Int(a), Int(b)) => Int(*a.min(b)),
        (BasicOp::Max, Int(a), Int(b)) => Int(*a.max(b)),
        (BasicOp::Divide, _, _) => match (numeric(&left), numeric(&right)) {
            (Some(a), Some(b)) => {
                if b == 0.0 {
                    return interp.fault("?division by zero");
                }
                Real(a / b)
            }
            _ => return interp.fault("?A"),
        },
        (BasicOp::Plus | BasicOp::Minus | BasicOp::Times | BasicOp::Mod | BasicOp::Min | BasicOp::Max, _, _) => {
            match (numeric(&left), numeric(&right)) {
                (Some(a), Some(b)) => match op {
                    BasicOp::Plus => Real(a + b),
                    BasicOp::Minus => Real(a - b),
                    BasicOp::Times => Real(a * b),
                    BasicOp::Mod => Real(a.rem_euclid(b)),
                    BasicOp::Min => Real(a.min(b)),
                    BasicOp::Max => Real(a.max(b)),
                    _ => unreachable!(),
                },
                _ => return interp.fault("?A"),
            }
        }
        (BasicOp::Lt | BasicOp::Lte | BasicOp::Gt | BasicOp::Gte, _, _) => {
            let ord = match (&left, &right) {
                (Char(a), Char(b)) => a.partial_cmp(b),
                _ => match (numeric(&left), numeric(&right)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            let Some(ord) = ord else {
                return interp.fault("?A");
            };
            Bool(match op {
                BasicOp::Lt => ord.is_lt(),
                BasicOp::Lte => ord.is_le(),
                BasicOp::Gt => ord.is_gt(),
                BasicOp::Gte => ord.is_ge(),
                _ => unreachable!(),
            })
        }
        (BasicOp::And, Bool(a), Bool(b)) => Bool(*a && *b),
        (BasicOp::Or, Bool(a), Bool(b)) => Bool(*a || *b),
        _ => return interp.fault("?A"),
    };
    Ok(out)
}

fn pervade_unary(interp: &mut Interpreter, op: BasicOp, arg: Value) -> RunResult<Value> {
    if let Value::Fault(f) = arg {
        return Ok(Value::Fault(f));
    }
    if arg.is_atom() {
        let out = match (op, &arg) {
            (BasicOp::Opposite, Value::Int(n)) => Value::Int(-n),
            (BasicOp::Opposite, Value::Real(r)) => Value::Real(-r),
            (BasicOp::Abs, Value::Int(n)) => Value::Int(n.abs()),
            (BasicOp::Abs, Value::Real(r)) => Value::Real(r.abs()),
            (BasicOp::Not, Value::Bool(b)) => Value::Bool(!b),
            _ => return interp.fault("?A"),
        };
        return Ok(out);
    }
    let n = arg.tally(&interp.heap);
    let shape = arg.shape(&interp.heap);
    let mut items = Vec::with_capacity(n);
    for i in 0..n {
        let item = item_of(&interp.heap, &arg, i);
        items.push(pervade_unary(interp, op, item)?);
    }
    arg.drop_with_heap(&mut interp.heap);
    make_array(&mut interp.heap, shape, items)
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Int(n) => Some(*n as f64),
        Value::Real(r) => Some(*r),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        _ => None,
    }
}

/// `shape reshape data`: fill the new shape by cycling the data's items.
fn reshape(interp: &mut Interpreter, spec: Value, data: Value) -> RunResult<Value> {
    let sn = spec.tally(&interp.heap);
    let mut shape = Shape::new();
    for i in 0..sn {
        let item = item_of(&interp.heap, &spec, i);
        match item.as_int() {
            Some(e) if e >= 0 => shape.push(e as usize),
            _ => {
                item.drop_with_heap(&mut interp.heap);
                spec.drop_with_heap(&mut interp.heap);
                data.drop_with_heap(&mut interp.heap);
                return interp.fault("?shape");
            }
        }
    }
    spec.drop_with_heap(&mut interp.heap);
    let dn = data.tally(&interp.heap);
    let total: usize = shape.iter().product();
    if dn == 0 && total > 0 {
        data.drop_with_heap(&mut interp.heap);
        return interp.fault("?empty");
    }
    let mut items = Vec::with_capacity(total);
    for i in 0..total {
        items.push(item_of(&interp.heap, &data, i % dn));
    }
    data.drop_with_heap(&mut interp.heap);
    make_array(&mut interp.heap, shape, items)
}

/// Renders a char-list or phrase value as text for `throw` and `execute`.
fn value_as_text(interp: &Interpreter, v: &Value) -> String {
    match v {
        Value::Phrase(p) => interp.interns.phrase_text(*p).to_owned(),
        Value::Fault(f) => interp.interns.fault_text(*f).to_owned(),
        Value::Char(c) => c.to_string(),
        Value::Ref(id) => match interp.heap.get(*id) {
            crate::arrays::ArrayData::Chars(chars) => chars.items.iter().collect(),
            _ => String::new(),
        },
        _ => String::new(),
    }
}

/// Application of a basic transformer: operation value on top of the stack,
/// array argument below it; the result replaces both.
pub(crate) fn apply_basic_tr(interp: &mut Interpreter, tr: BasicTr) -> RunResult<()> {
    let op = interp.pop();
    let arg = interp.pop();
    match tr {
        BasicTr::Each => {
            let n = arg.tally(&interp.heap);
            let shape = if arg.is_atom() {
                Shape::new()
            } else {
                arg.shape(&interp.heap)
            };
            let mut items = Vec::with_capacity(n);
            for i in 0..n {
                let item = item_of(&interp.heap, &arg, i);
                interp.push(item)?;
                let op_i = op.clone_with_heap(&interp.heap);
                interp.apply(op_i)?;
                items.push(interp.pop());
            }
            arg.drop_with_heap(&mut interp.heap);
            op.drop_with_heap(&mut interp.heap);
            let result = make_array(&mut interp.heap, shape, items)?;
            interp.push(result)
        }
        BasicTr::Eachleft | BasicTr::Eachright => {
            let Some((first, second)) = split_pair(interp, arg) else {
                op.drop_with_heap(&mut interp.heap);
                let fault = interp.fault("?op_parameter")?;
                return interp.push(fault);
            };
            let (varying, fixed, left_varies) = if tr == BasicTr::Eachleft {
                (first, second, true)
            } else {
                (second, first, false)
            };
            let n = varying.tally(&interp.heap);
            let shape = if varying.is_atom() {
                Shape::new()
            } else {
                varying.shape(&interp.heap)
            };
            let mut items = Vec::with_capacity(n);
            for i in 0..n {
                let item = item_of(&interp.heap, &varying, i);
                let partner = fixed.clone_with_heap(&interp.heap);
                let (a, b) = if left_varies { (item, partner) } else { (partner, item) };
                let pair = make_array(&mut interp.heap, Shape::from_slice(&[2]), vec![a, b])?;
                interp.push(pair)?;
                let op_i = op.clone_with_heap(&interp.heap);
                interp.apply(op_i)?;
                items.push(interp.pop());
            }
            varying.drop_with_heap(&mut interp.heap);
            fixed.drop_with_heap(&mut interp.heap);
            op.drop_with_heap(&mut interp.heap);
            let result = make_array(&mut interp.heap, shape, items)?;
            interp.push(result)
        }
        BasicTr::Catch => {
            let stack_height = interp.stack_depth();
            let call_depth = interp.call_stack.len();
            interp.push(arg)?;
            match interp.apply(op) {
                Ok(()) => Ok(()),
                Err(RunError::Fault(f)) => {
                    interp.unwind_to(stack_height, call_depth);
                    interp.push(Value::Fault(f))
                }
                Err(other) => Err(other),
            }
        }
    }
}
