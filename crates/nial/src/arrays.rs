//! Array payloads stored in the heap arena.
//!
//! Homogeneous kinds pack items by value; `Mixed` stores owned `Value`s
//! (references for arena items). Two extra payloads exist only for the
//! operation category at runtime: `Closure` (an operation captured with its
//! lexical environment) and `OpList` (an atlas or composition rewritten with
//! closed components). Neither is observable as data.
//!
//! The canonicalization rule lives here: [`make_array`] is the only
//! constructor for containers, and it implodes a would-be mixed array whose
//! items are all atoms of one packed kind. No live mixed array that could be
//! homogeneous ever exists.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    error::RunResult,
    heap::{ArrayId, Heap},
    symtab::SymtabId,
    value::{Kind, Value},
};

/// Extent list of an array. Valence is the length, tally the product.
pub type Shape = SmallVec<[usize; 4]>;

/// Product of the extents; the tally of an array with this shape.
#[must_use]
pub fn tally_of(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// A homogeneous array: shape plus items packed by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatArray<T> {
    pub shape: Shape,
    pub items: Vec<T>,
}

impl<T> FlatArray<T> {
    pub fn new(shape: Shape, items: Vec<T>) -> Self {
        debug_assert_eq!(tally_of(&shape), items.len(), "tally must equal product of shape");
        Self { shape, items }
    }
}

/// A heterogeneous container holding owned value references.
#[derive(Debug, Serialize, Deserialize)]
pub struct MixedArray {
    pub shape: Shape,
    pub items: Vec<Value>,
}

/// An operation closed over the lexical environment of a transformer call.
///
/// `sps` snapshots the activation stack pointer of each symbol table in
/// `env`; applying the closure temporarily reinstalls them.
#[derive(Debug, Serialize, Deserialize)]
pub struct Closure {
    /// The closed operation: a tree, or a nested closure/op-list reference.
    pub op: Value,
    /// Captured environment, innermost first.
    pub env: Vec<SymtabId>,
    /// Captured activation stack pointers, parallel to `env`.
    pub sps: Vec<i64>,
}

/// Whether an [`OpList`] applies its items as an atlas or a composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpListKind {
    /// `[f, g, ...] A = [f A, g A, ...]`, items applied left to right.
    Atlas,
    /// Items applied right to left to one argument.
    Composition,
}

/// An atlas or composition whose components were individually closed.
///
/// Built by closure construction when only some components of an atlas or
/// composition need capturing; the others stay as bare trees.
#[derive(Debug, Serialize, Deserialize)]
pub struct OpList {
    pub kind: OpListKind,
    pub items: Vec<Value>,
}

/// Payload of one heap arena slot.
#[derive(Debug, Serialize, Deserialize)]
pub enum ArrayData {
    Bools(FlatArray<bool>),
    Ints(FlatArray<i64>),
    Reals(FlatArray<f64>),
    Chars(FlatArray<char>),
    Mixed(MixedArray),
    Closure(Closure),
    OpList(OpList),
}

impl ArrayData {
    /// The kind of this array. Closures and op-lists report `mixed`; they
    /// are never observable as data.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Bools(_) => Kind::Boolean,
            Self::Ints(_) => Kind::Integer,
            Self::Reals(_) => Kind::Real,
            Self::Chars(_) => Kind::Char,
            Self::Mixed(_) | Self::Closure(_) | Self::OpList(_) => Kind::Mixed,
        }
    }

    /// The shape; empty for closures and op-lists.
    #[must_use]
    pub fn shape(&self) -> &Shape {
        static EMPTY: Shape = Shape::new_const();
        match self {
            Self::Bools(a) => &a.shape,
            Self::Ints(a) => &a.shape,
            Self::Reals(a) => &a.shape,
            Self::Chars(a) => &a.shape,
            Self::Mixed(a) => &a.shape,
            Self::Closure(_) | Self::OpList(_) => &EMPTY,
        }
    }

    #[must_use]
    pub fn valence(&self) -> usize {
        self.shape().len()
    }

    #[must_use]
    pub fn tally(&self) -> usize {
        match self {
            Self::Bools(a) => a.items.len(),
            Self::Ints(a) => a.items.len(),
            Self::Reals(a) => a.items.len(),
            Self::Chars(a) => a.items.len(),
            Self::Mixed(a) => a.items.len(),
            Self::Closure(_) | Self::OpList(_) => 1,
        }
    }

    /// Static variant name for heap statistics.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Bools(_) => "Bools",
            Self::Ints(_) => "Ints",
            Self::Reals(_) => "Reals",
            Self::Chars(_) => "Chars",
            Self::Mixed(_) => "Mixed",
            Self::Closure(_) => "Closure",
            Self::OpList(_) => "OpList",
        }
    }

    /// Approximate storage in words, used for heap size accounting.
    #[must_use]
    pub fn estimate_words(&self) -> usize {
        let per_item = match self {
            Self::Bools(_) | Self::Chars(_) => 1,
            Self::Ints(_) | Self::Reals(_) => 1,
            Self::Mixed(_) => 2,
            Self::Closure(_) | Self::OpList(_) => 4,
        };
        2 + self.valence() + self.tally() * per_item
    }

    /// Collects the arena ids directly owned by this payload, for recursive
    /// release when the refcount reaches zero.
    pub fn child_ids(&self, out: &mut Vec<ArrayId>) {
        match self {
            Self::Mixed(mixed) => {
                out.extend(mixed.items.iter().filter_map(Value::ref_id));
            }
            Self::Closure(closure) => {
                out.extend(closure.op.ref_id());
            }
            Self::OpList(list) => {
                out.extend(list.items.iter().filter_map(Value::ref_id));
            }
            _ => {}
        }
    }

    /// Fetches the item at linear index `idx` as a value, bumping the
    /// refcount for references held in mixed arrays.
    ///
    /// # Panics
    /// Panics on closures and op-lists, which have no items.
    pub fn item(&self, idx: usize, heap: &Heap) -> Value {
        match self {
            Self::Bools(a) => Value::Bool(a.items[idx]),
            Self::Ints(a) => Value::Int(a.items[idx]),
            Self::Reals(a) => Value::Real(a.items[idx]),
            Self::Chars(a) => Value::Char(a.items[idx]),
            Self::Mixed(a) => a.items[idx].clone_with_heap(heap),
            Self::Closure(_) | Self::OpList(_) => panic!("ArrayData::item: no items in operation payloads"),
        }
    }
}

/// The canonical container constructor.
///
/// Takes ownership of `items` (their reference counts transfer into the
/// container). Canonicalization applies on the way in:
/// - a rank-0 container holding one atom *is* that atom (`single A == A`);
/// - items that are all atoms of one packed kind are imploded into a
///   homogeneous array;
/// - everything else allocates a mixed array.
pub fn make_array(heap: &mut Heap, shape: Shape, items: Vec<Value>) -> RunResult<Value> {
    debug_assert_eq!(tally_of(&shape), items.len(), "tally must equal product of shape");
    if shape.is_empty() {
        let mut items = items;
        let item = items.pop().expect("rank-0 container holds one item");
        if item.is_atom() {
            return Ok(item);
        }
        let id = heap.allocate(ArrayData::Mixed(MixedArray {
            shape,
            items: vec![item],
        }))?;
        return Ok(Value::Ref(id));
    }
    let data = match implode_kind(&items) {
        Some(Kind::Boolean) => ArrayData::Bools(FlatArray::new(
            shape,
            items.iter().map(|v| v.as_bool().expect("checked boolean atom")).collect(),
        )),
        Some(Kind::Integer) => ArrayData::Ints(FlatArray::new(
            shape,
            items.iter().map(|v| v.as_int().expect("checked integer atom")).collect(),
        )),
        Some(Kind::Real) => ArrayData::Reals(FlatArray::new(
            shape,
            items
                .iter()
                .map(|v| match v {
                    Value::Real(r) => *r,
                    _ => unreachable!("checked real atom"),
                })
                .collect(),
        )),
        Some(Kind::Char) => ArrayData::Chars(FlatArray::new(
            shape,
            items
                .iter()
                .map(|v| match v {
                    Value::Char(c) => *c,
                    _ => unreachable!("checked char atom"),
                })
                .collect(),
        )),
        _ => ArrayData::Mixed(MixedArray { shape, items }),
    };
    Ok(Value::Ref(heap.allocate(data)?))
}

/// Allocates a character list from a string. The empty string yields the
/// empty list (a mixed array with tally 0).
pub fn make_string(heap: &mut Heap, text: &str) -> RunResult<Value> {
    let items: Vec<char> = text.chars().collect();
    if items.is_empty() {
        return empty_list(heap);
    }
    let shape = Shape::from_slice(&[items.len()]);
    Ok(Value::Ref(heap.allocate(ArrayData::Chars(FlatArray::new(shape, items)))?))
}

/// Allocates the empty list (tally 0, valence 1).
pub fn empty_list(heap: &mut Heap) -> RunResult<Value> {
    let id = heap.allocate(ArrayData::Mixed(MixedArray {
        shape: Shape::from_slice(&[0]),
        items: Vec::new(),
    }))?;
    Ok(Value::Ref(id))
}

/// Determines whether all items are atoms of one packed kind.
///
/// Returns that kind when imploding applies, `None` otherwise. An empty item
/// list never implodes (the empty list is mixed).
fn implode_kind(items: &[Value]) -> Option<Kind> {
    let first = items.first()?;
    let kind = match first {
        Value::Bool(_) => Kind::Boolean,
        Value::Int(_) => Kind::Integer,
        Value::Real(_) => Kind::Real,
        Value::Char(_) => Kind::Char,
        _ => return None,
    };
    let uniform = items.iter().all(|v| match (kind, v) {
        (Kind::Boolean, Value::Bool(_)) => true,
        (Kind::Integer, Value::Int(_)) => true,
        (Kind::Real, Value::Real(_)) => true,
        (Kind::Char, Value::Char(_)) => true,
        _ => false,
    });
    uniform.then_some(kind)
}

/// Re-encodes a packed array as a mixed array of atoms, for updates whose
/// replacement item does not match the packed kind.
#[must_use]
pub fn explode(data: &ArrayData) -> MixedArray {
    match data {
        ArrayData::Bools(a) => MixedArray {
            shape: a.shape.clone(),
            items: a.items.iter().map(|&b| Value::Bool(b)).collect(),
        },
        ArrayData::Ints(a) => MixedArray {
            shape: a.shape.clone(),
            items: a.items.iter().map(|&n| Value::Int(n)).collect(),
        },
        ArrayData::Reals(a) => MixedArray {
            shape: a.shape.clone(),
            items: a.items.iter().map(|&r| Value::Real(r)).collect(),
        },
        ArrayData::Chars(a) => MixedArray {
            shape: a.shape.clone(),
            items: a.items.iter().map(|&c| Value::Char(c)).collect(),
        },
        _ => panic!("explode: payload is not packed"),
    }
}

/// Checks a mixed payload for implode opportunity after an in-place update
/// and re-encodes it when every item is an atom of one packed kind.
///
/// Returns the replacement payload, or `None` when the mixed form is already
/// canonical.
#[must_use]
pub fn reimplode(mixed: &MixedArray) -> Option<ArrayData> {
    if mixed.items.is_empty() {
        return None;
    }
    let kind = implode_kind(&mixed.items)?;
    let shape = mixed.shape.clone();
    Some(match kind {
        Kind::Boolean => ArrayData::Bools(FlatArray::new(
            shape,
            mixed.items.iter().map(|v| v.as_bool().expect("checked")).collect(),
        )),
        Kind::Integer => ArrayData::Ints(FlatArray::new(
            shape,
            mixed.items.iter().map(|v| v.as_int().expect("checked")).collect(),
        )),
        Kind::Real => ArrayData::Reals(FlatArray::new(
            shape,
            mixed
                .items
                .iter()
                .map(|v| match v {
                    Value::Real(r) => *r,
                    _ => unreachable!(),
                })
                .collect(),
        )),
        Kind::Char => ArrayData::Chars(FlatArray::new(
            shape,
            mixed
                .items
                .iter()
                .map(|v| match v {
                    Value::Char(c) => *c,
                    _ => unreachable!(),
                })
                .collect(),
        )),
        _ => unreachable!("implode_kind only returns packed kinds"),
    })
}

