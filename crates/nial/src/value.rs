//! Runtime values: atoms held inline, arrays held in the heap arena.
//!
//! Every value in the language is an array. Atoms (rank-0 homogeneous
//! scalars) are represented as immediate variants with no heap identity;
//! everything with items lives in the arena and is referenced through
//! `Ref`. Quoted programs are `Tree` — parse trees are permanent, so no
//! reference counting applies to them.
//!
//! NOTE: `Clone` is intentionally NOT derived. Use `clone_with_heap()` so
//! reference counts stay correct; a plain clone of a `Ref` would alias the
//! array without owning it.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::{
    arrays::ArrayData,
    heap::{ArrayId, Heap},
    intern::{FaultId, Interns, PhraseId},
    parsetree::TreeId,
};

/// The closed set of array kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    Boolean,
    Integer,
    Real,
    Char,
    Phrase,
    Fault,
    Mixed,
}

/// A runtime value: an atom held inline or a reference into the heap arena.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Value {
    Bool(bool),
    Int(i64),
    Real(f64),
    Char(char),
    /// An interned string atom; equality is identity of the id.
    Phrase(PhraseId),
    /// An interned error atom; equality is identity of the id.
    Fault(FaultId),
    /// A quoted program. Parse trees are permanent, so this carries no count.
    Tree(TreeId),
    /// A non-atomic array owned by the heap arena.
    Ref(ArrayId),
    /// Sentinel proving this value was cleaned up via `drop_with_heap`.
    /// Only exists when `ref-count-panic` is enabled.
    #[cfg(feature = "ref-count-panic")]
    Dereferenced,
}

/// Drop implementation that panics if a `Ref` is dropped without
/// `drop_with_heap`, to catch reference counting bugs in tests.
#[cfg(feature = "ref-count-panic")]
impl Drop for Value {
    fn drop(&mut self) {
        if let Self::Ref(id) = self {
            panic!("Value::Ref({id:?}) dropped without drop_with_heap() - refcount bug");
        }
    }
}

impl Value {
    /// The rank of the value: 0 for atoms, shape length for arena arrays.
    pub fn valence(&self, heap: &Heap) -> usize {
        match self {
            Self::Ref(id) => heap.get(*id).valence(),
            _ => 0,
        }
    }

    /// Total item count; 1 for atoms.
    pub fn tally(&self, heap: &Heap) -> usize {
        match self {
            Self::Ref(id) => heap.get(*id).tally(),
            _ => 1,
        }
    }

    /// The shape as an extent list; empty for atoms.
    pub fn shape(&self, heap: &Heap) -> crate::arrays::Shape {
        match self {
            Self::Ref(id) => heap.get(*id).shape().clone(),
            _ => crate::arrays::Shape::new(),
        }
    }

    /// True for rank-0 homogeneous scalars (everything except arena arrays
    /// and quoted programs).
    #[must_use]
    pub fn is_atom(&self) -> bool {
        !matches!(self, Self::Ref(_) | Self::Tree(_))
    }

    /// The arena id, when this value is heap-allocated.
    #[must_use]
    pub fn ref_id(&self) -> Option<ArrayId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// The boolean payload of a boolean atom.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer payload of an integer atom.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Duplicates this value, incrementing the refcount for arena arrays.
    pub fn clone_with_heap(&self, heap: &Heap) -> Self {
        match self {
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(n) => Self::Int(*n),
            Self::Real(r) => Self::Real(*r),
            Self::Char(c) => Self::Char(*c),
            Self::Phrase(p) => Self::Phrase(*p),
            Self::Fault(f) => Self::Fault(*f),
            Self::Tree(t) => Self::Tree(*t),
            Self::Ref(id) => {
                heap.inc_ref(*id);
                Self::Ref(*id)
            }
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => panic!("cannot clone dereferenced value"),
        }
    }

    /// Releases this value, decrementing the refcount for arena arrays.
    #[cfg(not(feature = "ref-count-panic"))]
    pub fn drop_with_heap(self, heap: &mut Heap) {
        if let Self::Ref(id) = self {
            heap.dec_ref(id);
        }
    }

    /// With `ref-count-panic` enabled, `Ref` variants are replaced with
    /// `Dereferenced` and the original is forgotten so the Drop impl does
    /// not panic on a correctly released value.
    #[cfg(feature = "ref-count-panic")]
    pub fn drop_with_heap(mut self, heap: &mut Heap) {
        let old = std::mem::replace(&mut self, Self::Dereferenced);
        if let Self::Ref(id) = &old {
            heap.dec_ref(*id);
            std::mem::forget(old);
        }
    }
}

/// Structural equality used by `caseexpr` and the `equal` primitive.
///
/// Atoms compare by payload within one kind; phrases and faults compare by
/// interned identity. Arrays compare kind, shape and items. The
/// canonicalization rule guarantees a packed array never has to be compared
/// against an equal-content mixed one.
pub(crate) fn values_equal(a: &Value, b: &Value, heap: &Heap) -> bool {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Real(x), Value::Real(y)) => x == y,
        (Value::Char(x), Value::Char(y)) => x == y,
        (Value::Phrase(x), Value::Phrase(y)) => x == y,
        (Value::Fault(x), Value::Fault(y)) => x == y,
        (Value::Tree(x), Value::Tree(y)) => x == y,
        (Value::Ref(x), Value::Ref(y)) => {
            if x == y {
                return true;
            }
            arrays_equal(heap.get(*x), heap.get(*y), heap)
        }
        _ => false,
    }
}

fn arrays_equal(a: &ArrayData, b: &ArrayData, heap: &Heap) -> bool {
    if a.kind() != b.kind() || a.shape() != b.shape() {
        return false;
    }
    match (a, b) {
        (ArrayData::Bools(x), ArrayData::Bools(y)) => x.items == y.items,
        (ArrayData::Ints(x), ArrayData::Ints(y)) => x.items == y.items,
        (ArrayData::Reals(x), ArrayData::Reals(y)) => x.items == y.items,
        (ArrayData::Chars(x), ArrayData::Chars(y)) => x.items == y.items,
        (ArrayData::Mixed(x), ArrayData::Mixed(y)) => {
            x.items.len() == y.items.len()
                && x.items
                    .iter()
                    .zip(y.items.iter())
                    .all(|(i, j)| values_equal(i, j, heap))
        }
        _ => false,
    }
}

/// Renders a value as text for top-level display.
///
/// Atoms render as their literal forms (`l`/`o` for truth values, backquoted
/// chars, `?`-prefixed faults); character lists render as quoted strings;
/// lists render as space-separated items with nested arrays bracketed; higher
/// valence arrays render as `shape reshape [items]`.
pub(crate) fn format_value(value: &Value, heap: &Heap, interns: &Interns) -> String {
    let mut out = String::new();
    write_value(value, heap, interns, &mut out, true);
    out
}

fn write_value(value: &Value, heap: &Heap, interns: &Interns, out: &mut String, top: bool) {
    match value {
        Value::Bool(b) => out.push(if *b { 'l' } else { 'o' }),
        Value::Int(n) => {
            let _ = write!(out, "{n}");
        }
        Value::Real(r) => write_real(*r, out),
        Value::Char(c) => {
            let _ = write!(out, "`{c}");
        }
        Value::Phrase(p) => {
            let _ = write!(out, "\"{}", interns.phrase_text(*p));
        }
        Value::Fault(f) => {
            let _ = write!(out, "{}", interns.fault_text(*f));
        }
        Value::Tree(_) => out.push_str("!<parse tree>"),
        Value::Ref(id) => write_array(heap.get(*id), heap, interns, out, top),
        #[cfg(feature = "ref-count-panic")]
        Value::Dereferenced => out.push_str("<dereferenced>"),
    }
}

fn write_real(r: f64, out: &mut String) {
    if r.is_finite() && r.fract() == 0.0 && r.abs() < 1e15 {
        let _ = write!(out, "{r:.0}.");
    } else {
        let _ = write!(out, "{r}");
    }
}

fn write_array(data: &ArrayData, heap: &Heap, interns: &Interns, out: &mut String, top: bool) {
    if data.valence() > 1 {
        for extent in data.shape() {
            let _ = write!(out, "{extent} ");
        }
        out.push_str("reshape ");
    }
    match data {
        ArrayData::Chars(chars) => {
            out.push('\'');
            for &c in &chars.items {
                if c == '\'' {
                    out.push('\'');
                }
                out.push(c);
            }
            out.push('\'');
        }
        ArrayData::Bools(bits) => {
            for &b in &bits.items {
                out.push(if b { 'l' } else { 'o' });
            }
        }
        ArrayData::Ints(ints) => {
            write_items(ints.items.iter(), out, top, |n, out| {
                let _ = write!(out, "{n}");
            });
        }
        ArrayData::Reals(reals) => {
            write_items(reals.items.iter(), out, top, |r, out| write_real(*r, out));
        }
        ArrayData::Mixed(mixed) => {
            if mixed.items.is_empty() {
                out.push_str("Null");
                return;
            }
            let open = !top;
            if open {
                out.push('[');
            }
            for (i, item) in mixed.items.iter().enumerate() {
                if i > 0 {
                    out.push_str(if top { " " } else { "," });
                }
                write_value(item, heap, interns, out, false);
            }
            if open {
                out.push(']');
            }
        }
        ArrayData::Closure(_) | ArrayData::OpList(_) => out.push_str("<operation>"),
    }
}

fn write_items<T>(
    items: impl ExactSizeIterator<Item = T>,
    out: &mut String,
    top: bool,
    mut write_one: impl FnMut(T, &mut String),
) {
    let open = !top;
    if open {
        out.push('[');
    }
    let sep = if top { " " } else { "," };
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        write_one(item, out);
    }
    if open {
        out.push(']');
    }
}
