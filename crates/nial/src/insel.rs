//! Indexed selection and insertion: pick, reach, choose, slice and their
//! in-place update forms.
//!
//! All four notations share one engine. Addresses collapse to a linear index
//! by Horner evaluation over the target's shape; an out-of-range axis fails
//! the whole operation with the notation's fault (`?address`, `?path`,
//! `?addresses`, `?slice`).
//!
//! Updates are copy-on-write: a shared target is copied before mutation (the
//! only case where container identity changes), a packed target whose item
//! kind no longer matches is exploded to mixed, and every mixed result is
//! re-tested for implosion. Multi-address updates validate every address
//! before committing anything, and apply in address iteration order so later
//! writes to a cell win.

use crate::{
    arrays::{explode, make_array, reimplode, ArrayData, Shape},
    error::{RunError, RunResult},
    intern::NOEXPR,
    interp::Interpreter,
    parsetree::{Node, TreeId},
    primops::item_of,
    value::Value,
};

/// Which selection notation is being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Selection {
    /// `A @ I`
    Pick,
    /// `A @@ P`
    Reach,
    /// `A # I`
    Choose,
    /// `A | I`
    Slice,
}

impl Selection {
    fn fault_name(self) -> &'static str {
        match self {
            Self::Pick => "?address",
            Self::Reach => "?path",
            Self::Choose => "?addresses",
            Self::Slice => "?slice",
        }
    }
}

// ---- address handling ----------------------------------------------------

/// Converts an address value to its integer items.
/// Returns `None` for non-integer addresses.
fn address_to_ints(interp: &Interpreter, addr: &Value) -> Option<Vec<i64>> {
    match addr {
        Value::Int(n) => Some(vec![*n]),
        Value::Ref(id) => match interp.heap.get(*id) {
            ArrayData::Ints(ints) => Some(ints.items.clone()),
            ArrayData::Mixed(mixed) if mixed.items.is_empty() => Some(Vec::new()),
            _ => None,
        },
        _ => None,
    }
}

/// Resolves an integer address against a target: Horner evaluation of the
/// multi-axis address, bounds-checked per axis. Returns the linear index,
/// or `None` when the address is out of range or malformed.
///
/// A one-element address against a list uses the single index; an empty
/// address selects the item of a single (linear index 0).
fn linear_index(interp: &Interpreter, target: &Value, ints: &[i64]) -> Option<usize> {
    let va = target.valence(&interp.heap);
    if va != ints.len() {
        return None;
    }
    if va == 0 {
        return Some(0);
    }
    if va == 1 {
        let index = ints[0];
        if index < 0 || index as usize >= target.tally(&interp.heap) {
            return None;
        }
        return Some(index as usize);
    }
    let shape = target.shape(&interp.heap);
    let mut index: i64 = 0;
    for (axis, &i) in ints.iter().enumerate() {
        let extent = shape[axis] as i64;
        if i < 0 || i >= extent {
            return None;
        }
        index = index * extent + i;
    }
    Some(index as usize)
}

/// Picks one item; `None` means the address failed.
/// Consumes neither the target nor the address.
fn pick_core(interp: &Interpreter, target: &Value, addr: &Value) -> Option<Value> {
    let ints = address_to_ints(interp, addr)?;
    let index = linear_index(interp, target, &ints)?;
    if target.is_atom() {
        return Some(target.clone_with_heap(&interp.heap));
    }
    Some(item_of(&interp.heap, target, index))
}

// ---- selection -----------------------------------------------------------

/// `I pick A`: one item at an address matching the target's valence.
pub(crate) fn pick(interp: &mut Interpreter, target: Value, addr: Value) -> RunResult<Value> {
    let picked = pick_core(interp, &target, &addr);
    target.drop_with_heap(&mut interp.heap);
    addr.drop_with_heap(&mut interp.heap);
    match picked {
        Some(v) => Ok(v),
        None => interp.fault(Selection::Pick.fault_name()),
    }
}

/// `P reach A`: pick through nested items along a sequence of addresses.
pub(crate) fn reach(interp: &mut Interpreter, target: Value, path: Value) -> RunResult<Value> {
    let count = path.tally(&interp.heap);
    let mut current = target.clone_with_heap(&interp.heap);
    target.drop_with_heap(&mut interp.heap);
    for i in 0..count {
        let addr = item_of(&interp.heap, &path, i);
        let next = pick_core(interp, &current, &addr);
        addr.drop_with_heap(&mut interp.heap);
        current.drop_with_heap(&mut interp.heap);
        match next {
            Some(v) => current = v,
            None => {
                path.drop_with_heap(&mut interp.heap);
                return interp.fault(Selection::Reach.fault_name());
            }
        }
    }
    path.drop_with_heap(&mut interp.heap);
    Ok(current)
}

/// `I choose A`: an array of picked items with the shape of the address
/// array.
pub(crate) fn choose(interp: &mut Interpreter, target: Value, addrs: Value) -> RunResult<Value> {
    choose_with_fault(interp, target, addrs, Selection::Choose)
}

fn choose_with_fault(
    interp: &mut Interpreter,
    target: Value,
    addrs: Value,
    notation: Selection,
) -> RunResult<Value> {
    // An atomic address behaves as pick.
    if addrs.is_atom() {
        let picked = pick_core(interp, &target, &addrs);
        target.drop_with_heap(&mut interp.heap);
        addrs.drop_with_heap(&mut interp.heap);
        return match picked {
            Some(v) => Ok(v),
            None => interp.fault(notation.fault_name()),
        };
    }
    let count = addrs.tally(&interp.heap);
    let shape = addrs.shape(&interp.heap);
    let mut items = Vec::with_capacity(count);
    for i in 0..count {
        let addr = item_of(&interp.heap, &addrs, i);
        let picked = pick_core(interp, &target, &addr);
        addr.drop_with_heap(&mut interp.heap);
        match picked {
            Some(v) => items.push(v),
            None => {
                for item in items {
                    item.drop_with_heap(&mut interp.heap);
                }
                target.drop_with_heap(&mut interp.heap);
                addrs.drop_with_heap(&mut interp.heap);
                return interp.fault(notation.fault_name());
            }
        }
    }
    target.drop_with_heap(&mut interp.heap);
    addrs.drop_with_heap(&mut interp.heap);
    make_array(&mut interp.heap, shape, items)
}

/// Per-axis slice specification resolved to index lists.
///
/// The placeholder (`?noexpr`, from an empty list position) selects the
/// whole axis; an integer atom fixes the axis and drops it from the result
/// shape; an integer list keeps the axis with the listed indices.
fn slice_axes(interp: &mut Interpreter, target: &Value, spec: &Value) -> Option<Vec<(Vec<i64>, bool)>> {
    let va = target.valence(&interp.heap);
    if spec.tally(&interp.heap) != va {
        return None;
    }
    let shape = target.shape(&interp.heap);
    let mut axes = Vec::with_capacity(va);
    for axis in 0..va {
        let entry = if spec.is_atom() {
            spec.clone_with_heap(&interp.heap)
        } else {
            item_of(&interp.heap, spec, axis)
        };
        let resolved = match &entry {
            Value::Fault(f) if *f == NOEXPR => Some(((0..shape[axis] as i64).collect(), true)),
            Value::Int(i) => Some((vec![*i], false)),
            _ => address_to_ints(interp, &entry).map(|ints| (ints, true)),
        };
        entry.drop_with_heap(&mut interp.heap);
        match resolved {
            Some(axis_spec) => axes.push(axis_spec),
            None => return None,
        }
    }
    Some(axes)
}

/// Generates the addressed cells of a slice in row-major order, plus the
/// result shape (the extents of the kept axes).
fn slice_addresses(axes: &[(Vec<i64>, bool)]) -> (Shape, Vec<Vec<i64>>) {
    let mut shape = Shape::new();
    for (indices, keeps_axis) in axes {
        if *keeps_axis {
            shape.push(indices.len());
        }
    }
    let total: usize = axes.iter().map(|(ints, _)| ints.len()).product();
    let mut addresses = Vec::with_capacity(total);
    let mut odometer = vec![0usize; axes.len()];
    for _ in 0..total {
        let address: Vec<i64> = axes.iter().zip(&odometer).map(|((ints, _), &i)| ints[i]).collect();
        addresses.push(address);
        for axis in (0..axes.len()).rev() {
            odometer[axis] += 1;
            if odometer[axis] < axes[axis].0.len() {
                break;
            }
            odometer[axis] = 0;
        }
    }
    (shape, addresses)
}

/// `A | I`: slice selection.
pub(crate) fn slice(interp: &mut Interpreter, target: Value, spec: Value) -> RunResult<Value> {
    // Row and column slices of a 2-D packed array take a direct copy path;
    // the general path below is observationally identical.
    if let Some(result) = slice_fast_path(interp, &target, &spec)? {
        target.drop_with_heap(&mut interp.heap);
        spec.drop_with_heap(&mut interp.heap);
        return Ok(result);
    }
    let Some(axes) = slice_axes(interp, &target, &spec) else {
        target.drop_with_heap(&mut interp.heap);
        spec.drop_with_heap(&mut interp.heap);
        return interp.fault(Selection::Slice.fault_name());
    };
    spec.drop_with_heap(&mut interp.heap);
    let (shape, addresses) = slice_addresses(&axes);
    let mut items = Vec::with_capacity(addresses.len());
    for address in &addresses {
        match linear_index(interp, &target, address) {
            Some(index) => items.push(item_of(&interp.heap, &target, index)),
            None => {
                for item in items {
                    item.drop_with_heap(&mut interp.heap);
                }
                target.drop_with_heap(&mut interp.heap);
                return interp.fault(Selection::Slice.fault_name());
            }
        }
    }
    target.drop_with_heap(&mut interp.heap);
    make_array(&mut interp.heap, shape, items)
}

/// Detects `A|[i, Null]` and `A|[Null, j]` on a rank-2 target and extracts
/// the row or column by direct copy. Returns `Ok(None)` when the fast path
/// does not apply.
fn slice_fast_path(interp: &mut Interpreter, target: &Value, spec: &Value) -> RunResult<Option<Value>> {
    if target.valence(&interp.heap) != 2 || spec.tally(&interp.heap) != 2 || spec.is_atom() {
        return Ok(None);
    }
    let first = item_of(&interp.heap, spec, 0);
    let second = item_of(&interp.heap, spec, 1);
    let shape = target.shape(&interp.heap);
    let (rows, cols) = (shape[0] as i64, shape[1] as i64);
    let result = match (&first, &second) {
        (Value::Int(row), Value::Fault(f)) if *f == NOEXPR => {
            if *row < 0 || *row >= rows {
                None
            } else {
                let base = (*row * cols) as usize;
                let items: Vec<Value> = (0..cols as usize).map(|j| item_of(&interp.heap, target, base + j)).collect();
                Some(make_array(&mut interp.heap, Shape::from_slice(&[cols as usize]), items)?)
            }
        }
        (Value::Fault(f), Value::Int(col)) if *f == NOEXPR => {
            if *col < 0 || *col >= cols {
                None
            } else {
                let items: Vec<Value> = (0..rows as usize)
                    .map(|i| item_of(&interp.heap, target, i * cols as usize + *col as usize))
                    .collect();
                Some(make_array(&mut interp.heap, Shape::from_slice(&[rows as usize]), items)?)
            }
        }
        _ => None,
    };
    first.drop_with_heap(&mut interp.heap);
    second.drop_with_heap(&mut interp.heap);
    match result {
        Some(v) => Ok(Some(v)),
        None => Ok(None),
    }
}

// ---- insertion -----------------------------------------------------------

/// Stores `x` at a validated linear index of an unshared container,
/// exploding a packed payload on kind mismatch and re-imploding after.
fn set_item(interp: &mut Interpreter, id: crate::heap::ArrayId, index: usize, x: Value) {
    let data = interp.heap.take(id);
    let needs_explode = match (&data, &x) {
        (ArrayData::Bools(_), Value::Bool(_))
        | (ArrayData::Ints(_), Value::Int(_))
        | (ArrayData::Reals(_), Value::Real(_))
        | (ArrayData::Chars(_), Value::Char(_))
        | (ArrayData::Mixed(_), _) => false,
        _ => true,
    };
    let mut data = if needs_explode {
        ArrayData::Mixed(explode(&data))
    } else {
        data
    };
    match &mut data {
        ArrayData::Bools(a) => a.items[index] = x.as_bool().expect("kind checked"),
        ArrayData::Ints(a) => a.items[index] = x.as_int().expect("kind checked"),
        ArrayData::Reals(a) => {
            a.items[index] = match x {
                Value::Real(r) => r,
                _ => unreachable!("kind checked"),
            }
        }
        ArrayData::Chars(a) => {
            a.items[index] = match x {
                Value::Char(c) => c,
                _ => unreachable!("kind checked"),
            }
        }
        ArrayData::Mixed(mixed) => {
            let old = std::mem::replace(&mut mixed.items[index], x);
            interp.heap.restore(id, data);
            old.drop_with_heap(&mut interp.heap);
            // Re-test for implosion after the store.
            let data = interp.heap.take(id);
            let data = match &data {
                ArrayData::Mixed(m) => reimplode(m).unwrap_or(data),
                _ => data,
            };
            interp.heap.restore(id, data);
            return;
        }
        _ => unreachable!("operation payloads are not update targets"),
    }
    interp.heap.restore(id, data);
}

/// `place (X, I) A`: insert one item, copy-on-write.
///
/// Returns the updated container (or a fault value on a bad address) plus
/// whether the container identity changed.
pub(crate) fn place(interp: &mut Interpreter, target: Value, addr: Value, x: Value) -> RunResult<(Value, bool)> {
    let Some(ints) = address_to_ints(interp, &addr) else {
        return place_failed(interp, target, addr, x, Selection::Pick);
    };
    // Placing into a single (or an atom) builds a fresh rank-0 container.
    if target.valence(&interp.heap) == 0 && ints.is_empty() {
        target.drop_with_heap(&mut interp.heap);
        addr.drop_with_heap(&mut interp.heap);
        let single = make_array(&mut interp.heap, Shape::new(), vec![x])?;
        return Ok((single, true));
    }
    let Some(index) = linear_index(interp, &target, &ints) else {
        return place_failed(interp, target, addr, x, Selection::Pick);
    };
    addr.drop_with_heap(&mut interp.heap);
    let id = target.ref_id().expect("non-atomic update target");
    let (id, changed) = interp.heap.ensure_unshared(id)?;
    set_item(interp, id, index, x);
    Ok((Value::Ref(id), changed))
}

fn place_failed(
    interp: &mut Interpreter,
    target: Value,
    addr: Value,
    x: Value,
    notation: Selection,
) -> RunResult<(Value, bool)> {
    target.drop_with_heap(&mut interp.heap);
    addr.drop_with_heap(&mut interp.heap);
    x.drop_with_heap(&mut interp.heap);
    let fault = interp.fault(notation.fault_name())?;
    Ok((fault, false))
}

/// `placeall (Vals, Addrs) A`: insert many items in address order.
///
/// Every address validates before anything commits; assignments then apply
/// in address iteration order so later writes to a cell overwrite earlier
/// ones. Values reshape by cycling when the tallies differ; a rank-0 value
/// replicates across all addresses.
pub(crate) fn place_all(interp: &mut Interpreter, target: Value, addrs: Value, vals: Value) -> RunResult<(Value, bool)> {
    place_many_value(interp, target, addrs, vals, Selection::Choose)
}

fn place_many_value(
    interp: &mut Interpreter,
    target: Value,
    addrs: Value,
    vals: Value,
    notation: Selection,
) -> RunResult<(Value, bool)> {
    let count = addrs.tally(&interp.heap);
    // Validate all addresses before committing any update.
    let mut indices = Vec::with_capacity(count);
    for i in 0..count {
        let addr = item_of(&interp.heap, &addrs, i);
        let resolved = address_to_ints(interp, &addr).and_then(|ints| linear_index(interp, &target, &ints));
        addr.drop_with_heap(&mut interp.heap);
        match resolved {
            Some(index) => indices.push(index),
            None => return place_failed(interp, target, addrs, vals, notation),
        }
    }
    addrs.drop_with_heap(&mut interp.heap);
    place_at_indices(interp, target, &indices, vals)
}

fn place_at_indices(
    interp: &mut Interpreter,
    target: Value,
    indices: &[usize],
    vals: Value,
) -> RunResult<(Value, bool)> {
    let replicate = vals.valence(&interp.heap) == 0;
    let vcount = vals.tally(&interp.heap);
    if !replicate && vcount == 0 && !indices.is_empty() {
        target.drop_with_heap(&mut interp.heap);
        vals.drop_with_heap(&mut interp.heap);
        let fault = interp.fault("?empty")?;
        return Ok((fault, false));
    }
    if indices.is_empty() {
        vals.drop_with_heap(&mut interp.heap);
        return Ok((target, false));
    }
    let id = target.ref_id().expect("non-atomic update target");
    let (id, changed) = interp.heap.ensure_unshared(id)?;
    for (i, &index) in indices.iter().enumerate() {
        let x = if replicate {
            vals.clone_with_heap(&interp.heap)
        } else {
            item_of(&interp.heap, &vals, i % vcount)
        };
        set_item(interp, id, index, x);
    }
    vals.drop_with_heap(&mut interp.heap);
    Ok((Value::Ref(id), changed))
}

/// `deepplace (X, P) A`: walk the path, copying only shared containers on
/// the path; interior containers of unshared subtrees update in place.
pub(crate) fn deep_place(interp: &mut Interpreter, target: Value, path: Value, x: Value) -> RunResult<(Value, bool)> {
    let count = path.tally(&interp.heap);
    match path_up(interp, target, &path, 0, count, x)? {
        Some((value, changed)) => {
            path.drop_with_heap(&mut interp.heap);
            Ok((value, changed))
        }
        None => {
            path.drop_with_heap(&mut interp.heap);
            let fault = interp.fault(Selection::Reach.fault_name())?;
            Ok((fault, false))
        }
    }
}

/// Recursive step of `deep_place`. Returns `None` when the path fails;
/// the target is released either way.
fn path_up(
    interp: &mut Interpreter,
    target: Value,
    path: &Value,
    i: usize,
    count: usize,
    x: Value,
) -> RunResult<Option<(Value, bool)>> {
    if i == count {
        // All path items used: x replaces the target at this level.
        target.drop_with_heap(&mut interp.heap);
        return Ok(Some((x, true)));
    }
    let addr = item_of(&interp.heap, path, i);
    let Some(picked) = pick_core(interp, &target, &addr) else {
        addr.drop_with_heap(&mut interp.heap);
        target.drop_with_heap(&mut interp.heap);
        x.drop_with_heap(&mut interp.heap);
        return Ok(None);
    };
    let Some(inner) = path_up(interp, picked, path, i + 1, count, x)? else {
        addr.drop_with_heap(&mut interp.heap);
        target.drop_with_heap(&mut interp.heap);
        return Ok(None);
    };
    let (new_item, _inner_changed) = inner;
    let result = place(interp, target, addr, new_item)?;
    Ok(Some(result))
}

/// Slice insertion `A|I := Vals`: the addressed hyper-slice updates with the
/// value replicated or distributed, after full validation.
pub(crate) fn slice_place(interp: &mut Interpreter, target: Value, spec: Value, vals: Value) -> RunResult<(Value, bool)> {
    let Some(axes) = slice_axes(interp, &target, &spec) else {
        return place_failed(interp, target, spec, vals, Selection::Slice);
    };
    spec.drop_with_heap(&mut interp.heap);
    let (_shape, addresses) = slice_addresses(&axes);
    let mut indices = Vec::with_capacity(addresses.len());
    for address in &addresses {
        match linear_index(interp, &target, address) {
            Some(index) => indices.push(index),
            None => {
                target.drop_with_heap(&mut interp.heap);
                vals.drop_with_heap(&mut interp.heap);
                let fault = interp.fault(Selection::Slice.fault_name())?;
                return Ok((fault, false));
            }
        }
    }
    place_at_indices(interp, target, &indices, vals)
}

// ---- evaluator entry points ----------------------------------------------

/// Evaluates a selection expression: the address expression first, then the
/// variable, then the engine.
pub(crate) fn eval_select(interp: &mut Interpreter, sel: Selection, var: TreeId, index: TreeId) -> RunResult<()> {
    interp.eval(index)?;
    let addr = interp.pop();
    interp.eval(var)?;
    let target = interp.pop();
    let result = match sel {
        Selection::Pick => pick(interp, target, addr)?,
        Selection::Reach => reach(interp, target, addr)?,
        Selection::Choose => choose(interp, target, addr)?,
        Selection::Slice => slice(interp, target, addr)?,
    };
    interp.push(result)
}

/// Evaluates an indexed assignment: the replacement value first, then the
/// index expression, then the update through the engine, rebinding the
/// variable only when the container identity changed.
pub(crate) fn eval_insert(interp: &mut Interpreter, target: TreeId, expr: TreeId) -> RunResult<()> {
    interp.eval(expr)?;
    let val = interp.pop();
    let (sel, var_tree, index_tree) = match interp.trees.node(target) {
        Node::PickPlace { var, index } => (Selection::Pick, var, index),
        Node::ReachPut { var, index } => (Selection::Reach, var, index),
        Node::ChooseSel { var, index } => (Selection::Choose, var, index),
        Node::SliceSel { var, index } => (Selection::Slice, var, index),
        _ => return Err(RunError::Fatal("indexed assignment target expected".into())),
    };
    let Node::Variable { sym, entry } = interp.trees.node(var_tree) else {
        return Err(RunError::Fatal("indexed assignment variable expected".into()));
    };
    interp.eval(index_tree)?;
    let addr = interp.pop();
    // The variable's cell holds one reference and this fetch a second, so a
    // target bound elsewhere is seen as shared and copied before mutation.
    let current = interp.fetch_var(sym, entry)?;
    let (result, changed) = match sel {
        Selection::Pick => place(interp, current, addr, val)?,
        Selection::Reach => deep_place(interp, current, addr, val)?,
        Selection::Choose => place_all(interp, current, addr, val)?,
        Selection::Slice => slice_place(interp, current, addr, val)?,
    };
    if !matches!(result, Value::Fault(_)) && changed {
        let stored = result.clone_with_heap(&interp.heap);
        interp.store_var(sym, entry, stored);
    }
    interp.push(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::HeapLimits;

    fn interp() -> Interpreter {
        Interpreter::new(HeapLimits::default())
    }

    #[test]
    fn pick_place_inverse() {
        let mut interp = interp();
        let list = interp.int_list(&[10, 20, 30]);
        let (updated, _changed) = place(&mut interp, list, Value::Int(1), Value::Int(99)).unwrap();
        let fetched = pick(&mut interp, updated, Value::Int(1)).unwrap();
        assert_eq!(fetched.as_int(), Some(99));
    }

    #[test]
    fn out_of_range_pick_is_address_fault() {
        let mut interp = interp();
        let list = interp.int_list(&[1, 2]);
        let result = pick(&mut interp, list, Value::Int(5)).unwrap();
        let Value::Fault(f) = result else {
            panic!("expected fault")
        };
        assert_eq!(interp.interns.fault_text(f), "?address");
    }

    #[test]
    fn place_into_shared_target_copies() {
        let mut interp = interp();
        let list = interp.int_list(&[1, 2]);
        let id = list.ref_id().unwrap();
        interp.heap.inc_ref(id); // second owner
        let before = id;
        let (updated, changed) = place(&mut interp, list, Value::Int(0), Value::Int(7)).unwrap();
        assert!(changed, "shared target must change identity");
        assert_ne!(updated.ref_id().unwrap(), before);
        // The original is unchanged.
        let original = Value::Ref(before);
        let first = pick(&mut interp, original, Value::Int(0)).unwrap();
        assert_eq!(first.as_int(), Some(1));
        updated.drop_with_heap(&mut interp.heap);
    }

    #[test]
    fn kind_mismatch_explodes_then_reimplodes() {
        let mut interp = interp();
        let list = interp.int_list(&[1, 2]);
        // Storing a char forces the mixed representation.
        let (updated, _) = place(&mut interp, list, Value::Int(0), Value::Char('x')).unwrap();
        let id = updated.ref_id().unwrap();
        assert!(matches!(interp.heap.get(id), ArrayData::Mixed(_)));
        // Restoring an integer at the same place implodes back to packed.
        let (updated, _) = place(&mut interp, updated, Value::Int(0), Value::Int(5)).unwrap();
        let id = updated.ref_id().unwrap();
        assert!(matches!(interp.heap.get(id), ArrayData::Ints(_)));
        updated.drop_with_heap(&mut interp.heap);
    }

    #[test]
    fn placeall_applies_in_address_order() {
        let mut interp = interp();
        let list = interp.int_list(&[0, 0, 0]);
        let addrs = interp.int_list(&[1, 1, 2]);
        let vals = interp.int_list(&[5, 6, 7]);
        let (updated, _) = place_all(&mut interp, list, addrs, vals).unwrap();
        // The later write to address 1 wins.
        let dup = updated.clone_with_heap(&interp.heap);
        let second = pick(&mut interp, dup, Value::Int(1)).unwrap();
        assert_eq!(second.as_int(), Some(6));
        let third = pick(&mut interp, updated, Value::Int(2)).unwrap();
        assert_eq!(third.as_int(), Some(7));
    }

    #[test]
    fn placeall_invalid_address_aborts_whole_update() {
        let mut interp = interp();
        let list = interp.int_list(&[0, 0, 0]);
        let keep = list.clone_with_heap(&interp.heap);
        let addrs = interp.int_list(&[0, 9]);
        let vals = interp.int_list(&[5, 6]);
        let (result, changed) = place_all(&mut interp, list, addrs, vals).unwrap();
        assert!(matches!(result, Value::Fault(_)));
        assert!(!changed);
        // Nothing committed: the surviving owner still sees zeros.
        let first = pick(&mut interp, keep, Value::Int(0)).unwrap();
        assert_eq!(first.as_int(), Some(0));
    }

    #[test]
    fn choose_matches_repeated_picks() {
        let mut interp = interp();
        let list = interp.int_list(&[10, 20, 30]);
        let addrs = interp.int_list(&[2, 0]);
        let list_dup = list.clone_with_heap(&interp.heap);
        let addrs_dup = addrs.clone_with_heap(&interp.heap);
        let chosen = choose(&mut interp, list_dup, addrs_dup).unwrap();
        for (i, expect) in [(0usize, 30i64), (1, 10)] {
            let addr = item_of(&interp.heap, &addrs, i);
            let target = list.clone_with_heap(&interp.heap);
            let direct = pick(&mut interp, target, addr).unwrap();
            assert_eq!(direct.as_int(), Some(expect));
            let via_choose = item_of(&interp.heap, &chosen, i);
            assert_eq!(via_choose.as_int(), Some(expect));
        }
        chosen.drop_with_heap(&mut interp.heap);
        addrs.drop_with_heap(&mut interp.heap);
        list.drop_with_heap(&mut interp.heap);
    }

    #[test]
    fn deep_place_copies_only_shared_path() {
        let mut interp = interp();
        let inner = interp.int_list(&[1, 2]);
        let other = interp.int_list(&[3, 4]);
        let outer = make_array(
            &mut interp.heap,
            Shape::from_slice(&[2]),
            vec![inner, other],
        )
        .unwrap();
        let keep = outer.clone_with_heap(&interp.heap);
        let path = interp.int_list(&[0, 1]);
        let (updated, changed) = deep_place(&mut interp, outer, path, Value::Int(99)).unwrap();
        assert!(changed, "shared outer container must be copied");
        // New tree sees the update...
        let updated_dup = updated.clone_with_heap(&interp.heap);
        let path = interp.int_list(&[0, 1]);
        let picked = reach(&mut interp, updated_dup, path).unwrap();
        assert_eq!(picked.as_int(), Some(99));
        // ...while the old owner is untouched.
        let path = interp.int_list(&[0, 1]);
        let old = reach(&mut interp, keep, path).unwrap();
        assert_eq!(old.as_int(), Some(2));
        updated.drop_with_heap(&mut interp.heap);
    }
}
