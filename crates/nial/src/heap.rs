//! Reference-counted arena that backs all non-atomic runtime values.
//!
//! Uses a free list to reuse slots from freed arrays, keeping memory usage
//! constant for long-running loops that repeatedly allocate and free values.
//! When an array is freed via `dec_ref`, its slot id is added to the free
//! list; new allocations pop from the free list when available, otherwise
//! append.
//!
//! Allocation is accounted in words against the session's [`HeapLimits`];
//! exceeding the cap surfaces as the recoverable `HeapExhausted` warning.
//!
//! The copy-on-write update engine in `insel` relies on *unique access
//! detection*: [`Heap::is_unshared`] reads the strong count just before an
//! in-place mutation, and [`Heap::ensure_unshared`] copies when sharing is
//! detected.

use std::{cell::Cell, collections::BTreeMap};

use serde::{Deserialize, Serialize};

use crate::{
    arrays::{ArrayData, MixedArray},
    error::{RunError, RunResult},
    resource::HeapLimits,
    value::Value,
};

/// Unique identifier for arrays stored inside the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayId(usize);

impl ArrayId {
    /// Returns the raw slot index.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// One arena slot: payload plus its reference count.
///
/// The refcount uses `Cell` so `inc_ref` needs only shared access to the
/// heap; this avoids borrow conflicts while an item of a container is being
/// read. The `data` field is an `Option` to support temporary borrowing:
/// update paths `take()` the payload out, mutate with `&mut Heap` available,
/// then restore it.
#[derive(Debug, Serialize, Deserialize)]
struct HeapValue {
    refcount: Cell<usize>,
    data: Option<ArrayData>,
}

/// Snapshot of heap state at a point in time, for tests and the session's
/// invariant checks.
///
/// `objects_by_kind` uses `BTreeMap` for deterministic iteration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of live arrays on the heap.
    pub live_objects: usize,
    /// Number of free (recycled) slots available for reuse.
    pub free_slots: usize,
    /// Total arena capacity (live + free).
    pub total_slots: usize,
    /// Breakdown of live arrays by payload variant name.
    pub objects_by_kind: BTreeMap<&'static str, usize>,
    /// Current word accounting against the configured limits.
    pub words_in_use: usize,
}

/// The reference-counted arena.
#[derive(Debug, Serialize, Deserialize)]
pub struct Heap {
    entries: Vec<Option<HeapValue>>,
    /// Ids of freed slots available for reuse. Populated by `dec_ref`,
    /// consumed by `allocate`.
    free_list: Vec<ArrayId>,
    limits: HeapLimits,
    words_in_use: usize,
}

impl Heap {
    /// Creates an empty heap governed by the given limits.
    #[must_use]
    pub fn new(limits: HeapLimits) -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            limits,
            words_in_use: 0,
        }
    }

    /// Allocates a fresh array with refcount 1 and returns its id.
    ///
    /// # Errors
    /// Returns `RunError::HeapExhausted` when the allocation would push word
    /// usage past the configured cap.
    pub fn allocate(&mut self, data: ArrayData) -> RunResult<ArrayId> {
        let words = data.estimate_words();
        if self.words_in_use + words > self.limits.cap_words() {
            return Err(RunError::HeapExhausted);
        }
        self.words_in_use += words;

        let new_entry = HeapValue {
            refcount: Cell::new(1),
            data: Some(data),
        };
        let id = if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(new_entry);
            id
        } else {
            let id = ArrayId(self.entries.len());
            self.entries.push(Some(new_entry));
            id
        };
        Ok(id)
    }

    /// Increments the reference count for an existing array.
    ///
    /// # Panics
    /// Panics if the id is invalid or the array has already been freed.
    pub fn inc_ref(&self, id: ArrayId) {
        let entry = self
            .entries
            .get(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_ref()
            .expect("Heap::inc_ref: array already freed");
        entry.refcount.set(entry.refcount.get() + 1);
    }

    /// Decrements the reference count, freeing the array (and recursively
    /// releasing its children) once it reaches zero. Freed slot ids go on
    /// the free list for reuse.
    ///
    /// # Panics
    /// Panics if the id is invalid or the array has already been freed.
    pub fn dec_ref(&mut self, id: ArrayId) {
        let value = {
            let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
            let entry = slot.as_mut().expect("Heap::dec_ref: array already freed");
            let count = entry.refcount.get();
            if count > 1 {
                entry.refcount.set(count - 1);
                return;
            }
            slot.take().expect("Heap::dec_ref: array already freed")
        };

        self.free_list.push(id);
        if let Some(data) = value.data {
            self.words_in_use = self.words_in_use.saturating_sub(data.estimate_words());
            let mut child_ids = Vec::new();
            data.child_ids(&mut child_ids);
            drop(data);
            for child in child_ids {
                self.dec_ref(child);
            }
        }
    }

    /// Returns an immutable reference to the payload at the given id.
    ///
    /// # Panics
    /// Panics if the id is invalid, the array has been freed, or the payload
    /// is currently taken for mutation.
    #[must_use]
    pub fn get(&self, id: ArrayId) -> &ArrayData {
        self.entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: array already freed")
            .data
            .as_ref()
            .expect("Heap::get: payload currently taken")
    }

    /// Returns a mutable reference to the payload at the given id.
    ///
    /// # Panics
    /// Panics under the same conditions as [`Heap::get`].
    pub fn get_mut(&mut self, id: ArrayId) -> &mut ArrayData {
        self.entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: array already freed")
            .data
            .as_mut()
            .expect("Heap::get_mut: payload currently taken")
    }

    /// Moves the payload out of a slot for mutation with the heap available.
    /// Pair with [`Heap::restore`].
    pub fn take(&mut self, id: ArrayId) -> ArrayData {
        self.entries
            .get_mut(id.index())
            .expect("Heap::take: slot missing")
            .as_mut()
            .expect("Heap::take: array already freed")
            .data
            .take()
            .expect("Heap::take: payload already taken")
    }

    /// Puts a payload back after [`Heap::take`].
    pub fn restore(&mut self, id: ArrayId, data: ArrayData) {
        let entry = self
            .entries
            .get_mut(id.index())
            .expect("Heap::restore: slot missing")
            .as_mut()
            .expect("Heap::restore: array already freed");
        debug_assert!(entry.data.is_none(), "Heap::restore: payload was not taken");
        entry.data = Some(data);
    }

    /// The current reference count of a live array.
    #[must_use]
    pub fn refcount(&self, id: ArrayId) -> usize {
        self.entries
            .get(id.index())
            .expect("Heap::refcount: slot missing")
            .as_ref()
            .expect("Heap::refcount: array already freed")
            .refcount
            .get()
    }

    /// Unique access detection for the copy-on-write update paths: true when
    /// exactly one owner holds this array.
    #[must_use]
    pub fn is_unshared(&self, id: ArrayId) -> bool {
        self.refcount(id) <= 1
    }

    /// Returns `id` unchanged when the array is unshared; otherwise makes a
    /// shallow copy (bumping child refcounts), releases the caller's
    /// reference on the original, and returns the fresh id.
    ///
    /// The boolean reports whether the identity changed, which update paths
    /// use to decide whether a variable must be rebound.
    pub fn ensure_unshared(&mut self, id: ArrayId) -> RunResult<(ArrayId, bool)> {
        if self.is_unshared(id) {
            return Ok((id, false));
        }
        let copy = match self.get(id) {
            ArrayData::Bools(a) => ArrayData::Bools(a.clone()),
            ArrayData::Ints(a) => ArrayData::Ints(a.clone()),
            ArrayData::Reals(a) => ArrayData::Reals(a.clone()),
            ArrayData::Chars(a) => ArrayData::Chars(a.clone()),
            ArrayData::Mixed(mixed) => {
                let items: Vec<Value> = mixed.items.iter().map(|v| v.clone_with_heap(self)).collect();
                ArrayData::Mixed(MixedArray {
                    shape: mixed.shape.clone(),
                    items,
                })
            }
            ArrayData::Closure(_) | ArrayData::OpList(_) => {
                panic!("Heap::ensure_unshared: operation payloads are not updated in place")
            }
        };
        let new_id = self.allocate(copy)?;
        self.dec_ref(id);
        Ok((new_id, true))
    }

    /// Number of live arrays.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    /// Takes a snapshot of heap state for tests and diagnostics.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut objects_by_kind: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut live = 0;
        for entry in self.entries.iter().flatten() {
            if let Some(data) = &entry.data {
                live += 1;
                *objects_by_kind.entry(data.variant_name()).or_insert(0) += 1;
            }
        }
        HeapStats {
            live_objects: live,
            free_slots: self.free_list.len(),
            total_slots: self.entries.len(),
            objects_by_kind,
            words_in_use: self.words_in_use,
        }
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::arrays::{make_array, ArrayData, FlatArray};

    fn test_heap() -> Heap {
        Heap::new(HeapLimits::default())
    }

    #[test]
    fn allocate_reuses_freed_slots() {
        let mut heap = test_heap();
        let a = heap
            .allocate(ArrayData::Ints(FlatArray::new(smallvec![2], vec![1, 2])))
            .unwrap();
        heap.dec_ref(a);
        let b = heap
            .allocate(ArrayData::Ints(FlatArray::new(smallvec![2], vec![3, 4])))
            .unwrap();
        assert_eq!(a, b, "freed slot should be reused");
        assert_eq!(heap.stats().live_objects, 1);
    }

    #[test]
    fn dec_ref_releases_children_recursively() {
        let mut heap = test_heap();
        let inner = make_array(&mut heap, smallvec![2], vec![Value::Int(1), Value::Int(2)]).unwrap();
        let outer = make_array(&mut heap, smallvec![1], vec![inner]).unwrap();
        assert_eq!(heap.live_count(), 2);
        outer.drop_with_heap(&mut heap);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn mixed_of_uniform_atoms_implodes() {
        let mut heap = test_heap();
        let v = make_array(&mut heap, smallvec![3], vec![Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap();
        let id = v.ref_id().unwrap();
        assert!(matches!(heap.get(id), ArrayData::Ints(_)), "canonical form must be packed");
        v.drop_with_heap(&mut heap);
    }

    #[test]
    fn single_of_atom_is_the_atom() {
        let mut heap = test_heap();
        let v = make_array(&mut heap, smallvec![], vec![Value::Int(7)]).unwrap();
        assert!(matches!(v, Value::Int(7)));
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn ensure_unshared_copies_only_when_shared() {
        let mut heap = test_heap();
        let v = make_array(&mut heap, smallvec![2], vec![Value::Int(1), Value::Int(2)]).unwrap();
        let id = v.ref_id().unwrap();
        let (same, changed) = heap.ensure_unshared(id).unwrap();
        assert_eq!(same, id);
        assert!(!changed);

        heap.inc_ref(id); // second owner appears
        let (copy, changed) = heap.ensure_unshared(id).unwrap();
        assert_ne!(copy, id, "copy-on-write must change identity");
        assert!(changed);
        assert_eq!(heap.refcount(id), 1);
        assert_eq!(heap.refcount(copy), 1);
        heap.dec_ref(copy);
        heap.dec_ref(id);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn allocation_respects_fixed_cap() {
        let mut heap = Heap::new(HeapLimits::fixed(8));
        let big = ArrayData::Ints(FlatArray::new(smallvec![64], vec![0; 64]));
        assert_eq!(heap.allocate(big), Err(RunError::HeapExhausted));
    }
}
