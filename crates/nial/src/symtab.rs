//! Symbol tables, scope properties, name lookup and the activation stack.
//!
//! A symbol table holds a binary tree of entries ordered by phrase text, the
//! activation stack pointer of its current call (-1 when inactive), a scope
//! property and an owner name. All tables live in a [`Symtabs`] arena; index
//! 0 is always the global table.
//!
//! Name lookup walks the current environment (innermost first) under one of
//! seven policies; the policies encode the closed-scope discipline of
//! blocks, the open chaining of bare-expression opforms, and the parameter
//! scope of trforms.

use serde::{Deserialize, Serialize};

use crate::{
    heap::Heap,
    intern::{Interns, PhraseId, NO_VALUE},
    parsetree::TreeId,
    value::Value,
};

/// Index of a symbol table in the [`Symtabs`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymtabId(u32);

impl SymtabId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) fn from_index(index: u32) -> Self {
        Self(index)
    }
}

/// The global symbol table is always at index 0.
pub const GLOBAL_SYMTAB: SymtabId = SymtabId(0);

/// Index of an entry within one symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(u32);

impl EntryId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Syntactic role of a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    /// Reserved word.
    Reserved,
    /// Seen but not yet bound to a role.
    Ident,
    /// System constant.
    Constant,
    /// Operation.
    Optn,
    /// Transformer.
    Trans,
    /// Variable.
    Var,
    /// Named expression.
    Expr,
}

/// Scope discipline of a symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeProperty {
    /// The one global table.
    Global,
    /// Lexical chaining without the closed restriction (bare-expression
    /// opform bodies; blocks after their parse completes).
    Open,
    /// Block scope: names must be declared LOCAL or NONLOCAL.
    Closed,
    /// Transformer operation parameters.
    Parameter,
}

/// What an entry's value cell holds.
#[derive(Debug, Serialize, Deserialize)]
pub enum EntryValue {
    /// Nothing bound yet.
    Empty,
    /// An array value (global variables and constants). Owns one reference.
    Array(Value),
    /// A parse tree (defined expressions, operations, transformers).
    Tree(TreeId),
    /// Activation-stack offset of a local variable, assigned at parse time.
    Local(u32),
}

/// One symbol table entry.
#[derive(Debug, Serialize, Deserialize)]
pub struct Entry {
    pub name: PhraseId,
    pub role: Role,
    pub value: EntryValue,
    left: Option<EntryId>,
    right: Option<EntryId>,
    /// Set for names installed by the system at startup.
    pub system: bool,
    /// Trace flag for the debug facility.
    pub trace: bool,
    /// Break flag for the debug facility.
    pub brk: bool,
}

/// A namespace: entry tree, activation pointer, property and owner name.
#[derive(Debug, Serialize, Deserialize)]
pub struct Symtab {
    root: Option<EntryId>,
    entries: Vec<Entry>,
    /// Activation stack pointer of the current call, or -1 when inactive.
    pub current_sp: i64,
    pub property: ScopeProperty,
    /// Owner name, updated when a definition adopts the table.
    pub name: PhraseId,
}

impl Symtab {
    fn new(property: ScopeProperty, name: PhraseId) -> Self {
        Self {
            root: None,
            entries: Vec::new(),
            current_sp: -1,
            property,
            name,
        }
    }

    /// Returns the entry for an id created by this table.
    #[must_use]
    pub fn entry(&self, id: EntryId) -> &Entry {
        &self.entries[id.index()]
    }

    /// Mutable access to an entry.
    pub fn entry_mut(&mut self, id: EntryId) -> &mut Entry {
        &mut self.entries[id.index()]
    }

    /// Binary-tree search ordered by phrase text.
    #[must_use]
    pub fn lookup(&self, name: PhraseId, interns: &Interns) -> Option<EntryId> {
        let needle = interns.phrase_text(name);
        let mut cursor = self.root;
        while let Some(id) = cursor {
            let entry = self.entry(id);
            if entry.name == name {
                return Some(id);
            }
            cursor = if needle < interns.phrase_text(entry.name) {
                entry.left
            } else {
                entry.right
            };
        }
        None
    }

    /// Inserts a new entry, keeping the tree ordered by phrase text.
    /// Returns the existing entry when the name is already present.
    pub fn install(
        &mut self,
        name: PhraseId,
        role: Role,
        value: EntryValue,
        system: bool,
        interns: &Interns,
    ) -> EntryId {
        let new_id = EntryId(u32::try_from(self.entries.len()).expect("symbol table overflow"));
        let needle = interns.phrase_text(name);
        let mut cursor = self.root;
        let mut parent: Option<(EntryId, bool)> = None;
        while let Some(id) = cursor {
            let entry = self.entry(id);
            if entry.name == name {
                return id;
            }
            let go_left = needle < interns.phrase_text(entry.name);
            parent = Some((id, go_left));
            cursor = if go_left { entry.left } else { entry.right };
        }
        self.entries.push(Entry {
            name,
            role,
            value,
            left: None,
            right: None,
            system,
            trace: false,
            brk: false,
        });
        match parent {
            None => self.root = Some(new_id),
            Some((id, true)) => self.entry_mut(id).left = Some(new_id),
            Some((id, false)) => self.entry_mut(id).right = Some(new_id),
        }
        new_id
    }

    /// In-order traversal of entry ids (alphabetical by phrase text).
    #[must_use]
    pub fn in_order(&self) -> Vec<EntryId> {
        fn walk(table: &Symtab, node: Option<EntryId>, out: &mut Vec<EntryId>) {
            if let Some(id) = node {
                let entry = table.entry(id);
                walk(table, entry.left, out);
                out.push(id);
                walk(table, entry.right, out);
            }
        }
        let mut out = Vec::with_capacity(self.entries.len());
        walk(self, self.root, &mut out);
        out
    }
}

/// Arena of all symbol tables in a session.
#[derive(Debug, Serialize, Deserialize)]
pub struct Symtabs {
    tables: Vec<Symtab>,
}

impl Symtabs {
    /// Creates the arena with an empty global table.
    pub fn new(interns: &mut Interns) -> Self {
        let name = interns.phrase("GLOBAL");
        Self {
            tables: vec![Symtab::new(ScopeProperty::Global, name)],
        }
    }

    /// Adds a fresh table and returns its id.
    pub fn add(&mut self, property: ScopeProperty, name: PhraseId) -> SymtabId {
        let id = SymtabId(u32::try_from(self.tables.len()).expect("symtab arena overflow"));
        self.tables.push(Symtab::new(property, name));
        id
    }

    /// Number of tables in the arena.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[must_use]
    pub fn get(&self, id: SymtabId) -> &Symtab {
        &self.tables[id.index()]
    }

    pub fn get_mut(&mut self, id: SymtabId) -> &mut Symtab {
        &mut self.tables[id.index()]
    }

    #[must_use]
    pub fn global(&self) -> &Symtab {
        &self.tables[GLOBAL_SYMTAB.index()]
    }

    pub fn global_mut(&mut self) -> &mut Symtab {
        &mut self.tables[GLOBAL_SYMTAB.index()]
    }
}

/// Name-lookup policy, selected by the parser per syntactic position.
/// The evaluator only ever uses `Passive`. The remaining policy, *formal*
/// (no lookup at all, always a fresh identifier), is the parser's
/// `id_formal` path and needs no table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupPolicy {
    /// Search current env innermost-out, then global.
    Passive,
    /// Assignment target: a closed innermost scope without the name (and
    /// without a NONLOCAL declaration for it) ends the search; the global
    /// table is reached only when no local env is closed.
    Active,
    /// Restrict to the innermost table (definitions inside a block).
    Statics,
    /// Innermost table, then straight to global (runtime definitions).
    Dynamic,
    /// Skip the innermost table (resolving NONLOCAL declarations).
    Nonlocal,
    /// Global table only.
    Globals,
}

/// Looks up a name in the environment under the given policy.
///
/// `env` lists the local symbol tables innermost first; the global table is
/// implicit at the end. `nonlocals` is the NONLOCAL declaration list of the
/// innermost block, consulted by the `Active` policy.
pub fn lookup_env(
    symtabs: &Symtabs,
    env: &[SymtabId],
    policy: LookupPolicy,
    name: PhraseId,
    nonlocals: &[PhraseId],
    interns: &Interns,
) -> Option<(SymtabId, EntryId)> {
    let find_global = || {
        symtabs
            .global()
            .lookup(name, interns)
            .map(|entry| (GLOBAL_SYMTAB, entry))
    };
    match policy {
        LookupPolicy::Globals => find_global(),
        LookupPolicy::Statics => match env.first() {
            Some(&sym) => symtabs.get(sym).lookup(name, interns).map(|e| (sym, e)),
            None => find_global(),
        },
        LookupPolicy::Dynamic => {
            if let Some(&sym) = env.first() {
                if let Some(entry) = symtabs.get(sym).lookup(name, interns) {
                    return Some((sym, entry));
                }
            }
            find_global()
        }
        LookupPolicy::Nonlocal => {
            for &sym in env.iter().skip(1) {
                if let Some(entry) = symtabs.get(sym).lookup(name, interns) {
                    return Some((sym, entry));
                }
            }
            find_global()
        }
        LookupPolicy::Passive => {
            for &sym in env {
                if let Some(entry) = symtabs.get(sym).lookup(name, interns) {
                    return Some((sym, entry));
                }
            }
            find_global()
        }
        LookupPolicy::Active => {
            if let Some(&innermost) = env.first() {
                let table = symtabs.get(innermost);
                if let Some(entry) = table.lookup(name, interns) {
                    return Some((innermost, entry));
                }
                if table.property == ScopeProperty::Closed {
                    if !nonlocals.contains(&name) {
                        return None;
                    }
                    // A NONLOCAL declaration reopens the chain all the way
                    // to the global table.
                    for &sym in env.iter().skip(1) {
                        if let Some(entry) = symtabs.get(sym).lookup(name, interns) {
                            return Some((sym, entry));
                        }
                    }
                    return find_global();
                }
            }
            for &sym in env.iter().skip(1) {
                if let Some(entry) = symtabs.get(sym).lookup(name, interns) {
                    return Some((sym, entry));
                }
            }
            if env.iter().any(|&sym| symtabs.get(sym).property == ScopeProperty::Closed) {
                return None;
            }
            find_global()
        }
    }
}

/// Offset of the first local slot within an activation record: slot 0 is the
/// reserved result cell, slot 1 the caller's saved stack pointer.
pub const LOCALS_BASE: usize = 2;

/// The activation stack: one linear array of value cells.
///
/// A call pushes a reserved result slot, the caller's saved stack pointer
/// for the activated table, and `nvars` local slots initialized to the
/// `?no_value` fault. Locals are addressed by `current_sp + LOCALS_BASE +
/// offset` with the offset assigned at parse time.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ActivationStack {
    cells: Vec<Value>,
}

impl ActivationStack {
    /// Opens an activation record for `symtab`, returning nothing; the saved
    /// pointer lives inside the record.
    pub fn prologue(&mut self, symtab: &mut Symtab, nvars: usize) {
        let saved = symtab.current_sp;
        let base = self.cells.len() as i64;
        symtab.current_sp = base;
        self.cells.push(Value::Fault(NO_VALUE)); // reserved result slot
        self.cells.push(Value::Int(saved)); // caller's saved stack pointer
        for _ in 0..nvars {
            self.cells.push(Value::Fault(NO_VALUE));
        }
    }

    /// Closes the innermost activation record of `symtab`: releases locals,
    /// restores the saved stack pointer, truncates the stack.
    pub fn epilogue(&mut self, symtab: &mut Symtab, heap: &mut Heap) {
        let base = usize::try_from(symtab.current_sp).expect("epilogue without live activation");
        let saved = self.cells[base + 1].as_int().expect("saved sp cell corrupted");
        for cell in self.cells.drain(base..) {
            cell.drop_with_heap(heap);
        }
        symtab.current_sp = saved;
    }

    /// Reads a local value cell, bumping refcounts for the caller.
    pub fn fetch(&self, sp: i64, offset: u32, heap: &Heap) -> Value {
        let idx = usize::try_from(sp).expect("fetch from inactive scope") + LOCALS_BASE + offset as usize;
        self.cells[idx].clone_with_heap(heap)
    }

    /// Stores into a local value cell. The new value is stored before the
    /// previous occupant is released, in case the right-hand side is an item
    /// of the old value.
    pub fn store(&mut self, sp: i64, offset: u32, value: Value, heap: &mut Heap) {
        let idx = usize::try_from(sp).expect("store into inactive scope") + LOCALS_BASE + offset as usize;
        let old = std::mem::replace(&mut self.cells[idx], value);
        old.drop_with_heap(heap);
    }

    /// Number of live cells; used by snapshot/recovery invariants.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.cells.len()
    }

    /// Drops every cell (top-level recovery after an interrupt).
    pub fn clear(&mut self, heap: &mut Heap) {
        for cell in self.cells.drain(..) {
            cell.drop_with_heap(heap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::HeapLimits;

    fn setup() -> (Interns, Symtabs) {
        let mut interns = Interns::new();
        let symtabs = Symtabs::new(&mut interns);
        (interns, symtabs)
    }

    #[test]
    fn install_and_lookup_are_ordered_by_text() {
        let (mut interns, mut symtabs) = setup();
        let names: Vec<PhraseId> = ["MU", "ALPHA", "ZETA", "BETA"]
            .iter()
            .map(|n| interns.phrase(n))
            .collect();
        for &n in &names {
            symtabs
                .global_mut()
                .install(n, Role::Var, EntryValue::Empty, false, &interns);
        }
        let global = symtabs.global();
        for &n in &names {
            let entry = global.lookup(n, &interns).expect("installed name found");
            assert_eq!(global.entry(entry).name, n);
        }
        let order: Vec<&str> = global
            .in_order()
            .into_iter()
            .map(|id| interns.phrase_text(global.entry(id).name))
            .collect();
        assert_eq!(order, vec!["ALPHA", "BETA", "MU", "ZETA"]);
    }

    #[test]
    fn active_lookup_stops_at_closed_scope() {
        let (mut interns, mut symtabs) = setup();
        let x = interns.phrase("X");
        let anon = interns.phrase("ANONYMOUS");
        symtabs
            .global_mut()
            .install(x, Role::Var, EntryValue::Empty, false, &interns);
        let block = symtabs.add(ScopeProperty::Closed, anon);
        let env = [block];

        // Passive lookup chains to the global table.
        assert!(lookup_env(&symtabs, &env, LookupPolicy::Passive, x, &[], &interns).is_some());
        // Active lookup fails: the closed block hides the global variable.
        assert!(lookup_env(&symtabs, &env, LookupPolicy::Active, x, &[], &interns).is_none());
        // A NONLOCAL declaration reopens the chain.
        assert!(lookup_env(&symtabs, &env, LookupPolicy::Active, x, &[x], &interns).is_some());
    }

    #[test]
    fn activation_records_restore_saved_pointers() {
        let (mut interns, mut symtabs) = setup();
        let anon = interns.phrase("ANONYMOUS");
        let sym = symtabs.add(ScopeProperty::Open, anon);
        let mut heap = Heap::new(HeapLimits::default());
        let mut stack = ActivationStack::default();

        assert_eq!(symtabs.get(sym).current_sp, -1);
        stack.prologue(symtabs.get_mut(sym), 2);
        let sp = symtabs.get(sym).current_sp;
        assert_eq!(sp, 0);
        stack.store(sp, 1, Value::Int(42), &mut heap);
        assert_eq!(stack.fetch(sp, 1, &heap).as_int(), Some(42));

        // Recursive activation of the same table.
        stack.prologue(symtabs.get_mut(sym), 1);
        assert_eq!(symtabs.get(sym).current_sp, 4);
        stack.epilogue(symtabs.get_mut(sym), &mut heap);
        assert_eq!(symtabs.get(sym).current_sp, 0);

        stack.epilogue(symtabs.get_mut(sym), &mut heap);
        assert_eq!(symtabs.get(sym).current_sp, -1);
        assert_eq!(stack.depth(), 0);
    }
}
