//! Symbol table management.
//!
//! All symbol entries live in one arena owned by the table. The public
//! symbol map is the single source of truth for resolved names: a name is
//! only unresolved if it is absent here. References waiting for a
//! definition sit on a FIFO worklist and are bound in discovery order.

use std::collections::{HashMap, VecDeque};

use object::read::SectionIndex;

use crate::image::ImportId;

// Pre-sized like the original session's hash table and pending list.
const PUBLIC_MAP_CAPACITY: usize = 512;
const WORKLIST_CAPACITY: usize = 256;

/// Index of a symbol entry in the session's symbol arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub usize);

/// How (and whether) a symbol entry has been bound to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Not bound yet; the entry is (or was) on the worklist.
    Unresolved,
    /// Bound to a definition in a loaded object module.
    Local { target: SymbolId },
    /// A weak external tolerated without a definition; resolves to 0.
    Weak,
    /// Bound to a DLL import; the address is the import's IAT slot.
    DllImport { target: SymbolId, import: ImportId },
}

/// One named symbol: a definition contributed by an object module, or a
/// reference recorded while analyzing one.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub name: String,
    /// Object module defining this symbol (None for pure references).
    pub defining_object: Option<usize>,
    /// Object module whose reference created this entry, for diagnostics.
    pub referencing_object: Option<usize>,
    /// Section within the defining object (None for absolute and common).
    pub section: Option<SectionIndex>,
    /// Offset within the section; absolute value for absolute symbols;
    /// allocation size for common symbols.
    pub offset: u64,
    pub is_absolute: bool,
    pub is_common: bool,
    pub is_weak: bool,
    pub resolution: Resolution,
}

/// The global symbol table: arena, public symbol map, unresolved worklist.
pub struct SymbolTable {
    entries: Vec<SymbolEntry>,
    public: HashMap<String, SymbolId>,
    worklist: VecDeque<SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            public: HashMap::with_capacity(PUBLIC_MAP_CAPACITY),
            worklist: VecDeque::with_capacity(WORKLIST_CAPACITY),
        }
    }

    fn push(&mut self, entry: SymbolEntry) -> SymbolId {
        let id = SymbolId(self.entries.len());
        self.entries.push(entry);
        id
    }

    /// Record a definition contributed by `object`. A strong definition
    /// overrides an earlier weak or common one; otherwise the first
    /// definition wins and later duplicates are ignored.
    pub fn define(
        &mut self,
        name: &str,
        object: usize,
        section: Option<SectionIndex>,
        offset: u64,
        is_absolute: bool,
        is_weak: bool,
    ) -> SymbolId {
        if let Some(&id) = self.public.get(name) {
            let existing = &self.entries[id.0];
            if !is_weak && (existing.is_weak || existing.is_common) {
                let entry = &mut self.entries[id.0];
                entry.defining_object = Some(object);
                entry.section = section;
                entry.offset = offset;
                entry.is_absolute = is_absolute;
                entry.is_common = false;
                entry.is_weak = false;
                entry.resolution = Resolution::Local { target: id };
            }
            return id;
        }
        let id = self.push(SymbolEntry {
            name: name.to_string(),
            defining_object: Some(object),
            referencing_object: None,
            section,
            offset,
            is_absolute,
            is_common: false,
            is_weak,
            resolution: Resolution::Unresolved,
        });
        self.entries[id.0].resolution = Resolution::Local { target: id };
        self.public.insert(name.to_string(), id);
        id
    }

    /// Record a common (uninitialized-data) symbol. The largest size wins;
    /// any real definition beats a common one.
    pub fn define_common(&mut self, name: &str, object: usize, size: u64) -> SymbolId {
        if let Some(&id) = self.public.get(name) {
            let existing = &mut self.entries[id.0];
            if existing.is_common && size > existing.offset {
                existing.offset = size;
            }
            return id;
        }
        let id = self.push(SymbolEntry {
            name: name.to_string(),
            defining_object: Some(object),
            referencing_object: None,
            section: None,
            offset: size,
            is_absolute: false,
            is_common: true,
            is_weak: false,
            resolution: Resolution::Unresolved,
        });
        self.entries[id.0].resolution = Resolution::Local { target: id };
        self.public.insert(name.to_string(), id);
        id
    }

    /// Record an unresolved reference made by `object` and queue it for
    /// resolution. References never enter the public map directly.
    pub fn reference(&mut self, name: &str, object: usize, is_weak: bool) -> SymbolId {
        let id = self.push(SymbolEntry {
            name: name.to_string(),
            defining_object: None,
            referencing_object: Some(object),
            section: None,
            offset: 0,
            is_absolute: false,
            is_common: false,
            is_weak,
            resolution: Resolution::Unresolved,
        });
        self.worklist.push_back(id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.public.get(name).copied()
    }

    /// Re-register `name` in the public map as an alias of `target`, so
    /// later lookups for the same spelling are plain map hits.
    pub fn alias(&mut self, name: &str, target: SymbolId) {
        self.public.insert(name.to_string(), target);
    }

    /// Bind `id` to the map entry `target`, propagating a DLL import or
    /// tolerated-weak binding if the target carries one.
    pub fn bind(&mut self, id: SymbolId, target: SymbolId) {
        self.entries[id.0].resolution = match self.entries[target.0].resolution {
            Resolution::DllImport { import, .. } => Resolution::DllImport { target, import },
            Resolution::Weak => Resolution::Weak,
            _ => Resolution::Local { target },
        };
    }

    /// Bind `id` directly to a registered DLL import, and mark the public
    /// map entry for its name the same way so later references inherit it.
    pub fn bind_import(&mut self, id: SymbolId, target: SymbolId, import: ImportId) {
        self.entries[target.0].resolution = Resolution::DllImport { target, import };
        self.entries[id.0].resolution = Resolution::DllImport { target, import };
    }

    /// Accept a weak external as resolved-by-default and record the name in
    /// the public map as tolerated-unresolved.
    pub fn accept_weak(&mut self, id: SymbolId) {
        self.entries[id.0].resolution = Resolution::Weak;
        let name = self.entries[id.0].name.clone();
        self.public.entry(name).or_insert(id);
    }

    pub fn entry(&self, id: SymbolId) -> &SymbolEntry {
        &self.entries[id.0]
    }

    pub fn pop_unresolved(&mut self) -> Option<SymbolId> {
        self.worklist.pop_front()
    }

    /// Put entries that failed to resolve back on the worklist, so the list
    /// is non-empty exactly when resolution failed.
    pub fn requeue_failed(&mut self, failed: Vec<SymbolId>) {
        self.worklist.extend(failed);
    }

    pub fn unresolved_count(&self) -> usize {
        self.worklist.len()
    }

    pub fn public_count(&self) -> usize {
        self.public.len()
    }

    pub fn public_entries(&self) -> impl Iterator<Item = (&str, SymbolId)> {
        self.public.iter().map(|(name, &id)| (name.as_str(), id))
    }

    /// Common symbols needing an allocation in the output's zero-fill data.
    pub fn common_symbols(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.public
            .values()
            .copied()
            .filter(|id| self.entries[id.0].is_common)
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Resolution, SymbolTable};
    use object::read::SectionIndex;

    #[test]
    fn strong_definition_overrides_weak() {
        let mut table = SymbolTable::new();
        let weak = table.define("_f", 0, Some(SectionIndex(1)), 0x10, false, true);
        let strong = table.define("_f", 1, Some(SectionIndex(2)), 0x20, false, false);
        assert_eq!(weak, strong);
        let entry = table.entry(strong);
        assert_eq!(entry.defining_object, Some(1));
        assert_eq!(entry.offset, 0x20);
        assert!(!entry.is_weak);
    }

    #[test]
    fn first_strong_definition_wins() {
        let mut table = SymbolTable::new();
        let first = table.define("_f", 0, Some(SectionIndex(1)), 0, false, false);
        let second = table.define("_f", 1, Some(SectionIndex(1)), 8, false, false);
        assert_eq!(first, second);
        assert_eq!(table.entry(first).defining_object, Some(0));
        assert_eq!(table.public_count(), 1);
    }

    #[test]
    fn common_symbols_keep_largest_size() {
        let mut table = SymbolTable::new();
        let id = table.define_common("_buf", 0, 16);
        table.define_common("_buf", 1, 64);
        table.define_common("_buf", 2, 4);
        assert_eq!(table.entry(id).offset, 64);

        // A real definition replaces the common allocation.
        table.define("_buf", 3, Some(SectionIndex(1)), 0, false, false);
        assert!(!table.entry(id).is_common);
        assert_eq!(table.entry(id).defining_object, Some(3));
    }

    #[test]
    fn references_queue_in_fifo_order() {
        let mut table = SymbolTable::new();
        let a = table.reference("_a", 0, false);
        let b = table.reference("_b", 0, false);
        assert_eq!(table.unresolved_count(), 2);
        assert_eq!(table.pop_unresolved(), Some(a));
        assert_eq!(table.pop_unresolved(), Some(b));
        assert_eq!(table.pop_unresolved(), None);
    }

    #[test]
    fn bind_resolves_to_map_entry() {
        let mut table = SymbolTable::new();
        let def = table.define("_f", 0, Some(SectionIndex(1)), 0, false, false);
        let reference = table.reference("_f", 1, false);
        table.bind(reference, def);
        assert_eq!(
            table.entry(reference).resolution,
            Resolution::Local { target: def }
        );
    }

    #[test]
    fn bind_propagates_weak_tolerance() {
        let mut table = SymbolTable::new();
        let first = table.reference("_maybe", 0, true);
        table.pop_unresolved();
        table.accept_weak(first);

        let second = table.reference("_maybe", 1, false);
        let target = table.lookup("_maybe").unwrap();
        table.bind(second, target);
        assert_eq!(table.entry(second).resolution, Resolution::Weak);
    }

    #[test]
    fn accepted_weak_enters_public_map() {
        let mut table = SymbolTable::new();
        let reference = table.reference("_maybe", 0, true);
        table.pop_unresolved();
        table.accept_weak(reference);
        assert_eq!(table.entry(reference).resolution, Resolution::Weak);
        assert_eq!(table.lookup("_maybe"), Some(reference));
        assert_eq!(table.unresolved_count(), 0);
    }
}
