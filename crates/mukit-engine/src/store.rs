//! Per-chat summary state: at most one entry per category.

use mukit_core::Entry;

/// Whether an upsert filled a new slot or overwrote an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

#[derive(Clone, Debug)]
struct Slot {
    entry: Entry,
    /// Monotonic write counter; the highest value is the most recent write.
    touched: u64,
}

/// Category-keyed entries in first-insertion order.
///
/// Replacing a category keeps its position; only brand-new categories are
/// appended. This keeps the rendered summary stable as entries are updated.
#[derive(Clone, Debug, Default)]
pub struct SummaryStore {
    slots: Vec<Slot>,
    seq: u64,
}

impl SummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `entry.category`.
    pub fn upsert(&mut self, entry: Entry) -> Upsert {
        self.seq += 1;
        let touched = self.seq;
        if let Some(slot) = self.slots.iter_mut().find(|s| s.entry.category == entry.category) {
            slot.entry = entry;
            slot.touched = touched;
            Upsert::Replaced
        } else {
            self.slots.push(Slot { entry, touched });
            Upsert::Inserted
        }
    }

    /// Drop the most recently written entry.
    pub fn remove_last(&mut self) -> Option<Entry> {
        let idx = self
            .slots
            .iter()
            .enumerate()
            .max_by_key(|(_, s)| s.touched)
            .map(|(i, _)| i)?;
        Some(self.slots.remove(idx).entry)
    }

    /// Empty the store. Idempotent.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn get(&self, category: &str) -> Option<&Entry> {
        self.slots.iter().map(|s| &s.entry).find(|e| e.category == category)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            entries: self.slots.iter().map(|s| s.entry.clone()).collect(),
        }
    }
}

/// Immutable copy of a store's entries, in display order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: Vec<Entry>,
}

impl Snapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.category.as_str())
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
