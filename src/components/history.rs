use std::collections::VecDeque;

use crate::canvas::{PixelRecord, PixelSnapshot, PixelStore};

// ============================================================================
// HISTORY ENTRY
// ============================================================================

/// A complete copy of the pixel store taken at a checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub description: String,
    pub pixels: PixelSnapshot,
}

impl HistoryEntry {
    pub fn capture(description: impl Into<String>, store: &PixelStore) -> Self {
        Self {
            description: description.into(),
            pixels: store.snapshot(),
        }
    }

    fn memory_size(&self) -> usize {
        self.pixels
            .iter()
            .map(|p| std::mem::size_of::<PixelRecord>() + p.author_id.len())
            .sum()
    }
}

// ============================================================================
// HISTORY STACK
// ============================================================================

/// Bounded undo/redo over full store snapshots.
///
/// `entries[index]` is the state the store was last checkpointed at (or
/// moved to by undo/redo). Checkpoint *before* a gesture; edits made after
/// the last checkpoint are captured as a tail entry on the next undo so
/// redo can return to them.
pub struct HistoryStack {
    entries: VecDeque<HistoryEntry>,
    index: usize,
    max_history_size: usize,
    /// Running memory total across all entries.
    total_memory: usize,
}

impl HistoryStack {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            index: 0,
            max_history_size: max_history_size.max(1),
            total_memory: 0,
        }
    }

    /// Record the current store contents. Anything after the current index
    /// is discarded, unless the store still matches the current entry: then
    /// nothing is recorded and redo stays available.
    pub fn checkpoint(&mut self, description: &str, store: &PixelStore) {
        if self.at_current(store) {
            return;
        }
        self.truncate_forward();
        self.push(HistoryEntry::capture(description, store));
    }

    /// Step back one entry. Returns the description of what was undone, or
    /// `None` at the start of the stack.
    pub fn undo(&mut self, store: &mut PixelStore) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let current = store.snapshot();
        if self.entries.get(self.index).is_some_and(|e| e.pixels != current) {
            self.truncate_forward();
            let description = self.entries[self.index].description.clone();
            self.push(HistoryEntry { description, pixels: current });
        }
        if self.index == 0 {
            return None;
        }
        let undone = self.entries[self.index].description.clone();
        self.index -= 1;
        store.restore(&self.entries[self.index].pixels);
        Some(undone)
    }

    /// Step forward one entry. `None` at the end of the stack, and when the
    /// store was edited since the current entry (that edit ends the redo
    /// branch).
    pub fn redo(&mut self, store: &mut PixelStore) -> Option<String> {
        if self.index + 1 >= self.entries.len() {
            return None;
        }
        if !self.at_current(store) {
            self.truncate_forward();
            return None;
        }
        self.index += 1;
        let entry = &self.entries[self.index];
        store.restore(&entry.pixels);
        Some(entry.description.clone())
    }

    /// Whether `undo` would change `store`.
    pub fn can_undo(&self, store: &PixelStore) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        // at the first entry only uncheckpointed edits can be undone, and
        // only if there is room to keep them for redo
        self.index > 0 || (!self.at_current(store) && self.max_history_size > 1)
    }

    /// Whether `redo` would change `store`.
    pub fn can_redo(&self, store: &PixelStore) -> bool {
        self.index + 1 < self.entries.len() && self.at_current(store)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Approximate bytes held by all snapshots.
    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index = 0;
        self.total_memory = 0;
    }

    /// The store holds exactly what the current entry recorded.
    fn at_current(&self, store: &PixelStore) -> bool {
        self.entries
            .get(self.index)
            .is_some_and(|e| e.pixels.iter().eq(store.iter()))
    }

    fn truncate_forward(&mut self) {
        while self.entries.len() > self.index + 1 {
            if let Some(removed) = self.entries.pop_back() {
                self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
            }
        }
    }

    fn push(&mut self, entry: HistoryEntry) {
        self.total_memory += entry.memory_size();
        self.entries.push_back(entry);
        self.index = self.entries.len() - 1;
        // oldest snapshots go first
        while self.entries.len() > self.max_history_size {
            if let Some(removed) = self.entries.pop_front() {
                self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
            }
            self.index = self.index.saturating_sub(1);
        }
    }
}
