//! Last-results FIFO
//!
//! Bounded ring of the most recent top-level expression results evaluated
//! in immediate mode. `last(1)` is the newest entry. String payloads are
//! deep copies owned by the FIFO and tracked in their own accounting
//! category.

use crate::accounting::{HeapAudit, StringClass};
use crate::value::{Value, ValueType};
use crate::MAX_LAST_RESULT_DEPTH;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct LastResults {
    entries: VecDeque<(Value, ValueType)>,
}

impl LastResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a freshly completed top-level result. The oldest entry falls
    /// off when the ring is full; its string is freed here.
    pub fn push(&mut self, value: Value, audit: &mut HeapAudit) {
        if self.entries.len() == MAX_LAST_RESULT_DEPTH {
            if let Some((Value::Str(Some(_)), _)) = self.entries.pop_back() {
                audit.on_destroy(StringClass::LastValue);
            }
        }
        if matches!(value, Value::Str(Some(_))) {
            audit.on_create(StringClass::LastValue);
        }
        let vtype = value.value_type();
        self.entries.push_front((value, vtype));
    }

    /// Retrieve entry `k`, 1 = newest. Strings come back as deep copies.
    pub fn get(&self, k: usize) -> Option<Value> {
        if k == 0 {
            return None;
        }
        self.entries.get(k - 1).map(|(v, _)| v.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries, freeing strings.
    pub fn clear(&mut self, audit: &mut HeapAudit) {
        while let Some((v, _)) = self.entries.pop_front() {
            if matches!(v, Value::Str(Some(_))) {
                audit.on_destroy(StringClass::LastValue);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_first() {
        let mut fifo = LastResults::new();
        let mut audit = HeapAudit::new();
        fifo.push(Value::Long(1), &mut audit);
        fifo.push(Value::Long(2), &mut audit);
        assert_eq!(fifo.get(1), Some(Value::Long(2)));
        assert_eq!(fifo.get(2), Some(Value::Long(1)));
        assert_eq!(fifo.get(3), None);
        assert_eq!(fifo.get(0), None);
    }

    #[test]
    fn test_eviction_frees_strings() {
        let mut fifo = LastResults::new();
        let mut audit = HeapAudit::new();
        for i in 0..(MAX_LAST_RESULT_DEPTH + 2) {
            fifo.push(Value::str_from(&format!("s{}", i)), &mut audit);
        }
        assert_eq!(fifo.len(), MAX_LAST_RESULT_DEPTH);
        fifo.clear(&mut audit);
        assert!(audit.all_balanced());
        assert!(fifo.is_empty());
    }
}
