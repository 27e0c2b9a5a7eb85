//! Temporaries and labels.
//!
//! A [Temp] names a storage cell in the abstract machine: ids below
//! [FIRST_NONMACHINE] denote real machine registers, higher ids are
//! compiler-generated.  The size and pointer disposition travel with the
//! temp because the register allocator and the frame-map emitter need them
//! long after the tree types are gone.
//!
//! Counters for fresh temps and labels thread through a [TempState] value
//! rather than global state.

use std::cmp::Ordering;
use std::fmt;

use crate::common::Id;

/// Assembly labels are interned symbols, like identifiers.
pub type Label = Id;

/// Ids below this denote machine registers of the current target.
pub const FIRST_NONMACHINE: u32 = 100;

/// Whether the value held in a cell is a heap pointer the collector must
/// trace.  `Inherit` marks the entry-sequence copies of callee-save
/// registers: whether they hold a pointer is only known to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PtrDispo {
    Ptr,
    NotPtr,
    Inherit,
}

#[derive(Clone, Copy, Debug)]
pub struct Temp {
    pub id: u32,
    pub size: usize,
    pub dispo: PtrDispo,
}

// A temp identifies a cell; size and disposition are attributes of a use
// site, so identity, ordering and hashing go by id alone.
impl PartialEq for Temp {
    fn eq(&self, other: &Temp) -> bool {
        self.id == other.id
    }
}

impl Eq for Temp {}

impl PartialOrd for Temp {
    fn partial_cmp(&self, other: &Temp) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Temp {
    fn cmp(&self, other: &Temp) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::hash::Hash for Temp {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Temp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}.{}", self.id, self.size)
    }
}

impl Temp {
    pub fn is_machine(&self) -> bool {
        self.id < FIRST_NONMACHINE
    }

    /// The same register cell viewed at a different size.
    pub fn with_size(self, size: usize) -> Temp {
        Temp { size, ..self }
    }
}

/// The fresh temp and label counters, threaded through the passes.
pub struct TempState {
    next_temp: u32,
    next_label: u32,
}

impl Default for TempState {
    fn default() -> Self {
        Self::new()
    }
}

impl TempState {
    pub fn new() -> TempState {
        TempState {
            next_temp: FIRST_NONMACHINE,
            next_label: 0,
        }
    }

    pub fn new_temp(&mut self, size: usize, dispo: PtrDispo) -> Temp {
        let id = self.next_temp;
        self.next_temp += 1;
        Temp { id, size, dispo }
    }

    /// A fresh label `L<n>`.
    pub fn new_label(&mut self) -> Label {
        self.prefixed_label("L")
    }

    /// A fresh label with a given prefix, e.g. `ret<n>` for call-return
    /// labels.
    pub fn prefixed_label(&mut self, prefix: &str) -> Label {
        let n = self.next_label;
        self.next_label += 1;
        Id::from(format!("{prefix}{n}"))
    }

    pub fn named_label(&self, name: &str) -> Label {
        Id::from(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temps_count_up_from_the_machine_boundary() {
        let mut ts = TempState::new();
        let a = ts.new_temp(8, PtrDispo::NotPtr);
        let b = ts.new_temp(4, PtrDispo::Ptr);
        assert_eq!(a.id, FIRST_NONMACHINE);
        assert_eq!(b.id, FIRST_NONMACHINE + 1);
        assert!(!a.is_machine());
        assert!(Temp { id: 3, size: 8, dispo: PtrDispo::NotPtr }.is_machine());
    }

    #[test]
    fn temp_identity_ignores_size() {
        let t1 = Temp { id: 100, size: 8, dispo: PtrDispo::NotPtr };
        let t2 = Temp { id: 100, size: 4, dispo: PtrDispo::Ptr };
        assert_eq!(t1, t2);
    }

    #[test]
    fn labels_are_distinct_and_prefixed() {
        let mut ts = TempState::new();
        let l0 = ts.new_label();
        let l1 = ts.new_label();
        assert_eq!(l0.as_ref(), "L0");
        assert_eq!(l1.as_ref(), "L1");
        let r = ts.prefixed_label("ret");
        assert_eq!(r.as_ref(), "ret2");
    }
}
