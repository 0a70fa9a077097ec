//! Fixed-capacity reorder buffer for out-of-order worker results.
//!
//! Results are slotted by `index % capacity`. The pipeline's in-flight window
//! guarantees that at most `capacity` indices are unresolved at any instant, so
//! two live indices can never collide on a slot; a collision means the window
//! invariant was broken and is reported as an internal pipeline error.

use crate::foundation::error::{FramepipeError, FramepipeResult};

/// A buffered result: the transformed frame, or the failure marker that lets
/// the drain skip the index.
#[derive(Debug)]
pub(crate) enum Slot<P> {
    Done(P),
    Failed(String),
}

pub(crate) struct ReorderBuffer<P> {
    slots: Vec<Option<(u64, Slot<P>)>>,
    occupied: usize,
    max_occupied: usize,
}

impl<P> ReorderBuffer<P> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            occupied: 0,
            max_occupied: 0,
        }
    }

    fn position(&self, index: u64) -> usize {
        (index % self.slots.len() as u64) as usize
    }

    pub(crate) fn insert(&mut self, index: u64, slot: Slot<P>) -> FramepipeResult<()> {
        let pos = self.position(index);
        if let Some((held, _)) = &self.slots[pos] {
            return Err(FramepipeError::pipeline(format!(
                "reorder buffer slot collision: index {index} vs buffered {held}"
            )));
        }
        self.slots[pos] = Some((index, slot));
        self.occupied += 1;
        self.max_occupied = self.max_occupied.max(self.occupied);
        Ok(())
    }

    /// Remove and return the slot for `index`, if buffered.
    pub(crate) fn take(&mut self, index: u64) -> Option<Slot<P>> {
        let pos = self.position(index);
        match &self.slots[pos] {
            Some((held, _)) if *held == index => {
                let (_, slot) = self.slots[pos].take()?;
                self.occupied -= 1;
                Some(slot)
            }
            _ => None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// High-water mark of simultaneously buffered entries.
    pub(crate) fn max_occupancy(&self) -> usize {
        self.max_occupied
    }
}
