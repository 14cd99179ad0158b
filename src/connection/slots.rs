use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Registration order of an operation within one connection.
///
/// Positions are handed out in strictly increasing order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(u64);

impl Position {
    pub const fn new(value: u64) -> Self {
        Position(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Append-only slot table addressed by [`Position`].
///
/// Slot `i` of `slots` holds position `base + i`. Emptied slots at the front
/// are dropped and `base` advances, so memory tracks the live window while
/// `next_position() == base + slots.len()` never decreases.
pub(crate) struct SlotTable<T> {
    base: u64,
    slots: VecDeque<Option<T>>,
    occupied: usize,
}

impl<T> SlotTable<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        SlotTable {
            base: 0,
            slots: VecDeque::with_capacity(capacity),
            occupied: 0,
        }
    }

    pub(crate) fn next_position(&self) -> Position {
        Position(self.base + self.slots.len() as u64)
    }

    pub(crate) fn len(&self) -> usize {
        self.occupied
    }

    pub(crate) fn insert(&mut self, value: T) -> Position {
        let position = self.next_position();
        self.slots.push_back(Some(value));
        self.occupied += 1;
        position
    }

    pub(crate) fn get(&self, position: Position) -> Option<&T> {
        let index = self.index_of(position)?;
        self.slots.get(index)?.as_ref()
    }

    pub(crate) fn remove(&mut self, position: Position) -> Option<T> {
        let index = self.index_of(position)?;
        let value = self.slots.get_mut(index)?.take()?;
        self.occupied -= 1;
        while let Some(None) = self.slots.front() {
            self.slots.pop_front();
            self.base += 1;
        }
        Some(value)
    }

    /// Occupied slots at or after `from`, in ascending position order.
    pub(crate) fn iter_from(&self, from: Position) -> impl Iterator<Item = (Position, &T)> + '_ {
        let skip = from.0.saturating_sub(self.base) as usize;
        let base = self.base;
        self.slots
            .iter()
            .enumerate()
            .skip(skip)
            .filter_map(move |(index, slot)| {
                slot.as_ref()
                    .map(|value| (Position(base + index as u64), value))
            })
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Position, &T)> + '_ {
        self.iter_from(Position(self.base))
    }

    fn index_of(&self, position: Position) -> Option<usize> {
        position
            .0
            .checked_sub(self.base)
            .map(|offset| offset as usize)
            .filter(|offset| *offset < self.slots.len())
    }
}
