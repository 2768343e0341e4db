//! Single-assignment result storage.
//!
//! A [`ResultCell`] holds the outcome of one task: either a value or an
//! error, stored at most once and consumed at most once. The cell remembers
//! what was taken so the task layer can tell a value double-consumption (a
//! hard defect) apart from an error re-read (tolerated at that layer when
//! cancellation is involved).
//!
//! Cleanup of an unconsumed stored value is its `Drop` impl, which runs when
//! the cell is dropped; `take` hands the value out without running cleanup.

use crate::error::Error;

/// Outcome of a store attempt on a cell that was not empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AlreadyStored;

/// What [`ResultCell::take`] found.
pub(crate) enum Taken<T> {
    /// The stored value, ownership transferred to the caller.
    Value(T),
    /// The stored error, ownership transferred to the caller.
    Error(Error),
    /// Nothing was ever stored.
    Empty,
    /// The result was already consumed.
    AlreadyTaken,
}

enum CellState<T> {
    Empty,
    Value(T),
    Error(Error),
    ValueTaken,
    ErrorTaken,
}

pub(crate) struct ResultCell<T> {
    state: CellState<T>,
}

impl<T> ResultCell<T> {
    pub(crate) const fn new() -> Self {
        Self {
            state: CellState::Empty,
        }
    }

    /// Stores a value; fails if anything was stored before.
    pub(crate) fn store_value(&mut self, value: T) -> Result<(), AlreadyStored> {
        match self.state {
            CellState::Empty => {
                self.state = CellState::Value(value);
                Ok(())
            }
            _ => Err(AlreadyStored),
        }
    }

    /// Stores an error; fails if anything was stored before.
    pub(crate) fn store_error(&mut self, error: Error) -> Result<(), AlreadyStored> {
        match self.state {
            CellState::Empty => {
                self.state = CellState::Error(error);
                Ok(())
            }
            _ => Err(AlreadyStored),
        }
    }

    /// Consumes the stored result, transferring ownership to the caller.
    pub(crate) fn take(&mut self) -> Taken<T> {
        match std::mem::replace(&mut self.state, CellState::Empty) {
            CellState::Value(value) => {
                self.state = CellState::ValueTaken;
                Taken::Value(value)
            }
            CellState::Error(error) => {
                self.state = CellState::ErrorTaken;
                Taken::Error(error)
            }
            CellState::Empty => Taken::Empty,
            taken @ (CellState::ValueTaken | CellState::ErrorTaken) => {
                self.state = taken;
                Taken::AlreadyTaken
            }
        }
    }

    /// Returns `true` if an error is stored or was consumed from this cell.
    pub(crate) const fn had_error(&self) -> bool {
        matches!(self.state, CellState::Error(_) | CellState::ErrorTaken)
    }

    /// Returns `true` if a result is currently stored and unconsumed.
    pub(crate) const fn is_stored(&self) -> bool {
        matches!(self.state, CellState::Value(_) | CellState::Error(_))
    }
}
