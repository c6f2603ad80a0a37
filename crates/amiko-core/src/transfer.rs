//! File transfer slots and control state machine.
//!
//! Transfers are identified by a single byte scoped per friend and per
//! direction, so at most 256 concurrent transfers can run each way with one
//! friend. The underlying transport multiplexes on that byte; the bound is
//! part of the wire contract. A killed or finished transfer's number is
//! immediately reusable.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Transfer direction from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We are the sender.
    Sending,
    /// We are the receiver.
    Receiving,
}

impl Direction {
    /// The same transfer seen from the other side.
    pub fn flip(self) -> Self {
        match self {
            Direction::Sending => Direction::Receiving,
            Direction::Receiving => Direction::Sending,
        }
    }
}

/// Control verbs exchanged over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlAction {
    /// Accept a requested transfer, or resume a paused one.
    Accept = 0,
    /// Pause a running transfer.
    Pause = 1,
    /// Terminate the transfer. Terminal from any state.
    Kill = 2,
    /// Sender signals completion. Terminal.
    Finished = 3,
}

impl ControlAction {
    /// Parse from the wire byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Accept),
            1 => Ok(Self::Pause),
            2 => Ok(Self::Kill),
            3 => Ok(Self::Finished),
            _ => Err(Error::Protocol(format!("unknown file control {byte}"))),
        }
    }

    /// The wire byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// True for controls that end the transfer.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Kill | Self::Finished)
    }
}

/// Transfer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Offered, not yet accepted.
    Requested,
    /// Accepted; no data has moved yet.
    Accepted,
    /// Paused by either side.
    Paused,
    /// Data is flowing.
    Transferring,
    /// Sender signaled completion. Terminal.
    Finished,
    /// Killed by either side. Terminal.
    Killed,
}

/// One file transfer slot.
#[derive(Debug, Clone)]
pub struct Transfer {
    file_number: u8,
    direction: Direction,
    file_size: u64,
    transferred: u64,
    state: TransferState,
    filename: Vec<u8>,
}

impl Transfer {
    fn new(file_number: u8, direction: Direction, file_size: u64, filename: Vec<u8>) -> Self {
        Self {
            file_number,
            direction,
            file_size,
            transferred: 0,
            state: TransferState::Requested,
            filename,
        }
    }

    /// The friend-scoped file number.
    pub fn file_number(&self) -> u8 {
        self.file_number
    }

    /// Direction from the local point of view.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Total size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes moved so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Bytes left to move.
    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.transferred)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Suggested filename.
    pub fn filename(&self) -> &[u8] {
        &self.filename
    }

    /// True once data may flow.
    pub fn is_running(&self) -> bool {
        matches!(self.state, TransferState::Accepted | TransferState::Transferring)
    }

    /// Apply a non-terminal control to this transfer.
    ///
    /// Terminal controls (`Kill`, `Finished`) are handled by the table,
    /// which removes the slot; calling this with one is a state error.
    pub fn apply_control(&mut self, action: ControlAction) -> Result<()> {
        let next = match (self.state, action) {
            (TransferState::Requested, ControlAction::Accept) => TransferState::Accepted,
            (TransferState::Paused, ControlAction::Accept) => TransferState::Transferring,
            (TransferState::Accepted, ControlAction::Pause)
            | (TransferState::Transferring, ControlAction::Pause) => TransferState::Paused,
            _ => return Err(Error::InvalidTransferState),
        };
        self.state = next;
        Ok(())
    }

    /// Account for a chunk moving in either direction.
    pub fn advance(&mut self, bytes: usize) {
        self.state = TransferState::Transferring;
        self.transferred = self.transferred.saturating_add(bytes as u64);
    }
}

/// Per-friend transfer slots, one number space per direction.
#[derive(Debug, Clone, Default)]
pub struct TransferTable {
    sending: HashMap<u8, Transfer>,
    receiving: HashMap<u8, Transfer>,
}

impl TransferTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, direction: Direction) -> &HashMap<u8, Transfer> {
        match direction {
            Direction::Sending => &self.sending,
            Direction::Receiving => &self.receiving,
        }
    }

    fn map_mut(&mut self, direction: Direction) -> &mut HashMap<u8, Transfer> {
        match direction {
            Direction::Sending => &mut self.sending,
            Direction::Receiving => &mut self.receiving,
        }
    }

    /// Allocate the lowest free outgoing file number.
    pub fn allocate_sending(&mut self, file_size: u64, filename: Vec<u8>) -> Result<u8> {
        let number = (0..=u8::MAX)
            .find(|n| !self.sending.contains_key(n))
            .ok_or(Error::TooManyTransfers)?;
        self.sending.insert(
            number,
            Transfer::new(number, Direction::Sending, file_size, filename),
        );
        Ok(number)
    }

    /// Register an incoming transfer under the sender-assigned number.
    ///
    /// A duplicate offer for an occupied number replaces the old slot;
    /// the peer has evidently forgotten it.
    pub fn insert_receiving(&mut self, file_number: u8, file_size: u64, filename: Vec<u8>) {
        self.receiving.insert(
            file_number,
            Transfer::new(file_number, Direction::Receiving, file_size, filename),
        );
    }

    /// Look up a live transfer.
    pub fn get(&self, direction: Direction, file_number: u8) -> Option<&Transfer> {
        self.map(direction).get(&file_number)
    }

    /// Look up a live transfer mutably.
    pub fn get_mut(&mut self, direction: Direction, file_number: u8) -> Option<&mut Transfer> {
        self.map_mut(direction).get_mut(&file_number)
    }

    /// Remove a slot, freeing its number for reuse.
    pub fn remove(&mut self, direction: Direction, file_number: u8) -> Option<Transfer> {
        self.map_mut(direction).remove(&file_number)
    }

    /// Number of live transfers in one direction.
    pub fn len(&self, direction: Direction) -> usize {
        self.map(direction).len()
    }

    /// True when no transfers are live in either direction.
    pub fn is_empty(&self) -> bool {
        self.sending.is_empty() && self.receiving.is_empty()
    }
}
