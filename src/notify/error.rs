use std::io;

use super::cluster::ValueType;
use super::{ItemId, Rank};

/// Error surfaced by any top-level resolve. The first collaborator failure
/// halts the current pass; the NotifySet is left partially drained and must
/// not be retried.
#[derive(Debug)]
pub enum NotifyError {
    Store(StoreError),
    Dispatch(DispatchError),
    Transport(TransportError),
    /// A remote server answered a single-item notify request with a nonzero
    /// code.
    RemoteRefused { server: Rank, code: i32 },
}

impl From<StoreError> for NotifyError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<DispatchError> for NotifyError {
    fn from(e: DispatchError) -> Self {
        Self::Dispatch(e)
    }
}

impl From<TransportError> for NotifyError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Failure reported by the storage collaborator.
#[derive(Debug)]
pub enum StoreError {
    NotFound(ItemId),
    WrongType { id: ItemId, vtype: ValueType },
    Refused { id: ItemId, code: i32 },
}

/// Failure reported by the work-queue collaborator.
#[derive(Debug)]
pub enum DispatchError {
    QueueClosed,
    Refused(i32),
}

/// Failure reported by the transport collaborator. Stuck or unreachable
/// peers are handled below this subsystem; there is no timeout here.
#[derive(Debug)]
pub enum TransportError {
    Closed(Rank),
    Io(io::Error),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
