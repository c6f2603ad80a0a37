//! Error types for the amiko core.
//!
//! Every public operation returns a `Result` with a specific failure kind.
//! Malformed inbound packets never surface as errors to the embedder; they
//! are dropped inside the tick with a debug log.

use thiserror::Error;

/// Core error type for amiko operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No friend exists with the given friend number.
    #[error("no friend with that number")]
    NoSuchFriend,

    /// No live transfer exists with the given file number.
    #[error("no transfer with that file number")]
    NoSuchTransfer,

    /// No call exists at the given call index.
    #[error("no call at that index")]
    NoSuchCall,

    /// The friend is not connected; this engine rejects immediately
    /// rather than queueing.
    #[error("friend is not connected")]
    FriendOffline,

    /// A friend with this public key is already in the table.
    #[error("friend already present")]
    AlreadyFriend,

    /// Attempted to add our own address as a friend.
    #[error("cannot add own address")]
    OwnAddress,

    /// Address failed checksum validation or has the wrong length.
    #[error("malformed address")]
    MalformedAddress,

    /// A name, status message, friend-request message or filename
    /// exceeds its length bound.
    #[error("value exceeds its length bound")]
    TooLong,

    /// The friend table has no free slot.
    #[error("friend table is full")]
    TooManyFriends,

    /// The per-friend, per-direction file-number space (0-255) is full.
    #[error("no free file number for this friend")]
    TooManyTransfers,

    /// All call slots are occupied.
    #[error("no free call slot")]
    TooManyCalls,

    /// A live call with this friend already exists.
    #[error("already in a call with this friend")]
    AlreadyInCall,

    /// The call is not in a state that permits the requested transition.
    #[error("operation not valid in the current call state")]
    InvalidCallState,

    /// The transfer is not in a state that permits the requested control.
    #[error("operation not valid in the current transfer state")]
    InvalidTransferState,

    /// Codec settings are outside the supported range.
    #[error("codec settings out of supported range")]
    InvalidSettings,

    /// A file data chunk exceeds the transport limit.
    #[error("data chunk exceeds transport limit")]
    ChunkTooLarge,

    /// Video plane geometry does not match the declared dimensions.
    #[error("plane geometry does not match frame dimensions")]
    BadGeometry,

    /// Cryptographic operation failed. Details are intentionally vague.
    #[error("cryptographic operation failed")]
    Crypto,

    /// A public key is not a valid key.
    #[error("invalid public key")]
    InvalidKey,

    /// Wire encoding or decoding failed. Triggers silent drop on receive.
    #[error("malformed packet")]
    Protocol(String),

    /// The underlying transport failed to send. Never fatal to the session.
    #[error("transport send failed")]
    Transport(String),

    /// The bootstrap host could not be resolved.
    #[error("could not resolve bootstrap host")]
    Resolution(String),

    /// A persisted snapshot is truncated or malformed. Nothing was loaded.
    #[error("persisted state is corrupt")]
    CorruptData,
}

/// Coarse failure taxonomy for embedders that do not want to match
/// every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A handle, file number or call index does not exist.
    NotFound,
    /// The operation is not valid in the current protocol state.
    InvalidState,
    /// A handle, file-number or call-slot space is exhausted.
    ResourceExhausted,
    /// Malformed or oversized input.
    Validation,
    /// The underlying transport or routing layer failed.
    Transport,
    /// A persisted snapshot failed to load.
    CorruptData,
}

impl Error {
    /// Map this error onto the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoSuchFriend | Error::NoSuchTransfer | Error::NoSuchCall => ErrorKind::NotFound,
            Error::FriendOffline
            | Error::AlreadyInCall
            | Error::InvalidCallState
            | Error::InvalidTransferState => ErrorKind::InvalidState,
            Error::TooManyFriends | Error::TooManyTransfers | Error::TooManyCalls => {
                ErrorKind::ResourceExhausted
            }
            Error::AlreadyFriend
            | Error::OwnAddress
            | Error::MalformedAddress
            | Error::TooLong
            | Error::InvalidSettings
            | Error::ChunkTooLarge
            | Error::BadGeometry
            | Error::Crypto
            | Error::InvalidKey
            | Error::Protocol(_) => ErrorKind::Validation,
            Error::Transport(_) | Error::Resolution(_) => ErrorKind::Transport,
            Error::CorruptData => ErrorKind::CorruptData,
        }
    }
}

/// Result type alias using the amiko `Error`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::NoSuchFriend.kind(), ErrorKind::NotFound);
        assert_eq!(Error::FriendOffline.kind(), ErrorKind::InvalidState);
        assert_eq!(Error::TooManyTransfers.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(Error::MalformedAddress.kind(), ErrorKind::Validation);
        assert_eq!(Error::Transport("down".into()).kind(), ErrorKind::Transport);
        assert_eq!(Error::CorruptData.kind(), ErrorKind::CorruptData);
    }
}
