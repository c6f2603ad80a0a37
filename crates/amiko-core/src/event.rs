//! Session events.
//!
//! Events are buffered in an internal queue during the tick and the
//! synchronous operations, then drained by the caller through
//! [`crate::Session::poll_event`]. No callbacks run inside packet
//! processing, so the embedder can never re-enter the engine mid-dispatch.
//! All payloads are owned values.

use crate::crypto::PublicKey;
use crate::friend::{ConnectionStatus, FriendNumber, UserStatus};
use crate::transfer::{ControlAction, Direction};

/// One session event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An unsolicited friend request arrived with a matching nospam.
    FriendRequest {
        /// The requester's public key.
        public_key: PublicKey,
        /// Their greeting.
        message: Vec<u8>,
    },
    /// A text message arrived.
    Message {
        /// Sending friend.
        friend: FriendNumber,
        /// Message body.
        message: Vec<u8>,
    },
    /// An action message arrived.
    Action {
        /// Sending friend.
        friend: FriendNumber,
        /// Action body.
        action: Vec<u8>,
    },
    /// A friend changed their display name.
    NameChange {
        /// The friend.
        friend: FriendNumber,
        /// The new name.
        name: Vec<u8>,
    },
    /// A friend changed their status message.
    StatusMessageChange {
        /// The friend.
        friend: FriendNumber,
        /// The new status message.
        message: Vec<u8>,
    },
    /// A friend changed their presence status.
    UserStatusChange {
        /// The friend.
        friend: FriendNumber,
        /// The new status.
        status: UserStatus,
    },
    /// A friend started or stopped typing.
    TypingChange {
        /// The friend.
        friend: FriendNumber,
        /// The new typing flag.
        typing: bool,
    },
    /// A friend confirmed reading one of our messages.
    ReadReceipt {
        /// The friend.
        friend: FriendNumber,
        /// The id returned from `send_message`.
        message_id: u32,
    },
    /// A friend's connection status changed.
    ConnectionStatusChange {
        /// The friend.
        friend: FriendNumber,
        /// The new status.
        status: ConnectionStatus,
    },
    /// A friend offered to send us a file.
    FileSendRequest {
        /// The friend.
        friend: FriendNumber,
        /// Their file number for the transfer.
        file_number: u8,
        /// Total size in bytes.
        file_size: u64,
        /// Suggested filename.
        filename: Vec<u8>,
    },
    /// A friend sent a file control.
    FileControl {
        /// The friend.
        friend: FriendNumber,
        /// The affected transfer's local direction.
        direction: Direction,
        /// The file number.
        file_number: u8,
        /// The control verb.
        control: ControlAction,
    },
    /// A file data chunk arrived.
    FileData {
        /// The friend.
        friend: FriendNumber,
        /// The file number.
        file_number: u8,
        /// Byte offset of this chunk within the file.
        position: u64,
        /// Chunk bytes.
        data: Vec<u8>,
    },
}
