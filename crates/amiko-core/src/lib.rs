//! # amiko core
//!
//! A peer-to-peer encrypted messenger core: a session object that keeps
//! friend relationships, exchanges encrypted messages, negotiates chunked
//! file transfers, and signals audio/video calls, all over a pluggable
//! routing transport.
//!
//! ## Model
//!
//! The engine is single-threaded-cooperative. The embedding application
//! drives [`Session::tick`] on the interval it returns; the tick drains the
//! network, advances every component and buffers events, which the caller
//! collects afterwards with [`Session::poll_event`]. Nothing blocks and no
//! callback ever runs inside packet processing.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │               Application                 │
//! ├───────────────────────────────────────────┤
//! │    session (tick, events)   │     av      │
//! ├───────────────────────────────────────────┤
//! │  friend  │  transfer  │  protocol (wire)  │
//! ├───────────────────────────────────────────┤
//! │       crypto        │      identity       │
//! └───────────────────────────────────────────┘
//! ```
//!
//! The call subsystem ([`Av`]) is layered on top with its own lifecycle and
//! event stream; it borrows the session for signaling transport.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod av;
pub mod crypto;
pub mod error;
pub mod event;
pub mod friend;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod transfer;

pub use av::{Av, AvEvent, CallIndex, CallState, CallType, Capabilities, CodecSettings};
pub use crypto::PublicKey;
pub use error::{Error, ErrorKind, Result};
pub use event::Event;
pub use friend::{ConnectionStatus, FriendNumber, UserStatus};
pub use identity::{Address, Identity};
pub use session::{MemoryHub, MemoryTransport, Session, SessionConfig, Transport};
pub use transfer::{ControlAction, Direction, TransferState};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum display name length in bytes.
pub const MAX_NAME_LENGTH: usize = 128;

/// Maximum status message length in bytes.
pub const MAX_STATUS_MESSAGE_LENGTH: usize = 128;

/// Maximum text message length in bytes.
pub const MAX_MESSAGE_LENGTH: usize = 1368;

/// Maximum friend-request greeting length in bytes.
pub const MAX_FRIEND_REQUEST_LENGTH: usize = 1016;

/// Maximum filename length in bytes.
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Maximum file data chunk size in bytes, bounded by the transport MTU.
pub const MAX_FILE_DATA_SIZE: usize = 1371;
