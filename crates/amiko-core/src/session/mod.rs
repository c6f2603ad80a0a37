//! The tick-driven session engine.
//!
//! A [`Session`] owns the identity, the friend table and the event queue,
//! and advances everything from a single synchronous [`Session::tick`]:
//! inbound frames are decrypted and dispatched by packet-type tag, friend
//! liveness is re-evaluated, and keepalives (plus any still-pending friend
//! requests) are flushed. Operations never block on the network; they
//! either hand a frame to the transport or fail immediately.
//!
//! The engine is single-threaded-cooperative: `tick` and every mutating
//! operation take `&mut self`, so concurrent entry is ruled out at compile
//! time. A caller that stops ticking freezes all timeout detection.
//!
//! Malformed, unauthenticated or out-of-state inbound packets are dropped
//! with a debug log; a bad packet never aborts the session.

mod transport;

pub use transport::{MemoryHub, MemoryTransport, Transport};

use crate::av::AvInbound;
use crate::crypto::{self, PublicKey, PUBLIC_KEY_SIZE};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::friend::{ConnectionStatus, FriendNumber, FriendTable, PendingRequest, UserStatus};
use crate::identity::{Address, Identity, NOSPAM_SIZE};
use crate::protocol::{
    ActionPayload, FileControlPayload, FileDataPayload, FileRequestPayload, FriendRequestPayload,
    MessagePayload, Packet,
};
use crate::transfer::{ControlAction, Direction};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Snapshot magic bytes.
const SNAPSHOT_MAGIC: [u8; 4] = *b"AMKS";

/// Snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// Construction-time configuration for a session.
///
/// Carries the initial self profile and the protocol timing knobs; there is
/// no process-wide state anywhere in the engine.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initial display name.
    pub name: Vec<u8>,
    /// Initial status message.
    pub status_message: Vec<u8>,
    /// Upper bound on the friend table.
    pub max_friends: usize,
    /// Recommended interval between ticks.
    pub tick_interval: Duration,
    /// Cadence for keepalives and friend-request retries.
    pub ping_interval: Duration,
    /// Silence after which an online friend drops to connecting.
    pub online_timeout: Duration,
    /// Silence after which a connecting friend drops to offline.
    pub offline_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: Vec::new(),
            status_message: Vec::new(),
            max_friends: 1 << 15,
            tick_interval: Duration::from_millis(50),
            ping_interval: Duration::from_secs(2),
            online_timeout: Duration::from_secs(8),
            offline_timeout: Duration::from_secs(20),
        }
    }
}

/// Persisted form of one friend.
#[derive(Serialize, Deserialize)]
struct FriendSnapshot {
    public_key: [u8; PUBLIC_KEY_SIZE],
    #[serde(with = "serde_bytes")]
    name: Vec<u8>,
    #[serde(with = "serde_bytes")]
    status_message: Vec<u8>,
    user_status: u8,
}

/// Complete persisted session state.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    magic: [u8; 4],
    version: u8,
    secret_key: [u8; PUBLIC_KEY_SIZE],
    nospam: [u8; NOSPAM_SIZE],
    #[serde(with = "serde_bytes")]
    name: Vec<u8>,
    #[serde(with = "serde_bytes")]
    status_message: Vec<u8>,
    user_status: u8,
    friends: Vec<FriendSnapshot>,
}

/// A protocol session: identity, friends, messaging, file transfers, and
/// the packet pump feeding the call subsystem.
pub struct Session {
    identity: Identity,
    config: SessionConfig,
    transport: Box<dyn Transport>,
    friends: FriendTable,
    self_name: Vec<u8>,
    self_status_message: Vec<u8>,
    self_user_status: UserStatus,
    next_message_id: u32,
    events: VecDeque<Event>,
    av_inbox: VecDeque<AvInbound>,
}

impl Session {
    /// Create a session with a freshly generated identity.
    pub fn new(config: SessionConfig, transport: Box<dyn Transport>) -> Result<Self> {
        Self::with_identity(Identity::generate(), config, transport)
    }

    /// Create a session around an existing identity, e.g. one whose public
    /// key the transport was provisioned with.
    pub fn with_identity(
        identity: Identity,
        config: SessionConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        if config.name.len() > crate::MAX_NAME_LENGTH
            || config.status_message.len() > crate::MAX_STATUS_MESSAGE_LENGTH
        {
            return Err(Error::TooLong);
        }

        info!(address = %identity.address(), "session created");

        Ok(Self {
            friends: FriendTable::new(config.max_friends),
            self_name: config.name.clone(),
            self_status_message: config.status_message.clone(),
            self_user_status: UserStatus::None,
            next_message_id: 1,
            events: VecDeque::new(),
            av_inbox: VecDeque::new(),
            identity,
            config,
            transport,
        })
    }

    /// Create a session and load a previously serialized snapshot into it.
    pub fn restore(
        data: &[u8],
        config: SessionConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        let mut session = Self::new(config, transport)?;
        session.load(data)?;
        Ok(session)
    }

    // ---- identity -------------------------------------------------------

    /// Our public address.
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// Our public key.
    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    /// Our current nospam.
    pub fn nospam(&self) -> [u8; NOSPAM_SIZE] {
        self.identity.nospam()
    }

    /// Rotate the nospam, invalidating the published address.
    pub fn set_nospam(&mut self, nospam: [u8; NOSPAM_SIZE]) {
        self.identity.set_nospam(nospam);
    }

    // ---- self profile ---------------------------------------------------

    /// Our display name.
    pub fn name(&self) -> &[u8] {
        &self.self_name
    }

    /// Set our display name and announce it to connected friends.
    pub fn set_name(&mut self, name: &[u8]) -> Result<()> {
        if name.len() > crate::MAX_NAME_LENGTH {
            return Err(Error::TooLong);
        }
        self.self_name = name.to_vec();
        self.broadcast(&Packet::Name(name.to_vec()));
        Ok(())
    }

    /// Our status message.
    pub fn status_message(&self) -> &[u8] {
        &self.self_status_message
    }

    /// Set our status message and announce it to connected friends.
    pub fn set_status_message(&mut self, message: &[u8]) -> Result<()> {
        if message.len() > crate::MAX_STATUS_MESSAGE_LENGTH {
            return Err(Error::TooLong);
        }
        self.self_status_message = message.to_vec();
        self.broadcast(&Packet::StatusMessage(message.to_vec()));
        Ok(())
    }

    /// Our presence status.
    pub fn user_status(&self) -> UserStatus {
        self.self_user_status
    }

    /// Set our presence status and announce it to connected friends.
    pub fn set_user_status(&mut self, status: UserStatus) {
        self.self_user_status = status;
        self.broadcast(&Packet::UserStatus(status.to_byte()));
    }

    // ---- friends --------------------------------------------------------

    /// Add a friend by address and schedule an encrypted friend request.
    ///
    /// The request is resent on the keepalive cadence until the first
    /// authenticated packet arrives from the peer.
    pub fn add_friend(&mut self, address: &Address, message: &[u8]) -> Result<FriendNumber> {
        if message.len() > crate::MAX_FRIEND_REQUEST_LENGTH {
            return Err(Error::TooLong);
        }
        if address.public_key() == self.identity.public_key() {
            return Err(Error::OwnAddress);
        }

        let number = self.friends.add(address.public_key())?;
        let request = PendingRequest {
            nospam: address.nospam(),
            message: message.to_vec(),
        };
        if let Ok(friend) = self.friends.get_mut(number) {
            friend.pending_request = Some(request.clone());
        }

        // First delivery attempt; the tick retries until first contact.
        let packet = Packet::FriendRequest(FriendRequestPayload {
            nospam: request.nospam,
            message: request.message,
        });
        if let Err(e) = self.send_to_key(&address.public_key(), &packet) {
            debug!(error = %e, friend = number, "friend request deferred");
        }

        Ok(number)
    }

    /// Add a pre-authorized friend without sending a request.
    pub fn add_friend_norequest(&mut self, public_key: &PublicKey) -> Result<FriendNumber> {
        if *public_key == self.identity.public_key() {
            return Err(Error::OwnAddress);
        }
        self.friends.add(*public_key)
    }

    /// Delete a friend, releasing the handle and all transfer slots.
    ///
    /// Any in-flight call with this friend is torn down by the call
    /// subsystem on its next tick.
    pub fn del_friend(&mut self, friend: FriendNumber) -> Result<()> {
        self.friends.remove(friend).map(drop)
    }

    /// True when the number refers to a live friend.
    pub fn friend_exists(&self, friend: FriendNumber) -> bool {
        self.friends.exists(friend)
    }

    /// All live friend numbers.
    pub fn friend_list(&self) -> Vec<FriendNumber> {
        self.friends.numbers()
    }

    /// Reverse lookup by public key.
    pub fn friend_by_public_key(&self, public_key: &PublicKey) -> Option<FriendNumber> {
        self.friends.by_public_key(public_key)
    }

    /// A friend's public key.
    pub fn friend_public_key(&self, friend: FriendNumber) -> Result<PublicKey> {
        Ok(self.friends.get(friend)?.public_key())
    }

    /// A friend's display name.
    pub fn friend_name(&self, friend: FriendNumber) -> Result<Vec<u8>> {
        Ok(self.friends.get(friend)?.name().to_vec())
    }

    /// A friend's status message.
    pub fn friend_status_message(&self, friend: FriendNumber) -> Result<Vec<u8>> {
        Ok(self.friends.get(friend)?.status_message().to_vec())
    }

    /// A friend's presence status.
    pub fn friend_user_status(&self, friend: FriendNumber) -> Result<UserStatus> {
        Ok(self.friends.get(friend)?.user_status())
    }

    /// A friend's connection status.
    pub fn friend_connection_status(&self, friend: FriendNumber) -> Result<ConnectionStatus> {
        Ok(self.friends.get(friend)?.connection_status())
    }

    /// Whether a friend is typing to us.
    pub fn friend_is_typing(&self, friend: FriendNumber) -> Result<bool> {
        Ok(self.friends.get(friend)?.is_typing())
    }

    /// Tell a friend whether we are typing.
    pub fn send_typing(&mut self, friend: FriendNumber, typing: bool) -> Result<()> {
        self.require_online(friend)?;
        self.send_packet(friend, &Packet::Typing(typing))
    }

    // ---- messaging ------------------------------------------------------

    /// Send a text message. Returns the id the peer will echo back as a
    /// read receipt.
    ///
    /// The per-session id counter only advances on success.
    pub fn send_message(&mut self, friend: FriendNumber, message: &[u8]) -> Result<u32> {
        let id = self.next_message_id;
        self.send_message_with_id(friend, id, message)?;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        Ok(id)
    }

    /// Send a text message under a caller-chosen id, e.g. when retrying
    /// after a reconnect. Does not advance the id counter.
    pub fn send_message_with_id(
        &mut self,
        friend: FriendNumber,
        id: u32,
        message: &[u8],
    ) -> Result<u32> {
        if message.len() > crate::MAX_MESSAGE_LENGTH {
            return Err(Error::TooLong);
        }
        self.require_online(friend)?;
        self.send_packet(
            friend,
            &Packet::Message(MessagePayload {
                id,
                body: message.to_vec(),
            }),
        )?;
        Ok(id)
    }

    /// Send an IRC-style /me action.
    pub fn send_action(&mut self, friend: FriendNumber, action: &[u8]) -> Result<()> {
        if action.len() > crate::MAX_MESSAGE_LENGTH {
            return Err(Error::TooLong);
        }
        self.require_online(friend)?;
        self.send_packet(
            friend,
            &Packet::Action(ActionPayload {
                body: action.to_vec(),
            }),
        )
    }

    // ---- file transfers -------------------------------------------------

    /// Offer a file to a friend. Returns the allocated file number.
    pub fn new_file_sender(
        &mut self,
        friend: FriendNumber,
        file_size: u64,
        filename: &[u8],
    ) -> Result<u8> {
        if filename.len() > crate::MAX_FILENAME_LENGTH {
            return Err(Error::TooLong);
        }
        self.require_online(friend)?;

        let file_number = self
            .friends
            .get_mut(friend)?
            .transfers
            .allocate_sending(file_size, filename.to_vec())?;

        let packet = Packet::FileRequest(FileRequestPayload {
            file_number,
            file_size,
            filename: filename.to_vec(),
        });
        if let Err(e) = self.send_packet(friend, &packet) {
            // The offer never left; free the number again.
            if let Ok(f) = self.friends.get_mut(friend) {
                f.transfers.remove(Direction::Sending, file_number);
            }
            return Err(e);
        }

        Ok(file_number)
    }

    /// Send a file control for a live transfer.
    ///
    /// Terminal controls (`Kill`, sender-side `Finished`) free the file
    /// number immediately; a later control on the same number reports
    /// [`Error::NoSuchTransfer`].
    pub fn file_send_control(
        &mut self,
        friend: FriendNumber,
        direction: Direction,
        file_number: u8,
        control: ControlAction,
        data: &[u8],
    ) -> Result<()> {
        self.require_online(friend)?;
        if control == ControlAction::Finished && direction != Direction::Sending {
            return Err(Error::InvalidTransferState);
        }

        {
            let friend_entry = self.friends.get_mut(friend)?;
            let transfer = friend_entry
                .transfers
                .get_mut(direction, file_number)
                .ok_or(Error::NoSuchTransfer)?;

            if control.is_terminal() {
                friend_entry.transfers.remove(direction, file_number);
            } else {
                transfer.apply_control(control)?;
            }
        }

        self.send_packet(
            friend,
            &Packet::FileControl(FileControlPayload {
                sending: direction == Direction::Sending,
                file_number,
                control: control.to_byte(),
                data: data.to_vec(),
            }),
        )
    }

    /// Send one data chunk of an accepted outgoing transfer.
    pub fn file_send_data(
        &mut self,
        friend: FriendNumber,
        file_number: u8,
        chunk: &[u8],
    ) -> Result<()> {
        if chunk.len() > crate::MAX_FILE_DATA_SIZE {
            return Err(Error::ChunkTooLarge);
        }
        self.require_online(friend)?;

        {
            let transfer = self
                .friends
                .get_mut(friend)?
                .transfers
                .get_mut(Direction::Sending, file_number)
                .ok_or(Error::NoSuchTransfer)?;
            if !transfer.is_running() {
                return Err(Error::InvalidTransferState);
            }
        }

        self.send_packet(
            friend,
            &Packet::FileData(FileDataPayload {
                file_number,
                data: chunk.to_vec(),
            }),
        )?;

        if let Ok(f) = self.friends.get_mut(friend) {
            if let Some(t) = f.transfers.get_mut(Direction::Sending, file_number) {
                t.advance(chunk.len());
            }
        }
        Ok(())
    }

    /// Bytes left to move for a live transfer.
    pub fn file_data_remaining(
        &self,
        friend: FriendNumber,
        file_number: u8,
        direction: Direction,
    ) -> Result<u64> {
        self.friends
            .get(friend)?
            .transfers
            .get(direction, file_number)
            .map(|t| t.remaining())
            .ok_or(Error::NoSuchTransfer)
    }

    // ---- network --------------------------------------------------------

    /// Seed the routing layer with a known peer.
    pub fn bootstrap(&mut self, host: &str, port: u16, public_key: &PublicKey) -> Result<()> {
        self.transport.bootstrap(host, port, public_key)
    }

    /// Whether we have any live path to the wider network. Distinct from
    /// per-friend connection status.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    // ---- the tick -------------------------------------------------------

    /// Advance the whole session: drain and dispatch inbound packets,
    /// re-evaluate friend liveness, flush keepalives. Returns the
    /// recommended interval until the next tick.
    pub fn tick(&mut self) -> Duration {
        self.drain_inbound();
        self.refresh_liveness();
        self.flush_keepalives();
        self.config.tick_interval
    }

    /// Pop the next buffered event, oldest first.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn drain_inbound(&mut self) {
        while let Some(frame) = self.transport.recv() {
            let (sender, plaintext) = match crypto::open(self.identity.keypair(), &frame) {
                Ok(opened) => opened,
                Err(_) => {
                    debug!("dropping undecryptable frame");
                    continue;
                }
            };
            let packet = match Packet::from_bytes(&plaintext) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(error = %e, "dropping malformed packet");
                    continue;
                }
            };
            self.dispatch(sender, packet);
        }
    }

    fn dispatch(&mut self, sender: PublicKey, packet: Packet) {
        let packet = match packet {
            Packet::FriendRequest(payload) => {
                self.handle_friend_request(sender, payload);
                return;
            }
            other => other,
        };

        let Some(number) = self.friends.by_public_key(&sender) else {
            debug!("dropping packet from unknown peer");
            return;
        };
        self.mark_seen(number);

        match packet {
            // Routed before the friend lookup.
            Packet::FriendRequest(_) => {}
            Packet::Ping => {}
            Packet::Message(p) => {
                if p.body.len() > crate::MAX_MESSAGE_LENGTH {
                    debug!(friend = number, "dropping oversized message");
                    return;
                }
                self.events.push_back(Event::Message {
                    friend: number,
                    message: p.body,
                });
                // Echo the sender's id back as the read receipt.
                if let Err(e) = self.send_packet(number, &Packet::ReadReceipt(p.id)) {
                    debug!(error = %e, friend = number, "read receipt not sent");
                }
            }
            Packet::Action(p) => {
                if p.body.len() > crate::MAX_MESSAGE_LENGTH {
                    debug!(friend = number, "dropping oversized action");
                    return;
                }
                self.events.push_back(Event::Action {
                    friend: number,
                    action: p.body,
                });
            }
            Packet::Name(name) => {
                if let Ok(f) = self.friends.get_mut(number) {
                    f.set_name(name);
                    let name = f.name().to_vec();
                    self.events.push_back(Event::NameChange {
                        friend: number,
                        name,
                    });
                }
            }
            Packet::StatusMessage(message) => {
                if let Ok(f) = self.friends.get_mut(number) {
                    f.set_status_message(message);
                    let message = f.status_message().to_vec();
                    self.events.push_back(Event::StatusMessageChange {
                        friend: number,
                        message,
                    });
                }
            }
            Packet::UserStatus(byte) => {
                let status = UserStatus::from_byte(byte);
                if let Ok(f) = self.friends.get_mut(number) {
                    f.set_user_status(status);
                }
                self.events.push_back(Event::UserStatusChange {
                    friend: number,
                    status,
                });
            }
            Packet::Typing(typing) => {
                if let Ok(f) = self.friends.get_mut(number) {
                    f.set_typing(typing);
                }
                self.events.push_back(Event::TypingChange {
                    friend: number,
                    typing,
                });
            }
            Packet::ReadReceipt(id) => {
                self.events.push_back(Event::ReadReceipt {
                    friend: number,
                    message_id: id,
                });
            }
            Packet::FileRequest(p) => self.handle_file_request(number, p),
            Packet::FileControl(p) => self.handle_file_control(number, p),
            Packet::FileData(p) => self.handle_file_data(number, p),
            Packet::CallSignal(p) => self.av_inbox.push_back(AvInbound::Signal {
                friend: number,
                call_id: p.call_id,
                signal: p.signal,
            }),
            Packet::CallAudio(p) => self.av_inbox.push_back(AvInbound::Audio {
                friend: number,
                call_id: p.call_id,
                seq: p.seq,
                frame: p.frame,
            }),
            Packet::CallVideo(p) => self.av_inbox.push_back(AvInbound::Video {
                friend: number,
                call_id: p.call_id,
                width: p.width,
                height: p.height,
                frame: p.frame,
            }),
        }
    }

    fn handle_friend_request(&mut self, sender: PublicKey, payload: FriendRequestPayload) {
        // A request from a known peer doubles as proof of life.
        if let Some(number) = self.friends.by_public_key(&sender) {
            self.mark_seen(number);
            return;
        }
        if payload.nospam != self.identity.nospam() {
            debug!("dropping friend request with stale nospam");
            return;
        }
        let mut message = payload.message;
        message.truncate(crate::MAX_FRIEND_REQUEST_LENGTH);
        self.events.push_back(Event::FriendRequest {
            public_key: sender,
            message,
        });
    }

    fn handle_file_request(&mut self, number: FriendNumber, payload: FileRequestPayload) {
        let mut filename = payload.filename;
        filename.truncate(crate::MAX_FILENAME_LENGTH);

        if let Ok(f) = self.friends.get_mut(number) {
            f.transfers
                .insert_receiving(payload.file_number, payload.file_size, filename.clone());
        }
        self.events.push_back(Event::FileSendRequest {
            friend: number,
            file_number: payload.file_number,
            file_size: payload.file_size,
            filename,
        });
    }

    fn handle_file_control(&mut self, number: FriendNumber, payload: FileControlPayload) {
        let control = match ControlAction::from_byte(payload.control) {
            Ok(control) => control,
            Err(_) => {
                debug!(friend = number, "dropping unknown file control");
                return;
            }
        };
        // The payload names the direction at the packet sender; ours is the
        // mirror image.
        let direction = if payload.sending {
            Direction::Receiving
        } else {
            Direction::Sending
        };

        let Ok(f) = self.friends.get_mut(number) else {
            return;
        };
        if f.transfers.get(direction, payload.file_number).is_none() {
            // Late termination for an already-freed number is the
            // idempotent case; anything else is noise.
            debug!(
                friend = number,
                file = payload.file_number,
                ?control,
                "control for unknown transfer dropped"
            );
            return;
        }

        if control.is_terminal() {
            f.transfers.remove(direction, payload.file_number);
        } else if let Some(transfer) = f.transfers.get_mut(direction, payload.file_number) {
            if let Err(e) = transfer.apply_control(control) {
                debug!(
                    friend = number,
                    file = payload.file_number,
                    error = %e,
                    "out-of-state file control dropped"
                );
                return;
            }
        }

        self.events.push_back(Event::FileControl {
            friend: number,
            direction,
            file_number: payload.file_number,
            control,
        });
    }

    fn handle_file_data(&mut self, number: FriendNumber, payload: FileDataPayload) {
        let Ok(f) = self.friends.get_mut(number) else {
            return;
        };
        let Some(transfer) = f.transfers.get_mut(Direction::Receiving, payload.file_number) else {
            debug!(
                friend = number,
                file = payload.file_number,
                "data for unknown transfer discarded"
            );
            return;
        };
        if !transfer.is_running() {
            debug!(
                friend = number,
                file = payload.file_number,
                "data for unaccepted transfer discarded"
            );
            return;
        }

        let position = transfer.transferred();
        transfer.advance(payload.data.len());
        self.events.push_back(Event::FileData {
            friend: number,
            file_number: payload.file_number,
            position,
            data: payload.data,
        });
    }

    /// Record proof of life from a friend and upgrade them to online.
    fn mark_seen(&mut self, number: FriendNumber) {
        if let Ok(f) = self.friends.get_mut(number) {
            f.last_seen = Some(Instant::now());
            f.pending_request = None;
            if f.connection_status() != ConnectionStatus::Online {
                f.set_connection_status(ConnectionStatus::Online);
                self.events.push_back(Event::ConnectionStatusChange {
                    friend: number,
                    status: ConnectionStatus::Online,
                });
            }
        }
    }

    /// Downgrade friends that have gone quiet.
    fn refresh_liveness(&mut self) {
        let now = Instant::now();
        let online_timeout = self.config.online_timeout;
        let offline_timeout = self.config.offline_timeout;

        for (number, f) in self.friends.iter_mut() {
            let Some(last_seen) = f.last_seen else {
                continue;
            };
            let silence = now.duration_since(last_seen);

            let next = match f.connection_status() {
                ConnectionStatus::Online if silence > online_timeout => {
                    ConnectionStatus::Connecting
                }
                ConnectionStatus::Connecting if silence > offline_timeout => {
                    ConnectionStatus::Offline
                }
                _ => continue,
            };
            f.set_connection_status(next);
            self.events.push_back(Event::ConnectionStatusChange {
                friend: number,
                status: next,
            });
        }
    }

    /// Send keepalives and retry pending friend requests on the ping
    /// cadence.
    fn flush_keepalives(&mut self) {
        let now = Instant::now();
        let ping_interval = self.config.ping_interval;

        let mut due: Vec<(FriendNumber, PublicKey)> = Vec::new();
        for (number, f) in self.friends.iter_mut() {
            let is_due = f
                .last_ping
                .map_or(true, |t| now.duration_since(t) >= ping_interval);
            if is_due {
                f.last_ping = Some(now);
                due.push((number, f.public_key()));
            }
        }

        for (number, public_key) in due {
            let pending = self
                .friends
                .get(number)
                .ok()
                .and_then(|f| f.pending_request.clone());
            let packet = match pending {
                Some(request) => Packet::FriendRequest(FriendRequestPayload {
                    nospam: request.nospam,
                    message: request.message,
                }),
                None => Packet::Ping,
            };
            if let Err(e) = self.send_to_key(&public_key, &packet) {
                warn!(error = %e, friend = number, "keepalive send failed");
            }
        }
    }

    // ---- persistence ----------------------------------------------------

    /// Serialize the complete session state into an opaque blob.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let snapshot = Snapshot {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            secret_key: self.identity.secret_key_bytes(),
            nospam: self.identity.nospam(),
            name: self.self_name.clone(),
            status_message: self.self_status_message.clone(),
            user_status: self.self_user_status.to_byte(),
            friends: self
                .friends
                .iter()
                .map(|(_, f)| FriendSnapshot {
                    public_key: *f.public_key().as_bytes(),
                    name: f.name().to_vec(),
                    status_message: f.status_message().to_vec(),
                    user_status: f.user_status().to_byte(),
                })
                .collect(),
        };
        bincode::serialize(&snapshot).map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Load a snapshot produced by [`Session::serialize`].
    ///
    /// All-or-nothing: a truncated or malformed blob fails with
    /// [`Error::CorruptData`] and leaves the session untouched.
    pub fn load(&mut self, data: &[u8]) -> Result<()> {
        let snapshot: Snapshot = bincode::deserialize(data).map_err(|_| Error::CorruptData)?;

        if snapshot.magic != SNAPSHOT_MAGIC || snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::CorruptData);
        }
        if snapshot.name.len() > crate::MAX_NAME_LENGTH
            || snapshot.status_message.len() > crate::MAX_STATUS_MESSAGE_LENGTH
        {
            return Err(Error::CorruptData);
        }

        // Build the whole friend table before mutating anything.
        let identity = Identity::from_parts(snapshot.secret_key, snapshot.nospam);
        let mut friends = FriendTable::new(self.config.max_friends);
        for saved in &snapshot.friends {
            if saved.name.len() > crate::MAX_NAME_LENGTH
                || saved.status_message.len() > crate::MAX_STATUS_MESSAGE_LENGTH
            {
                return Err(Error::CorruptData);
            }
            let public_key = PublicKey::from_bytes(saved.public_key);
            if public_key == identity.public_key() {
                return Err(Error::CorruptData);
            }
            let number = friends.add(public_key).map_err(|_| Error::CorruptData)?;
            let friend = friends
                .get_mut(number)
                .map_err(|_| Error::CorruptData)?;
            friend.set_name(saved.name.clone());
            friend.set_status_message(saved.status_message.clone());
            friend.set_user_status(UserStatus::from_byte(saved.user_status));
        }

        self.identity = identity;
        self.friends = friends;
        self.self_name = snapshot.name;
        self.self_status_message = snapshot.status_message;
        self.self_user_status = UserStatus::from_byte(snapshot.user_status);
        info!(friends = self.friends.len(), "session state loaded");
        Ok(())
    }

    // ---- internals shared with the call subsystem -----------------------

    /// Seal and hand a packet to the transport.
    pub(crate) fn send_packet(&mut self, friend: FriendNumber, packet: &Packet) -> Result<()> {
        let public_key = self.friends.get(friend)?.public_key();
        self.send_to_key(&public_key, packet)
    }

    fn send_to_key(&mut self, public_key: &PublicKey, packet: &Packet) -> Result<()> {
        let bytes = packet.to_bytes()?;
        let frame = crypto::seal(self.identity.keypair(), public_key, &bytes)?;
        self.transport.send(public_key, &frame)
    }

    /// Take everything the tick routed toward the call subsystem.
    pub(crate) fn drain_av(&mut self) -> VecDeque<AvInbound> {
        std::mem::take(&mut self.av_inbox)
    }

    /// Error out unless the friend exists and is online.
    fn require_online(&self, friend: FriendNumber) -> Result<()> {
        if self.friends.get(friend)?.is_online() {
            Ok(())
        } else {
            Err(Error::FriendOffline)
        }
    }

    fn broadcast(&mut self, packet: &Packet) {
        let online: Vec<PublicKey> = self
            .friends
            .iter()
            .filter(|(_, f)| f.is_online())
            .map(|(_, f)| f.public_key())
            .collect();
        for public_key in online {
            if let Err(e) = self.send_to_key(&public_key, packet) {
                debug!(error = %e, "profile broadcast failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let hub = MemoryHub::new();
        let placeholder = crate::crypto::KeyPair::generate().public();
        Session::new(SessionConfig::default(), Box::new(hub.attach(placeholder)))
            .expect("session")
    }

    #[test]
    fn test_setters_enforce_bounds() {
        let mut s = session();
        assert_eq!(
            s.set_name(&vec![b'n'; crate::MAX_NAME_LENGTH + 1]),
            Err(Error::TooLong)
        );
        assert_eq!(
            s.set_status_message(&vec![b's'; crate::MAX_STATUS_MESSAGE_LENGTH + 1]),
            Err(Error::TooLong)
        );
        s.set_name(b"alice").expect("short name fits");
        assert_eq!(s.name(), b"alice");
    }

    #[test]
    fn test_accessors_on_missing_friend() {
        let s = session();
        assert_eq!(s.friend_name(5), Err(Error::NoSuchFriend));
        assert_eq!(s.friend_connection_status(5), Err(Error::NoSuchFriend));
        assert!(!s.friend_exists(5));
    }

    #[test]
    fn test_own_address_rejected() {
        let mut s = session();
        let own = s.address();
        assert_eq!(s.add_friend(&own, b"hi me"), Err(Error::OwnAddress));
        let own_pk = s.public_key();
        assert_eq!(s.add_friend_norequest(&own_pk), Err(Error::OwnAddress));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let mut s = session();
        let other = crate::crypto::KeyPair::generate().public();
        s.add_friend_norequest(&other).expect("add");

        assert_eq!(s.load(b"definitely not a snapshot"), Err(Error::CorruptData));
        // Untouched after the failed load.
        assert_eq!(s.friend_list().len(), 1);
    }

    #[test]
    fn test_load_rejects_truncation() {
        let mut s = session();
        let blob = s.serialize().expect("serialize");
        assert_eq!(s.load(&blob[..blob.len() / 2]), Err(Error::CorruptData));
    }
}
