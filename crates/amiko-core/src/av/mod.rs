//! Audio/video call signaling.
//!
//! This subsystem negotiates codec parameters and moves opaque pre-encoded
//! frames; it never encodes or decodes media itself. Calls live in a small
//! slot table (indices reused after termination, capacity fixed at
//! construction) and walk a strict state machine:
//!
//! ```text
//! nonexistent -> inviting -> starting -> active <-> hold -> ended
//!                    \________________________________________/
//!                        reject / cancel / timeout
//! ```
//!
//! The subsystem is lifecycle-managed separately from the session: it is
//! constructed on its own and advanced by [`Av::tick`], which borrows the
//! session for signaling transport and drains the call-directed packets the
//! session routed to it. Events for remote- and timer-triggered transitions
//! flow through the subsystem's own queue ([`Av::poll_event`]); locally
//! initiated transitions report through the operation's return value
//! instead, so no event echoes back to the caller that caused it.
//!
//! Media-phase resources (jitter buffer, voice-activity detection state)
//! are scoped to [`Av::prepare_transmission`] / [`Av::kill_transmission`]
//! and held in an `Option`, so teardown releases them exactly once no
//! matter which exit path runs first.

mod video;

pub use video::{
    aligned_stride, pack_yv12, unpack_yv12, yv12_frame_size, DEFAULT_PLANE_ALIGNMENT,
};

use crate::crypto::random_bytes;
use crate::error::{Error, Result};
use crate::friend::{ConnectionStatus, FriendNumber};
use crate::protocol::{CallAudioPayload, CallSignalPayload, CallVideoPayload, Packet};
use crate::session::Session;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::BitOr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Index of a live or pending call. Reused after termination.
pub type CallIndex = u32;

/// How long an incoming invite may sit unanswered before it is reaped.
const INCOMING_RING_TIMEOUT: Duration = Duration::from_secs(60);

/// Default media silence window before a peer is considered gone.
const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// Media capabilities a peer advertises in its invite or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities(u8);

impl Capabilities {
    /// No media support at all.
    pub const NONE: Capabilities = Capabilities(0);
    /// Can encode audio.
    pub const AUDIO_ENCODING: Capabilities = Capabilities(1 << 0);
    /// Can decode audio.
    pub const AUDIO_DECODING: Capabilities = Capabilities(1 << 1);
    /// Can encode video.
    pub const VIDEO_ENCODING: Capabilities = Capabilities(1 << 2);
    /// Can decode video.
    pub const VIDEO_DECODING: Capabilities = Capabilities(1 << 3);

    /// Audio and video, both directions.
    pub fn all() -> Self {
        Self::AUDIO_ENCODING | Self::AUDIO_DECODING | Self::VIDEO_ENCODING | Self::VIDEO_DECODING
    }

    /// Audio in both directions, no video.
    pub fn audio() -> Self {
        Self::AUDIO_ENCODING | Self::AUDIO_DECODING
    }

    /// True when every capability in `other` is present in `self`.
    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

/// Whether a call carries audio only or audio plus video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallType {
    /// Audio only.
    Audio,
    /// Audio and video.
    Video,
}

/// Codec parameters negotiated per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecSettings {
    /// Audio-only or audio/video.
    pub call_type: CallType,
    /// Video bitrate in kbit/s.
    pub video_bitrate: u32,
    /// Maximum video width in pixels.
    pub max_video_width: u16,
    /// Maximum video height in pixels.
    pub max_video_height: u16,
    /// Audio bitrate in bit/s.
    pub audio_bitrate: u32,
    /// Audio frame duration in milliseconds.
    pub audio_frame_duration: u16,
    /// Audio sample rate in Hz.
    pub audio_sample_rate: u32,
    /// Audio channel count.
    pub audio_channels: u8,
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self {
            call_type: CallType::Audio,
            video_bitrate: 500,
            max_video_width: 1280,
            max_video_height: 720,
            audio_bitrate: 64_000,
            audio_frame_duration: 20,
            audio_sample_rate: 48_000,
            audio_channels: 1,
        }
    }
}

impl CodecSettings {
    /// Check every field against the supported ranges.
    pub fn validate(&self) -> Result<()> {
        if !(6_000..=510_000).contains(&self.audio_bitrate) {
            return Err(Error::InvalidSettings);
        }
        if ![10, 20, 40, 60].contains(&self.audio_frame_duration) {
            return Err(Error::InvalidSettings);
        }
        if ![8_000, 12_000, 16_000, 24_000, 48_000].contains(&self.audio_sample_rate) {
            return Err(Error::InvalidSettings);
        }
        if !(1..=2).contains(&self.audio_channels) {
            return Err(Error::InvalidSettings);
        }
        if self.call_type == CallType::Video {
            if !(1..=20_000).contains(&self.video_bitrate) {
                return Err(Error::InvalidSettings);
            }
            if !(16..=4096).contains(&self.max_video_width)
                || !(16..=2160).contains(&self.max_video_height)
            {
                return Err(Error::InvalidSettings);
            }
        }
        Ok(())
    }
}

/// Call lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Invite sent or received; not yet answered.
    Inviting,
    /// Answered; transmission not yet prepared.
    Starting,
    /// Media flowing.
    Active,
    /// Parked by either side.
    Hold,
    /// Terminated. Transient; the slot is freed immediately.
    Ended,
}

/// Signaling verbs exchanged on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallSignal {
    /// Start a call.
    Invite {
        /// Caller's proposed settings.
        settings: CodecSettings,
        /// Caller's media capabilities.
        capabilities: Capabilities,
    },
    /// The callee's device is ringing.
    Ringing,
    /// The callee accepted.
    Answer {
        /// Callee's settings.
        settings: CodecSettings,
        /// Callee's media capabilities.
        capabilities: Capabilities,
    },
    /// Mid-call settings renegotiation.
    MediaChange {
        /// The new settings.
        settings: CodecSettings,
    },
    /// Park the call.
    Hold,
    /// Unpark the call.
    Resume,
    /// Caller withdrew the invite.
    Cancel {
        /// Optional human-readable reason.
        reason: String,
    },
    /// Callee declined the invite.
    Reject {
        /// Optional human-readable reason.
        reason: String,
    },
    /// Either side ended an answered call.
    End,
}

/// Events emitted by the call subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvEvent {
    /// A friend is calling us.
    Invite {
        /// Slot assigned to the incoming call.
        call_index: CallIndex,
        /// The caller.
        friend: FriendNumber,
    },
    /// The remote device is ringing.
    Ringing {
        /// The outgoing call.
        call_index: CallIndex,
    },
    /// The callee answered; settings are negotiated.
    Starting {
        /// The outgoing call.
        call_index: CallIndex,
    },
    /// The caller withdrew the invite.
    Cancel {
        /// The affected call.
        call_index: CallIndex,
        /// The withdrawing peer.
        friend: FriendNumber,
        /// Their reason.
        reason: String,
    },
    /// The callee declined.
    Reject {
        /// The outgoing call.
        call_index: CallIndex,
        /// Their reason.
        reason: String,
    },
    /// The peer ended the call, or its friend entry vanished.
    End {
        /// The affected call.
        call_index: CallIndex,
    },
    /// Nobody answered within the ringing timeout.
    RequestTimeout {
        /// The affected call.
        call_index: CallIndex,
    },
    /// No media arrived within the liveness window.
    PeerTimeout {
        /// The affected call.
        call_index: CallIndex,
    },
    /// The peer renegotiated settings mid-call.
    MediaChange {
        /// The affected call.
        call_index: CallIndex,
        /// The renegotiating peer.
        friend: FriendNumber,
        /// The new settings.
        settings: CodecSettings,
    },
    /// The peer parked the call.
    Hold {
        /// The affected call.
        call_index: CallIndex,
        /// The parking peer.
        friend: FriendNumber,
    },
    /// The peer unparked the call.
    Resume {
        /// The affected call.
        call_index: CallIndex,
        /// The resuming peer.
        friend: FriendNumber,
    },
    /// An encoded audio frame arrived, in jitter-buffer order.
    Audio {
        /// The call it belongs to.
        call_index: CallIndex,
        /// Opaque encoded frame.
        frame: Vec<u8>,
    },
    /// An encoded video frame arrived.
    Video {
        /// The call it belongs to.
        call_index: CallIndex,
        /// Frame width in pixels.
        width: u16,
        /// Frame height in pixels.
        height: u16,
        /// Opaque encoded frame.
        frame: Vec<u8>,
    },
}

/// Call-directed traffic the session routed to this subsystem.
#[derive(Debug)]
pub(crate) enum AvInbound {
    /// A signaling verb.
    Signal {
        friend: FriendNumber,
        call_id: u64,
        signal: CallSignal,
    },
    /// An audio frame.
    Audio {
        friend: FriendNumber,
        call_id: u64,
        seq: u32,
        frame: Vec<u8>,
    },
    /// A video frame.
    Video {
        friend: FriendNumber,
        call_id: u64,
        width: u16,
        height: u16,
        frame: Vec<u8>,
    },
}

/// Media-phase resources, alive between prepare and kill.
#[derive(Debug)]
struct Transmission {
    jitter: VecDeque<(u32, Vec<u8>)>,
    jitter_capacity: usize,
    #[allow(dead_code)]
    vad_threshold: u32,
    video_enabled: bool,
}

impl Transmission {
    fn new(jitter_capacity: usize, vad_threshold: u32, video_enabled: bool) -> Self {
        Self {
            jitter: VecDeque::with_capacity(jitter_capacity),
            jitter_capacity,
            vad_threshold,
            video_enabled,
        }
    }

    /// Insert a frame in sequence order, dropping the oldest on overflow.
    fn buffer_frame(&mut self, seq: u32, frame: Vec<u8>) {
        let pos = self
            .jitter
            .iter()
            .position(|(s, _)| *s > seq)
            .unwrap_or(self.jitter.len());
        self.jitter.insert(pos, (seq, frame));

        while self.jitter.len() > self.jitter_capacity {
            self.jitter.pop_front();
        }
    }

    fn pop_frame(&mut self) -> Option<Vec<u8>> {
        self.jitter.pop_front().map(|(_, frame)| frame)
    }
}

/// One peer in a call.
#[derive(Debug)]
struct Peer {
    friend: FriendNumber,
    settings: Option<CodecSettings>,
    capabilities: Capabilities,
}

/// One call slot.
#[derive(Debug)]
struct Call {
    id: u64,
    outgoing: bool,
    state: CallState,
    peers: Vec<Peer>,
    local_settings: CodecSettings,
    ringing_deadline: Option<Instant>,
    last_media: Instant,
    send_seq: u32,
    transmission: Option<Transmission>,
}

impl Call {
    fn is_answered(&self) -> bool {
        matches!(
            self.state,
            CallState::Starting | CallState::Active | CallState::Hold
        )
    }

    fn peer_mut(&mut self, friend: FriendNumber) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.friend == friend)
    }

    fn has_peer(&self, friend: FriendNumber) -> bool {
        self.peers.iter().any(|p| p.friend == friend)
    }
}

/// The call-signaling subsystem.
pub struct Av {
    capabilities: Capabilities,
    calls: Vec<Option<Call>>,
    events: VecDeque<AvEvent>,
    peer_timeout: Duration,
}

impl Av {
    /// Create a subsystem with `max_calls` slots, advertising the given
    /// local capabilities to peers.
    pub fn new(max_calls: usize, capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            calls: (0..max_calls).map(|_| None).collect(),
            events: VecDeque::new(),
            peer_timeout: DEFAULT_PEER_TIMEOUT,
        }
    }

    /// Override the media liveness window.
    pub fn set_peer_timeout(&mut self, timeout: Duration) {
        self.peer_timeout = timeout;
    }

    /// Pop the next buffered event, oldest first.
    pub fn poll_event(&mut self) -> Option<AvEvent> {
        self.events.pop_front()
    }

    // ---- operations -----------------------------------------------------

    /// Call a friend. Returns the allocated call index; the callee has
    /// `ringing_timeout` to answer before the invite expires.
    pub fn call(
        &mut self,
        session: &mut Session,
        friend: FriendNumber,
        settings: &CodecSettings,
        ringing_timeout: Duration,
    ) -> Result<CallIndex> {
        settings.validate()?;
        if session.friend_connection_status(friend)? != ConnectionStatus::Online {
            return Err(Error::FriendOffline);
        }
        if self.call_with_friend(friend).is_some() {
            return Err(Error::AlreadyInCall);
        }
        let index = self.free_slot()?;

        let call_id = u64::from_be_bytes(random_bytes());
        session.send_packet(
            friend,
            &Packet::CallSignal(CallSignalPayload {
                call_id,
                signal: CallSignal::Invite {
                    settings: *settings,
                    capabilities: self.capabilities,
                },
            }),
        )?;

        self.calls[index as usize] = Some(Call {
            id: call_id,
            outgoing: true,
            state: CallState::Inviting,
            peers: vec![Peer {
                friend,
                settings: None,
                capabilities: Capabilities::NONE,
            }],
            local_settings: *settings,
            ringing_deadline: Some(Instant::now() + ringing_timeout),
            last_media: Instant::now(),
            send_seq: 0,
            transmission: None,
        });
        info!(call = index, friend, "outgoing call invite sent");
        Ok(index)
    }

    /// Answer an incoming call.
    pub fn answer(
        &mut self,
        session: &mut Session,
        call_index: CallIndex,
        settings: &CodecSettings,
    ) -> Result<()> {
        settings.validate()?;
        let call = self.call_mut(call_index)?;
        if call.state != CallState::Inviting || call.outgoing {
            return Err(Error::InvalidCallState);
        }

        let friend = call.peers[0].friend;
        let call_id = call.id;
        let capabilities = self.capabilities;
        session.send_packet(
            friend,
            &Packet::CallSignal(CallSignalPayload {
                call_id,
                signal: CallSignal::Answer {
                    settings: *settings,
                    capabilities,
                },
            }),
        )?;

        let call = self.call_mut(call_index)?;
        call.local_settings = *settings;
        call.state = CallState::Starting;
        call.ringing_deadline = None;
        Ok(())
    }

    /// Decline an incoming call.
    pub fn reject(
        &mut self,
        session: &mut Session,
        call_index: CallIndex,
        reason: &str,
    ) -> Result<()> {
        let call = self.call_mut(call_index)?;
        if call.state != CallState::Inviting || call.outgoing {
            return Err(Error::InvalidCallState);
        }
        let friend = call.peers[0].friend;
        let call_id = call.id;

        if let Err(e) = session.send_packet(
            friend,
            &Packet::CallSignal(CallSignalPayload {
                call_id,
                signal: CallSignal::Reject {
                    reason: reason.to_owned(),
                },
            }),
        ) {
            warn!(call = call_index, error = %e, "reject signal not sent");
        }
        self.end_call(call_index);
        Ok(())
    }

    /// Withdraw an outgoing invite toward one peer.
    pub fn cancel(
        &mut self,
        session: &mut Session,
        call_index: CallIndex,
        peer: FriendNumber,
        reason: &str,
    ) -> Result<()> {
        let call = self.call_mut(call_index)?;
        if call.state != CallState::Inviting || !call.outgoing {
            return Err(Error::InvalidCallState);
        }
        if !call.has_peer(peer) {
            return Err(Error::NoSuchFriend);
        }
        let call_id = call.id;

        if let Err(e) = session.send_packet(
            peer,
            &Packet::CallSignal(CallSignalPayload {
                call_id,
                signal: CallSignal::Cancel {
                    reason: reason.to_owned(),
                },
            }),
        ) {
            warn!(call = call_index, error = %e, "cancel signal not sent");
        }

        let call = self.call_mut(call_index)?;
        call.peers.retain(|p| p.friend != peer);
        if call.peers.is_empty() {
            self.end_call(call_index);
        }
        Ok(())
    }

    /// Hang up an answered call. Media resources are released on every
    /// path out of this function.
    pub fn hangup(&mut self, session: &mut Session, call_index: CallIndex) -> Result<()> {
        let call = self.call_mut(call_index)?;
        if !call.is_answered() {
            return Err(Error::InvalidCallState);
        }
        let call_id = call.id;
        let peers: Vec<FriendNumber> = call.peers.iter().map(|p| p.friend).collect();

        for friend in peers {
            if let Err(e) = session.send_packet(
                friend,
                &Packet::CallSignal(CallSignalPayload {
                    call_id,
                    signal: CallSignal::End,
                }),
            ) {
                warn!(call = call_index, friend, error = %e, "end signal not sent");
            }
        }
        self.end_call(call_index);
        Ok(())
    }

    /// Park an active call.
    pub fn hold(&mut self, session: &mut Session, call_index: CallIndex) -> Result<()> {
        self.switch_hold(session, call_index, true)
    }

    /// Unpark a held call.
    pub fn resume(&mut self, session: &mut Session, call_index: CallIndex) -> Result<()> {
        self.switch_hold(session, call_index, false)
    }

    fn switch_hold(
        &mut self,
        session: &mut Session,
        call_index: CallIndex,
        parking: bool,
    ) -> Result<()> {
        let call = self.call_mut(call_index)?;
        let (expected, next, signal) = if parking {
            (CallState::Active, CallState::Hold, CallSignal::Hold)
        } else {
            (CallState::Hold, CallState::Active, CallSignal::Resume)
        };
        if call.state != expected {
            return Err(Error::InvalidCallState);
        }
        let call_id = call.id;
        let peers: Vec<FriendNumber> = call.peers.iter().map(|p| p.friend).collect();
        call.state = next;

        for friend in peers {
            if let Err(e) = session.send_packet(
                friend,
                &Packet::CallSignal(CallSignalPayload {
                    call_id,
                    signal: signal.clone(),
                }),
            ) {
                warn!(call = call_index, friend, error = %e, "hold signal not sent");
            }
        }
        Ok(())
    }

    /// Renegotiate codec settings mid-call.
    pub fn change_settings(
        &mut self,
        session: &mut Session,
        call_index: CallIndex,
        settings: &CodecSettings,
    ) -> Result<()> {
        settings.validate()?;
        let call = self.call_mut(call_index)?;
        if !call.is_answered() {
            return Err(Error::InvalidCallState);
        }
        call.local_settings = *settings;
        let call_id = call.id;
        let peers: Vec<FriendNumber> = call.peers.iter().map(|p| p.friend).collect();

        for friend in peers {
            session.send_packet(
                friend,
                &Packet::CallSignal(CallSignalPayload {
                    call_id,
                    signal: CallSignal::MediaChange {
                        settings: *settings,
                    },
                }),
            )?;
        }
        Ok(())
    }

    /// Acquire the media-phase resources and move the call to active.
    ///
    /// Must run after the call reaches starting and before any frame is
    /// sent. Preparing twice is a state error.
    pub fn prepare_transmission(
        &mut self,
        call_index: CallIndex,
        jitter_capacity: usize,
        vad_threshold: u32,
        video_enabled: bool,
    ) -> Result<()> {
        let call = self.call_mut(call_index)?;
        if !call.is_answered() || call.transmission.is_some() {
            return Err(Error::InvalidCallState);
        }
        call.transmission = Some(Transmission::new(
            jitter_capacity.max(1),
            vad_threshold,
            video_enabled,
        ));
        if call.state == CallState::Starting {
            call.state = CallState::Active;
        }
        Ok(())
    }

    /// Release the media-phase resources.
    ///
    /// Idempotent: killing an unprepared or already-gone call is a no-op,
    /// so every termination path may call this unconditionally.
    pub fn kill_transmission(&mut self, call_index: CallIndex) -> Result<()> {
        if let Some(Some(call)) = self.calls.get_mut(call_index as usize) {
            call.transmission.take();
        }
        Ok(())
    }

    /// Send a pre-encoded audio frame to every peer.
    pub fn send_audio(
        &mut self,
        session: &mut Session,
        call_index: CallIndex,
        frame: &[u8],
    ) -> Result<()> {
        let call = self.call_mut(call_index)?;
        if call.state != CallState::Active || call.transmission.is_none() {
            return Err(Error::InvalidCallState);
        }
        let call_id = call.id;
        let seq = call.send_seq;
        call.send_seq = call.send_seq.wrapping_add(1);
        let peers: Vec<FriendNumber> = call.peers.iter().map(|p| p.friend).collect();

        for friend in peers {
            session.send_packet(
                friend,
                &Packet::CallAudio(CallAudioPayload {
                    call_id,
                    seq,
                    frame: frame.to_vec(),
                }),
            )?;
        }
        Ok(())
    }

    /// Send a pre-encoded video frame with its geometry to every peer.
    pub fn send_video(
        &mut self,
        session: &mut Session,
        call_index: CallIndex,
        width: u16,
        height: u16,
        frame: &[u8],
    ) -> Result<()> {
        let call = self.call_mut(call_index)?;
        let video_ready = call
            .transmission
            .as_ref()
            .is_some_and(|t| t.video_enabled);
        if call.state != CallState::Active
            || !video_ready
            || call.local_settings.call_type != CallType::Video
        {
            return Err(Error::InvalidCallState);
        }
        let call_id = call.id;
        let peers: Vec<FriendNumber> = call.peers.iter().map(|p| p.friend).collect();

        for friend in peers {
            session.send_packet(
                friend,
                &Packet::CallVideo(CallVideoPayload {
                    call_id,
                    width,
                    height,
                    frame: frame.to_vec(),
                }),
            )?;
        }
        Ok(())
    }

    // ---- queries --------------------------------------------------------

    /// Whether the first peer advertised a capability.
    pub fn capability_supported(
        &self,
        call_index: CallIndex,
        capability: Capabilities,
    ) -> Result<bool> {
        let call = self.call_ref(call_index)?;
        Ok(call.peers[0].capabilities.contains(capability))
    }

    /// Current state of a call.
    pub fn call_state(&self, call_index: CallIndex) -> Result<CallState> {
        Ok(self.call_ref(call_index)?.state)
    }

    /// Friend number of the peer in slot `peer`.
    pub fn peer_id(&self, call_index: CallIndex, peer: usize) -> Result<FriendNumber> {
        self.call_ref(call_index)?
            .peers
            .get(peer)
            .map(|p| p.friend)
            .ok_or(Error::NoSuchFriend)
    }

    /// Negotiated settings of the peer in slot `peer`. Only meaningful
    /// once the call has been answered.
    pub fn peer_settings(&self, call_index: CallIndex, peer: usize) -> Result<CodecSettings> {
        self.call_ref(call_index)?
            .peers
            .get(peer)
            .ok_or(Error::NoSuchFriend)?
            .settings
            .ok_or(Error::InvalidCallState)
    }

    /// Index of the live call involving `friend`, if any.
    pub fn call_with_friend(&self, friend: FriendNumber) -> Option<CallIndex> {
        self.calls.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref()
                .filter(|c| c.has_peer(friend))
                .map(|_| i as CallIndex)
        })
    }

    // ---- the tick -------------------------------------------------------

    /// Advance the subsystem: consume routed packets, run timers, drain
    /// jitter buffers, and reap calls whose peers vanished.
    pub fn tick(&mut self, session: &mut Session) {
        for inbound in session.drain_av() {
            match inbound {
                AvInbound::Signal {
                    friend,
                    call_id,
                    signal,
                } => self.handle_signal(session, friend, call_id, signal),
                AvInbound::Audio {
                    friend,
                    call_id,
                    seq,
                    frame,
                } => self.handle_audio(friend, call_id, seq, frame),
                AvInbound::Video {
                    friend,
                    call_id,
                    width,
                    height,
                    frame,
                } => self.handle_video(friend, call_id, width, height, frame),
            }
        }

        self.reap_vanished_peers(session);
        self.run_timers(session);
        self.drain_jitter();
    }

    fn handle_signal(
        &mut self,
        session: &mut Session,
        friend: FriendNumber,
        call_id: u64,
        signal: CallSignal,
    ) {
        match signal {
            CallSignal::Invite {
                settings,
                capabilities,
            } => self.handle_invite(session, friend, call_id, settings, capabilities),
            CallSignal::Ringing => {
                if let Some(index) = self.index_by_id(call_id) {
                    let call = &self.calls[index as usize];
                    if call.as_ref().is_some_and(|c| {
                        c.outgoing && c.state == CallState::Inviting && c.has_peer(friend)
                    }) {
                        self.events.push_back(AvEvent::Ringing { call_index: index });
                    }
                }
            }
            CallSignal::Answer {
                settings,
                capabilities,
            } => {
                let Some(index) = self.index_by_id(call_id) else {
                    debug!(friend, "answer for unknown call dropped");
                    return;
                };
                let Some(call) = self.calls[index as usize].as_mut() else {
                    return;
                };
                if !call.outgoing || call.state != CallState::Inviting || !call.has_peer(friend) {
                    debug!(friend, call = index, "out-of-state answer dropped");
                    return;
                }
                if let Some(peer) = call.peer_mut(friend) {
                    peer.settings = Some(settings);
                    peer.capabilities = capabilities;
                }
                call.state = CallState::Starting;
                call.ringing_deadline = None;
                self.events.push_back(AvEvent::Starting { call_index: index });
            }
            CallSignal::MediaChange { settings } => {
                let Some(index) = self.index_by_id(call_id) else {
                    return;
                };
                let Some(call) = self.calls[index as usize].as_mut() else {
                    return;
                };
                if !call.is_answered() || !call.has_peer(friend) {
                    debug!(friend, call = index, "out-of-state media change dropped");
                    return;
                }
                if let Some(peer) = call.peer_mut(friend) {
                    peer.settings = Some(settings);
                }
                self.events.push_back(AvEvent::MediaChange {
                    call_index: index,
                    friend,
                    settings,
                });
            }
            CallSignal::Hold => {
                if let Some(index) = self.transition_from_peer(call_id, friend, CallState::Active, CallState::Hold) {
                    self.events.push_back(AvEvent::Hold {
                        call_index: index,
                        friend,
                    });
                }
            }
            CallSignal::Resume => {
                if let Some(index) = self.transition_from_peer(call_id, friend, CallState::Hold, CallState::Active) {
                    self.events.push_back(AvEvent::Resume {
                        call_index: index,
                        friend,
                    });
                }
            }
            CallSignal::Cancel { reason } => {
                let Some(index) = self.index_by_id(call_id) else {
                    return;
                };
                let involved = self.calls[index as usize]
                    .as_ref()
                    .is_some_and(|c| c.has_peer(friend));
                if !involved {
                    return;
                }
                self.events.push_back(AvEvent::Cancel {
                    call_index: index,
                    friend,
                    reason,
                });
                if let Some(call) = self.calls[index as usize].as_mut() {
                    call.peers.retain(|p| p.friend != friend);
                    if call.peers.is_empty() {
                        self.end_call(index);
                    }
                }
            }
            CallSignal::Reject { reason } => {
                let Some(index) = self.index_by_id(call_id) else {
                    return;
                };
                let rejectable = self.calls[index as usize]
                    .as_ref()
                    .is_some_and(|c| c.outgoing && c.state == CallState::Inviting && c.has_peer(friend));
                if !rejectable {
                    debug!(friend, call = index, "out-of-state reject dropped");
                    return;
                }
                self.events.push_back(AvEvent::Reject {
                    call_index: index,
                    reason,
                });
                self.end_call(index);
            }
            CallSignal::End => {
                let Some(index) = self.index_by_id(call_id) else {
                    return;
                };
                let involved = self.calls[index as usize]
                    .as_ref()
                    .is_some_and(|c| c.has_peer(friend));
                if involved {
                    self.events.push_back(AvEvent::End { call_index: index });
                    self.end_call(index);
                }
            }
        }
    }

    fn handle_invite(
        &mut self,
        session: &mut Session,
        friend: FriendNumber,
        call_id: u64,
        settings: CodecSettings,
        capabilities: Capabilities,
    ) {
        let ringing = Packet::CallSignal(CallSignalPayload {
            call_id,
            signal: CallSignal::Ringing,
        });

        // Retransmitted invite for a call we already track: just re-ring.
        if self.index_by_id(call_id).is_some() {
            if let Err(e) = session.send_packet(friend, &ringing) {
                debug!(friend, error = %e, "ringing signal not sent");
            }
            return;
        }

        // One call per friend, and a bounded slot table.
        let busy = self.call_with_friend(friend).is_some();
        let slot = self.free_slot().ok();
        let (Some(index), false) = (slot, busy) else {
            let reject = Packet::CallSignal(CallSignalPayload {
                call_id,
                signal: CallSignal::Reject {
                    reason: "busy".to_owned(),
                },
            });
            if let Err(e) = session.send_packet(friend, &reject) {
                debug!(friend, error = %e, "busy reject not sent");
            }
            return;
        };

        self.calls[index as usize] = Some(Call {
            id: call_id,
            outgoing: false,
            state: CallState::Inviting,
            peers: vec![Peer {
                friend,
                settings: Some(settings),
                capabilities,
            }],
            local_settings: settings,
            ringing_deadline: Some(Instant::now() + INCOMING_RING_TIMEOUT),
            last_media: Instant::now(),
            send_seq: 0,
            transmission: None,
        });

        if let Err(e) = session.send_packet(friend, &ringing) {
            debug!(friend, error = %e, "ringing signal not sent");
        }
        self.events.push_back(AvEvent::Invite {
            call_index: index,
            friend,
        });
    }

    fn handle_audio(&mut self, friend: FriendNumber, call_id: u64, seq: u32, frame: Vec<u8>) {
        let Some(index) = self.index_by_id(call_id) else {
            return;
        };
        let Some(call) = self.calls[index as usize].as_mut() else {
            return;
        };
        if call.state != CallState::Active || !call.has_peer(friend) {
            debug!(call = index, "audio frame outside active call dropped");
            return;
        }
        call.last_media = Instant::now();
        if let Some(transmission) = call.transmission.as_mut() {
            transmission.buffer_frame(seq, frame);
        }
    }

    fn handle_video(
        &mut self,
        friend: FriendNumber,
        call_id: u64,
        width: u16,
        height: u16,
        frame: Vec<u8>,
    ) {
        let Some(index) = self.index_by_id(call_id) else {
            return;
        };
        let Some(call) = self.calls[index as usize].as_mut() else {
            return;
        };
        if call.state != CallState::Active || !call.has_peer(friend) || call.transmission.is_none()
        {
            debug!(call = index, "video frame outside active call dropped");
            return;
        }
        call.last_media = Instant::now();
        self.events.push_back(AvEvent::Video {
            call_index: index,
            width,
            height,
            frame,
        });
    }

    /// End calls whose peers were deleted from the friend table.
    fn reap_vanished_peers(&mut self, session: &mut Session) {
        for index in 0..self.calls.len() {
            let Some(call) = self.calls[index].as_mut() else {
                continue;
            };
            call.peers.retain(|p| session.friend_exists(p.friend));
            if call.peers.is_empty() {
                self.events.push_back(AvEvent::End {
                    call_index: index as CallIndex,
                });
                self.end_call(index as CallIndex);
            }
        }
    }

    fn run_timers(&mut self, session: &mut Session) {
        let now = Instant::now();

        for index in 0..self.calls.len() {
            let Some(call) = self.calls[index].as_ref() else {
                continue;
            };
            let index = index as CallIndex;

            if call.state == CallState::Inviting {
                let expired = call.ringing_deadline.is_some_and(|d| now >= d);
                if !expired {
                    continue;
                }
                if call.outgoing {
                    let call_id = call.id;
                    let peers: Vec<FriendNumber> =
                        call.peers.iter().map(|p| p.friend).collect();
                    for friend in peers {
                        let cancel = Packet::CallSignal(CallSignalPayload {
                            call_id,
                            signal: CallSignal::Cancel {
                                reason: "request timed out".to_owned(),
                            },
                        });
                        if let Err(e) = session.send_packet(friend, &cancel) {
                            debug!(call = index, friend, error = %e, "timeout cancel not sent");
                        }
                    }
                    self.events.push_back(AvEvent::RequestTimeout { call_index: index });
                } else {
                    self.events.push_back(AvEvent::PeerTimeout { call_index: index });
                }
                self.end_call(index);
                continue;
            }

            // Media liveness only matters once frames are expected.
            let media_stale = matches!(call.state, CallState::Active | CallState::Hold)
                && call.transmission.is_some()
                && now.duration_since(call.last_media) > self.peer_timeout;
            if media_stale {
                let call_id = call.id;
                let peers: Vec<FriendNumber> = call.peers.iter().map(|p| p.friend).collect();
                for friend in peers {
                    let end = Packet::CallSignal(CallSignalPayload {
                        call_id,
                        signal: CallSignal::End,
                    });
                    if let Err(e) = session.send_packet(friend, &end) {
                        debug!(call = index, friend, error = %e, "timeout end not sent");
                    }
                }
                self.events.push_back(AvEvent::PeerTimeout { call_index: index });
                self.end_call(index);
            }
        }
    }

    /// Release buffered audio in sequence order as data events.
    fn drain_jitter(&mut self) {
        for index in 0..self.calls.len() {
            let Some(call) = self.calls[index].as_mut() else {
                continue;
            };
            let Some(transmission) = call.transmission.as_mut() else {
                continue;
            };
            while let Some(frame) = transmission.pop_frame() {
                self.events.push_back(AvEvent::Audio {
                    call_index: index as CallIndex,
                    frame,
                });
            }
        }
    }

    // ---- internals ------------------------------------------------------

    fn call_ref(&self, call_index: CallIndex) -> Result<&Call> {
        self.calls
            .get(call_index as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::NoSuchCall)
    }

    fn call_mut(&mut self, call_index: CallIndex) -> Result<&mut Call> {
        self.calls
            .get_mut(call_index as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::NoSuchCall)
    }

    fn index_by_id(&self, call_id: u64) -> Option<CallIndex> {
        self.calls.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref()
                .filter(|c| c.id == call_id)
                .map(|_| i as CallIndex)
        })
    }

    fn free_slot(&self) -> Result<CallIndex> {
        self.calls
            .iter()
            .position(Option::is_none)
            .map(|i| i as CallIndex)
            .ok_or(Error::TooManyCalls)
    }

    fn transition_from_peer(
        &mut self,
        call_id: u64,
        friend: FriendNumber,
        expected: CallState,
        next: CallState,
    ) -> Option<CallIndex> {
        let index = self.index_by_id(call_id)?;
        let call = self.calls[index as usize].as_mut()?;
        if call.state != expected || !call.has_peer(friend) {
            debug!(friend, call = index, "out-of-state hold signal dropped");
            return None;
        }
        call.state = next;
        Some(index)
    }

    /// Tear a call down, releasing media resources exactly once.
    fn end_call(&mut self, call_index: CallIndex) {
        if let Some(Some(mut call)) = self.calls.get_mut(call_index as usize).map(Option::take) {
            // The Option guards double-release; dropping the transmission
            // frees the jitter buffer and VAD state.
            call.transmission.take();
            debug!(call = call_index, "call ended");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_bits() {
        let caps = Capabilities::AUDIO_ENCODING | Capabilities::AUDIO_DECODING;
        assert!(caps.contains(Capabilities::AUDIO_ENCODING));
        assert!(!caps.contains(Capabilities::VIDEO_ENCODING));
        assert!(Capabilities::all().contains(caps));
        assert!(caps.contains(Capabilities::NONE));
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = CodecSettings::default();
        settings.validate().expect("defaults are valid");

        settings.audio_sample_rate = 44_100;
        assert_eq!(settings.validate(), Err(Error::InvalidSettings));

        settings = CodecSettings {
            call_type: CallType::Video,
            video_bitrate: 0,
            ..CodecSettings::default()
        };
        assert_eq!(settings.validate(), Err(Error::InvalidSettings));

        settings.video_bitrate = 500;
        settings.validate().expect("video settings valid");
    }

    #[test]
    fn test_jitter_buffer_orders_and_bounds() {
        let mut t = Transmission::new(3, 40, false);
        t.buffer_frame(2, vec![2]);
        t.buffer_frame(0, vec![0]);
        t.buffer_frame(1, vec![1]);

        assert_eq!(t.pop_frame(), Some(vec![0]));
        assert_eq!(t.pop_frame(), Some(vec![1]));
        assert_eq!(t.pop_frame(), Some(vec![2]));
        assert_eq!(t.pop_frame(), None);

        // Overflow drops the oldest frame.
        for seq in 0..5 {
            t.buffer_frame(seq, vec![seq as u8]);
        }
        assert_eq!(t.pop_frame(), Some(vec![2]));
    }

    #[test]
    fn test_kill_transmission_is_idempotent() {
        let mut av = Av::new(2, Capabilities::all());
        // No call at all: still fine.
        av.kill_transmission(0).expect("no-op kill");
        av.kill_transmission(7).expect("out-of-range kill");
    }
}
