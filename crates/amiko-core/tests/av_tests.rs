//! Call-signaling scenarios over the loopback transport.
//!
//! Each side runs its own session plus an [`Av`] subsystem; signaling
//! rides the same sealed packet path as everything else.

use amiko_core::{
    Av, AvEvent, CallState, CallType, Capabilities, CodecSettings, Error, FriendNumber, Identity,
    MemoryHub, Session, SessionConfig,
};
use std::time::Duration;

const RING: Duration = Duration::from_secs(5);

fn session_on(hub: &MemoryHub) -> Session {
    let identity = Identity::generate();
    let transport = hub.attach(identity.public_key());
    let config = SessionConfig {
        ping_interval: Duration::from_millis(0),
        ..SessionConfig::default()
    };
    Session::with_identity(identity, config, Box::new(transport)).expect("session")
}

fn befriended_pair(hub: &MemoryHub) -> (Session, Session, FriendNumber, FriendNumber) {
    let mut a = session_on(hub);
    let mut b = session_on(hub);
    let on_a = a.add_friend_norequest(&b.public_key()).expect("add b");
    let on_b = b.add_friend_norequest(&a.public_key()).expect("add a");
    for _ in 0..4 {
        a.tick();
        b.tick();
    }
    while a.poll_event().is_some() {}
    while b.poll_event().is_some() {}
    (a, b, on_a, on_b)
}

/// One full exchange round: session ticks route packets, av ticks act.
fn pump(a: &mut Session, av_a: &mut Av, b: &mut Session, av_b: &mut Av) {
    for _ in 0..3 {
        a.tick();
        av_a.tick(a);
        b.tick();
        av_b.tick(b);
    }
}

fn drain(av: &mut Av) -> Vec<AvEvent> {
    let mut events = Vec::new();
    while let Some(event) = av.poll_event() {
        events.push(event);
    }
    events
}

/// Drive a pair all the way to an active call. Returns both call indices.
fn establish_call(
    a: &mut Session,
    av_a: &mut Av,
    on_a: FriendNumber,
    b: &mut Session,
    av_b: &mut Av,
) -> (u32, u32) {
    let index_a = av_a
        .call(a, on_a, &CodecSettings::default(), RING)
        .expect("call");
    pump(a, av_a, b, av_b);

    let index_b = drain(av_b)
        .into_iter()
        .find_map(|e| match e {
            AvEvent::Invite { call_index, .. } => Some(call_index),
            _ => None,
        })
        .expect("invite event");

    av_b.answer(b, index_b, &CodecSettings::default())
        .expect("answer");
    pump(a, av_a, b, av_b);
    assert!(drain(av_a)
        .iter()
        .any(|e| matches!(e, AvEvent::Starting { .. })));

    av_a.prepare_transmission(index_a, 8, 40, false)
        .expect("prepare a");
    av_b.prepare_transmission(index_b, 8, 40, false)
        .expect("prepare b");
    assert_eq!(av_a.call_state(index_a), Ok(CallState::Active));
    assert_eq!(av_b.call_state(index_b), Ok(CallState::Active));
    (index_a, index_b)
}

#[test]
fn test_call_reaches_active_and_exchanges_audio() {
    let hub = MemoryHub::new();
    let (mut a, mut b, on_a, _) = befriended_pair(&hub);
    let mut av_a = Av::new(4, Capabilities::all());
    let mut av_b = Av::new(4, Capabilities::all());

    let (index_a, index_b) = establish_call(&mut a, &mut av_a, on_a, &mut b, &mut av_b);

    av_a.send_audio(&mut a, index_a, b"frame-0").expect("audio 0");
    av_a.send_audio(&mut a, index_a, b"frame-1").expect("audio 1");
    pump(&mut a, &mut av_a, &mut b, &mut av_b);

    let frames: Vec<Vec<u8>> = drain(&mut av_b)
        .into_iter()
        .filter_map(|e| match e {
            AvEvent::Audio { frame, .. } => Some(frame),
            _ => None,
        })
        .collect();
    assert_eq!(frames, vec![b"frame-0".to_vec(), b"frame-1".to_vec()]);

    // Hang up; the far side learns via the end event.
    av_a.hangup(&mut a, index_a).expect("hangup");
    assert_eq!(av_a.call_state(index_a), Err(Error::NoSuchCall));
    // Idempotent: a second hangup reports the call as gone, no crash.
    assert_eq!(av_a.hangup(&mut a, index_a), Err(Error::NoSuchCall));
    // Releasing media again is a no-op either way.
    av_a.kill_transmission(index_a).expect("kill after end");

    pump(&mut a, &mut av_a, &mut b, &mut av_b);
    assert!(drain(&mut av_b)
        .iter()
        .any(|e| matches!(e, AvEvent::End { .. })));
    assert_eq!(av_b.call_state(index_b), Err(Error::NoSuchCall));
}

#[test]
fn test_answer_requires_inviting_state() {
    let hub = MemoryHub::new();
    let (mut a, mut b, on_a, _) = befriended_pair(&hub);
    let mut av_a = Av::new(4, Capabilities::all());
    let mut av_b = Av::new(4, Capabilities::all());

    let index_a = av_a
        .call(&mut a, on_a, &CodecSettings::default(), RING)
        .expect("call");

    // The caller cannot answer its own invite.
    assert_eq!(
        av_a.answer(&mut a, index_a, &CodecSettings::default()),
        Err(Error::InvalidCallState)
    );

    pump(&mut a, &mut av_a, &mut b, &mut av_b);
    let index_b = drain(&mut av_b)
        .into_iter()
        .find_map(|e| match e {
            AvEvent::Invite { call_index, .. } => Some(call_index),
            _ => None,
        })
        .expect("invite");

    av_b.answer(&mut b, index_b, &CodecSettings::default())
        .expect("first answer");
    // Already answered: not in inviting state anymore.
    assert_eq!(
        av_b.answer(&mut b, index_b, &CodecSettings::default()),
        Err(Error::InvalidCallState)
    );
    // Answering a slot that never existed reports not-found.
    assert_eq!(
        av_b.answer(&mut b, 3, &CodecSettings::default()),
        Err(Error::NoSuchCall)
    );
}

#[test]
fn test_reject_and_cancel() {
    let hub = MemoryHub::new();
    let (mut a, mut b, on_a, _) = befriended_pair(&hub);
    let mut av_a = Av::new(4, Capabilities::all());
    let mut av_b = Av::new(4, Capabilities::all());

    // Reject path.
    let index_a = av_a
        .call(&mut a, on_a, &CodecSettings::default(), RING)
        .expect("call");
    pump(&mut a, &mut av_a, &mut b, &mut av_b);
    let index_b = drain(&mut av_b)
        .into_iter()
        .find_map(|e| match e {
            AvEvent::Invite { call_index, .. } => Some(call_index),
            _ => None,
        })
        .expect("invite");

    av_b.reject(&mut b, index_b, "not now").expect("reject");
    assert_eq!(av_b.call_state(index_b), Err(Error::NoSuchCall));
    pump(&mut a, &mut av_a, &mut b, &mut av_b);

    let rejected = drain(&mut av_a).into_iter().find_map(|e| match e {
        AvEvent::Reject { call_index, reason } => Some((call_index, reason)),
        _ => None,
    });
    assert_eq!(rejected, Some((index_a, "not now".to_owned())));
    assert_eq!(av_a.call_state(index_a), Err(Error::NoSuchCall));

    // Cancel path.
    let index_a = av_a
        .call(&mut a, on_a, &CodecSettings::default(), RING)
        .expect("second call");
    pump(&mut a, &mut av_a, &mut b, &mut av_b);
    drain(&mut av_b);

    av_a.cancel(&mut a, index_a, on_a, "misdial").expect("cancel");
    assert_eq!(av_a.call_state(index_a), Err(Error::NoSuchCall));
    pump(&mut a, &mut av_a, &mut b, &mut av_b);
    assert!(drain(&mut av_b)
        .iter()
        .any(|e| matches!(e, AvEvent::Cancel { .. })));
}

#[test]
fn test_ringing_timeout() {
    let hub = MemoryHub::new();
    let (mut a, mut b, on_a, _) = befriended_pair(&hub);
    let mut av_a = Av::new(4, Capabilities::all());

    let index_a = av_a
        .call(&mut a, on_a, &CodecSettings::default(), Duration::from_millis(30))
        .expect("call");

    // Nobody ever answers.
    std::thread::sleep(Duration::from_millis(40));
    a.tick();
    av_a.tick(&mut a);
    b.tick();

    assert!(drain(&mut av_a).contains(&AvEvent::RequestTimeout {
        call_index: index_a
    }));
    assert_eq!(av_a.call_state(index_a), Err(Error::NoSuchCall));
}

#[test]
fn test_peer_media_timeout_releases_call() {
    let hub = MemoryHub::new();
    let (mut a, mut b, on_a, _) = befriended_pair(&hub);
    let mut av_a = Av::new(4, Capabilities::all());
    let mut av_b = Av::new(4, Capabilities::all());
    av_a.set_peer_timeout(Duration::from_millis(30));

    let (index_a, _) = establish_call(&mut a, &mut av_a, on_a, &mut b, &mut av_b);

    std::thread::sleep(Duration::from_millis(40));
    a.tick();
    av_a.tick(&mut a);

    assert!(drain(&mut av_a).contains(&AvEvent::PeerTimeout {
        call_index: index_a
    }));
    assert_eq!(av_a.call_state(index_a), Err(Error::NoSuchCall));
}

#[test]
fn test_settings_renegotiation_and_capabilities() {
    let hub = MemoryHub::new();
    let (mut a, mut b, on_a, on_b) = befriended_pair(&hub);
    // a can only do audio; b can do everything.
    let mut av_a = Av::new(4, Capabilities::audio());
    let mut av_b = Av::new(4, Capabilities::all());

    let (index_a, index_b) = establish_call(&mut a, &mut av_a, on_a, &mut b, &mut av_b);

    // b learned a's invite capabilities; a learned b's answer capabilities.
    assert_eq!(
        av_b.capability_supported(index_b, Capabilities::AUDIO_ENCODING),
        Ok(true)
    );
    assert_eq!(
        av_b.capability_supported(index_b, Capabilities::VIDEO_ENCODING),
        Ok(false)
    );
    assert_eq!(
        av_a.capability_supported(index_a, Capabilities::VIDEO_DECODING),
        Ok(true)
    );

    // Peer ids line up with the friend table.
    assert_eq!(av_a.peer_id(index_a, 0), Ok(on_a));
    assert_eq!(av_b.peer_id(index_b, 0), Ok(on_b));

    // Renegotiate to video mid-call.
    let video = CodecSettings {
        call_type: CallType::Video,
        ..CodecSettings::default()
    };
    av_a.change_settings(&mut a, index_a, &video).expect("renegotiate");
    pump(&mut a, &mut av_a, &mut b, &mut av_b);

    let changed = drain(&mut av_b).into_iter().find_map(|e| match e {
        AvEvent::MediaChange { settings, .. } => Some(settings),
        _ => None,
    });
    assert_eq!(changed, Some(video));
    assert_eq!(av_b.peer_settings(index_b, 0), Ok(video));

    // Out-of-range settings never make it onto the wire.
    let broken = CodecSettings {
        audio_sample_rate: 44_100,
        ..CodecSettings::default()
    };
    assert_eq!(
        av_a.change_settings(&mut a, index_a, &broken),
        Err(Error::InvalidSettings)
    );
    assert_eq!(
        av_a.call(&mut a, on_a, &broken, RING),
        Err(Error::InvalidSettings)
    );
}

#[test]
fn test_hold_resume_roundtrip() {
    let hub = MemoryHub::new();
    let (mut a, mut b, on_a, _) = befriended_pair(&hub);
    let mut av_a = Av::new(4, Capabilities::all());
    let mut av_b = Av::new(4, Capabilities::all());

    let (index_a, index_b) = establish_call(&mut a, &mut av_a, on_a, &mut b, &mut av_b);

    av_a.hold(&mut a, index_a).expect("hold");
    assert_eq!(av_a.call_state(index_a), Ok(CallState::Hold));
    // No media while parked.
    assert_eq!(
        av_a.send_audio(&mut a, index_a, b"x"),
        Err(Error::InvalidCallState)
    );
    // Hold is only valid from active.
    assert_eq!(av_a.hold(&mut a, index_a), Err(Error::InvalidCallState));

    pump(&mut a, &mut av_a, &mut b, &mut av_b);
    assert!(drain(&mut av_b)
        .iter()
        .any(|e| matches!(e, AvEvent::Hold { .. })));
    assert_eq!(av_b.call_state(index_b), Ok(CallState::Hold));

    av_a.resume(&mut a, index_a).expect("resume");
    pump(&mut a, &mut av_a, &mut b, &mut av_b);
    assert!(drain(&mut av_b)
        .iter()
        .any(|e| matches!(e, AvEvent::Resume { .. })));
    assert_eq!(av_a.call_state(index_a), Ok(CallState::Active));
    assert_eq!(av_b.call_state(index_b), Ok(CallState::Active));
}

#[test]
fn test_video_frames_carry_geometry() {
    let hub = MemoryHub::new();
    let (mut a, mut b, on_a, _) = befriended_pair(&hub);
    let mut av_a = Av::new(4, Capabilities::all());
    let mut av_b = Av::new(4, Capabilities::all());

    let index_a = av_a
        .call(
            &mut a,
            on_a,
            &CodecSettings {
                call_type: CallType::Video,
                ..CodecSettings::default()
            },
            RING,
        )
        .expect("call");
    pump(&mut a, &mut av_a, &mut b, &mut av_b);
    let index_b = drain(&mut av_b)
        .into_iter()
        .find_map(|e| match e {
            AvEvent::Invite { call_index, .. } => Some(call_index),
            _ => None,
        })
        .expect("invite");
    av_b.answer(
        &mut b,
        index_b,
        &CodecSettings {
            call_type: CallType::Video,
            ..CodecSettings::default()
        },
    )
    .expect("answer");
    pump(&mut a, &mut av_a, &mut b, &mut av_b);
    av_a.prepare_transmission(index_a, 8, 40, true).expect("prepare a");
    av_b.prepare_transmission(index_b, 8, 40, true).expect("prepare b");

    av_a.send_video(&mut a, index_a, 640, 480, b"vp8-keyframe")
        .expect("video");
    pump(&mut a, &mut av_a, &mut b, &mut av_b);

    let frame = drain(&mut av_b).into_iter().find_map(|e| match e {
        AvEvent::Video {
            width,
            height,
            frame,
            ..
        } => Some((width, height, frame)),
        _ => None,
    });
    assert_eq!(frame, Some((640, 480, b"vp8-keyframe".to_vec())));
}

#[test]
fn test_second_call_to_same_friend_rejected() {
    let hub = MemoryHub::new();
    let (mut a, mut b, on_a, _) = befriended_pair(&hub);
    let mut av_a = Av::new(4, Capabilities::all());

    av_a.call(&mut a, on_a, &CodecSettings::default(), RING)
        .expect("first call");
    assert_eq!(
        av_a.call(&mut a, on_a, &CodecSettings::default(), RING),
        Err(Error::AlreadyInCall)
    );
    b.tick();
}

#[test]
fn test_media_requires_prepared_transmission() {
    let hub = MemoryHub::new();
    let (mut a, mut b, on_a, _) = befriended_pair(&hub);
    let mut av_a = Av::new(4, Capabilities::all());
    let mut av_b = Av::new(4, Capabilities::all());

    let index_a = av_a
        .call(&mut a, on_a, &CodecSettings::default(), RING)
        .expect("call");
    // Still inviting: no media possible.
    assert_eq!(
        av_a.send_audio(&mut a, index_a, b"early"),
        Err(Error::InvalidCallState)
    );

    pump(&mut a, &mut av_a, &mut b, &mut av_b);
    let index_b = drain(&mut av_b)
        .into_iter()
        .find_map(|e| match e {
            AvEvent::Invite { call_index, .. } => Some(call_index),
            _ => None,
        })
        .expect("invite");
    av_b.answer(&mut b, index_b, &CodecSettings::default())
        .expect("answer");
    pump(&mut a, &mut av_a, &mut b, &mut av_b);

    // Starting, but transmission not prepared yet.
    assert_eq!(av_a.call_state(index_a), Ok(CallState::Starting));
    assert_eq!(
        av_a.send_audio(&mut a, index_a, b"still early"),
        Err(Error::InvalidCallState)
    );

    // Double prepare is a state error; the first one sticks.
    av_a.prepare_transmission(index_a, 8, 40, false).expect("prepare");
    assert_eq!(
        av_a.prepare_transmission(index_a, 8, 40, false),
        Err(Error::InvalidCallState)
    );

    // Audio-only call refuses video frames.
    av_b.prepare_transmission(index_b, 8, 40, false).expect("prepare b");
    assert_eq!(
        av_a.send_video(&mut a, index_a, 320, 240, b"frame"),
        Err(Error::InvalidCallState)
    );
}

#[test]
fn test_deleted_friend_tears_down_call() {
    let hub = MemoryHub::new();
    let (mut a, mut b, on_a, _) = befriended_pair(&hub);
    let mut av_a = Av::new(4, Capabilities::all());
    let mut av_b = Av::new(4, Capabilities::all());

    let (index_a, _) = establish_call(&mut a, &mut av_a, on_a, &mut b, &mut av_b);

    a.del_friend(on_a).expect("delete friend");
    a.tick();
    av_a.tick(&mut a);

    assert!(drain(&mut av_a).contains(&AvEvent::End {
        call_index: index_a
    }));
    assert_eq!(av_a.call_state(index_a), Err(Error::NoSuchCall));
    // The freed slot is allocatable again once a new friend exists.
    let c = Identity::generate();
    let on_c = a.add_friend_norequest(&c.public_key()).expect("add");
    assert_eq!(
        av_a.call(&mut a, on_c, &CodecSettings::default(), RING),
        Err(Error::FriendOffline)
    );
}
