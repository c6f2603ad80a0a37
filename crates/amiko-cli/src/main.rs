//! amiko demonstration driver.
//!
//! `identity` prints a freshly generated address; `demo` wires two
//! sessions over the in-process loopback transport and walks the whole
//! engine surface: friend request, messaging, a file transfer and a short
//! voice call, ticking both sides the way a real embedder would.

use amiko_core::{
    Av, AvEvent, Capabilities, CodecSettings, ControlAction, Direction, Event, Identity, MemoryHub,
    Session, SessionConfig,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// amiko - peer-to-peer encrypted messenger core
#[derive(Parser)]
#[command(name = "amiko")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an identity and print its address
    Identity,

    /// Run two in-process sessions through the full protocol surface
    Demo,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Identity => identity(),
        Commands::Demo => demo().await,
    }
}

fn identity() -> Result<()> {
    let identity = Identity::generate();
    println!("address: {}", identity.address());
    Ok(())
}

fn named_session(hub: &MemoryHub, name: &[u8]) -> Result<Session> {
    let identity = Identity::generate();
    let transport = hub.attach(identity.public_key());
    let config = SessionConfig {
        name: name.to_vec(),
        ping_interval: Duration::from_millis(100),
        ..SessionConfig::default()
    };
    Session::with_identity(identity, config, Box::new(transport))
        .context("session construction")
}

fn show_events(who: &str, session: &mut Session) {
    while let Some(event) = session.poll_event() {
        match event {
            Event::Message { friend, message } => {
                println!("[{who}] message from #{friend}: {}", String::from_utf8_lossy(&message));
            }
            Event::ReadReceipt { message_id, .. } => {
                println!("[{who}] message {message_id} was read");
            }
            Event::FileData { position, data, .. } => {
                println!("[{who}] file chunk at {position}: {} bytes", data.len());
            }
            other => println!("[{who}] {other:?}"),
        }
    }
}

fn show_av_events(who: &str, av: &mut Av) {
    while let Some(event) = av.poll_event() {
        match event {
            AvEvent::Audio { frame, .. } => {
                println!("[{who}] audio frame: {} bytes", frame.len());
            }
            other => println!("[{who}] {other:?}"),
        }
    }
}

async fn demo() -> Result<()> {
    let hub = MemoryHub::new();
    let mut alice = named_session(&hub, b"alice")?;
    let mut bob = named_session(&hub, b"bob")?;

    println!("alice: {}", alice.address());
    println!("bob:   {}", bob.address());

    let bootstrap_key = Identity::generate();
    alice.bootstrap("loopback", 33445, &bootstrap_key.public_key())?;
    bob.bootstrap("loopback", 33445, &bootstrap_key.public_key())?;

    // Friendship: a real request, confirmed on bob's side.
    let bob_address = bob.address();
    let bob_on_alice = alice.add_friend(&bob_address, b"hi bob, it's alice")?;

    let mut alice_on_bob = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    while alice_on_bob.is_none() {
        ticker.tick().await;
        alice.tick();
        bob.tick();
        while let Some(event) = bob.poll_event() {
            if let Event::FriendRequest {
                public_key,
                message,
            } = event
            {
                println!("[bob] friend request: {}", String::from_utf8_lossy(&message));
                alice_on_bob = Some(bob.add_friend_norequest(&public_key)?);
            }
        }
    }
    let alice_on_bob = alice_on_bob.context("friend request never arrived")?;

    // Wait until both ends see each other online.
    loop {
        ticker.tick().await;
        alice.tick();
        bob.tick();
        if alice.friend_connection_status(bob_on_alice)? == amiko_core::ConnectionStatus::Online
            && bob.friend_connection_status(alice_on_bob)? == amiko_core::ConnectionStatus::Online
        {
            break;
        }
    }
    show_events("alice", &mut alice);
    show_events("bob", &mut bob);

    // A message and its receipt.
    let id = alice.send_message(bob_on_alice, b"first encrypted message")?;
    println!("[alice] sent message {id}");
    tick_both(&mut ticker, &mut alice, &mut bob, 3).await;
    show_events("bob", &mut bob);
    show_events("alice", &mut alice);

    // A small file transfer.
    let payload = b"The quick brown fox jumps over the lazy dog.";
    let file_number = alice.new_file_sender(bob_on_alice, payload.len() as u64, b"fox.txt")?;
    tick_both(&mut ticker, &mut alice, &mut bob, 2).await;
    bob.file_send_control(
        alice_on_bob,
        Direction::Receiving,
        file_number,
        ControlAction::Accept,
        &[],
    )?;
    tick_both(&mut ticker, &mut alice, &mut bob, 2).await;
    for chunk in payload.chunks(16) {
        alice.file_send_data(bob_on_alice, file_number, chunk)?;
    }
    alice.file_send_control(
        bob_on_alice,
        Direction::Sending,
        file_number,
        ControlAction::Finished,
        &[],
    )?;
    tick_both(&mut ticker, &mut alice, &mut bob, 3).await;
    show_events("bob", &mut bob);
    show_events("alice", &mut alice);

    // A short voice call.
    let mut alice_av = Av::new(4, Capabilities::all());
    let mut bob_av = Av::new(4, Capabilities::all());

    let call = alice_av.call(
        &mut alice,
        bob_on_alice,
        &CodecSettings::default(),
        Duration::from_secs(10),
    )?;
    tick_all(&mut ticker, &mut alice, &mut alice_av, &mut bob, &mut bob_av, 3).await;

    let mut bob_call = None;
    while let Some(event) = bob_av.poll_event() {
        if let AvEvent::Invite { call_index, .. } = event {
            println!("[bob] incoming call {call_index}");
            bob_call = Some(call_index);
        }
    }
    let bob_call = bob_call.context("invite never arrived")?;
    bob_av.answer(&mut bob, bob_call, &CodecSettings::default())?;
    tick_all(&mut ticker, &mut alice, &mut alice_av, &mut bob, &mut bob_av, 3).await;
    show_av_events("alice", &mut alice_av);

    alice_av.prepare_transmission(call, 8, 40, false)?;
    bob_av.prepare_transmission(bob_call, 8, 40, false)?;
    for seq in 0..3u8 {
        alice_av.send_audio(&mut alice, call, &[seq; 40])?;
    }
    tick_all(&mut ticker, &mut alice, &mut alice_av, &mut bob, &mut bob_av, 3).await;
    show_av_events("bob", &mut bob_av);

    alice_av.hangup(&mut alice, call)?;
    tick_all(&mut ticker, &mut alice, &mut alice_av, &mut bob, &mut bob_av, 3).await;
    show_av_events("bob", &mut bob_av);

    // Snapshot round-trip before exit.
    let blob = alice.serialize()?;
    println!("snapshot: {} bytes", blob.len());

    Ok(())
}

async fn tick_both(
    ticker: &mut tokio::time::Interval,
    a: &mut Session,
    b: &mut Session,
    rounds: usize,
) {
    for _ in 0..rounds {
        ticker.tick().await;
        a.tick();
        b.tick();
    }
}

async fn tick_all(
    ticker: &mut tokio::time::Interval,
    a: &mut Session,
    a_av: &mut Av,
    b: &mut Session,
    b_av: &mut Av,
    rounds: usize,
) {
    for _ in 0..rounds {
        ticker.tick().await;
        a.tick();
        a_av.tick(a);
        b.tick();
        b_av.tick(b);
    }
}
