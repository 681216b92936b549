//! CLI entry point: process bootstrap, signal handling, start/stop
//! orchestration. The original is GUI-driven (`ui_run`); this crate's
//! external collaborator for "process bootstrap" (§1) is a headless CLI
//! instead, so the flag surface below is this crate's own, not a port of
//! anything in `main.c`.

use std::io::BufRead;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;

use soundshare::{AppState, ChannelSink, ReceiverSession, Session, UiSink};

#[derive(Parser)]
#[command(name = "soundshare", version, about = "Near-real-time system audio streaming over TCP")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Capture this host's audio and stream it to any receivers that connect.
    Stream {
        /// Preset index (0-6), see soundshare::config::QUALITY_NAMES.
        #[arg(long, default_value_t = soundshare::config::DEFAULT_PRESET)]
        preset: usize,
    },
    /// Connect to a streamer and play its audio.
    Receive {
        /// Streamer's IPv4 address.
        server_ip: String,
        /// Local preset used only for the ping buffer-latency estimate.
        #[arg(long, default_value_t = soundshare::config::DEFAULT_PRESET)]
        preset: usize,
    },
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Spawn a thread that logs every [`soundshare::sink::UiEvent`] via
/// `tracing`, the headless stand-in for the GUI this crate's Non-goals
/// exclude.
fn spawn_event_printer(rx: Receiver<soundshare::sink::UiEvent>) {
    std::thread::spawn(move || {
        for event in rx {
            tracing::info!(?event, "ui event");
        }
    });
}

/// Forward stdin lines onto a channel until EOF, so the main thread can pump
/// them into `send_chat` without sharing a session reference across threads.
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(text) if !text.is_empty() => {
                    if tx.send(text).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
    rx
}

/// Pump chat input into `on_chat` until shutdown is requested.
fn run_until_shutdown(app: &Arc<AppState>, chat_rx: &Receiver<String>, on_chat: impl Fn(&str)) {
    while !app.shutdown_requested.load(Ordering::SeqCst) {
        match chat_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(text) => on_chat(&text),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn main() -> Result<()> {
    soundshare::logging::init();
    ignore_sigpipe();

    let app = Arc::new(AppState::new());
    let shutdown_flag = app.clone();
    ctrlc::set_handler(move || shutdown_flag.shutdown_requested.store(true, Ordering::SeqCst))
        .context("failed to install signal handler")?;

    let cli = Cli::parse();
    let (sink, events) = ChannelSink::new();
    let sink: Arc<dyn UiSink> = Arc::new(sink);
    spawn_event_printer(events);
    let chat_rx = spawn_stdin_reader();

    tracing::info!("soundshare starting");

    match cli.mode {
        Mode::Stream { preset } => {
            let mut session = Session::new(app.clone(), sink.clone());
            session.start(preset).context("failed to start streaming")?;
            run_until_shutdown(&app, &chat_rx, |text| session.send_chat(text));
            session.stop();
        }
        Mode::Receive { server_ip, preset } => {
            let mut session = ReceiverSession::new(app.clone(), sink.clone());
            session.start(server_ip, preset).context("failed to start receiving")?;
            run_until_shutdown(&app, &chat_rx, |text| session.send_chat(text));
            session.stop();
        }
    }

    tracing::info!("soundshare exiting");
    Ok(())
}
