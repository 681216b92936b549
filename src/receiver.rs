//! Session receiver: connect, negotiate, drain PCM/FLAC into playback
//! (§4.4, original `receiving.c`).

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::audio::{self, AudioPlayback};
use crate::chat::ChatClient;
use crate::config::AudioConfig;
use crate::error::Result;
use crate::net;
use crate::ping::PingClient;
use crate::protocol::{self, AUDIO_PORT};
use crate::sink::{ChatKind, UiSink};
use crate::state::{AppState, SessionStats};

/// How the receive thread opens its playback device. Overridable via
/// [`ReceiverSession::with_playback`] so tests can exercise the
/// connect/negotiate/drain path without touching real audio hardware.
type PlaybackFactory = Arc<dyn Fn(&AudioConfig) -> Result<Box<dyn AudioPlayback>> + Send + Sync>;

/// Owns the single receive thread and the shared handles ([`ChatClient`],
/// the negotiated audio socket) that `stop()` and `send_chat` need to reach
/// into from outside that thread.
pub struct ReceiverSession {
    app: Arc<AppState>,
    sink: Arc<dyn UiSink>,
    stats: Arc<SessionStats>,
    local_preset: usize,
    chat: Arc<Mutex<Option<ChatClient>>>,
    audio_stream: Arc<Mutex<Option<TcpStream>>>,
    thread: Option<JoinHandle<()>>,
    playback: PlaybackFactory,
}

impl ReceiverSession {
    pub fn new(app: Arc<AppState>, sink: Arc<dyn UiSink>) -> Self {
        Self {
            app,
            sink,
            stats: Arc::new(SessionStats::new()),
            local_preset: crate::config::DEFAULT_PRESET,
            chat: Arc::new(Mutex::new(None)),
            audio_stream: Arc::new(Mutex::new(None)),
            thread: None,
            playback: Arc::new(audio::open_playback),
        }
    }

    /// Override the playback backend. Used by tests to avoid touching real
    /// audio hardware; production callers can leave this at its default.
    pub fn with_playback(mut self, factory: impl Fn(&AudioConfig) -> Result<Box<dyn AudioPlayback>> + Send + Sync + 'static) -> Self {
        self.playback = Arc::new(factory);
        self
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    /// Connect to `server_ip` and start receiving. `local_preset` is used
    /// only for the ping client's buffer-latency estimate (§9 design note 4)
    /// — it is never transmitted.
    pub fn start(&mut self, server_ip: String, local_preset: usize) -> Result<()> {
        if self.app.is_receiving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.local_preset = local_preset;
        self.stats.current_latency_ms.store(-1, Ordering::SeqCst);
        self.stats.total_bytes.store(0, Ordering::SeqCst);

        let thread = thread::spawn({
            let app = self.app.clone();
            let sink = self.sink.clone();
            let stats = self.stats.clone();
            let chat_slot = self.chat.clone();
            let audio_slot = self.audio_stream.clone();
            let playback = self.playback.clone();
            move || receive_thread(app, sink, stats, chat_slot, audio_slot, server_ip, local_preset, playback)
        });
        self.thread = Some(thread);
        Ok(())
    }

    /// Stop receiving. Idempotent (§9 design note 1). Shuts the audio socket
    /// down first so a blocking read inside the receive thread unblocks
    /// immediately, then joins it.
    pub fn stop(&mut self) {
        if !self.app.is_receiving.swap(false, Ordering::SeqCst) {
            return;
        }

        tracing::info!("stopping receiving");
        self.sink.update_status("Stopping...");

        if let Some(stream) = self.audio_stream.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }

    /// Show `text` locally as sent, then forward it to the streamer
    /// (original: `on_chat_send` → `chat_client_send(own_ip, text)`).
    pub fn send_chat(&self, text: &str) {
        self.sink.chat_message("You", text, ChatKind::Sent);
        let ip = net::device_ipv4().unwrap_or_else(|| "unknown".into());
        if let Some(chat) = self.chat.lock().as_ref() {
            chat.send(&ip, text);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn receive_thread(
    app: Arc<AppState>,
    sink: Arc<dyn UiSink>,
    stats: Arc<SessionStats>,
    chat_slot: Arc<Mutex<Option<ChatClient>>>,
    audio_slot: Arc<Mutex<Option<TcpStream>>>,
    server_ip: String,
    local_preset: usize,
    playback_factory: PlaybackFactory,
) {
    tracing::info!(server_ip, "receive thread started");

    let mut stream = match net::connect_with_timeout(&server_ip, AUDIO_PORT, 5000) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "cannot connect to streamer");
            sink.update_status(&format!("Cannot connect to {server_ip}:{AUDIO_PORT}"));
            app.is_receiving.store(false, Ordering::SeqCst);
            sink.reset();
            return;
        }
    };

    let cfg = match protocol::read_header(&mut stream) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "invalid stream format");
            sink.update_status("Invalid stream format");
            app.is_receiving.store(false, Ordering::SeqCst);
            sink.reset();
            return;
        }
    };

    *audio_slot.lock() = match stream.try_clone() {
        Ok(s) => Some(s),
        Err(_) => None,
    };

    sink.update_status(&format!("Receiving {} {} from {server_ip}", cfg.sample_rate_string(), cfg.channel_string()));
    sink.show_receiving(&server_ip);
    sink.update_format_info(&cfg.sample_rate_string(), &cfg.format_string());

    let local_cfg = AudioConfig::from_preset(local_preset);
    let mut ping = PingClient::start(app.clone(), stats.clone(), sink.clone(), server_ip.clone(), local_cfg);
    *chat_slot.lock() = Some(ChatClient::start(app.clone(), sink.clone(), server_ip.clone()));

    let mut playback = match playback_factory(&cfg) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to open audio playback");
            sink.update_status("Failed to open audio playback");
            cleanup(&app, &sink, &mut ping, &chat_slot, &audio_slot);
            return;
        }
    };

    stats.reset_clock();
    stats.total_bytes.store(0, Ordering::SeqCst);

    if cfg.use_flac() {
        receive_flac_loop(&app, &mut stream, playback.as_mut(), &cfg, &stats, &sink);
    } else {
        receive_pcm_loop(&app, &mut stream, playback.as_mut(), &cfg, &stats, &sink);
    }

    cleanup(&app, &sink, &mut ping, &chat_slot, &audio_slot);
}

fn cleanup(app: &Arc<AppState>, sink: &Arc<dyn UiSink>, ping: &mut PingClient, chat_slot: &Arc<Mutex<Option<ChatClient>>>, audio_slot: &Arc<Mutex<Option<TcpStream>>>) {
    ping.stop();
    if let Some(mut chat) = chat_slot.lock().take() {
        chat.stop();
    }
    audio_slot.lock().take();
    app.is_receiving.store(false, Ordering::SeqCst);
    sink.reset();
    sink.update_status("Receiving stopped");
    tracing::info!("receive thread stopped");
}

fn receive_pcm_loop(
    app: &Arc<AppState>,
    stream: &mut TcpStream,
    playback: &mut dyn AudioPlayback,
    cfg: &AudioConfig,
    stats: &Arc<SessionStats>,
    sink: &Arc<dyn UiSink>,
) {
    let mut buf = vec![0u8; cfg.chunk_size as usize];
    while app.is_receiving.load(Ordering::SeqCst) {
        if protocol::read_exact(stream, &mut buf).is_err() {
            if app.is_receiving.load(Ordering::SeqCst) {
                sink.update_status("Streamer disconnected");
            }
            break;
        }
        if playback.write(&buf).is_err() {
            break;
        }
        if let Some((kbps, total, elapsed)) = stats.record_bytes(buf.len() as i64) {
            sink.update_stats(kbps, total, elapsed);
        }
    }
}

fn receive_flac_loop(
    app: &Arc<AppState>,
    stream: &mut TcpStream,
    playback: &mut dyn AudioPlayback,
    cfg: &AudioConfig,
    stats: &Arc<SessionStats>,
    sink: &Arc<dyn UiSink>,
) {
    let comp_cap = cfg.chunk_size as usize * 2;
    let mut frame = vec![0u8; comp_cap];

    while app.is_receiving.load(Ordering::SeqCst) {
        let frame_len = match protocol::read_u32_be(stream) {
            Ok(n) => n as usize,
            Err(_) => {
                if app.is_receiving.load(Ordering::SeqCst) {
                    sink.update_status("Streamer disconnected");
                }
                break;
            }
        };
        if frame_len == 0 || frame_len > comp_cap {
            tracing::warn!(frame_len, "invalid FLAC frame length");
            continue;
        }
        if protocol::read_exact(stream, &mut frame[..frame_len]).is_err() {
            break;
        }
        let _ = playback.write(&frame[..frame_len]);

        if let Some((kbps, total, elapsed)) = stats.record_bytes((frame_len + 4) as i64) {
            sink.update_stats(kbps, total, elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullSink;

    #[test]
    fn stop_before_start_is_a_noop() {
        let app = Arc::new(AppState::new());
        let sink: Arc<dyn UiSink> = Arc::new(NullSink);
        let mut session = ReceiverSession::new(app, sink);
        session.stop();
        session.stop();
    }
}
