//! Session streamer: accept loop + audio fan-out (§4.3, original `streaming.c`).

use std::io::Write;
use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::{self, AudioCapture};
use crate::chat::ChatServer;
use crate::config::AudioConfig;
use crate::error::Result;
use crate::net::{self, ClientTable};
use crate::ping::PingServer;
use crate::protocol::{self, AUDIO_PORT};
use crate::sink::UiSink;
use crate::state::{AppState, SessionStats};

/// How the stream thread opens its capture device. Overridable via
/// [`Session::with_capture`] so tests can exercise the accept/fan-out/stats
/// path without touching real audio hardware.
type CaptureFactory = Arc<dyn Fn(&AudioConfig) -> Result<Box<dyn AudioCapture>> + Send + Sync>;

/// Owns everything needed to stream this host's audio to N receivers: the
/// admitted-client table, the sub-service handles, and the two worker
/// threads. One instance per `start()`/`stop()` cycle (§9 design note 1).
pub struct Session {
    app: Arc<AppState>,
    sink: Arc<dyn UiSink>,
    stats: Arc<SessionStats>,
    clients: Arc<ClientTable>,
    cfg: Option<AudioConfig>,
    server: Option<TcpListener>,
    accept_thread: Option<JoinHandle<()>>,
    stream_thread: Option<JoinHandle<()>>,
    ping: Option<PingServer>,
    chat: Option<ChatServer>,
    capture: CaptureFactory,
}

impl Session {
    pub fn new(app: Arc<AppState>, sink: Arc<dyn UiSink>) -> Self {
        Self {
            app,
            sink,
            stats: Arc::new(SessionStats::new()),
            clients: Arc::new(ClientTable::new()),
            cfg: None,
            server: None,
            accept_thread: None,
            stream_thread: None,
            ping: None,
            chat: None,
            capture: Arc::new(audio::open_capture),
        }
    }

    /// Override the capture backend. Used by tests to avoid touching real
    /// audio hardware; production callers can leave this at its default.
    pub fn with_capture(mut self, factory: impl Fn(&AudioConfig) -> Result<Box<dyn AudioCapture>> + Send + Sync + 'static) -> Self {
        self.capture = Arc::new(factory);
        self
    }

    pub fn receiver_count(&self) -> usize {
        self.clients.count()
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    pub fn chat(&self) -> Option<&ChatServer> {
        self.chat.as_ref()
    }

    /// Show `text` locally as sent, then fan it out to every connected chat
    /// client (original: `on_chat_send` → `chat_server_broadcast("Host", ...)`).
    pub fn send_chat(&self, text: &str) {
        self.sink.chat_message("You", text, crate::sink::ChatKind::Sent);
        if let Some(chat) = &self.chat {
            chat.broadcast("Host", text);
        }
    }

    /// Begin streaming with the given preset. Idempotent: a second call
    /// while already streaming is a no-op (§9 design note 1).
    pub fn start(&mut self, preset_index: usize) -> Result<()> {
        if self.app.is_streaming.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cfg = AudioConfig::from_preset(preset_index);
        let server = match net::create_server(AUDIO_PORT, 8) {
            Ok(s) => s,
            Err(e) => {
                self.app.is_streaming.store(false, Ordering::SeqCst);
                self.sink.update_status("Failed to bind audio port");
                return Err(e);
            }
        };

        self.stats.receiver_count.store(0, Ordering::SeqCst);
        self.stats.current_latency_ms.store(-1, Ordering::SeqCst);

        self.sink.show_streaming(&cfg.format_string());
        self.sink.update_format_info(&cfg.sample_rate_string(), &cfg.format_string());

        let ip = net::device_ipv4().unwrap_or_else(|| "0.0.0.0".into());
        self.sink
            .update_status(&format!("Streaming on {ip}:{AUDIO_PORT} - waiting for receivers..."));

        let mut ping = match PingServer::start(self.app.clone(), self.stats.clone(), self.sink.clone()) {
            Ok(p) => p,
            Err(e) => {
                self.app.is_streaming.store(false, Ordering::SeqCst);
                self.sink.update_status("Failed to start ping service");
                return Err(e);
            }
        };
        let chat = match ChatServer::start(self.app.clone(), self.sink.clone()) {
            Ok(c) => c,
            Err(e) => {
                self.app.is_streaming.store(false, Ordering::SeqCst);
                self.sink.update_status("Failed to start chat service");
                ping.stop();
                return Err(e);
            }
        };
        self.ping = Some(ping);
        self.chat = Some(chat);

        let accept_fd = server.try_clone()?;
        let accept_thread = thread::spawn({
            let app = self.app.clone();
            let clients = self.clients.clone();
            let stats = self.stats.clone();
            let sink = self.sink.clone();
            move || accept_loop(app, clients, stats, sink, accept_fd, cfg)
        });

        let stream_thread = thread::spawn({
            let app = self.app.clone();
            let clients = self.clients.clone();
            let stats = self.stats.clone();
            let sink = self.sink.clone();
            let capture = self.capture.clone();
            move || stream_loop(app, clients, stats, sink, cfg, capture)
        });

        self.cfg = Some(cfg);
        self.server = Some(server);
        self.accept_thread = Some(accept_thread);
        self.stream_thread = Some(stream_thread);
        Ok(())
    }

    /// Stop streaming. Idempotent: calling `stop` twice, or on a session that
    /// never started, does nothing the second time (§9 design note 1).
    pub fn stop(&mut self) {
        if !self.app.is_streaming.swap(false, Ordering::SeqCst) {
            return;
        }

        tracing::info!("stopping streaming");
        self.sink.update_status("Stopping...");

        if let Some(mut ping) = self.ping.take() {
            ping.stop();
        }
        if let Some(mut chat) = self.chat.take() {
            chat.stop();
        }
        self.server.take();
        self.clients.close_all();

        if let Some(t) = self.accept_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.stream_thread.take() {
            let _ = t.join();
        }

        self.stats.receiver_count.store(0, Ordering::SeqCst);
        self.sink.reset();
        self.sink.update_status("Streaming stopped");
    }
}

fn accept_loop(app: Arc<AppState>, clients: Arc<ClientTable>, stats: Arc<SessionStats>, sink: Arc<dyn UiSink>, server: TcpListener, cfg: AudioConfig) {
    tracing::info!("accept thread started");
    while app.is_streaming.load(Ordering::SeqCst) {
        if net::poll_acceptable(&server, 1000) <= 0 {
            continue;
        }
        let (stream, ip) = match net::accept_client(&server) {
            Ok(v) => v,
            Err(_) => continue,
        };

        if net::set_audio_options(&stream, cfg.socket_buffer_size).is_err() {
            tracing::warn!(ip, "failed to tune audio socket options");
        }

        let mut writer = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => continue,
        };

        if protocol::write_header(&mut writer, &cfg).is_err() {
            tracing::warn!(ip, "failed to send header, dropping client");
            continue;
        }

        match clients.admit(stream, ip.clone()) {
            Ok(_) => {
                let count = clients.count();
                tracing::info!(ip, count, "client connected");
                stats.receiver_count.store(count as u32, Ordering::SeqCst);
                sink.update_receiver_count(count as i32);
                sink.update_status(&format!("Streaming to {count} receiver(s)"));
            }
            Err(_) => tracing::warn!(ip, "audio client table full, rejecting"),
        }
    }
    tracing::info!("accept thread stopped");
}

fn stream_loop(app: Arc<AppState>, clients: Arc<ClientTable>, stats: Arc<SessionStats>, sink: Arc<dyn UiSink>, cfg: AudioConfig, capture: CaptureFactory) {
    tracing::info!("stream thread started");

    let mut cap = match capture(&cfg) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to open audio capture");
            sink.update_status("Audio capture failed");
            app.is_streaming.store(false, Ordering::SeqCst);
            return;
        }
    };

    let mut pcm_buf = vec![0u8; cfg.chunk_size as usize];
    stats.reset_clock();

    while app.is_streaming.load(Ordering::SeqCst) {
        let n = match cap.read(&mut pcm_buf) {
            Ok(n) if n > 0 => n,
            _ => {
                if app.is_streaming.load(Ordering::SeqCst) {
                    tracing::warn!("capture read error");
                }
                break;
            }
        };

        let mut active = 0usize;
        let mut evicted = false;
        for (idx, mut stream) in clients.snapshot() {
            if stream.write_all(&pcm_buf[..n]).is_err() {
                clients.remove(idx);
                evicted = true;
            } else {
                active += 1;
            }
        }
        if evicted {
            let count = clients.count();
            stats.receiver_count.store(count as u32, Ordering::SeqCst);
            sink.update_receiver_count(count as i32);
            sink.update_status(&format!("Streaming to {count} receiver(s)"));
        }
        if active == 0 {
            continue;
        }

        if let Some((kbps, total, elapsed)) = stats.record_bytes(n as i64 * active as i64) {
            sink.update_stats(kbps, total, elapsed);
        }
    }

    tracing::info!("stream thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullSink;

    #[test]
    fn stop_before_start_is_a_noop() {
        let app = Arc::new(AppState::new());
        let sink: Arc<dyn UiSink> = Arc::new(NullSink);
        let mut session = Session::new(app, sink);
        session.stop();
        session.stop();
        assert_eq!(session.receiver_count(), 0);
    }
}
