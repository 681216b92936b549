//! RTT/latency probe, both sides (§4.5, original `ping.c`).
//!
//! The server answers requests inline per connection (no slot table — one
//! thread per connected pinger, same as the original). The client sends a
//! request, waits for the echo, folds in the local buffer latency, and
//! smooths the result with an integer EMA before reporting it back.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::AudioConfig;
use crate::error::Result;
use crate::net;
use crate::protocol::{LATENCY_REPORT, PING_PORT, PING_REQUEST, PING_RESPONSE};
use crate::sink::UiSink;
use crate::state::{now_ns, AppState, SessionStats};

/// Streamer-side ping responder.
pub struct PingServer {
    server: Option<TcpListener>,
    thread: Option<JoinHandle<()>>,
}

impl PingServer {
    pub fn start(app: Arc<AppState>, stats: Arc<SessionStats>, sink: Arc<dyn UiSink>) -> Result<Self> {
        let server = net::create_server(PING_PORT, 4)?;
        let accept_fd = server.try_clone()?;
        let thread = thread::spawn(move || {
            tracing::info!(port = PING_PORT, "ping server started");
            while app.is_streaming.load(Ordering::SeqCst) {
                if net::poll_acceptable(&accept_fd, 1000) <= 0 {
                    continue;
                }
                let (stream, ip) = match net::accept_client(&accept_fd) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                tracing::debug!(ip, "ping client connected");
                handle_ping_client(&app, &stats, &sink, stream);
                tracing::debug!(ip, "ping client disconnected");
            }
            tracing::info!("ping server stopped");
        });
        Ok(Self { server: Some(server), thread: Some(thread) })
    }

    pub fn stop(&mut self) {
        self.server.take();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn handle_ping_client(app: &Arc<AppState>, stats: &Arc<SessionStats>, sink: &Arc<dyn UiSink>, mut stream: std::net::TcpStream) {
    let mut cmd = [0u8; 1];
    while app.is_streaming.load(Ordering::SeqCst) {
        let ready = net::poll_readable(&stream, 1000);
        if ready <= 0 {
            if ready < 0 {
                break;
            }
            continue;
        }
        if stream.read(&mut cmd).unwrap_or(0) == 0 {
            break;
        }
        match cmd[0] {
            PING_REQUEST => {
                if stream.write_all(&[PING_RESPONSE]).is_err() {
                    break;
                }
            }
            LATENCY_REPORT => {
                let mut buf = [0u8; 8];
                if stream.read_exact(&mut buf).is_err() {
                    break;
                }
                let ms = i64::from_be_bytes(buf);
                stats.current_latency_ms.store(ms, Ordering::SeqCst);
                sink.update_latency(ms);
            }
            _ => break,
        }
    }
}

/// Receiver-side ping prober.
pub struct PingClient {
    thread: Option<JoinHandle<()>>,
}

impl PingClient {
    pub fn start(app: Arc<AppState>, stats: Arc<SessionStats>, sink: Arc<dyn UiSink>, server_ip: String, local_cfg: AudioConfig) -> Self {
        let thread = thread::spawn(move || ping_client_loop(app, stats, sink, server_ip, local_cfg));
        Self { thread: Some(thread) }
    }

    pub fn stop(&mut self) {
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn ping_client_loop(app: Arc<AppState>, stats: Arc<SessionStats>, sink: Arc<dyn UiSink>, server_ip: String, local_cfg: AudioConfig) {
    // Small delay so the server's ping listener is already up.
    thread::sleep(Duration::from_millis(500));

    let mut stream = match net::connect_with_timeout(&server_ip, PING_PORT, 3000) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "ping: could not connect");
            return;
        }
    };

    let buf_ms = local_cfg.buffer_latency_ms() as i64;
    let mut smoothed: i64 = -1;

    while app.is_receiving.load(Ordering::SeqCst) {
        let start_ns = now_ns();
        if stream.write_all(&[PING_REQUEST]).is_err() {
            break;
        }

        let ready = net::poll_readable(&stream, 2000);
        if ready <= 0 {
            stats.current_latency_ms.store(999, Ordering::SeqCst);
            sink.update_latency(999);
            if ready < 0 {
                break;
            }
            thread::sleep(Duration::from_millis(500));
            continue;
        }

        let mut resp = [0u8; 1];
        if stream.read(&mut resp).unwrap_or(0) != 1 {
            break;
        }

        if resp[0] == PING_RESPONSE {
            let rtt_ms = (now_ns() - start_ns) / 1_000_000;
            let total = rtt_ms / 2 + buf_ms;

            smoothed = if smoothed < 0 { total } else { (smoothed * 7 + total * 3) / 10 };

            stats.current_latency_ms.store(smoothed, Ordering::SeqCst);
            sink.update_latency(smoothed);

            let mut report = [0u8; 9];
            report[0] = LATENCY_REPORT;
            report[1..9].copy_from_slice(&smoothed.to_be_bytes());
            let _ = stream.write_all(&report); // best-effort, matches original
        }

        thread::sleep(Duration::from_millis(500));
    }

    tracing::debug!("ping client stopped");
}
