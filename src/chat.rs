//! Bidirectional text chat, both sides (§4.6, original `chat.c`).
//!
//! Shares the same fixed 16-slot admission model as the audio fan-out
//! (`net::ClientTable`), but writes are done under the table's lock rather
//! than snapshot-then-release: chat traffic is low enough that the
//! contention the original accepted there doesn't matter here either.

use std::io::Read;
use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::net::{self, ClientTable};
use crate::protocol::{self, CHAT_MSG, CHAT_PORT};
use crate::sink::{ChatKind, UiSink};
use crate::state::AppState;

/// Streamer-side chat server: one admission table, one reader thread per
/// connected client, broadcast-except-sender on receipt.
pub struct ChatServer {
    server: Option<TcpListener>,
    clients: Arc<ClientTable>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ChatServer {
    pub fn start(app: Arc<AppState>, sink: Arc<dyn UiSink>) -> Result<Self> {
        let server = net::create_server(CHAT_PORT, 8)?;
        let accept_fd = server.try_clone()?;
        let clients = Arc::new(ClientTable::new());
        let clients_accept = clients.clone();

        let thread = thread::spawn(move || {
            tracing::info!(port = CHAT_PORT, "chat server started");
            while app.is_streaming.load(Ordering::SeqCst) {
                if net::poll_acceptable(&accept_fd, 1000) <= 0 {
                    continue;
                }
                let (stream, ip) = match net::accept_client(&accept_fd) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                let reader = match stream.try_clone() {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                let idx = match clients_accept.admit(stream, ip.clone()) {
                    Ok(i) => i,
                    Err(_) => {
                        tracing::warn!(ip, "chat: max clients reached, rejecting");
                        continue;
                    }
                };

                tracing::info!(ip, idx, "chat client connected");
                sink.chat_message("", &ip, ChatKind::System);

                let app2 = app.clone();
                let clients2 = clients_accept.clone();
                let sink2 = sink.clone();
                thread::spawn(move || chat_client_handler(app2, clients2, sink2, idx, reader));
            }
            tracing::info!("chat server stopped");
        });

        Ok(Self { server: Some(server), clients, accept_thread: Some(thread) })
    }

    /// Broadcast a host-originated message to every connected chat client.
    /// Callers are responsible for publishing to the local sink first (the
    /// original shows it locally from the GUI handler before this call).
    pub fn broadcast(&self, sender: &str, message: &str) {
        self.clients.broadcast_locked(|w| {
            let _ = protocol::write_chat_msg(w, sender, message);
        });
    }

    pub fn client_count(&self) -> usize {
        self.clients.count()
    }

    pub fn stop(&mut self) {
        self.server.take();
        self.clients.close_all();
        if let Some(t) = self.accept_thread.take() {
            let _ = t.join();
        }
    }
}

fn chat_client_handler(app: Arc<AppState>, clients: Arc<ClientTable>, sink: Arc<dyn UiSink>, idx: usize, mut reader: std::net::TcpStream) {
    let mut cmd = [0u8; 1];
    while app.is_streaming.load(Ordering::SeqCst) {
        let ready = net::poll_readable(&reader, 1000);
        if ready <= 0 {
            if ready < 0 {
                break;
            }
            continue;
        }
        if reader.read(&mut cmd).unwrap_or(0) == 0 {
            break;
        }
        if cmd[0] == CHAT_MSG {
            match protocol::read_chat_msg(&mut reader) {
                Ok((sender, message)) => {
                    sink.chat_message(&sender, &message, ChatKind::Received);
                    clients.broadcast_locked_except(idx, |w| {
                        let _ = protocol::write_chat_msg(w, &sender, &message);
                    });
                }
                Err(_) => break,
            }
        }
    }
    clients.remove(idx);
}

/// Receiver-side chat client: connects after a short delay, reads incoming
/// broadcasts, and serializes outgoing sends behind a write lock so a
/// concurrent `send` and teardown never race on the same fd.
pub struct ChatClient {
    stream: Arc<Mutex<Option<std::net::TcpStream>>>,
    thread: Option<JoinHandle<()>>,
}

impl ChatClient {
    pub fn start(app: Arc<AppState>, sink: Arc<dyn UiSink>, server_ip: String) -> Self {
        let stream_slot: Arc<Mutex<Option<std::net::TcpStream>>> = Arc::new(Mutex::new(None));
        let stream_slot2 = stream_slot.clone();

        let thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));

            let stream = match net::connect_with_timeout(&server_ip, CHAT_PORT, 5000) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "chat client: cannot connect");
                    return;
                }
            };
            let mut reader = match stream.try_clone() {
                Ok(s) => s,
                Err(_) => return,
            };
            *stream_slot2.lock() = Some(stream);

            sink.chat_message("", "Connected to chat", ChatKind::System);

            let mut cmd = [0u8; 1];
            while app.is_receiving.load(Ordering::SeqCst) {
                let ready = net::poll_readable(&reader, 1000);
                if ready <= 0 {
                    if ready < 0 {
                        break;
                    }
                    continue;
                }
                if reader.read(&mut cmd).unwrap_or(0) == 0 {
                    break;
                }
                if cmd[0] == CHAT_MSG {
                    match protocol::read_chat_msg(&mut reader) {
                        Ok((sender, message)) => sink.chat_message(&sender, &message, ChatKind::Received),
                        Err(_) => break,
                    }
                }
            }

            stream_slot2.lock().take();
            sink.chat_message("", "Chat disconnected", ChatKind::System);
            tracing::debug!("chat client stopped");
        });

        Self { stream: stream_slot, thread: Some(thread) }
    }

    /// Send a message, silently dropping it if not yet connected (best-effort,
    /// matching the original's `chat_client_send`).
    pub fn send(&self, sender: &str, message: &str) {
        if let Some(stream) = self.stream.lock().as_mut() {
            let _ = protocol::write_chat_msg(stream, sender, message);
        }
    }

    pub fn stop(&mut self) {
        self.stream.lock().take();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    #[test]
    fn chat_frame_written_and_read_back_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            protocol::write_chat_msg(&mut stream, "alice", "hi there").unwrap();
        });

        let mut client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut cmd = [0u8; 1];
        client.read_exact(&mut cmd).unwrap();
        assert_eq!(cmd[0], CHAT_MSG);
        let (sender, msg) = protocol::read_chat_msg(&mut client).unwrap();
        assert_eq!(sender, "alice");
        assert_eq!(msg, "hi there");

        server.join().unwrap();
    }

    #[test]
    fn client_table_broadcast_except_skips_sender() {
        let a_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let a_port = a_listener.local_addr().unwrap().port();
        let table = Arc::new(ClientTable::new());

        let acceptor = thread::spawn(move || a_listener.accept().unwrap().0);
        let sender_side = std::net::TcpStream::connect(("127.0.0.1", a_port)).unwrap();
        let mut sender_accepted = acceptor.join().unwrap();
        let sender_idx = table.admit(sender_side, "127.0.0.1".into()).unwrap();

        table.broadcast_locked_except(sender_idx, |_| panic!("should not write to the sender"));
        let mut buf = [0u8; 1];
        sender_accepted.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        assert!(sender_accepted.read(&mut buf).is_err());
    }
}
