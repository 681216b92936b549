//! End-to-end scenarios over real loopback sockets, using the fake capture
//! and playback backends in place of audio hardware.

use std::io::Read;
use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use soundshare::audio::fakes::{FakeCapture, FakePlayback};
use soundshare::audio::{AudioCapture, AudioPlayback};
use soundshare::config::{AudioConfig, COMPRESSION_FLAC};
use soundshare::protocol::{self, AUDIO_PORT, CHAT_MSG, CHAT_PORT};
use soundshare::sink::{ChannelSink, ChatKind, NullSink, UiEvent, UiSink};
use soundshare::state::SessionStats;
use soundshare::{net, AppState, ReceiverSession, Result, Session};

/// Build a capture factory closure with the exact trait-object return type
/// `Session::with_capture` expects — a bare closure returning `Box<FakeCapture>`
/// doesn't unify with `Box<dyn AudioCapture>` under generic inference.
fn fake_capture(bytes: Vec<u8>) -> impl Fn(&AudioConfig) -> Result<Box<dyn AudioCapture>> + Send + Sync + 'static {
    move |_cfg: &AudioConfig| Ok(Box::new(FakeCapture::new(bytes.clone())) as Box<dyn AudioCapture>)
}

/// Same as [`fake_capture`] but for `ReceiverSession::with_playback`.
fn fake_playback(p: FakePlayback) -> impl Fn(&AudioConfig) -> Result<Box<dyn AudioPlayback>> + Send + Sync + 'static {
    move |_cfg: &AudioConfig| Ok(Box::new(p.clone()) as Box<dyn AudioPlayback>)
}

/// `AUDIO_PORT`/`PING_PORT`/`CHAT_PORT` are fixed, not ephemeral, so any two
/// tests that start a real `Session` would race for the same bind. Serialize
/// them behind one process-wide guard.
static PORT_GUARD: Mutex<()> = Mutex::new(());

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    predicate()
}

/// S1: streamer bound on the fixed audio port hands a receiver a literal
/// 28-byte header, then a second of fake capture reaches it as raw PCM.
#[test]
fn streamer_header_and_throughput_over_loopback() {
    let _guard = PORT_GUARD.lock().unwrap();

    let app = Arc::new(AppState::new());
    let sink: Arc<dyn UiSink> = Arc::new(NullSink);
    // More than the 192000 bytes/sec preset-2 raw rate, so the receiver
    // crosses the threshold before the fake capture runs dry.
    let source = vec![0u8; 256_000];
    let mut session = Session::new(app.clone(), sink).with_capture(fake_capture(source));
    session.start(2).unwrap();

    let mut client = net::connect_with_timeout("127.0.0.1", AUDIO_PORT, 2000).unwrap();
    let mut hdr = [0u8; protocol::HEADER_SIZE];
    protocol::read_exact(&mut client, &mut hdr).unwrap();
    assert_eq!(&hdr[0..4], &[0x53, 0x53, 0x48, 0x44]);
    assert_eq!(&hdr[8..12], &[0x00, 0x00, 0xBB, 0x80]);
    assert_eq!(&hdr[14..16], &[0x00, 0x02]);
    assert_eq!(&hdr[24..26], &[0x00, 0x00]);
    assert_eq!(hdr[26], 0x00);

    let mut total = 0usize;
    let mut buf = [0u8; 4096];
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while total < 192_000 && std::time::Instant::now() < deadline {
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(_) => break,
        }
    }
    assert!(total >= 192_000, "only received {total} bytes");

    session.stop();
}

/// S2: a raw ping exchange gets an echo well under 100ms, and a full ping
/// client/server pair converges on a small, sane smoothed latency.
#[test]
fn ping_roundtrip_and_latency_publication() {
    let _guard = PORT_GUARD.lock().unwrap();

    let app = Arc::new(AppState::new());
    let sink: Arc<dyn UiSink> = Arc::new(NullSink);
    let mut session = Session::new(app.clone(), sink.clone()).with_capture(fake_capture(vec![0u8; 1 << 20]));
    session.start(2).unwrap();

    let local_cfg = AudioConfig::from_preset(2);
    let recv_app = Arc::new(AppState::new());
    recv_app.is_receiving.store(true, Ordering::SeqCst);
    let recv_stats = Arc::new(SessionStats::new());
    let mut ping_client = soundshare::ping::PingClient::start(
        recv_app.clone(),
        recv_stats.clone(),
        sink.clone(),
        "127.0.0.1".to_string(),
        local_cfg,
    );

    let published = wait_until(
        || {
            let v = recv_stats.current_latency_ms.load(Ordering::SeqCst);
            v >= 0 && v <= 50
        },
        Duration::from_secs(5),
    );
    assert!(published, "latency never converged to a sane value: {}", recv_stats.current_latency_ms.load(Ordering::SeqCst));

    recv_app.is_receiving.store(false, Ordering::SeqCst);
    ping_client.stop();
    session.stop();
}

/// S3: three chat clients connect; one broadcasts and the other two (but not
/// the sender) receive it, still carrying the original sender name.
#[test]
fn chat_fan_out_excludes_sender() {
    let _guard = PORT_GUARD.lock().unwrap();

    let app = Arc::new(AppState::new());
    let (sink_impl, events) = ChannelSink::new();
    let sink: Arc<dyn UiSink> = Arc::new(sink_impl);
    let mut session = Session::new(app.clone(), sink).with_capture(fake_capture(vec![0u8; 1 << 20]));
    session.start(2).unwrap();

    let connect = || net::connect_with_timeout("127.0.0.1", CHAT_PORT, 2000).unwrap();
    let mut a = connect();
    wait_for_system_chat_event(&events);
    let mut b = connect();
    wait_for_system_chat_event(&events);
    let mut c = connect();
    wait_for_system_chat_event(&events);

    b.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    c.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    a.set_read_timeout(Some(Duration::from_millis(200))).unwrap();

    protocol::write_chat_msg(&mut a, "A", "hi").unwrap();

    for stream in [&mut b, &mut c] {
        let mut cmd = [0u8; 1];
        stream.read_exact(&mut cmd).unwrap();
        assert_eq!(cmd[0], CHAT_MSG);
        let (sender, msg) = protocol::read_chat_msg(stream).unwrap();
        assert_eq!(sender, "A");
        assert_eq!(msg, "hi");
    }

    let mut stray = [0u8; 1];
    assert!(a.read(&mut stray).is_err() || matches!(a.read(&mut stray), Ok(0)));

    session.stop();
}

fn wait_for_system_chat_event(events: &crossbeam_channel::Receiver<UiEvent>) {
    loop {
        match events.recv_timeout(Duration::from_secs(2)) {
            Ok(UiEvent::Chat { kind: ChatKind::System, .. }) => return,
            Ok(_) => continue,
            Err(_) => panic!("timed out waiting for chat client to be admitted"),
        }
    }
}

/// S4: a zero-length FLAC frame is skipped without being handed to playback,
/// and the next, valid frame is still delivered.
#[test]
fn flac_zero_length_frame_is_skipped() {
    let _guard = PORT_GUARD.lock().unwrap();

    let cfg = AudioConfig::from_header_fields(48000, 2, 240, 16, COMPRESSION_FLAC, false);
    let valid_frame = vec![7u8; 128];

    let listener = TcpListener::bind(("127.0.0.1", AUDIO_PORT)).unwrap();
    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        protocol::write_header(&mut stream, &cfg).unwrap();
        protocol::write_u32_be(&mut stream, 0).unwrap();
        protocol::write_u32_be(&mut stream, valid_frame.len() as u32).unwrap();
        protocol::write_all(&mut stream, &valid_frame).unwrap();
        std::thread::sleep(Duration::from_millis(500));
    });

    let app = Arc::new(AppState::new());
    let sink: Arc<dyn UiSink> = Arc::new(NullSink);
    let playback = FakePlayback::new();
    let mut receiver = ReceiverSession::new(app, sink).with_playback(fake_playback(playback.clone()));
    receiver.start("127.0.0.1".to_string(), 2).unwrap();

    assert!(wait_until(|| !playback.written.lock().unwrap().is_empty(), Duration::from_secs(2)));
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(*playback.written.lock().unwrap(), vec![7u8; 128]);

    receiver.stop();
    server.join().unwrap();
}

/// S5: the 17th connection to a full streamer still receives the session
/// header (written before admission is checked) but is never admitted into
/// the client table, so the connection closes without any further data.
#[test]
fn seventeenth_client_is_rejected_after_its_header() {
    let _guard = PORT_GUARD.lock().unwrap();

    let app = Arc::new(AppState::new());
    let sink: Arc<dyn UiSink> = Arc::new(NullSink);
    let mut session = Session::new(app.clone(), sink).with_capture(fake_capture(vec![0u8; 1 << 20]));
    session.start(2).unwrap();

    // Drain every admitted connection in the background: the streamer's fan-out
    // loop writes PCM to them regardless, and a client that never reads would
    // otherwise let its send buffer fill and stall that loop indefinitely.
    let mut readers = Vec::new();
    for _ in 0..net::MAX_CLIENTS {
        let mut c = net::connect_with_timeout("127.0.0.1", AUDIO_PORT, 2000).unwrap();
        let mut hdr = [0u8; protocol::HEADER_SIZE];
        protocol::read_exact(&mut c, &mut hdr).unwrap();
        readers.push(std::thread::spawn(move || {
            let mut sink = [0u8; 4096];
            while matches!(c.read(&mut sink), Ok(n) if n > 0) {}
        }));
    }

    let mut rejected = net::connect_with_timeout("127.0.0.1", AUDIO_PORT, 2000).unwrap();
    rejected.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let mut hdr = [0u8; protocol::HEADER_SIZE];
    protocol::read_exact(&mut rejected, &mut hdr).expect("17th client should still receive the header");

    let mut buf = [0u8; 4096];
    let result = rejected.read(&mut buf);
    assert!(matches!(result, Ok(0)) || result.is_err(), "rejected client unexpectedly received PCM data: {result:?}");

    session.stop();
    for r in readers {
        let _ = r.join();
    }
}

/// S6: shutdown flips both flags and releases the fixed ports immediately,
/// so a rebind right after `stop()` succeeds.
#[test]
fn stop_releases_ports_for_immediate_rebind() {
    let _guard = PORT_GUARD.lock().unwrap();

    let app = Arc::new(AppState::new());
    let sink: Arc<dyn UiSink> = Arc::new(NullSink);
    let mut session = Session::new(app.clone(), sink.clone()).with_capture(fake_capture(vec![0u8; 1 << 20]));
    session.start(2).unwrap();
    let mut client = net::connect_with_timeout("127.0.0.1", AUDIO_PORT, 1000).unwrap();
    // Drain in the background so the fan-out loop's blocking write never
    // stalls on a full send buffer while nobody reads the other end.
    let reader = std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        while matches!(client.read(&mut buf), Ok(n) if n > 0) {}
    });

    let stopped = std::thread::spawn(move || {
        session.stop();
        session
    });
    let session = wait_thread_within(stopped, Duration::from_secs(2)).expect("stop() did not finish within 2 seconds");
    assert!(!app.is_streaming.load(Ordering::SeqCst));
    let _ = reader.join();

    // The port must be free immediately, not eventually.
    let rebound = net::create_server(AUDIO_PORT, 4);
    assert!(rebound.is_ok(), "audio port was not released promptly: {rebound:?}");
    drop(rebound);
    drop(session);
}

fn wait_thread_within<T: Send + 'static>(handle: std::thread::JoinHandle<T>, timeout: Duration) -> Option<T> {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(handle.join());
    });
    rx.recv_timeout(timeout).ok().and_then(|r| r.ok())
}
