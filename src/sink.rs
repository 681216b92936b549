//! Abstract UI sink (§6, "external collaborator"): a thread-safe event
//! receiver the core publishes status/statistics/chat to. No GUI lives in
//! this crate — only the trait boundary and two trivial implementations for
//! tests and headless operation.

/// Classification of a chat delivery, per §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Sent,
    Received,
    System,
}

/// Thread-safe sink for session status/statistics/chat events. All methods
/// may be called from any service thread concurrently; implementations are
/// responsible for marshalling to their own display thread. Errors in the
/// sink are swallowed by the core (§7) — implementations should not panic.
pub trait UiSink: Send + Sync {
    fn update_status(&self, text: &str);
    fn update_stats(&self, kbps: i64, total_bytes: i64, elapsed_ms: i64);
    fn update_latency(&self, ms: i64);
    fn update_receiver_count(&self, n: i32);
    fn update_format_info(&self, sample_rate: &str, format: &str);
    fn show_streaming(&self, format_info: &str);
    fn show_receiving(&self, server_ip: &str);
    fn reset(&self);
    fn chat_message(&self, sender: &str, text: &str, kind: ChatKind);
}

/// Discards every event. Useful as a default when no UI is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl UiSink for NullSink {
    fn update_status(&self, _text: &str) {}
    fn update_stats(&self, _kbps: i64, _total_bytes: i64, _elapsed_ms: i64) {}
    fn update_latency(&self, _ms: i64) {}
    fn update_receiver_count(&self, _n: i32) {}
    fn update_format_info(&self, _sample_rate: &str, _format: &str) {}
    fn show_streaming(&self, _format_info: &str) {}
    fn show_receiving(&self, _server_ip: &str) {}
    fn reset(&self) {}
    fn chat_message(&self, _sender: &str, _text: &str, _kind: ChatKind) {}
}

/// One flattened event, for sinks that want to observe every call as data
/// (tests, or a future GUI adapter draining from its own thread).
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Status(String),
    Stats { kbps: i64, total_bytes: i64, elapsed_ms: i64 },
    Latency(i64),
    ReceiverCount(i32),
    FormatInfo { sample_rate: String, format: String },
    ShowStreaming(String),
    ShowReceiving(String),
    Reset,
    Chat { sender: String, text: String, kind: ChatKind },
}

/// Forwards every call as a [`UiEvent`] over an unbounded `crossbeam_channel`.
pub struct ChannelSink {
    tx: crossbeam_channel::Sender<UiEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, crossbeam_channel::Receiver<UiEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }
}

impl UiSink for ChannelSink {
    fn update_status(&self, text: &str) {
        self.send(UiEvent::Status(text.to_string()));
    }
    fn update_stats(&self, kbps: i64, total_bytes: i64, elapsed_ms: i64) {
        self.send(UiEvent::Stats { kbps, total_bytes, elapsed_ms });
    }
    fn update_latency(&self, ms: i64) {
        self.send(UiEvent::Latency(ms));
    }
    fn update_receiver_count(&self, n: i32) {
        self.send(UiEvent::ReceiverCount(n));
    }
    fn update_format_info(&self, sample_rate: &str, format: &str) {
        self.send(UiEvent::FormatInfo { sample_rate: sample_rate.to_string(), format: format.to_string() });
    }
    fn show_streaming(&self, format_info: &str) {
        self.send(UiEvent::ShowStreaming(format_info.to_string()));
    }
    fn show_receiving(&self, server_ip: &str) {
        self.send(UiEvent::ShowReceiving(server_ip.to_string()));
    }
    fn reset(&self) {
        self.send(UiEvent::Reset);
    }
    fn chat_message(&self, sender: &str, text: &str, kind: ChatKind) {
        self.send(UiEvent::Chat { sender: sender.to_string(), text: text.to_string(), kind });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn channel_sink_forwards_events() {
        let (sink, rx) = ChannelSink::new();
        sink.update_status("hello");
        sink.update_latency(42);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), UiEvent::Status("hello".into()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), UiEvent::Latency(42));
    }

    #[test]
    fn null_sink_never_panics() {
        let sink = NullSink;
        sink.update_status("x");
        sink.chat_message("a", "b", ChatKind::System);
        sink.reset();
    }
}
