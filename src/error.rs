//! Error taxonomy shared by every service (§7).

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum SoundshareError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connect timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("connect failed: {0}")]
    ConnectFailed(io::Error),

    #[error("bad session header: {0}")]
    BadHeader(String),

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("client slot table is full")]
    CapacityExceeded,

    #[error("failed to open audio device: {0}")]
    AudioOpenFailed(String),

    #[error("peer closed the connection")]
    PeerClosed,
}

pub type Result<T> = std::result::Result<T, SoundshareError>;
