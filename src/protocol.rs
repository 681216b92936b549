//! Wire codec: big-endian framing, session header, chat and ping frames (§4.1).
//!
//! Grounded in the original `protocol.c`/`protocol.h`.

use std::io::{self, ErrorKind, Read, Write};

use crate::config::{valid_sample_rate, AudioConfig, COMPRESSION_FLAC, COMPRESSION_PCM};
use crate::error::{Result, SoundshareError};

pub const HEADER_MAGIC: u32 = 0x5353_4844; // "SSHD"
pub const HEADER_VERSION: u32 = 2;
pub const HEADER_SIZE: usize = 28;

pub const AUDIO_PORT: u16 = 5000;
pub const PING_PORT: u16 = 5001;
pub const CHAT_PORT: u16 = 5002;

pub const PING_REQUEST: u8 = 0x01;
pub const PING_RESPONSE: u8 = 0x02;
pub const LATENCY_REPORT: u8 = 0x03;
pub const CHAT_MSG: u8 = 0x10;

pub const CHAT_MAX_SENDER: usize = 256;
pub const CHAT_MAX_MSG: usize = 4096;

/// Read `buf.len()` bytes, retrying on `Interrupted`, failing on EOF-before-full.
pub fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => return Err(SoundshareError::PeerClosed),
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SoundshareError::Io(e)),
        }
    }
    Ok(())
}

/// Write all of `buf`, retrying on `Interrupted`.
pub fn write_all(w: &mut impl Write, buf: &[u8]) -> Result<()> {
    let mut total = 0;
    while total < buf.len() {
        match w.write(&buf[total..]) {
            Ok(0) => return Err(SoundshareError::Io(io::Error::new(ErrorKind::WriteZero, "write returned 0"))),
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SoundshareError::Io(e)),
        }
    }
    Ok(())
}

pub fn write_u32_be(w: &mut impl Write, v: u32) -> Result<()> {
    write_all(w, &v.to_be_bytes())
}

pub fn write_u16_be(w: &mut impl Write, v: u16) -> Result<()> {
    write_all(w, &v.to_be_bytes())
}

pub fn read_u32_be(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub fn read_u16_be(r: &mut impl Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(r, &mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

/// Write the 28-byte session header for `cfg`.
pub fn write_header(w: &mut impl Write, cfg: &AudioConfig) -> Result<()> {
    let mut hdr = [0u8; HEADER_SIZE];
    hdr[0..4].copy_from_slice(&HEADER_MAGIC.to_be_bytes());
    hdr[4..8].copy_from_slice(&HEADER_VERSION.to_be_bytes());
    hdr[8..12].copy_from_slice(&cfg.sample_rate.to_be_bytes());
    hdr[12..14].copy_from_slice(&cfg.bits_per_sample.to_be_bytes());
    hdr[14..16].copy_from_slice(&cfg.channels.to_be_bytes());
    hdr[16..20].copy_from_slice(&cfg.frames_per_buffer.to_be_bytes());
    hdr[20..24].copy_from_slice(&cfg.chunk_size.to_be_bytes());
    hdr[24..26].copy_from_slice(&cfg.compression_type.to_be_bytes());
    hdr[26] = if cfg.is_float { 1 } else { 0 };
    hdr[27] = 0;
    write_all(w, &hdr)
}

/// Read and validate a session header, returning the negotiated `AudioConfig`.
pub fn read_header(r: &mut impl Read) -> Result<AudioConfig> {
    let mut hdr = [0u8; HEADER_SIZE];
    read_exact(r, &mut hdr)?;

    let magic = u32::from_be_bytes(hdr[0..4].try_into().unwrap());
    let version = u32::from_be_bytes(hdr[4..8].try_into().unwrap());
    let sample_rate = u32::from_be_bytes(hdr[8..12].try_into().unwrap());
    let bits_per_sample = u16::from_be_bytes(hdr[12..14].try_into().unwrap());
    let channels = u16::from_be_bytes(hdr[14..16].try_into().unwrap());
    let frames_per_buffer = u32::from_be_bytes(hdr[16..20].try_into().unwrap());
    let compression_type = u16::from_be_bytes(hdr[24..26].try_into().unwrap());
    let is_float = hdr[26] != 0;

    if magic != HEADER_MAGIC {
        return Err(SoundshareError::BadHeader(format!("bad magic: {magic:#010x}")));
    }
    // Reject future formats we don't understand and past formats with no
    // documented compatibility shim; accept only the exact version we emit.
    if version > HEADER_VERSION {
        return Err(SoundshareError::BadHeader(format!("unsupported version: {version} > {HEADER_VERSION}")));
    }
    if version < HEADER_VERSION {
        return Err(SoundshareError::BadHeader(format!("unsupported version: {version} < {HEADER_VERSION}")));
    }
    if !valid_sample_rate(sample_rate) {
        return Err(SoundshareError::BadHeader(format!("invalid sample rate: {sample_rate}")));
    }
    if bits_per_sample != 16 && bits_per_sample != 24 && bits_per_sample != 32 {
        return Err(SoundshareError::BadHeader(format!("invalid bits per sample: {bits_per_sample}")));
    }
    if channels != 1 && channels != 2 {
        return Err(SoundshareError::BadHeader(format!("invalid channels: {channels}")));
    }
    if compression_type != COMPRESSION_PCM && compression_type != COMPRESSION_FLAC {
        return Err(SoundshareError::BadHeader(format!("invalid compression type: {compression_type}")));
    }

    Ok(AudioConfig::from_header_fields(
        sample_rate,
        channels,
        frames_per_buffer,
        bits_per_sample,
        compression_type,
        is_float,
    ))
}

/// Write a chat frame: `[1]cmd | [2]sender_len BE | sender | [2]msg_len BE | msg`.
pub fn write_chat_msg(w: &mut impl Write, sender: &str, message: &str) -> Result<()> {
    let sender_bytes = sender.as_bytes();
    let msg_bytes = message.as_bytes();
    debug_assert!(sender_bytes.len() <= CHAT_MAX_SENDER);
    debug_assert!(msg_bytes.len() <= CHAT_MAX_MSG);

    write_all(w, &[CHAT_MSG])?;
    write_u16_be(w, sender_bytes.len() as u16)?;
    write_all(w, sender_bytes)?;
    write_u16_be(w, msg_bytes.len() as u16)?;
    write_all(w, msg_bytes)?;
    Ok(())
}

/// Read the body of a chat frame (command byte already consumed by the caller).
pub fn read_chat_msg(r: &mut impl Read) -> Result<(String, String)> {
    let slen = read_u16_be(r)? as usize;
    if slen > CHAT_MAX_SENDER {
        return Err(SoundshareError::BadHeader(format!("chat sender too long: {slen}")));
    }
    let mut sender = vec![0u8; slen];
    read_exact(r, &mut sender)?;

    let mlen = read_u16_be(r)? as usize;
    if mlen > CHAT_MAX_MSG {
        return Err(SoundshareError::BadHeader(format!("chat message too long: {mlen}")));
    }
    let mut message = vec![0u8; mlen];
    read_exact(r, &mut message)?;

    Ok((
        String::from_utf8_lossy(&sender).into_owned(),
        String::from_utf8_lossy(&message).into_owned(),
    ))
}
