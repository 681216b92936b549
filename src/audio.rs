//! Capture/playback adapters: thin contracts over the platform audio
//! subsystem (§6 "Audio adapter interfaces", original `audio.c`/`audio.h`).
//!
//! The platform's capture/playback devices are themselves out of scope
//! (spec.md §1) — `cpal` here plays the role of the external collaborator
//! named only by the narrow `AudioCapture`/`AudioPlayback` interfaces below.
//! cpal is callback-driven; the core wants blocking `read`/`write` of whole
//! chunks, so each adapter bridges one cpal stream through a bounded
//! `crossbeam_channel`, the same plumbing style the teacher used for its own
//! buffer pool (`buffers.rs`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use crossbeam_channel::{Receiver, Sender};

use crate::config::AudioConfig;
use crate::error::{Result, SoundshareError};

/// Blocking capture contract (§6): `read` fills `buf` with exactly
/// `buf.len()` bytes of the negotiated wire format, or returns an error.
pub trait AudioCapture: Send {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// Blocking playback contract (§6): `write` accepts one chunk/frame of the
/// negotiated wire format.
pub trait AudioPlayback: Send {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

/// Normalize one native cpal sample to `[-1.0, 1.0]`.
fn normalize(sample_format: SampleFormat, raw: &[u8], idx: usize) -> f32 {
    match sample_format {
        SampleFormat::F32 => {
            let off = idx * 4;
            f32::from_ne_bytes(raw[off..off + 4].try_into().unwrap())
        }
        SampleFormat::I16 => {
            let off = idx * 2;
            let v = i16::from_ne_bytes(raw[off..off + 2].try_into().unwrap());
            v as f32 / 32768.0
        }
        SampleFormat::U16 => {
            let off = idx * 2;
            let v = u16::from_ne_bytes(raw[off..off + 2].try_into().unwrap());
            (v as f32 - 32768.0) / 32768.0
        }
        _ => 0.0,
    }
}

/// Encode one normalized sample into the wire format described by `cfg`.
fn encode_sample(out: &mut Vec<u8>, v: f32, cfg: &AudioConfig) {
    let v = v.clamp(-1.0, 1.0);
    if cfg.is_float {
        out.extend_from_slice(&v.to_le_bytes());
    } else if cfg.bytes_per_sample == 4 {
        let scale = if cfg.bits_per_sample >= 32 { i32::MAX as f32 } else { 8_388_607.0 };
        out.extend_from_slice(&((v * scale) as i32).to_le_bytes());
    } else {
        out.extend_from_slice(&((v * 32767.0) as i16).to_le_bytes());
    }
}

/// Decode one wire-format sample (described by `cfg`) back to `[-1.0, 1.0]`.
fn decode_sample(bytes: &[u8], cfg: &AudioConfig) -> f32 {
    if cfg.is_float {
        f32::from_le_bytes(bytes[..4].try_into().unwrap())
    } else if cfg.bytes_per_sample == 4 {
        let raw = i32::from_le_bytes(bytes[..4].try_into().unwrap());
        let scale = if cfg.bits_per_sample >= 32 { i32::MAX as f32 } else { 8_388_607.0 };
        raw as f32 / scale
    } else {
        let raw = i16::from_le_bytes(bytes[..2].try_into().unwrap());
        raw as f32 / 32768.0
    }
}

fn default_host_device(input: bool) -> Result<Device> {
    let host = cpal::default_host();
    let dev = if input { host.default_input_device() } else { host.default_output_device() };
    dev.ok_or_else(|| SoundshareError::AudioOpenFailed(format!("no default {} device", if input { "input" } else { "output" })))
}

/// cpal-backed capture: converts the device's native sample stream into
/// `cfg`'s wire format and delivers fixed-size chunks to `read`.
pub struct CpalCapture {
    _stream: cpal::Stream,
    rx: Receiver<Vec<u8>>,
    leftover: Vec<u8>,
    alive: Arc<AtomicBool>,
}

impl CpalCapture {
    pub fn open(cfg: &AudioConfig) -> Result<Self> {
        let dev = default_host_device(true)?;
        let supported = dev
            .default_input_config()
            .map_err(|e| SoundshareError::AudioOpenFailed(e.to_string()))?;
        let sample_format = supported.sample_format();
        let stream_config: StreamConfig = supported.into();
        let device_channels = stream_config.channels.max(1) as usize;

        let (tx, rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = crossbeam_channel::bounded(64);
        let alive = Arc::new(AtomicBool::new(true));
        let alive_cb = alive.clone();
        let cfg = *cfg;
        let target_channels = cfg.channels as usize;

        let bytes_per_native_sample = match sample_format {
            SampleFormat::F32 => 4,
            SampleFormat::I16 | SampleFormat::U16 => 2,
            _ => 4,
        };

        let on_data = move |raw: &[u8]| {
            if !alive_cb.load(Ordering::Relaxed) {
                return;
            }
            let n_samples = raw.len() / bytes_per_native_sample;
            let n_frames = n_samples / device_channels;
            let mut out = Vec::with_capacity(n_frames * target_channels * cfg.bytes_per_sample as usize);
            for frame in 0..n_frames {
                // Downmix/upmix is not attempted (Non-goal: adaptive format
                // conversion beyond the simple mono average used here).
                let mut acc = 0.0f32;
                for ch in 0..device_channels {
                    acc += normalize(sample_format, raw, frame * device_channels + ch);
                }
                let mono = acc / device_channels as f32;
                for _ in 0..target_channels {
                    encode_sample(&mut out, mono, &cfg);
                }
            }
            let _ = tx.try_send(out);
        };

        let err_cb = |e| tracing::error!(error = %e, "capture stream error");

        let stream = build_input_stream_for_format(&dev, &stream_config, sample_format, on_data, err_cb)?;
        stream.play().map_err(|e| SoundshareError::AudioOpenFailed(e.to_string()))?;

        Ok(Self { _stream: stream, rx, leftover: Vec::new(), alive })
    }
}

fn build_input_stream_for_format(
    dev: &Device,
    config: &StreamConfig,
    format: SampleFormat,
    mut on_data: impl FnMut(&[u8]) + Send + 'static,
    err_cb: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream> {
    let stream = match format {
        SampleFormat::F32 => dev.build_input_stream(
            config,
            move |data: &[f32], _| {
                let raw = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, data.len() * 4) };
                on_data(raw);
            },
            err_cb,
            None,
        ),
        SampleFormat::I16 => dev.build_input_stream(
            config,
            move |data: &[i16], _| {
                let raw = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, data.len() * 2) };
                on_data(raw);
            },
            err_cb,
            None,
        ),
        SampleFormat::U16 => dev.build_input_stream(
            config,
            move |data: &[u16], _| {
                let raw = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, data.len() * 2) };
                on_data(raw);
            },
            err_cb,
            None,
        ),
        other => return Err(SoundshareError::AudioOpenFailed(format!("unsupported capture sample format {other:?}"))),
    };
    stream.map_err(|e| SoundshareError::AudioOpenFailed(e.to_string()))
}

impl AudioCapture for CpalCapture {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.leftover.len() < buf.len() {
            if !self.alive.load(Ordering::Relaxed) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "capture closed"));
            }
            match self.rx.recv_timeout(Duration::from_millis(200)) {
                Ok(mut chunk) => self.leftover.append(&mut chunk),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "capture stream ended"));
                }
            }
        }
        buf.copy_from_slice(&self.leftover[..buf.len()]);
        self.leftover.drain(..buf.len());
        Ok(buf.len())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
    }
}

/// cpal-backed playback: decodes `cfg`'s wire format into the device's
/// native sample stream, with a small jitter prebuffer before playback
/// starts (mirrors the teacher's 20ms prebuffer in `client.rs`).
pub struct CpalPlayback {
    stream: cpal::Stream,
    tx: Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
}

impl CpalPlayback {
    pub fn open(cfg: &AudioConfig) -> Result<Self> {
        let dev = default_host_device(false)?;
        let supported = dev
            .default_output_config()
            .map_err(|e| SoundshareError::AudioOpenFailed(e.to_string()))?;
        let sample_format = supported.sample_format();
        let stream_config: StreamConfig = supported.into();
        let device_channels = stream_config.channels.max(1) as usize;

        let (tx, rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = crossbeam_channel::bounded(64);
        let running = Arc::new(AtomicBool::new(true));
        let running_cb = running.clone();
        let cfg = *cfg;
        let mut leftover: Vec<f32> = Vec::new();
        let prebuffer_frames = (cfg.sample_rate as f32 * 0.02) as usize; // 20ms
        let mut started = false;

        let on_output = move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
            if !running_cb.load(Ordering::Relaxed) {
                for s in out.iter_mut() {
                    *s = 0.0;
                }
                return;
            }
            let needed_frames = out.len() / device_channels;
            while leftover.len() < needed_frames.max(prebuffer_frames) {
                match rx.try_recv() {
                    Ok(bytes) => decode_into(&bytes, &cfg, &mut leftover),
                    Err(_) => break,
                }
            }
            if !started {
                if leftover.len() >= prebuffer_frames {
                    started = true;
                } else {
                    for s in out.iter_mut() {
                        *s = 0.0;
                    }
                    return;
                }
            }
            let mut produced = 0;
            for frame in 0..needed_frames {
                let sample = leftover.get(frame).copied().unwrap_or(0.0);
                for ch in 0..device_channels {
                    out[produced + ch] = sample;
                }
                produced += device_channels;
            }
            let consumed = needed_frames.min(leftover.len());
            leftover.drain(..consumed);
        };

        let err_cb = |e| tracing::error!(error = %e, "playback stream error");
        let stream = dev
            .build_output_stream(&stream_config, on_output, err_cb, None)
            .map_err(|e| SoundshareError::AudioOpenFailed(e.to_string()))?;
        stream.play().map_err(|e| SoundshareError::AudioOpenFailed(e.to_string()))?;

        Ok(Self { stream, tx, running })
    }
}

fn decode_into(bytes: &[u8], cfg: &AudioConfig, out: &mut Vec<f32>) {
    let step = cfg.bytes_per_sample as usize * cfg.channels as usize;
    if step == 0 {
        return;
    }
    for frame in bytes.chunks_exact(step) {
        let mut acc = 0.0f32;
        for ch in 0..cfg.channels as usize {
            let off = ch * cfg.bytes_per_sample as usize;
            acc += decode_sample(&frame[off..], cfg);
        }
        out.push(acc / cfg.channels as f32);
    }
}

impl AudioPlayback for CpalPlayback {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "playback stream closed"))
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        // Give the callback a moment to drain queued frames before the
        // stream is torn down (§6: playback `close` "drains before releasing").
        std::thread::sleep(Duration::from_millis(100));
        self.running.store(false, Ordering::Relaxed);
        let _ = self.stream.pause();
    }
}

/// Open the default capture device for `cfg` (§6 `Capture::open`).
pub fn open_capture(cfg: &AudioConfig) -> Result<Box<dyn AudioCapture>> {
    Ok(Box::new(CpalCapture::open(cfg)?))
}

/// Open the default playback device for `cfg` (§6 `Playback::open`).
pub fn open_playback(cfg: &AudioConfig) -> Result<Box<dyn AudioPlayback>> {
    Ok(Box::new(CpalPlayback::open(cfg)?))
}

/// Best-effort device name (fallback to "<unknown>"), kept for diagnostics.
pub fn device_name(dev: &Device) -> String {
    dev.name().unwrap_or_else(|_| "<unknown>".into())
}

/// In-memory capture/playback pair standing in for real hardware in tests
/// (mirrors the teacher's own separation of buffer plumbing from cpal glue
/// in `buffers.rs`).
pub mod fakes {
    use super::{AudioCapture, AudioPlayback};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Yields bytes from a fixed source buffer, then errors once exhausted.
    #[derive(Clone)]
    pub struct FakeCapture {
        data: Arc<Mutex<VecDeque<u8>>>,
    }

    impl FakeCapture {
        pub fn new(source: Vec<u8>) -> Self {
            Self { data: Arc::new(Mutex::new(source.into())) }
        }
    }

    impl AudioCapture for FakeCapture {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut data = self.data.lock().unwrap();
            if data.is_empty() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "fake capture exhausted"));
            }
            let n = buf.len().min(data.len());
            for slot in buf.iter_mut().take(n) {
                *slot = data.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    /// Appends every write to a shared buffer the test can inspect.
    #[derive(Clone, Default)]
    pub struct FakePlayback {
        pub written: Arc<Mutex<Vec<u8>>>,
    }

    impl FakePlayback {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl AudioPlayback for FakePlayback {
        fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.written.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PRESET;

    #[test]
    fn encode_decode_roundtrip_s16() {
        let cfg = AudioConfig::from_preset(DEFAULT_PRESET);
        let mut buf = Vec::new();
        encode_sample(&mut buf, 0.5, &cfg);
        let back = decode_sample(&buf, &cfg);
        assert!((back - 0.5).abs() < 0.001);
    }

    #[test]
    fn encode_decode_roundtrip_float() {
        let mut cfg = AudioConfig::from_preset(DEFAULT_PRESET);
        cfg.is_float = true;
        cfg.bytes_per_sample = 4;
        let mut buf = Vec::new();
        encode_sample(&mut buf, -0.75, &cfg);
        let back = decode_sample(&buf, &cfg);
        assert!((back - (-0.75)).abs() < 1e-6);
    }
}
