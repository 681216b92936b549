//! Audio configuration: preset table + derived fields (§3, original `config.c`).

pub const NUM_PRESETS: usize = 7;
pub const DEFAULT_PRESET: usize = 2;

pub const COMPRESSION_PCM: u16 = 0;
pub const COMPRESSION_FLAC: u16 = 1;

/// Raw preset data, mirroring the original `PRESETS` table.
#[derive(Debug, Clone, Copy)]
pub struct PresetData {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames_per_buffer: u32,
    pub bits_per_sample: u16,
    pub compression: u16,
    pub is_float: bool,
}

pub const QUALITY_NAMES: [&str; NUM_PRESETS] = [
    "Ultra Low 44.1k mono 16b",
    "Low Latency 44.1k stereo 16b",
    "Balanced 48k stereo 16b",
    "High Quality 48k stereo 24b",
    "Maximum 48k stereo 24b",
    "Hi-Res 96k stereo 24b",
    "Hi-Res Ultra 192k stereo 24b",
];

pub const PRESETS: [PresetData; NUM_PRESETS] = [
    PresetData { sample_rate: 44100, channels: 1, frames_per_buffer: 32, bits_per_sample: 16, compression: 0, is_float: false },
    PresetData { sample_rate: 44100, channels: 2, frames_per_buffer: 32, bits_per_sample: 16, compression: 0, is_float: false },
    PresetData { sample_rate: 48000, channels: 2, frames_per_buffer: 240, bits_per_sample: 16, compression: 0, is_float: false },
    PresetData { sample_rate: 48000, channels: 2, frames_per_buffer: 4800, bits_per_sample: 24, compression: 0, is_float: false },
    PresetData { sample_rate: 48000, channels: 2, frames_per_buffer: 9600, bits_per_sample: 24, compression: 0, is_float: false },
    PresetData { sample_rate: 96000, channels: 2, frames_per_buffer: 96000, bits_per_sample: 24, compression: 0, is_float: false },
    PresetData { sample_rate: 192000, channels: 2, frames_per_buffer: 192000, bits_per_sample: 24, compression: 0, is_float: false },
];

pub const VALID_SAMPLE_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

pub fn valid_sample_rate(sr: u32) -> bool {
    VALID_SAMPLE_RATES.contains(&sr)
}

/// Immutable per-session descriptor (§3 `AudioConfig`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub frames_per_buffer: u32,
    pub compression_type: u16,
    pub is_float: bool,
    pub bytes_per_sample: u32,
    pub chunk_size: u32,
    pub socket_buffer_size: u32,
    pub is_hires: bool,
    pub preset_index: usize,
}

impl AudioConfig {
    /// Build from a preset index; out-of-range indices fall back to the default preset.
    pub fn from_preset(idx: usize) -> Self {
        let idx = if idx < NUM_PRESETS { idx } else { DEFAULT_PRESET };
        let p = PRESETS[idx];
        Self::compute(
            p.sample_rate,
            p.channels,
            p.frames_per_buffer,
            p.bits_per_sample,
            p.compression,
            p.is_float,
            idx,
        )
    }

    /// Build from values parsed off the wire (receiver side). `preset_index` is
    /// a local guess used only for display purposes, never transmitted.
    pub fn from_header_fields(
        sample_rate: u32,
        channels: u16,
        frames_per_buffer: u32,
        bits_per_sample: u16,
        compression_type: u16,
        is_float: bool,
    ) -> Self {
        let preset_index = if compression_type == COMPRESSION_FLAC {
            NUM_PRESETS
        } else if sample_rate > 48000 {
            5
        } else {
            DEFAULT_PRESET
        };
        Self::compute(
            sample_rate,
            channels,
            frames_per_buffer,
            bits_per_sample,
            compression_type,
            is_float,
            preset_index,
        )
    }

    fn compute(
        sample_rate: u32,
        channels: u16,
        frames_per_buffer: u32,
        bits_per_sample: u16,
        compression_type: u16,
        is_float: bool,
        preset_index: usize,
    ) -> Self {
        let bytes_per_sample: u32 = if is_float {
            4
        } else if bits_per_sample >= 24 {
            4
        } else {
            2
        };

        let use_flac = compression_type == COMPRESSION_FLAC;
        let is_hires = sample_rate > 48000
            || bits_per_sample > 24
            || (bits_per_sample == 24 && sample_rate >= 96000);

        let chunk_size = frames_per_buffer * channels as u32 * bytes_per_sample;

        let socket_buffer_size = if is_hires {
            chunk_size * 4
        } else if use_flac {
            chunk_size * 2
        } else if preset_index <= 1 {
            chunk_size * 2
        } else {
            chunk_size * 4
        };

        Self {
            sample_rate,
            channels,
            bits_per_sample,
            frames_per_buffer,
            compression_type,
            is_float,
            bytes_per_sample,
            chunk_size,
            socket_buffer_size,
            is_hires,
            preset_index,
        }
    }

    pub fn use_flac(&self) -> bool {
        self.compression_type == COMPRESSION_FLAC
    }

    /// Local capture-to-playback buffering latency in milliseconds.
    pub fn buffer_latency_ms(&self) -> f64 {
        (self.frames_per_buffer as f64 * 1000.0) / self.sample_rate as f64
    }

    pub fn raw_bitrate_kbps(&self) -> i64 {
        (self.sample_rate as i64 * self.channels as i64 * self.bits_per_sample as i64) / 1000
    }

    pub fn format_tag(&self) -> &'static str {
        if self.is_float {
            "float32le"
        } else if self.bits_per_sample >= 24 {
            "s32le"
        } else {
            "s16le"
        }
    }

    pub fn format_string(&self) -> String {
        let codec = if self.use_flac() { "FLAC" } else { "PCM" };
        let fl = if self.is_float { " Float" } else { "" };
        let hi = if self.is_hires { " [Hi-Res]" } else { "" };
        let ch = if self.channels == 1 { "Mono" } else { "Stereo" };
        let mbps = self.sample_rate as f64 * self.channels as f64 * self.bits_per_sample as f64 / 1e6;
        format!("{codec} {}-bit{fl} {ch} ({mbps:.1} Mbps raw){hi}", self.bits_per_sample)
    }

    pub fn sample_rate_string(&self) -> String {
        if self.sample_rate >= 1000 {
            format!("{:.1} kHz", self.sample_rate as f64 / 1000.0)
        } else {
            format!("{} Hz", self.sample_rate)
        }
    }

    pub fn channel_string(&self) -> &'static str {
        if self.channels == 1 { "Mono" } else { "Stereo" }
    }

    pub fn compression_string(&self) -> &'static str {
        match (self.use_flac(), self.is_hires) {
            (true, true) => "Hi-Res FLAC Lossless",
            (true, false) => "FLAC Lossless",
            (false, true) => "Hi-Res PCM",
            (false, false) => "Uncompressed PCM",
        }
    }
}

/// Conservative capability hints (original: `config_detect_capabilities`).
/// No platform probing is performed; this crate assumes a generic host can
/// do everything up to 192kHz/32-bit/float, matching the original's stub.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCapabilities {
    pub supports_96khz: bool,
    pub supports_192khz: bool,
    pub supports_24bit: bool,
    pub supports_32bit: bool,
    pub supports_float: bool,
    pub max_sample_rate: u32,
    pub max_bit_depth: u16,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            supports_96khz: true,
            supports_192khz: true,
            supports_24bit: true,
            supports_32bit: true,
            supports_float: true,
            max_sample_rate: 192_000,
            max_bit_depth: 32,
        }
    }
}

impl DeviceCapabilities {
    pub fn is_hires_capable(&self) -> bool {
        self.supports_96khz && self.supports_24bit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_2_is_balanced_default() {
        let cfg = AudioConfig::from_preset(DEFAULT_PRESET);
        assert_eq!(cfg.sample_rate, 48000);
        assert_eq!(cfg.channels, 2);
        assert_eq!(cfg.bits_per_sample, 16);
        assert_eq!(cfg.bytes_per_sample, 2);
        assert_eq!(cfg.chunk_size, 240 * 2 * 2);
        assert!(!cfg.is_hires);
    }

    #[test]
    fn hires_preset_detection() {
        let cfg = AudioConfig::from_preset(6);
        assert!(cfg.is_hires);
        assert_eq!(cfg.bytes_per_sample, 4);
        assert_eq!(cfg.socket_buffer_size, cfg.chunk_size * 4);
    }

    #[test]
    fn out_of_range_preset_falls_back_to_default() {
        let cfg = AudioConfig::from_preset(99);
        assert_eq!(cfg.preset_index, DEFAULT_PRESET);
        assert_eq!(cfg.sample_rate, 48000);
    }

    #[test]
    fn header_roundtrip_recomputes_derived_fields() {
        let original = AudioConfig::from_preset(3);
        let parsed = AudioConfig::from_header_fields(
            original.sample_rate,
            original.channels,
            original.frames_per_buffer,
            original.bits_per_sample,
            original.compression_type,
            original.is_float,
        );
        assert_eq!(parsed.sample_rate, original.sample_rate);
        assert_eq!(parsed.channels, original.channels);
        assert_eq!(parsed.bits_per_sample, original.bits_per_sample);
        assert_eq!(parsed.frames_per_buffer, original.frames_per_buffer);
        assert_eq!(parsed.chunk_size, original.chunk_size);
        assert_eq!(parsed.socket_buffer_size, original.socket_buffer_size);
        assert_eq!(parsed.is_hires, original.is_hires);
    }

    #[test]
    fn sample_rate_validation() {
        for sr in VALID_SAMPLE_RATES {
            assert!(valid_sample_rate(sr));
        }
        assert!(!valid_sample_rate(22050));
    }
}
