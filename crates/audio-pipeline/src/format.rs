//! PCM stream descriptions and owned sample frames.
//!
//! Every buffer in the pipeline is packed (interleaved) little-endian PCM.
//! A [`StreamInfo`] names the rate, sample format and channel layout; stages
//! that exchange buffers must agree on it exactly.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};

/// Sample encoding of a single channel value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
}

impl SampleFormat {
    /// Size of one channel value in bytes.
    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }

    /// Canonical short name (`u8`, `s16`, `s32`, `flt`, `dbl`).
    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16 => "s16",
            SampleFormat::S32 => "s32",
            SampleFormat::F32 => "flt",
            SampleFormat::F64 => "dbl",
        }
    }
}

impl FromStr for SampleFormat {
    type Err = anyhow::Error;

    /// Planar names are accepted and map to the packed format, since frames
    /// are always interleaved.
    fn from_str(s: &str) -> Result<Self> {
        let format = match s.trim().to_ascii_lowercase().as_str() {
            "u8" | "u8p" => SampleFormat::U8,
            "s16" | "s16p" => SampleFormat::S16,
            "s32" | "s32p" => SampleFormat::S32,
            "flt" | "fltp" | "f32" => SampleFormat::F32,
            "dbl" | "dblp" | "f64" => SampleFormat::F64,
            other => bail!("unknown sample format: {other}"),
        };
        Ok(format)
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Speaker position bits, matching the common WAVE/FFmpeg channel mask order.
pub mod speaker {
    pub const FRONT_LEFT: u64 = 0x1;
    pub const FRONT_RIGHT: u64 = 0x2;
    pub const FRONT_CENTER: u64 = 0x4;
    pub const LOW_FREQUENCY: u64 = 0x8;
    pub const BACK_LEFT: u64 = 0x10;
    pub const BACK_RIGHT: u64 = 0x20;
    pub const FRONT_LEFT_OF_CENTER: u64 = 0x40;
    pub const FRONT_RIGHT_OF_CENTER: u64 = 0x80;
    pub const BACK_CENTER: u64 = 0x100;
    pub const SIDE_LEFT: u64 = 0x200;
    pub const SIDE_RIGHT: u64 = 0x400;
}

const NAMED_LAYOUTS: &[(&str, u64)] = &[
    ("mono", speaker::FRONT_CENTER),
    ("stereo", speaker::FRONT_LEFT | speaker::FRONT_RIGHT),
    ("2.1", speaker::FRONT_LEFT | speaker::FRONT_RIGHT | speaker::LOW_FREQUENCY),
    ("3.0", speaker::FRONT_LEFT | speaker::FRONT_RIGHT | speaker::FRONT_CENTER),
    (
        "quad",
        speaker::FRONT_LEFT | speaker::FRONT_RIGHT | speaker::BACK_LEFT | speaker::BACK_RIGHT,
    ),
    (
        "5.0",
        speaker::FRONT_LEFT
            | speaker::FRONT_RIGHT
            | speaker::FRONT_CENTER
            | speaker::BACK_LEFT
            | speaker::BACK_RIGHT,
    ),
    (
        "5.1",
        speaker::FRONT_LEFT
            | speaker::FRONT_RIGHT
            | speaker::FRONT_CENTER
            | speaker::LOW_FREQUENCY
            | speaker::BACK_LEFT
            | speaker::BACK_RIGHT,
    ),
    (
        "7.1",
        speaker::FRONT_LEFT
            | speaker::FRONT_RIGHT
            | speaker::FRONT_CENTER
            | speaker::LOW_FREQUENCY
            | speaker::BACK_LEFT
            | speaker::BACK_RIGHT
            | speaker::SIDE_LEFT
            | speaker::SIDE_RIGHT,
    ),
];

/// Channel count plus an optional speaker mask (`mask == 0` means unspecified order).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelLayout {
    channels: u16,
    mask: u64,
}

impl ChannelLayout {
    pub const MONO: ChannelLayout = ChannelLayout {
        channels: 1,
        mask: speaker::FRONT_CENTER,
    };
    pub const STEREO: ChannelLayout = ChannelLayout {
        channels: 2,
        mask: speaker::FRONT_LEFT | speaker::FRONT_RIGHT,
    };

    /// Build a layout from a speaker mask.
    pub fn from_mask(mask: u64) -> Result<Self> {
        let channels = mask.count_ones();
        if channels == 0 {
            bail!("channel mask has no channels");
        }
        Ok(Self {
            channels: channels as u16,
            mask,
        })
    }

    /// Default layout for a channel count; unusual counts get an unspecified order.
    pub fn with_channels(channels: usize) -> Result<Self> {
        let name = match channels {
            0 => bail!("channel count must be positive"),
            1 => "mono",
            2 => "stereo",
            3 => "3.0",
            4 => "quad",
            5 => "5.0",
            6 => "5.1",
            8 => "7.1",
            n => {
                let channels = u16::try_from(n).map_err(|_| anyhow!("too many channels: {n}"))?;
                return Ok(Self { channels, mask: 0 });
            }
        };
        name.parse()
    }

    pub fn channels(&self) -> usize {
        self.channels as usize
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }
}

impl FromStr for ChannelLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        if let Some((_, mask)) = NAMED_LAYOUTS.iter().find(|(name, _)| *name == s) {
            return Self::from_mask(*mask);
        }
        if let Some(hex) = s.strip_prefix("0x") {
            let mask = u64::from_str_radix(hex, 16)
                .map_err(|e| anyhow!("invalid channel mask {s}: {e}"))?;
            return Self::from_mask(mask);
        }
        if let Some(count) = s.strip_suffix('c') {
            let count: usize = count
                .parse()
                .map_err(|e| anyhow!("invalid channel count {s}: {e}"))?;
            return Self::with_channels(count);
        }
        bail!("unknown channel layout: {s}")
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mask == 0 {
            return write!(f, "{}c", self.channels);
        }
        match NAMED_LAYOUTS.iter().find(|(_, mask)| *mask == self.mask) {
            Some((name, _)) => f.write_str(name),
            None => write!(f, "0x{:x}", self.mask),
        }
    }
}

/// Layout of a PCM buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
    pub channel_layout: ChannelLayout,
}

impl StreamInfo {
    pub fn new(sample_rate: u32, sample_format: SampleFormat, channel_layout: ChannelLayout) -> Self {
        Self {
            sample_rate,
            sample_format,
            channel_layout,
        }
    }

    pub fn channels(&self) -> usize {
        self.channel_layout.channels()
    }

    /// Bytes occupied by one sample across all channels.
    pub fn sample_bytes(&self) -> usize {
        self.sample_format.bytes() * self.channels()
    }

    /// Playback time of `samples` at this rate, truncated to whole milliseconds.
    pub fn samples_to_duration(&self, samples: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(samples.saturating_mul(1000) / self.sample_rate as u64)
    }
}

impl fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz {} {}",
            self.sample_rate, self.sample_format, self.channel_layout
        )
    }
}

/// An owned block of packed PCM samples.
///
/// A frame with zero samples is the flush sentinel understood by sinks.
/// Frames move through the pipeline by value; once handed to a sink or a
/// fifo they are gone.
#[derive(Debug, PartialEq)]
pub struct Frame {
    info: StreamInfo,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(info: StreamInfo, data: Vec<u8>) -> Result<Self> {
        if data.len() % info.sample_bytes() != 0 {
            bail!(
                "frame of {} bytes is not a whole number of {}-byte samples",
                data.len(),
                info.sample_bytes()
            );
        }
        Ok(Self { info, data })
    }

    /// The flush sentinel.
    pub fn empty(info: StreamInfo) -> Self {
        Self {
            info,
            data: Vec::new(),
        }
    }

    pub fn info(&self) -> StreamInfo {
        self.info
    }

    /// Number of samples (per channel) held by the frame.
    pub fn samples(&self) -> usize {
        self.data.len() / self.info.sample_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
