//! MP3 encoding via libmp3lame.

use std::mem::MaybeUninit;

use anyhow::{Result, anyhow};
use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, InterleavedPcm, Quality};

use super::{Encoder, SinkConfig, s16_values};
use crate::format::{ChannelLayout, Frame, SampleFormat, StreamInfo};

/// Samples per MPEG-1 Layer III frame.
pub const FRAME_SIZE: usize = 1152;

const DEFAULT_KBPS: u32 = 192;

/// Spare bytes LAME may emit beyond the 1.25x input estimate.
const LAME_SLACK: usize = 7200;

/// LAME's interleaved input is always stereo s16, so the sink resolves to
/// that layout regardless of the request.
pub(crate) struct Mp3Encoder {
    info: StreamInfo,
    lame: mp3lame_encoder::Encoder,
    pcm: Vec<i16>,
}

impl Mp3Encoder {
    pub(crate) fn new(config: &SinkConfig) -> Result<Self> {
        let info = StreamInfo::new(config.sample_rate, SampleFormat::S16, ChannelLayout::STEREO);
        let kbps = match (config.quality, config.bit_rate) {
            (Some(q), _) if q >= -1.0 => kbps_for_quality(q),
            (_, Some(bits)) => bits / 1000,
            _ => DEFAULT_KBPS,
        };

        let mut builder = Builder::new().ok_or_else(|| anyhow!("failed to create LAME encoder"))?;
        builder
            .set_num_channels(2)
            .map_err(|e| anyhow!("LAME set_num_channels failed: {e:?}"))?;
        builder
            .set_sample_rate(config.sample_rate)
            .map_err(|e| anyhow!("LAME set_sample_rate failed: {e:?}"))?;
        builder
            .set_brate(map_bitrate(kbps))
            .map_err(|e| anyhow!("LAME set_brate failed: {e:?}"))?;
        builder
            .set_quality(Quality::Best)
            .map_err(|e| anyhow!("LAME set_quality failed: {e:?}"))?;
        let lame = builder
            .build()
            .map_err(|e| anyhow!("LAME build failed: {e:?}"))?;

        Ok(Self {
            info,
            lame,
            pcm: Vec::new(),
        })
    }
}

impl Encoder for Mp3Encoder {
    fn stream_info(&self) -> StreamInfo {
        self.info
    }

    fn frame_size(&self) -> usize {
        FRAME_SIZE
    }

    fn encode(&mut self, frame: &Frame, out: &mut Vec<u8>) -> Result<bool> {
        self.pcm.clear();
        self.pcm.extend(s16_values(frame));

        out.reserve(frame.samples() * 5 / 4 + LAME_SLACK);
        let spare: &mut [MaybeUninit<u8>] = out.spare_capacity_mut();
        let written = self
            .lame
            .encode(InterleavedPcm(&self.pcm), spare)
            .map_err(|e| anyhow!("LAME encode failed: {e:?}"))?;
        // SAFETY: encode initialized exactly `written` bytes of spare capacity.
        unsafe { out.set_len(out.len() + written) };
        Ok(false)
    }

    fn flush(&mut self, out: &mut Vec<u8>) -> Result<()> {
        out.reserve(LAME_SLACK);
        let written = self
            .lame
            .flush::<FlushNoGap>(out.spare_capacity_mut())
            .map_err(|e| anyhow!("LAME flush failed: {e:?}"))?;
        // SAFETY: flush initialized exactly `written` bytes of spare capacity.
        unsafe { out.set_len(out.len() + written) };
        Ok(())
    }
}

/// Approximate average bit rate of LAME's VBR presets (`-V0` best to `-V9`).
fn kbps_for_quality(quality: f32) -> u32 {
    match quality.clamp(0.0, 9.0).round() as u32 {
        0 => 256,
        1 => 224,
        2 => 192,
        3 => 160,
        4 => 160,
        5 => 128,
        6 => 112,
        7 => 96,
        8 => 80,
        _ => 64,
    }
}

fn map_bitrate(kbps: u32) -> Bitrate {
    match kbps {
        0..=32 => Bitrate::Kbps32,
        33..=40 => Bitrate::Kbps40,
        41..=48 => Bitrate::Kbps48,
        49..=64 => Bitrate::Kbps64,
        65..=80 => Bitrate::Kbps80,
        81..=96 => Bitrate::Kbps96,
        97..=112 => Bitrate::Kbps112,
        113..=128 => Bitrate::Kbps128,
        129..=160 => Bitrate::Kbps160,
        161..=192 => Bitrate::Kbps192,
        193..=224 => Bitrate::Kbps224,
        225..=256 => Bitrate::Kbps256,
        _ => Bitrate::Kbps320,
    }
}
