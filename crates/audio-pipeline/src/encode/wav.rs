//! Streaming RIFF/WAVE writer for 16-bit PCM.

use anyhow::Result;

use super::{Encoder, SinkConfig};
use crate::format::{Frame, SampleFormat, StreamInfo};

/// Samples per frame requested from the fifo.
pub const FRAME_SIZE: usize = 4096;

/// Size field value for streams of unknown length.
const UNKNOWN_SIZE: u32 = u32::MAX;

/// Canonical 44-byte PCM header.
///
/// With `data_bytes` unset the RIFF and data sizes are written as
/// `0xFFFFFFFF`, which players treat as "read until end of stream".
pub fn header(info: StreamInfo, data_bytes: Option<u32>) -> Vec<u8> {
    let channels = info.channels() as u16;
    let bits = (info.sample_format.bytes() * 8) as u16;
    let block_align = channels * bits / 8;
    let byte_rate = info.sample_rate * block_align as u32;
    let riff_size = data_bytes.map_or(UNKNOWN_SIZE, |n| n.saturating_add(36));

    let mut out = Vec::with_capacity(44);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&riff_size.to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&info.sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_bytes.unwrap_or(UNKNOWN_SIZE).to_le_bytes());
    out
}

/// Pass-through encoder: frames are already s16le.
pub(crate) struct WavEncoder {
    info: StreamInfo,
}

impl WavEncoder {
    pub(crate) fn new(config: &SinkConfig) -> Self {
        Self {
            info: StreamInfo::new(config.sample_rate, SampleFormat::S16, config.channel_layout),
        }
    }
}

impl Encoder for WavEncoder {
    fn stream_info(&self) -> StreamInfo {
        self.info
    }

    fn frame_size(&self) -> usize {
        FRAME_SIZE
    }

    fn start(&mut self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&header(self.info, None));
        Ok(())
    }

    fn encode(&mut self, frame: &Frame, out: &mut Vec<u8>) -> Result<bool> {
        out.extend_from_slice(frame.data());
        Ok(false)
    }

    fn flush(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{Codec, Sink, finish, new_sink};
    use crate::format::ChannelLayout;

    #[test]
    fn header_layout() {
        let info = StreamInfo::new(44_100, SampleFormat::S16, ChannelLayout::STEREO);
        let h = header(info, Some(400));
        assert_eq!(h.len(), 44);
        assert_eq!(&h[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(h[4..8].try_into().unwrap()), 436);
        assert_eq!(u16::from_le_bytes(h[22..24].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(h[28..32].try_into().unwrap()), 176_400);
        assert_eq!(u32::from_le_bytes(h[40..44].try_into().unwrap()), 400);

        let streaming = header(info, None);
        assert_eq!(&streaming[4..8], &[0xFF; 4]);
        assert_eq!(&streaming[40..44], &[0xFF; 4]);
    }

    #[test]
    fn sink_writes_header_then_samples() {
        let info = StreamInfo::new(8_000, SampleFormat::S16, ChannelLayout::MONO);
        let mut config = SinkConfig::for_stream(Codec::Wav, info);
        config.deterministic = true;
        let mut sink = new_sink(&config).unwrap();

        let frame = Frame::new(info, vec![1, 2, 3, 4]).unwrap();
        assert!(!sink.encode(frame).unwrap());
        finish(sink.as_mut()).unwrap();

        let out = sink.buffer();
        assert_eq!(out.len(), 48);
        assert_eq!(&out[..44], header(info, None).as_slice());
        assert_eq!(&out[44..], &[1, 2, 3, 4]);
    }
}
