//! FLAC encoding via `flacenc`.
//!
//! The stream header goes out first with unknown length and checksum, then
//! one fixed-size FLAC frame per [`FRAME_SIZE`] samples as they arrive. Only
//! the last frame may be shorter.

use anyhow::{Result, anyhow};
use flacenc::bitsink::ByteSink;
use flacenc::component::{BitRepr, Stream};
use flacenc::error::{Verified, Verify};
use flacenc::source::{Fill, FrameBuf};

use super::{Encoder, SinkConfig, s16_values};
use crate::format::{Frame, SampleFormat, StreamInfo};

pub const FRAME_SIZE: usize = 4096;

const MAX_CHANNELS: usize = 8;

const BITS_PER_SAMPLE: usize = 16;

pub(crate) struct FlacEncoder {
    info: StreamInfo,
    config: Verified<flacenc::config::Encoder>,
    stream_info: flacenc::component::StreamInfo,
    framebuf: FrameBuf,
    /// Interleaved samples not yet making up a whole block.
    pending: Vec<i32>,
    frame_number: usize,
}

impl FlacEncoder {
    pub(crate) fn new(config: &SinkConfig) -> Result<Self> {
        let info = StreamInfo::new(config.sample_rate, SampleFormat::S16, config.channel_layout);
        let channels = info.channels();
        if channels > MAX_CHANNELS {
            return Err(anyhow!(
                "FLAC supports at most {MAX_CHANNELS} channels, got {channels}"
            ));
        }

        let mut encoder = flacenc::config::Encoder::default();
        encoder.block_size = FRAME_SIZE;
        let encoder = encoder
            .into_verified()
            .map_err(|e| anyhow!("FLAC config error: {e:?}"))?;
        let mut stream_info = flacenc::component::StreamInfo::new(
            info.sample_rate as usize,
            channels,
            BITS_PER_SAMPLE,
        )
        .map_err(|e| anyhow!("FLAC stream info error: {e:?}"))?;
        stream_info
            .set_block_sizes(FRAME_SIZE, FRAME_SIZE)
            .map_err(|e| anyhow!("FLAC block size error: {e:?}"))?;
        let framebuf = FrameBuf::with_size(channels, FRAME_SIZE)
            .map_err(|e| anyhow!("FLAC frame buffer error: {e:?}"))?;

        Ok(Self {
            info,
            config: encoder,
            stream_info,
            framebuf,
            pending: Vec::with_capacity(FRAME_SIZE * channels),
            frame_number: 0,
        })
    }

    /// Encode the first `samples` pending samples as one FLAC frame.
    fn write_block(&mut self, samples: usize, out: &mut Vec<u8>) -> Result<()> {
        let values = samples * self.info.channels();
        self.framebuf
            .fill_interleaved(&self.pending[..values])
            .map_err(|e| anyhow!("FLAC fill error: {e:?}"))?;
        let frame = flacenc::encode_fixed_size_frame(
            &self.config,
            &self.framebuf,
            self.frame_number,
            &self.stream_info,
        )
        .map_err(|e| anyhow!("FLAC encode error: {e:?}"))?;

        let mut sink = ByteSink::new();
        frame
            .write(&mut sink)
            .map_err(|e| anyhow!("FLAC write error: {e:?}"))?;
        out.extend_from_slice(&sink.into_inner());
        self.pending.drain(..values);
        self.frame_number += 1;
        Ok(())
    }
}

impl Encoder for FlacEncoder {
    fn stream_info(&self) -> StreamInfo {
        self.info
    }

    fn frame_size(&self) -> usize {
        FRAME_SIZE
    }

    fn start(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let header = Stream::with_stream_info(self.stream_info.clone());
        let mut sink = ByteSink::new();
        header
            .write(&mut sink)
            .map_err(|e| anyhow!("FLAC header error: {e:?}"))?;
        out.extend_from_slice(&sink.into_inner());
        Ok(())
    }

    fn encode(&mut self, frame: &Frame, out: &mut Vec<u8>) -> Result<bool> {
        self.pending.extend(s16_values(frame).map(i32::from));
        let block = FRAME_SIZE * self.info.channels();
        while self.pending.len() >= block {
            self.write_block(FRAME_SIZE, out)?;
        }
        Ok(false)
    }

    fn flush(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let remainder = self.pending.len() / self.info.channels();
        if remainder > 0 {
            self.write_block(remainder, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{Codec, Sink, finish, new_sink};
    use crate::format::ChannelLayout;

    fn ramp(info: StreamInfo, samples: usize) -> Frame {
        let data: Vec<u8> = (0..samples * info.channels())
            .flat_map(|i| ((i % 200) as i16 * 50).to_le_bytes())
            .collect();
        Frame::new(info, data).unwrap()
    }

    #[test]
    fn emits_frames_as_blocks_fill() {
        let info = StreamInfo::new(8_000, SampleFormat::S16, ChannelLayout::STEREO);
        let mut sink = new_sink(&SinkConfig::for_stream(Codec::Flac, info)).unwrap();

        sink.encode(ramp(info, FRAME_SIZE / 2)).unwrap();
        assert_eq!(&sink.buffer()[..4], b"fLaC");
        let header = sink.buffer().len();
        sink.drain(header);

        sink.encode(ramp(info, FRAME_SIZE / 2)).unwrap();
        let first = sink.buffer().len();
        assert!(first > 0, "a full block is written before the stream ends");
        // FLAC frame sync code.
        assert_eq!(sink.buffer()[0], 0xFF);
        assert_eq!(sink.buffer()[1] & 0xFC, 0xF8);
        sink.drain(first);

        sink.encode(ramp(info, 100)).unwrap();
        assert!(sink.buffer().is_empty());
        finish(sink.as_mut()).unwrap();
        assert!(!sink.buffer().is_empty());
    }

    #[test]
    fn encoded_stream_decodes_to_every_sample() {
        use std::io::Cursor;

        use symphonia::core::formats::FormatOptions;
        use symphonia::core::io::MediaSourceStream;
        use symphonia::core::meta::MetadataOptions;
        use symphonia::core::probe::Hint;

        let info = StreamInfo::new(8_000, SampleFormat::S16, ChannelLayout::STEREO);
        let mut sink = new_sink(&SinkConfig::for_stream(Codec::Flac, info)).unwrap();
        sink.encode(ramp(info, FRAME_SIZE)).unwrap();
        sink.encode(ramp(info, 1_000)).unwrap();
        finish(sink.as_mut()).unwrap();
        let bytes = sink.buffer().to_vec();

        let stream = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
        let mut hint = Hint::new();
        hint.with_extension("flac");
        let probed = symphonia::default::get_probe()
            .format(&hint, stream, &FormatOptions::default(), &MetadataOptions::default())
            .unwrap();
        let mut format = probed.format;
        let track = format.default_track().unwrap();
        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &Default::default())
            .unwrap();
        let mut samples = 0;
        while let Ok(packet) = format.next_packet() {
            samples += decoder.decode(&packet).unwrap().frames();
        }
        assert_eq!(samples, FRAME_SIZE + 1_000);
    }
}
