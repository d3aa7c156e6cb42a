//! Endless silent [`Source`] used by the player between playlists.

use std::time::Duration;

use anyhow::Result;

use crate::fifo::Fifo;
use crate::format::{ChannelLayout, SampleFormat, StreamInfo};
use crate::resample::Resampler;
use crate::source::{DecodeError, ReceiveStatus, Source, Tags};

/// Samples per silent frame.
pub const SILENCE_FRAME_SAMPLES: usize = 4096;

/// Stream info of the silence source: 44.1 kHz s16 stereo.
pub fn default_stream_info() -> StreamInfo {
    StreamInfo::new(44_100, SampleFormat::S16, ChannelLayout::STEREO)
}

/// Hands out the same zeroed frame forever, so the pacing clock keeps
/// running while nothing is queued.
pub struct SilenceSource {
    info: StreamInfo,
    tags: Tags,
    buffer: Vec<u8>,
    ready: bool,
    emitted: u64,
}

impl SilenceSource {
    pub fn new() -> Self {
        let info = default_stream_info();
        Self {
            info,
            tags: Tags::new(),
            buffer: vec![0; SILENCE_FRAME_SAMPLES * info.sample_bytes()],
            ready: false,
            emitted: 0,
        }
    }
}

impl Default for SilenceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for SilenceSource {
    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn stream_info(&self) -> StreamInfo {
        self.info
    }

    /// Silence has no end; reported as zero.
    fn duration(&self) -> Duration {
        Duration::ZERO
    }

    fn seek_to(&mut self, _offset: Duration) -> Result<()> {
        Ok(())
    }

    fn decode(&mut self) -> Result<(), DecodeError> {
        self.ready = true;
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<ReceiveStatus> {
        if !self.ready {
            return Ok(ReceiveStatus::Empty);
        }
        self.ready = false;
        self.emitted += SILENCE_FRAME_SAMPLES as u64;
        Ok(ReceiveStatus::CopyAndCallAgain)
    }

    fn frame_size(&self) -> usize {
        SILENCE_FRAME_SAMPLES
    }

    fn frame_start_time(&self) -> Duration {
        self.info
            .samples_to_duration(self.emitted.saturating_sub(SILENCE_FRAME_SAMPLES as u64))
    }

    fn copy_frame(&self, fifo: &mut Fifo) -> Result<()> {
        fifo.write(&self.buffer, SILENCE_FRAME_SAMPLES)
    }

    fn resample_frame(&self, resampler: &mut Resampler, fifo: &mut Fifo) -> Result<()> {
        resampler.convert(&self.buffer, SILENCE_FRAME_SAMPLES, fifo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Step, decode_step};

    #[test]
    fn produces_one_frame_per_decode_forever() {
        let mut source = SilenceSource::new();
        for round in 0..5 {
            let mut fifo = Fifo::new(default_stream_info());
            let step = decode_step(&mut source, |src| src.copy_frame(&mut fifo));
            assert_eq!(step, Step::Decoded);
            assert_eq!(fifo.size(), SILENCE_FRAME_SAMPLES);
            let frame = fifo.read_frame(SILENCE_FRAME_SAMPLES).unwrap();
            assert!(frame.data().iter().all(|b| *b == 0), "round {round}");
        }
        assert_eq!(
            source.frame_start_time(),
            default_stream_info().samples_to_duration(4 * SILENCE_FRAME_SAMPLES as u64)
        );
    }

    #[test]
    fn resamples_into_other_layouts() {
        let mut source = SilenceSource::new();
        let dst = StreamInfo::new(44_100, SampleFormat::F32, ChannelLayout::MONO);
        let mut resampler = Resampler::new();
        resampler.setup(source.stream_info(), dst, 1.0).unwrap();
        let mut fifo = Fifo::new(dst);
        decode_step(&mut source, |src| src.resample_frame(&mut resampler, &mut fifo));
        assert_eq!(fifo.size(), SILENCE_FRAME_SAMPLES);
    }
}
