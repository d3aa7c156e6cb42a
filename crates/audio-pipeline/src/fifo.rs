//! Variable-size-in, fixed-size-out sample buffer.
//!
//! Decoders hand out frames of whatever size the codec produces, while
//! encoders want exact frame sizes. A [`Fifo`] sits between the two: samples
//! are appended at the tail and read back from the head in caller-chosen
//! chunks.
//!
//! Sizes are always reported in samples (one value per channel), never bytes.

use std::collections::VecDeque;

use anyhow::{Context, Result, bail};

use crate::format::{Frame, StreamInfo};

/// Sample buffer bound to a single [`StreamInfo`].
pub struct Fifo {
    info: StreamInfo,
    buf: VecDeque<u8>,
}

impl Fifo {
    pub fn new(info: StreamInfo) -> Self {
        Self {
            info,
            buf: VecDeque::new(),
        }
    }

    pub fn info(&self) -> StreamInfo {
        self.info
    }

    /// Buffered samples.
    pub fn size(&self) -> usize {
        self.buf.len() / self.info.sample_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append `samples` packed samples taken from the front of `data`.
    ///
    /// Fails with a short write if `data` holds fewer samples than requested
    /// or the buffer cannot grow; nothing is appended in that case.
    pub fn write(&mut self, data: &[u8], samples: usize) -> Result<()> {
        let bytes = samples * self.info.sample_bytes();
        if data.len() < bytes {
            bail!(
                "short write: {} of {} samples available",
                data.len() / self.info.sample_bytes(),
                samples
            );
        }
        self.buf
            .try_reserve(bytes)
            .with_context(|| format!("short write: cannot buffer {samples} samples"))?;
        self.buf.extend(&data[..bytes]);
        Ok(())
    }

    /// Append a whole frame, consuming it.
    pub fn write_frame(&mut self, frame: Frame) -> Result<()> {
        if frame.info() != self.info {
            bail!(
                "frame stream info {} does not match fifo {}",
                frame.info(),
                self.info
            );
        }
        let samples = frame.samples();
        self.write(frame.data(), samples)
    }

    /// Remove up to `max_samples` from the head.
    ///
    /// Returns an empty frame when nothing is buffered.
    pub fn read_frame(&mut self, max_samples: usize) -> Result<Frame> {
        let samples = max_samples.min(self.size());
        if samples == 0 {
            return Ok(Frame::empty(self.info));
        }
        let bytes = samples * self.info.sample_bytes();
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .with_context(|| format!("cannot allocate frame of {samples} samples"))?;
        data.extend(self.buf.drain(..bytes));
        Frame::new(self.info, data)
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ChannelLayout, SampleFormat};

    fn info() -> StreamInfo {
        StreamInfo::new(48_000, SampleFormat::S16, ChannelLayout::STEREO)
    }

    fn ramp(samples: usize) -> Vec<u8> {
        (0..samples * 4).map(|i| i as u8).collect()
    }

    #[test]
    fn read_frame_returns_min_of_request_and_size() {
        for request in [0usize, 1, 7, 10, 64] {
            let mut fifo = Fifo::new(info());
            fifo.write(&ramp(10), 10).unwrap();
            let before = fifo.size();
            let frame = fifo.read_frame(request).unwrap();
            assert_eq!(frame.samples(), request.min(before));
            assert_eq!(fifo.size(), before - frame.samples());
        }
    }

    #[test]
    fn repeated_reads_drain_to_zero() {
        let mut fifo = Fifo::new(info());
        fifo.write(&ramp(1000), 1000).unwrap();
        let mut total = 0;
        loop {
            let frame = fifo.read_frame(384).unwrap();
            if frame.is_empty() {
                break;
            }
            total += frame.samples();
        }
        assert_eq!(total, 1000);
        assert_eq!(fifo.size(), 0);
        assert!(fifo.is_empty());
    }

    #[test]
    fn reads_preserve_byte_order() {
        let mut fifo = Fifo::new(info());
        let data = ramp(6);
        fifo.write(&data, 6).unwrap();
        let first = fifo.read_frame(2).unwrap();
        let rest = fifo.read_frame(10).unwrap();
        assert_eq!(first.data(), &data[..8]);
        assert_eq!(rest.data(), &data[8..]);
    }

    #[test]
    fn empty_fifo_yields_empty_frame() {
        let mut fifo = Fifo::new(info());
        let frame = fifo.read_frame(1024).unwrap();
        assert!(frame.is_empty());
        assert_eq!(frame.info(), info());
    }

    #[test]
    fn short_write_is_an_error_and_appends_nothing() {
        let mut fifo = Fifo::new(info());
        let err = fifo.write(&ramp(3), 4).unwrap_err();
        assert!(err.to_string().contains("short write"));
        assert_eq!(fifo.size(), 0);
    }

    #[test]
    fn write_frame_rejects_mismatched_info() {
        let mut fifo = Fifo::new(info());
        let other = StreamInfo::new(44_100, SampleFormat::S16, ChannelLayout::STEREO);
        let frame = Frame::new(other, vec![0; 4]).unwrap();
        assert!(fifo.write_frame(frame).is_err());
    }
}
