//! Single-consumer decode, convert, encode and pace loop.
//!
//! A [`Transcoder`] owns one instance of each pipeline stage and streams the
//! encoded result into any [`Write`]. Output is paced against wall-clock time
//! by a [`Throttle`] so a client only ever runs a bounded distance ahead of
//! real-time playback.

use std::collections::VecDeque;
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::encode::{self, Sink};
use crate::fifo::Fifo;
use crate::format::StreamInfo;
use crate::resample::Resampler;
use crate::source::{Source, Step, decode_step};

/// Pacing and output options for one stream.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamOptions {
    /// Bytes a client may buffer ahead before pacing applies.
    pub stream_ahead_bytes: usize,
    /// Playback time a client may buffer ahead; zero disables pacing.
    pub stream_ahead_time: Duration,
    pub throttle: bool,
    /// Ask sinks for output that depends only on the input samples.
    pub deterministic: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            stream_ahead_bytes: 512 * 1024,
            stream_ahead_time: Duration::from_secs(10),
            throttle: true,
            deterministic: false,
        }
    }
}

/// Outcome of [`Transcoder::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Samples handed to the encoder.
    pub samples: u64,
    /// Encoded bytes accepted by the writer.
    pub bytes: u64,
    /// `false` if the writer failed before the stream ended.
    pub completed: bool,
}

/// Sleeps so that the stream stays within the configured lead over
/// real-time playback.
///
/// Each written buffer is remembered with the playback time at which it
/// starts. The stream may run ahead until either the newest
/// `stream_ahead_bytes` or `stream_ahead_time` of audio has been sent,
/// whichever allows the earlier wake-up.
pub struct Throttle {
    ahead_bytes: usize,
    ahead_time: Duration,
    written: VecDeque<(Duration, usize)>,
}

impl Throttle {
    /// `None` when pacing is disabled.
    pub fn new(options: &StreamOptions) -> Option<Self> {
        if !options.throttle || options.stream_ahead_time.is_zero() {
            return None;
        }
        Some(Self {
            ahead_bytes: options.stream_ahead_bytes,
            ahead_time: options.stream_ahead_time,
            written: VecDeque::new(),
        })
    }

    /// Remember a written buffer starting at playback time `start`.
    pub fn record(&mut self, start: Duration, bytes: usize) {
        self.written.push_back((start, bytes));
    }

    /// Time to sleep given the playback time sent so far and the wall-clock
    /// time since the stream began.
    pub fn delay(&mut self, played: Duration, elapsed: Duration) -> Option<Duration> {
        let mut trailing = 0usize;
        let found = self.written.iter().rposition(|(_, bytes)| {
            trailing += bytes;
            trailing >= self.ahead_bytes
        })?;
        let (start, _) = self.written[found];
        self.written.drain(..found);

        let wake = start.min(played.saturating_sub(self.ahead_time));
        let sleep = wake.checked_sub(elapsed)?;
        (sleep > Duration::from_millis(1)).then_some(sleep)
    }
}

/// One stream's pipeline stages.
///
/// Fields drop in declaration order, so buffers go before the codec
/// contexts that fill them.
pub struct Transcoder {
    resampler: Resampler,
    fifo: Fifo,
    sink: Box<dyn Sink>,
    source: Box<dyn Source>,
}

impl Transcoder {
    /// Connect `source` to `sink`, scaling samples by `volume`.
    pub fn new(source: Box<dyn Source>, sink: Box<dyn Sink>, volume: f64) -> Result<Self> {
        let info = sink.stream_info();
        let mut resampler = Resampler::new();
        resampler
            .setup(source.stream_info(), info, volume)
            .context("setup resampler")?;
        Ok(Self {
            resampler,
            fifo: Fifo::new(info),
            sink,
            source,
        })
    }

    pub fn sink_info(&self) -> StreamInfo {
        self.sink.stream_info()
    }

    /// Stream the whole source into `out`.
    ///
    /// A failing writer ends the stream quietly. Encoder failures are
    /// returned as errors.
    pub fn run<W: Write>(mut self, out: &mut W, options: &StreamOptions) -> Result<StreamSummary> {
        let info = self.sink.stream_info();
        let frame_size = self.sink.frame_size();
        let mut throttle = Throttle::new(options);
        let started = Instant::now();
        let mut summary = StreamSummary::default();
        let mut done = false;

        while !done {
            let before = self.fifo.size();
            while self.fifo.size() < frame_size {
                let Self {
                    resampler,
                    fifo,
                    source,
                    ..
                } = &mut self;
                let step = decode_step(source.as_mut(), |src| src.resample_frame(resampler, fifo));
                if step == Step::Finished {
                    done = true;
                    break;
                }
            }
            if done {
                self.resampler
                    .flush(&mut self.fifo)
                    .context("flush resampler")?;
            }

            let start = info.samples_to_duration(summary.samples);
            summary.samples += self.fifo.size().saturating_sub(before) as u64;

            let min_samples = if done { 1 } else { frame_size };
            while self.fifo.size() >= min_samples {
                let frame = self.fifo.read_frame(frame_size)?;
                self.sink.encode(frame).context("encode frame")?;
            }

            let written = match write_buffer(self.sink.as_mut(), out) {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "failed to write buffer");
                    return Ok(summary);
                }
            };
            summary.bytes += written as u64;

            if let Some(throttle) = throttle.as_mut() {
                throttle.record(start, written);
                let played = info.samples_to_duration(summary.samples);
                if let Some(sleep) = throttle.delay(played, started.elapsed()) {
                    thread::sleep(sleep);
                }
            }
        }

        if let Err(e) = encode::finish(self.sink.as_mut()) {
            tracing::error!(error = %format!("{e:#}"), "failed to flush sink");
        }
        match write_buffer(self.sink.as_mut(), out) {
            Ok(n) => {
                summary.bytes += n as u64;
                summary.completed = true;
            }
            Err(e) => tracing::debug!(error = %e, "failed to write buffer"),
        }
        Ok(summary)
    }
}

/// Write everything the sink has buffered and drain what was written.
fn write_buffer<W: Write>(sink: &mut dyn Sink, out: &mut W) -> std::io::Result<usize> {
    let buffer = sink.buffer();
    if buffer.is_empty() {
        return Ok(0);
    }
    let len = buffer.len();
    out.write_all(buffer)?;
    out.flush()?;
    sink.drain(len);
    Ok(len)
}
