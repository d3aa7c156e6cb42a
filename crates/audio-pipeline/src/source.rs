//! Decode-side capability set.
//!
//! A [`Source`] is driven as a small state machine:
//!
//! ```text
//! NeedDecode --decode()--> Polling --receive_frame()--> Empty            -> NeedDecode
//!                                                  \--> CopyAndCallAgain -> copy/resample, then receive again
//!                                                  \--> Eof              (terminal)
//! ```
//!
//! After `CopyAndCallAgain` the pending frame must be taken with
//! [`Source::copy_frame`] or [`Source::resample_frame`] before the next
//! `receive_frame` call, which would replace it. Copying the same pending
//! frame more than once is allowed (one call per output during fan-out) and
//! does not advance the machine.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::Result;

use crate::fifo::Fifo;
use crate::format::StreamInfo;
use crate::replaygain::{self, ReplayGainData, ReplayGainMode};
use crate::resample::Resampler;

/// String metadata with lowercased keys.
pub type Tags = BTreeMap<String, String>;

/// Outcome of [`Source::receive_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// No frame ready; decode more input.
    Empty,
    /// A frame is pending and must be copied before receiving again.
    CopyAndCallAgain,
    /// The decoder is fully drained.
    Eof,
}

/// Error returned by [`Source::decode`].
///
/// `recoverable` errors may be retried on the same source; anything else
/// means the source has to be abandoned.
pub struct DecodeError {
    pub recoverable: bool,
    pub error: anyhow::Error,
}

impl DecodeError {
    pub fn recoverable(error: impl Into<anyhow::Error>) -> Self {
        Self {
            recoverable: true,
            error: error.into(),
        }
    }

    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        Self {
            recoverable: false,
            error: error.into(),
        }
    }
}

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeError")
            .field("recoverable", &self.recoverable)
            .field("error", &format_args!("{:#}", self.error))
            .finish()
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

impl std::error::Error for DecodeError {}

/// Decoder state machine plus the metadata describing its stream.
pub trait Source: Send {
    /// Playback volume derived from ReplayGain metadata.
    fn replay_gain(&self, mode: ReplayGainMode, prevent_clipping: bool) -> f64 {
        replaygain::volume(
            self.replay_gain_data().as_ref(),
            self.tags(),
            mode,
            prevent_clipping,
        )
    }

    /// Binary per-stream ReplayGain values, when the container carries them.
    fn replay_gain_data(&self) -> Option<ReplayGainData> {
        None
    }

    fn tags(&self) -> &Tags;

    fn stream_info(&self) -> StreamInfo;

    fn duration(&self) -> Duration;

    fn seek_to(&mut self, offset: Duration) -> Result<()>;

    /// Submit the next compressed unit to the decoder.
    ///
    /// Running out of input is not an error; it surfaces as
    /// [`ReceiveStatus::Eof`].
    fn decode(&mut self) -> Result<(), DecodeError>;

    fn receive_frame(&mut self) -> Result<ReceiveStatus>;

    /// Samples in the pending frame.
    fn frame_size(&self) -> usize;

    /// Presentation time of the pending frame.
    fn frame_start_time(&self) -> Duration;

    /// Append the pending frame to a fifo with the same stream info.
    fn copy_frame(&self, fifo: &mut Fifo) -> Result<()>;

    /// Convert the pending frame through `resampler` into `fifo`.
    fn resample_frame(&self, resampler: &mut Resampler, fifo: &mut Fifo) -> Result<()>;
}

/// Result of one [`decode_step`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Input was decoded and every ready frame was handed out.
    Decoded,
    /// Decoding failed but may be retried.
    Retry,
    /// End of stream or an unrecoverable error; the source is spent.
    Finished,
}

/// Run one decode cycle, passing each ready frame to `on_frame`.
///
/// Errors are logged here; callers only need the returned [`Step`].
pub fn decode_step<F>(source: &mut dyn Source, mut on_frame: F) -> Step
where
    F: FnMut(&dyn Source) -> Result<()>,
{
    if let Err(e) = source.decode() {
        if e.recoverable {
            tracing::warn!(error = %e, "failed to decode frame; retrying");
            return Step::Retry;
        }
        tracing::error!(error = %e, "failed to decode frame");
        return Step::Finished;
    }

    loop {
        match source.receive_frame() {
            Ok(ReceiveStatus::Empty) => return Step::Decoded,
            Ok(ReceiveStatus::Eof) => return Step::Finished,
            Ok(ReceiveStatus::CopyAndCallAgain) => {
                if let Err(e) = on_frame(&*source) {
                    tracing::error!(error = %format!("{e:#}"), "failed to copy frame to output");
                    return Step::Finished;
                }
            }
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "failed to receive frame");
                return Step::Finished;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory source shared by unit tests across the crate.

    use std::collections::VecDeque;

    use anyhow::bail;

    use super::*;
    use crate::format::{ChannelLayout, SampleFormat};

    /// One scripted `decode()` outcome.
    pub enum Script {
        /// Decode succeeds and yields one frame of `samples` with the given sample value.
        Frame { samples: usize, value: i16 },
        /// Decode fails.
        Fail { recoverable: bool },
    }

    pub struct ScriptedSource {
        info: StreamInfo,
        tags: Tags,
        gain_data: Option<ReplayGainData>,
        script: VecDeque<Script>,
        pending: Option<Vec<u8>>,
        ready: bool,
        position: u64,
        frame_start: u64,
    }

    impl ScriptedSource {
        pub fn s16_stereo(rate: u32) -> Self {
            Self {
                info: StreamInfo::new(rate, SampleFormat::S16, ChannelLayout::STEREO),
                tags: Tags::new(),
                gain_data: None,
                script: VecDeque::new(),
                pending: None,
                ready: false,
                position: 0,
                frame_start: 0,
            }
        }

        pub fn frames(mut self, count: usize, samples: usize, value: i16) -> Self {
            for _ in 0..count {
                self.script.push_back(Script::Frame { samples, value });
            }
            self
        }

        pub fn then(mut self, step: Script) -> Self {
            self.script.push_back(step);
            self
        }

        pub fn tag(mut self, key: &str, value: &str) -> Self {
            self.tags.insert(key.to_string(), value.to_string());
            self
        }

        pub fn gain_data(mut self, data: ReplayGainData) -> Self {
            self.gain_data = Some(data);
            self
        }

        pub fn total_samples(&self) -> u64 {
            self.script
                .iter()
                .map(|s| match s {
                    Script::Frame { samples, .. } => *samples as u64,
                    Script::Fail { .. } => 0,
                })
                .sum()
        }
    }

    impl Source for ScriptedSource {
        fn replay_gain_data(&self) -> Option<ReplayGainData> {
            self.gain_data
        }

        fn tags(&self) -> &Tags {
            &self.tags
        }

        fn stream_info(&self) -> StreamInfo {
            self.info
        }

        fn duration(&self) -> Duration {
            self.info.samples_to_duration(self.position + self.total_samples())
        }

        fn seek_to(&mut self, offset: Duration) -> Result<()> {
            let target = offset.as_millis() as u64 * self.info.sample_rate as u64 / 1000;
            while self.position < target {
                match self.script.pop_front() {
                    Some(Script::Frame { samples, .. }) => self.position += samples as u64,
                    Some(Script::Fail { .. }) => {}
                    None => break,
                }
            }
            Ok(())
        }

        fn decode(&mut self) -> Result<(), DecodeError> {
            match self.script.pop_front() {
                Some(Script::Frame { samples, value }) => {
                    let mut data = Vec::with_capacity(samples * 4);
                    for _ in 0..samples * 2 {
                        data.extend_from_slice(&value.to_le_bytes());
                    }
                    self.frame_start = self.position;
                    self.position += samples as u64;
                    self.pending = Some(data);
                    self.ready = true;
                    Ok(())
                }
                Some(Script::Fail { recoverable: true }) => {
                    Err(DecodeError::recoverable(anyhow::anyhow!("scripted glitch")))
                }
                Some(Script::Fail { recoverable: false }) => {
                    Err(DecodeError::fatal(anyhow::anyhow!("scripted failure")))
                }
                None => {
                    self.pending = None;
                    Ok(())
                }
            }
        }

        fn receive_frame(&mut self) -> Result<ReceiveStatus> {
            if self.ready {
                self.ready = false;
                return Ok(ReceiveStatus::CopyAndCallAgain);
            }
            if self.pending.is_none() && self.script.is_empty() {
                return Ok(ReceiveStatus::Eof);
            }
            Ok(ReceiveStatus::Empty)
        }

        fn frame_size(&self) -> usize {
            self.pending.as_ref().map_or(0, |d| d.len() / 4)
        }

        fn frame_start_time(&self) -> Duration {
            self.info.samples_to_duration(self.frame_start)
        }

        fn copy_frame(&self, fifo: &mut Fifo) -> Result<()> {
            let Some(data) = self.pending.as_ref() else {
                bail!("no pending frame");
            };
            fifo.write(data, data.len() / 4)
        }

        fn resample_frame(&self, resampler: &mut Resampler, fifo: &mut Fifo) -> Result<()> {
            let Some(data) = self.pending.as_ref() else {
                bail!("no pending frame");
            };
            resampler.convert(data, data.len() / 4, fifo)
        }
    }
}
