//! Format, channel layout, rate and volume conversion into a [`Fifo`].
//!
//! Samples are unpacked to `f32`, scaled by the configured volume, remixed to
//! the destination layout and, when the rates differ, pushed through Rubato's
//! sinc resampler. The result is packed into the destination sample format
//! and appended to the caller's fifo.
//!
//! ## Latency
//! Rubato works on fixed input chunks. Input that does not fill a chunk is
//! staged inside the converter and emitted by a later [`Resampler::convert`]
//! call. Every `convert` keeps processing until no complete chunk is left.
//! Whoever ends or replaces a source must call [`Resampler::flush`], which
//! emits the staged remainder and the filter delay.

use anyhow::{Context, Result, anyhow, bail};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler as _, SincInterpolationParameters,
    SincInterpolationType, WindowFunction, calculate_cutoff,
};

use crate::fifo::Fifo;
use crate::format::{ChannelLayout, SampleFormat, StreamInfo, speaker};

/// Input chunk size in samples for the sinc resampler.
const CHUNK_FRAMES: usize = 1024;

/// Upper bound on zero-input passes used to drain the resampler delay.
const MAX_FLUSH_ROUNDS: usize = 8;

/// Converting adapter between two stream layouts.
///
/// Must be configured with [`Resampler::setup`] before use. The scratch
/// output buffer only ever grows, so steady-state conversion does not
/// reallocate.
#[derive(Default)]
pub struct Resampler {
    conversion: Option<Conversion>,
    scratch: Vec<u8>,
}

struct Conversion {
    src: StreamInfo,
    dst: StreamInfo,
    volume: f32,
    /// `dst_channels x src_channels` gain matrix, row-major.
    mix: Vec<f32>,
    row: Vec<f32>,
    unpacked: Vec<f32>,
    rate: Option<RateConverter>,
}

impl Resampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the conversion from `src` to `dst`, applying a linear
    /// `volume` (1.0 leaves levels unchanged).
    ///
    /// Any staged samples from a previous configuration are discarded.
    pub fn setup(&mut self, src: StreamInfo, dst: StreamInfo, volume: f64) -> Result<()> {
        if src.sample_rate == 0 || dst.sample_rate == 0 {
            bail!("cannot convert {src} to {dst}: sample rate must be positive");
        }
        if !volume.is_finite() || volume < 0.0 {
            bail!("invalid volume {volume}");
        }

        let rate = if src.sample_rate == dst.sample_rate {
            None
        } else {
            Some(RateConverter::new(
                src.sample_rate,
                dst.sample_rate,
                dst.channels(),
            )?)
        };

        tracing::debug!(src = %src, dst = %dst, volume, "resampler configured");

        self.conversion = Some(Conversion {
            src,
            dst,
            volume: volume as f32,
            mix: mix_matrix(src.channel_layout, dst.channel_layout),
            row: vec![0.0; src.channels()],
            unpacked: Vec::new(),
            rate,
        });
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.conversion.is_some()
    }

    /// Source layout, once configured.
    pub fn src_info(&self) -> Option<StreamInfo> {
        self.conversion.as_ref().map(|c| c.src)
    }

    /// Destination layout, once configured.
    pub fn dst_info(&self) -> Option<StreamInfo> {
        self.conversion.as_ref().map(|c| c.dst)
    }

    /// Current scratch capacity in bytes.
    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }

    /// Convert `samples` packed source samples from `input` and append the
    /// result to `fifo`.
    pub fn convert(&mut self, input: &[u8], samples: usize, fifo: &mut Fifo) -> Result<()> {
        let conversion = self
            .conversion
            .as_mut()
            .context("resampler used before setup")?;
        if fifo.info() != conversion.dst {
            bail!(
                "fifo stream info {} does not match resampler output {}",
                fifo.info(),
                conversion.dst
            );
        }
        let bytes = samples * conversion.src.sample_bytes();
        if input.len() < bytes {
            bail!("input buffer holds fewer than {samples} samples");
        }

        let bound = conversion.output_bound(samples);
        grow(&mut self.scratch, bound * conversion.dst.sample_bytes());

        conversion.unpack(&input[..bytes]);
        let dst = conversion.dst;

        match conversion.rate.as_mut() {
            None => {
                write_packed(&mut self.scratch, dst, &conversion.unpacked, fifo)?;
            }
            Some(rate) => {
                rate.stage(&conversion.unpacked);
                while let Some(produced) = rate.process_ready()? {
                    if produced > 0 {
                        write_packed(&mut self.scratch, dst, rate.output(produced), fifo)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Emit everything still held by the rate converter and reset it.
    ///
    /// Call at the end of every source. A no-op when rates match.
    pub fn flush(&mut self, fifo: &mut Fifo) -> Result<()> {
        let conversion = self
            .conversion
            .as_mut()
            .context("resampler used before setup")?;
        let dst = conversion.dst;
        let Some(rate) = conversion.rate.as_mut() else {
            return Ok(());
        };

        let expected = rate.expected_frames();
        let mut staged = rate.staged_frames();
        for _ in 0..MAX_FLUSH_ROUNDS {
            if rate.frames_out >= expected {
                break;
            }
            let produced = rate.process(staged, Some(staged), Some(expected))?;
            staged = 0;
            if produced > 0 {
                grow(&mut self.scratch, produced * dst.sample_bytes());
                write_packed(&mut self.scratch, dst, rate.output(produced), fifo)?;
            }
        }
        rate.reset();
        Ok(())
    }
}

impl Conversion {
    /// Largest number of samples a conversion of `samples` inputs can emit.
    fn output_bound(&self, samples: usize) -> usize {
        match self.rate.as_ref() {
            None => samples,
            Some(rate) => {
                let staged = rate.staged_frames() + samples;
                let ratio = self.dst.sample_rate as f64 / self.src.sample_rate as f64;
                (staged as f64 * ratio).ceil() as usize + rate.max_output_frames()
            }
        }
    }

    /// Decode packed source samples into `unpacked`, scaled and remixed.
    fn unpack(&mut self, input: &[u8]) {
        let src_channels = self.src.channels();
        let dst_channels = self.dst.channels();
        let width = self.src.sample_format.bytes();

        self.unpacked.clear();
        self.unpacked
            .reserve(input.len() / (width * src_channels) * dst_channels);

        for sample in input.chunks_exact(width * src_channels) {
            for (slot, value) in self.row.iter_mut().zip(sample.chunks_exact(width)) {
                *slot = read_value(self.src.sample_format, value) * self.volume;
            }
            for gains in self.mix.chunks_exact(src_channels) {
                let mixed: f32 = gains.iter().zip(&self.row).map(|(g, v)| g * v).sum();
                self.unpacked.push(mixed);
            }
        }
    }
}

struct RateConverter {
    inner: Box<dyn rubato::Resampler<f32> + Send>,
    channels: usize,
    ratio: f64,
    staged: Vec<f32>,
    out: Vec<f32>,
    /// Leading delay frames still to be discarded.
    skip: usize,
    frames_in: u64,
    frames_out: u64,
}

impl RateConverter {
    fn new(src_rate: u32, dst_rate: u32, channels: usize) -> Result<Self> {
        let ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let inner = Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            CHUNK_FRAMES,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| anyhow!("resampler init error: {e}"))?;
        let skip = inner.output_delay();

        Ok(Self {
            inner: Box::new(inner),
            channels,
            ratio,
            staged: Vec::new(),
            out: Vec::new(),
            skip,
            frames_in: 0,
            frames_out: 0,
        })
    }

    fn stage(&mut self, interleaved: &[f32]) {
        self.staged.extend_from_slice(interleaved);
        self.frames_in += (interleaved.len() / self.channels) as u64;
    }

    fn staged_frames(&self) -> usize {
        self.staged.len() / self.channels
    }

    fn max_output_frames(&self) -> usize {
        self.inner.output_frames_max()
    }

    /// Output frames owed for all input staged so far.
    fn expected_frames(&self) -> u64 {
        (self.frames_in as f64 * self.ratio).round() as u64
    }

    /// Process one full chunk if enough input is staged.
    fn process_ready(&mut self) -> Result<Option<usize>> {
        let chunk = self.inner.input_frames_next();
        if self.staged_frames() < chunk {
            return Ok(None);
        }
        self.process(chunk, None, None).map(Some)
    }

    /// Run the resampler over the first `frames` staged frames.
    ///
    /// Returns how many frames of [`RateConverter::output`] are valid after
    /// trimming the leading delay and, if given, capping the running total at
    /// `limit`.
    fn process(
        &mut self,
        frames: usize,
        partial_len: Option<usize>,
        limit: Option<u64>,
    ) -> Result<usize> {
        let channels = self.channels;
        let max_out = self.inner.output_frames_max();
        grow(&mut self.out, max_out * channels);

        let input = InterleavedSlice::new(&self.staged[..frames * channels], channels, frames)
            .map_err(|e| anyhow!("interleaved slice (input) error: {e}"))?;
        let mut output =
            InterleavedSlice::new_mut(&mut self.out[..max_out * channels], channels, max_out)
                .map_err(|e| anyhow!("interleaved slice (output) error: {e}"))?;
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };
        let (_consumed, produced) = self
            .inner
            .process_into_buffer(&input, &mut output, Some(&indexing))
            .map_err(|e| anyhow!("resampler process error: {e}"))?;
        self.staged.drain(..frames * channels);

        let skipped = self.skip.min(produced);
        self.skip -= skipped;
        let mut kept = produced - skipped;
        if let Some(limit) = limit {
            kept = kept.min(limit.saturating_sub(self.frames_out) as usize);
        }
        if skipped > 0 && kept > 0 {
            self.out
                .copy_within(skipped * channels..(skipped + kept) * channels, 0);
        }
        self.frames_out += kept as u64;
        Ok(kept)
    }

    fn output(&self, frames: usize) -> &[f32] {
        &self.out[..frames * self.channels]
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.skip = self.inner.output_delay();
        self.staged.clear();
        self.frames_in = 0;
        self.frames_out = 0;
    }
}

/// Grow `buf` to at least `len` elements; never shrinks.
fn grow<T: Default + Clone>(buf: &mut Vec<T>, len: usize) {
    if buf.len() < len {
        buf.resize(len, T::default());
    }
}

fn write_packed(scratch: &mut Vec<u8>, dst: StreamInfo, values: &[f32], fifo: &mut Fifo) -> Result<()> {
    let samples = values.len() / dst.channels();
    let bytes = samples * dst.sample_bytes();
    grow(scratch, bytes);
    pack_values(dst.sample_format, values, &mut scratch[..bytes]);
    fifo.write(&scratch[..bytes], samples)
}

fn read_value(format: SampleFormat, bytes: &[u8]) -> f32 {
    match format {
        SampleFormat::U8 => (bytes[0] as f32 - 128.0) / 128.0,
        SampleFormat::S16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32_768.0,
        SampleFormat::S32 => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        SampleFormat::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        SampleFormat::F64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            f64::from_le_bytes(raw) as f32
        }
    }
}

fn pack_values(format: SampleFormat, values: &[f32], out: &mut [u8]) {
    let width = format.bytes();
    for (value, slot) in values.iter().zip(out.chunks_exact_mut(width)) {
        match format {
            SampleFormat::U8 => {
                slot[0] = (value * 128.0 + 128.0).round().clamp(0.0, 255.0) as u8;
            }
            SampleFormat::S16 => {
                let v = (value * 32_768.0).round().clamp(-32_768.0, 32_767.0) as i16;
                slot.copy_from_slice(&v.to_le_bytes());
            }
            SampleFormat::S32 => {
                let v = (*value as f64 * 2_147_483_648.0)
                    .round()
                    .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32;
                slot.copy_from_slice(&v.to_le_bytes());
            }
            SampleFormat::F32 => slot.copy_from_slice(&value.to_le_bytes()),
            SampleFormat::F64 => slot.copy_from_slice(&(*value as f64).to_le_bytes()),
        }
    }
}

/// Gain matrix mapping `src` channels onto `dst` channels.
fn mix_matrix(src: ChannelLayout, dst: ChannelLayout) -> Vec<f32> {
    let (s, d) = (src.channels(), dst.channels());
    let mut matrix = vec![0.0f32; s * d];

    if s == d {
        for c in 0..s {
            matrix[c * s + c] = 1.0;
        }
    } else if d == 1 {
        matrix.iter_mut().for_each(|g| *g = 1.0 / s as f32);
    } else if s == 1 {
        matrix.iter_mut().for_each(|g| *g = 1.0);
    } else if dst == ChannelLayout::STEREO && src.mask() != 0 {
        let bits = (0..64u32)
            .map(|b| 1u64 << b)
            .filter(|bit| src.mask() & bit != 0);
        for (c, bit) in bits.enumerate() {
            let (left, right) = stereo_gains(bit);
            matrix[c] = left;
            matrix[s + c] = right;
        }
        for row in matrix.chunks_exact_mut(s) {
            let total: f32 = row.iter().sum();
            if total > 0.0 {
                row.iter_mut().for_each(|g| *g /= total);
            }
        }
    } else {
        for c in 0..s.min(d) {
            matrix[c * s + c] = 1.0;
        }
    }
    matrix
}

fn stereo_gains(bit: u64) -> (f32, f32) {
    const CENTER: f32 = std::f32::consts::FRAC_1_SQRT_2;
    match bit {
        speaker::FRONT_LEFT
        | speaker::FRONT_LEFT_OF_CENTER
        | speaker::BACK_LEFT
        | speaker::SIDE_LEFT => (1.0, 0.0),
        speaker::FRONT_RIGHT
        | speaker::FRONT_RIGHT_OF_CENTER
        | speaker::BACK_RIGHT
        | speaker::SIDE_RIGHT => (0.0, 1.0),
        speaker::FRONT_CENTER | speaker::BACK_CENTER => (CENTER, CENTER),
        _ => (0.0, 0.0),
    }
}
