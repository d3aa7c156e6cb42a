//! File-backed [`Source`] built on Symphonia.
//!
//! Symphonia is used to:
//! - probe the container and pick the default audio track
//! - read packets and decode them one at a time on demand
//! - convert decoded buffers into packed little-endian PCM in the track's
//!   native [`StreamInfo`]

use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::conv::ConvertibleSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::Hint;
use symphonia::core::sample::SampleFormat as SymphoniaFormat;
use symphonia::core::units::Time;

use crate::fifo::Fifo;
use crate::format::{ChannelLayout, SampleFormat, StreamInfo};
use crate::replaygain::{self, ReplayGainData};
use crate::resample::Resampler;
use crate::source::{DecodeError, ReceiveStatus, Source, Tags};

/// Decoder state for one audio file.
pub struct FileSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    params: CodecParameters,
    info: StreamInfo,
    tags: Tags,
    replay_gain: Option<ReplayGainData>,
    duration: Duration,
    /// Packed samples of the pending frame.
    pending: Vec<u8>,
    pending_samples: usize,
    pending_start: Duration,
    ready: bool,
    eof: bool,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .with_context(|| format!("probe {:?}", path))?;

        let mut tags = Tags::new();
        let mut replay_gain = ReplayGainData::default();
        if let Some(revision) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            collect_tags(revision, &mut tags);
            collect_replay_gain(revision, &mut replay_gain);
        }
        let mut format = probed.format;
        if let Some(revision) = format.metadata().current() {
            collect_tags(revision, &mut tags);
            collect_replay_gain(revision, &mut replay_gain);
        }

        let track = format
            .default_track()
            .ok_or_else(|| anyhow!("No default audio track"))?;
        let track_id = track.id;
        let params = track.codec_params.clone();
        let info = stream_info_from_params(&params)?;
        let duration = duration_from_codec_params(&params).unwrap_or_default();

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .with_context(|| format!("create decoder for {:?}", path))?;

        tracing::debug!(
            path = %path.display(),
            codec = codec_name_from_params(&params).unwrap_or("unknown"),
            stream = %info,
            duration_ms = duration.as_millis() as u64,
            "source opened"
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            params,
            info,
            tags,
            replay_gain: (!replay_gain.is_empty()).then_some(replay_gain),
            duration,
            pending: Vec::new(),
            pending_samples: 0,
            pending_start: Duration::ZERO,
            ready: false,
            eof: false,
        })
    }

    fn timestamp_to_duration(&self, ts: u64) -> Duration {
        match self.params.time_base {
            Some(tb) => {
                let time = tb.calc_time(ts);
                Duration::from_secs(time.seconds) + Duration::from_secs_f64(time.frac)
            }
            None => self.info.samples_to_duration(ts),
        }
    }

    fn pending_bytes(&self) -> Result<&[u8]> {
        if self.pending_samples == 0 {
            bail!("no pending frame");
        }
        Ok(&self.pending)
    }
}

impl Source for FileSource {
    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn replay_gain_data(&self) -> Option<ReplayGainData> {
        self.replay_gain
    }

    fn stream_info(&self) -> StreamInfo {
        self.info
    }

    fn duration(&self) -> Duration {
        self.duration
    }

    fn seek_to(&mut self, offset: Duration) -> Result<()> {
        let time = Time::new(offset.as_secs(), offset.subsec_nanos() as f64 / 1e9);
        self.format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .with_context(|| format!("seek to {offset:?}"))?;
        self.decoder.reset();
        self.pending.clear();
        self.pending_samples = 0;
        self.ready = false;
        self.eof = false;
        Ok(())
    }

    fn decode(&mut self) -> Result<(), DecodeError> {
        if self.eof {
            return Ok(());
        }

        let packet = loop {
            match self.format.next_packet() {
                Ok(packet) if packet.track_id() == self.track_id => break packet,
                Ok(_) => continue,
                Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    self.eof = true;
                    return Ok(());
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    return Err(DecodeError::recoverable(anyhow!("decoder reset required")));
                }
                Err(e) => {
                    return Err(DecodeError::fatal(
                        anyhow::Error::new(e).context("read packet"),
                    ));
                }
            }
        };

        let start = self.timestamp_to_duration(packet.ts());
        match self.decoder.decode(&packet) {
            Ok(decoded) => {
                if decoded.frames() == 0 {
                    return Ok(());
                }
                self.pending_samples =
                    store(decoded, self.info, &mut self.pending).map_err(DecodeError::fatal)?;
                self.pending_start = start;
                self.ready = true;
                Ok(())
            }
            Err(SymphoniaError::DecodeError(msg)) => {
                Err(DecodeError::recoverable(anyhow!("corrupt packet: {msg}")))
            }
            Err(SymphoniaError::IoError(e)) => Err(DecodeError::recoverable(e)),
            Err(SymphoniaError::ResetRequired) => {
                self.decoder.reset();
                Err(DecodeError::recoverable(anyhow!("decoder reset required")))
            }
            Err(e) => Err(DecodeError::fatal(anyhow::Error::new(e).context("decode packet"))),
        }
    }

    fn receive_frame(&mut self) -> Result<ReceiveStatus> {
        if self.ready {
            self.ready = false;
            return Ok(ReceiveStatus::CopyAndCallAgain);
        }
        if self.eof {
            return Ok(ReceiveStatus::Eof);
        }
        Ok(ReceiveStatus::Empty)
    }

    fn frame_size(&self) -> usize {
        self.pending_samples
    }

    fn frame_start_time(&self) -> Duration {
        self.pending_start
    }

    fn copy_frame(&self, fifo: &mut Fifo) -> Result<()> {
        if fifo.info() != self.info {
            bail!(
                "fifo stream info {} does not match source {}",
                fifo.info(),
                self.info
            );
        }
        fifo.write(self.pending_bytes()?, self.pending_samples)
    }

    fn resample_frame(&self, resampler: &mut Resampler, fifo: &mut Fifo) -> Result<()> {
        resampler.convert(self.pending_bytes()?, self.pending_samples, fifo)
    }
}

/// Replace `out` with the packed samples of `decoded`, returning the sample count.
fn store(decoded: AudioBufferRef<'_>, info: StreamInfo, out: &mut Vec<u8>) -> Result<usize> {
    let channels = decoded.spec().channels.count();
    if channels != info.channels() {
        bail!("decoded {channels} channels, stream declares {}", info.channels());
    }
    let samples = decoded.frames();
    out.clear();
    match info.sample_format {
        SampleFormat::U8 => pack(decoded, out, |v: u8| [v]),
        SampleFormat::S16 => pack(decoded, out, i16::to_le_bytes),
        SampleFormat::S32 => pack(decoded, out, i32::to_le_bytes),
        SampleFormat::F32 => pack(decoded, out, f32::to_le_bytes),
        SampleFormat::F64 => pack(decoded, out, f64::to_le_bytes),
    }
    Ok(samples)
}

fn pack<S, const N: usize>(decoded: AudioBufferRef<'_>, out: &mut Vec<u8>, to_bytes: fn(S) -> [u8; N])
where
    S: ConvertibleSample,
{
    let mut buf = SampleBuffer::<S>::new(decoded.frames() as u64, *decoded.spec());
    buf.copy_interleaved_ref(decoded);
    out.reserve(buf.samples().len() * N);
    for value in buf.samples() {
        out.extend_from_slice(&to_bytes(*value));
    }
}

/// Packed format matching the codec's native precision.
///
/// 24-bit integer audio is promoted to `s32`; lossy codecs decode to float.
fn sample_format_from_params(params: &CodecParameters) -> SampleFormat {
    match params.sample_format {
        Some(SymphoniaFormat::U8 | SymphoniaFormat::S8) => SampleFormat::U8,
        Some(SymphoniaFormat::U16 | SymphoniaFormat::S16) => SampleFormat::S16,
        Some(
            SymphoniaFormat::U24
            | SymphoniaFormat::S24
            | SymphoniaFormat::U32
            | SymphoniaFormat::S32,
        ) => SampleFormat::S32,
        Some(SymphoniaFormat::F32) => SampleFormat::F32,
        Some(SymphoniaFormat::F64) => SampleFormat::F64,
        None => match params.bits_per_sample {
            Some(bits) if bits <= 8 => SampleFormat::U8,
            Some(bits) if bits <= 16 => SampleFormat::S16,
            Some(_) => SampleFormat::S32,
            None => SampleFormat::F32,
        },
    }
}

fn stream_info_from_params(params: &CodecParameters) -> Result<StreamInfo> {
    let rate = params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    let channels = params
        .channels
        .ok_or_else(|| anyhow!("Unknown channels"))?;
    let layout = match ChannelLayout::from_mask(channels.bits() as u64) {
        Ok(layout) => layout,
        Err(_) => ChannelLayout::with_channels(channels.count())?,
    };
    Ok(StreamInfo::new(rate, sample_format_from_params(params), layout))
}

/// Best-effort duration from codec metadata.
///
/// Returns `None` if the container does not provide total frames or sample rate.
fn duration_from_codec_params(params: &CodecParameters) -> Option<Duration> {
    let frames = params.n_frames?;
    if let Some(tb) = params.time_base {
        let time = tb.calc_time(frames);
        return Some(Duration::from_secs(time.seconds) + Duration::from_secs_f64(time.frac));
    }
    let rate = params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(Duration::from_millis(frames.saturating_mul(1000) / rate))
}

/// Best-effort codec label for logs.
fn codec_name_from_params(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "flac",
        CODEC_TYPE_MP3 => "mp3",
        CODEC_TYPE_AAC => "aac",
        CODEC_TYPE_ALAC => "alac",
        CODEC_TYPE_VORBIS => "vorbis",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "pcm_s16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "pcm_s24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "pcm_s32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "pcm_f32",
        _ => return None,
    };
    Some(name)
}

/// Copy a metadata revision into `tags`, keyed by lowercased names.
fn collect_tags(revision: &MetadataRevision, tags: &mut Tags) {
    for tag in revision.tags() {
        let key = match tag.std_key.and_then(standard_tag_name) {
            Some(name) => name.to_string(),
            None => tag.key.to_ascii_lowercase(),
        };
        tags.insert(key, tag.value.to_string());
    }
}

/// Fill ReplayGain values from the tags the demuxer recognised as such.
fn collect_replay_gain(revision: &MetadataRevision, data: &mut ReplayGainData) {
    for tag in revision.tags() {
        let value = tag.value.to_string();
        match tag.std_key {
            Some(StandardTagKey::ReplayGainTrackGain) => {
                data.track_gain = replaygain::gain_units(&value).or(data.track_gain);
            }
            Some(StandardTagKey::ReplayGainTrackPeak) => {
                data.track_peak = replaygain::peak_units(&value).or(data.track_peak);
            }
            Some(StandardTagKey::ReplayGainAlbumGain) => {
                data.album_gain = replaygain::gain_units(&value).or(data.album_gain);
            }
            Some(StandardTagKey::ReplayGainAlbumPeak) => {
                data.album_peak = replaygain::peak_units(&value).or(data.album_peak);
            }
            _ => {}
        }
    }
}

fn standard_tag_name(key: StandardTagKey) -> Option<&'static str> {
    let name = match key {
        StandardTagKey::TrackTitle => "title",
        StandardTagKey::Artist => "artist",
        StandardTagKey::Album => "album",
        StandardTagKey::AlbumArtist => "album_artist",
        StandardTagKey::TrackNumber => "track",
        StandardTagKey::DiscNumber => "disc",
        StandardTagKey::Date => "date",
        StandardTagKey::Genre => "genre",
        StandardTagKey::Composer => "composer",
        StandardTagKey::ReplayGainTrackGain => "replaygain_track_gain",
        StandardTagKey::ReplayGainTrackPeak => "replaygain_track_peak",
        StandardTagKey::ReplayGainAlbumGain => "replaygain_album_gain",
        StandardTagKey::ReplayGainAlbumPeak => "replaygain_album_peak",
        _ => return None,
    };
    Some(name)
}
