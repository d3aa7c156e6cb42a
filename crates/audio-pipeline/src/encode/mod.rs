//! Encode-side capability set.
//!
//! A [`Sink`] accepts fixed-size [`Frame`]s and accumulates encoded bytes in
//! an internal buffer. Callers copy bytes out with [`Sink::buffer`] and
//! release exactly what they wrote with [`Sink::drain`].
//!
//! Stream end is signalled by encoding an empty frame, which flushes the
//! codec, followed by [`Sink::write_trailer`]. [`finish`] does both.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};

use crate::format::{ChannelLayout, Frame, SampleFormat, StreamInfo};

#[cfg(feature = "flac")]
mod flac;
#[cfg(feature = "mp3")]
mod mp3;
#[cfg(feature = "vorbis")]
mod vorbis;
pub mod wav;

/// Output codec of a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Codec {
    Mp3,
    Vorbis,
    Flac,
    #[default]
    Wav,
}

impl Codec {
    pub fn mime_type(self) -> &'static str {
        match self {
            Codec::Mp3 => "audio/mp3",
            Codec::Vorbis => "audio/ogg",
            Codec::Flac => "audio/flac",
            Codec::Wav => "audio/wav",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::Mp3 => "mp3",
            Codec::Vorbis => "vorbis",
            Codec::Flac => "flac",
            Codec::Wav => "wav",
        }
    }
}

impl FromStr for Codec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mp3" => Ok(Codec::Mp3),
            "vorbis" => Ok(Codec::Vorbis),
            "flac" => Ok(Codec::Flac),
            "wav" => Ok(Codec::Wav),
            other => bail!("unknown codec: {other}"),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Requested output parameters.
///
/// Codecs adjust the sample format and channel layout to what they can
/// encode; the resolved layout is reported by [`Sink::stream_info`].
#[derive(Clone, Debug, PartialEq)]
pub struct SinkConfig {
    pub codec: Codec,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
    pub channel_layout: ChannelLayout,
    /// Codec-specific quality; overrides `bit_rate` when set.
    pub quality: Option<f32>,
    /// Target bit rate in bits per second.
    pub bit_rate: Option<u32>,
    /// Produce output that depends only on the input samples.
    pub deterministic: bool,
}

impl SinkConfig {
    /// Config that keeps the layout of `info`.
    pub fn for_stream(codec: Codec, info: StreamInfo) -> Self {
        Self {
            codec,
            sample_rate: info.sample_rate,
            sample_format: info.sample_format,
            channel_layout: info.channel_layout,
            quality: None,
            bit_rate: None,
            deterministic: false,
        }
    }
}

/// Encoder state machine plus its output buffer.
pub trait Sink {
    fn stream_info(&self) -> StreamInfo;

    /// Preferred number of samples per encoded frame.
    fn frame_size(&self) -> usize;

    /// Encode `frame`, consuming it.
    ///
    /// An empty frame flushes the codec. Returns `true` once the encoder has
    /// reached end of stream, after which further calls are errors.
    fn encode(&mut self, frame: Frame) -> Result<bool>;

    /// Finalize the container. Only valid after the flush.
    fn write_trailer(&mut self) -> Result<()>;

    /// Encoded bytes not yet drained.
    fn buffer(&self) -> &[u8];

    /// Discard the first `bytes` encoded bytes.
    fn drain(&mut self, bytes: usize);
}

/// Flush `sink` and write its trailer.
pub fn finish(sink: &mut dyn Sink) -> Result<()> {
    let info = sink.stream_info();
    if !sink.encode(Frame::empty(info))? {
        bail!("encoder did not reach end of stream after flush");
    }
    sink.write_trailer()
}

/// Open a sink for `config`.
pub fn new_sink(config: &SinkConfig) -> Result<Box<dyn Sink>> {
    if config.sample_rate == 0 {
        bail!("sample rate must be positive");
    }
    let sink: Box<dyn Sink> = match config.codec {
        Codec::Wav => Box::new(BufferSink::new(wav::WavEncoder::new(config))),
        #[cfg(feature = "mp3")]
        Codec::Mp3 => Box::new(BufferSink::new(mp3::Mp3Encoder::new(config)?)),
        #[cfg(feature = "vorbis")]
        Codec::Vorbis => Box::new(BufferSink::new(vorbis::VorbisEncoder::new(config)?)),
        #[cfg(feature = "flac")]
        Codec::Flac => Box::new(BufferSink::new(flac::FlacEncoder::new(config)?)),
        #[allow(unreachable_patterns)]
        other => bail!("codec {other} is not compiled in"),
    };
    tracing::debug!(
        codec = %config.codec,
        stream = %sink.stream_info(),
        frame_size = sink.frame_size(),
        "sink created"
    );
    Ok(sink)
}

/// Codec backend driven by [`BufferSink`].
pub(crate) trait Encoder {
    fn stream_info(&self) -> StreamInfo;

    fn frame_size(&self) -> usize;

    /// Emit container headers.
    fn start(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    /// Encode one non-empty frame. Returns `true` if the codec closed the stream.
    fn encode(&mut self, frame: &Frame, out: &mut Vec<u8>) -> Result<bool>;

    /// Drain delayed output at end of stream.
    fn flush(&mut self, out: &mut Vec<u8>) -> Result<()>;

    fn trailer(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SinkState {
    Encoding,
    Flushed,
    Finished,
}

/// Generic [`Sink`] enforcing the encode protocol around an [`Encoder`].
pub(crate) struct BufferSink<E> {
    encoder: E,
    buffer: Vec<u8>,
    state: SinkState,
    started: bool,
}

impl<E: Encoder> BufferSink<E> {
    pub(crate) fn new(encoder: E) -> Self {
        Self {
            encoder,
            buffer: Vec::new(),
            state: SinkState::Encoding,
            started: false,
        }
    }

    fn ensure_started(&mut self) -> Result<()> {
        if !self.started {
            self.started = true;
            self.encoder.start(&mut self.buffer)?;
        }
        Ok(())
    }
}

impl<E: Encoder> Sink for BufferSink<E> {
    fn stream_info(&self) -> StreamInfo {
        self.encoder.stream_info()
    }

    fn frame_size(&self) -> usize {
        self.encoder.frame_size()
    }

    fn encode(&mut self, frame: Frame) -> Result<bool> {
        if self.state != SinkState::Encoding {
            bail!("encode after done");
        }
        let info = self.encoder.stream_info();
        if frame.info() != info {
            bail!(
                "frame stream info {} does not match sink {}",
                frame.info(),
                info
            );
        }
        self.ensure_started()?;

        if frame.is_empty() {
            self.encoder.flush(&mut self.buffer)?;
            self.state = SinkState::Flushed;
            return Ok(true);
        }
        if self.encoder.encode(&frame, &mut self.buffer)? {
            self.state = SinkState::Flushed;
            bail!("unexpected EOF from encoder");
        }
        Ok(false)
    }

    fn write_trailer(&mut self) -> Result<()> {
        match self.state {
            SinkState::Encoding => bail!("trailer written before flush"),
            SinkState::Finished => bail!("trailer already written"),
            SinkState::Flushed => {}
        }
        self.encoder.trailer(&mut self.buffer)?;
        self.state = SinkState::Finished;
        Ok(())
    }

    fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    fn drain(&mut self, bytes: usize) {
        let bytes = bytes.min(self.buffer.len());
        self.buffer.drain(..bytes);
    }
}

/// Split packed frame bytes into little-endian `i16` values.
#[cfg(any(feature = "mp3", feature = "flac"))]
pub(crate) fn s16_values(frame: &Frame) -> impl Iterator<Item = i16> + '_ {
    frame
        .data()
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16_stereo() -> StreamInfo {
        StreamInfo::new(8_000, SampleFormat::S16, ChannelLayout::STEREO)
    }

    /// Echoes frame bytes; closes the stream after `limit` frames.
    struct EchoEncoder {
        frames: usize,
        limit: usize,
    }

    impl Encoder for EchoEncoder {
        fn stream_info(&self) -> StreamInfo {
            s16_stereo()
        }

        fn frame_size(&self) -> usize {
            4
        }

        fn start(&mut self, out: &mut Vec<u8>) -> Result<()> {
            out.extend_from_slice(b"HDR");
            Ok(())
        }

        fn encode(&mut self, frame: &Frame, out: &mut Vec<u8>) -> Result<bool> {
            out.extend_from_slice(frame.data());
            self.frames += 1;
            Ok(self.frames >= self.limit)
        }

        fn flush(&mut self, out: &mut Vec<u8>) -> Result<()> {
            out.push(b'F');
            Ok(())
        }

        fn trailer(&mut self, out: &mut Vec<u8>) -> Result<()> {
            out.push(b'T');
            Ok(())
        }
    }

    fn echo(limit: usize) -> BufferSink<EchoEncoder> {
        BufferSink::new(EchoEncoder { frames: 0, limit })
    }

    fn frame(samples: usize) -> Frame {
        Frame::new(s16_stereo(), vec![7; samples * 4]).unwrap()
    }

    #[test]
    fn codec_names_and_mime_types() {
        assert_eq!("vorbis".parse::<Codec>().unwrap().mime_type(), "audio/ogg");
        assert_eq!("wav".parse::<Codec>().unwrap(), Codec::Wav);
        assert_eq!(Codec::Mp3.mime_type(), "audio/mp3");
        assert!("aac".parse::<Codec>().is_err());
    }

    #[test]
    fn protocol_flush_then_trailer() {
        let mut sink = echo(usize::MAX);
        assert!(!sink.encode(frame(1)).unwrap());
        assert!(sink.write_trailer().is_err());
        finish(&mut sink).unwrap();
        assert_eq!(sink.buffer(), b"HDR\x07\x07\x07\x07FT");
        assert!(sink.encode(frame(1)).is_err());
        assert!(sink.write_trailer().is_err());
    }

    #[test]
    fn drain_removes_exactly_the_written_prefix() {
        let mut sink = echo(usize::MAX);
        sink.encode(frame(2)).unwrap();
        let total = sink.buffer().len();
        sink.drain(5);
        assert_eq!(sink.buffer().len(), total - 5);
        sink.drain(usize::MAX);
        assert!(sink.buffer().is_empty());
    }

    #[test]
    fn early_end_of_stream_is_an_error() {
        let mut sink = echo(1);
        let err = sink.encode(frame(1)).unwrap_err();
        assert!(err.to_string().contains("unexpected EOF"));
        assert!(sink.encode(Frame::empty(s16_stereo())).is_err());
    }

    #[test]
    fn mismatched_frame_is_rejected() {
        let mut sink = echo(usize::MAX);
        let other = StreamInfo::new(44_100, SampleFormat::S16, ChannelLayout::STEREO);
        assert!(sink.encode(Frame::empty(other)).is_err());
    }

    #[test]
    fn wav_sink_is_always_available() {
        let info = StreamInfo::new(22_050, SampleFormat::F32, ChannelLayout::MONO);
        let sink = new_sink(&SinkConfig::for_stream(Codec::Wav, info)).unwrap();
        assert_eq!(sink.stream_info().sample_format, SampleFormat::S16);
        assert_eq!(sink.stream_info().sample_rate, 22_050);
        assert_eq!(sink.frame_size(), wav::FRAME_SIZE);
        assert!(sink.buffer().is_empty());
    }
}
