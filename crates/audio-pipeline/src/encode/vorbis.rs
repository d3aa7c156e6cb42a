//! Ogg Vorbis encoding via `vorbis_rs`.

use std::cell::RefCell;
use std::io::{self, Write};
use std::num::{NonZeroU8, NonZeroU32};
use std::rc::Rc;

use anyhow::{Context, Result, anyhow};
use vorbis_rs::{VorbisBitrateManagementStrategy, VorbisEncoderBuilder};

use super::{Encoder, SinkConfig};
use crate::format::{Frame, SampleFormat, StreamInfo};

pub const FRAME_SIZE: usize = 1024;

/// Serial number used for deterministic streams.
const FIXED_SERIAL: i32 = 0x6175_7265;

/// Page sink shared with the encoder so pages can be collected per frame.
#[derive(Clone, Default)]
struct PageBuffer(Rc<RefCell<Vec<u8>>>);

impl PageBuffer {
    fn move_into(&self, out: &mut Vec<u8>) {
        out.append(&mut self.0.borrow_mut());
    }
}

impl Write for PageBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) struct VorbisEncoder {
    info: StreamInfo,
    pages: PageBuffer,
    /// Taken when the stream is finished.
    inner: Option<vorbis_rs::VorbisEncoder<PageBuffer>>,
    planar: Vec<Vec<f32>>,
}

impl VorbisEncoder {
    pub(crate) fn new(config: &SinkConfig) -> Result<Self> {
        let info = StreamInfo::new(config.sample_rate, SampleFormat::F32, config.channel_layout);
        let rate =
            NonZeroU32::new(config.sample_rate).context("sample rate must be non-zero")?;
        let channels = u8::try_from(info.channels())
            .ok()
            .and_then(NonZeroU8::new)
            .context("unsupported channel count for vorbis")?;

        let pages = PageBuffer::default();
        let mut builder = VorbisEncoderBuilder::new(rate, channels, pages.clone())
            .map_err(|e| anyhow!("vorbis init: {e}"))?;
        if let Some(q) = config.quality.filter(|q| *q >= -1.0) {
            builder.bitrate_management_strategy(VorbisBitrateManagementStrategy::QualityVbr {
                target_quality: (q / 10.0).clamp(-0.1, 1.0),
            });
        } else if let Some(target_bitrate) = config.bit_rate.and_then(NonZeroU32::new) {
            builder.bitrate_management_strategy(VorbisBitrateManagementStrategy::Vbr {
                target_bitrate,
            });
        }
        if config.deterministic {
            builder.stream_serial(FIXED_SERIAL);
        }
        let inner = builder.build().map_err(|e| anyhow!("vorbis build: {e}"))?;

        Ok(Self {
            info,
            pages,
            inner: Some(inner),
            planar: vec![Vec::new(); info.channels()],
        })
    }
}

impl Encoder for VorbisEncoder {
    fn stream_info(&self) -> StreamInfo {
        self.info
    }

    fn frame_size(&self) -> usize {
        FRAME_SIZE
    }

    fn start(&mut self, out: &mut Vec<u8>) -> Result<()> {
        self.pages.move_into(out);
        Ok(())
    }

    fn encode(&mut self, frame: &Frame, out: &mut Vec<u8>) -> Result<bool> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(true);
        };
        let channels = self.planar.len();
        for plane in &mut self.planar {
            plane.clear();
        }
        for (i, bytes) in frame.data().chunks_exact(4).enumerate() {
            let value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            self.planar[i % channels].push(value.clamp(-1.0, 1.0));
        }
        inner
            .encode_audio_block(&self.planar)
            .map_err(|e| anyhow!("vorbis encode: {e}"))?;
        self.pages.move_into(out);
        Ok(false)
    }

    fn flush(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if let Some(inner) = self.inner.take() {
            inner.finish().map_err(|e| anyhow!("vorbis finish: {e}"))?;
        }
        self.pages.move_into(out);
        Ok(())
    }
}
