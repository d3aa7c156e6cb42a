//! Time-windowed sub-tracks of a larger file.
//!
//! A fragment is described by a text file named `<basefile>.<index>.txt`
//! placed next to the base file:
//!
//! ```text
//! start 1m30s
//! end 4m12.5s
//! title Second movement
//! ```
//!
//! Every field is optional. [`Fragment`] wraps the base file's [`Source`]
//! and hides everything outside `[start, end)`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use crate::decode::FileSource;
use crate::duration::parse_duration;
use crate::fifo::Fifo;
use crate::format::StreamInfo;
use crate::replaygain::ReplayGainData;
use crate::resample::Resampler;
use crate::source::{DecodeError, ReceiveStatus, Source, Tags};

/// Failure to open a playable item.
pub enum FragmentError {
    /// The fragment descriptor is malformed or describes an empty window.
    Invalid(anyhow::Error),
    /// The file or its base could not be read or decoded.
    Open(anyhow::Error),
}

impl fmt::Debug for FragmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FragmentError::Invalid(e) => write!(f, "Invalid({e:#})"),
            FragmentError::Open(e) => write!(f, "Open({e:#})"),
        }
    }
}

impl fmt::Display for FragmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FragmentError::Invalid(e) => write!(f, "invalid fragment: {e:#}"),
            FragmentError::Open(e) => write!(f, "cannot open: {e:#}"),
        }
    }
}

impl std::error::Error for FragmentError {}

/// Split a descriptor file name into its base file name and index.
///
/// Matches `<base>.<digits>.txt`, case-insensitively on the extension.
pub fn parse_fragment_name(file_name: &str) -> Option<(&str, u32)> {
    let split = file_name.len().checked_sub(4)?;
    if !file_name.is_char_boundary(split) || !file_name[split..].eq_ignore_ascii_case(".txt") {
        return None;
    }
    let stem = &file_name[..split];
    let (base, index) = stem.rsplit_once('.')?;
    if base.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((base, index.parse().ok()?))
}

/// Parsed contents of a fragment descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FragmentDescriptor {
    pub start: Option<Duration>,
    pub end: Option<Duration>,
    pub artist: Option<String>,
    pub title: Option<String>,
}

impl FragmentDescriptor {
    pub fn parse(text: &str) -> Result<Self> {
        let mut descriptor = Self::default();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (field, value) = line
                .split_once(char::is_whitespace)
                .map(|(f, v)| (f, v.trim()))
                .ok_or_else(|| anyhow!("line {}: missing value", number + 1))?;
            match field {
                "start" => {
                    descriptor.start = Some(
                        parse_duration(value).with_context(|| format!("line {}", number + 1))?,
                    )
                }
                "end" => {
                    descriptor.end = Some(
                        parse_duration(value).with_context(|| format!("line {}", number + 1))?,
                    )
                }
                "artist" => descriptor.artist = Some(value.to_string()),
                "title" => descriptor.title = Some(value.to_string()),
                other => bail!("line {}: unknown field {other:?}", number + 1),
            }
        }
        Ok(descriptor)
    }
}

/// A [`Source`] restricted to `[start, end)` of an inner source.
///
/// Only `duration`, `seek_to` and `receive_frame` behave differently from
/// the inner source; everything else is forwarded.
pub struct Fragment {
    inner: Box<dyn Source>,
    start: Duration,
    end: Duration,
    tags: Tags,
    eof: bool,
}

impl Fragment {
    /// Window `inner` according to `descriptor`.
    ///
    /// Bounds are clamped to the inner duration first; an empty or inverted
    /// window is rejected rather than repaired.
    pub fn new(
        mut inner: Box<dyn Source>,
        descriptor: &FragmentDescriptor,
        index: u32,
    ) -> Result<Self> {
        let total = inner.duration();
        let start = descriptor.start.unwrap_or(Duration::ZERO).min(total);
        let end = descriptor.end.unwrap_or(total).min(total);
        if start >= end {
            bail!("fragment start {start:?} is not before end {end:?}");
        }

        let mut tags = inner.tags().clone();
        let track = match tags.get("track") {
            Some(track) => format!("{track}.{index}"),
            None => index.to_string(),
        };
        tags.insert("track".to_string(), track);
        if let Some(artist) = &descriptor.artist {
            tags.insert("artist".to_string(), artist.clone());
        }
        if let Some(title) = &descriptor.title {
            tags.insert("title".to_string(), title.clone());
        }

        if start > Duration::ZERO {
            inner.seek_to(start)?;
        }

        Ok(Self {
            inner,
            start,
            end,
            tags,
            eof: false,
        })
    }

    pub fn start(&self) -> Duration {
        self.start
    }

    pub fn end(&self) -> Duration {
        self.end
    }
}

impl Source for Fragment {
    fn replay_gain_data(&self) -> Option<ReplayGainData> {
        self.inner.replay_gain_data()
    }

    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn stream_info(&self) -> StreamInfo {
        self.inner.stream_info()
    }

    fn duration(&self) -> Duration {
        self.end - self.start
    }

    fn seek_to(&mut self, offset: Duration) -> Result<()> {
        let target = (offset + self.start).min(self.end);
        self.inner.seek_to(target)?;
        self.eof = false;
        Ok(())
    }

    fn decode(&mut self) -> Result<(), DecodeError> {
        if self.eof {
            return Ok(());
        }
        self.inner.decode()
    }

    fn receive_frame(&mut self) -> Result<ReceiveStatus> {
        if self.eof {
            return Ok(ReceiveStatus::Eof);
        }
        let status = self.inner.receive_frame()?;
        if status == ReceiveStatus::CopyAndCallAgain && self.inner.frame_start_time() >= self.end {
            self.eof = true;
            return Ok(ReceiveStatus::Eof);
        }
        Ok(status)
    }

    fn frame_size(&self) -> usize {
        self.inner.frame_size()
    }

    fn frame_start_time(&self) -> Duration {
        self.inner.frame_start_time()
    }

    fn copy_frame(&self, fifo: &mut Fifo) -> Result<()> {
        self.inner.copy_frame(fifo)
    }

    fn resample_frame(&self, resampler: &mut Resampler, fifo: &mut Fifo) -> Result<()> {
        self.inner.resample_frame(resampler, fifo)
    }
}

/// Open `path` as a playable source.
///
/// Files named like fragment descriptors become a [`Fragment`] of their
/// base file; anything else is decoded directly.
pub fn open_source(path: &Path) -> Result<Box<dyn Source>, FragmentError> {
    let fragment = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(parse_fragment_name);

    let Some((base_name, index)) = fragment else {
        let source = FileSource::open(path).map_err(FragmentError::Open)?;
        return Ok(Box::new(source));
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read fragment {:?}", path))
        .map_err(FragmentError::Open)?;
    let descriptor = FragmentDescriptor::parse(&text)
        .with_context(|| format!("parse fragment {:?}", path))
        .map_err(FragmentError::Invalid)?;

    let base: PathBuf = path.with_file_name(base_name);
    let inner = FileSource::open(&base).map_err(FragmentError::Open)?;
    let fragment = Fragment::new(Box::new(inner), &descriptor, index)
        .with_context(|| format!("fragment {:?}", path))
        .map_err(FragmentError::Invalid)?;

    tracing::debug!(
        path = %path.display(),
        start_ms = fragment.start().as_millis() as u64,
        end_ms = fragment.end().as_millis() as u64,
        "fragment opened"
    );
    Ok(Box::new(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::fixtures::{temp_dir, write_ramp_wav};
    use crate::format::{ChannelLayout, SampleFormat};
    use crate::source::testing::ScriptedSource;
    use crate::source::{Step, decode_step};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    /// One second of audio in ten 100 ms frames.
    fn base() -> Box<dyn Source> {
        Box::new(ScriptedSource::s16_stereo(8_000).frames(10, 800, 1).tag("track", "4"))
    }

    fn window(start: Option<u64>, end: Option<u64>) -> FragmentDescriptor {
        FragmentDescriptor {
            start: start.map(ms),
            end: end.map(ms),
            ..Default::default()
        }
    }

    fn frame_starts(source: &mut dyn Source) -> Vec<Duration> {
        let mut starts = Vec::new();
        while decode_step(source, |src| {
            starts.push(src.frame_start_time());
            Ok(())
        }) != Step::Finished
        {}
        starts
    }

    #[test]
    fn fragment_names_split_base_and_index() {
        assert_eq!(parse_fragment_name("song.flac.3.txt"), Some(("song.flac", 3)));
        assert_eq!(parse_fragment_name("a.1.2.TXT"), Some(("a.1", 2)));
        assert_eq!(parse_fragment_name("song.flac.txt"), None);
        assert_eq!(parse_fragment_name(".3.txt"), None);
        assert_eq!(parse_fragment_name("notes.txt"), None);
        assert_eq!(parse_fragment_name("song.flac"), None);
    }

    #[test]
    fn descriptor_parses_known_fields() {
        let d = FragmentDescriptor::parse("\n  start 1m30s\nend   2m\n\ntitle  Part two \n")
            .unwrap();
        assert_eq!(d.start, Some(Duration::from_secs(90)));
        assert_eq!(d.end, Some(Duration::from_secs(120)));
        assert_eq!(d.title.as_deref(), Some("Part two"));
        assert_eq!(d.artist, None);
    }

    #[test]
    fn descriptor_rejects_bad_input() {
        for bad in ["start -1s", "length 3s", "start", "end soon"] {
            assert!(FragmentDescriptor::parse(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn duration_is_window_length() {
        let fragment = Fragment::new(base(), &window(Some(200), Some(500)), 1).unwrap();
        assert_eq!(fragment.duration(), ms(300));
    }

    #[test]
    fn missing_bounds_default_to_file_extent() {
        let fragment = Fragment::new(base(), &window(None, None), 1).unwrap();
        assert_eq!(fragment.duration(), ms(1000));
        let clamped = Fragment::new(base(), &window(Some(600), Some(5000)), 1).unwrap();
        assert_eq!(clamped.duration(), ms(400));
    }

    #[test]
    fn empty_or_inverted_window_is_rejected() {
        assert!(Fragment::new(base(), &window(Some(500), Some(500)), 1).is_err());
        assert!(Fragment::new(base(), &window(Some(700), Some(300)), 1).is_err());
        assert!(Fragment::new(base(), &window(Some(2000), None), 1).is_err());
    }

    #[test]
    fn frames_stop_before_end() {
        let mut fragment = Fragment::new(base(), &window(Some(200), Some(500)), 1).unwrap();
        let starts = frame_starts(&mut fragment);
        assert_eq!(starts, vec![ms(200), ms(300), ms(400)]);
        assert!(starts.iter().all(|s| *s < fragment.end()));
        assert_eq!(fragment.receive_frame().unwrap(), ReceiveStatus::Eof);
    }

    #[test]
    fn seek_is_relative_to_start_and_clamped() {
        let scripted = ScriptedSource::s16_stereo(8_000).frames(10, 800, 1);
        let mut fragment = Fragment::new(Box::new(scripted), &window(Some(200), Some(600)), 1)
            .unwrap();
        fragment.seek_to(ms(100)).unwrap();
        assert_eq!(frame_starts(&mut fragment), vec![ms(300), ms(400), ms(500)]);
        fragment.seek_to(ms(10_000)).unwrap();
        assert!(frame_starts(&mut fragment).is_empty());
    }

    #[test]
    fn tags_extend_track_number_and_override_names() {
        let descriptor = FragmentDescriptor {
            title: Some("Intro".into()),
            ..window(None, Some(300))
        };
        let fragment = Fragment::new(base(), &descriptor, 2).unwrap();
        assert_eq!(fragment.tags()["track"], "4.2");
        assert_eq!(fragment.tags()["title"], "Intro");
    }

    #[test]
    fn open_source_routes_descriptors_to_fragments() {
        let dir = temp_dir("fragment");
        let info = StreamInfo::new(8_000, SampleFormat::S16, ChannelLayout::STEREO);
        write_ramp_wav(&dir.join("song.wav"), info, 16_000);
        std::fs::write(dir.join("song.wav.1.txt"), "start 500ms\nend 1500ms\n").unwrap();
        std::fs::write(dir.join("song.wav.2.txt"), "start 1s\nend 1s\n").unwrap();
        std::fs::write(dir.join("orphan.wav.1.txt"), "start 1s\n").unwrap();

        let plain = open_source(&dir.join("song.wav")).unwrap();
        assert_eq!(plain.duration(), Duration::from_secs(2));

        let fragment = open_source(&dir.join("song.wav.1.txt")).unwrap();
        assert_eq!(fragment.duration(), Duration::from_secs(1));
        assert_eq!(fragment.tags()["track"], "1");

        assert!(matches!(
            open_source(&dir.join("song.wav.2.txt")),
            Err(FragmentError::Invalid(_))
        ));
        assert!(matches!(
            open_source(&dir.join("orphan.wav.1.txt")),
            Err(FragmentError::Open(_))
        ));
        assert!(matches!(
            open_source(&dir.join("absent.wav")),
            Err(FragmentError::Open(_))
        ));

        std::fs::remove_dir_all(dir).ok();
    }
}
