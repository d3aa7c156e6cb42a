//! Player thread: decodes the current source in real time and fans frames
//! out to every registered output.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};

use super::playlist::Playlist;
use super::{Command, Envelope, OutputId};
use crate::fifo::Fifo;
use crate::format::{Frame, StreamInfo};
use crate::replaygain::ReplayGainMode;
use crate::resample::Resampler;
use crate::silence::SilenceSource;
use crate::source::{Source, Step, decode_step};

/// Sleep only when the decoder is at least this far ahead of the clock.
const MIN_SLEEP: Duration = Duration::from_millis(1);

/// One registered output: a conversion stage feeding a bounded frame channel.
///
/// Dropping the output tears it down in order: resampler, fifo, then the
/// channel, whose leftover frames are drained and released.
pub(crate) struct PlayerOutput {
    pub(super) id: OutputId,
    info: StreamInfo,
    frame_size: usize,
    resampler: Resampler,
    fifo: Fifo,
    frames: Option<Sender<Frame>>,
    /// Kept so undelivered frames can be released on removal.
    backlog: Receiver<Frame>,
    dropped: u64,
}

impl PlayerOutput {
    pub(super) fn new(
        id: OutputId,
        info: StreamInfo,
        frame_size: usize,
        capacity: usize,
    ) -> Result<(Self, Receiver<Frame>)> {
        if frame_size == 0 {
            bail!("output frame size must be positive");
        }
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let output = Self {
            id,
            info,
            frame_size,
            resampler: Resampler::new(),
            fifo: Fifo::new(info),
            frames: Some(tx),
            backlog: rx.clone(),
            dropped: 0,
        };
        Ok((output, rx))
    }

    /// Point the conversion stage at a new source.
    ///
    /// Samples still buffered from the previous source stay in the fifo and
    /// lead the next output frame.
    fn configure(&mut self, source: &dyn Source) -> Result<()> {
        let volume = source.replay_gain(ReplayGainMode::Track, true);
        self.resampler.setup(source.stream_info(), self.info, volume)
    }

    /// Convert the pending frame and offer every complete output frame.
    fn push(&mut self, source: &dyn Source) -> Result<()> {
        source.resample_frame(&mut self.resampler, &mut self.fifo)?;
        self.emit()
    }

    /// Drain the resampler at the end of a source.
    ///
    /// A sub-frame remainder is left in the fifo for the next source.
    fn finish_source(&mut self) -> Result<()> {
        if self.resampler.is_configured() {
            self.resampler.flush(&mut self.fifo)?;
        }
        self.emit()
    }

    /// Offer every complete frame in the fifo.
    ///
    /// Frames that do not fit in the channel are dropped so a slow reader
    /// never stalls the player.
    fn emit(&mut self) -> Result<()> {
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| anyhow!("output {} is closed", self.id))?;
        while self.fifo.size() >= self.frame_size {
            let frame = self.fifo.read_frame(self.frame_size)?;
            match frames.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.dropped += 1,
                Err(TrySendError::Disconnected(_)) => bail!("output {} disconnected", self.id),
            }
        }
        Ok(())
    }
}

impl Drop for PlayerOutput {
    fn drop(&mut self) {
        self.resampler = Resampler::new();
        self.fifo.clear();
        self.frames = None;
        let released = self.backlog.try_iter().count();
        tracing::debug!(
            output = %self.id,
            dropped = self.dropped,
            released,
            "output removed"
        );
    }
}

/// Wall-clock pacing for decoded audio.
///
/// Finished tracks are folded into `total` so the schedule stays continuous
/// across track changes.
struct Clock {
    started: Instant,
    total: Duration,
    track_samples: u64,
    track_rate: u32,
}

impl Clock {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            total: Duration::ZERO,
            track_samples: 0,
            track_rate: 0,
        }
    }

    fn track_time(&self) -> Duration {
        if self.track_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.track_samples as u128 * 1_000_000_000 / self.track_rate as u128;
        Duration::from_nanos(nanos as u64)
    }

    fn start_track(&mut self, rate: u32) {
        self.total += self.track_time();
        self.track_samples = 0;
        self.track_rate = rate;
    }

    fn end_track(&mut self) {
        self.start_track(0);
    }

    /// Time to wait before the decoded audio is due.
    fn lead(&self) -> Option<Duration> {
        (self.total + self.track_time())
            .checked_sub(self.started.elapsed())
            .filter(|lead| *lead > MIN_SLEEP)
    }

    /// Push the schedule back by time spent paused.
    fn resume(&mut self, paused_for: Duration) {
        self.started += paused_for;
    }
}

pub(super) struct Worker {
    commands: Receiver<Envelope>,
    outputs: Vec<PlayerOutput>,
    playlist: Option<Box<dyn Playlist>>,
    source: Option<Box<dyn Source>>,
    clock: Clock,
    paused_at: Option<Instant>,
}

/// Outcome of one command.
enum Flow {
    Continue,
    Shutdown(Sender<Result<()>>),
}

impl Worker {
    pub(super) fn new(commands: Receiver<Envelope>, outputs: Vec<PlayerOutput>) -> Self {
        Self {
            commands,
            outputs,
            playlist: None,
            source: None,
            clock: Clock::new(),
            paused_at: None,
        }
    }

    pub(super) fn run(mut self) {
        tracing::debug!(outputs = self.outputs.len(), "player thread started");
        let reply = self.main_loop();

        // Outputs first, then the source.
        self.outputs.clear();
        self.source = None;
        self.playlist = None;
        tracing::debug!("player thread stopped");
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }
    }

    /// Returns the reply channel of the shutdown request, if there was one.
    fn main_loop(&mut self) -> Option<Sender<Result<()>>> {
        loop {
            loop {
                match self.commands.try_recv() {
                    Ok(envelope) => {
                        if let Flow::Shutdown(reply) = self.handle(envelope) {
                            return Some(reply);
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return None,
                }
            }

            if self.paused_at.is_some() {
                match self.commands.recv() {
                    Ok(envelope) => {
                        if let Flow::Shutdown(reply) = self.handle(envelope) {
                            return Some(reply);
                        }
                    }
                    Err(_) => return None,
                }
                continue;
            }

            if self.source.is_none() {
                let next = self.playlist.as_mut().and_then(|playlist| playlist.next());
                self.set_source(next);
                if self.source.is_none() {
                    self.playlist = None;
                    self.set_source(Some(Box::new(SilenceSource::new())));
                }
            }

            let Some(source) = self.source.as_deref_mut() else {
                continue;
            };
            let outputs = &mut self.outputs;
            let clock = &mut self.clock;
            let step = decode_step(source, |source| {
                clock.track_samples += source.frame_size() as u64;
                fan_out(outputs, source);
                Ok(())
            });
            match step {
                Step::Decoded => {}
                Step::Retry => continue,
                Step::Finished => self.destroy_source(),
            }

            if let Some(lead) = self.clock.lead() {
                std::thread::sleep(lead);
            }
        }
    }

    fn handle(&mut self, envelope: Envelope) -> Flow {
        let Envelope { command, reply } = envelope;
        tracing::debug!(command = command.name(), "player command");
        let result = match command {
            Command::AddOutput(output) => self.add_output(output),
            Command::RemoveOutput(id) => self.remove_output(id),
            Command::Play(playlist) => {
                self.playlist = Some(playlist);
                self.destroy_source();
                Ok(())
            }
            Command::Stop => {
                self.playlist = None;
                self.destroy_source();
                Ok(())
            }
            Command::Next => {
                if self.playlist.is_some() {
                    self.destroy_source();
                }
                Ok(())
            }
            Command::Previous => {
                if let Some(playlist) = self.playlist.as_mut() {
                    let previous = playlist.previous();
                    self.set_source(previous);
                }
                Ok(())
            }
            Command::TogglePause => {
                match self.paused_at.take() {
                    Some(since) => self.clock.resume(since.elapsed()),
                    None => self.paused_at = Some(Instant::now()),
                }
                Ok(())
            }
            Command::Shutdown => return Flow::Shutdown(reply),
        };
        let _ = reply.send(result);
        Flow::Continue
    }

    fn add_output(&mut self, mut output: PlayerOutput) -> Result<()> {
        if let Some(source) = self.source.as_deref() {
            output.configure(source)?;
        }
        self.outputs.push(output);
        Ok(())
    }

    fn remove_output(&mut self, id: OutputId) -> Result<()> {
        let index = self
            .outputs
            .iter()
            .position(|output| output.id == id)
            .ok_or_else(|| anyhow!("output {id} does not exist"))?;
        self.outputs.remove(index);
        Ok(())
    }

    fn set_source(&mut self, source: Option<Box<dyn Source>>) {
        self.destroy_source();
        let Some(source) = source else {
            return;
        };
        self.clock.start_track(source.stream_info().sample_rate);
        self.outputs.retain_mut(|output| match output.configure(source.as_ref()) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(output = %output.id, error = %format!("{e:#}"), "failed to configure output");
                false
            }
        });
        self.source = Some(source);
    }

    fn destroy_source(&mut self) {
        if self.source.take().is_none() {
            return;
        }
        self.clock.end_track();
        self.outputs.retain_mut(|output| match output.finish_source() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(output = %output.id, error = %format!("{e:#}"), "failed to flush output");
                false
            }
        });
    }
}

fn fan_out(outputs: &mut Vec<PlayerOutput>, source: &dyn Source) {
    outputs.retain_mut(|output| match output.push(source) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(output = %output.id, error = %format!("{e:#}"), "failed to feed output");
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ChannelLayout, SampleFormat};
    use crate::source::testing::ScriptedSource;

    #[test]
    fn finishing_a_source_drains_the_rate_converter() {
        let info = StreamInfo::new(48_000, SampleFormat::S16, ChannelLayout::STEREO);
        let (mut output, frames) = PlayerOutput::new(OutputId(1), info, 100, 64).unwrap();
        let mut source = ScriptedSource::s16_stereo(44_100).frames(1, 441, 100);
        output.configure(&source).unwrap();

        let step = decode_step(&mut source, |source| output.push(source));
        assert_eq!(step, Step::Decoded);
        let before = frames.len() * 100 + output.fifo.size();
        assert!(before < 480);

        output.finish_source().unwrap();
        let after = frames.len() * 100 + output.fifo.size();
        assert!((470..=480).contains(&after), "emitted {after} samples");
        assert!(output.fifo.size() < 100);
    }

    #[test]
    fn clock_carries_finished_tracks_forward() {
        let mut clock = Clock::new();
        clock.start_track(8_000);
        clock.track_samples = 4_000;
        assert_eq!(clock.track_time(), Duration::from_millis(500));

        clock.start_track(44_100);
        assert_eq!(clock.total, Duration::from_millis(500));
        assert_eq!(clock.track_time(), Duration::ZERO);

        clock.track_samples = 44_100;
        clock.end_track();
        assert_eq!(clock.total, Duration::from_millis(1_500));
        assert_eq!(clock.track_rate, 0);
    }

    #[test]
    fn clock_waits_only_when_ahead() {
        let mut clock = Clock::new();
        assert_eq!(clock.lead(), None);

        clock.start_track(1_000);
        clock.track_samples = 60_000;
        let lead = clock.lead().unwrap();
        assert!(lead > Duration::from_secs(59) && lead <= Duration::from_secs(60));

        clock.resume(Duration::ZERO);
        clock.end_track();
        clock.total = Duration::ZERO;
        clock.start_track(1_000);
        clock.track_samples = 1;
        assert_eq!(clock.lead(), None);
    }
}
