//! Live player.
//!
//! A single background thread decodes the current playlist entry in real
//! time and distributes converted frames to any number of outputs, each
//! reading from its own bounded channel. With nothing queued the player
//! keeps producing silence so listeners stay connected.
//!
//! All control goes through [`Player`], which forwards [`Command`]s to the
//! thread and blocks until each one has been applied.

mod playlist;
mod worker;

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender};

use crate::format::{Frame, StreamInfo};

pub use playlist::{FilePlaylist, Playlist};
use worker::{PlayerOutput, Worker};

/// Tuning knobs for the player thread.
#[derive(Clone, Copy, Debug)]
pub struct PlayerConfig {
    /// Frames buffered per output before new frames are dropped.
    pub output_buffer_frames: usize,
    /// Commands that may be queued before callers block.
    pub command_capacity: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            output_buffer_frames: 32,
            command_capacity: 256,
        }
    }
}

/// Handle identifying a registered output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputId(u64);

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Requests understood by the player thread.
pub(crate) enum Command {
    AddOutput(PlayerOutput),
    RemoveOutput(OutputId),
    Play(Box<dyn Playlist>),
    Stop,
    Next,
    Previous,
    TogglePause,
    Shutdown,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::AddOutput(_) => "add_output",
            Command::RemoveOutput(_) => "remove_output",
            Command::Play(_) => "play",
            Command::Stop => "stop",
            Command::Next => "next",
            Command::Previous => "previous",
            Command::TogglePause => "toggle_pause",
            Command::Shutdown => "shutdown",
        }
    }
}

/// A command plus the channel its result is reported on.
pub(crate) struct Envelope {
    command: Command,
    reply: Sender<Result<()>>,
}

struct RunningWorker {
    commands: Sender<Envelope>,
    thread: JoinHandle<()>,
}

enum EngineState {
    /// No thread yet; outputs wait here until the first `play`.
    Idle { outputs: Vec<PlayerOutput> },
    Running(RunningWorker),
}

/// Shared handle to the live player.
///
/// Safe to use from any number of threads. The background thread starts
/// with the first [`Player::play`] and stops on [`Player::shutdown`] or drop.
pub struct Player {
    config: PlayerConfig,
    next_output: AtomicU64,
    state: Mutex<EngineState>,
}

impl Player {
    pub fn new(config: PlayerConfig) -> Self {
        Self {
            config,
            next_output: AtomicU64::new(1),
            state: Mutex::new(EngineState::Idle {
                outputs: Vec::new(),
            }),
        }
    }

    /// Register an output receiving frames of `frame_size` samples in `info`.
    ///
    /// Frames arrive on the returned channel in real time. When the reader
    /// falls behind by more than [`PlayerConfig::output_buffer_frames`],
    /// new frames are dropped. The channel disconnects once the output is
    /// removed or the player shuts down.
    pub fn add_output(&self, info: StreamInfo, frame_size: usize) -> Result<(OutputId, Receiver<Frame>)> {
        let id = OutputId(self.next_output.fetch_add(1, Ordering::Relaxed));
        let (output, frames) =
            PlayerOutput::new(id, info, frame_size, self.config.output_buffer_frames)?;

        let commands = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                EngineState::Idle { outputs } => {
                    outputs.push(output);
                    tracing::debug!(output = %id, %info, "output added");
                    return Ok((id, frames));
                }
                EngineState::Running(worker) => worker.commands.clone(),
            }
        };
        request(&commands, Command::AddOutput(output))?;
        tracing::debug!(output = %id, %info, "output added");
        Ok((id, frames))
    }

    /// Unregister an output and release everything it still buffers.
    pub fn remove_output(&self, id: OutputId) -> Result<()> {
        let commands = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                EngineState::Idle { outputs } => {
                    let index = outputs
                        .iter()
                        .position(|output| output.id == id)
                        .ok_or_else(|| anyhow!("output {id} does not exist"))?;
                    outputs.remove(index);
                    return Ok(());
                }
                EngineState::Running(worker) => worker.commands.clone(),
            }
        };
        request(&commands, Command::RemoveOutput(id))
    }

    /// Replace the current playlist and start from its next entry.
    ///
    /// Starts the background thread if needed.
    pub fn play(&self, playlist: Box<dyn Playlist>) -> Result<()> {
        let commands = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                EngineState::Running(worker) => worker.commands.clone(),
                EngineState::Idle { outputs } => {
                    let worker = self.spawn(std::mem::take(outputs))?;
                    let commands = worker.commands.clone();
                    *state = EngineState::Running(worker);
                    commands
                }
            }
        };
        request(&commands, Command::Play(playlist))
    }

    /// Drop the playlist; outputs receive silence.
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    pub fn next(&self) -> Result<()> {
        self.send(Command::Next)
    }

    pub fn previous(&self) -> Result<()> {
        self.send(Command::Previous)
    }

    /// Pause or resume. While paused no frames are produced.
    pub fn toggle_pause(&self) -> Result<()> {
        self.send(Command::TogglePause)
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), EngineState::Running(_))
    }

    /// Stop the background thread and release every output.
    ///
    /// The player returns to its idle state and may be started again.
    pub fn shutdown(&self) -> Result<()> {
        let worker = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(
                &mut *state,
                EngineState::Idle {
                    outputs: Vec::new(),
                },
            ) {
                EngineState::Running(worker) => worker,
                idle @ EngineState::Idle { .. } => {
                    *state = idle;
                    return Ok(());
                }
            }
        };

        let result = request(&worker.commands, Command::Shutdown);
        drop(worker.commands);
        if worker.thread.join().is_err() {
            return Err(anyhow!("player thread panicked"));
        }
        tracing::info!("player stopped");
        result
    }

    fn spawn(&self, outputs: Vec<PlayerOutput>) -> Result<RunningWorker> {
        let (commands, inbox) = crossbeam_channel::bounded(self.config.command_capacity.max(1));
        let worker = Worker::new(inbox, outputs);
        let thread = std::thread::Builder::new()
            .name("player".to_string())
            .spawn(move || worker.run())
            .context("failed to spawn player thread")?;
        tracing::info!("player started");
        Ok(RunningWorker { commands, thread })
    }

    fn send(&self, command: Command) -> Result<()> {
        let commands = match &*self.state.lock().unwrap() {
            EngineState::Running(worker) => worker.commands.clone(),
            EngineState::Idle { .. } => return Err(anyhow!("player is not running")),
        };
        request(&commands, command)
    }
}

impl Default for Player {
    fn default() -> Self {
        Self::new(PlayerConfig::default())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %format!("{e:#}"), "player shutdown failed");
        }
    }
}

/// Queue `command` and wait for the player thread to apply it.
fn request(commands: &Sender<Envelope>, command: Command) -> Result<()> {
    let (reply, result) = crossbeam_channel::bounded(1);
    commands
        .send(Envelope { command, reply })
        .map_err(|_| anyhow!("player thread has stopped"))?;
    result
        .recv()
        .map_err(|_| anyhow!("player thread dropped the request"))?
}
