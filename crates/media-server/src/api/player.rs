//! Live player endpoints: the shared WAV stream and transport control.

use std::io::Write;
use std::sync::Arc;

use actix_web::web::Bytes;
use actix_web::{Responder, get, post, web};
use anyhow::{Context, Result};
use audio_pipeline::encode::{Codec, Sink, SinkConfig, finish, new_sink};
use audio_pipeline::player::Player;
use audio_pipeline::silence::default_stream_info;
use serde::Deserialize;
use tokio::sync::oneshot;

use super::{ChannelWriter, audio_response, body_channel, json_response};
use crate::error::StreamError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    cmd: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RpcCommand {
    Next,
    Previous,
    Stop,
    TogglePause,
}

impl RpcCommand {
    fn parse(cmd: &str) -> Option<Self> {
        match cmd {
            "next" => Some(RpcCommand::Next),
            "previous" => Some(RpcCommand::Previous),
            "stop" => Some(RpcCommand::Stop),
            "togglePause" => Some(RpcCommand::TogglePause),
            _ => None,
        }
    }

    fn apply(self, player: &Player) -> Result<()> {
        match self {
            RpcCommand::Next => player.next(),
            RpcCommand::Previous => player.previous(),
            RpcCommand::Stop => player.stop(),
            RpcCommand::TogglePause => player.toggle_pause(),
        }
    }
}

#[post("/player/rpc")]
/// Transport control for the live player.
pub async fn player_rpc(state: web::Data<AppState>, body: Bytes) -> impl Responder {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return StreamError::bad_request(format!("malformed request: {e}")).into_response(),
    };
    let Some(command) = RpcCommand::parse(&request.cmd) else {
        return StreamError::bad_request(format!("unknown command: {}", request.cmd))
            .into_response();
    };

    let player = state.player.clone();
    match web::block(move || command.apply(&player)).await {
        Ok(Ok(())) => {
            tracing::info!(cmd = %request.cmd, "player command");
            json_response(&serde_json::json!({}))
        }
        Ok(Err(e)) => StreamError::internal("player command failed", &e).into_response(),
        Err(e) => StreamError::Internal(format!("player command task failed: {e}")).into_response(),
    }
}

fn write_buffer(sink: &mut dyn Sink, out: &mut ChannelWriter) -> std::io::Result<()> {
    let len = sink.buffer().len();
    if len > 0 {
        out.write_all(sink.buffer())?;
        sink.drain(len);
    }
    Ok(())
}

/// Listener thread body: register an output, then encode its frames until
/// the client goes away.
fn run_listener(player: Arc<Player>, mut out: ChannelWriter, ready: oneshot::Sender<Result<()>>) {
    let setup = || -> Result<_> {
        let config = SinkConfig::for_stream(Codec::Wav, default_stream_info());
        let sink = new_sink(&config).context("failed to create sink")?;
        let (id, frames) = player
            .add_output(sink.stream_info(), sink.frame_size())
            .context("failed to add player output")?;
        Ok((sink, id, frames))
    };
    let (mut sink, id, frames) = match setup() {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        let _ = player.remove_output(id);
        return;
    }
    tracing::info!(output = %id, "listener connected");

    for frame in frames.iter() {
        if let Err(e) = sink.encode(frame) {
            tracing::error!(error = %format!("{e:#}"), "failed to encode frame");
            break;
        }
        if let Err(e) = write_buffer(sink.as_mut(), &mut out) {
            tracing::debug!(error = %e, "failed to write buffer");
            break;
        }
    }

    if let Err(e) = player.remove_output(id) {
        tracing::debug!(output = %id, error = %format!("{e:#}"), "output already gone");
    }
    if let Err(e) = finish(sink.as_mut()) {
        tracing::error!(error = %format!("{e:#}"), "failed to flush sink");
    }
    if let Err(e) = write_buffer(sink.as_mut(), &mut out) {
        tracing::debug!(error = %e, "failed to write buffer");
    }
    tracing::info!(output = %id, "listener disconnected");
}

#[get("/player/stream")]
/// Stream the live player as WAV until the client disconnects.
pub async fn player_stream(state: web::Data<AppState>) -> impl Responder {
    let player = state.player.clone();
    let (writer, body) = body_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name("listener".to_string())
        .spawn(move || run_listener(player, writer, ready_tx));
    if let Err(e) = spawned {
        return StreamError::Internal(format!("failed to spawn listener thread: {e}"))
            .into_response();
    }

    match ready_rx.await {
        Ok(Ok(())) => audio_response(Codec::Wav.mime_type(), body),
        Ok(Err(e)) => StreamError::internal("failed to start listener", &e).into_response(),
        Err(_) => StreamError::Internal("listener thread exited during setup".to_string())
            .into_response(),
    }
}
