//! HTTP API handlers.
//!
//! Defines the Actix routes for the media library and the live player,
//! plus the plumbing that carries bytes from pipeline threads to responses.

pub mod player;
pub mod playlists;
pub mod tracks;

use std::io::{self, Write};

use actix_web::http::header;
use actix_web::web::Bytes;
use actix_web::{Error, HttpResponse};
use futures_util::stream::unfold;
use serde::Serialize;
use tokio::sync::mpsc;

pub use player::{player_rpc, player_stream};
pub use playlists::{playlist_info, playlist_track};
pub use tracks::{track_favorite, track_info, track_stream, track_unfavorite};

/// Encoded chunks queued between a pipeline thread and its response.
const BODY_CHUNKS: usize = 8;

const NO_STORE: &str = "no-cache, no-store";

/// JSON response that clients must not cache.
pub(crate) fn json_response<T: Serialize>(value: &T) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, NO_STORE))
        .json(value)
}

/// Blocking writer feeding a streaming response body.
///
/// Writes fail once the response is dropped, which is how a pipeline
/// thread learns that the client went away.
pub(crate) struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writer for a pipeline thread plus the matching response builder.
pub(crate) fn body_channel() -> (ChannelWriter, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(BODY_CHUNKS);
    (ChannelWriter { tx }, rx)
}

/// Stream an encoded body with the given content type.
pub(crate) fn audio_response(mime_type: &str, rx: mpsc::Receiver<Bytes>) -> HttpResponse {
    let stream = unfold(rx, |mut rx| async move {
        let bytes = rx.recv().await?;
        Some((Ok::<Bytes, Error>(bytes), rx))
    });
    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, mime_type))
        .insert_header((header::CACHE_CONTROL, NO_STORE))
        .streaming(stream)
}
