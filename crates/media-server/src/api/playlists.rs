//! Playlist endpoints: library `.m3u` files and the favorites list.

use std::io;

use actix_web::{HttpResponse, Responder, get, web};
use serde::Serialize;

use super::json_response;
use crate::error::StreamError;
use crate::library::{Library, clean_library_path, join_library_path, parse_at, track_url};
use crate::state::AppState;
use crate::textcache::Lines;

const FAVORITES: &str = "favorites";

#[derive(Debug, Serialize)]
pub struct PlaylistInfo {
    pub length: usize,
}

#[derive(Debug, Serialize)]
pub struct PlaylistEntry {
    pub pos: usize,
    pub path: String,
}

/// Lines of the playlist named by `id` and the directory its entries are relative to.
fn load(library: &Library, id: &str) -> Result<(Lines, String), StreamError> {
    let loaded = if id == FAVORITES {
        library.favorites()
    } else {
        let path = parse_at(id)
            .and_then(|path| clean_library_path(&path))
            .ok_or_else(|| StreamError::NotFound(format!("no such playlist: {id}")))?;
        library.playlist(&path)
    };
    loaded.map_err(|e: io::Error| StreamError::NotFound(format!("failed to load playlist {id}: {e}")))
}

#[get("/media/playlists/{playlist}")]
/// Number of entries in a playlist.
pub async fn playlist_info(
    state: web::Data<AppState>,
    playlist: web::Path<String>,
) -> impl Responder {
    match load(&state.library, &playlist) {
        Ok((lines, _)) => json_response(&PlaylistInfo {
            length: lines.len(),
        }),
        Err(err) => err.into_response(),
    }
}

#[get("/media/playlists/{playlist}/tracks/{pos}")]
/// One playlist entry, or `null` when `pos` is not a valid position.
pub async fn playlist_track(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (playlist, pos) = path.into_inner();
    let (lines, dir) = match load(&state.library, &playlist) {
        Ok(loaded) => loaded,
        Err(err) => return err.into_response(),
    };
    entry_response(&lines, &dir, &pos)
}

fn entry_response(lines: &[String], dir: &str, pos: &str) -> HttpResponse {
    let entry = pos
        .parse::<usize>()
        .ok()
        .and_then(|pos| Some((pos, lines.get(pos)?)))
        .and_then(|(pos, line)| {
            let path = join_library_path(dir, line)?;
            Some(PlaylistEntry {
                pos,
                path: track_url(&path),
            })
        });
    if entry.is_none() {
        tracing::debug!(pos, length = lines.len(), "playlist position out of range");
    }
    json_response(&entry)
}
