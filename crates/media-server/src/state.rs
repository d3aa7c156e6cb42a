//! Shared application state.
//!
//! Holds the media library, the live player, and stream pacing options.

use std::sync::Arc;

use audio_pipeline::player::Player;
use audio_pipeline::transcode::StreamOptions;

use crate::library::Library;

pub struct AppState {
    pub library: Library,
    pub player: Arc<Player>,
    pub streaming: StreamOptions,
}

impl AppState {
    pub fn new(library: Library, player: Arc<Player>, streaming: StreamOptions) -> Self {
        Self {
            library,
            player,
            streaming,
        }
    }
}
