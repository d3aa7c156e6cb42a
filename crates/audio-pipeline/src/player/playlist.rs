//! Ordered track lists consumed by the player.

use std::path::PathBuf;

use crate::fragment::open_source;
use crate::source::Source;

/// Cursor over a sequence of playable sources.
pub trait Playlist: Send {
    /// Advance and open the next playable entry.
    ///
    /// Entries that fail to open are skipped. `None` once the end is reached.
    fn next(&mut self) -> Option<Box<dyn Source>>;

    /// Step back and open the previous playable entry.
    fn previous(&mut self) -> Option<Box<dyn Source>>;
}

/// Playlist of file paths, opened lazily as the cursor reaches them.
///
/// Fragment descriptors are accepted as entries. The cursor starts before
/// the first entry and never wraps.
pub struct FilePlaylist {
    paths: Vec<PathBuf>,
    index: Option<usize>,
}

impl FilePlaylist {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths, index: None }
    }

    /// Position of the entry most recently opened.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn open(&self, index: usize) -> Option<Box<dyn Source>> {
        let path = &self.paths[index];
        match open_source(path) {
            Ok(source) => {
                tracing::info!(path = %path.display(), "playing");
                Some(source)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping playlist entry");
                None
            }
        }
    }
}

impl Playlist for FilePlaylist {
    fn next(&mut self) -> Option<Box<dyn Source>> {
        loop {
            let next = self.index.map_or(0, |i| i + 1);
            if next >= self.paths.len() {
                return None;
            }
            self.index = Some(next);
            if let Some(source) = self.open(next) {
                return Some(source);
            }
        }
    }

    fn previous(&mut self) -> Option<Box<dyn Source>> {
        loop {
            let prev = self.index.filter(|i| *i > 0)? - 1;
            self.index = Some(prev);
            if let Some(source) = self.open(prev) {
                return Some(source);
            }
        }
    }
}
