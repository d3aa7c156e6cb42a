//! Media library paths, playlists and favorites.
//!
//! Library paths are `/`-separated and relative to the library root. They
//! reach the HTTP API as `at:<percent-escaped path>` identifiers.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::textcache::{Lines, TextCache};

/// Favorites playlist, relative to the storage directory.
const FAVORITES_FILE: &str = "favorites.m3u";

/// URL prefix of the library routes.
pub const PREFIX: &str = "/media";

pub struct Library {
    root: PathBuf,
    storage: PathBuf,
    playlists: TextCache,
}

impl Library {
    /// Open the library rooted at `root`, creating `storage` if needed.
    pub fn open(root: &Path, storage: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("resolve media dir {:?}", root))?;
        if !root.is_dir() {
            bail!("not a directory: {:?}", root);
        }
        std::fs::create_dir_all(storage)
            .with_context(|| format!("create storage dir {:?}", storage))?;

        Ok(Self {
            root,
            storage: storage.to_path_buf(),
            playlists: TextCache::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File system location of a library path, or `None` if it escapes the root.
    pub fn to_fs_path(&self, library_path: &str) -> Option<PathBuf> {
        let clean = clean_library_path(library_path)?;
        Some(clean.split('/').filter(|s| !s.is_empty()).fold(self.root.clone(), |p, s| p.join(s)))
    }

    /// File system location of a library path that names a regular file.
    pub fn track_path(&self, library_path: &str) -> Option<PathBuf> {
        self.to_fs_path(library_path).filter(|path| path.is_file())
    }

    fn favorites_path(&self) -> PathBuf {
        self.storage.join(FAVORITES_FILE)
    }

    /// Lines of the playlist file at `library_path`, plus the directory its
    /// entries are relative to.
    pub fn playlist(&self, library_path: &str) -> io::Result<(Lines, String)> {
        let fs_path = self
            .to_fs_path(library_path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "outside the library"))?;
        let lines = self.playlists.get(&fs_path)?;
        let clean = clean_library_path(library_path).unwrap_or_default();
        let dir = match clean.rsplit_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => String::new(),
        };
        Ok((lines, dir))
    }

    /// Favorites entries are library paths relative to the root.
    pub fn favorites(&self) -> io::Result<(Lines, String)> {
        match self.playlists.get(&self.favorites_path()) {
            Ok(lines) => Ok((lines, String::new())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok((Lines::default(), String::new())),
            Err(e) => Err(e),
        }
    }

    pub fn is_favorite(&self, library_path: &str) -> Result<bool> {
        let (favorites, _) = self.favorites().context("read favorites")?;
        Ok(favorites.iter().any(|line| line == library_path))
    }

    /// Add or remove a favorite. Repeating a request is a no-op.
    pub fn set_favorite(&self, library_path: &str, favorite: bool) -> Result<()> {
        self.playlists
            .create_or_modify(&self.favorites_path(), |lines| {
                let position = lines.iter().position(|line| line == library_path);
                Ok(match (favorite, position) {
                    (true, None) => {
                        let mut next = lines.to_vec();
                        next.push(library_path.to_string());
                        Some(next)
                    }
                    (false, Some(index)) => {
                        let mut next = lines.to_vec();
                        next.remove(index);
                        Some(next)
                    }
                    _ => None,
                })
            })
            .context("update favorites")
    }
}

/// Decode an `at:<escaped path>` identifier.
pub fn parse_at(id: &str) -> Option<String> {
    let escaped = id.strip_prefix("at:")?;
    urlencoding::decode(escaped).ok().map(|path| path.into_owned())
}

/// URL of the track resource for a library path.
pub fn track_url(library_path: &str) -> String {
    format!("{PREFIX}/tracks/at:{}", urlencoding::encode(library_path))
}

/// Resolve a playlist entry against the playlist's directory.
pub fn join_library_path(dir: &str, entry: &str) -> Option<String> {
    if entry.starts_with('/') {
        return clean_library_path(entry);
    }
    clean_library_path(&format!("{dir}/{entry}"))
}

/// Normalize `.` and `..` segments and strip leading and repeated slashes.
///
/// `None` if the path climbs above the root.
pub fn clean_library_path(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            part => parts.push(part),
        }
    }
    Some(parts.join("/"))
}
