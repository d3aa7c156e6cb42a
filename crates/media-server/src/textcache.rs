//! Thread-safe cache of line-oriented text files.
//!
//! Accessed files are mirrored fully in memory. A cached copy is trusted as
//! long as its recorded modification time is not older than the file's.

use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{Context, Result};

/// Lines of one cached file.
pub type Lines = Arc<Vec<String>>;

struct CachedFile {
    modified: SystemTime,
    lines: Lines,
}

#[derive(Default)]
pub struct TextCache {
    files: Mutex<HashMap<PathBuf, CachedFile>>,
}

impl TextCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lines of the file at `path`.
    ///
    /// I/O errors are returned unchanged so callers can test for
    /// [`io::ErrorKind::NotFound`].
    pub fn get(&self, path: &Path) -> io::Result<Lines> {
        let mut files = self.files.lock().unwrap();
        let meta = std::fs::metadata(path)?;
        load(&mut files, path, &meta)
    }

    /// Replace the file with `lines`, each terminated by `\n`.
    pub fn write(&self, path: &Path, lines: Vec<String>) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        store(&mut files, path, lines)
    }

    /// Rewrite an existing file with the lines returned by `modifier`.
    ///
    /// Returning `None` from `modifier` leaves the file untouched.
    pub fn modify<F>(&self, path: &Path, modifier: F) -> Result<()>
    where
        F: FnOnce(&[String]) -> Result<Option<Vec<String>>>,
    {
        let mut files = self.files.lock().unwrap();
        let meta = std::fs::metadata(path).with_context(|| format!("stat {:?}", path))?;
        let lines = load(&mut files, path, &meta).with_context(|| format!("read {:?}", path))?;
        match modifier(&lines)? {
            Some(lines) => store(&mut files, path, lines),
            None => Ok(()),
        }
    }

    /// Like [`TextCache::modify`], treating a missing file as empty.
    pub fn create_or_modify<F>(&self, path: &Path, modifier: F) -> Result<()>
    where
        F: FnOnce(&[String]) -> Result<Option<Vec<String>>>,
    {
        let mut files = self.files.lock().unwrap();
        let lines = match std::fs::metadata(path) {
            Ok(meta) => load(&mut files, path, &meta).with_context(|| format!("read {:?}", path))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Lines::default(),
            Err(e) => return Err(e).with_context(|| format!("stat {:?}", path)),
        };
        match modifier(&lines)? {
            Some(lines) => store(&mut files, path, lines),
            None => Ok(()),
        }
    }
}

fn load(
    files: &mut HashMap<PathBuf, CachedFile>,
    path: &Path,
    meta: &std::fs::Metadata,
) -> io::Result<Lines> {
    let modified = meta.modified()?;
    if let Some(cached) = files.get(path) {
        if cached.modified >= modified {
            return Ok(cached.lines.clone());
        }
    }
    if !meta.is_file() {
        return Err(io::Error::other("not a regular file"));
    }

    let text = std::fs::read_to_string(path)?;
    let lines: Lines = Arc::new(text.lines().map(str::to_string).collect());
    files.insert(
        path.to_path_buf(),
        CachedFile {
            modified,
            lines: lines.clone(),
        },
    );
    Ok(lines)
}

fn store(files: &mut HashMap<PathBuf, CachedFile>, path: &Path, lines: Vec<String>) -> Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("create {:?}", path))?;
    let mut writer = BufWriter::new(file);
    for line in &lines {
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .with_context(|| format!("write {:?}", path))?;
    }
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("flush {:?}", path))?;
    let modified = file
        .metadata()
        .and_then(|meta| meta.modified())
        .with_context(|| format!("stat {:?}", path))?;

    files.insert(
        path.to_path_buf(),
        CachedFile {
            modified,
            lines: Arc::new(lines),
        },
    );
    Ok(())
}
