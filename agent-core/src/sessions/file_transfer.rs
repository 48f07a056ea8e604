//! File transfer operations: streamed downloads, whole-or-appended uploads, and bounded
//! directory scans. Every path is canonicalized and checked against a declared root before
//! use, rejecting traversal outside it.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use super::manager::{CloseSink, OutputSink, SessionKind, SessionManager};

/// Errors from file transfer operations.
#[derive(Debug, Error)]
pub enum FileTransferError {
    /// The requested path resolves outside the declared root.
    #[error("path escapes the declared root")]
    PathTraversal,
    /// An I/O error occurred.
    #[error("file transfer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One chunk of a streamed file download.
#[derive(Debug, Serialize)]
pub struct FileChunk {
    /// Byte offset this chunk starts at.
    pub offset: u64,
    /// Total file size, in bytes.
    pub total: u64,
    /// Raw chunk bytes.
    pub chunk: Vec<u8>,
}

/// One progress update emitted while walking a directory tree.
#[derive(Debug, Serialize)]
pub struct ScanProgress {
    /// Number of entries visited so far.
    pub visited: u64,
    /// Path most recently visited, relative to the scan root.
    pub current_path: String,
}

/// A single entry returned by `scan_directory`'s final response.
#[derive(Debug, Serialize)]
pub struct FileEntry {
    /// Path relative to the scan root.
    pub path: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// File size in bytes; zero for directories.
    pub size: u64,
}

const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;
const DEFAULT_MAX_SCAN_DEPTH: usize = 32;
const SCAN_PROGRESS_INTERVAL: u64 = 500;

/// Drives file transfer operations, rooted at a declared directory that all paths are
/// canonicalized and checked against.
pub struct FileTransferHandler {
    sessions: SessionManager,
    root: PathBuf,
}

impl FileTransferHandler {
    /// Builds a handler rooted at `root`. All operations reject paths that canonicalize
    /// outside of it.
    pub fn new(sessions: SessionManager, root: PathBuf) -> Self {
        Self { sessions, root }
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, FileTransferError> {
        let joined = self.root.join(relative.trim_start_matches(['/', '\\']));
        let canonical = if joined.exists() {
            joined.canonicalize()?
        } else {
            // Allow a not-yet-existing upload target, but still validate against the root
            // using the canonicalized parent directory.
            let parent = joined
                .parent()
                .ok_or(FileTransferError::PathTraversal)?
                .canonicalize()?;
            parent.join(joined.file_name().ok_or(FileTransferError::PathTraversal)?)
        };
        let canonical_root = self.root.canonicalize()?;
        if !canonical.starts_with(&canonical_root) {
            return Err(FileTransferError::PathTraversal);
        }
        Ok(canonical)
    }

    /// Lists immediate children of a directory.
    pub fn list_files(&self, relative: &str) -> Result<Vec<FileEntry>, FileTransferError> {
        let dir = self.resolve(relative)?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            entries.push(FileEntry {
                path: entry.file_name().to_string_lossy().to_string(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }
        Ok(entries)
    }

    /// Streams a file's content back as `file_chunk` frames, registering a short-lived
    /// session so the transfer can be cancelled mid-flight.
    pub async fn download_file(
        &self,
        session_id: String,
        relative: &str,
        on_output: OutputSink,
        on_close: CloseSink,
    ) -> Result<(), FileTransferError> {
        let path = self.resolve(relative)?;
        let total = std::fs::metadata(&path)?.len();

        let handle = self
            .sessions
            .create(SessionKind::FileTransfer, session_id.clone(), on_output.clone(), on_close)
            .map_err(|_| FileTransferError::Io(std::io::Error::other("session create failed")))?;

        let sessions = self.sessions.clone();
        let cancel = handle.cancel.clone();

        tokio::task::spawn_blocking(move || -> Result<(), FileTransferError> {
            let mut file = std::fs::File::open(&path)?;
            let mut offset = 0u64;
            let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                let chunk = FileChunk {
                    offset,
                    total,
                    chunk: buf[..n].to_vec(),
                };
                if let Ok(bytes) = serde_json::to_vec(&chunk) {
                    on_output(bytes);
                }
                offset += n as u64;
            }
            Ok(())
        })
        .await
        .map_err(|e| FileTransferError::Io(std::io::Error::other(e.to_string())))??;

        self.sessions
            .close(&session_id)
            .map_err(|_| FileTransferError::Io(std::io::Error::other("session close failed")))?;
        Ok(())
    }

    /// Writes (or appends) content to a file.
    pub fn upload_file(&self, relative: &str, data: &[u8], append: bool) -> Result<(), FileTransferError> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        file.write_all(data)?;
        Ok(())
    }

    /// Walks a directory tree up to [`DEFAULT_MAX_SCAN_DEPTH`], emitting periodic
    /// `scan_progress` frames via `on_output` and returning the full entry list.
    pub fn scan_directory(
        &self,
        relative: &str,
        on_output: OutputSink,
    ) -> Result<Vec<FileEntry>, FileTransferError> {
        let root = self.resolve(relative)?;
        let mut entries = Vec::new();
        let mut visited = 0u64;

        let walker = ignore::WalkBuilder::new(&root)
            .max_depth(Some(DEFAULT_MAX_SCAN_DEPTH))
            .hidden(false)
            .build();

        for result in walker {
            let Ok(dir_entry) = result else { continue };
            let path = dir_entry.path();
            let Ok(relative_path) = path.strip_prefix(&root) else { continue };
            if relative_path.as_os_str().is_empty() {
                continue;
            }
            let metadata = dir_entry.metadata().map_err(|e| {
                FileTransferError::Io(std::io::Error::other(e.to_string()))
            })?;

            entries.push(FileEntry {
                path: relative_path.to_string_lossy().to_string(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });

            visited += 1;
            if visited % SCAN_PROGRESS_INTERVAL == 0 {
                let progress = ScanProgress {
                    visited,
                    current_path: relative_path.to_string_lossy().to_string(),
                };
                if let Ok(bytes) = serde_json::to_vec(&progress) {
                    on_output(bytes);
                }
            }
        }

        Ok(entries)
    }
}

/// Lists mounted drives/volumes. On Unix this is just the filesystem root; a richer,
/// platform-specific enumeration is out of scope here.
pub fn list_drives() -> Vec<String> {
    #[cfg(target_os = "windows")]
    {
        ('A'..='Z')
            .map(|c| format!("{c}:\\"))
            .filter(|p| Path::new(p).exists())
            .collect()
    }
    #[cfg(not(target_os = "windows"))]
    {
        vec!["/".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_traversal_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileTransferHandler::new(SessionManager::new(), dir.path().to_path_buf());
        let result = handler.resolve("../../etc/passwd");
        assert!(matches!(result, Err(FileTransferError::PathTraversal)));
    }

    #[test]
    fn upload_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileTransferHandler::new(SessionManager::new(), dir.path().to_path_buf());
        handler.upload_file("notes.txt", b"hello", false).unwrap();

        let entries = handler.list_files(".").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "notes.txt");
        assert_eq!(entries[0].size, 5);
    }

    #[test]
    fn upload_append_extends_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileTransferHandler::new(SessionManager::new(), dir.path().to_path_buf());
        handler.upload_file("log.txt", b"first", false).unwrap();
        handler.upload_file("log.txt", b"-second", true).unwrap();

        let content = std::fs::read_to_string(dir.path().join("log.txt")).unwrap();
        assert_eq!(content, "first-second");
    }
}
