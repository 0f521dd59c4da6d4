//! File transfer helpers: base64 bodies and safe on-disk names

use crate::message::MAX_PAYLOAD_SIZE;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix given to every file written from an incoming transfer
pub const RECEIVED_PREFIX: &str = "received_";

/// Largest file that still fits in one payload once base64-encoded, leaving
/// room for the sender/filename header
pub const MAX_FILE_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64 / 4) * 3 - 4096;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Invalid file name: {0:?}")]
    InvalidName(String),
    #[error("Base64 decode failed: {0}")]
    Decode(String),
    #[error("File too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn encode_file(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_file(encoded: &str) -> Result<Vec<u8>, FileError> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| FileError::Decode(e.to_string()))
}

/// Local name for an incoming file.
///
/// Only the last path component of the sender's name is kept, so a transfer
/// can never write outside the download directory.
pub fn received_file_name(filename: &str) -> Result<String, FileError> {
    let base = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        return Err(FileError::InvalidName(filename.to_string()));
    }
    Ok(format!("{RECEIVED_PREFIX}{base}"))
}

/// Read a file to send. Returns its bare name and contents.
pub async fn read_outgoing(path: &Path) -> Result<(String, Vec<u8>), FileError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Err(FileError::NotFound(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(FileError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    if metadata.len() > MAX_FILE_SIZE {
        return Err(FileError::TooLarge {
            size: metadata.len(),
            max: MAX_FILE_SIZE,
        });
    }

    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| FileError::InvalidName(path.display().to_string()))?
        .to_string();
    let bytes = tokio::fs::read(path).await?;
    Ok((filename, bytes))
}

/// Decode an incoming transfer and write it as `received_<filename>` under
/// `dir`. Returns the written path and byte count.
pub async fn persist_received(
    dir: &Path,
    filename: &str,
    encoded: &str,
) -> Result<(PathBuf, usize), FileError> {
    let name = received_file_name(filename)?;
    let bytes = decode_file(encoded)?;
    tokio::fs::create_dir_all(dir).await?;
    let target = dir.join(name);
    tokio::fs::write(&target, &bytes).await?;
    Ok((target, bytes.len()))
}
