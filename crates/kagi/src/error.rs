use std::path::PathBuf;

use aes::cipher::block_padding::UnpadError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KagiError {
    #[error("Key info file must have at least 2 lines: URI and local key path")]
    MalformedKeyInfo,

    #[error("Key URI and key file are required (--key-info or --key-uri/--key-file)")]
    MissingKeyMaterial,

    #[error("Failed to read key material from {path}: {source}")]
    KeyFileUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Key file {path} is {len} bytes, expected 16")]
    InvalidKeyLength { path: PathBuf, len: usize },

    #[error("IV hex must be 16 bytes (32 hex chars), got {0}")]
    InvalidIv(String),

    #[error("Source directory does not exist: {0}")]
    SourceDirMissing(PathBuf),

    #[error("Destination directory {path} is not writable: {source}")]
    DestinationNotWritable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid segment pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Invalid m3u8 file: {0}")]
    M3u8ParseError(String),

    #[error("Master playlist is not supported: {0}")]
    MasterPlaylist(String),

    #[error("Playlist references a segment outside the source directory: {0}")]
    ForeignSegment(String),

    #[error("Playlist references a file that is not a known segment: {0}")]
    UnknownSegment(String),

    #[error("Byte range segments can not be encrypted separately: {0}")]
    ByteRangeUnsupported(String),

    #[error("Source file changed while reading: {0}")]
    SourceChanged(PathBuf),

    #[error("Pkcs7 unpad error")]
    UnpadError(#[from] UnpadError),

    #[error("Failed to watch source directory: {0}")]
    WatchError(#[from] notify::Error),

    #[error("Worker task failed: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    HexDecodeError(#[from] hex::FromHexError),
}

/// How the pipeline reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Abort at startup, never retried.
    Fatal,
    /// Scoped to one file. Logged, and the file is tried again later.
    Transient,
    /// The manifest revision can not be published as is. It is skipped.
    Structural,
}

impl KagiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KagiError::MalformedKeyInfo
            | KagiError::MissingKeyMaterial
            | KagiError::KeyFileUnreadable { .. }
            | KagiError::InvalidKeyLength { .. }
            | KagiError::InvalidIv(_)
            | KagiError::HexDecodeError(_)
            | KagiError::SourceDirMissing(_)
            | KagiError::DestinationNotWritable { .. }
            | KagiError::InvalidPattern(_)
            | KagiError::WatchError(_) => ErrorClass::Fatal,

            KagiError::M3u8ParseError(_)
            | KagiError::MasterPlaylist(_)
            | KagiError::ForeignSegment(_)
            | KagiError::UnknownSegment(_)
            | KagiError::ByteRangeUnsupported(_) => ErrorClass::Structural,

            KagiError::SourceChanged(_)
            | KagiError::UnpadError(_)
            | KagiError::JoinError(_)
            | KagiError::IOError(_) => ErrorClass::Transient,
        }
    }
}

pub type KagiResult<T> = Result<T, KagiError>;
