//! Content fingerprinting and ebook format detection.
//!
//! A fingerprint is the pair (SHA-1 hex, byte size); two files with equal
//! fingerprints are treated as the same content everywhere in the pipeline,
//! matching the dedup key the target service uses.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

const HASH_CHUNK_BYTES: usize = 64 * 1024;
const MAGIC_PROBE_BYTES: usize = 512;
const MOBI_MAGIC_OFFSET: usize = 0x3c;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Identity of a file's contents: lowercase SHA-1 hex plus byte length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: String,
    pub size: u64,
}

impl Fingerprint {
    pub fn new(hash: impl Into<String>, size: u64) -> Self {
        let hash = hash.into();
        debug_assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        Self { hash, size }
    }

    /// Stable string form used as a JSON map key in progress files.
    pub fn key(&self) -> String {
        format!("{}:{}", self.hash, self.size)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.size)
    }
}

impl FromStr for Fingerprint {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hash, size) = s.rsplit_once(':').ok_or(())?;
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(());
        }
        let size = size.parse::<u64>().map_err(|_| ())?;
        Ok(Self {
            hash: hash.to_ascii_lowercase(),
            size,
        })
    }
}

/// Ebook container formats the pipeline recognizes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Epub,
    Mobi,
    Pdf,
    Fb2,
    Azw3,
    Cbz,
    Cbr,
    Djvu,
    Lit,
    Unknown,
}

impl FileFormat {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "epub" => Some(Self::Epub),
            "mobi" => Some(Self::Mobi),
            "pdf" => Some(Self::Pdf),
            "fb2" => Some(Self::Fb2),
            "azw3" => Some(Self::Azw3),
            "cbz" => Some(Self::Cbz),
            "cbr" => Some(Self::Cbr),
            "djvu" => Some(Self::Djvu),
            "lit" => Some(Self::Lit),
            _ => None,
        }
    }
}

/// Compute the streaming SHA-1 and size of a file. Never returns a partial
/// fingerprint: any read error surfaces as [`FingerprintError::Io`].
pub fn fingerprint(path: &Path) -> Result<Fingerprint, FingerprintError> {
    let io_err = |source| FingerprintError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];
    let mut size = 0u64;

    loop {
        let read = file.read(&mut buf).map_err(io_err)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        size += read as u64;
    }

    let hash = format!("{:x}", hasher.finalize());
    Ok(Fingerprint { hash, size })
}

/// Async wrapper: hashing a 500 MiB file must not block the reactor.
pub async fn fingerprint_file(path: &Path) -> Result<Fingerprint, FingerprintError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || fingerprint(&owned))
        .await
        .unwrap_or_else(|join_err| {
            Err(FingerprintError::Io {
                path: path.to_path_buf(),
                source: io::Error::other(join_err),
            })
        })
}

/// Identify the ebook format of a file: extension first (case-insensitive),
/// then magic bytes from the first 512 bytes. Unrecognized files report
/// [`FileFormat::Unknown`]; detection never fails the pipeline.
pub fn detect_format(path: &Path) -> FileFormat {
    if let Some(format) = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(FileFormat::from_extension)
    {
        return format;
    }

    let mut header = [0u8; MAGIC_PROBE_BYTES];
    let read = match File::open(path).and_then(|mut f| f.read(&mut header)) {
        Ok(read) => read,
        Err(_) => return FileFormat::Unknown,
    };

    detect_format_from_magic(&header[..read])
}

fn detect_format_from_magic(header: &[u8]) -> FileFormat {
    if header.len() >= MOBI_MAGIC_OFFSET + 8 && &header[MOBI_MAGIC_OFFSET..MOBI_MAGIC_OFFSET + 8] == b"BOOKMOBI" {
        return FileFormat::Mobi;
    }
    if header.starts_with(b"%PDF") {
        return FileFormat::Pdf;
    }
    if header.starts_with(b"Rar!\x1a\x07") {
        return FileFormat::Cbr;
    }
    if header.starts_with(b"PK\x03\x04") {
        // Bare ZIP without a telling extension; epub is the dominant case.
        return FileFormat::Epub;
    }
    if header.starts_with(b"<?xml") || header.starts_with(b"<FictionBook") {
        if contains_subslice(header, b"<FictionBook") {
            return FileFormat::Fb2;
        }
    }
    FileFormat::Unknown
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
