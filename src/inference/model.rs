//! Model file validation
//!
//! Cheap checks on a GGUF file before handing it to the engine, so a wrong
//! path or a truncated download fails with a readable error instead of deep
//! inside llama.cpp.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
const HEADER_LEN: usize = 24;
const MIN_VERSION: u32 = 2;
const MAX_VERSION: u32 = 3;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Not a regular file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("File is too short to be a GGUF model")]
    Truncated,

    #[error("Bad magic {0:?}, expected GGUF")]
    BadMagic([u8; 4]),

    #[error("Unsupported GGUF version {0}")]
    UnsupportedVersion(u32),
}

/// Fixed-size GGUF header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Checks that `path` is a GGUF file this runtime can load
pub fn validate_gguf(path: &Path) -> Result<GgufHeader, ModelError> {
    if !path.exists() {
        return Err(ModelError::NotFound(path.to_path_buf()));
    }
    if !path.is_file() {
        return Err(ModelError::NotAFile(path.to_path_buf()));
    }

    let mut header = [0u8; HEADER_LEN];
    let mut file = File::open(path)?;
    file.read_exact(&mut header).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ModelError::Truncated,
        _ => ModelError::Io(e),
    })?;

    parse_header(&header)
}

fn parse_header(bytes: &[u8; HEADER_LEN]) -> Result<GgufHeader, ModelError> {
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[0..4]);
    if &magic != GGUF_MAGIC {
        return Err(ModelError::BadMagic(magic));
    }

    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[8..16]);
    let tensor_count = u64::from_le_bytes(word);
    word.copy_from_slice(&bytes[16..24]);
    let metadata_kv_count = u64::from_le_bytes(word);

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

/// Header bytes for a GGUF v3 file; used by tests to fake model files
#[cfg(test)]
pub fn gguf_header_bytes(tensor_count: u64, metadata_kv_count: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(GGUF_MAGIC);
    out.extend_from_slice(&3u32.to_le_bytes());
    out.extend_from_slice(&tensor_count.to_le_bytes());
    out.extend_from_slice(&metadata_kv_count.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_valid_header() {
        let file = write_file(&gguf_header_bytes(291, 24));
        let header = validate_gguf(file.path()).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 291);
        assert_eq!(header.metadata_kv_count, 24);
    }

    #[test]
    fn test_missing_file() {
        let err = validate_gguf(Path::new("/definitely/not/here.gguf")).unwrap_err();
        assert!(matches!(err, ModelError::NotFound(_)));
    }

    #[test]
    fn test_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_gguf(dir.path()).unwrap_err();
        assert!(matches!(err, ModelError::NotAFile(_)));
    }

    #[test]
    fn test_truncated_file() {
        let file = write_file(b"GGUF\x03\x00");
        assert!(matches!(
            validate_gguf(file.path()).unwrap_err(),
            ModelError::Truncated
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = gguf_header_bytes(1, 1);
        bytes[0..4].copy_from_slice(b"GGML");
        let file = write_file(&bytes);
        assert!(matches!(
            validate_gguf(file.path()).unwrap_err(),
            ModelError::BadMagic(_)
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = gguf_header_bytes(1, 1);
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        let file = write_file(&bytes);
        assert!(matches!(
            validate_gguf(file.path()).unwrap_err(),
            ModelError::UnsupportedVersion(1)
        ));
    }
}
