//! Wire encoding and byte compression.
//!
//! Requests and responses travel as postcard-encoded envelopes; large or
//! repetitive payloads (environment variables, captured stdout/stderr,
//! uploaded files) are additionally gzip compressed so the server can hold
//! them without keeping the expanded form in memory.

use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Environment variables as captured from `std::env::vars`, wrapped in a
/// struct so the encoding stays schema-stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvBlock {
    pub environ: Vec<String>,
}

/// Encode a value into the typed binary wire format.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(postcard::to_stdvec(value)?)
}

/// Decode a value from the typed binary wire format.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Gzip compress raw bytes.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Reverse of [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Encode then compress a set of "key=value" environment strings, producing
/// the blob stored on jobs at add time and decoded again before execution.
pub fn compress_env(envars: &[String]) -> Result<Vec<u8>> {
    let encoded = encode(&EnvBlock {
        environ: envars.to_vec(),
    })?;
    compress(&encoded)
}

/// Decompress and decode an environment blob back to its "key=value"
/// strings.
pub fn decompress_env(blob: &[u8]) -> Result<Vec<String>> {
    let decoded: EnvBlock = decode(&decompress(blob)?)?;
    Ok(decoded.environ)
}

/// Read a file and compress its contents, for shipping small files to the
/// server.
pub fn compress_file(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path)?;
    compress(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let squashed = compress(&data).unwrap();
        assert!(squashed.len() < data.len());
        assert_eq!(decompress(&squashed).unwrap(), data);
    }

    #[test]
    fn env_block_round_trips() {
        let envars = vec![
            "PATH=/usr/bin:/bin".to_string(),
            "HOME=/home/someone".to_string(),
            "EMPTY=".to_string(),
        ];
        let blob = compress_env(&envars).unwrap();
        assert_eq!(decompress_env(&blob).unwrap(), envars);
    }

    #[test]
    fn encode_decode_round_trips() {
        let block = EnvBlock {
            environ: vec!["A=1".to_string()],
        };
        let bytes = encode(&block).unwrap();
        let back: EnvBlock = decode(&bytes).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn compress_file_matches_inline_compression() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, b"file contents here").unwrap();
        let from_file = compress_file(&path).unwrap();
        assert_eq!(decompress(&from_file).unwrap(), b"file contents here");
    }

    #[test]
    fn compress_file_missing_path_errors() {
        let err = compress_file(Path::new("/no/such/file")).unwrap_err();
        assert!(err.to_string().contains("I/O"));
    }
}
