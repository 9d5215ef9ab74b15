//! Compression pipeline for stored blobs.
//!
//! The method is fixed when the store is built and applied uniformly to every
//! entry; blobs carry no per-entry method tag, so decode dispatch follows the
//! configured method rather than inspecting the data.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unsupported compression method: {0:?}")]
    Unsupported(String),

    #[error("Zstd codec failed: {0}")]
    Zstd(#[source] std::io::Error),

    #[error("Lz4 codec failed: {0}")]
    Lz4(#[source] std::io::Error),
}

/// Supported compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = CodecError;

    /// Case-insensitive. The empty string is the legacy default and maps to lz4.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            "none" => Ok(Compression::None),
            other => Err(CodecError::Unsupported(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
enum Method {
    Known(Compression),
    Unsupported(String),
}

/// Encodes and decodes blobs with the store's configured method.
#[derive(Debug, Clone)]
pub struct Codec {
    method: Method,
    zstd_level: i32,
}

impl Codec {
    /// Build a codec from a configured method name.
    ///
    /// An unrecognized name does not fail construction: every encode then
    /// fails, so writes are rejected instead of silently stored uncompressed.
    pub fn new(name: &str, zstd_level: i32) -> Self {
        let method = match name.parse::<Compression>() {
            Ok(compression) => Method::Known(compression),
            Err(_) => {
                tracing::warn!(method = name, "Unknown compression method, writes will be rejected");
                Method::Unsupported(name.to_string())
            }
        };
        Self { method, zstd_level }
    }

    pub fn with_compression(compression: Compression, zstd_level: i32) -> Self {
        Self {
            method: Method::Known(compression),
            zstd_level,
        }
    }

    /// The configured algorithm, or `None` when the name was not recognized.
    pub fn compression(&self) -> Option<Compression> {
        match self.method {
            Method::Known(compression) => Some(compression),
            Method::Unsupported(_) => None,
        }
    }

    pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        match &self.method {
            Method::Known(Compression::None) => Ok(plaintext.to_vec()),
            Method::Known(Compression::Lz4) => lz4_compress(plaintext),
            Method::Known(Compression::Zstd) => {
                zstd::encode_all(plaintext, self.zstd_level).map_err(CodecError::Zstd)
            }
            Method::Unsupported(name) => Err(CodecError::Unsupported(name.clone())),
        }
    }

    pub fn decode(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        match &self.method {
            Method::Known(Compression::None) => Ok(ciphertext.to_vec()),
            Method::Known(Compression::Lz4) => lz4_decompress(ciphertext),
            Method::Known(Compression::Zstd) => {
                zstd::decode_all(ciphertext).map_err(CodecError::Zstd)
            }
            Method::Unsupported(name) => Err(CodecError::Unsupported(name.clone())),
        }
    }
}

fn lz4_compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = FrameEncoder::new(Vec::with_capacity(data.len() / 2 + 16));
    encoder
        .write_all(data)
        .map_err(CodecError::Lz4)?;
    encoder
        .finish()
        .map_err(|e| CodecError::Lz4(std::io::Error::other(e)))
}

fn lz4_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = FrameDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out).map_err(CodecError::Lz4)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_methods() {
        let payload = b"GET /index.html HTTP/1.1 cached body ".repeat(64);
        for compression in [Compression::None, Compression::Lz4, Compression::Zstd] {
            let codec = Codec::with_compression(compression, 3);
            let encoded = codec.encode(&payload).unwrap();
            assert_eq!(codec.decode(&encoded).unwrap(), payload, "{compression}");
        }
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        for compression in [Compression::None, Compression::Lz4, Compression::Zstd] {
            let codec = Codec::with_compression(compression, 3);
            let encoded = codec.encode(&[]).unwrap();
            assert!(codec.decode(&encoded).unwrap().is_empty());
        }
    }

    #[test]
    fn test_compressed_is_smaller() {
        let data = vec![42u8; 4096];
        for compression in [Compression::Lz4, Compression::Zstd] {
            let encoded = Codec::with_compression(compression, 3).encode(&data).unwrap();
            assert!(encoded.len() < data.len());
        }
    }

    #[test]
    fn test_method_names() {
        assert_eq!("".parse::<Compression>().unwrap(), Compression::Lz4);
        assert_eq!("LZ4".parse::<Compression>().unwrap(), Compression::Lz4);
        assert_eq!("Zstd".parse::<Compression>().unwrap(), Compression::Zstd);
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert!("brotli".parse::<Compression>().is_err());
    }

    #[test]
    fn test_unsupported_method_rejects_writes() {
        let codec = Codec::new("brotli", 3);
        assert!(codec.compression().is_none());
        assert!(matches!(codec.encode(b"data"), Err(CodecError::Unsupported(_))));
        assert!(codec.decode(b"data").is_err());
    }

    #[test]
    fn test_corrupt_input_fails_decode() {
        let codec = Codec::with_compression(Compression::Zstd, 3);
        assert!(codec.decode(b"definitely not zstd").is_err());
        let codec = Codec::with_compression(Compression::Lz4, 3);
        assert!(codec.decode(b"definitely not lz4").is_err());
    }
}
