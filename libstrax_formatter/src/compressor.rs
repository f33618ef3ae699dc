use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use super::error::CompressionError;

/// Whole-file compression applied to each chunk file.
///
/// The names match the compressor names understood by strax. `None` writes the
/// concatenated fragments as they are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compressor {
    None,
    #[default]
    Lz4,
    Zstd,
}

impl Compressor {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    /// Compress a complete file payload
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => {
                let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            Self::Zstd => Ok(zstd::bulk::compress(data, zstd::DEFAULT_COMPRESSION_LEVEL)?),
        }
    }

    /// Inverse of compress, used when reading chunk files back
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => {
                let mut decoded = Vec::new();
                lz4_flex::frame::FrameDecoder::new(data).read_to_end(&mut decoded)?;
                Ok(decoded)
            }
            Self::Zstd => Ok(zstd::stream::decode_all(data)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressors_restore_payload() {
        let payload: Vec<u8> = (0..4096u32).flat_map(|v| (v % 17).to_le_bytes()).collect();
        for compressor in [Compressor::None, Compressor::Lz4, Compressor::Zstd] {
            let packed = compressor.compress(&payload).unwrap();
            assert_eq!(compressor.decompress(&packed).unwrap(), payload, "{}", compressor.name());
        }
    }

    #[test]
    fn test_lz4_shrinks_repetitive_data() {
        let payload = vec![0u8; 10_000];
        let packed = Compressor::Lz4.compress(&payload).unwrap();
        assert!(packed.len() < payload.len());
    }

    #[test]
    fn test_empty_payload() {
        for compressor in [Compressor::None, Compressor::Lz4, Compressor::Zstd] {
            let packed = compressor.compress(&[]).unwrap();
            assert!(compressor.decompress(&packed).unwrap().is_empty());
        }
    }
}
