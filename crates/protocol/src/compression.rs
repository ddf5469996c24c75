//! zstd helpers for large snapshot bodies

use thiserror::Error;

/// Bodies below this size are sent uncompressed
pub const COMPRESSION_THRESHOLD: usize = 1024;

const COMPRESSION_LEVEL: i32 = 3;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
}

/// Compress data using zstd if above threshold
pub fn compress_if_needed(data: &[u8]) -> Result<(Vec<u8>, bool), CompressionError> {
    if data.len() < COMPRESSION_THRESHOLD {
        return Ok((data.to_vec(), false));
    }

    zstd::encode_all(data, COMPRESSION_LEVEL)
        .map(|compressed| (compressed, true))
        .map_err(|e| CompressionError::CompressionFailed(e.to_string()))
}

/// Decompress, refusing output larger than `max_size`
pub fn decompress_with_limit(data: &[u8], max_size: usize) -> Result<Vec<u8>, CompressionError> {
    use std::io::Read;

    let decoder = zstd::Decoder::new(data)
        .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;

    let mut result = Vec::new();
    decoder
        .take(max_size as u64 + 1)
        .read_to_end(&mut result)
        .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;

    if result.len() > max_size {
        return Err(CompressionError::DecompressionFailed(format!(
            "Decompressed size exceeds limit of {} bytes",
            max_size
        )));
    }

    Ok(result)
}
