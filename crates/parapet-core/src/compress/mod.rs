//! Optional gzip compression applied before encryption.
//!
//! The codec decision is recorded in the one-byte flag carried at the front
//! of every sealed record; restore dispatches on that flag alone, never on a
//! heuristic.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;

use parapet_types::{ParapetError, Result};

/// Compressor format version recorded in the repository manifest.
pub const COMPRESS_FORMAT_VERSION: u32 = 1;

pub const FLAG_RAW: u8 = 0x00;
pub const FLAG_GZIP: u8 = 0x01;

const GZIP_LEVEL: u32 = 6;

/// Keep the compressed form only if it is at least this much smaller.
const MIN_SAVINGS_PERCENT: u64 = 5;

/// Maximum decompressed output (4x the largest chunk). Guards against
/// decompression bombs in corrupted or hostile records.
const MAX_DECOMPRESS_SIZE: u64 = 4 * 64 * 1024;

/// Extensions whose content is worth attempting to compress. Everything
/// already-compressed (media, archives) costs CPU for nothing.
const COMPRESSIBLE_EXTENSIONS: &[&str] = &[
    "txt", "md", "rst", "log", "csv", "tsv", "json", "xml", "html", "htm", "css", "js", "ts",
    "yaml", "yml", "toml", "ini", "conf", "svg", "c", "h", "cpp", "hpp", "rs", "py", "go", "java",
    "rb", "sh", "sql", "tex",
];

/// Whether a path's extension suggests compressible content.
/// No extension (or no path hint at all) means "try it".
pub fn is_compressible_hint(path: Option<&str>) -> bool {
    let Some(path) = path else { return true };
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit('.').next() {
        Some(ext) if ext.len() < name.len() => {
            COMPRESSIBLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        }
        _ => true,
    }
}

/// Compress a plaintext chunk if the hint allows and the savings clear the
/// threshold. Returns `(flag, payload)` ready for sealing.
pub fn compress(data: &[u8], try_compress: bool) -> Result<(u8, Vec<u8>)> {
    if !try_compress || data.is_empty() {
        return Ok((FLAG_RAW, data.to_vec()));
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), GzLevel::new(GZIP_LEVEL));
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;

    let threshold = data.len() as u64 * (100 - MIN_SAVINGS_PERCENT) / 100;
    if (compressed.len() as u64) <= threshold {
        Ok((FLAG_GZIP, compressed))
    } else {
        Ok((FLAG_RAW, data.to_vec()))
    }
}

/// Decompress a payload according to its record flag.
pub fn decompress(flag: u8, payload: &[u8]) -> Result<Vec<u8>> {
    match flag {
        FLAG_RAW => Ok(payload.to_vec()),
        FLAG_GZIP => {
            let mut decoder = GzDecoder::new(payload);
            let mut out = Vec::with_capacity(payload.len() * 2);
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut out)
                .map_err(|e| ParapetError::MalformedRecord(format!("gzip: {e}")))?;
            if out.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(ParapetError::MalformedRecord(format!(
                    "decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(out)
        }
        other => Err(ParapetError::MalformedRecord(format!(
            "unknown compression flag: {other:#04x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_text_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(100);
        let (flag, payload) = compress(&data, true).unwrap();
        assert_eq!(flag, FLAG_GZIP);
        assert!(payload.len() < data.len());
        assert_eq!(decompress(flag, &payload).unwrap(), data);
    }

    #[test]
    fn incompressible_data_stays_raw() {
        // xorshift output is incompressible; gzip would only add overhead.
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        let mut data = Vec::with_capacity(4096);
        while data.len() < 4096 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            data.extend_from_slice(&state.to_le_bytes());
        }
        let (flag, payload) = compress(&data, true).unwrap();
        assert_eq!(flag, FLAG_RAW);
        assert_eq!(payload, data);
    }

    #[test]
    fn hint_disables_compression() {
        let data = b"aaaa".repeat(1000);
        let (flag, _) = compress(&data, false).unwrap();
        assert_eq!(flag, FLAG_RAW);
    }

    #[test]
    fn empty_chunk_stays_raw() {
        let (flag, payload) = compress(b"", true).unwrap();
        assert_eq!(flag, FLAG_RAW);
        assert!(payload.is_empty());
    }

    #[test]
    fn extension_hints() {
        assert!(is_compressible_hint(Some("notes/readme.md")));
        assert!(is_compressible_hint(Some("src/main.rs")));
        assert!(is_compressible_hint(Some("data.JSON")));
        assert!(!is_compressible_hint(Some("photo.jpg")));
        assert!(!is_compressible_hint(Some("archive.zip")));
        // No extension and no hint both mean "try".
        assert!(is_compressible_hint(Some("Makefile")));
        assert!(is_compressible_hint(None));
    }

    #[test]
    fn unknown_flag_rejected() {
        let err = decompress(0x7f, b"data").unwrap_err();
        assert!(matches!(err, ParapetError::MalformedRecord(_)));
    }

    #[test]
    fn decompress_rejects_bomb() {
        // A 16 MiB run of zeros compresses to a few KiB but exceeds the
        // decompressed-size cap.
        let data = vec![0u8; 16 * 1024 * 1024];
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::new(GZIP_LEVEL));
        encoder.write_all(&data).unwrap();
        let bomb = encoder.finish().unwrap();
        assert!(decompress(FLAG_GZIP, &bomb).is_err());
    }
}
