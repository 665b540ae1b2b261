//! Zlib module
//!
//! Compression runs on the loop's worker pool; the result comes back as an
//! error-first event (`zlib.<mode>` or `zlib.<mode>.error`). The `*_sync`
//! variant is [`transform`].

use nodus_engine::{Event, LoopError, LoopHandle, Logger, Logging};
use nodus_sdk::{CallbackRef, ErrorValue, Value};

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::fmt;
use std::io::{self, Read, Write};

/// Level used when the caller passes none
pub const DEFAULT_LEVEL: u32 = 6;

/// Code attached to errors from corrupt or truncated input
pub const Z_DATA_ERROR: &str = "Z_DATA_ERROR";

// ============================================================================
// Modes
// ============================================================================

/// Stream format and direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZlibMode {
    /// gzip wrapper
    Gzip,
    /// Inverse of [`ZlibMode::Gzip`]
    Gunzip,
    /// zlib wrapper
    Deflate,
    /// Inverse of [`ZlibMode::Deflate`]
    Inflate,
    /// Raw deflate stream, no header
    DeflateRaw,
    /// Inverse of [`ZlibMode::DeflateRaw`]
    InflateRaw,
}

impl ZlibMode {
    /// Name used for the completion event
    pub fn name(self) -> &'static str {
        match self {
            ZlibMode::Gzip => "gzip",
            ZlibMode::Gunzip => "gunzip",
            ZlibMode::Deflate => "deflate",
            ZlibMode::Inflate => "inflate",
            ZlibMode::DeflateRaw => "deflateRaw",
            ZlibMode::InflateRaw => "inflateRaw",
        }
    }

    /// Whether this mode compresses
    pub fn is_compress(self) -> bool {
        matches!(
            self,
            ZlibMode::Gzip | ZlibMode::Deflate | ZlibMode::DeflateRaw
        )
    }
}

impl fmt::Display for ZlibMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Clamp a script-supplied level to 0-9; `None` or negative picks the default
pub fn level(requested: Option<i32>) -> Compression {
    match requested {
        Some(l) if l >= 0 => Compression::new(l.min(9) as u32),
        _ => Compression::new(DEFAULT_LEVEL),
    }
}

/// Run `mode` over `data` on the calling thread
pub fn transform(mode: ZlibMode, data: &[u8], requested_level: Option<i32>) -> io::Result<Vec<u8>> {
    let level = level(requested_level);
    match mode {
        ZlibMode::Gzip => encode(GzEncoder::new(Vec::new(), level), data),
        ZlibMode::Deflate => encode(ZlibEncoder::new(Vec::new(), level), data),
        ZlibMode::DeflateRaw => encode(DeflateEncoder::new(Vec::new(), level), data),
        ZlibMode::Gunzip => decode(GzDecoder::new(data)),
        ZlibMode::Inflate => decode(ZlibDecoder::new(data)),
        ZlibMode::InflateRaw => decode(DeflateDecoder::new(data)),
    }
}

trait Finish: Write {
    fn finish_into(self) -> io::Result<Vec<u8>>;
}

impl Finish for GzEncoder<Vec<u8>> {
    fn finish_into(self) -> io::Result<Vec<u8>> {
        self.finish()
    }
}

impl Finish for ZlibEncoder<Vec<u8>> {
    fn finish_into(self) -> io::Result<Vec<u8>> {
        self.finish()
    }
}

impl Finish for DeflateEncoder<Vec<u8>> {
    fn finish_into(self) -> io::Result<Vec<u8>> {
        self.finish()
    }
}

fn encode<E: Finish>(mut encoder: E, data: &[u8]) -> io::Result<Vec<u8>> {
    encoder.write_all(data)?;
    encoder.finish_into()
}

fn decode<D: Read>(mut decoder: D) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

// ============================================================================
// Async API
// ============================================================================

/// Zlib functions bound to one loop
#[derive(Clone)]
pub struct Zlib {
    handle: LoopHandle,
    log: Logger,
}

impl Zlib {
    /// Create the zlib functions for the loop behind `handle`
    pub fn new(handle: LoopHandle, logging: &Logging) -> Self {
        Self {
            handle,
            log: logging.get("zlib"),
        }
    }

    /// `zlib.gzip(data, level?, callback)`
    pub fn gzip(&self, data: Vec<u8>, level: Option<i32>, callback: CallbackRef) -> Result<(), LoopError> {
        self.process(ZlibMode::Gzip, data, level, callback)
    }

    /// `zlib.gunzip(data, callback)`
    pub fn gunzip(&self, data: Vec<u8>, callback: CallbackRef) -> Result<(), LoopError> {
        self.process(ZlibMode::Gunzip, data, None, callback)
    }

    /// `zlib.deflate(data, level?, callback)`
    pub fn deflate(&self, data: Vec<u8>, level: Option<i32>, callback: CallbackRef) -> Result<(), LoopError> {
        self.process(ZlibMode::Deflate, data, level, callback)
    }

    /// `zlib.inflate(data, callback)`
    pub fn inflate(&self, data: Vec<u8>, callback: CallbackRef) -> Result<(), LoopError> {
        self.process(ZlibMode::Inflate, data, None, callback)
    }

    /// `zlib.deflateRaw(data, level?, callback)`
    pub fn deflate_raw(&self, data: Vec<u8>, level: Option<i32>, callback: CallbackRef) -> Result<(), LoopError> {
        self.process(ZlibMode::DeflateRaw, data, level, callback)
    }

    /// `zlib.inflateRaw(data, callback)`
    pub fn inflate_raw(&self, data: Vec<u8>, callback: CallbackRef) -> Result<(), LoopError> {
        self.process(ZlibMode::InflateRaw, data, None, callback)
    }

    /// Transform `data` on the pool and post `callback(err, result)`
    pub fn process(
        &self,
        mode: ZlibMode,
        data: Vec<u8>,
        level: Option<i32>,
        callback: CallbackRef,
    ) -> Result<(), LoopError> {
        let handle = self.handle.clone();
        let log = self.log.clone();
        self.handle.submit(move || {
            let event = match transform(mode, &data, level) {
                Ok(out) => {
                    log.trace(format_args!("{} {} -> {} bytes", mode, data.len(), out.len()));
                    Event::new(format!("zlib.{}", mode), callback, vec![Value::Null, Value::Bytes(out)])
                }
                Err(e) => {
                    log.debug(format_args!("{} failed: {}", mode, e));
                    let error = ErrorValue::new(Z_DATA_ERROR, e.to_string()).with_syscall(mode.name());
                    Event::new(format!("zlib.{}.error", mode), callback, vec![Value::Error(error)])
                }
            };
            handle.post(event);
        })?;
        Ok(())
    }
}

impl fmt::Debug for Zlib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zlib").field("loop", &self.handle.instance()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_clamp() {
        assert_eq!(level(None).level(), 6);
        assert_eq!(level(Some(-1)).level(), 6);
        assert_eq!(level(Some(0)).level(), 0);
        assert_eq!(level(Some(42)).level(), 9);
    }

    #[test]
    fn test_gzip_header() {
        let out = transform(ZlibMode::Gzip, b"hello", None).unwrap();
        assert_eq!(&out[..2], &[0x1f, 0x8b]);
        assert_eq!(transform(ZlibMode::Gunzip, &out, None).unwrap(), b"hello");
    }

    #[test]
    fn test_raw_and_wrapped_deflate_differ() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let wrapped = transform(ZlibMode::Deflate, data, Some(9)).unwrap();
        let raw = transform(ZlibMode::DeflateRaw, data, Some(9)).unwrap();
        // zlib header + adler32 trailer
        assert_eq!(wrapped.len(), raw.len() + 6);
        assert_eq!(transform(ZlibMode::InflateRaw, &raw, None).unwrap(), data);
    }

    #[test]
    fn test_corrupt_input() {
        assert!(transform(ZlibMode::Gunzip, b"not gzip at all", None).is_err());
        assert!(ZlibMode::Gzip.is_compress());
        assert!(!ZlibMode::Inflate.is_compress());
    }
}
