//! Pluggable block compression.
//!
//! A [`Compressor`] wraps the raw block file handle on both the read and the
//! write side. Block hashes are always computed over the uncompressed chunk,
//! so a store must keep using the compressor it was written with.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::sync::Arc;

use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};

/// Writer that must be finalized before the underlying file is complete.
pub trait FinishWrite: Write + Send {
    /// Flush any trailing compressor state and hand back the file.
    fn finish(self: Box<Self>) -> io::Result<File>;
}

pub trait Compressor: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Wrap a block file opened for reading.
    fn reader(&self, file: File) -> io::Result<Box<dyn Read + Send>>;

    /// Wrap a block file opened for writing.
    fn writer(&self, file: File) -> io::Result<Box<dyn FinishWrite>>;
}

/// Identity compressor, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl FinishWrite for File {
    fn finish(self: Box<Self>) -> io::Result<File> {
        let mut file = *self;
        file.flush()?;
        Ok(file)
    }
}

impl Compressor for NoCompression {
    fn name(&self) -> &'static str {
        "none"
    }

    fn reader(&self, file: File) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(file))
    }

    fn writer(&self, file: File) -> io::Result<Box<dyn FinishWrite>> {
        Ok(Box::new(file))
    }
}

/// LZ4 frame-format compressor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compression;

impl FinishWrite for FrameEncoder<File> {
    fn finish(self: Box<Self>) -> io::Result<File> {
        let mut file = FrameEncoder::finish(*self).map_err(io::Error::other)?;
        file.flush()?;
        Ok(file)
    }
}

impl Compressor for Lz4Compression {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn reader(&self, file: File) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(FrameDecoder::new(file)))
    }

    fn writer(&self, file: File) -> io::Result<Box<dyn FinishWrite>> {
        Ok(Box::new(FrameEncoder::new(file)))
    }
}

/// Built-in compressor selection, as it appears in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Lz4,
}

impl Compression {
    pub fn compressor(self) -> Arc<dyn Compressor> {
        match self {
            Compression::None => Arc::new(NoCompression),
            Compression::Lz4 => Arc::new(Lz4Compression),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Lz4 => write!(f, "lz4"),
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            other => Err(format!("unknown compression: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_then_read(compressor: &dyn Compressor, data: &[u8]) -> (Vec<u8>, u64) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("block");

        let mut w = compressor.writer(File::create(&path).unwrap()).unwrap();
        w.write_all(data).unwrap();
        w.finish().unwrap();
        let on_disk = fs::metadata(&path).unwrap().len();

        let mut r = compressor.reader(File::open(&path).unwrap()).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        (out, on_disk)
    }

    #[test]
    fn test_no_compression_is_identity() {
        let data = b"plain block contents";
        let (out, on_disk) = write_then_read(&NoCompression, data);
        assert_eq!(out, data);
        assert_eq!(on_disk, data.len() as u64);
    }

    #[test]
    fn test_lz4_roundtrip_shrinks_repetitive_data() {
        let data = vec![b'z'; 16 * 1024];
        let (out, on_disk) = write_then_read(&Lz4Compression, &data);
        assert_eq!(out, data);
        assert!(on_disk < data.len() as u64);
    }

    #[test]
    fn test_compression_parsing() {
        assert_eq!("lz4".parse::<Compression>().unwrap(), Compression::Lz4);
        assert_eq!("NONE".parse::<Compression>().unwrap(), Compression::None);
        assert!("zstd".parse::<Compression>().is_err());
        assert_eq!(Compression::Lz4.compressor().name(), "lz4");
        assert_eq!(Compression::default().to_string(), "none");
    }
}
