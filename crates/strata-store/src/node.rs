//! Node file codec.
//!
//! A node file is the ordered list of block hashes of one value, each hash
//! followed by a `\n` separator. Both directions are streaming: [`NodeReader`]
//! produces the file bytes into buffers of any size, and [`NodeWriter`]
//! accepts the file bytes split at arbitrary points.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::hash::{is_encoded_hash, ENCODED_HASH_LEN};

/// Separating byte between block hashes
pub const HASH_SEPARATOR: u8 = b'\n';

/// Malformed node file contents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid node: {0}")]
pub struct InvalidNode(pub String);

fn invalid(detail: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, InvalidNode(detail.into()))
}

/// Check whether an `io::Error` came from the node decoder.
pub fn is_invalid_node(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<InvalidNode>())
}

/// Contents of a node file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub hashes: Vec<String>,
}

impl Node {
    pub fn new(hashes: Vec<String>) -> Self {
        Self { hashes }
    }

    /// Decode a complete node file.
    pub fn decode(reader: impl Read) -> io::Result<Node> {
        let mut node = Node::default();
        node.decode_from(reader)?;
        Ok(node)
    }

    /// Append hashes decoded from `reader`.
    ///
    /// On error the hashes decoded before the malformed segment are kept.
    pub fn decode_from(&mut self, mut reader: impl Read) -> io::Result<()> {
        let mut writer = NodeWriter::new(self);
        io::copy(&mut reader, &mut writer)?;
        writer.finish()
    }

    /// Encode into `w`, returning the number of bytes written.
    pub fn encode_to(&self, mut w: impl Write) -> io::Result<u64> {
        io::copy(&mut self.reader(), &mut w)
    }

    pub fn reader(&self) -> NodeReader<'_> {
        NodeReader::new(&self.hashes)
    }

    /// Drop every occurrence of `hash`, returning whether any was present.
    pub fn remove_hash(&mut self, hash: &str) -> bool {
        let before = self.hashes.len();
        self.hashes.retain(|h| h != hash);
        self.hashes.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Size of the encoded node file.
    pub fn encoded_len(&self) -> usize {
        self.hashes.len() * (ENCODED_HASH_LEN + 1)
    }
}

/// `io::Read` over the encoded form of a hash list.
pub struct NodeReader<'a> {
    hashes: &'a [String],
    idx: usize,
    pos: usize,
    sep_pending: bool,
}

impl<'a> NodeReader<'a> {
    pub fn new(hashes: &'a [String]) -> Self {
        Self {
            hashes,
            idx: 0,
            pos: 0,
            sep_pending: false,
        }
    }
}

impl Read for NodeReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            // Separator owed from a hash that filled the previous buffer
            if self.sep_pending {
                buf[n] = HASH_SEPARATOR;
                n += 1;
                self.sep_pending = false;
                self.idx += 1;
                self.pos = 0;
                continue;
            }

            let Some(hash) = self.hashes.get(self.idx) else {
                break;
            };
            let rest = &hash.as_bytes()[self.pos..];
            let m = rest.len().min(buf.len() - n);
            buf[n..n + m].copy_from_slice(&rest[..m]);
            n += m;
            self.pos += m;
            if self.pos == hash.len() {
                self.sep_pending = true;
            }
        }
        Ok(n)
    }
}

/// `io::Write` sink decoding node file bytes into a [`Node`].
pub struct NodeWriter<'a> {
    node: &'a mut Node,
    seg: [u8; ENCODED_HASH_LEN],
    len: usize,
}

impl<'a> NodeWriter<'a> {
    pub fn new(node: &'a mut Node) -> Self {
        Self {
            node,
            seg: [0u8; ENCODED_HASH_LEN],
            len: 0,
        }
    }

    /// Fail if input ended in the middle of a hash.
    pub fn finish(self) -> io::Result<()> {
        if self.len != 0 {
            return Err(invalid(format!(
                "trailing segment of {} bytes without separator",
                self.len
            )));
        }
        Ok(())
    }

    fn push_partial(&mut self, bytes: &[u8]) -> io::Result<()> {
        let end = self.len + bytes.len();
        if end > ENCODED_HASH_LEN {
            return Err(invalid(format!(
                "segment exceeds {} bytes",
                ENCODED_HASH_LEN
            )));
        }
        self.seg[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    fn commit(&mut self) -> io::Result<()> {
        if self.len != ENCODED_HASH_LEN {
            return Err(invalid(format!(
                "segment of {} bytes, expected {}",
                self.len, ENCODED_HASH_LEN
            )));
        }
        let hash = std::str::from_utf8(&self.seg)
            .ok()
            .filter(|s| is_encoded_hash(s))
            .ok_or_else(|| invalid("segment is not an encoded hash"))?;
        self.node.hashes.push(hash.to_string());
        self.len = 0;
        Ok(())
    }
}

impl Write for NodeWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while let Some(idx) = rest.iter().position(|&b| b == HASH_SEPARATOR) {
            self.push_partial(&rest[..idx])?;
            self.commit()?;
            rest = &rest[idx + 1..];
        }
        self.push_partial(rest)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
