//! Length-prefixed, header-tagged binary serialization.
//!
//! Every persistent object is introduced by an [`ObjectHeader`] carrying a
//! 16-byte type tag and a version. Primitive values are little-endian and
//! fixed width; strings and maps are count-prefixed. Writers and readers are
//! abstractions over either an in-memory buffer or a byte stream, so the
//! same code serializes to a wire payload or to the on-disk database file.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use super::{StoreError, StoreResult};

pub const OBJECT_TAG_SIZE: usize = 16;
pub const OBJECT_HEADER_SIZE: u64 = 48;

/// Fixed preamble of every serialized object.
///
/// The hash slot is reserved and currently written as zero; readers do not
/// interpret it. Tag and version are verified on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub hash: [u64; 2],
    pub tag: [u8; OBJECT_TAG_SIZE],
    pub version: u64,
    pub size: u64,
}

impl ObjectHeader {
    pub fn new(tag: &str, size: u64) -> Self {
        let mut tag_bytes = [0u8; OBJECT_TAG_SIZE];
        let len = tag.len().min(OBJECT_TAG_SIZE - 1);
        tag_bytes[..len].copy_from_slice(&tag.as_bytes()[..len]);

        Self {
            hash: [0, 0],
            tag: tag_bytes,
            version: 1,
            size,
        }
    }

    pub fn tag_str(&self) -> &str {
        let end = self
            .tag
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(OBJECT_TAG_SIZE);
        std::str::from_utf8(&self.tag[..end]).unwrap_or("")
    }
}

/// Destination for serialized bytes.
pub trait DataSink {
    fn write_bytes(&mut self, data: &[u8]) -> StoreResult<()>;
}

/// Source of serialized bytes.
pub trait DataSource {
    fn read_bytes(&mut self, out: &mut [u8]) -> StoreResult<()>;
}

/// Sink accumulating into memory. When constructed with an expected size,
/// `into_bytes` checks in debug builds that exactly that much was written.
pub struct BufferSink {
    buffer: Vec<u8>,
    expected: Option<u64>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            expected: None,
        }
    }

    pub fn with_expected_size(size: u64) -> Self {
        Self {
            buffer: Vec::with_capacity(size as usize),
            expected: Some(size),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        if let Some(expected) = self.expected {
            debug_assert_eq!(
                expected,
                self.buffer.len() as u64,
                "serialized size estimate did not match the bytes written"
            );
        }
        self.buffer
    }
}

impl Default for BufferSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSink for BufferSink {
    fn write_bytes(&mut self, data: &[u8]) -> StoreResult<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }
}

/// Source reading from a byte slice. `assert_drained` is the checked-build
/// post-condition that a reader consumed its input exactly.
pub struct BufferSource<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BufferSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn assert_drained(&self) {
        debug_assert_eq!(self.remaining(), 0, "serialized input not fully consumed");
    }
}

impl DataSource for BufferSource<'_> {
    fn read_bytes(&mut self, out: &mut [u8]) -> StoreResult<()> {
        if self.remaining() < out.len() {
            return Err(StoreError::DeserializationMismatch(format!(
                "input exhausted: wanted {} bytes, {} left",
                out.len(),
                self.remaining()
            )));
        }
        out.copy_from_slice(&self.data[self.position..self.position + out.len()]);
        self.position += out.len();
        Ok(())
    }
}

/// Sink forwarding to any byte stream, typically a buffered file.
pub struct StreamSink<W: Write> {
    inner: W,
}

impl<W: Write> StreamSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> DataSink for StreamSink<W> {
    fn write_bytes(&mut self, data: &[u8]) -> StoreResult<()> {
        self.inner.write_all(data)?;
        Ok(())
    }
}

/// Source reading from any byte stream.
pub struct StreamSource<R: Read> {
    inner: R,
}

impl<R: Read> StreamSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> DataSource for StreamSource<R> {
    fn read_bytes(&mut self, out: &mut [u8]) -> StoreResult<()> {
        self.inner.read_exact(out)?;
        Ok(())
    }
}

/// Typed writer over a [`DataSink`].
pub struct Insertor<'a> {
    sink: &'a mut dyn DataSink,
}

impl<'a> Insertor<'a> {
    pub fn new(sink: &'a mut dyn DataSink) -> Self {
        Self { sink }
    }

    pub fn put_bytes(&mut self, data: &[u8]) -> StoreResult<()> {
        self.sink.write_bytes(data)
    }

    pub fn put_u32(&mut self, value: u32) -> StoreResult<()> {
        self.sink.write_bytes(&value.to_le_bytes())
    }

    pub fn put_u64(&mut self, value: u64) -> StoreResult<()> {
        self.sink.write_bytes(&value.to_le_bytes())
    }

    pub fn put_header(&mut self, header: &ObjectHeader) -> StoreResult<()> {
        self.put_u64(header.hash[0])?;
        self.put_u64(header.hash[1])?;
        self.put_bytes(&header.tag)?;
        self.put_u64(header.version)?;
        self.put_u64(header.size)
    }

    pub fn put_string(&mut self, value: &str) -> StoreResult<()> {
        self.put_u64(value.len() as u64)?;
        self.put_bytes(value.as_bytes())
    }

    pub fn put_key_map(&mut self, map: &BTreeMap<u32, u32>) -> StoreResult<()> {
        self.put_u64(map.len() as u64)?;
        for (&key, &value) in map {
            self.put_u32(key)?;
            self.put_u32(value)?;
        }
        Ok(())
    }
}

/// Typed reader over a [`DataSource`].
pub struct Extractor<'a> {
    source: &'a mut dyn DataSource,
}

impl<'a> Extractor<'a> {
    pub fn new(source: &'a mut dyn DataSource) -> Self {
        Self { source }
    }

    pub fn get_bytes(&mut self, out: &mut [u8]) -> StoreResult<()> {
        self.source.read_bytes(out)
    }

    pub fn get_u32(&mut self) -> StoreResult<u32> {
        let mut raw = [0u8; 4];
        self.source.read_bytes(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn get_u64(&mut self) -> StoreResult<u64> {
        let mut raw = [0u8; 8];
        self.source.read_bytes(&mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn get_header(&mut self) -> StoreResult<ObjectHeader> {
        let mut header = ObjectHeader {
            hash: [0, 0],
            tag: [0; OBJECT_TAG_SIZE],
            version: 0,
            size: 0,
        };
        header.hash[0] = self.get_u64()?;
        header.hash[1] = self.get_u64()?;
        self.get_bytes(&mut header.tag)?;
        header.version = self.get_u64()?;
        header.size = self.get_u64()?;
        Ok(header)
    }

    /// Reads a header and fails with `DeserializationMismatch` unless the
    /// tag and version are the expected ones.
    pub fn expect_header(&mut self, tag: &str) -> StoreResult<ObjectHeader> {
        let header = self.get_header()?;
        if header.tag != ObjectHeader::new(tag, 0).tag {
            return Err(StoreError::DeserializationMismatch(format!(
                "expected object '{}', found '{}'",
                tag,
                header.tag_str()
            )));
        }
        if header.version != 1 {
            return Err(StoreError::DeserializationMismatch(format!(
                "unsupported version {} for object '{}'",
                header.version, tag
            )));
        }
        Ok(header)
    }

    pub fn get_string(&mut self) -> StoreResult<String> {
        let length = self.get_u64()? as usize;
        let mut raw = vec![0u8; length];
        self.source.read_bytes(&mut raw)?;
        String::from_utf8(raw)
            .map_err(|_| StoreError::DeserializationMismatch("string is not UTF-8".into()))
    }

    pub fn get_key_map(&mut self) -> StoreResult<BTreeMap<u32, u32>> {
        let count = self.get_u64()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = self.get_u32()?;
            let value = self.get_u32()?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

pub fn string_serialized_size(value: &str) -> u64 {
    std::mem::size_of::<u64>() as u64 + value.len() as u64
}

pub fn key_map_serialized_size(map: &BTreeMap<u32, u32>) -> u64 {
    std::mem::size_of::<u64>() as u64 + map.len() as u64 * 8
}
